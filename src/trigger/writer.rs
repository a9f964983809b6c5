//! Window writers and the parallel per-probe writer pool.
//!
//! Each active stream has one [`StreamWriter`] that tracks its current segment
//! and the part of its window still to be written. The [`WriterPool`] spreads
//! probe writers over worker threads, two probes per thread, and runs one
//! synchronized fetch-and-write cycle across all of them per trigger tick; the
//! auxiliary card, if present, is written on the dispatching thread meanwhile.

use crate::data::sample_queue::SampleQueue;
use crate::data::storage::{SegmentInfo, SegmentKey, SegmentStorage, SegmentSummary, SegmentWriter};
use crate::data::subset::extract_channels;
use crate::error::{AppResult, DaqError};
use crate::stream::{StreamId, StreamRegistry};
use crate::sync::WorkerSync;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Probes handled by one writer thread.
pub const PROBES_PER_WORKER: usize = 2;

/// Where a stream's window starts and how much of it to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStart {
    /// Counter the window starts at.
    pub first_ct: u64,
    /// `None` writes until told otherwise.
    pub remaining: Option<u64>,
}

/// Progress of one stream through its current segment.
pub struct StreamWriter {
    queue: Arc<SampleQueue>,
    saved: Vec<usize>,
    saves_all: bool,
    segment: Option<Box<dyn SegmentWriter>>,
    next_ct: u64,
    remaining: Option<u64>,
    bytes: u64,
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("stream", &self.id())
            .field("open", &self.segment.is_some())
            .field("next_ct", &self.next_ct)
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl StreamWriter {
    /// Writer for `queue`, with nothing open.
    pub fn new(queue: Arc<SampleQueue>) -> Self {
        let spec = queue.spec();
        Self {
            saved: spec.saved_channels(),
            saves_all: spec.saves_all(),
            queue,
            segment: None,
            next_ct: 0,
            remaining: None,
            bytes: 0,
        }
    }

    /// Stream being written.
    pub fn id(&self) -> StreamId {
        self.queue.spec().id
    }

    /// Source queue.
    pub fn queue(&self) -> &Arc<SampleQueue> {
        &self.queue
    }

    /// True while a segment is open.
    pub fn is_open(&self) -> bool {
        self.segment.is_some()
    }

    /// Next counter to fetch.
    pub fn next_ct(&self) -> u64 {
        self.next_ct
    }

    /// Scans left in a bounded window.
    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    /// True once a bounded window has been fully written.
    pub fn is_done(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Bytes written since the last call.
    pub fn take_bytes(&mut self) -> u64 {
        std::mem::take(&mut self.bytes)
    }

    /// Open a segment for a new window. Any open segment must be closed first.
    pub fn open(&mut self, storage: &dyn SegmentStorage, key: &SegmentKey, start: WindowStart) -> AppResult<()> {
        let spec = self.queue.spec();
        let info = SegmentInfo {
            first_ct: start.first_ct,
            n_saved_chans: self.saved.len(),
            sample_rate: spec.sample_rate,
        };
        self.segment = Some(storage.open_segment(key, &info)?);
        self.next_ct = start.first_ct;
        self.remaining = start.remaining;
        Ok(())
    }

    /// Bound an open-ended window so it ends just before `end_ct`.
    pub fn limit_to(&mut self, end_ct: u64) {
        self.remaining = Some(end_ct.saturating_sub(self.next_ct));
    }

    /// Fetch and write whatever is resident of the rest of the window.
    ///
    /// Returns scans written; zero is not an error.
    pub fn write_some(&mut self) -> AppResult<u64> {
        let Some(segment) = self.segment.as_mut() else {
            return Ok(0);
        };
        let max = match self.remaining {
            Some(0) => return Ok(0),
            Some(r) => usize::try_from(r).unwrap_or(usize::MAX),
            None => usize::MAX,
        };

        let fetch = self.queue.fetch(self.next_ct, max);
        let Some(head_ct) = fetch.first_ct() else {
            return Ok(0);
        };
        let nc = fetch.n_chans;
        if head_ct != self.next_ct && segment.scans_written() == 0 {
            debug!(
                stream = %self.queue.spec().id,
                wanted = self.next_ct,
                got = head_ct,
                "Window start already evicted"
            );
            segment.set_first_ct(head_ct);
        }

        // A clamped fetch may run past the window end.
        let end = self.remaining.map(|r| self.next_ct.saturating_add(r));
        let mut ct = head_ct;
        for block in &fetch.blocks {
            let scans = (block.data.len() / nc) as u64;
            let take = end.map_or(scans, |e| scans.min(e.saturating_sub(ct)));
            if take == 0 {
                break;
            }
            let data = &block.data[..take as usize * nc];
            if self.saves_all {
                segment.write_block(data)?;
            } else {
                segment.write_block(&extract_channels(data, nc, &self.saved))?;
            }
            ct += take;
        }

        let n = ct - head_ct;
        let consumed = ct - self.next_ct;
        self.next_ct = ct;
        if let Some(r) = self.remaining.as_mut() {
            *r = r.saturating_sub(consumed);
        }
        self.bytes += n * self.saved.len() as u64 * 2;
        trace!(stream = %self.id(), n, next_ct = ct, "Wrote scans");
        Ok(n)
    }

    /// Close the open segment, if any.
    pub fn close(&mut self) -> AppResult<Option<SegmentSummary>> {
        self.remaining = None;
        match self.segment.take() {
            Some(seg) => seg.close().map(Some),
            None => Ok(None),
        }
    }
}

type Slot = Arc<Mutex<StreamWriter>>;

/// Writers for every stream of a run plus the probe worker threads.
pub struct WriterPool {
    slots: Vec<Slot>,
    /// Slot of the auxiliary card, written on the dispatching thread.
    local: Option<usize>,
    sync: Arc<WorkerSync>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WriterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterPool")
            .field("streams", &self.slots.len())
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl WriterPool {
    /// Create writers for every stream and start the probe workers.
    pub fn new(streams: &StreamRegistry, loop_ms: u64) -> AppResult<Self> {
        let slots: Vec<Slot> = streams
            .iter()
            .map(|q| Arc::new(Mutex::new(StreamWriter::new(Arc::clone(q)))))
            .collect();
        let local = streams.iter().position(|q| !q.spec().id.is_imec());
        let probes: Vec<usize> = (0..slots.len()).filter(|&i| Some(i) != local).collect();

        let sync = Arc::new(WorkerSync::new(Duration::from_millis((loop_ms / 8).max(1))));
        let mut workers = Vec::new();
        for (k, group) in probes.chunks(PROBES_PER_WORKER).enumerate() {
            let mine: Vec<Slot> = group.iter().map(|&i| Arc::clone(&slots[i])).collect();
            let sync = Arc::clone(&sync);
            let handle = thread::Builder::new()
                .name(format!("trig-writer-{}", k))
                .spawn(move || worker_loop(&sync, &mine))
                .map_err(|e| DaqError::Thread(format!("spawn writer: {}", e)))?;
            workers.push(handle);
        }
        sync.wait_ready(workers.len());
        debug!(streams = slots.len(), workers = workers.len(), "Writer pool ready");

        Ok(Self {
            slots,
            local,
            sync,
            workers,
        })
    }

    /// Number of probe writer threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Number of stream writers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when there are no streams.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Lock the writer for `id`.
    pub fn writer(&self, id: StreamId) -> Option<parking_lot::MutexGuard<'_, StreamWriter>> {
        self.slots.iter().map(|s| s.lock()).find(|w| w.id() == id)
    }

    /// Apply `f` to every writer in stream order.
    pub fn for_each<F>(&self, mut f: F) -> AppResult<()>
    where
        F: FnMut(&mut StreamWriter) -> AppResult<()>,
    {
        for slot in &self.slots {
            f(&mut slot.lock())?;
        }
        Ok(())
    }

    /// True while any writer has a segment open.
    pub fn any_open(&self) -> bool {
        self.slots.iter().any(|s| s.lock().is_open())
    }

    /// True when every open writer has finished its bounded window.
    pub fn all_done(&self) -> bool {
        self.slots.iter().all(|s| {
            let w = s.lock();
            !w.is_open() || w.is_done()
        })
    }

    /// Open one segment per stream; `start` gives each stream's window.
    pub fn open_all<F>(&self, storage: &dyn SegmentStorage, key_for: impl Fn(StreamId) -> SegmentKey, start: F) -> AppResult<()>
    where
        F: Fn(&StreamWriter) -> WindowStart,
    {
        self.for_each(|w| {
            let s = start(w);
            w.open(storage, &key_for(w.id()), s)
        })
    }

    /// One synchronized write cycle over every stream.
    pub fn xfer_all(&self) -> AppResult<()> {
        let local = self.local.map(|i| Arc::clone(&self.slots[i]));
        self.sync.dispatch(self.workers.len(), move || match local {
            Some(slot) => slot.lock().write_some().map(|_| ()),
            None => Ok(()),
        })
    }

    /// Close every open segment, returning what was closed.
    ///
    /// All writers are closed even if one fails; the first error is returned.
    pub fn close_all(&self) -> AppResult<Vec<SegmentSummary>> {
        let mut closed = Vec::new();
        let mut first_err = None;
        for slot in &self.slots {
            match slot.lock().close() {
                Ok(Some(s)) => closed.push(s),
                Ok(None) => {}
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }

    /// Bytes written by all writers since the last call.
    pub fn take_bytes(&self) -> u64 {
        self.slots.iter().map(|s| s.lock().take_bytes()).sum()
    }

    /// Release and join the worker threads.
    pub fn shutdown(&mut self) {
        self.sync.kill();
        for h in self.workers.drain(..) {
            if let Err(e) = h.join() {
                error!("Writer thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for WriterPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(sync: &WorkerSync, slots: &[Slot]) {
    let mut seen = 0;
    let mut last: AppResult<()> = Ok(());
    while sync.wake(last, &mut seen) {
        last = slots.iter().try_for_each(|s| s.lock().write_some().map(|_| ()));
    }
    trace!("Writer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::storage::MemoryStorage;
    use crate::stream::StreamSpec;

    fn registry(n_probes: usize, with_ni: bool) -> StreamRegistry {
        let mut reg = StreamRegistry::new();
        for ip in 0..n_probes {
            let spec = StreamSpec::imec(ip, 1000.0).with_channels(3, 2);
            reg.insert(Arc::new(SampleQueue::with_origin(spec, 2.0, 0.0).unwrap())).unwrap();
        }
        if with_ni {
            let spec = StreamSpec::nidq(500.0, 2, 0);
            reg.insert(Arc::new(SampleQueue::with_origin(spec, 2.0, 0.0).unwrap())).unwrap();
        }
        reg
    }

    fn fill(reg: &StreamRegistry, n: usize) {
        for q in reg.iter() {
            let nc = q.channel_count();
            let data: Vec<i16> = (0..n * nc).map(|i| (i / nc) as i16).collect();
            q.push(&data);
        }
    }

    fn key(id: StreamId) -> SegmentKey {
        SegmentKey {
            run: "t".into(),
            stream: id,
            g: 0,
            t: 0,
        }
    }

    #[test]
    fn bounded_window_completes_across_pushes() {
        let reg = registry(1, false);
        let q = Arc::clone(&reg.imec()[0]);
        let mem = MemoryStorage::new();
        let mut w = StreamWriter::new(Arc::clone(&q));
        w.open(
            &mem,
            &key(StreamId::Imec(0)),
            WindowStart {
                first_ct: 5,
                remaining: Some(21),
            },
        )
        .unwrap();

        fill(&reg, 10);
        assert_eq!(w.write_some().unwrap(), 5);
        assert!(!w.is_done());
        assert_eq!(w.write_some().unwrap(), 0);

        fill(&reg, 30);
        assert_eq!(w.write_some().unwrap(), 16);
        assert!(w.is_done());
        w.close().unwrap();

        let seg = &mem.segments()[0];
        assert_eq!(seg.n_scans(), 21);
        assert_eq!(seg.info.first_ct, 5);
    }

    #[test]
    fn evicted_window_start_records_first_written_scan() {
        let spec = StreamSpec::nidq(1000.0, 2, 0);
        let q = Arc::new(SampleQueue::with_origin(spec, 0.25, 0.0).unwrap());
        let mem = MemoryStorage::new();
        let mut w = StreamWriter::new(Arc::clone(&q));
        w.open(
            &mem,
            &key(StreamId::Nidq),
            WindowStart {
                first_ct: 10,
                remaining: Some(200),
            },
        )
        .unwrap();

        // 250-scan ring: scans 0..300 leave 50..300 resident.
        q.push(&vec![0; 300 * 2]);
        // The window still ends at 10 + 200.
        assert_eq!(w.write_some().unwrap(), 160);
        assert!(w.is_done());
        assert_eq!(w.next_ct(), 210);
        let summary = w.close().unwrap().unwrap();
        assert_eq!(summary.first_ct, 50);
        assert_eq!(mem.segments()[0].info.first_ct, 50);
    }

    #[test]
    fn saved_channel_subset_is_applied() {
        let spec = StreamSpec::nidq(1000.0, 3, 0).with_save_chans(vec![2]);
        let q = Arc::new(SampleQueue::with_origin(spec, 1.0, 0.0).unwrap());
        q.push(&[1, 2, 3, 4, 5, 6]);
        let mem = MemoryStorage::new();
        let mut w = StreamWriter::new(Arc::clone(&q));
        w.open(&mem, &key(StreamId::Nidq), WindowStart { first_ct: 0, remaining: None }).unwrap();
        w.write_some().unwrap();
        w.close().unwrap();
        assert_eq!(mem.segments()[0].data, vec![3, 6]);
    }

    #[test]
    fn limit_to_bounds_open_window() {
        let reg = registry(1, false);
        fill(&reg, 50);
        let mem = MemoryStorage::new();
        let mut w = StreamWriter::new(Arc::clone(&reg.imec()[0]));
        w.open(&mem, &key(StreamId::Imec(0)), WindowStart { first_ct: 10, remaining: None }).unwrap();
        w.limit_to(30);
        assert_eq!(w.write_some().unwrap(), 20);
        assert!(w.is_done());
    }

    #[test]
    fn pool_assigns_two_probes_per_worker() {
        let reg = registry(5, true);
        let pool = WriterPool::new(&reg, 100).unwrap();
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(pool.len(), 6);
    }

    #[test]
    fn pool_writes_every_stream_in_one_cycle() {
        let reg = registry(3, true);
        fill(&reg, 40);
        let mem = MemoryStorage::new();
        let pool = WriterPool::new(&reg, 8).unwrap();

        pool.open_all(&mem, key, |_| WindowStart {
            first_ct: 0,
            remaining: Some(25),
        })
        .unwrap();
        pool.xfer_all().unwrap();
        assert!(pool.all_done());

        let closed = pool.close_all().unwrap();
        assert_eq!(closed.len(), 4);
        assert!(closed.iter().all(|s| s.n_scans == 25));
        assert!(!pool.any_open());
    }

    #[test]
    fn pool_propagates_storage_failure() {
        let reg = registry(2, false);
        fill(&reg, 40);
        let mem = MemoryStorage::failing_after(0);
        let pool = WriterPool::new(&reg, 8).unwrap();
        pool.open_all(&mem, key, |_| WindowStart {
            first_ct: 0,
            remaining: None,
        })
        .unwrap();
        let err = pool.xfer_all().unwrap_err();
        assert!(err.is_fatal());
    }
}
