//! Time-indexed, multi-consumer circular buffer of interleaved scans.
//!
//! One `SampleQueue` exists per stream. Its single producer pushes whole scans;
//! any number of consumers (trigger, display, remote fetch) copy regions out by
//! scan counter without ever consuming them.
//!
//! # Memory Layout
//! ```text
//! ring: [scan k % cap][scan k+1 % cap] ...      (cap scans, n_chans i16 each)
//!
//! head_ct: next counter to be written (total scans pushed)
//! tail_ct: oldest resident counter = head_ct - min(head_ct, cap)
//! ```
//!
//! A fetch that starts before `tail_ct` is clamped forward to the tail; callers
//! must check the returned count and first counter. Eviction of old scans under
//! load is the backpressure policy: the producer never waits for a consumer.
//!
//! The ring sits behind one `RwLock`. The producer holds the write side only for
//! the copy in; readers hold the read side only for bookkeeping and the copy out,
//! so no consumer can observe a partially written scan.

use crate::error::{AppResult, DaqError};
use crate::stream::StreamSpec;
use crate::timing::{now_secs, MapError, TimeIndex};
use parking_lot::RwLock;
use std::borrow::Cow;
use tracing::{debug, warn};

/// A contiguous run of scans copied out of the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBlock {
    /// Interleaved samples, whole scans only.
    pub data: Vec<i16>,
    /// Counter of the first scan in `data`.
    pub head_ct: u64,
}

/// Result of a fetch: at most two blocks (the ring may wrap once).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fetch {
    /// One block, or two when the ring wrapped.
    pub blocks: Vec<QueueBlock>,
    /// Total scans across all blocks.
    pub n_scans: usize,
    /// Channels per scan.
    pub n_chans: usize,
}

impl Fetch {
    /// True when nothing was returned.
    pub fn is_empty(&self) -> bool {
        self.n_scans == 0
    }

    /// Counter of the first returned scan.
    pub fn first_ct(&self) -> Option<u64> {
        self.blocks.first().map(|b| b.head_ct)
    }

    /// Counter one past the last returned scan.
    pub fn next_ct(&self) -> Option<u64> {
        self.first_ct().map(|ct| ct + self.n_scans as u64)
    }

    /// Merge the blocks into one flat buffer.
    ///
    /// A single block is borrowed as is. Fails only if the merged buffer
    /// cannot be allocated.
    pub fn concatenate(&self) -> AppResult<Cow<'_, [i16]>> {
        match self.blocks.as_slice() {
            [] => Ok(Cow::Borrowed(&[])),
            [only] => Ok(Cow::Borrowed(only.data.as_slice())),
            blocks => {
                let total: usize = blocks.iter().map(|b| b.data.len()).sum();
                let mut cat: Vec<i16> = Vec::new();
                cat.try_reserve_exact(total).map_err(|_| DaqError::Allocation {
                    bytes: total * std::mem::size_of::<i16>(),
                })?;
                for b in blocks {
                    cat.extend_from_slice(&b.data);
                }
                Ok(Cow::Owned(cat))
            }
        }
    }

    /// Like [`Self::concatenate`] but always yields an owned buffer.
    pub fn into_flat(self) -> AppResult<Vec<i16>> {
        let mut blocks = self.blocks;
        if blocks.len() == 1 {
            return Ok(blocks.pop().map(|b| b.data).unwrap_or_default());
        }
        let total: usize = blocks.iter().map(|b| b.data.len()).sum();
        let mut cat: Vec<i16> = Vec::new();
        cat.try_reserve_exact(total).map_err(|_| DaqError::Allocation {
            bytes: total * std::mem::size_of::<i16>(),
        })?;
        for b in blocks {
            cat.extend_from_slice(&b.data);
        }
        Ok(cat)
    }
}

struct Ring {
    buf: Vec<i16>,
    head_ct: u64,
}

/// Per-stream circular scan buffer.
pub struct SampleQueue {
    spec: StreamSpec,
    time: TimeIndex,
    capacity: usize,
    ring: RwLock<Ring>,
}

impl std::fmt::Debug for SampleQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleQueue")
            .field("stream", &self.spec.id)
            .field("capacity", &self.capacity)
            .field("head_ct", &self.head_ct())
            .finish()
    }
}

impl SampleQueue {
    /// Create a queue holding `capacity_secs` of data, with its time origin at now.
    pub fn new(spec: StreamSpec, capacity_secs: f64) -> AppResult<Self> {
        Self::with_origin(spec, capacity_secs, now_secs())
    }

    /// Create a queue whose scan 0 was taken at process time `t0`.
    pub fn with_origin(spec: StreamSpec, capacity_secs: f64, t0: f64) -> AppResult<Self> {
        spec.validate()?;
        let capacity = (capacity_secs * spec.sample_rate).ceil();
        if !(capacity >= 1.0) {
            return Err(DaqError::Configuration(format!(
                "{}: queue must hold at least one scan (got {} secs)",
                spec.id, capacity_secs
            )));
        }
        let capacity = capacity as usize;
        let samples = capacity * spec.n_chans;
        let mut buf: Vec<i16> = Vec::new();
        buf.try_reserve_exact(samples).map_err(|_| DaqError::Allocation {
            bytes: samples * std::mem::size_of::<i16>(),
        })?;
        buf.resize(samples, 0);

        debug!(
            stream = %spec.id,
            capacity_scans = capacity,
            n_chans = spec.n_chans,
            mb = (samples * 2) as f64 / (1024.0 * 1024.0),
            "Created sample queue"
        );

        Ok(Self {
            time: TimeIndex::new(spec.sample_rate, t0),
            spec,
            capacity,
            ring: RwLock::new(Ring { buf, head_ct: 0 }),
        })
    }

    /// Descriptor of the buffered stream.
    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    /// Counter to time mapping.
    pub fn time_index(&self) -> &TimeIndex {
        &self.time
    }

    /// Process time of scan 0.
    pub fn origin(&self) -> f64 {
        self.time.origin()
    }

    /// Channels per scan.
    pub fn channel_count(&self) -> usize {
        self.spec.n_chans
    }

    /// Scans per second.
    pub fn sample_rate(&self) -> f64 {
        self.spec.sample_rate
    }

    /// Ring capacity in scans.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Next counter to be written; equals the number of scans pushed so far.
    pub fn head_ct(&self) -> u64 {
        self.ring.read().head_ct
    }

    /// Oldest resident counter.
    pub fn tail_ct(&self) -> u64 {
        let head = self.head_ct();
        head - head.min(self.capacity as u64)
    }

    fn positions(&self) -> (u64, u64) {
        let head = self.head_ct();
        (head - head.min(self.capacity as u64), head)
    }

    /// Append whole scans. Returns the number of scans accepted.
    ///
    /// Producer thread only. A trailing partial scan is dropped; more than
    /// `capacity` scans in one call keeps only the newest `capacity`.
    pub fn push(&self, data: &[i16]) -> usize {
        let nc = self.spec.n_chans;
        let n_scans = data.len() / nc;
        if n_scans * nc != data.len() {
            warn!(
                stream = %self.spec.id,
                extra = data.len() - n_scans * nc,
                "Dropping partial scan from producer block"
            );
        }
        if n_scans == 0 {
            return 0;
        }

        let cap = self.capacity;
        let mut ring = self.ring.write();

        // Only the newest `cap` scans can survive this push.
        let skip = n_scans.saturating_sub(cap);
        let mut ct = ring.head_ct + skip as u64;
        let mut src = &data[skip * nc..n_scans * nc];

        while !src.is_empty() {
            let off = (ct % cap as u64) as usize;
            let room = cap - off;
            let n = room.min(src.len() / nc);
            ring.buf[off * nc..(off + n) * nc].copy_from_slice(&src[..n * nc]);
            src = &src[n * nc..];
            ct += n as u64;
        }

        ring.head_ct += n_scans as u64;
        n_scans
    }

    /// Copy up to `max_count` scans starting at `from_ct`.
    ///
    /// If `from_ct` precedes the oldest resident scan the range is clamped
    /// forward; the result then starts later than requested. A request at or
    /// beyond the head yields an empty fetch.
    pub fn fetch(&self, from_ct: u64, max_count: usize) -> Fetch {
        let nc = self.spec.n_chans;
        let cap = self.capacity as u64;
        let ring = self.ring.read();
        let head = ring.head_ct;
        let tail = head - head.min(cap);

        if max_count == 0 || from_ct >= head {
            return Fetch {
                n_chans: nc,
                ..Fetch::default()
            };
        }

        let from = from_ct.max(tail);
        let n = (head - from).min(max_count as u64) as usize;
        let off = (from % cap) as usize;
        let first = n.min(self.capacity - off);

        let mut blocks = Vec::with_capacity(2);
        blocks.push(QueueBlock {
            data: ring.buf[off * nc..(off + first) * nc].to_vec(),
            head_ct: from,
        });
        if n > first {
            blocks.push(QueueBlock {
                data: ring.buf[..(n - first) * nc].to_vec(),
                head_ct: from + first as u64,
            });
        }

        Fetch {
            blocks,
            n_scans: n,
            n_chans: nc,
        }
    }

    /// Everything resident from `from_ct` to the head.
    pub fn fetch_all_from(&self, from_ct: u64) -> Fetch {
        self.fetch(from_ct, usize::MAX)
    }

    /// The newest `n` resident scans.
    pub fn fetch_newest(&self, n: usize) -> Fetch {
        let head = self.head_ct();
        self.fetch(head.saturating_sub(n as u64), n)
    }

    /// Merge fetched blocks into one flat buffer.
    pub fn concatenate<'a>(&self, fetch: &'a Fetch) -> AppResult<Cow<'a, [i16]>> {
        fetch.concatenate()
    }

    /// Counter one past a fetch's last scan, or `fallback` if it was empty.
    pub fn next_ct(fetch: &Fetch, fallback: u64) -> u64 {
        fetch.next_ct().unwrap_or(fallback)
    }

    /// Map process time onto a resident scan counter.
    pub fn map_time_to_ct(&self, t: f64) -> Result<u64, MapError> {
        let (tail, head) = self.positions();
        if head == 0 {
            return Err(MapError::Empty);
        }
        if t < self.time.origin() - 0.5 * self.time.period() {
            return Err(MapError::BeforeQueue);
        }
        let ct = self.time.time_to_ct(t);
        if ct < tail {
            Err(MapError::BeforeQueue)
        } else if ct >= head {
            Err(MapError::AfterQueue)
        } else {
            Ok(ct)
        }
    }

    /// Map a resident scan counter onto process time.
    pub fn map_ct_to_time(&self, ct: u64) -> Result<f64, MapError> {
        let (tail, head) = self.positions();
        if head == 0 {
            Err(MapError::Empty)
        } else if ct < tail {
            Err(MapError::BeforeQueue)
        } else if ct >= head {
            Err(MapError::AfterQueue)
        } else {
            Ok(self.time.ct_to_time(ct))
        }
    }

    /// Map `t` to a counter, clamping times older than the tail to the tail.
    pub fn map_time_to_ct_clamped(&self, t: f64) -> Result<u64, MapError> {
        match self.map_time_to_ct(t) {
            Err(MapError::BeforeQueue) => Ok(self.tail_ct()),
            other => other,
        }
    }

    /// Seconds of data currently resident.
    pub fn resident_secs(&self) -> f64 {
        let (tail, head) = self.positions();
        (head - tail) as f64 / self.spec.sample_rate
    }
}
