//! Segment storage backends.
//!
//! A segment is one stream's share of one (gate, trigger) pair: a flat file of
//! little-endian `i16` scans holding only the stream's saved channels. The
//! trigger opens one segment per active stream for each new trigger, writes
//! blocks into it from the trigger or worker threads, and closes it when the
//! window is complete.
//!
//! ```text
//! <dir>/<run>_g<g>/<run>_g<g>_t<t>.<stream>.bin
//! <dir>/<run>_g<g>/<run>_g<g>_t<t>.<stream>.meta.json
//! ```
//!
//! Every failure here is fatal to the run and reported as
//! [`DaqError::Storage`].
use crate::error::{AppResult, DaqError};
use crate::stream::StreamId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Identifies one segment file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    /// Run name.
    pub run: String,
    /// Stream the segment belongs to.
    pub stream: StreamId,
    /// Gate index.
    pub g: u32,
    /// Trigger index within the gate.
    pub t: u32,
}

impl SegmentKey {
    /// `<run>_g<g>`
    pub fn gate_dir(&self) -> String {
        format!("{}_g{}", self.run, self.g)
    }

    /// `<run>_g<g>_t<t>.<stream>`
    pub fn stem(&self) -> String {
        format!("{}_g{}_t{}.{}", self.run, self.g, self.t, self.stream)
    }
}

/// Fixed properties of a segment, known when it is opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentInfo {
    /// Counter of the first scan written.
    pub first_ct: u64,
    /// Channels in each written scan.
    pub n_saved_chans: usize,
    /// Scans per second.
    pub sample_rate: f64,
}

/// What a closed segment holds.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSummary {
    /// Which segment.
    pub key: SegmentKey,
    /// Counter of the first scan written.
    pub first_ct: u64,
    /// Scans written.
    pub n_scans: u64,
    /// Bytes written.
    pub bytes: u64,
}

/// Sidecar metadata written next to each `.bin` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMeta {
    /// Counter of the first scan in the file.
    pub first_sample: u64,
    /// Channels in each scan.
    pub n_saved_chans: usize,
    /// Scans per second.
    pub sample_rate: f64,
    /// Size of the `.bin` file.
    pub file_size_bytes: u64,
    /// Seconds of data in the file.
    pub file_time_secs: f64,
    /// When the segment was closed.
    pub created_at: DateTime<Utc>,
}

/// An open segment.
pub trait SegmentWriter: Send {
    /// Append interleaved scans of the saved channels.
    fn write_block(&mut self, data: &[i16]) -> AppResult<()>;

    /// Scans written so far.
    fn scans_written(&self) -> u64;

    /// Move the recorded first counter, before anything is written.
    fn set_first_ct(&mut self, first_ct: u64);

    /// Finish the segment.
    fn close(self: Box<Self>) -> AppResult<SegmentSummary>;
}

/// Opens segments for the trigger.
pub trait SegmentStorage: Send + Sync {
    /// Create the segment for `key`; it stays open until closed.
    fn open_segment(&self, key: &SegmentKey, info: &SegmentInfo) -> AppResult<Box<dyn SegmentWriter>>;
}

// ---------------------------------------------------------------------------
// FileStorage
// ---------------------------------------------------------------------------

/// Writes segments as raw binary files with JSON sidecars.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Storage rooted at `root`; directories are created on demand.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory segments are written under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the `.bin` file for `key`.
    pub fn bin_path(&self, key: &SegmentKey) -> PathBuf {
        self.root.join(key.gate_dir()).join(format!("{}.bin", key.stem()))
    }

    /// Path of the sidecar for `key`.
    pub fn meta_path(&self, key: &SegmentKey) -> PathBuf {
        self.root.join(key.gate_dir()).join(format!("{}.meta.json", key.stem()))
    }
}

impl SegmentStorage for FileStorage {
    fn open_segment(&self, key: &SegmentKey, info: &SegmentInfo) -> AppResult<Box<dyn SegmentWriter>> {
        let bin = self.bin_path(key);
        let err = |e: std::io::Error| DaqError::storage(key.stream, format!("{}: {}", bin.display(), e));

        if let Some(dir) = bin.parent() {
            fs::create_dir_all(dir).map_err(err)?;
        }
        let file = File::create(&bin).map_err(err)?;
        info!(stream = %key.stream, path = %bin.display(), first_ct = info.first_ct, "Opened segment");

        Ok(Box::new(FileSegment {
            key: key.clone(),
            info: *info,
            meta: self.meta_path(key),
            bin,
            writer: BufWriter::new(file),
            n_samples: 0,
        }))
    }
}

struct FileSegment {
    key: SegmentKey,
    info: SegmentInfo,
    bin: PathBuf,
    meta: PathBuf,
    writer: BufWriter<File>,
    n_samples: u64,
}

impl FileSegment {
    fn fail(&self, e: impl std::fmt::Display) -> DaqError {
        DaqError::storage(self.key.stream, format!("{}: {}", self.bin.display(), e))
    }
}

impl SegmentWriter for FileSegment {
    fn write_block(&mut self, data: &[i16]) -> AppResult<()> {
        let mut bytes = Vec::with_capacity(data.len() * 2);
        for s in data {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        self.writer.write_all(&bytes).map_err(|e| self.fail(e))?;
        self.n_samples += data.len() as u64;
        Ok(())
    }

    fn scans_written(&self) -> u64 {
        self.n_samples / self.info.n_saved_chans.max(1) as u64
    }

    fn set_first_ct(&mut self, first_ct: u64) {
        self.info.first_ct = first_ct;
    }

    fn close(mut self: Box<Self>) -> AppResult<SegmentSummary> {
        self.writer.flush().map_err(|e| self.fail(e))?;

        let n_scans = self.scans_written();
        let bytes = self.n_samples * 2;
        let meta = SegmentMeta {
            first_sample: self.info.first_ct,
            n_saved_chans: self.info.n_saved_chans,
            sample_rate: self.info.sample_rate,
            file_size_bytes: bytes,
            file_time_secs: n_scans as f64 / self.info.sample_rate,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&meta).map_err(|e| self.fail(e))?;
        fs::write(&self.meta, json).map_err(|e| self.fail(e))?;

        debug!(stream = %self.key.stream, n_scans, bytes, "Closed segment");
        Ok(SegmentSummary {
            key: self.key.clone(),
            first_ct: self.info.first_ct,
            n_scans,
            bytes,
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryStorage
// ---------------------------------------------------------------------------

/// A segment captured in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSegment {
    /// Which segment.
    pub key: SegmentKey,
    /// Properties given at open.
    pub info: SegmentInfo,
    /// Samples written, interleaved.
    pub data: Vec<i16>,
    /// Set once the segment is closed.
    pub closed: bool,
}

impl RecordedSegment {
    /// Whole scans recorded.
    pub fn n_scans(&self) -> usize {
        self.data.len() / self.info.n_saved_chans.max(1)
    }
}

/// In-process storage for simulation and tests.
///
/// Clones share the same record list.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    segments: Arc<Mutex<Vec<RecordedSegment>>>,
    blocks: Arc<AtomicUsize>,
    fail_after_blocks: Option<usize>,
}

impl MemoryStorage {
    /// Empty storage that never fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage whose writes fail once `n` blocks have been accepted in total.
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after_blocks: Some(n),
            ..Self::default()
        }
    }

    /// Snapshot of every segment opened so far, in open order.
    pub fn segments(&self) -> Vec<RecordedSegment> {
        self.segments.lock().clone()
    }

    /// Segments for one stream.
    pub fn segments_for(&self, stream: StreamId) -> Vec<RecordedSegment> {
        self.segments
            .lock()
            .iter()
            .filter(|s| s.key.stream == stream)
            .cloned()
            .collect()
    }
}

impl SegmentStorage for MemoryStorage {
    fn open_segment(&self, key: &SegmentKey, info: &SegmentInfo) -> AppResult<Box<dyn SegmentWriter>> {
        let mut segs = self.segments.lock();
        segs.push(RecordedSegment {
            key: key.clone(),
            info: *info,
            data: Vec::new(),
            closed: false,
        });
        Ok(Box::new(MemorySegment {
            store: self.clone(),
            index: segs.len() - 1,
            stream: key.stream,
            n_chans: info.n_saved_chans.max(1),
            n_samples: 0,
        }))
    }
}

struct MemorySegment {
    store: MemoryStorage,
    index: usize,
    stream: StreamId,
    n_chans: usize,
    n_samples: u64,
}

impl SegmentWriter for MemorySegment {
    fn write_block(&mut self, data: &[i16]) -> AppResult<()> {
        if let Some(limit) = self.store.fail_after_blocks {
            if self.store.blocks.load(Ordering::SeqCst) >= limit {
                return Err(DaqError::storage(self.stream, "simulated write failure"));
            }
        }
        self.store.blocks.fetch_add(1, Ordering::SeqCst);
        let mut segs = self.store.segments.lock();
        segs[self.index].data.extend_from_slice(data);
        self.n_samples += data.len() as u64;
        Ok(())
    }

    fn scans_written(&self) -> u64 {
        self.n_samples / self.n_chans as u64
    }

    fn set_first_ct(&mut self, first_ct: u64) {
        self.store.segments.lock()[self.index].info.first_ct = first_ct;
    }

    fn close(self: Box<Self>) -> AppResult<SegmentSummary> {
        let mut segs = self.store.segments.lock();
        let seg = &mut segs[self.index];
        seg.closed = true;
        Ok(SegmentSummary {
            key: seg.key.clone(),
            first_ct: seg.info.first_ct,
            n_scans: seg.n_scans() as u64,
            bytes: seg.data.len() as u64 * 2,
        })
    }
}
