//! Live-display data feed.
//!
//! The [`GraphFetcher`] thread keeps one cursor per stream and, every
//! `fetch_ms`, pulls everything newer than it. Fetched scans go through the
//! fetcher's own display band filter and downsampler before being offered to
//! the display channel; a full channel drops the batch. Nothing here touches
//! trigger state.

use crate::config::DisplayConfig;
use crate::data::iir_filter::BandFilter;
use crate::data::sample_queue::SampleQueue;
use crate::data::subset::downsample;
use crate::error::{AppResult, DaqError};
use crate::stream::{StreamId, StreamRegistry};
use crate::sync::StopFlag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

/// One batch of display data for one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphData {
    /// Source stream.
    pub stream: StreamId,
    /// Counter of the first scan before downsampling.
    pub first_ct: u64,
    /// Channels in each scan.
    pub n_chans: usize,
    /// Scans after downsampling.
    pub n_scans: usize,
    /// Factor applied before sending.
    pub downsample: usize,
    /// Filtered samples, interleaved.
    pub data: Vec<i16>,
}

struct GfStream {
    queue: Arc<SampleQueue>,
    filter: BandFilter,
    next_ct: Option<u64>,
}

impl GfStream {
    fn new(queue: Arc<SampleQueue>, cfg: &DisplayConfig) -> AppResult<Self> {
        let spec = queue.spec();
        let filter = BandFilter::new(cfg.band, spec.sample_rate, spec.n_neural, spec.max_int)?;
        Ok(Self {
            queue,
            filter,
            next_ct: None,
        })
    }

    fn fetch(&mut self, oldest_secs: f64, k: usize) -> AppResult<Option<GraphData>> {
        let q = &self.queue;
        let head = q.head_ct();
        let from = match self.next_ct {
            Some(ct) if ct >= q.tail_ct() => ct,
            _ => {
                // First fetch, or fell behind the queue: restart near the head.
                self.filter.reset();
                head.saturating_sub(q.time_index().secs_to_cts(oldest_secs))
            }
        };
        let fetch = q.fetch_all_from(from);
        let Some(first_ct) = fetch.first_ct() else {
            self.next_ct = Some(from);
            return Ok(None);
        };
        self.next_ct = Some(SampleQueue::next_ct(&fetch, from));

        let nc = fetch.n_chans;
        let mut data = fetch.into_flat()?;
        self.filter.apply(&mut data, nc);
        let data = if k > 1 { downsample(&data, nc, k) } else { data };
        Ok(Some(GraphData {
            stream: q.spec().id,
            first_ct,
            n_chans: nc,
            n_scans: data.len() / nc.max(1),
            downsample: k,
            data,
        }))
    }
}

struct Flags {
    hard: AtomicBool,
    soft: AtomicBool,
}

impl Flags {
    fn paused(&self) -> bool {
        self.hard.load(Ordering::SeqCst) || self.soft.load(Ordering::SeqCst)
    }
}

/// The display fetch thread.
pub struct GraphFetcher {
    flags: Arc<Flags>,
    stop: StopFlag,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for GraphFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphFetcher")
            .field("paused", &self.is_paused())
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl GraphFetcher {
    /// Start fetching every stream in `streams`.
    pub fn start(cfg: &DisplayConfig, streams: &StreamRegistry, tx: mpsc::Sender<GraphData>) -> AppResult<Self> {
        let gfs = streams
            .iter()
            .map(|q| GfStream::new(Arc::clone(q), cfg))
            .collect::<AppResult<Vec<_>>>()?;
        let flags = Arc::new(Flags {
            hard: AtomicBool::new(false),
            soft: AtomicBool::new(false),
        });
        let stop = StopFlag::new();

        let thread = {
            let flags = Arc::clone(&flags);
            let stop = stop.clone();
            let cfg = cfg.clone();
            thread::Builder::new()
                .name("graph-fetcher".into())
                .spawn(move || run(gfs, &cfg, &flags, &stop, &tx))
                .map_err(|e| DaqError::Thread(format!("spawn graph fetcher: {}", e)))?
        };
        info!(band = ?cfg.band, downsample = cfg.downsample, "Graph fetcher started");

        Ok(Self {
            flags,
            stop,
            thread: Some(thread),
        })
    }

    /// Pause button.
    pub fn hard_pause(&self, pause: bool) {
        self.flags.hard.store(pause, Ordering::SeqCst);
    }

    /// Window hidden or minimized.
    pub fn soft_pause(&self, pause: bool) {
        self.flags.soft.store(pause, Ordering::SeqCst);
    }

    /// True while paused by hand or by a slow consumer.
    pub fn is_paused(&self) -> bool {
        self.flags.paused()
    }

    /// Stop and join the fetch thread.
    pub fn stop(&mut self) {
        self.stop.stop();
        if let Some(h) = self.thread.take() {
            if let Err(e) = h.join() {
                error!("Graph fetcher panicked: {:?}", e);
            }
        }
    }
}

impl Drop for GraphFetcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut gfs: Vec<GfStream>, cfg: &DisplayConfig, flags: &Flags, stop: &StopFlag, tx: &mpsc::Sender<GraphData>) {
    let period = Duration::from_millis(cfg.fetch_ms.max(1));
    let k = cfg.downsample.max(1);

    while !stop.is_stopped() {
        if !flags.paused() {
            for s in gfs.iter_mut() {
                match s.fetch(cfg.oldest_secs, k) {
                    Ok(Some(batch)) => match tx.try_send(batch) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(b)) => {
                            trace!(stream = %b.stream, "Display busy, batch dropped");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            debug!("Display channel closed");
                            return;
                        }
                    },
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "Display fetch failed"),
                }
            }
        }
        stop.sleep(period);
    }
    debug!("Graph fetcher stopped");
}
