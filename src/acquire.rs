//! Producer side: hardware (or synthetic) sources feeding the sample queues.
//!
//! Each active stream gets one [`StreamReader`] thread that pulls interleaved
//! scans from its [`ScanSource`] and pushes them into the stream's queue. The
//! reader is the queue's only writer.

use crate::data::sample_queue::SampleQueue;
use crate::error::{AppResult, DaqError};
use crate::stream::StreamSpec;
use crate::sync::StopFlag;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// A device that delivers interleaved int16 scans.
pub trait ScanSource: Send {
    /// Up to `max_scans` whole scans; an empty vector means none ready yet.
    fn read_scans(&mut self, max_scans: usize) -> AppResult<Vec<i16>>;
}

/// Parameters of the synthetic generator.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    /// Peak amplitude of uniform noise on every channel.
    pub noise: i16,
    /// Channels that carry periodic negative spikes.
    pub spike_chans: Vec<usize>,
    /// Seconds between spikes.
    pub spike_period_secs: f64,
    /// Spike depth, applied as a negative deflection.
    pub spike_amp: i16,
    /// Scans each spike lasts.
    pub spike_width: usize,
    /// Square wave `(channel, period_secs, high_value)`.
    pub ttl: Option<(usize, f64, i16)>,
    /// Noise generator seed.
    pub seed: u64,
    /// Deliver scans no faster than the sample rate.
    pub paced: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            noise: 5,
            spike_chans: Vec::new(),
            spike_period_secs: 0.5,
            spike_amp: 300,
            spike_width: 8,
            ttl: None,
            seed: 0,
            paced: true,
        }
    }
}

/// Noise, spikes and an optional TTL line, generated on demand.
pub struct SyntheticSource {
    spec: StreamSpec,
    cfg: SyntheticConfig,
    rng: StdRng,
    ct: u64,
    started: Option<Instant>,
}

impl std::fmt::Debug for SyntheticSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticSource")
            .field("stream", &self.spec.id)
            .field("ct", &self.ct)
            .finish()
    }
}

impl SyntheticSource {
    /// Generator for `spec`; rejects channels the stream does not have.
    pub fn new(spec: StreamSpec, cfg: SyntheticConfig) -> AppResult<Self> {
        if let Some(&c) = cfg.spike_chans.iter().find(|&&c| c >= spec.n_chans) {
            return Err(DaqError::Configuration(format!("{}: spike channel {} out of range", spec.id, c)));
        }
        if let Some((c, period, _)) = cfg.ttl {
            if c >= spec.n_chans || !(period > 0.0) {
                return Err(DaqError::Configuration(format!("{}: bad TTL channel or period", spec.id)));
            }
        }
        Ok(Self {
            rng: StdRng::seed_from_u64(cfg.seed),
            spec,
            cfg,
            ct: 0,
            started: None,
        })
    }

    /// Scans generated so far.
    pub fn scan_count(&self) -> u64 {
        self.ct
    }

    fn sample(&mut self, ct: u64, chan: usize) -> i16 {
        let srate = self.spec.sample_rate;
        let mut v = if self.cfg.noise > 0 {
            self.rng.gen_range(-self.cfg.noise..=self.cfg.noise)
        } else {
            0
        };
        if self.cfg.spike_chans.contains(&chan) {
            let period = ((self.cfg.spike_period_secs * srate) as u64).max(1);
            if ct % period < self.cfg.spike_width as u64 {
                v = v.saturating_sub(self.cfg.spike_amp);
            }
        }
        if let Some((c, period_secs, high)) = self.cfg.ttl {
            if c == chan {
                let period = ((period_secs * srate) as u64).max(2);
                v = if ct % period >= period / 2 { high } else { 0 };
            }
        }
        v
    }
}

impl ScanSource for SyntheticSource {
    fn read_scans(&mut self, max_scans: usize) -> AppResult<Vec<i16>> {
        let n = if self.cfg.paced {
            let start = *self.started.get_or_insert_with(Instant::now);
            let due = (start.elapsed().as_secs_f64() * self.spec.sample_rate) as u64;
            (due.saturating_sub(self.ct) as usize).min(max_scans)
        } else {
            max_scans
        };

        let nc = self.spec.n_chans;
        let mut out = Vec::with_capacity(n * nc);
        for i in 0..n as u64 {
            let ct = self.ct + i;
            for chan in 0..nc {
                let v = self.sample(ct, chan);
                out.push(v);
            }
        }
        self.ct += n as u64;
        Ok(out)
    }
}

/// Thread that moves scans from a source into a queue.
pub struct StreamReader {
    queue: Arc<SampleQueue>,
    stop: StopFlag,
    scans: Arc<AtomicU64>,
    failure: Arc<Mutex<Option<String>>>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("stream", &self.queue.spec().id)
            .field("scans", &self.scan_count())
            .finish()
    }
}

impl StreamReader {
    /// Start reading; each read asks for about `chunk_ms` worth of scans.
    pub fn start(queue: Arc<SampleQueue>, mut source: Box<dyn ScanSource>, chunk_ms: u64) -> AppResult<Self> {
        let stop = StopFlag::new();
        let scans = Arc::new(AtomicU64::new(0));
        let failure = Arc::new(Mutex::new(None));
        let chunk = ((queue.sample_rate() * chunk_ms as f64 / 1000.0) as usize).max(1);
        let id = queue.spec().id;

        let span = info_span!("reader", stream = %id);
        let thread = {
            let queue = Arc::clone(&queue);
            let stop = stop.clone();
            let scans = Arc::clone(&scans);
            let failure = Arc::clone(&failure);
            thread::Builder::new()
                .name(format!("reader-{}", id))
                .spawn(move || {
                    let _span = span.enter();
                    let idle = Duration::from_millis(chunk_ms.clamp(1, 5));
                    while !stop.is_stopped() {
                        match source.read_scans(chunk) {
                            Ok(data) if data.is_empty() => {
                                stop.sleep(idle);
                            }
                            Ok(data) => {
                                let n = queue.push(&data);
                                scans.fetch_add(n as u64, Ordering::Relaxed);
                            }
                            Err(e) => {
                                warn!(stream = %id, error = %e, "Stream read failed");
                                *failure.lock() = Some(e.to_string());
                                break;
                            }
                        }
                    }
                    debug!(stream = %id, "Reader stopped");
                })
                .map_err(|e| DaqError::Thread(format!("spawn reader {}: {}", id, e)))?
        };
        info!(stream = %id, chunk, "Reader started");

        Ok(Self {
            queue,
            stop,
            scans,
            failure,
            thread: Some(thread),
        })
    }

    /// The queue this reader fills.
    pub fn queue(&self) -> &Arc<SampleQueue> {
        &self.queue
    }

    /// Scans pushed so far.
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    /// Why the reader quit on its own, if it did.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Stop and join the reader thread.
    pub fn stop(&mut self) {
        self.stop.stop();
        if let Some(h) = self.thread.take() {
            if let Err(e) = h.join() {
                error!("Reader thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> StreamSpec {
        StreamSpec::nidq(1000.0, 3, 1)
    }

    #[test]
    fn unpaced_source_makes_spikes_and_ttl() {
        let cfg = SyntheticConfig {
            noise: 0,
            spike_chans: vec![0],
            spike_period_secs: 0.1,
            spike_width: 2,
            ttl: Some((2, 0.02, 1000)),
            paced: false,
            ..Default::default()
        };
        let mut src = SyntheticSource::new(spec(), cfg).unwrap();
        let data = src.read_scans(200).unwrap();
        assert_eq!(data.len(), 600);
        assert_eq!(data[0], -300);
        assert_eq!(data[3 * 2], 0);
        assert_eq!(data[3 * 100], -300);
        assert_eq!(data[3 * 9 + 2], 0);
        assert_eq!(data[3 * 10 + 2], 1000);
        assert_eq!(src.scan_count(), 200);
    }

    #[test]
    fn bad_channels_are_rejected() {
        let cfg = SyntheticConfig {
            spike_chans: vec![3],
            ..Default::default()
        };
        assert!(SyntheticSource::new(spec(), cfg).is_err());
    }

    #[test]
    fn reader_pushes_into_queue() {
        let q = Arc::new(SampleQueue::new(spec(), 2.0).unwrap());
        let src = SyntheticSource::new(spec(), SyntheticConfig::default()).unwrap();
        let mut r = StreamReader::start(Arc::clone(&q), Box::new(src), 5).unwrap();
        thread::sleep(Duration::from_millis(100));
        r.stop();
        assert!(q.head_ct() > 0);
        assert_eq!(q.head_ct(), r.scan_count());
    }

    struct Broken;
    impl ScanSource for Broken {
        fn read_scans(&mut self, _: usize) -> AppResult<Vec<i16>> {
            Err(DaqError::Io(std::io::Error::other("device gone")))
        }
    }

    #[test]
    fn reader_records_failure() {
        let q = Arc::new(SampleQueue::new(spec(), 1.0).unwrap());
        let mut r = StreamReader::start(q, Box::new(Broken), 5).unwrap();
        for _ in 0..200 {
            if r.failure().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(r.failure().unwrap().contains("device gone"));
        r.stop();
    }
}
