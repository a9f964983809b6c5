//! Spike-edge triggering.
//!
//! One neural channel is high-pass filtered and searched for a negative-going
//! crossing held for `inarow` samples. Each accepted edge is mapped through
//! process time onto every other stream, and a symmetric window of
//! `peri_evt_secs` on either side of the edge is written for all of them:
//!
//! ```text
//!            edge
//!   |<-peri->|<-peri->|
//!   nextCt = edge - peri, remaining = 2 * peri + 1
//! ```
//!
//! An edge is never accepted so early that its pre-event window, plus a
//! fetch latency margin, would predate the gate rise or the oldest queued
//! scan. After each window the search skips a refractory interval.

use super::{TriggerCore, TriggerPolicy, WindowStart};
use crate::config::SpikeConfig;
use crate::data::edge::{EdgeFilter, EdgeScanner, Polarity};
use crate::data::sample_queue::SampleQueue;
use crate::error::{AppResult, DaqError};
use crate::stream::{StreamId, StreamRegistry};
use crate::timing::MapError;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Smallest refractory advance, in scans.
const MIN_REFRACT_CTS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SeekEdge,
    Writing,
    Done,
}

/// Search position on the trigger stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Search {
    /// Trigger-stream counter of the gate rise.
    gate_ct: u64,
    /// Where the next search starts.
    edge_ct: u64,
    /// An edge found on the trigger stream that is not yet mappable everywhere.
    pending: Option<u64>,
}

/// Writes a symmetric window around each accepted spike.
pub struct SpikePolicy {
    cfg: SpikeConfig,
    stream: StreamId,
    scanner: EdgeScanner,
    state: State,
    search: Option<Search>,
    n_spikes: u64,
}

impl std::fmt::Debug for SpikePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpikePolicy")
            .field("stream", &self.stream)
            .field("chan", &self.cfg.channel)
            .field("state", &self.state)
            .field("search", &self.search)
            .field("n_spikes", &self.n_spikes)
            .finish()
    }
}

impl SpikePolicy {
    /// Policy on `cfg.stream`; the channel must be neural.
    pub fn new(cfg: &SpikeConfig, streams: &StreamRegistry) -> AppResult<Self> {
        let q = streams.require(cfg.stream)?;
        let spec = q.spec();
        let filter = EdgeFilter::for_channel(spec, cfg.channel, cfg.transient_width)?.ok_or_else(|| {
            DaqError::Configuration(format!(
                "spike channel {} is not a neural channel of {}",
                cfg.channel, cfg.stream
            ))
        })?;
        let thresh = spec.volts_to_int(cfg.threshold_volts, cfg.channel);
        debug!(stream = %cfg.stream, chan = cfg.channel, thresh, "Spike trigger threshold");
        Ok(Self {
            cfg: cfg.clone(),
            stream: cfg.stream,
            scanner: EdgeScanner::new(cfg.channel, thresh, cfg.inarow, Polarity::Falling, Some(filter)),
            state: State::SeekEdge,
            search: None,
            n_spikes: 0,
        })
    }

    /// Spikes accepted since the last re-initialization.
    pub fn spike_count(&self) -> u64 {
        self.n_spikes
    }

    fn init_state(&mut self, core: &mut TriggerCore) -> AppResult<()> {
        core.end_trigger()?;
        self.scanner.reset();
        self.search = None;
        self.n_spikes = 0;
        self.state = State::SeekEdge;
        Ok(())
    }

    fn peri_cts(&self, q: &SampleQueue) -> u64 {
        q.time_index().secs_to_cts(self.cfg.peri_evt_secs)
    }

    fn refract_cts(&self, q: &SampleQueue) -> u64 {
        q.time_index().secs_to_cts(self.cfg.refract_secs).max(MIN_REFRACT_CTS)
    }

    /// Earliest acceptable edge on the trigger stream.
    fn min_edge_ct(&self, q: &SampleQueue, gate_ct: u64) -> u64 {
        let latency = q.time_index().secs_to_cts(self.cfg.latency_secs);
        q.tail_ct().max(gate_ct) + self.peri_cts(q) + latency
    }

    /// Map an edge on the trigger stream onto every stream.
    ///
    /// `Err` means "not yet": some stream has not buffered the edge time, or
    /// the mapping does not round-trip within tolerance.
    fn align(&self, core: &TriggerCore, q: &SampleQueue, edge_ct: u64) -> Result<Vec<(StreamId, u64)>, MapError> {
        let edge_t = q.time_index().ct_to_time(edge_ct);
        let mut out = Vec::with_capacity(core.streams().len());
        for other in core.streams().iter() {
            let id = other.spec().id;
            if id == self.stream {
                out.push((id, edge_ct));
                continue;
            }
            let ct = other.map_time_to_ct(edge_t)?;
            let back = other.map_ct_to_time(ct)?;
            let tol = self.cfg.max_skew_periods * other.time_index().period();
            if (back - edge_t).abs() > tol {
                debug!(stream = %id, skew = back - edge_t, "Edge does not align within tolerance");
                return Err(MapError::AfterQueue);
            }
            out.push((id, ct));
        }
        Ok(out)
    }

    fn seek(&mut self, core: &mut TriggerCore, q: &SampleQueue, mut s: Search) -> AppResult<()> {
        let min_ct = self.min_edge_ct(q, s.gate_ct);
        if s.edge_ct < min_ct {
            self.scanner.reset();
            s.edge_ct = min_ct;
            if s.pending.is_some_and(|e| e < min_ct) {
                s.pending = None;
            }
        }

        let edge = match s.pending {
            Some(e) => e,
            None => match q.find_edge(&mut self.scanner, s.edge_ct) {
                Ok(e) => e,
                Err(resume) => {
                    s.edge_ct = resume;
                    self.search = Some(s);
                    return Ok(());
                }
            },
        };

        let edges = match self.align(core, q, edge) {
            Ok(v) => v,
            Err(MapError::BeforeQueue) => {
                // Another stream already dropped this span; look past it.
                debug!(edge, "Edge unmappable on a peer stream, skipping");
                s.pending = None;
                s.edge_ct = edge + 1;
                self.search = Some(s);
                return Ok(());
            }
            Err(e) => {
                trace!(edge, error = %e, "Edge not aligned yet");
                s.pending = Some(edge);
                self.search = Some(s);
                return Ok(());
            }
        };

        s.pending = None;
        s.edge_ct = edge;
        self.search = Some(s);
        core.blink();

        let streams = core.streams().clone();
        let peri_secs = self.cfg.peri_evt_secs;
        let used = core.new_trigger(|id| {
            let peri = streams.get(id).map_or(0, |sq| sq.time_index().secs_to_cts(peri_secs));
            let edge_x = edges.iter().find(|(x, _)| *x == id).map_or(0, |(_, ct)| *ct);
            WindowStart {
                first_ct: edge_x.saturating_sub(peri),
                remaining: Some(2 * peri + 1),
            }
        })?;
        info!(edge, g = used.g, t = used.t, n = self.n_spikes, "Spike edge accepted");
        self.state = State::Writing;
        Ok(())
    }

    fn write(&mut self, core: &mut TriggerCore, q: &SampleQueue) -> AppResult<()> {
        core.xfer_all()?;
        if !core.pool().all_done() {
            return Ok(());
        }

        core.end_trigger()?;
        self.scanner.reset();
        let refract = self.refract_cts(q);
        if let Some(s) = self.search.as_mut() {
            s.edge_ct += refract;
        }
        self.n_spikes += 1;
        if !self.cfg.n_infinite && self.n_spikes >= self.cfg.n_events {
            info!(n = self.n_spikes, "Spike trigger done");
            self.state = State::Done;
            core.set_recording_enabled(false)?;
        } else {
            self.state = State::SeekEdge;
        }
        Ok(())
    }
}

impl TriggerPolicy for SpikePolicy {
    fn name(&self) -> &'static str {
        "spike"
    }

    fn on_gate_change(&mut self, core: &mut TriggerCore, hi: bool) -> AppResult<()> {
        if hi {
            self.init_state(core)?;
        }
        Ok(())
    }

    fn reset(&mut self, core: &mut TriggerCore) -> AppResult<()> {
        self.init_state(core)
    }

    fn tick(&mut self, core: &mut TriggerCore) -> AppResult<()> {
        let q: Arc<SampleQueue> = Arc::clone(core.streams().require(self.stream)?);

        if self.search.is_none() {
            match core.map_time(self.stream, core.gate_hi_time()) {
                Ok(gate_ct) => {
                    self.scanner.reset();
                    self.search = Some(Search {
                        gate_ct,
                        edge_ct: gate_ct,
                        pending: None,
                    });
                }
                Err(e) => {
                    trace!(error = %e, "Gate start not mappable yet");
                    return Ok(());
                }
            }
        }

        if self.state == State::SeekEdge {
            if let Some(s) = self.search {
                self.seek(core, &q, s)?;
            }
        }
        if self.state == State::Writing {
            self.write(core, &q)?;
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.state == State::Done
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::data::storage::MemoryStorage;
    use crate::stream::StreamSpec;

    /// 10 kHz probe, 2 neural channels + sync; spikes on channel 0.
    fn spec() -> StreamSpec {
        StreamSpec::imec(0, 10_000.0).with_channels(3, 2)
    }

    fn cfg(n_events: u64) -> SpikeConfig {
        SpikeConfig {
            stream: StreamId::Imec(0),
            channel: 0,
            threshold_volts: -100e-6,
            inarow: 2,
            peri_evt_secs: 0.01,
            refract_secs: 0.1,
            n_events,
            n_infinite: false,
            latency_secs: 0.0,
            transient_width: 50,
            max_skew_periods: 1.0,
        }
    }

    /// Push `n` scans with a deep negative spike starting at each listed counter.
    fn push_spikes(q: &SampleQueue, n: usize, spikes: &[u64]) {
        let base = q.head_ct();
        let nc = q.channel_count();
        let mut data = vec![0i16; n * nc];
        for s in 0..n {
            let ct = base + s as u64;
            if spikes.iter().any(|&k| ct >= k && ct < k + 5) {
                data[s * nc] = -400;
            }
        }
        q.push(&data);
    }

    fn tick_until_done(p: &mut SpikePolicy, core: &mut TriggerCore, ticks: usize) {
        for _ in 0..ticks {
            if p.is_done() {
                break;
            }
            p.tick(core).unwrap();
        }
    }

    #[test]
    fn writes_symmetric_window_on_every_stream() {
        let reg = registry(vec![spec(), StreamSpec::nidq(5_000.0, 2, 0)], 2.0);
        let mem = MemoryStorage::new();
        let mut core = core(&reg, &mem);
        let mut p = SpikePolicy::new(&cfg(1), &reg).unwrap();
        let q = Arc::clone(&reg.imec()[0]);

        push_spikes(&q, 5000, &[3000]);
        reg.nidq().unwrap().push(&vec![0; 2500 * 2]);

        core.apply_gate(true, 0.0);
        p.on_gate_change(&mut core, true).unwrap();
        tick_until_done(&mut p, &mut core, 4);

        assert!(p.is_done());
        assert!(!core.is_recording_enabled());
        let im = &mem.segments_for(StreamId::Imec(0))[0];
        assert_eq!(im.n_scans(), 201);
        assert!((2899..=2901).contains(&im.info.first_ct), "{}", im.info.first_ct);
        let ni = &mem.segments_for(StreamId::Nidq)[0];
        assert_eq!(ni.n_scans(), 101);
        assert!((1449..=1451).contains(&ni.info.first_ct), "{}", ni.info.first_ct);
    }

    #[test]
    fn edges_before_min_ct_are_ignored() {
        let reg = registry(vec![spec()], 2.0);
        let mem = MemoryStorage::new();
        let mut core = core(&reg, &mem);
        let mut c = cfg(1);
        c.latency_secs = 0.01;
        let mut p = SpikePolicy::new(&c, &reg).unwrap();
        let q = Arc::clone(&reg.imec()[0]);

        // gate at scan 1000; min = 1000 + 100 + 100
        push_spikes(&q, 5000, &[1100, 4000]);
        core.apply_gate(true, 0.1);
        p.on_gate_change(&mut core, true).unwrap();
        tick_until_done(&mut p, &mut core, 4);

        let seg = &mem.segments()[0];
        assert!(seg.info.first_ct + 100 >= 1200);
        assert!((3899..=3901).contains(&seg.info.first_ct));
    }

    #[test]
    fn refractory_interval_separates_edges() {
        let reg = registry(vec![spec()], 2.0);
        let mem = MemoryStorage::new();
        let mut core = core(&reg, &mem);
        let mut p = SpikePolicy::new(&cfg(2), &reg).unwrap();
        let q = Arc::clone(&reg.imec()[0]);

        push_spikes(&q, 8000, &[2000, 2500, 4000]);
        core.apply_gate(true, 0.0);
        p.on_gate_change(&mut core, true).unwrap();
        tick_until_done(&mut p, &mut core, 6);

        let starts: Vec<u64> = mem.segments().iter().map(|s| s.info.first_ct + 100).collect();
        assert_eq!(starts.len(), 2);
        assert!(starts[1] >= starts[0] + 1000, "{starts:?}");
        assert!((3999..=4001).contains(&starts[1]));
    }

    #[test]
    fn waits_for_peer_stream_to_buffer_edge_time() {
        let reg = registry(vec![spec(), StreamSpec::nidq(5_000.0, 2, 0)], 2.0);
        let mem = MemoryStorage::new();
        let mut core = core(&reg, &mem);
        let mut p = SpikePolicy::new(&cfg(1), &reg).unwrap();
        let q = Arc::clone(&reg.imec()[0]);
        let ni = Arc::clone(reg.nidq().unwrap());

        push_spikes(&q, 5000, &[3000]);
        ni.push(&vec![0; 1000 * 2]);
        core.apply_gate(true, 0.0);
        p.on_gate_change(&mut core, true).unwrap();
        p.tick(&mut core).unwrap();
        assert!(!core.segment_open(), "nidq has only 0.2 s");

        ni.push(&vec![0; 1500 * 2]);
        tick_until_done(&mut p, &mut core, 4);
        assert!(p.is_done());
        assert_eq!(mem.segments().len(), 2);
    }

    #[test]
    fn gate_low_pauses_without_reset() {
        let reg = registry(vec![spec()], 2.0);
        let mem = MemoryStorage::new();
        let mut core = core(&reg, &mem);
        let mut p = SpikePolicy::new(&cfg(3), &reg).unwrap();
        let q = Arc::clone(&reg.imec()[0]);

        push_spikes(&q, 5000, &[1000]);
        core.apply_gate(true, 0.0);
        p.on_gate_change(&mut core, true).unwrap();
        p.tick(&mut core).unwrap();
        assert_eq!(p.spike_count(), 1);

        core.apply_gate(false, 0.5);
        p.on_gate_change(&mut core, false).unwrap();
        assert_eq!(p.spike_count(), 1);

        core.apply_gate(true, 0.6);
        p.on_gate_change(&mut core, true).unwrap();
        assert_eq!(p.spike_count(), 0);
    }

    #[test]
    fn rejects_non_neural_channel() {
        let reg = registry(vec![spec()], 1.0);
        let mut c = cfg(1);
        c.channel = 2;
        assert!(SpikePolicy::new(&c, &reg).is_err());
    }
}
