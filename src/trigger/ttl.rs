//! Trigger on a thresholded analog line.
//!
//! The search runs on raw (unfiltered) samples of one channel looking for a
//! rising crossing held for `inarow` samples. Each accepted edge opens a
//! window that starts `margin` before the edge and ends according to the
//! [`TtlMode`]:
//!
//! - `Latch`: when the gate drops.
//! - `Timed`: after `margin + tH + margin`.
//! - `Follow`: `margin` after the line falls again.
//!
//! The next search starts a refractory interval past the edge (and past the
//! falling edge in follow mode).

use super::{TriggerCore, TriggerPolicy, WindowStart};
use crate::config::{TtlMode, TtlTriggerConfig};
use crate::data::edge::{EdgeScanner, Polarity};
use crate::data::sample_queue::SampleQueue;
use crate::error::AppResult;
use crate::stream::{StreamId, StreamRegistry};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Smallest refractory advance, in scans.
const MIN_REFRACT_CTS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the gate start to be mapped onto the line's stream.
    Init,
    Seek { from_ct: u64 },
    Writing { edge_ct: u64, fall: FallSearch },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FallSearch {
    /// Window end is already fixed.
    NotNeeded,
    Seeking { from_ct: u64 },
    Found { fall_ct: u64 },
}

/// Writes around rising edges on a thresholded line.
pub struct TtlPolicy {
    cfg: TtlTriggerConfig,
    stream: StreamId,
    scanner: EdgeScanner,
    state: State,
    n_events: u64,
}

impl std::fmt::Debug for TtlPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlPolicy")
            .field("stream", &self.stream)
            .field("mode", &self.cfg.mode)
            .field("state", &self.state)
            .field("n_events", &self.n_events)
            .finish()
    }
}

impl TtlPolicy {
    /// Policy watching `cfg.line`.
    pub fn new(cfg: &TtlTriggerConfig, streams: &StreamRegistry) -> AppResult<Self> {
        let line = &cfg.line;
        let q = streams.require(line.stream)?;
        let thresh = q.spec().volts_to_int(line.threshold_volts, line.channel);
        debug!(stream = %line.stream, chan = line.channel, thresh, "TTL trigger threshold");
        Ok(Self {
            cfg: cfg.clone(),
            stream: line.stream,
            scanner: EdgeScanner::new(line.channel, thresh, line.inarow, Polarity::Rising, None),
            state: State::Init,
            n_events: 0,
        })
    }

    fn init_state(&mut self, core: &mut TriggerCore) -> AppResult<()> {
        core.end_trigger()?;
        self.scanner.set_polarity(Polarity::Rising);
        self.scanner.reset();
        self.n_events = 0;
        self.state = State::Init;
        Ok(())
    }

    fn queue(&self, core: &TriggerCore) -> AppResult<Arc<SampleQueue>> {
        Ok(Arc::clone(core.streams().require(self.stream)?))
    }

    fn refract_cts(&self, q: &SampleQueue) -> u64 {
        q.time_index().secs_to_cts(self.cfg.refract_secs).max(MIN_REFRACT_CTS)
    }

    /// Open the window for an edge at `edge_ct` on the line's stream.
    fn start_window(&mut self, core: &mut TriggerCore, q: &SampleQueue, edge_ct: u64) -> AppResult<()> {
        let edge_t = q.time_index().ct_to_time(edge_ct);
        let start_t = edge_t - self.cfg.margin_secs;
        let span = match self.cfg.mode {
            TtlMode::Timed => Some(2.0 * self.cfg.margin_secs + self.cfg.th_secs),
            TtlMode::Latch | TtlMode::Follow => None,
        };
        let streams = core.streams().clone();
        core.new_trigger(|id| {
            let Some(sq) = streams.get(id) else {
                return WindowStart {
                    first_ct: 0,
                    remaining: Some(0),
                };
            };
            let ti = sq.time_index();
            WindowStart {
                first_ct: ti.time_to_ct(start_t).max(sq.tail_ct()),
                remaining: span.map(|s| ti.secs_to_cts(s)),
            }
        })?;
        core.blink();
        info!(edge_ct, n = self.n_events, "TTL edge accepted");

        let fall = if self.cfg.mode == TtlMode::Follow {
            self.scanner.set_polarity(Polarity::Falling);
            FallSearch::Seeking { from_ct: edge_ct + 1 }
        } else {
            FallSearch::NotNeeded
        };
        self.state = State::Writing { edge_ct, fall };
        Ok(())
    }

    fn finish_event(&mut self, core: &mut TriggerCore, q: &SampleQueue, edge_ct: u64, fall: FallSearch) -> AppResult<()> {
        core.end_trigger()?;
        self.n_events += 1;
        if !self.cfg.n_infinite && self.n_events >= self.cfg.n_events {
            info!(n = self.n_events, "TTL trigger done");
            self.state = State::Done;
            return core.set_recording_enabled(false);
        }
        let mut next = edge_ct + self.refract_cts(q);
        if let FallSearch::Found { fall_ct } = fall {
            next = next.max(fall_ct + 1);
        }
        self.scanner.set_polarity(Polarity::Rising);
        self.state = State::Seek { from_ct: next };
        Ok(())
    }
}

impl TriggerPolicy for TtlPolicy {
    fn name(&self) -> &'static str {
        "ttl"
    }

    fn on_gate_change(&mut self, core: &mut TriggerCore, hi: bool) -> AppResult<()> {
        if hi {
            self.init_state(core)
        } else {
            let t = core.gate_lo_time();
            core.finish_at(t)?;
            if let State::Writing { .. } = self.state {
                self.state = State::Init;
            }
            Ok(())
        }
    }

    fn reset(&mut self, core: &mut TriggerCore) -> AppResult<()> {
        self.init_state(core)
    }

    fn tick(&mut self, core: &mut TriggerCore) -> AppResult<()> {
        let q = self.queue(core)?;

        if self.state == State::Init {
            match core.map_time(self.stream, core.gate_hi_time()) {
                Ok(ct) => self.state = State::Seek { from_ct: ct },
                Err(e) => {
                    trace!(error = %e, "Gate start not mappable yet");
                    return Ok(());
                }
            }
        }

        if let State::Seek { from_ct } = self.state {
            match q.find_edge(&mut self.scanner, from_ct) {
                Ok(edge_ct) => self.start_window(core, &q, edge_ct)?,
                Err(resume) => {
                    self.state = State::Seek { from_ct: resume };
                    return Ok(());
                }
            }
        }

        if let State::Writing { edge_ct, mut fall } = self.state {
            if let FallSearch::Seeking { from_ct } = fall {
                fall = match q.find_edge(&mut self.scanner, from_ct) {
                    Ok(fall_ct) => {
                        let end_t = q.time_index().ct_to_time(fall_ct) + self.cfg.margin_secs;
                        core.limit_all_at(end_t)?;
                        debug!(fall_ct, "TTL falling edge");
                        FallSearch::Found { fall_ct }
                    }
                    Err(resume) => FallSearch::Seeking { from_ct: resume },
                };
                self.state = State::Writing { edge_ct, fall };
            }

            core.xfer_all()?;
            let bounded = !matches!(fall, FallSearch::Seeking { .. }) && self.cfg.mode != TtlMode::Latch;
            if bounded && core.pool().all_done() {
                self.finish_event(core, &q, edge_ct, fall)?;
            }
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
    use crate::config::TtlLineConfig;
    use crate::data::storage::MemoryStorage;
    use crate::stream::StreamSpec;

    const HI: i16 = 20_000;

    fn cfg(mode: TtlMode, n_events: u64) -> TtlTriggerConfig {
        TtlTriggerConfig {
            line: TtlLineConfig {
                stream: StreamId::Nidq,
                channel: 0,
                threshold_volts: 1.0,
                inarow: 3,
            },
            mode,
            margin_secs: 0.01,
            refract_secs: 0.05,
            th_secs: 0.02,
            n_events,
            n_infinite: false,
        }
    }

    /// 1 kHz single-channel line that is high on `[on, off)` scans.
    fn push_pulse(reg: &StreamRegistry, n: usize, pulses: &[(usize, usize)]) {
        let q = reg.nidq().unwrap();
        let base = q.head_ct() as usize;
        let data: Vec<i16> = (base..base + n)
            .map(|ct| if pulses.iter().any(|&(a, b)| ct >= a && ct < b) { HI } else { 0 })
            .collect();
        q.push(&data);
    }

    fn setup(mode: TtlMode, n: u64) -> (StreamRegistry, MemoryStorage, TriggerCore, TtlPolicy) {
        let reg = registry(vec![StreamSpec::nidq(1000.0, 1, 0)], 10.0);
        let mem = MemoryStorage::new();
        let core = core(&reg, &mem);
        let p = TtlPolicy::new(&cfg(mode, n), &reg).unwrap();
        (reg, mem, core, p)
    }

    fn run(p: &mut TtlPolicy, core: &mut TriggerCore, ticks: usize) {
        core.apply_gate(true, 0.0);
        p.on_gate_change(core, true).unwrap();
        for _ in 0..ticks {
            if p.is_done() {
                break;
            }
            p.tick(core).unwrap();
        }
    }

    #[test]
    fn timed_mode_writes_margin_high_margin() {
        let (reg, mem, mut core, mut p) = setup(TtlMode::Timed, 1);
        push_pulse(&reg, 1000, &[(200, 300)]);
        run(&mut p, &mut core, 4);

        assert!(p.is_done());
        let segs = mem.segments();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].info.first_ct, 190);
        assert_eq!(segs[0].n_scans(), 40);
    }

    #[test]
    fn follow_mode_ends_after_falling_edge() {
        let (reg, mem, mut core, mut p) = setup(TtlMode::Follow, 1);
        push_pulse(&reg, 1000, &[(200, 300)]);
        run(&mut p, &mut core, 4);

        assert!(p.is_done());
        let seg = &mem.segments()[0];
        assert_eq!(seg.info.first_ct, 190);
        // falls at 300, plus 10 scans of margin
        assert_eq!(seg.n_scans(), 120);
    }

    #[test]
    fn refractory_skips_close_pulses() {
        let (reg, mem, mut core, mut p) = setup(TtlMode::Timed, 2);
        push_pulse(&reg, 1000, &[(200, 210), (220, 230), (400, 410)]);
        run(&mut p, &mut core, 6);

        let starts: Vec<u64> = mem.segments().iter().map(|s| s.info.first_ct).collect();
        assert_eq!(starts, vec![190, 390]);
    }

    #[test]
    fn latch_mode_closes_on_gate_low() {
        let (reg, mem, mut core, mut p) = setup(TtlMode::Latch, 1);
        push_pulse(&reg, 300, &[(200, 210)]);
        run(&mut p, &mut core, 2);
        assert!(core.segment_open());

        push_pulse(&reg, 300, &[]);
        core.apply_gate(false, 0.5);
        p.on_gate_change(&mut core, false).unwrap();
        let seg = &mem.segments()[0];
        assert!(seg.closed);
        assert_eq!(seg.n_scans(), 500 - 190);
    }
}
