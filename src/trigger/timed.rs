//! Timed high/low cycling after the gate rises.
//!
//! ```text
//! gate hi ──tL0──▶ [ write tH ] ──tL──▶ [ write tH ] ── ... nH times ──▶ Done
//! ```
//!
//! Window starts are process times mapped onto each stream, so every stream's
//! segment covers the same wall-clock span.

use super::{TriggerCore, TriggerPolicy, WindowStart};
use crate::config::TimedConfig;
use crate::error::AppResult;
use tracing::{info, trace};

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    /// Waiting for data at the next high period's start time.
    Low { hi_t: f64 },
    High { hi_t: f64 },
    Done,
}

/// Cycles fixed high and low periods while the gate is high.
#[derive(Debug)]
pub struct TimedPolicy {
    cfg: TimedConfig,
    state: State,
    n_high: u64,
}

impl TimedPolicy {
    /// Policy that starts in its initial low period.
    pub fn new(cfg: TimedConfig) -> Self {
        Self {
            cfg,
            state: State::Low { hi_t: 0.0 },
            n_high: 0,
        }
    }

    fn init_state(&mut self, core: &mut TriggerCore) -> AppResult<()> {
        core.end_trigger()?;
        self.n_high = 0;
        self.state = State::Low {
            hi_t: core.gate_hi_time() + self.cfg.tl0_secs,
        };
        Ok(())
    }

    fn cycles_done(&self) -> bool {
        !self.cfg.n_infinite && self.n_high >= self.cfg.n_high
    }
}

impl TriggerPolicy for TimedPolicy {
    fn name(&self) -> &'static str {
        "timed"
    }

    fn on_gate_change(&mut self, core: &mut TriggerCore, hi: bool) -> AppResult<()> {
        if hi {
            self.init_state(core)
        } else {
            let t = core.gate_lo_time();
            core.finish_at(t)
        }
    }

    fn reset(&mut self, core: &mut TriggerCore) -> AppResult<()> {
        self.init_state(core)
    }

    fn tick(&mut self, core: &mut TriggerCore) -> AppResult<()> {
        if let State::Low { hi_t } = self.state {
            let starts = match core.map_time_all(hi_t) {
                Ok(v) => v,
                Err(e) => {
                    trace!(error = %e, hi_t, "High period not buffered yet");
                    return Ok(());
                }
            };
            let th = self.cfg.th_secs;
            let infinite = self.cfg.h_infinite;
            let streams = core.streams().clone();
            core.new_trigger(|id| WindowStart {
                first_ct: starts.iter().find(|(s, _)| *s == id).map_or(0, |(_, ct)| *ct),
                remaining: if infinite {
                    None
                } else {
                    streams.get(id).map(|q| q.time_index().secs_to_cts(th))
                },
            })?;
            self.state = State::High { hi_t };
        }

        if let State::High { hi_t } = self.state {
            core.xfer_all()?;
            if !self.cfg.h_infinite && core.pool().all_done() {
                core.end_trigger()?;
                self.n_high += 1;
                if self.cycles_done() {
                    info!(n = self.n_high, "Timed trigger done");
                    self.state = State::Done;
                    core.set_recording_enabled(false)?;
                } else {
                    self.state = State::Low {
                        hi_t: hi_t + self.cfg.th_secs + self.cfg.tl_secs,
                    };
                }
            }
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.state == State::Done
    }
}
