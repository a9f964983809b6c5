//! Segments bounded by remote trigger commands.
//!
//! A rising remote trigger opens segments at the mapped trigger time; a
//! falling one bounds them at the mapped release time and they close once
//! written up to it.

use super::{TriggerCore, TriggerPolicy, WindowStart};
use crate::error::AppResult;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Idle,
    /// Raised but the start time is not buffered everywhere yet.
    Pending { hi_t: f64, lo_t: Option<f64> },
    Writing { lo_t: Option<f64> },
}

/// Writes while a remote client holds the trigger line high.
#[derive(Debug)]
pub struct RemoteTriggerPolicy {
    state: State,
}

impl Default for RemoteTriggerPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteTriggerPolicy {
    /// Idle until the first remote pulse.
    pub fn new() -> Self {
        Self { state: State::Idle }
    }
}

impl TriggerPolicy for RemoteTriggerPolicy {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn on_gate_change(&mut self, core: &mut TriggerCore, hi: bool) -> AppResult<()> {
        if !hi {
            let t = core.gate_lo_time();
            core.finish_at(t)?;
            self.state = State::Idle;
        }
        Ok(())
    }

    fn reset(&mut self, core: &mut TriggerCore) -> AppResult<()> {
        core.end_trigger()?;
        self.state = State::Idle;
        Ok(())
    }

    fn remote_trigger(&mut self, core: &mut TriggerCore, hi: bool, t: f64) -> AppResult<()> {
        self.state = match (self.state, hi) {
            (State::Idle, true) => {
                debug!(t, "Remote trigger high");
                State::Pending { hi_t: t, lo_t: None }
            }
            (State::Pending { hi_t, .. }, false) => State::Pending { hi_t, lo_t: Some(t) },
            (State::Writing { lo_t: None }, false) => {
                debug!(t, "Remote trigger low");
                core.limit_all_at(t)?;
                State::Writing { lo_t: Some(t) }
            }
            (s, _) => {
                trace!(hi, "Remote trigger level unchanged");
                s
            }
        };
        Ok(())
    }

    fn tick(&mut self, core: &mut TriggerCore) -> AppResult<()> {
        if let State::Pending { hi_t, lo_t } = self.state {
            let starts = match core.map_time_all(hi_t) {
                Ok(v) => v,
                Err(e) => {
                    trace!(error = %e, "Trigger start not mappable yet");
                    return Ok(());
                }
            };
            core.new_trigger(|id| WindowStart {
                first_ct: starts.iter().find(|(s, _)| *s == id).map_or(0, |(_, ct)| *ct),
                remaining: None,
            })?;
            core.blink();
            if let Some(t) = lo_t {
                core.limit_all_at(t)?;
            }
            self.state = State::Writing { lo_t };
        }

        if let State::Writing { lo_t } = self.state {
            core.xfer_all()?;
            if lo_t.is_some() && core.pool().all_done() {
                core.end_trigger()?;
                info!("Remote trigger segment complete");
                self.state = State::Idle;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::data::storage::MemoryStorage;
    use crate::stream::StreamSpec;

    #[test]
    fn trigger_high_low_bounds_one_segment() {
        let reg = registry(vec![StreamSpec::nidq(1000.0, 1, 0)], 10.0);
        let mem = MemoryStorage::new();
        let mut core = core(&reg, &mem);
        let mut p = RemoteTriggerPolicy::new();
        core.apply_gate(true, 0.0);

        p.remote_trigger(&mut core, true, 0.5).unwrap();
        push_zeros(&reg, 0.4);
        p.tick(&mut core).unwrap();
        assert!(!core.segment_open());

        push_zeros(&reg, 0.3);
        p.tick(&mut core).unwrap();
        assert!(core.segment_open());

        p.remote_trigger(&mut core, false, 0.9).unwrap();
        push_zeros(&reg, 0.5);
        p.tick(&mut core).unwrap();
        assert!(!core.segment_open());

        let seg = &mem.segments()[0];
        assert_eq!(seg.info.first_ct, 500);
        assert_eq!(seg.n_scans(), 400);
        assert!(seg.closed);
    }

    #[test]
    fn low_before_start_is_buffered() {
        let reg = registry(vec![StreamSpec::nidq(1000.0, 1, 0)], 10.0);
        let mem = MemoryStorage::new();
        let mut core = core(&reg, &mem);
        let mut p = RemoteTriggerPolicy::new();
        core.apply_gate(true, 0.0);

        p.remote_trigger(&mut core, true, 0.1).unwrap();
        p.remote_trigger(&mut core, false, 0.2).unwrap();
        push_zeros(&reg, 1.0);
        p.tick(&mut core).unwrap();

        let seg = &mem.segments()[0];
        assert_eq!(seg.n_scans(), 100);
        assert!(seg.closed);
    }
}
