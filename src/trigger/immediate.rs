//! Record everything while the gate is high.

use super::{TriggerCore, TriggerPolicy, WindowStart};
use crate::error::AppResult;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Gate is high but the epoch's start is not mapped yet.
    Start,
    Writing,
}

/// One open-ended segment per gate epoch.
///
/// Also serves the remote gate, which differs only in where gate edges come
/// from.
#[derive(Debug)]
pub struct ImmediatePolicy {
    state: State,
}

impl Default for ImmediatePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ImmediatePolicy {
    /// A policy that has not opened anything yet.
    pub fn new() -> Self {
        Self { state: State::Start }
    }
}

impl TriggerPolicy for ImmediatePolicy {
    fn name(&self) -> &'static str {
        "immediate"
    }

    fn on_gate_change(&mut self, core: &mut TriggerCore, hi: bool) -> AppResult<()> {
        if !hi {
            let t = core.gate_lo_time();
            core.finish_at(t)?;
        }
        self.state = State::Start;
        Ok(())
    }

    fn reset(&mut self, core: &mut TriggerCore) -> AppResult<()> {
        core.end_trigger()?;
        self.state = State::Start;
        Ok(())
    }

    fn tick(&mut self, core: &mut TriggerCore) -> AppResult<()> {
        if self.state == State::Start {
            let starts = match core.map_time_all(core.gate_hi_time()) {
                Ok(v) => v,
                Err(e) => {
                    trace!(error = %e, "Gate start not mappable yet");
                    return Ok(());
                }
            };
            debug!(?starts, "Gate start mapped");
            core.new_trigger(|id| WindowStart {
                first_ct: starts.iter().find(|(s, _)| *s == id).map_or(0, |(_, ct)| *ct),
                remaining: None,
            })?;
            self.state = State::Writing;
        }
        core.xfer_all()
    }
}
