//! The gate: an on/off signal that enables the trigger.
//!
//! Exactly one source drives it per run, chosen by [`GateMode`]. Repeated
//! levels are dropped here, so the trigger only ever sees real transitions.
//! The TTL source runs its own thread scanning a raw analog line for
//! alternating rising and falling edges; each edge's time is taken from the
//! scan counter, not from when the edge was noticed.

use crate::config::{GateConfig, GateMode};
use crate::data::edge::{EdgeScanner, Polarity};
use crate::error::{AppResult, DaqError};
use crate::stream::StreamRegistry;
use crate::sync::StopFlag;
use crate::timing::now_secs;
use crate::trigger::TriggerHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug)]
struct GateSignal {
    level: AtomicBool,
    trigger: TriggerHandle,
}

impl GateSignal {
    /// Forward a level change at time `t`. Returns `false` for a repeat.
    fn set(&self, hi: bool, t: f64) -> bool {
        if self.level.swap(hi, Ordering::SeqCst) == hi {
            return false;
        }
        self.trigger.set_gate_at(hi, t);
        true
    }
}

/// Owner of the run's gate source.
#[derive(Debug)]
pub struct GateController {
    mode: GateMode,
    signal: Arc<GateSignal>,
    stop: StopFlag,
    thread: Option<JoinHandle<()>>,
}

impl GateController {
    /// Start the configured source. The immediate gate goes high at once.
    pub fn start(cfg: &GateConfig, streams: &StreamRegistry, trigger: TriggerHandle, loop_ms: u64) -> AppResult<Self> {
        let signal = Arc::new(GateSignal {
            level: AtomicBool::new(false),
            trigger,
        });
        let stop = StopFlag::new();
        let mut thread = None;

        match cfg.mode {
            GateMode::Immediate => {
                signal.set(true, now_secs());
            }
            GateMode::Software | GateMode::Remote => {}
            GateMode::Ttl => {
                let line = &cfg.ttl;
                let q = Arc::clone(streams.require(line.stream)?);
                let thresh = q.spec().volts_to_int(line.threshold_volts, line.channel);
                let scanner = EdgeScanner::new(line.channel, thresh, line.inarow, Polarity::Rising, None);
                let from = q.head_ct();
                let signal = Arc::clone(&signal);
                let stop = stop.clone();
                let period = Duration::from_millis(loop_ms);
                thread = Some(
                    thread::Builder::new()
                        .name("gate-ttl".into())
                        .spawn(move || ttl_loop(&q, scanner, from, &signal, &stop, period))
                        .map_err(|e| DaqError::Thread(format!("spawn gate: {}", e)))?,
                );
            }
        }
        info!(mode = ?cfg.mode, "Gate started");

        Ok(Self {
            mode: cfg.mode,
            signal,
            stop,
            thread,
        })
    }

    /// Source driving the gate.
    pub fn mode(&self) -> GateMode {
        self.mode
    }

    /// Current level.
    pub fn is_high(&self) -> bool {
        self.signal.level.load(Ordering::SeqCst)
    }

    /// Operator toggle; only valid for the software gate.
    pub fn set_software(&self, hi: bool) -> AppResult<bool> {
        self.set_from(GateMode::Software, hi)
    }

    /// Remote command; only valid for the remote gate.
    pub fn set_remote(&self, hi: bool) -> AppResult<bool> {
        self.set_from(GateMode::Remote, hi)
    }

    fn set_from(&self, source: GateMode, hi: bool) -> AppResult<bool> {
        if self.mode != source {
            return Err(DaqError::NotSupported(format!(
                "gate is {:?}, not {:?}",
                self.mode, source
            )));
        }
        Ok(self.signal.set(hi, now_secs()))
    }

    /// Stop the source thread, if any. The level is left as it is.
    pub fn stop(&mut self) {
        self.stop.stop();
        if let Some(h) = self.thread.take() {
            if let Err(e) = h.join() {
                error!("Gate thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for GateController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ttl_loop(
    q: &crate::data::sample_queue::SampleQueue,
    mut scanner: EdgeScanner,
    mut from: u64,
    signal: &GateSignal,
    stop: &StopFlag,
    period: Duration,
) {
    debug!(stream = %q.spec().id, from, "TTL gate scanning");
    while !stop.is_stopped() {
        match q.find_edge(&mut scanner, from) {
            Ok(edge) => {
                let hi = scanner.polarity() == Polarity::Rising;
                signal.set(hi, q.time_index().ct_to_time(edge));
                scanner.set_polarity(scanner.polarity().flip());
                from = edge + 1;
            }
            Err(resume) => {
                from = resume;
                stop.sleep(period);
            }
        }
    }
    debug!("TTL gate stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TtlLineConfig;
    use crate::data::sample_queue::SampleQueue;
    use crate::data::storage::MemoryStorage;
    use crate::stream::{StreamId, StreamSpec};
    use crate::trigger::{ImmediatePolicy, Trigger, TriggerCore};
    use std::time::Instant;

    fn trigger(reg: &StreamRegistry) -> Trigger {
        let core = TriggerCore::new(reg.clone(), Arc::new(MemoryStorage::new()), "g", 10).unwrap();
        Trigger::spawn(core, Box::new(ImmediatePolicy::new()), 10).unwrap()
    }

    fn registry() -> StreamRegistry {
        let mut reg = StreamRegistry::new();
        let q = SampleQueue::with_origin(StreamSpec::nidq(1000.0, 1, 0), 5.0, 0.0).unwrap();
        reg.insert(Arc::new(q)).unwrap();
        reg
    }

    #[test]
    fn software_gate_debounces_and_checks_source() {
        let reg = registry();
        let mut trig = trigger(&reg);
        let gate = GateController::start(
            &GateConfig {
                mode: GateMode::Software,
                ..Default::default()
            },
            &reg,
            trig.handle(),
            10,
        )
        .unwrap();

        assert!(!gate.is_high());
        assert!(gate.set_software(true).unwrap());
        assert!(!gate.set_software(true).unwrap());
        assert!(trig.handle().is_gate_high());
        assert!(gate.set_remote(false).is_err());
        trig.stop();
    }

    #[test]
    fn immediate_gate_starts_high() {
        let reg = registry();
        let mut trig = trigger(&reg);
        let gate = GateController::start(&GateConfig::default(), &reg, trig.handle(), 10).unwrap();
        assert!(gate.is_high());
        assert!(trig.handle().is_gate_high());
        trig.stop();
    }

    #[test]
    fn ttl_gate_follows_line() {
        let reg = registry();
        let mut trig = trigger(&reg);
        let cfg = GateConfig {
            mode: GateMode::Ttl,
            ttl: TtlLineConfig {
                stream: StreamId::Nidq,
                channel: 0,
                threshold_volts: 1.0,
                inarow: 3,
            },
        };
        let mut gate = GateController::start(&cfg, &reg, trig.handle(), 5).unwrap();
        let q = Arc::clone(reg.nidq().unwrap());

        q.push(&[0; 100]);
        q.push(&[20_000; 100]);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !gate.is_high() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(gate.is_high());

        q.push(&[0; 100]);
        while gate.is_high() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!gate.is_high());
        gate.stop();
        trig.stop();
    }

    #[test]
    fn ttl_gate_scans_from_start_position() {
        let reg = registry();
        let mut trig = trigger(&reg);
        let q = Arc::clone(reg.nidq().unwrap());
        // A high level buffered before the run is not an edge.
        q.push(&[0; 50]);
        q.push(&[20_000; 50]);

        let cfg = GateConfig {
            mode: GateMode::Ttl,
            ttl: TtlLineConfig {
                stream: StreamId::Nidq,
                channel: 0,
                threshold_volts: 1.0,
                inarow: 3,
            },
        };
        let mut gate = GateController::start(&cfg, &reg, trig.handle(), 1000).unwrap();
        // Pushed before the scanning thread's first pass, which may not have run yet.
        q.push(&[0; 10]);
        q.push(&[20_000; 200]);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !gate.is_high() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(gate.is_high());
        let rise = trig.handle().gate_hi_time();
        assert!((rise - 0.11).abs() < 0.002, "rise at {rise}");
        gate.stop();
        trig.stop();
    }
}
