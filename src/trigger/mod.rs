//! Gate/trigger state machines that decide what gets recorded.
//!
//! One trigger thread runs per acquisition. Every `loop_ms` it locks the shared
//! state and, if recording is enabled and the gate is high, lets the active
//! [`TriggerPolicy`] advance: search for the next window, open segments, write
//! whatever data has arrived, close segments when windows complete. Gate
//! changes and operator commands arrive from other threads through a
//! [`TriggerHandle`] and take the same lock.
//!
//! Transient conditions (no new data, a time that is not yet buffered) are
//! absorbed by the policies and retried next tick. A storage failure ends the
//! thread; the reason is delivered once through the exit channel.

pub mod immediate;
pub mod remote;
pub mod spike;
pub mod timed;
pub mod ttl;
pub mod writer;

use crate::config::{Settings, TriggerMode};
use crate::data::storage::{SegmentKey, SegmentStorage, SegmentSummary};
use crate::error::{AppResult, DaqError};
use crate::stream::{StreamId, StreamRegistry};
use crate::sync::StopFlag;
use crate::timing::{now_secs, MapError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use writer::{WindowStart, WriterPool};

pub use immediate::ImmediatePolicy;
pub use remote::RemoteTriggerPolicy;
pub use spike::SpikePolicy;
pub use timed::TimedPolicy;
pub use ttl::TtlPolicy;

/// Default trigger loop period.
pub const LOOP_MS: u64 = 100;

/// Seconds between status reports.
pub const STATUS_SECS: f64 = 0.25;

/// Fire-and-forget notifications for the display.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEvent {
    /// A trigger was accepted.
    Blink,
    /// Periodic human-readable status.
    Status(String),
}

/// Why the trigger thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerExit {
    /// Asked to stop.
    Stopped,
    /// Quit on a fatal error.
    Failed(String),
}

/// Gate and trigger indices for the next segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    /// Gate index.
    pub g: u32,
    /// Trigger index within the gate.
    pub t: u32,
}

/// Totals across the run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WriteStats {
    /// Segments opened across all streams.
    pub segments_opened: u64,
    /// Segments closed across all streams.
    pub segments_closed: u64,
    /// Bytes written across all streams.
    pub bytes: u64,
}

/// Policy-independent trigger state: gate, counters, writers, notifications.
pub struct TriggerCore {
    streams: StreamRegistry,
    storage: Arc<dyn SegmentStorage>,
    run_name: String,
    pool: WriterPool,
    gate_hi: bool,
    gate_hi_t: f64,
    gate_lo_t: f64,
    counters: Counters,
    /// The next gate-high keeps the current `g` instead of advancing it.
    fresh_g: bool,
    recording: bool,
    events: Option<mpsc::Sender<DisplayEvent>>,
    stats: WriteStats,
    status_t: f64,
    rate_t: f64,
    rate_bytes: u64,
    failure: Option<DaqError>,
    closed: Vec<SegmentSummary>,
}

impl std::fmt::Debug for TriggerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerCore")
            .field("gate_hi", &self.gate_hi)
            .field("counters", &self.counters)
            .field("recording", &self.recording)
            .field("stats", &self.stats)
            .finish()
    }
}

impl TriggerCore {
    /// Core over `streams`, writing through `storage` under `run_name`.
    pub fn new(
        streams: StreamRegistry,
        storage: Arc<dyn SegmentStorage>,
        run_name: impl Into<String>,
        loop_ms: u64,
    ) -> AppResult<Self> {
        if streams.is_empty() {
            return Err(DaqError::Configuration("Trigger needs at least one stream".into()));
        }
        let pool = WriterPool::new(&streams, loop_ms)?;
        let now = now_secs();
        Ok(Self {
            streams,
            storage,
            run_name: run_name.into(),
            pool,
            gate_hi: false,
            gate_hi_t: 0.0,
            gate_lo_t: 0.0,
            counters: Counters::default(),
            fresh_g: true,
            recording: true,
            events: None,
            stats: WriteStats::default(),
            status_t: now,
            rate_t: now,
            rate_bytes: 0,
            failure: None,
            closed: Vec::new(),
        })
    }

    /// Send blink/status notifications to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<DisplayEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Streams of this run.
    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    /// The writer pool.
    pub fn pool(&self) -> &WriterPool {
        &self.pool
    }

    /// Current gate level.
    pub fn is_gate_high(&self) -> bool {
        self.gate_hi
    }

    /// Process time of the latest gate rise.
    pub fn gate_hi_time(&self) -> f64 {
        self.gate_hi_t
    }

    /// Process time of the latest gate fall.
    pub fn gate_lo_time(&self) -> f64 {
        self.gate_lo_t
    }

    /// Indices the next segment will use.
    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Totals written so far.
    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    /// True unless writing was switched off.
    pub fn is_recording_enabled(&self) -> bool {
        self.recording
    }

    /// Record a gate edge at time `t`. Returns `false` if the level did not change.
    fn apply_gate(&mut self, hi: bool, t: f64) -> bool {
        if hi == self.gate_hi {
            return false;
        }
        self.gate_hi = hi;
        if hi {
            self.gate_hi_t = t;
            if self.fresh_g {
                self.fresh_g = false;
            } else {
                self.counters.g += 1;
                self.counters.t = 0;
            }
        } else {
            self.gate_lo_t = t;
        }
        info!(hi, g = self.counters.g, t = self.counters.t, "Gate changed");
        true
    }

    fn reset_counters_base(&mut self) {
        self.counters = Counters::default();
        self.fresh_g = true;
    }

    fn force_counters_base(&mut self, g: u32, t: u32) {
        self.counters = Counters { g, t };
        self.fresh_g = true;
    }

    /// Counter on `id` at process time `t`, clamping to the oldest resident scan.
    ///
    /// Fails transiently if `t` is not buffered yet.
    pub fn map_time(&self, id: StreamId, t: f64) -> Result<u64, MapError> {
        match self.streams.get(id) {
            Some(q) => q.map_time_to_ct_clamped(t),
            None => Err(MapError::Empty),
        }
    }

    /// Counter on `id` at time `t` even if not buffered yet.
    pub fn project_time(&self, id: StreamId, t: f64) -> u64 {
        self.streams
            .get(id)
            .map(|q| q.time_index().time_to_ct(t))
            .unwrap_or(0)
    }

    /// Map `t` onto every stream; all must succeed.
    pub fn map_time_all(&self, t: f64) -> Result<Vec<(StreamId, u64)>, MapError> {
        self.streams
            .iter()
            .map(|q| q.map_time_to_ct_clamped(t).map(|ct| (q.spec().id, ct)))
            .collect()
    }

    fn key(&self, id: StreamId) -> SegmentKey {
        SegmentKey {
            run: self.run_name.clone(),
            stream: id,
            g: self.counters.g,
            t: self.counters.t,
        }
    }

    /// Open one segment per stream with per-stream windows; advances `t`.
    pub fn new_trigger<F>(&mut self, start: F) -> AppResult<Counters>
    where
        F: Fn(StreamId) -> WindowStart,
    {
        if self.pool.any_open() {
            self.end_trigger()?;
        }
        let used = self.counters;
        self.pool
            .open_all(self.storage.as_ref(), |id| self.key(id), |w| start(w.id()))?;
        self.stats.segments_opened += self.pool.len() as u64;
        self.counters.t += 1;
        info!(g = used.g, t = used.t, "Opened trigger segments");
        Ok(used)
    }

    /// Close all open segments.
    pub fn end_trigger(&mut self) -> AppResult<()> {
        let closed = self.pool.close_all()?;
        if !closed.is_empty() {
            debug!(n = closed.len(), "Closed trigger segments");
        }
        self.stats.segments_closed += closed.len() as u64;
        self.closed.extend(closed);
        Ok(())
    }

    /// True while any stream has a segment open.
    pub fn segment_open(&self) -> bool {
        self.pool.any_open()
    }

    /// One synchronized write cycle across every stream.
    pub fn xfer_all(&mut self) -> AppResult<()> {
        self.pool.xfer_all()?;
        let b = self.pool.take_bytes();
        self.stats.bytes += b;
        self.rate_bytes += b;
        Ok(())
    }

    /// Bound every open window so it ends at process time `t`.
    pub fn limit_all_at(&self, t: f64) -> AppResult<()> {
        let streams = &self.streams;
        self.pool.for_each(|w| {
            if w.is_open() {
                let end = streams.get(w.id()).map(|q| q.time_index().time_to_ct(t)).unwrap_or(0);
                w.limit_to(end);
            }
            Ok(())
        })
    }

    /// Write what is resident up to time `t`, then close.
    pub fn finish_at(&mut self, t: f64) -> AppResult<()> {
        if !self.segment_open() {
            return Ok(());
        }
        self.limit_all_at(t)?;
        self.xfer_all()?;
        self.end_trigger()
    }

    /// Summaries of segments closed so far; drained on read.
    pub fn take_closed(&mut self) -> Vec<SegmentSummary> {
        std::mem::take(&mut self.closed)
    }

    /// Turn recording on or off. Turning it off closes open segments.
    pub fn set_recording_enabled(&mut self, on: bool) -> AppResult<()> {
        if self.recording == on {
            return Ok(());
        }
        self.recording = on;
        info!(on, "Recording enabled changed");
        if !on {
            self.end_trigger()?;
        }
        Ok(())
    }

    /// Notify the display that a trigger fired.
    pub fn blink(&self) {
        self.notify(DisplayEvent::Blink);
    }

    fn notify(&self, ev: DisplayEvent) {
        if let Some(tx) = &self.events {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(ev) {
                debug!("Display event dropped (channel full)");
            }
        }
    }

    fn status(&mut self, loop_t: f64, policy: &str) {
        if loop_t - self.status_t <= STATUS_SECS {
            return;
        }
        let dt = (loop_t - self.rate_t).max(1e-6);
        let mbps = self.rate_bytes as f64 / dt / (1024.0 * 1024.0);
        let on = if self.gate_hi {
            format!("ON {:.1}s", loop_t - self.gate_hi_t)
        } else {
            "OFF".to_string()
        };
        let msg = format!(
            "{} {} <g{},t{}> WR {:.2} MB/s",
            policy, on, self.counters.g, self.counters.t, mbps
        );
        self.notify(DisplayEvent::Status(msg));
        self.status_t = loop_t;
        self.rate_t = loop_t;
        self.rate_bytes = 0;
    }

    fn fail(&mut self, e: DaqError) {
        if self.failure.is_none() {
            self.failure = Some(e);
        }
    }
}

/// One trigger variant's decision logic.
pub trait TriggerPolicy: Send {
    /// Short name for logs and status lines.
    fn name(&self) -> &'static str;

    /// Called after the gate level changed.
    fn on_gate_change(&mut self, core: &mut TriggerCore, hi: bool) -> AppResult<()>;

    /// Re-initialize search state; counters were already reset.
    fn reset(&mut self, core: &mut TriggerCore) -> AppResult<()>;

    /// Advance while the gate is high and recording is enabled.
    fn tick(&mut self, core: &mut TriggerCore) -> AppResult<()>;

    /// A remote trigger edge at time `t`.
    fn remote_trigger(&mut self, _core: &mut TriggerCore, _hi: bool, _t: f64) -> AppResult<()> {
        Err(DaqError::NotSupported(format!("{} trigger has no remote trigger", self.name())))
    }

    /// No further windows will be written.
    fn is_done(&self) -> bool {
        false
    }
}

struct Shared {
    core: TriggerCore,
    policy: Box<dyn TriggerPolicy>,
}

/// Thread-safe control surface onto a running trigger.
#[derive(Clone)]
pub struct TriggerHandle {
    shared: Arc<Mutex<Shared>>,
}

impl std::fmt::Debug for TriggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerHandle").finish_non_exhaustive()
    }
}

impl TriggerHandle {
    /// Gate edge now.
    pub fn set_gate(&self, hi: bool) {
        self.set_gate_at(hi, now_secs());
    }

    /// Gate edge at process time `t`.
    pub fn set_gate_at(&self, hi: bool, t: f64) {
        let mut s = self.shared.lock();
        let Shared { core, policy } = &mut *s;
        if core.apply_gate(hi, t) {
            if let Err(e) = policy.on_gate_change(core, hi) {
                warn!(error = %e, "Gate change failed");
                core.fail(e);
            }
        }
    }

    /// Current gate level as the trigger sees it.
    pub fn is_gate_high(&self) -> bool {
        self.shared.lock().core.is_gate_high()
    }

    /// Process time of the latest gate rise.
    pub fn gate_hi_time(&self) -> f64 {
        self.shared.lock().core.gate_hi_time()
    }

    /// Zero `g` and `t` and restart the policy's search.
    pub fn reset_counters(&self) -> AppResult<()> {
        let mut s = self.shared.lock();
        let Shared { core, policy } = &mut *s;
        core.reset_counters_base();
        policy.reset(core)
    }

    /// Set the indices used by the next segment.
    pub fn force_counters(&self, g: u32, t: u32) {
        self.shared.lock().core.force_counters_base(g, t);
    }

    /// Indices the next segment will use.
    pub fn counters(&self) -> Counters {
        self.shared.lock().core.counters()
    }

    /// Totals written so far.
    pub fn stats(&self) -> WriteStats {
        self.shared.lock().core.stats()
    }

    /// Turn segment writing on or off.
    pub fn set_recording_enabled(&self, on: bool) -> AppResult<()> {
        self.shared.lock().core.set_recording_enabled(on)
    }

    /// True unless writing was switched off.
    pub fn is_recording_enabled(&self) -> bool {
        self.shared.lock().core.is_recording_enabled()
    }

    /// Remote trigger edge now.
    pub fn set_remote_trigger(&self, hi: bool) -> AppResult<()> {
        let mut s = self.shared.lock();
        let Shared { core, policy } = &mut *s;
        policy.remote_trigger(core, hi, now_secs())
    }

    /// Segments closed since the last call.
    pub fn take_closed(&self) -> Vec<SegmentSummary> {
        self.shared.lock().core.take_closed()
    }

    /// Name of the running policy.
    pub fn policy_name(&self) -> &'static str {
        self.shared.lock().policy.name()
    }

    /// True once the policy has recorded everything it was asked to.
    pub fn is_done(&self) -> bool {
        self.shared.lock().policy.is_done()
    }
}

/// The trigger thread.
pub struct Trigger {
    handle: TriggerHandle,
    stop: StopFlag,
    thread: Option<JoinHandle<()>>,
    exit: Option<oneshot::Receiver<TriggerExit>>,
    result: Option<TriggerExit>,
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("running", &self.thread.is_some())
            .field("result", &self.result)
            .finish()
    }
}

impl Trigger {
    /// Start the trigger thread.
    pub fn spawn(core: TriggerCore, policy: Box<dyn TriggerPolicy>, loop_ms: u64) -> AppResult<Self> {
        let name = policy.name();
        let shared = Arc::new(Mutex::new(Shared { core, policy }));
        let stop = StopFlag::new();
        let (tx, rx) = oneshot::channel();

        let thread = {
            let shared = Arc::clone(&shared);
            let stop = stop.clone();
            thread::Builder::new()
                .name("trigger".into())
                .spawn(move || {
                    let exit = run_loop(&shared, &stop, loop_ms);
                    let _ = tx.send(exit);
                })
                .map_err(|e| DaqError::Thread(format!("spawn trigger: {}", e)))?
        };
        info!(policy = name, loop_ms, "Trigger thread started");

        Ok(Self {
            handle: TriggerHandle { shared },
            stop,
            thread: Some(thread),
            exit: Some(rx),
            result: None,
        })
    }

    /// A control handle; clones share the same trigger.
    pub fn handle(&self) -> TriggerHandle {
        self.handle.clone()
    }

    /// The exit reason, if the thread has finished on its own.
    pub fn try_finished(&mut self) -> Option<TriggerExit> {
        if self.result.is_none() {
            if let Some(rx) = self.exit.as_mut() {
                match rx.try_recv() {
                    Ok(exit) => self.result = Some(exit),
                    Err(oneshot::error::TryRecvError::Empty) => {}
                    Err(oneshot::error::TryRecvError::Closed) => {
                        self.result = Some(TriggerExit::Failed("trigger thread vanished".into()))
                    }
                }
            }
        }
        self.result.clone()
    }

    /// Stop the loop, close any open segments and join the thread.
    pub fn stop(&mut self) -> TriggerExit {
        self.stop.stop();
        if let Some(h) = self.thread.take() {
            if let Err(e) = h.join() {
                error!("Trigger thread panicked: {:?}", e);
                self.result = Some(TriggerExit::Failed("trigger thread panicked".into()));
            }
        }
        self.try_finished().unwrap_or(TriggerExit::Stopped)
    }

    /// True while the thread has not exited.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

fn run_loop(shared: &Mutex<Shared>, stop: &StopFlag, loop_ms: u64) -> TriggerExit {
    let period = Duration::from_millis(loop_ms);
    let mut exit = TriggerExit::Stopped;

    while !stop.is_stopped() {
        let loop_t = now_secs();
        {
            let mut s = shared.lock();
            let Shared { core, policy } = &mut *s;

            if let Some(e) = core.failure.take() {
                exit = TriggerExit::Failed(e.to_string());
                break;
            }

            let active = core.recording && core.gate_hi && !policy.is_done();
            if active {
                if let Err(e) = policy.tick(core) {
                    exit = TriggerExit::Failed(e.to_string());
                    break;
                }
            }
            let name = policy.name();
            core.status(loop_t, name);
        }

        let spent = Duration::from_secs_f64((now_secs() - loop_t).max(0.0));
        if let Some(rest) = period.checked_sub(spent) {
            stop.sleep(rest);
        }
    }

    // Close whatever is still open; a failure here only matters if none came first.
    let mut s = shared.lock();
    if let Err(e) = s.core.end_trigger() {
        if exit == TriggerExit::Stopped {
            exit = TriggerExit::Failed(e.to_string());
        } else {
            warn!(error = %e, "Closing segments after failure also failed");
        }
    }
    s.core.pool.shutdown();
    info!(?exit, "Trigger thread stopped");
    exit
}

/// Build the policy selected in `settings`.
pub fn build_policy(settings: &Settings, streams: &StreamRegistry) -> AppResult<Box<dyn TriggerPolicy>> {
    Ok(match settings.trigger.mode {
        TriggerMode::Immediate | TriggerMode::RemoteGate => Box::new(ImmediatePolicy::new()),
        TriggerMode::Timed => Box::new(TimedPolicy::new(settings.trigger.timed.clone())),
        TriggerMode::Ttl => Box::new(TtlPolicy::new(&settings.trigger.ttl, streams)?),
        TriggerMode::Spike => Box::new(SpikePolicy::new(&settings.trigger.spike, streams)?),
        TriggerMode::RemoteTrigger => Box::new(RemoteTriggerPolicy::new()),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::data::sample_queue::SampleQueue;
    use crate::data::storage::MemoryStorage;
    use crate::stream::StreamSpec;

    /// Registry of queues with origin 0 so times equal `ct / srate`.
    pub fn registry(specs: Vec<StreamSpec>, secs: f64) -> StreamRegistry {
        let mut reg = StreamRegistry::new();
        for spec in specs {
            reg.insert(Arc::new(SampleQueue::with_origin(spec, secs, 0.0).unwrap())).unwrap();
        }
        reg
    }

    pub fn core(reg: &StreamRegistry, mem: &MemoryStorage) -> TriggerCore {
        TriggerCore::new(reg.clone(), Arc::new(mem.clone()), "test", 8).unwrap()
    }

    /// Push `n` zero scans into every queue.
    pub fn push_zeros(reg: &StreamRegistry, secs: f64) {
        for q in reg.iter() {
            let n = (secs * q.sample_rate()).round() as usize;
            q.push(&vec![0; n * q.channel_count()]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::data::storage::MemoryStorage;
    use crate::stream::StreamSpec;

    #[test]
    fn gate_counters_follow_epochs() {
        let reg = registry(vec![StreamSpec::nidq(1000.0, 1, 0)], 1.0);
        let mem = MemoryStorage::new();
        let mut core = core(&reg, &mem);

        assert!(core.apply_gate(true, 0.1));
        assert_eq!(core.counters(), Counters { g: 0, t: 0 });
        assert!(!core.apply_gate(true, 0.2), "same level is ignored");
        core.counters.t = 3;
        core.apply_gate(false, 0.3);
        core.apply_gate(true, 0.4);
        assert_eq!(core.counters(), Counters { g: 1, t: 0 });

        core.force_counters_base(7, 2);
        core.apply_gate(false, 0.5);
        core.apply_gate(true, 0.6);
        assert_eq!(core.counters(), Counters { g: 7, t: 2 });

        core.reset_counters_base();
        assert_eq!(core.counters(), Counters::default());
    }

    #[test]
    fn new_trigger_opens_one_segment_per_stream_and_advances_t() {
        let reg = registry(
            vec![StreamSpec::imec(0, 1000.0).with_channels(2, 1), StreamSpec::nidq(500.0, 1, 0)],
            1.0,
        );
        let mem = MemoryStorage::new();
        let mut core = core(&reg, &mem);
        let used = core
            .new_trigger(|_| WindowStart {
                first_ct: 0,
                remaining: Some(1),
            })
            .unwrap();
        assert_eq!(used, Counters { g: 0, t: 0 });
        assert_eq!(core.counters().t, 1);
        assert_eq!(mem.segments().len(), 2);

        core.end_trigger().unwrap();
        assert!(!core.segment_open());
        assert_eq!(core.take_closed().len(), 2);
        assert_eq!(core.stats().segments_closed, 2);
    }

    #[test]
    fn disabling_recording_closes_segments() {
        let reg = registry(vec![StreamSpec::nidq(1000.0, 1, 0)], 1.0);
        let mem = MemoryStorage::new();
        let mut core = core(&reg, &mem);
        core.new_trigger(|_| WindowStart {
            first_ct: 0,
            remaining: None,
        })
        .unwrap();
        core.set_recording_enabled(false).unwrap();
        assert!(!core.segment_open());
        assert!(mem.segments()[0].closed);
    }

    #[test]
    fn status_is_sent_through_events() {
        let reg = registry(vec![StreamSpec::nidq(1000.0, 1, 0)], 1.0);
        let mem = MemoryStorage::new();
        let (tx, mut rx) = mpsc::channel(4);
        let mut core = core(&reg, &mem).with_events(tx);
        core.blink();
        let t = core.status_t + 1.0;
        core.status(t, "immediate");
        assert_eq!(rx.try_recv().unwrap(), DisplayEvent::Blink);
        match rx.try_recv().unwrap() {
            DisplayEvent::Status(s) => assert!(s.contains("<g0,t0>"), "{s}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn trigger_thread_stops_cleanly() {
        let reg = registry(vec![StreamSpec::nidq(1000.0, 1, 0)], 1.0);
        let mem = MemoryStorage::new();
        let mut trig = Trigger::spawn(core(&reg, &mem), Box::new(ImmediatePolicy::new()), 10).unwrap();
        assert!(trig.is_running());
        assert_eq!(trig.stop(), TriggerExit::Stopped);
        assert!(!trig.is_running());
    }
}
