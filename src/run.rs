//! Run controller: owns every thread and queue of one acquisition.
//!
//! Start order is queues, readers, trigger, gate, graph fetcher. Stop order
//! is the reverse of what depends on what: graph fetcher, gate (it drives the
//! trigger), trigger (its writers read the queues), readers, and only then
//! the queues themselves.

use crate::acquire::{ScanSource, StreamReader};
use crate::config::Settings;
use crate::data::sample_queue::SampleQueue;
use crate::data::storage::{SegmentStorage, SegmentSummary};
use crate::display::{GraphData, GraphFetcher};
use crate::error::{AppResult, DaqError};
use crate::gate::GateController;
use crate::remote::{self, FetchReply, FetchRequest};
use crate::stream::{StreamId, StreamRegistry};
use crate::trigger::{build_policy, Counters, DisplayEvent, Trigger, TriggerCore, TriggerExit, TriggerHandle, WriteStats};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Reader chunk period.
const READ_CHUNK_MS: u64 = 10;

/// Optional consumers of run output.
#[derive(Debug, Default)]
pub struct RunChannels {
    /// Receives display data while the fetcher runs.
    pub graph: Option<mpsc::Sender<GraphData>>,
    /// Receives trigger blinks and status lines.
    pub events: Option<mpsc::Sender<DisplayEvent>>,
}

/// One running acquisition.
pub struct Run {
    settings: Settings,
    streams: StreamRegistry,
    readers: Vec<StreamReader>,
    trigger: Option<Trigger>,
    handle: TriggerHandle,
    gate: Option<GateController>,
    fetcher: Option<GraphFetcher>,
    running: bool,
    failure: Option<String>,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("run_name", &self.settings.run.run_name)
            .field("streams", &self.streams.ids())
            .field("running", &self.running)
            .field("failure", &self.failure)
            .finish()
    }
}

impl Run {
    /// Validate `settings` and start every component.
    ///
    /// `sources` must hold one source per configured stream.
    pub fn start(
        settings: Settings,
        storage: Arc<dyn SegmentStorage>,
        mut sources: HashMap<StreamId, Box<dyn ScanSource>>,
        channels: RunChannels,
    ) -> AppResult<Self> {
        settings.validate()?;
        info!(run = %settings.run.run_name, "Acquisition starting up ...");

        // Queues
        let mut streams = StreamRegistry::new();
        for spec in settings.stream_specs()? {
            streams.insert(Arc::new(SampleQueue::new(spec, settings.run.queue_secs)?))?;
        }

        // Readers
        let mut readers = Vec::with_capacity(streams.len());
        for q in streams.iter() {
            let id = q.spec().id;
            let source = sources
                .remove(&id)
                .ok_or_else(|| DaqError::Configuration(format!("No source for stream {}", id)))?;
            readers.push(StreamReader::start(Arc::clone(q), source, READ_CHUNK_MS)?);
        }
        if !sources.is_empty() {
            warn!(extra = ?sources.keys().collect::<Vec<_>>(), "Ignoring sources for unconfigured streams");
        }

        // Trigger
        let loop_ms = settings.run.loop_ms;
        let mut core = TriggerCore::new(streams.clone(), storage, settings.run.run_name.clone(), loop_ms)?;
        if let Some(tx) = channels.events {
            core = core.with_events(tx);
        }
        let policy = build_policy(&settings, &streams)?;
        let trigger = Trigger::spawn(core, policy, loop_ms)?;
        let handle = trigger.handle();

        // Gate
        let gate = GateController::start(&settings.gate, &streams, handle.clone(), loop_ms)?;

        // Graphs
        let fetcher = match channels.graph {
            Some(tx) if settings.display.enabled => Some(GraphFetcher::start(&settings.display, &streams, tx)?),
            _ => None,
        };

        info!(
            streams = streams.len(),
            trigger = handle.policy_name(),
            gate = ?gate.mode(),
            "Acquisition running"
        );
        Ok(Self {
            settings,
            streams,
            readers,
            trigger: Some(trigger),
            handle,
            gate: Some(gate),
            fetcher,
            running: true,
            failure: None,
        })
    }

    /// False once stopped or failed.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Settings the run was started with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The first fatal failure, if the run ended on one.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Check for a component that quit on its own; stop the run if so.
    ///
    /// Returns the failure message the first time it is seen.
    pub fn poll(&mut self) -> Option<String> {
        if !self.running {
            return None;
        }
        let mut failed = None;
        if let Some(TriggerExit::Failed(msg)) = self.trigger.as_mut().and_then(Trigger::try_finished) {
            failed = Some(msg);
        } else if let Some(msg) = self.readers.iter().find_map(StreamReader::failure) {
            failed = Some(msg);
        }

        let msg = failed?;
        error!(error = %msg, "Acquisition failed; stopping run");
        self.failure = Some(msg.clone());
        self.stop();
        Some(msg)
    }

    /// Tear everything down. Safe to call more than once.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        if let Some(mut f) = self.fetcher.take() {
            f.stop();
        }
        if let Some(mut g) = self.gate.take() {
            g.stop();
        }
        if let Some(mut t) = self.trigger.take() {
            if let TriggerExit::Failed(msg) = t.stop() {
                if self.failure.is_none() {
                    error!(error = %msg, "Trigger failed");
                    self.failure = Some(msg);
                }
            }
        }
        for r in self.readers.iter_mut() {
            r.stop();
        }
        self.readers.clear();
        self.streams = StreamRegistry::new();
        info!("Acquisition stopped.");
    }

    fn require_running(&self) -> AppResult<()> {
        if self.running {
            Ok(())
        } else {
            Err(DaqError::NotRunning)
        }
    }

    /// Remote gate command.
    pub fn rgt_set_gate(&self, hi: bool) -> AppResult<bool> {
        self.require_running()?;
        match &self.gate {
            Some(g) => g.set_remote(hi),
            None => Err(DaqError::NotRunning),
        }
    }

    /// Remote trigger command.
    pub fn rgt_set_trig(&self, hi: bool) -> AppResult<()> {
        self.require_running()?;
        self.handle.set_remote_trigger(hi)
    }

    /// Operator gate toggle.
    pub fn set_software_gate(&self, hi: bool) -> AppResult<bool> {
        self.require_running()?;
        match &self.gate {
            Some(g) => g.set_software(hi),
            None => Err(DaqError::NotRunning),
        }
    }

    /// Remote data fetch.
    pub fn fetch(&self, req: &FetchRequest) -> AppResult<FetchReply> {
        self.require_running()?;
        remote::fetch(&self.streams, req)
    }

    /// Turn segment writing on or off without touching the gate.
    pub fn set_recording_enabled(&self, on: bool) -> AppResult<()> {
        self.require_running()?;
        self.handle.set_recording_enabled(on)
    }

    /// True while running with writing on.
    pub fn is_recording_enabled(&self) -> bool {
        self.running && self.handle.is_recording_enabled()
    }

    /// Zero the gate and trigger indices.
    pub fn reset_counters(&self) -> AppResult<()> {
        self.require_running()?;
        self.handle.reset_counters()
    }

    /// Set the next gate and trigger indices.
    pub fn force_counters(&self, g: u32, t: u32) -> AppResult<()> {
        self.require_running()?;
        self.handle.force_counters(g, t);
        Ok(())
    }

    /// Current gate and trigger indices.
    pub fn counters(&self) -> Counters {
        self.handle.counters()
    }

    /// Totals written so far.
    pub fn stats(&self) -> WriteStats {
        self.handle.stats()
    }

    /// Segments closed since the last call.
    pub fn take_closed(&self) -> Vec<SegmentSummary> {
        self.handle.take_closed()
    }

    /// Pause or resume the display feed.
    pub fn graph_pause(&self, paused: bool) {
        if let Some(f) = &self.fetcher {
            f.hard_pause(paused);
        }
    }

    /// The queue for `id`, while running.
    pub fn queue(&self, id: StreamId) -> Option<Arc<SampleQueue>> {
        self.streams.get(id).cloned()
    }

    /// Scans acquired on `id`, or 0 when not running.
    pub fn scan_count(&self, id: StreamId) -> u64 {
        self.streams.get(id).map_or(0, |q| q.head_ct())
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        self.stop();
    }
}
