//! CLI entry point for probe-daq.
//!
//! Provides:
//! - `simulate`: run a full acquisition against synthetic sources and write
//!   the triggered segments to disk
//! - `check-config`: load and validate a configuration, then print it
//!
//! # Usage
//!
//! ```bash
//! probe-daq simulate --config config/probe_daq.toml --secs 10
//! probe-daq check-config --config config/probe_daq.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use probe_daq::acquire::{ScanSource, SyntheticConfig, SyntheticSource};
use probe_daq::config::{GateMode, Settings, TriggerMode};
use probe_daq::data::storage::SegmentSummary;
use probe_daq::data::FileStorage;
use probe_daq::logging;
use probe_daq::stream::{StreamId, StreamSpec};
use probe_daq::trigger::DisplayEvent;
use probe_daq::{Run, RunChannels};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// TTL square-wave period used by the simulator.
const SIM_TTL_PERIOD_SECS: f64 = 1.0;

#[derive(Parser)]
#[command(name = "probe-daq")]
#[command(about = "Multi-probe acquisition core with gated, triggered recording", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire from synthetic sources for a fixed time
    Simulate {
        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Seconds to run
        #[arg(long, default_value = "5")]
        secs: f64,

        /// Output directory (overrides run.output_dir)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Validate a configuration and print the effective settings
    CheckConfig {
        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate { config, secs, out } => {
            let mut settings = load(config)?;
            if let Some(out) = out {
                settings.run.output_dir = out;
            }
            logging::init_from_settings(&settings)?;
            simulate(settings, secs).await
        }
        Commands::CheckConfig { config } => {
            let settings = load(config)?;
            settings.validate()?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            for spec in settings.stream_specs()? {
                println!(
                    "{}: {} Hz, {} chans ({} neural), saving {}",
                    spec.id,
                    spec.sample_rate,
                    spec.n_chans,
                    spec.n_neural,
                    spec.saved_channels().len()
                );
            }
            Ok(())
        }
    }
}

fn load(path: Option<PathBuf>) -> Result<Settings> {
    let settings = match path {
        Some(p) => Settings::load_from(&p).with_context(|| format!("loading {}", p.display()))?,
        None => Settings::load()?,
    };
    Ok(settings)
}

/// Synthetic generator for one stream, shaped so the configured gate and
/// trigger have something to find.
fn source_for(settings: &Settings, spec: &StreamSpec, seed: u64) -> Result<SyntheticSource> {
    let mut cfg = SyntheticConfig {
        seed,
        ..Default::default()
    };
    let spike = &settings.trigger.spike;
    if settings.trigger.mode == TriggerMode::Spike && spike.stream == spec.id {
        cfg.spike_chans.push(spike.channel);
        let depth = spec.volts_to_int(spike.threshold_volts.abs() * 2.0, spike.channel);
        cfg.spike_amp = depth.max(cfg.spike_amp);
    }

    let line = match (settings.gate.mode, settings.trigger.mode) {
        (GateMode::Ttl, _) => Some(&settings.gate.ttl),
        (_, TriggerMode::Ttl) => Some(&settings.trigger.ttl.line),
        _ => None,
    };
    if let Some(line) = line.filter(|l| l.stream == spec.id) {
        let high = spec.volts_to_int(line.threshold_volts * 2.0, line.channel);
        cfg.ttl = Some((line.channel, SIM_TTL_PERIOD_SECS, high));
    }
    Ok(SyntheticSource::new(spec.clone(), cfg)?)
}

fn print_segment(seg: &SegmentSummary) {
    println!(
        "{}: first_ct={} scans={} bytes={}",
        seg.key.stem(),
        seg.first_ct,
        seg.n_scans,
        seg.bytes
    );
}

async fn simulate(settings: Settings, secs: f64) -> Result<()> {
    settings.validate()?;
    let mut sources: HashMap<StreamId, Box<dyn ScanSource>> = HashMap::new();
    for (i, spec) in settings.stream_specs()?.iter().enumerate() {
        sources.insert(spec.id, Box::new(source_for(&settings, spec, i as u64)?));
    }

    let storage = Arc::new(FileStorage::new(&settings.run.output_dir));
    let (ev_tx, mut ev_rx) = mpsc::channel(256);
    let channels = RunChannels {
        graph: None,
        events: Some(ev_tx),
    };
    let gate_mode = settings.gate.mode;
    let trigger_mode = settings.trigger.mode;
    let mut run = Run::start(settings, storage, sources, channels)?;

    match gate_mode {
        GateMode::Software => {
            run.set_software_gate(true)?;
        }
        GateMode::Remote => {
            run.rgt_set_gate(true)?;
        }
        GateMode::Immediate | GateMode::Ttl => {}
    }
    if trigger_mode == TriggerMode::RemoteTrigger {
        run.rgt_set_trig(true)?;
    }

    let deadline = Instant::now() + Duration::from_secs_f64(secs.max(0.0));
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    while Instant::now() < deadline {
        tick.tick().await;
        while let Ok(ev) = ev_rx.try_recv() {
            match ev {
                DisplayEvent::Status(s) => info!("{}", s),
                DisplayEvent::Blink => debug!("trigger"),
            }
        }
        if let Some(err) = run.poll() {
            warn!(error = %err, "Run ended early");
            break;
        }
        if trigger_mode == TriggerMode::RemoteTrigger && run.is_running() {
            // Alternate remote trigger pulses once a second.
            let hi = deadline.saturating_duration_since(Instant::now()).as_secs() % 2 == 0;
            if let Err(e) = run.rgt_set_trig(hi) {
                debug!(error = %e, "Remote trigger ignored");
            }
        }
        run.take_closed().iter().for_each(print_segment);
    }

    run.stop();
    run.take_closed().iter().for_each(print_segment);
    let stats = run.stats();
    println!(
        "segments opened={} closed={} bytes={}",
        stats.segments_opened, stats.segments_closed, stats.bytes
    );
    match run.failure() {
        Some(msg) => anyhow::bail!("run failed: {}", msg),
        None => Ok(()),
    }
}
