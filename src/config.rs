//! Run configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `PROBE_DAQ_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use probe_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/probe_daq.toml")?;
//! settings.validate()?;
//! println!("Run: {}", settings.run.run_name);
//! # Ok::<(), probe_daq::error::DaqError>(())
//! ```
//!
//! Example override: `PROBE_DAQ_TRIGGER__SPIKE__INAROW=5`.

use crate::data::iir_filter::DisplayBand;
use crate::data::subset::parse_channel_pattern;
use crate::error::{AppResult, DaqError};
use crate::logging::OutputFormat;
use crate::stream::{StreamId, StreamSpec, VoltRange};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Logging and application identity.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Naming, output location and loop timing.
    #[serde(default)]
    pub run: RunConfig,
    /// One entry per probe, in probe order.
    #[serde(default)]
    pub imec: Vec<ImecConfig>,
    /// The auxiliary card, if present.
    #[serde(default)]
    pub nidq: Option<NidqConfig>,
    /// Gate source.
    #[serde(default)]
    pub gate: GateConfig,
    /// Trigger policy and its parameters.
    #[serde(default)]
    pub trigger: TriggerConfig,
    /// Live display feed.
    #[serde(default)]
    pub display: DisplayConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name, used in log output.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format.
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Run-wide acquisition parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Base name of every segment file.
    #[serde(default = "default_run_name")]
    pub run_name: String,
    /// Directory segments are written under.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Seconds of data each sample queue retains.
    #[serde(default = "default_queue_secs")]
    pub queue_secs: f64,
    /// Trigger loop period.
    #[serde(default = "default_loop_ms")]
    pub loop_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_name: default_run_name(),
            output_dir: default_output_dir(),
            queue_secs: default_queue_secs(),
            loop_ms: default_loop_ms(),
        }
    }
}

/// One probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImecConfig {
    /// Scans per second.
    #[serde(default = "default_imec_srate")]
    pub sample_rate: f64,
    /// Channels per scan, including the sync channel.
    #[serde(default = "default_imec_n_chans")]
    pub n_chans: usize,
    /// Leading AP-band channels.
    #[serde(default = "default_imec_n_ap")]
    pub n_ap: usize,
    /// Amplifier gain applied before digitizing.
    #[serde(default = "default_imec_gain")]
    pub gain: f64,
    /// Lower end of the digitizer range, volts.
    #[serde(default = "default_imec_vmin")]
    pub volts_min: f64,
    /// Upper end of the digitizer range, volts.
    #[serde(default = "default_imec_vmax")]
    pub volts_max: f64,
    /// Integer value matching `volts_max`.
    #[serde(default = "default_imec_max_int")]
    pub max_int: i32,
    /// Saved-channel pattern; empty saves all.
    #[serde(default)]
    pub save_chans: String,
}

impl Default for ImecConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_imec_srate(),
            n_chans: default_imec_n_chans(),
            n_ap: default_imec_n_ap(),
            gain: default_imec_gain(),
            volts_min: default_imec_vmin(),
            volts_max: default_imec_vmax(),
            max_int: default_imec_max_int(),
            save_chans: String::new(),
        }
    }
}

/// The auxiliary card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NidqConfig {
    /// Acquire from the card at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Scans per second.
    #[serde(default = "default_nidq_srate")]
    pub sample_rate: f64,
    /// Channels per scan.
    #[serde(default = "default_nidq_n_chans")]
    pub n_chans: usize,
    /// Leading channels carrying neural data.
    #[serde(default)]
    pub n_neural: usize,
    /// Amplifier gain applied before digitizing.
    #[serde(default = "default_nidq_gain")]
    pub gain: f64,
    /// Lower end of the digitizer range, volts.
    #[serde(default = "default_nidq_vmin")]
    pub volts_min: f64,
    /// Upper end of the digitizer range, volts.
    #[serde(default = "default_nidq_vmax")]
    pub volts_max: f64,
    /// Integer value matching `volts_max`.
    #[serde(default = "default_nidq_max_int")]
    pub max_int: i32,
    /// Saved-channel pattern; empty saves all.
    #[serde(default)]
    pub save_chans: String,
}

impl Default for NidqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: default_nidq_srate(),
            n_chans: default_nidq_n_chans(),
            n_neural: 0,
            gain: default_nidq_gain(),
            volts_min: default_nidq_vmin(),
            volts_max: default_nidq_vmax(),
            max_int: default_nidq_max_int(),
            save_chans: String::new(),
        }
    }
}

/// Where the gate signal comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// High from run start.
    #[default]
    Immediate,
    /// Toggled by the operator.
    Software,
    /// Follows a thresholded analog line.
    Ttl,
    /// Toggled by remote command.
    Remote,
}

/// Threshold-line parameters shared by the TTL gate and trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlLineConfig {
    /// Stream carrying the line.
    #[serde(default = "default_nidq_id")]
    pub stream: StreamId,
    /// Channel index within the stream.
    #[serde(default)]
    pub channel: usize,
    /// Rising-edge threshold, volts.
    #[serde(default = "default_ttl_thresh")]
    pub threshold_volts: f64,
    /// Samples beyond threshold before an edge counts.
    #[serde(default = "default_ttl_inarow")]
    pub inarow: usize,
}

impl Default for TtlLineConfig {
    fn default() -> Self {
        Self {
            stream: StreamId::Nidq,
            channel: 0,
            threshold_volts: default_ttl_thresh(),
            inarow: default_ttl_inarow(),
        }
    }
}

/// Gate source and its line, when it has one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Which source drives the gate.
    #[serde(default)]
    pub mode: GateMode,
    /// Line used by the TTL gate.
    #[serde(default)]
    pub ttl: TtlLineConfig,
}

/// Trigger policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Write continuously while the gate is high.
    #[default]
    Immediate,
    /// Alternate fixed high and low periods.
    Timed,
    /// Write around edges on a thresholded line.
    Ttl,
    /// Write a window around each spike.
    Spike,
    /// Write while a remote client holds the gate high.
    RemoteGate,
    /// Write while a remote client holds the trigger high.
    RemoteTrigger,
}

/// Timed high/low cycling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedConfig {
    /// Initial low period after gate rise.
    #[serde(default)]
    pub tl0_secs: f64,
    /// Length of each high window.
    #[serde(default = "default_th_secs")]
    pub th_secs: f64,
    /// Write forever once high.
    #[serde(default)]
    pub h_infinite: bool,
    /// Low period between high windows.
    #[serde(default = "default_th_secs")]
    pub tl_secs: f64,
    /// High windows to write before stopping.
    #[serde(default = "default_n_events")]
    pub n_high: u64,
    /// Ignore `n_high` and cycle until the gate drops.
    #[serde(default)]
    pub n_infinite: bool,
}

impl Default for TimedConfig {
    fn default() -> Self {
        Self {
            tl0_secs: 0.0,
            th_secs: default_th_secs(),
            h_infinite: false,
            tl_secs: default_th_secs(),
            n_high: default_n_events(),
            n_infinite: false,
        }
    }
}

/// What a TTL trigger writes once it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlMode {
    /// Until the gate drops.
    #[default]
    Latch,
    /// A fixed high time.
    Timed,
    /// Until the line falls.
    Follow,
}

/// TTL-edge triggering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlTriggerConfig {
    /// The watched line.
    #[serde(flatten)]
    pub line: TtlLineConfig,
    /// How long each triggered segment lasts.
    #[serde(default)]
    pub mode: TtlMode,
    /// Pre-edge data included in each segment.
    #[serde(default = "default_margin_secs")]
    pub margin_secs: f64,
    /// Minimum spacing between accepted edges.
    #[serde(default = "default_refract_secs")]
    pub refract_secs: f64,
    /// High time for the timed mode.
    #[serde(default = "default_th_secs")]
    pub th_secs: f64,
    /// Edges to record before stopping.
    #[serde(default = "default_n_events")]
    pub n_events: u64,
    /// Ignore `n_events` and record every edge.
    #[serde(default)]
    pub n_infinite: bool,
}

impl Default for TtlTriggerConfig {
    fn default() -> Self {
        Self {
            line: TtlLineConfig::default(),
            mode: TtlMode::default(),
            margin_secs: default_margin_secs(),
            refract_secs: default_refract_secs(),
            th_secs: default_th_secs(),
            n_events: default_n_events(),
            n_infinite: false,
        }
    }
}

/// Spike-edge triggering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikeConfig {
    /// Probe carrying the spike channel.
    #[serde(default = "default_imec0_id")]
    pub stream: StreamId,
    /// Neural channel searched for edges.
    #[serde(default)]
    pub channel: usize,
    /// Negative-going threshold, volts at the electrode.
    #[serde(default = "default_spike_thresh")]
    pub threshold_volts: f64,
    /// Samples beyond threshold before an edge counts.
    #[serde(default = "default_spike_inarow")]
    pub inarow: usize,
    /// Data kept on each side of the edge.
    #[serde(default = "default_peri_evt_secs")]
    pub peri_evt_secs: f64,
    /// Skip after each written window.
    #[serde(default = "default_refract_secs")]
    pub refract_secs: f64,
    /// Spikes to record before stopping.
    #[serde(default = "default_n_events")]
    pub n_events: u64,
    /// Ignore `n_events` and record every spike.
    #[serde(default)]
    pub n_infinite: bool,
    /// Extra margin past the oldest queued scan before an edge is accepted.
    #[serde(default = "default_latency_secs")]
    pub latency_secs: f64,
    /// Filtered samples zeroed after each search relocation.
    #[serde(default = "default_transient_width")]
    pub transient_width: usize,
    /// Cross-stream alignment tolerance in sample periods.
    #[serde(default = "default_max_skew_periods")]
    pub max_skew_periods: f64,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            stream: StreamId::Imec(0),
            channel: 0,
            threshold_volts: default_spike_thresh(),
            inarow: default_spike_inarow(),
            peri_evt_secs: default_peri_evt_secs(),
            refract_secs: default_refract_secs(),
            n_events: default_n_events(),
            n_infinite: false,
            latency_secs: default_latency_secs(),
            transient_width: default_transient_width(),
            max_skew_periods: default_max_skew_periods(),
        }
    }
}

/// Selected trigger and the parameters of each policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Which policy runs.
    #[serde(default)]
    pub mode: TriggerMode,
    /// Timed policy parameters.
    #[serde(default)]
    pub timed: TimedConfig,
    /// TTL policy parameters.
    #[serde(default)]
    pub ttl: TtlTriggerConfig,
    /// Spike policy parameters.
    #[serde(default)]
    pub spike: SpikeConfig,
}

/// Live display fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Feed the display at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Filter bank applied to displayed data.
    #[serde(default)]
    pub band: DisplayBand,
    /// How far back the first fetch reaches.
    #[serde(default = "default_oldest_secs")]
    pub oldest_secs: f64,
    /// Keep one scan in every `downsample`.
    #[serde(default = "default_downsample")]
    pub downsample: usize,
    /// Fetch period.
    #[serde(default = "default_fetch_ms")]
    pub fetch_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            band: DisplayBand::default(),
            oldest_secs: default_oldest_secs(),
            downsample: default_downsample(),
            fetch_ms: default_fetch_ms(),
        }
    }
}

// Default value functions
fn default_app_name() -> String {
    "probe-daq".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_run_name() -> String {
    "run".to_string()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_queue_secs() -> f64 {
    5.0
}
fn default_loop_ms() -> u64 {
    100
}
fn default_imec_srate() -> f64 {
    30_000.0
}
fn default_imec_n_chans() -> usize {
    385
}
fn default_imec_n_ap() -> usize {
    384
}
fn default_imec_gain() -> f64 {
    500.0
}
fn default_imec_vmin() -> f64 {
    -0.6
}
fn default_imec_vmax() -> f64 {
    0.6
}
fn default_imec_max_int() -> i32 {
    512
}
fn default_enabled() -> bool {
    true
}
fn default_nidq_srate() -> f64 {
    25_000.0
}
fn default_nidq_n_chans() -> usize {
    8
}
fn default_nidq_gain() -> f64 {
    1.0
}
fn default_nidq_vmin() -> f64 {
    -5.0
}
fn default_nidq_vmax() -> f64 {
    5.0
}
fn default_nidq_max_int() -> i32 {
    32768
}
fn default_nidq_id() -> StreamId {
    StreamId::Nidq
}
fn default_imec0_id() -> StreamId {
    StreamId::Imec(0)
}
fn default_ttl_thresh() -> f64 {
    1.1
}
fn default_ttl_inarow() -> usize {
    5
}
fn default_th_secs() -> f64 {
    0.5
}
fn default_n_events() -> u64 {
    1
}
fn default_margin_secs() -> f64 {
    1.0
}
fn default_refract_secs() -> f64 {
    0.5
}
fn default_spike_thresh() -> f64 {
    -100e-6
}
fn default_spike_inarow() -> usize {
    3
}
fn default_peri_evt_secs() -> f64 {
    1.0
}
fn default_latency_secs() -> f64 {
    0.25
}
fn default_transient_width() -> usize {
    crate::data::edge::TRANSIENT_WIDTH
}
fn default_max_skew_periods() -> f64 {
    1.0
}
fn default_oldest_secs() -> f64 {
    0.1
}
fn default_downsample() -> usize {
    1
}
fn default_fetch_ms() -> u64 {
    40
}

impl Settings {
    /// Load configuration from `config/probe_daq.toml` and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/probe_daq.toml")
    }

    /// Load configuration from a specific file path.
    ///
    /// Environment variables override the file, e.g.
    /// `PROBE_DAQ_RUN__QUEUE_SECS=10`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PROBE_DAQ_").split("__"))
            .extract()?)
    }

    /// Parse settings from TOML text without consulting the environment.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Ok(Figment::new()
            .merge(Toml::string(toml))
            .extract()?)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }
        if self.run.run_name.trim().is_empty() {
            return invalid("run_name must not be empty".into());
        }
        if !(self.run.queue_secs > 0.0) {
            return invalid(format!("queue_secs must be positive (got {})", self.run.queue_secs));
        }
        if self.run.loop_ms == 0 {
            return invalid("loop_ms must be positive".into());
        }

        let specs = self.stream_specs()?;
        if specs.is_empty() {
            return invalid("No streams configured".into());
        }
        let find = |id: StreamId| specs.iter().find(|s| s.id == id);

        let check_line = |what: &str, line: &TtlLineConfig| -> AppResult<()> {
            let Some(spec) = find(line.stream) else {
                return Err(DaqError::Configuration(format!("{} stream {} is not configured", what, line.stream)));
            };
            if line.channel >= spec.n_chans {
                return Err(DaqError::Configuration(format!(
                    "{} channel {} out of range for {} ({} channels)",
                    what, line.channel, line.stream, spec.n_chans
                )));
            }
            if line.inarow == 0 {
                return Err(DaqError::Configuration(format!("{} inarow must be at least 1", what)));
            }
            Ok(())
        };

        if self.gate.mode == GateMode::Ttl {
            check_line("TTL gate", &self.gate.ttl)?;
        }

        match self.trigger.mode {
            TriggerMode::Immediate | TriggerMode::RemoteTrigger => {}
            TriggerMode::RemoteGate => {
                if self.gate.mode != GateMode::Remote {
                    return invalid("remote_gate trigger requires the remote gate".into());
                }
            }
            TriggerMode::Timed => {
                let t = &self.trigger.timed;
                if t.tl0_secs < 0.0 || t.tl_secs < 0.0 || (!t.h_infinite && !(t.th_secs > 0.0)) {
                    return invalid("timed trigger periods must be non-negative and th_secs positive".into());
                }
                if !t.h_infinite && !t.n_infinite && t.n_high == 0 {
                    return invalid("timed trigger n_high must be at least 1".into());
                }
            }
            TriggerMode::Ttl => {
                let t = &self.trigger.ttl;
                check_line("TTL trigger", &t.line)?;
                if t.margin_secs < 0.0 || t.refract_secs < 0.0 || !(t.th_secs > 0.0) {
                    return invalid("TTL trigger margin/refractory must be non-negative and th_secs positive".into());
                }
                if !t.n_infinite && t.n_events == 0 {
                    return invalid("TTL trigger n_events must be at least 1".into());
                }
            }
            TriggerMode::Spike => {
                let s = &self.trigger.spike;
                let Some(spec) = find(s.stream) else {
                    return invalid(format!("spike stream {} is not configured", s.stream));
                };
                if !spec.is_filterable(s.channel) {
                    return invalid(format!(
                        "spike channel {} is not a neural channel of {} (0..{})",
                        s.channel, s.stream, spec.n_neural
                    ));
                }
                if s.inarow == 0 {
                    return invalid("spike inarow must be at least 1".into());
                }
                if !(s.peri_evt_secs > 0.0) || s.refract_secs < 0.0 || s.latency_secs < 0.0 {
                    return invalid("spike peri_evt_secs must be positive, refract/latency non-negative".into());
                }
                if !s.n_infinite && s.n_events == 0 {
                    return invalid("spike n_events must be at least 1".into());
                }
                if !(s.max_skew_periods > 0.0) {
                    return invalid("max_skew_periods must be positive".into());
                }
            }
        }

        if self.display.downsample == 0 {
            return invalid("display downsample must be at least 1".into());
        }
        Ok(())
    }

    /// Build the stream specs for every configured stream, probes first.
    pub fn stream_specs(&self) -> AppResult<Vec<StreamSpec>> {
        let mut specs = Vec::with_capacity(self.imec.len() + 1);
        for (ip, im) in self.imec.iter().enumerate() {
            let spec = StreamSpec {
                gain: im.gain,
                range: VoltRange {
                    min: im.volts_min,
                    max: im.volts_max,
                },
                max_int: im.max_int,
                ..StreamSpec::imec(ip, im.sample_rate).with_channels(im.n_chans, im.n_ap)
            };
            specs.push(with_saved(spec, &im.save_chans)?);
        }
        if let Some(ni) = self.nidq.as_ref().filter(|ni| ni.enabled) {
            let spec = StreamSpec {
                gain: ni.gain,
                range: VoltRange {
                    min: ni.volts_min,
                    max: ni.volts_max,
                },
                max_int: ni.max_int,
                ..StreamSpec::nidq(ni.sample_rate, ni.n_chans, ni.n_neural)
            };
            specs.push(with_saved(spec, &ni.save_chans)?);
        }
        for spec in &specs {
            spec.validate()?;
        }
        Ok(specs)
    }
}

fn with_saved(spec: StreamSpec, pattern: &str) -> AppResult<StreamSpec> {
    if pattern.trim().is_empty() {
        return Ok(spec);
    }
    let chans = parse_channel_pattern(pattern, &[], spec.n_chans).map_err(|e| {
        DaqError::Configuration(format!("{} save_chans: {}", spec.id, e))
    })?;
    Ok(spec.with_save_chans(chans))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
        [run]
        run_name = "mouse1"
        queue_secs = 2.0

        [[imec]]
        save_chans = "0:9#384"

        [[imec]]

        [nidq]
        n_chans = 4
        n_neural = 2

        [trigger]
        mode = "spike"

        [trigger.spike]
        stream = "imec1"
        channel = 12
        peri_evt_secs = 0.01
    "#;

    #[test]
    fn parses_streams_and_trigger() {
        let s = Settings::from_toml_str(BASIC).unwrap();
        assert!(s.validate().is_ok());
        assert_eq!(s.run.run_name, "mouse1");
        assert_eq!(s.trigger.mode, TriggerMode::Spike);
        assert_eq!(s.trigger.spike.stream, StreamId::Imec(1));

        let specs = s.stream_specs().unwrap();
        let ids: Vec<_> = specs.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![StreamId::Imec(0), StreamId::Imec(1), StreamId::Nidq]);
        assert_eq!(specs[0].saved_channels().len(), 11);
        assert!(specs[1].saves_all());
        assert_eq!(specs[2].n_chans, 4);
    }

    #[test]
    fn defaults_are_usable() {
        let mut s = Settings::default();
        s.imec.push(ImecConfig::default());
        assert!(s.validate().is_ok());
        assert_eq!(s.run.loop_ms, 100);
        assert_eq!(s.trigger.spike.transient_width, 1000);
        assert!((s.trigger.spike.latency_secs - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut s = Settings::from_toml_str(BASIC).unwrap();
        s.application.log_level = "invalid".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_unknown_trigger_stream() {
        let mut s = Settings::from_toml_str(BASIC).unwrap();
        s.trigger.spike.stream = StreamId::Imec(5);
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_spike_on_sync_channel() {
        let mut s = Settings::from_toml_str(BASIC).unwrap();
        s.trigger.spike.channel = 384;
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_zero_inarow() {
        let mut s = Settings::from_toml_str(BASIC).unwrap();
        s.trigger.spike.inarow = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn remote_gate_trigger_needs_remote_gate() {
        let mut s = Settings::from_toml_str(BASIC).unwrap();
        s.trigger.mode = TriggerMode::RemoteGate;
        assert!(s.validate().is_err());
        s.gate.mode = GateMode::Remote;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn rejects_bad_save_pattern() {
        let toml = "[[imec]]\nsave_chans = \"400\"\n";
        let s = Settings::from_toml_str(toml).unwrap();
        assert!(matches!(s.validate(), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn ttl_gate_channel_must_exist() {
        let toml = "[[imec]]\n[nidq]\nn_chans = 2\n[gate]\nmode = \"ttl\"\n[gate.ttl]\nchannel = 3\n";
        let s = Settings::from_toml_str(toml).unwrap();
        assert!(s.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        std::fs::write(&path, BASIC).unwrap();
        let s = Settings::load_from(&path).unwrap();
        assert_eq!(s.imec.len(), 2);
    }
}
