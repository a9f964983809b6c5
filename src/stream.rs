//! Stream identity and per-stream acquisition parameters.

use crate::data::sample_queue::SampleQueue;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Identifies one hardware stream of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StreamId {
    /// One neural probe.
    Imec(usize),
    /// The auxiliary analog/digital card.
    Nidq,
}

impl StreamId {
    /// True for probe streams.
    pub fn is_imec(&self) -> bool {
        matches!(self, StreamId::Imec(_))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamId::Imec(ip) => write!(f, "imec{}", ip),
            StreamId::Nidq => write!(f, "nidq"),
        }
    }
}

impl FromStr for StreamId {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("nidq") || s.eq_ignore_ascii_case("ni") {
            return Ok(StreamId::Nidq);
        }
        s.strip_prefix("imec")
            .and_then(|ip| ip.parse::<usize>().ok())
            .map(StreamId::Imec)
            .ok_or_else(|| DaqError::InvalidRequest(format!("Unknown stream '{}'.", s)))
    }
}

impl TryFrom<String> for StreamId {
    type Error = DaqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StreamId> for String {
    fn from(value: StreamId) -> Self {
        value.to_string()
    }
}

/// Input voltage range of a stream's converters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltRange {
    /// Lower bound, volts.
    pub min: f64,
    /// Upper bound, volts.
    pub max: f64,
}

impl VoltRange {
    /// Symmetric range `[-v, v]`.
    pub fn symmetric(v: f64) -> Self {
        Self { min: -v, max: v }
    }

    /// Map volts onto `[0, 1]` across the range.
    pub fn volts_to_unity(&self, v: f64) -> f64 {
        (v - self.min) / (self.max - self.min)
    }

    /// Inverse of [`Self::volts_to_unity`].
    pub fn unity_to_volts(&self, u: f64) -> f64 {
        self.min + u * (self.max - self.min)
    }
}

/// Static description of a stream, fixed once acquisition starts.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSpec {
    /// Stream identity.
    pub id: StreamId,
    /// Scans per second.
    pub sample_rate: f64,
    /// Channels per scan.
    pub n_chans: usize,
    /// Leading channels carrying neural (AP band for probes) data.
    pub n_neural: usize,
    /// Amplifier gain applied to neural channels.
    pub gain: f64,
    /// Digitizer input range.
    pub range: VoltRange,
    /// Half-scale of the converter: 512 for 10-bit probes, 32768 for the card.
    pub max_int: i32,
    /// Channels written to disk; empty means all.
    pub save_chans: Vec<usize>,
}

impl StreamSpec {
    /// Probe stream with the usual 384 AP + 1 sync layout.
    pub fn imec(probe: usize, sample_rate: f64) -> Self {
        Self {
            id: StreamId::Imec(probe),
            sample_rate,
            n_chans: 385,
            n_neural: 384,
            gain: 500.0,
            range: VoltRange::symmetric(0.6),
            max_int: 512,
            save_chans: Vec::new(),
        }
    }

    /// Auxiliary card stream.
    pub fn nidq(sample_rate: f64, n_chans: usize, n_neural: usize) -> Self {
        Self {
            id: StreamId::Nidq,
            sample_rate,
            n_chans,
            n_neural,
            gain: 1.0,
            range: VoltRange::symmetric(5.0),
            max_int: 32768,
            save_chans: Vec::new(),
        }
    }

    /// Override the channel layout.
    pub fn with_channels(mut self, n_chans: usize, n_neural: usize) -> Self {
        self.n_chans = n_chans;
        self.n_neural = n_neural.min(n_chans);
        self
    }

    /// Restrict the saved channel set.
    pub fn with_save_chans(mut self, chans: Vec<usize>) -> Self {
        self.save_chans = chans;
        self
    }

    /// Check the descriptor is usable for acquisition.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.sample_rate > 0.0) {
            return Err(DaqError::Configuration(format!(
                "{}: sample rate must be positive (got {})",
                self.id, self.sample_rate
            )));
        }
        if self.n_chans == 0 {
            return Err(DaqError::Configuration(format!(
                "{}: channel count must be positive",
                self.id
            )));
        }
        if self.range.max <= self.range.min {
            return Err(DaqError::Configuration(format!(
                "{}: empty voltage range",
                self.id
            )));
        }
        if let Some(&bad) = self.save_chans.iter().find(|&&c| c >= self.n_chans) {
            return Err(DaqError::Configuration(format!(
                "{}: saved channel {} exceeds channel count {}",
                self.id, bad, self.n_chans
            )));
        }
        Ok(())
    }

    /// True if `chan` may be high-pass filtered for edge detection.
    pub fn is_filterable(&self, chan: usize) -> bool {
        chan < self.n_neural
    }

    /// Gain in effect on `chan`.
    pub fn chan_gain(&self, chan: usize) -> f64 {
        if chan < self.n_neural {
            self.gain
        } else {
            1.0
        }
    }

    /// Convert a threshold in volts to raw sample units on `chan`.
    pub fn volts_to_int(&self, v: f64, chan: usize) -> i16 {
        let full = f64::from(2 * self.max_int - 1);
        let raw = full * self.range.volts_to_unity(v * self.chan_gain(chan)) - f64::from(self.max_int);
        raw.trunc().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
    }

    /// Convert raw sample units on `chan` back to volts.
    pub fn int_to_volts(&self, i: i16, chan: usize) -> f64 {
        let unity = (f64::from(i) + f64::from(self.max_int)) / f64::from(2 * self.max_int);
        self.range.unity_to_volts(unity) / self.chan_gain(chan)
    }

    /// Channels written to segments, ascending.
    pub fn saved_channels(&self) -> Vec<usize> {
        if self.save_chans.is_empty() {
            (0..self.n_chans).collect()
        } else {
            let mut v = self.save_chans.clone();
            v.sort_unstable();
            v.dedup();
            v
        }
    }

    /// True if every channel is saved.
    pub fn saves_all(&self) -> bool {
        self.saved_channels().len() == self.n_chans
    }
}

/// The set of queues belonging to one run.
#[derive(Debug, Default, Clone)]
pub struct StreamRegistry {
    queues: Vec<Arc<SampleQueue>>,
}

impl StreamRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a queue; ids must be unique.
    pub fn insert(&mut self, queue: Arc<SampleQueue>) -> AppResult<()> {
        let id = queue.spec().id;
        if self.get(id).is_some() {
            return Err(DaqError::Configuration(format!("Duplicate stream {}", id)));
        }
        self.queues.push(queue);
        self.queues.sort_by_key(|q| q.spec().id);
        Ok(())
    }

    /// Queue for `id`, if active.
    pub fn get(&self, id: StreamId) -> Option<&Arc<SampleQueue>> {
        self.queues.iter().find(|q| q.spec().id == id)
    }

    /// Look up a queue for a remote request.
    pub fn require(&self, id: StreamId) -> AppResult<&Arc<SampleQueue>> {
        self.get(id)
            .ok_or_else(|| DaqError::InvalidRequest(format!("Stream {} is not active.", id)))
    }

    /// Probe queues in probe order.
    pub fn imec(&self) -> Vec<Arc<SampleQueue>> {
        self.queues
            .iter()
            .filter(|q| q.spec().id.is_imec())
            .cloned()
            .collect()
    }

    /// The auxiliary queue, if active.
    pub fn nidq(&self) -> Option<&Arc<SampleQueue>> {
        self.get(StreamId::Nidq)
    }

    /// Queues in registry order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SampleQueue>> {
        self.queues.iter()
    }

    /// Active stream ids in registry order.
    pub fn ids(&self) -> Vec<StreamId> {
        self.queues.iter().map(|q| q.spec().id).collect()
    }

    /// Number of active streams.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// True when no stream is active.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
