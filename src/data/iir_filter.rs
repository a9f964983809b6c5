//! Second-order IIR stages applied to single channels of interleaved scans.
use crate::error::{AppResult, DaqError};
use biquad::{Biquad, Coefficients, DirectForm1, ToHertz, Q_BUTTERWORTH_F64};
use serde::{Deserialize, Serialize};

/// The type of IIR filter to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    /// Passes frequencies below the cutoff.
    Lowpass,
    /// Passes frequencies above the cutoff.
    Highpass,
}

/// Parameters for one [`IirFilter`] stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IirFilterConfig {
    /// The type of filter to apply.
    pub filter_type: FilterType,
    /// The cutoff frequency in Hz.
    pub f0: f64,
    /// The sample rate of the data in Hz.
    pub fs: f64,
    /// Quality factor. Defaults to Butterworth.
    pub q: Option<f64>,
}

impl IirFilterConfig {
    /// Second-order high-pass at `f0` Hz.
    pub fn highpass(f0: f64, fs: f64) -> Self {
        Self {
            filter_type: FilterType::Highpass,
            f0,
            fs,
            q: None,
        }
    }

    /// Second-order low-pass at `f0` Hz.
    pub fn lowpass(f0: f64, fs: f64) -> Self {
        Self {
            filter_type: FilterType::Lowpass,
            f0,
            fs,
            q: None,
        }
    }
}

/// A biquad stage with history carried across blocks.
///
/// Output is rounded back to integer sample units and clamped to the
/// converter's range `[-max_int, max_int - 1]`.
#[derive(Debug, Clone)]
pub struct IirFilter {
    coeffs: Coefficients<f64>,
    filter: DirectForm1<f64>,
}

impl IirFilter {
    /// Build the cascade; fails on a corner frequency the sample rate cannot carry.
    pub fn new(config: IirFilterConfig) -> AppResult<Self> {
        let coeffs = Self::design_filter(&config)?;
        Ok(Self {
            coeffs,
            filter: DirectForm1::<f64>::new(coeffs),
        })
    }

    fn design_filter(config: &IirFilterConfig) -> AppResult<Coefficients<f64>> {
        let q = config.q.unwrap_or(Q_BUTTERWORTH_F64);
        let kind = match config.filter_type {
            FilterType::Lowpass => biquad::Type::LowPass,
            FilterType::Highpass => biquad::Type::HighPass,
        };
        Coefficients::<f64>::from_params(kind, config.fs.hz(), config.f0.hz(), q).map_err(|_| {
            DaqError::Configuration(format!(
                "Failed to create IIR filter coefficients ({:?} f0={} fs={})",
                config.filter_type, config.f0, config.fs
            ))
        })
    }

    /// Filter one value.
    pub fn run(&mut self, x: f64) -> f64 {
        self.filter.run(x)
    }

    /// Forget all history.
    pub fn reset(&mut self) {
        self.filter = DirectForm1::<f64>::new(self.coeffs);
    }

    /// Filter channel `chan` of interleaved `data` in place.
    pub fn apply_channel(&mut self, data: &mut [i16], n_chans: usize, chan: usize, max_int: i32) {
        let lo = f64::from(-max_int);
        let hi = f64::from(max_int - 1);
        for s in data.iter_mut().skip(chan).step_by(n_chans) {
            *s = self.run(f64::from(*s)).round().clamp(lo, hi) as i16;
        }
    }
}

/// Live-display band applied by the graph fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayBand {
    /// Unfiltered.
    #[default]
    Raw,
    /// High-pass 300 Hz.
    Spike,
    /// High-pass 0.1 Hz then low-pass 300 Hz.
    Lfp,
}

/// Per-channel filter bank for one stream's neural channels.
#[derive(Debug, Clone)]
pub struct BandFilter {
    band: DisplayBand,
    n_neural: usize,
    max_int: i32,
    stages: Vec<Vec<IirFilter>>,
}

impl BandFilter {
    /// Filters for the first `n_neural` channels of a stream.
    pub fn new(band: DisplayBand, fs: f64, n_neural: usize, max_int: i32) -> AppResult<Self> {
        let chain: Vec<IirFilterConfig> = match band {
            DisplayBand::Raw => Vec::new(),
            DisplayBand::Spike => vec![IirFilterConfig::highpass(300.0, fs)],
            DisplayBand::Lfp => vec![
                IirFilterConfig::highpass(0.1, fs),
                IirFilterConfig::lowpass(300.0, fs),
            ],
        };
        let mut stages = Vec::new();
        if !chain.is_empty() {
            for _ in 0..n_neural {
                stages.push(
                    chain
                        .iter()
                        .map(|c| IirFilter::new(*c))
                        .collect::<AppResult<Vec<_>>>()?,
                );
            }
        }
        Ok(Self {
            band,
            n_neural,
            max_int,
            stages,
        })
    }

    /// The selected band.
    pub fn band(&self) -> DisplayBand {
        self.band
    }

    /// Filter the neural channels of interleaved `data` in place.
    pub fn apply(&mut self, data: &mut [i16], n_chans: usize) {
        for (chan, chain) in self.stages.iter_mut().enumerate().take(self.n_neural.min(n_chans)) {
            for stage in chain.iter_mut() {
                stage.apply_channel(data, n_chans, chan, self.max_int);
            }
        }
    }

    /// Clear every channel's filter state.
    pub fn reset(&mut self) {
        self.stages.iter_mut().flatten().for_each(IirFilter::reset);
    }
}
