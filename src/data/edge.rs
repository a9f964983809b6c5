//! Threshold edge search with filter-transient suppression.
//!
//! An [`EdgeScanner`] walks one channel of a [`SampleQueue`] forward from a
//! search position. A falling edge is the first scan of a run of `inarow`
//! consecutive samples at or below threshold that follows at least one sample
//! above it; a rising edge mirrors that.
//!
//! When a high-pass stage is attached, the first `transient_width` filtered
//! samples after every relocation are forced to zero before comparison, so the
//! filter's step response can never qualify as an edge. The scanner remembers
//! where it stopped; calling again from that position continues without
//! re-scanning, while any other position counts as a relocation.

use crate::data::iir_filter::{IirFilter, IirFilterConfig};
use crate::data::sample_queue::SampleQueue;
use crate::error::AppResult;
use crate::stream::StreamSpec;
use serde::{Deserialize, Serialize};

/// Filtered samples zeroed after each relocation.
pub const TRANSIENT_WIDTH: usize = 1000;

/// High-pass corner used for edge detection, Hz.
pub const EDGE_HIGHPASS_HZ: f64 = 300.0;

/// Direction of threshold crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Going below the threshold.
    Falling,
    /// Going above the threshold.
    Rising,
}

impl Polarity {
    fn beyond(self, v: i16, thresh: i16) -> bool {
        match self {
            Polarity::Falling => v <= thresh,
            Polarity::Rising => v >= thresh,
        }
    }

    /// The opposite direction.
    pub fn flip(self) -> Self {
        match self {
            Polarity::Falling => Polarity::Rising,
            Polarity::Rising => Polarity::Falling,
        }
    }
}

/// High-pass stage on the monitored channel plus its transient counter.
#[derive(Debug, Clone)]
pub struct EdgeFilter {
    stage: IirFilter,
    max_int: i32,
    width: usize,
    nzero: usize,
}

impl EdgeFilter {
    /// A 300 Hz high-pass for `chan`, or `None` if the channel is not neural.
    pub fn for_channel(spec: &StreamSpec, chan: usize, width: usize) -> AppResult<Option<Self>> {
        if !spec.is_filterable(chan) {
            return Ok(None);
        }
        let stage = IirFilter::new(IirFilterConfig::highpass(EDGE_HIGHPASS_HZ, spec.sample_rate))?;
        Ok(Some(Self {
            stage,
            max_int: spec.max_int,
            width,
            nzero: width,
        }))
    }

    /// Re-arm the transient window and clear filter history.
    pub fn reset(&mut self) {
        self.stage.reset();
        self.nzero = self.width;
    }

    /// Samples still to be zeroed.
    pub fn pending_zeros(&self) -> usize {
        self.nzero
    }

    /// Filter single-channel `data` in place, zeroing leading transient samples.
    pub fn apply(&mut self, data: &mut [i16]) {
        self.stage.apply_channel(data, 1, 0, self.max_int);
        if self.nzero > 0 {
            let n = self.nzero.min(data.len());
            data[..n].fill(0);
            self.nzero -= n;
        }
    }
}

/// Resumable edge search over one channel.
#[derive(Debug, Clone)]
pub struct EdgeScanner {
    chan: usize,
    thresh: i16,
    inarow: usize,
    polarity: Polarity,
    filter: Option<EdgeFilter>,
    resume: Option<u64>,
    armed: bool,
    run: usize,
    run_start: u64,
}

impl EdgeScanner {
    /// Scanner for `chan`, optionally filtered before thresholding.
    pub fn new(chan: usize, thresh: i16, inarow: usize, polarity: Polarity, filter: Option<EdgeFilter>) -> Self {
        Self {
            chan,
            thresh,
            inarow: inarow.max(1),
            polarity,
            filter,
            resume: None,
            armed: false,
            run: 0,
            run_start: 0,
        }
    }

    /// Channel being scanned.
    pub fn channel(&self) -> usize {
        self.chan
    }

    /// Threshold in raw counts.
    pub fn threshold(&self) -> i16 {
        self.thresh
    }

    /// Direction currently searched for.
    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    /// True when a pre-filter is applied.
    pub fn is_filtered(&self) -> bool {
        self.filter.is_some()
    }

    /// Look for the opposite crossing next.
    pub fn set_polarity(&mut self, polarity: Polarity) {
        if polarity != self.polarity {
            self.polarity = polarity;
            self.armed = false;
            self.run = 0;
        }
    }

    /// Forget the search position and any partial run; re-arm the transient window.
    pub fn reset(&mut self) {
        self.resume = None;
        self.armed = false;
        self.run = 0;
        if let Some(f) = self.filter.as_mut() {
            f.reset();
        }
    }

    /// Search `queue` from `from_ct`.
    ///
    /// Returns `Ok(edge_ct)` when found, else `Err(resume_ct)`: the position to
    /// pass on the next call to continue where this one stopped.
    pub fn find(&mut self, queue: &SampleQueue, from_ct: u64) -> Result<u64, u64> {
        if self.resume != Some(from_ct) {
            self.reset();
        }

        let fetch = queue.fetch_all_from(from_ct);
        let Some(first) = fetch.first_ct() else {
            self.resume = Some(from_ct);
            return Err(from_ct);
        };
        if first != from_ct {
            // Clamped forward past evicted data.
            self.reset();
        }

        let nc = fetch.n_chans;
        let mut ct = first;
        for block in &fetch.blocks {
            let mut chan: Vec<i16> = block.data.iter().skip(self.chan).step_by(nc).copied().collect();
            if let Some(f) = self.filter.as_mut() {
                f.apply(&mut chan);
            }
            for &v in &chan {
                if self.polarity.beyond(v, self.thresh) {
                    if self.armed {
                        if self.run == 0 {
                            self.run_start = ct;
                        }
                        self.run += 1;
                        if self.run >= self.inarow {
                            let edge = self.run_start;
                            self.resume = None;
                            self.armed = false;
                            self.run = 0;
                            return Ok(edge);
                        }
                    }
                } else {
                    self.armed = true;
                    self.run = 0;
                }
                ct += 1;
            }
        }

        self.resume = Some(ct);
        Err(ct)
    }
}

impl SampleQueue {
    /// Run `scanner` over this queue from `from_ct`. See [`EdgeScanner::find`].
    pub fn find_edge(&self, scanner: &mut EdgeScanner, from_ct: u64) -> Result<u64, u64> {
        scanner.find(self, from_ct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamSpec;

    fn queue(n_chans: usize, n_neural: usize) -> SampleQueue {
        SampleQueue::with_origin(StreamSpec::nidq(10_000.0, n_chans, n_neural), 5.0, 0.0).unwrap()
    }

    fn push_chan(q: &SampleQueue, n_chans: usize, chan: usize, values: &[i16]) {
        let mut data = vec![0i16; values.len() * n_chans];
        for (i, &v) in values.iter().enumerate() {
            data[i * n_chans + chan] = v;
        }
        q.push(&data);
    }

    #[test]
    fn finds_falling_edge_after_inarow() {
        let q = queue(2, 0);
        let mut v = vec![0i16; 100];
        v[40] = -500; // single-sample glitch, not enough
        for s in &mut v[60..64] {
            *s = -500;
        }
        push_chan(&q, 2, 1, &v);

        let mut sc = EdgeScanner::new(1, -100, 3, Polarity::Falling, None);
        assert_eq!(q.find_edge(&mut sc, 0), Ok(60));
    }

    #[test]
    fn requires_sample_above_threshold_first() {
        let q = queue(1, 0);
        let mut v = vec![-500i16; 50];
        v.extend(vec![0i16; 10]);
        v.extend(vec![-500i16; 10]);
        push_chan(&q, 1, 0, &v);

        let mut sc = EdgeScanner::new(0, -100, 2, Polarity::Falling, None);
        assert_eq!(sc.find(&q, 0), Ok(60));
    }

    #[test]
    fn resumes_across_calls_without_rescanning() {
        let q = queue(1, 0);
        push_chan(&q, 1, 0, &[0, 0, 0, -500]);
        let mut sc = EdgeScanner::new(0, -100, 3, Polarity::Falling, None);
        let resume = sc.find(&q, 0).unwrap_err();
        assert_eq!(resume, 4);

        // The run began in the first call and completes in the second.
        push_chan(&q, 1, 0, &[-500, -500, 0]);
        assert_eq!(sc.find(&q, resume), Ok(3));
    }

    #[test]
    fn relocation_discards_partial_run() {
        let q = queue(1, 0);
        push_chan(&q, 1, 0, &[0, -500, -500, 0, 0, 0]);
        let mut sc = EdgeScanner::new(0, -100, 3, Polarity::Falling, None);
        assert_eq!(sc.find(&q, 0), Err(6));
        // Moving the start to 2 means scan 2 cannot begin a run (not armed).
        assert_eq!(sc.find(&q, 2), Err(6));
    }

    #[test]
    fn rising_polarity() {
        let q = queue(1, 0);
        push_chan(&q, 1, 0, &[0, 0, 900, 900, 0]);
        let mut sc = EdgeScanner::new(0, 500, 2, Polarity::Rising, None);
        assert_eq!(sc.find(&q, 0), Ok(2));
    }

    #[test]
    fn filter_transient_never_triggers() {
        // A large DC step at the start rings through the high-pass filter.
        let q = queue(1, 1);
        let mut v = vec![-20_000i16; 1500];
        v.extend(vec![-20_000i16; 500]);
        push_chan(&q, 1, 0, &v);

        let spec = q.spec().clone();
        let f = EdgeFilter::for_channel(&spec, 0, TRANSIENT_WIDTH).unwrap();
        assert!(f.is_some());
        let mut sc = EdgeScanner::new(0, -1000, 1, Polarity::Falling, f);
        assert!(sc.find(&q, 0).is_err());
    }

    #[test]
    fn filtered_spike_is_found_after_warmup() {
        let q = queue(1, 1);
        let mut v = vec![300i16; 3000];
        for s in &mut v[2000..2010] {
            *s = -3000;
        }
        push_chan(&q, 1, 0, &v);

        let spec = q.spec().clone();
        let f = EdgeFilter::for_channel(&spec, 0, TRANSIENT_WIDTH).unwrap();
        let mut sc = EdgeScanner::new(0, -1000, 2, Polarity::Falling, f);
        assert_eq!(sc.find(&q, 0), Ok(2000));
    }

    #[test]
    fn non_neural_channel_gets_no_filter() {
        let spec = StreamSpec::nidq(10_000.0, 4, 2);
        assert!(EdgeFilter::for_channel(&spec, 3, TRANSIENT_WIDTH).unwrap().is_none());
    }

    #[test]
    fn transient_counter_spans_blocks() {
        let spec = StreamSpec::nidq(10_000.0, 1, 1);
        let mut f = EdgeFilter::for_channel(&spec, 0, 10).unwrap().unwrap();
        let mut a = vec![100i16; 6];
        f.apply(&mut a);
        assert_eq!(a, vec![0; 6]);
        assert_eq!(f.pending_zeros(), 4);
        let mut b = vec![100i16; 6];
        f.apply(&mut b);
        assert!(b[..4].iter().all(|&s| s == 0));
        assert_eq!(f.pending_zeros(), 0);
        f.reset();
        assert_eq!(f.pending_zeros(), 10);
    }
}
