//! Remote data fetch against a running queue.
//!
//! Request tokens: `<stream> <fromCt> <maxCount> [<pattern>] [<downsample>]`.
//! A reply is framed as a text header followed by little-endian int16 samples:
//!
//! ```text
//! BINARY_DATA <nChans> <nScans> uint64(<firstCt>)\n<raw samples>
//! ```
//!
//! Without a pattern the stream's saved channels are returned. An empty fetch
//! is an error, never a zero-length frame. Bad requests are rejected before
//! any queue is touched.

use crate::data::subset::{downsample, extract_channels, parse_channel_pattern};
use crate::error::{AppResult, DaqError};
use crate::stream::{StreamId, StreamRegistry};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

/// A parsed fetch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Stream to read.
    pub stream: StreamId,
    /// First counter wanted.
    pub from_ct: u64,
    /// Most scans to return.
    pub max_count: usize,
    /// Channel pattern; `None` returns the saved channels.
    pub pattern: Option<String>,
    /// Keep one scan in every `downsample`.
    pub downsample: usize,
}

impl FetchRequest {
    /// Saved channels, no downsampling.
    pub fn new(stream: StreamId, from_ct: u64, max_count: usize) -> Self {
        Self {
            stream,
            from_ct,
            max_count,
            pattern: None,
            downsample: 1,
        }
    }

    /// Select channels with a `#`-separated pattern.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Keep every `k`-th scan.
    pub fn with_downsample(mut self, k: usize) -> Self {
        self.downsample = k;
        self
    }

    /// Parse `<stream> <fromCt> <maxCount> [<pattern>] [<downsample>]`.
    pub fn from_tokens(toks: &[&str]) -> AppResult<Self> {
        if toks.len() < 3 {
            return Err(DaqError::InvalidRequest("FETCH: Requires at least 3 params.".into()));
        }
        let bad = |what: &str, tok: &str| DaqError::InvalidRequest(format!("FETCH: bad {} '{}'.", what, tok));

        let stream: StreamId = toks[0].parse().map_err(|_| bad("stream", toks[0]))?;
        let from_ct: u64 = toks[1].parse().map_err(|_| bad("fromCt", toks[1]))?;
        let max_count: usize = toks[2].parse().map_err(|_| bad("maxCount", toks[2]))?;
        let pattern = toks.get(3).map(|s| s.to_string());
        let downsample = match toks.get(4) {
            Some(t) => t.parse().map_err(|_| bad("downsample", t))?,
            None => 1,
        };

        let req = Self {
            stream,
            from_ct,
            max_count,
            pattern,
            downsample,
        };
        req.validate()?;
        Ok(req)
    }

    fn validate(&self) -> AppResult<()> {
        if self.downsample < 1 {
            return Err(DaqError::InvalidRequest("FETCH: downsample factor must be >= 1.".into()));
        }
        Ok(())
    }
}

/// Data returned for one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReply {
    /// Channels per scan.
    pub n_chans: usize,
    /// Scans returned.
    pub n_scans: usize,
    /// Counter of the first returned scan.
    pub first_ct: u64,
    /// Interleaved samples.
    pub data: Vec<i16>,
}

impl FetchReply {
    /// The text header line, newline included.
    pub fn header(&self) -> String {
        format!("BINARY_DATA {} {} uint64({})\n", self.n_chans, self.n_scans, self.first_ct)
    }

    /// Header followed by the little-endian payload.
    pub fn encode(&self) -> Bytes {
        let header = self.header();
        let mut buf = BytesMut::with_capacity(header.len() + self.data.len() * 2);
        buf.put_slice(header.as_bytes());
        for &v in &self.data {
            buf.put_i16_le(v);
        }
        buf.freeze()
    }
}

/// Serve `req` from the run's queues.
pub fn fetch(streams: &StreamRegistry, req: &FetchRequest) -> AppResult<FetchReply> {
    req.validate()?;
    let Some(q) = streams.get(req.stream) else {
        return Err(DaqError::InvalidRequest(format!("Stream {} is not active.", req.stream)));
    };
    let spec = q.spec();
    let n_chans = spec.n_chans;

    let chans = match req.pattern.as_deref() {
        Some(p) => parse_channel_pattern(p, &spec.saved_channels(), n_chans)?,
        None => spec.saved_channels(),
    };
    if chans.is_empty() {
        return Err(DaqError::InvalidRequest("FETCH: empty channel subset.".into()));
    }

    let fetched = q.fetch(req.from_ct, req.max_count);
    let Some(first_ct) = fetched.first_ct() else {
        let msg = format!("No data read from {} queue.", req.stream);
        warn!("{}", msg);
        return Err(DaqError::NoData(msg));
    };

    let flat = fetched.concatenate()?;
    let mut data = if chans.len() < n_chans {
        extract_channels(&flat, n_chans, &chans)
    } else {
        flat.into_owned()
    };
    let nc = chans.len();
    if req.downsample > 1 {
        data = downsample(&data, nc, req.downsample);
    }
    if data.is_empty() {
        let msg = format!(
            "No data left from {} queue after downsampling by {}.",
            req.stream, req.downsample
        );
        warn!("{}", msg);
        return Err(DaqError::NoData(msg));
    }

    let reply = FetchReply {
        n_chans: nc,
        n_scans: data.len() / nc,
        first_ct,
        data,
    };
    debug!(stream = %req.stream, first_ct, n_scans = reply.n_scans, n_chans = nc, "Served fetch");
    Ok(reply)
}
