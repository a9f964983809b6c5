//! Channel-subset extraction and integer downsampling of fetched scans.
//!
//! Both operate on a flat, already concatenated buffer and on whole scans only.
//! Downsampling keeps every k-th scan starting with the first; samples are not
//! filtered.

use crate::error::{AppResult, DaqError};

/// Parse a subset pattern into sorted, unique channel ids.
///
/// `-1` selects `saved`. Otherwise the pattern is `#`-separated tokens, each
/// either `n` or an inclusive range `a:b`.
pub fn parse_channel_pattern(pattern: &str, saved: &[usize], n_chans: usize) -> AppResult<Vec<usize>> {
    let pattern = pattern.trim();
    if pattern == "-1" {
        return Ok(saved.to_vec());
    }

    let invalid = || DaqError::InvalidRequest(format!("Invalid channel subset pattern '{}'.", pattern));
    let parse_id = |tok: &str| -> AppResult<usize> {
        let id: usize = tok.trim().parse().map_err(|_| invalid())?;
        if id >= n_chans {
            return Err(invalid());
        }
        Ok(id)
    };

    let mut ids = Vec::new();
    for tok in pattern.split('#') {
        match tok.split_once(':') {
            Some((a, b)) => {
                let (a, b) = (parse_id(a)?, parse_id(b)?);
                if a > b {
                    return Err(invalid());
                }
                ids.extend(a..=b);
            }
            None => ids.push(parse_id(tok)?),
        }
    }

    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Copy the listed channels out of interleaved `data`.
pub fn extract_channels(data: &[i16], n_chans: usize, chans: &[usize]) -> Vec<i16> {
    let n_scans = data.len() / n_chans;
    let mut out = Vec::with_capacity(n_scans * chans.len());
    for scan in data.chunks_exact(n_chans) {
        out.extend(chans.iter().map(|&c| scan[c]));
    }
    out
}

/// Keep every `k`-th scan, starting with the first.
///
/// The input is trimmed to a multiple of `k` scans first, so the output always
/// holds `floor(n / k)` scans.
pub fn downsample(data: &[i16], n_chans: usize, k: usize) -> Vec<i16> {
    let k = k.max(1);
    let n_scans = data.len() / n_chans;
    let n_out = n_scans / k;
    if k == 1 {
        return data[..n_out * n_chans].to_vec();
    }
    let mut out = Vec::with_capacity(n_out * n_chans);
    for scan in data.chunks_exact(n_chans).step_by(k).take(n_out) {
        out.extend_from_slice(scan);
    }
    out
}
