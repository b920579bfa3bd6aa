//! Progress sampling.
//!
//! Samples are emitted once at start and then only when the integer percent
//! changes. When the total is unknown the percent stays at zero and a sample
//! is emitted every [`UNKNOWN_TOTAL_SAMPLE_BYTES`].

/// Body slices are written in pieces of at most this many bytes.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Byte cadence for samples when the content length is unknown.
pub const UNKNOWN_TOTAL_SAMPLE_BYTES: u64 = 1024 * 1024;

/// One progress observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    /// Bytes written so far.
    pub bytes_downloaded: u64,
    /// Expected size, `0` when unknown.
    pub bytes_total: u64,
    /// `floor(bytes_downloaded * 100 / bytes_total)`, clamped to 100.
    pub percent: u8,
}

/// `floor(bytes * 100 / total)` clamped to `0..=100`; `0` for an unknown total.
#[must_use]
pub fn percent_of(bytes: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (u128::from(bytes) * 100 / u128::from(total)).min(100);
    u8::try_from(percent).unwrap_or(100)
}

/// Decides which byte counts are worth reporting.
#[derive(Debug)]
pub(crate) struct ProgressSampler {
    total: u64,
    last_percent: u8,
    last_sample_bytes: u64,
}

impl ProgressSampler {
    pub(crate) fn new(total: u64) -> Self {
        Self {
            total,
            last_percent: 0,
            last_sample_bytes: 0,
        }
    }

    /// The 0% sample sent before any body byte.
    pub(crate) fn start(&self) -> ProgressSample {
        ProgressSample {
            bytes_downloaded: 0,
            bytes_total: self.total,
            percent: 0,
        }
    }

    /// Final size seen so far; grows if the body overruns the declared length.
    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    pub(crate) fn observe(&mut self, bytes: u64) -> Option<ProgressSample> {
        if self.total == 0 {
            if bytes.saturating_sub(self.last_sample_bytes) < UNKNOWN_TOTAL_SAMPLE_BYTES {
                return None;
            }
            self.last_sample_bytes = bytes;
            return Some(ProgressSample {
                bytes_downloaded: bytes,
                bytes_total: 0,
                percent: 0,
            });
        }

        if bytes > self.total {
            self.total = bytes;
        }
        let percent = percent_of(bytes, self.total);
        if percent == self.last_percent {
            return None;
        }
        self.last_percent = percent;
        self.last_sample_bytes = bytes;
        Some(ProgressSample {
            bytes_downloaded: bytes,
            bytes_total: self.total,
            percent,
        })
    }
}
