//! In-process transfer execution.
//!
//! [`TransferExecutor`] performs the authenticated GET, streams the body to
//! disk in slices of at most 8 KiB and reports [`ProgressSample`]s over a
//! channel. It never retries.

mod error;
mod executor;
mod filename;
mod progress;

pub use error::TransferError;
pub use executor::{CONNECT_TIMEOUT, READ_TIMEOUT, TransferExecutor, TransferOutcome};
pub use filename::{FALLBACK_FILENAME, filename_from_url, sanitize_filename, unique_destination};
pub use progress::{CHUNK_SIZE, ProgressSample, UNKNOWN_TOTAL_SAMPLE_BYTES, percent_of};
