//! Transfer engine: whole-file and streaming downloads.
//!
//! Both strategies drive the same DNLOAD / GETSTATUS block protocol but
//! differ in how failures are judged:
//! - `send_whole_file` hands a complete in-memory payload to the block engine
//!   and, when the device is expected to reset afterwards, treats
//!   disconnect-class errors as success.
//! - `send_streaming` reads fixed-size blocks from a reader, polls after every
//!   block, reports progress and waits out the manifestation phase. Every
//!   error is real.

mod block;
mod streaming;
mod whole_file;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::constants::*;
use crate::protocol::{DfuState, DfuStatusCode};
use crate::session::SessionError;
use crate::transport::{TransportError, UsbErrorKind};

pub use block::TransactionCounter;
pub use streaming::{ManifestOutcome, StreamProgress, StreamReport};
pub use whole_file::WholeFileOutcome;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{context}: {source}")]
    FileIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Payload is empty")]
    EmptyPayload,

    #[error("Download failed: {source}")]
    Download {
        #[source]
        source: TransportError,
    },

    #[error("Status poll error: {0}")]
    StatusQuery(#[source] TransportError),

    #[error("DFU device error: state={state} status={status}")]
    DeviceStatus {
        state: DfuState,
        status: DfuStatusCode,
    },

    #[error("DFU error in manifest phase: status={status}")]
    Manifestation { status: DfuStatusCode },
}

impl TransferError {
    /// USB error class behind this failure, if it came from the bus.
    pub fn usb_kind(&self) -> Option<UsbErrorKind> {
        match self {
            TransferError::Download { source } | TransferError::StatusQuery(source) => {
                Some(source.kind())
            }
            _ => None,
        }
    }
}

/// Whether a block-engine failure of class `kind` is the device dropping off
/// the bus after accepting the payload.
///
/// Only transfers that ask for a reset expect that; the host-side classes in
/// [`UsbErrorKind::is_always_fatal`] are never a disconnect.
pub fn is_expected_disconnect(kind: UsbErrorKind, reset_after: bool) -> bool {
    reset_after && !kind.is_always_fatal()
}

/// Tunables for the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Whole-file block size when the device reports no wTransferSize.
    pub whole_file_chunk: usize,
    /// Streaming block size when the device reports no wTransferSize.
    pub stream_chunk: usize,
    /// Poll floor between block status queries, in milliseconds.
    pub min_block_poll_ms: u64,
    /// Poll interval during manifestation when the device reports none.
    pub manifest_poll_ms: u64,
    /// Streaming progress granularity.
    pub progress_step_bytes: u64,
    pub streaming_timeout_ms: u64,
    pub default_timeout_ms: u64,
    pub detach_timeout_ms: u16,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            whole_file_chunk: DEFAULT_WHOLE_FILE_CHUNK,
            stream_chunk: DEFAULT_STREAM_CHUNK,
            min_block_poll_ms: MIN_BLOCK_POLL.as_millis() as u64,
            manifest_poll_ms: DEFAULT_MANIFEST_POLL.as_millis() as u64,
            progress_step_bytes: PROGRESS_STEP_BYTES,
            streaming_timeout_ms: STREAMING_TIMEOUT.as_millis() as u64,
            default_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            detach_timeout_ms: DETACH_TIMEOUT_MS,
        }
    }
}

impl TransferOptions {
    fn min_block_poll(&self) -> Duration {
        Duration::from_millis(self.min_block_poll_ms)
    }

    fn manifest_poll(&self) -> Duration {
        Duration::from_millis(self.manifest_poll_ms)
    }

    fn streaming_timeout(&self) -> Duration {
        Duration::from_millis(self.streaming_timeout_ms)
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Performs transfers on claimed sessions.
#[derive(Debug, Clone, Default)]
pub struct TransferEngine {
    options: TransferOptions,
}

impl TransferEngine {
    pub fn new(options: TransferOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }
}

/// Device-advertised block size, or `fallback` when it reports none.
fn chunk_size(advertised: u16, fallback: usize) -> usize {
    if advertised > 0 {
        advertised as usize
    } else {
        fallback.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_disconnect_policy() {
        assert!(is_expected_disconnect(UsbErrorKind::Io, true));
        assert!(is_expected_disconnect(UsbErrorKind::NoDevice, true));
        assert!(is_expected_disconnect(UsbErrorKind::Pipe, true));
        assert!(is_expected_disconnect(UsbErrorKind::Timeout, true));
        assert!(!is_expected_disconnect(UsbErrorKind::Busy, true));
        assert!(!is_expected_disconnect(UsbErrorKind::Io, false));
    }

    #[test]
    fn test_chunk_size_fallback() {
        assert_eq!(chunk_size(0, DEFAULT_STREAM_CHUNK), 4096);
        assert_eq!(chunk_size(512, DEFAULT_STREAM_CHUNK), 512);
        assert_eq!(chunk_size(0, 0), 1);
    }

    #[test]
    fn test_options_from_partial_toml() {
        let opts: TransferOptions = toml::from_str("stream_chunk = 8192").unwrap();
        assert_eq!(opts.stream_chunk, 8192);
        assert_eq!(opts.whole_file_chunk, DEFAULT_WHOLE_FILE_CHUNK);
        assert_eq!(opts.streaming_timeout_ms, 300_000);
    }
}
