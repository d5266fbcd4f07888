//! Errors surfaced by a flash run.

use thiserror::Error;

use crate::discovery::DiscoveryError;
use crate::extract::ExtractError;
use crate::protocol::DfuStatusCode;
use crate::session::SessionError;
use crate::transfer::TransferError;
use crate::transport::{TransportError, UsbErrorKind};

/// Stage name used for failures before any device traffic.
pub const EXTRACT_STAGE: &str = "extract";

/// First failure of a flash run. Every variant names the stage (the alt
/// setting being flashed) it happened in.
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("DFU failed (alt: {stage}): {source}")]
    DeviceNotFound {
        stage: String,
        #[source]
        source: DiscoveryError,
    },

    #[error("DFU failed (alt: {stage}): {source}")]
    Claim {
        stage: String,
        #[source]
        source: SessionError,
    },

    #[error("DFU failed (alt: {stage}): Error getting DFU status: {source}")]
    StatusQuery {
        stage: String,
        #[source]
        source: TransportError,
    },

    #[error("DFU failed (alt: {stage}): {source}")]
    Transfer {
        stage: String,
        #[source]
        source: TransferError,
    },

    #[error("DFU failed (alt: {stage}): DFU error in manifest phase: status={status}")]
    Manifestation { stage: String, status: DfuStatusCode },

    #[error("DFU failed (alt: {stage}): {message}")]
    FileIo {
        stage: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error(transparent)]
    Extraction(#[from] ExtractError),
}

impl FlashError {
    /// Sort a transfer failure into the run-level taxonomy.
    pub fn from_transfer(stage: &str, err: TransferError) -> Self {
        let stage = stage.to_string();
        match err {
            TransferError::Session(SessionError::StatusQuery(source))
            | TransferError::StatusQuery(source) => FlashError::StatusQuery { stage, source },
            TransferError::Session(source) => FlashError::Claim { stage, source },
            TransferError::Manifestation { status } => FlashError::Manifestation { stage, status },
            TransferError::FileIo { context, source } => FlashError::FileIo {
                stage,
                message: context,
                source: Some(source),
            },
            TransferError::EmptyPayload => FlashError::FileIo {
                stage,
                message: "Payload is empty".to_string(),
                source: None,
            },
            source @ (TransferError::Download { .. } | TransferError::DeviceStatus { .. }) => {
                FlashError::Transfer { stage, source }
            }
        }
    }

    /// Sort a claim failure into the run-level taxonomy.
    pub fn from_session(stage: &str, err: SessionError) -> Self {
        match err {
            SessionError::StatusQuery(source) => FlashError::StatusQuery {
                stage: stage.to_string(),
                source,
            },
            source => FlashError::Claim {
                stage: stage.to_string(),
                source,
            },
        }
    }

    pub fn stage(&self) -> &str {
        match self {
            FlashError::DeviceNotFound { stage, .. }
            | FlashError::Claim { stage, .. }
            | FlashError::StatusQuery { stage, .. }
            | FlashError::Transfer { stage, .. }
            | FlashError::Manifestation { stage, .. }
            | FlashError::FileIo { stage, .. } => stage.as_str(),
            FlashError::Extraction(_) => EXTRACT_STAGE,
        }
    }

    /// USB error class behind the failure, if there is one.
    pub fn usb_kind(&self) -> Option<UsbErrorKind> {
        match self {
            FlashError::DeviceNotFound {
                source: DiscoveryError::Bus { source, .. },
                ..
            }
            | FlashError::StatusQuery { source, .. } => Some(source.kind()),
            FlashError::Claim { source, .. } => match source {
                SessionError::Claim(e) | SessionError::AltSetting(e) => Some(e.kind()),
                _ => None,
            },
            FlashError::Transfer { source, .. } => source.usb_kind(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DfuState;

    #[test]
    fn test_transfer_errors_are_sorted() {
        let err = FlashError::from_transfer(
            "rawemmc",
            TransferError::Manifestation {
                status: DfuStatusCode::ErrVerify,
            },
        );
        assert!(matches!(err, FlashError::Manifestation { .. }));
        assert_eq!(err.stage(), "rawemmc");

        let err = FlashError::from_transfer(
            "rawemmc",
            TransferError::StatusQuery(TransportError::Control {
                request: "DFU_GETSTATUS",
                kind: UsbErrorKind::Pipe,
            }),
        );
        assert!(matches!(err, FlashError::StatusQuery { .. }));
        assert_eq!(err.usb_kind(), Some(UsbErrorKind::Pipe));

        let err = FlashError::from_transfer(
            "rawemmc",
            TransferError::DeviceStatus {
                state: DfuState::DfuError,
                status: DfuStatusCode::ErrWrite,
            },
        );
        assert!(matches!(err, FlashError::Transfer { .. }));
        assert_eq!(err.usb_kind(), None);

        let err = FlashError::from_transfer("bootloader", TransferError::EmptyPayload);
        assert!(matches!(err, FlashError::FileIo { source: None, .. }));
    }

    #[test]
    fn test_message_names_stage() {
        let err = FlashError::from_transfer(
            "tispl.bin",
            TransferError::Download {
                source: TransportError::Control {
                    request: "DFU_DNLOAD",
                    kind: UsbErrorKind::Busy,
                },
            },
        );
        assert_eq!(
            err.to_string(),
            "DFU failed (alt: tispl.bin): Download failed: DFU_DNLOAD failed: resource busy"
        );
        assert_eq!(err.usb_kind(), Some(UsbErrorKind::Busy));
    }

    #[test]
    fn test_extraction_stage() {
        let err: FlashError = ExtractError::Missing {
            name: "u-boot.img".into(),
        }
        .into();
        assert_eq!(err.stage(), EXTRACT_STAGE);
        assert_eq!(err.to_string(), "Bootloader file not found in image: u-boot.img");
    }
}
