//! Whole-file transfer for small boot binaries.

use std::fs;
use std::path::Path;

use tracing::{info, instrument, warn};

use super::{TransferEngine, TransferError, block, chunk_size, is_expected_disconnect};
use crate::session::ClaimedSession;
use crate::transport::{DfuDevice, UsbErrorKind};

/// How a whole-file transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WholeFileOutcome {
    /// The device accepted the payload and finished manifestation.
    Completed,
    /// The device dropped off the bus with an error of this class; it was
    /// expected to reset, so this counts as success.
    ExpectedDisconnect(UsbErrorKind),
}

impl TransferEngine {
    /// Download `payload` in one go.
    ///
    /// With `reset_after`, a block-engine failure that is not in the
    /// always-fatal set is the device resetting into its next stage and is
    /// reported as [`WholeFileOutcome::ExpectedDisconnect`]. On success the
    /// device is detached and reset, which invalidates the session.
    #[instrument(skip(self, session, payload), fields(len = payload.len()))]
    pub fn send_whole_file<D: DfuDevice>(
        &self,
        session: &mut ClaimedSession<'_, D>,
        payload: &[u8],
        reset_after: bool,
    ) -> Result<WholeFileOutcome, TransferError> {
        if payload.is_empty() {
            return Err(TransferError::EmptyPayload);
        }

        let device = session.device()?;
        let chunk = chunk_size(device.transfer_size(), self.options.whole_file_chunk);
        info!(chunk, alt = %device.alt_name(), "Downloading file");

        let outcome = match block::download_image(
            device,
            payload,
            chunk,
            self.options.min_block_poll(),
            self.options.manifest_poll(),
        ) {
            Ok(()) => WholeFileOutcome::Completed,
            Err(e) if is_expected_disconnect(e.kind(), reset_after) => {
                info!(error = %e, "Device disconnected after download, expected for a resetting stage");
                WholeFileOutcome::ExpectedDisconnect(e.kind())
            }
            Err(source) => {
                warn!(error = %source, "Download failed");
                return Err(TransferError::Download { source });
            }
        };

        if reset_after {
            session.detach_and_reset(self.options.detach_timeout_ms);
        }

        Ok(outcome)
    }

    /// Read `path` and download it with [`TransferEngine::send_whole_file`].
    pub fn send_whole_file_from_path<D: DfuDevice>(
        &self,
        session: &mut ClaimedSession<'_, D>,
        path: &Path,
        reset_after: bool,
    ) -> Result<WholeFileOutcome, TransferError> {
        let payload = fs::read(path).map_err(|source| TransferError::FileIo {
            context: format!("Failed to read {}", path.display()),
            source,
        })?;
        self.send_whole_file(session, &payload, reset_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeviceStatus, DfuState, DfuStatusCode};
    use crate::session::DeviceSession;
    use crate::transfer::TransferOptions;
    use crate::transport::{MockCall, MockDevice};

    const ALL_KINDS: [UsbErrorKind; 13] = [
        UsbErrorKind::InvalidParam,
        UsbErrorKind::Access,
        UsbErrorKind::NoDevice,
        UsbErrorKind::NotFound,
        UsbErrorKind::Busy,
        UsbErrorKind::Timeout,
        UsbErrorKind::Overflow,
        UsbErrorKind::Pipe,
        UsbErrorKind::Interrupted,
        UsbErrorKind::NoMem,
        UsbErrorKind::NotSupported,
        UsbErrorKind::Io,
        UsbErrorKind::Other,
    ];

    fn engine() -> TransferEngine {
        TransferEngine::new(TransferOptions {
            min_block_poll_ms: 0,
            manifest_poll_ms: 0,
            ..TransferOptions::default()
        })
    }

    fn send(
        dev: MockDevice,
        payload: &[u8],
        reset_after: bool,
    ) -> Result<WholeFileOutcome, TransferError> {
        let mut session = DeviceSession::new(dev);
        let mut claimed = session.claim().unwrap();
        engine().send_whole_file(&mut claimed, payload, reset_after)
    }

    #[test]
    fn test_disconnect_classification_with_reset() {
        for kind in ALL_KINDS {
            let dev = MockDevice::new("bootloader").fail_download(0, kind);
            let result = send(dev, &[0xAA; 128], true);
            if kind.is_always_fatal() {
                assert!(
                    matches!(result, Err(TransferError::Download { ref source }) if source.kind() == kind),
                    "{kind} must fail"
                );
            } else {
                assert_eq!(result.unwrap(), WholeFileOutcome::ExpectedDisconnect(kind));
            }
        }
    }

    #[test]
    fn test_every_error_fatal_without_reset() {
        for kind in ALL_KINDS {
            let dev = MockDevice::new("bootloader").fail_download(0, kind);
            assert!(send(dev, &[0xAA; 128], false).is_err(), "{kind} must fail");
        }
    }

    #[test]
    fn test_terminator_disconnect_is_expected() {
        let dev = MockDevice::new("tispl.bin").disconnect_on_terminator(UsbErrorKind::NoDevice);
        let log = dev.log();
        let outcome = send(dev, &[1u8; 4096], true).unwrap();

        assert_eq!(outcome, WholeFileOutcome::ExpectedDisconnect(UsbErrorKind::NoDevice));
        assert_eq!(log.bytes_received(), 4096);
    }

    #[test]
    fn test_device_error_status_is_expected_disconnect_with_reset() {
        let dev = MockDevice::new("u-boot.img").with_block_statuses([Ok(DeviceStatus::new(
            DfuState::DfuError,
            DfuStatusCode::ErrWrite,
            0,
        ))]);
        assert_eq!(
            send(dev, &[0u8; 2048], true).unwrap(),
            WholeFileOutcome::ExpectedDisconnect(UsbErrorKind::Io)
        );
    }

    #[test]
    fn test_success_with_reset_detaches_and_invalidates() {
        let dev = MockDevice::new("u-boot.img");
        let log = dev.log();
        let mut session = DeviceSession::new(dev);
        {
            let mut claimed = session.claim().unwrap();
            let outcome = engine()
                .send_whole_file(&mut claimed, &[7u8; 90_000], true)
                .unwrap();
            assert_eq!(outcome, WholeFileOutcome::Completed);
        }
        assert!(session.is_invalidated());
        assert_eq!(log.count(|c| *c == MockCall::Detach(1000)), 1);
        assert_eq!(log.count(|c| *c == MockCall::Reset), 1);
        assert_eq!(log.bytes_received(), 90_000);
        // 21 full 4096-byte blocks, one of 3984 bytes, then the terminator.
        assert_eq!(log.downloads().len(), 22 + 1);
    }

    #[test]
    fn test_success_without_reset_keeps_session() {
        let dev = MockDevice::new("rawemmc");
        let log = dev.log();
        let mut session = DeviceSession::new(dev);
        {
            let mut claimed = session.claim().unwrap();
            assert_eq!(
                engine().send_whole_file(&mut claimed, &[1u8; 10], false).unwrap(),
                WholeFileOutcome::Completed
            );
        }
        assert!(!session.is_invalidated());
        assert_eq!(log.count(|c| matches!(c, MockCall::Detach(_))), 0);
    }

    #[test]
    fn test_missing_transfer_size_uses_fallback_chunk() {
        let dev = MockDevice::new("bootloader").with_transfer_size(0);
        let log = dev.log();
        send(dev, &[0u8; 90_000], true).unwrap();

        let downloads = log.downloads();
        // ceil(90000 / 1024) data blocks plus the terminator.
        assert_eq!(downloads.len(), 88 + 1);
        assert!(downloads[..87].iter().all(|(_, len)| *len == 1024));
        assert_eq!(downloads[87].1, 90_000 - 87 * 1024);
    }

    #[test]
    fn test_empty_payload_rejected() {
        let dev = MockDevice::new("bootloader");
        let log = dev.log();
        assert!(matches!(send(dev, &[], true), Err(TransferError::EmptyPayload)));
        assert!(log.downloads().is_empty());
    }

    #[test]
    fn test_missing_file_is_file_io() {
        let mut session = DeviceSession::new(MockDevice::new("bootloader"));
        let mut claimed = session.claim().unwrap();
        let err = engine()
            .send_whole_file_from_path(&mut claimed, Path::new("/nonexistent/tiboot3.bin"), true)
            .unwrap_err();
        assert!(matches!(err, TransferError::FileIo { .. }));
    }
}
