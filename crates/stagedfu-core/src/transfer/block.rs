//! DNLOAD / GETSTATUS block protocol shared by both transfer strategies.

use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::protocol::{DeviceStatus, DfuState};
use crate::transport::{DfuDevice, TransportError};

/// DNLOAD block numbers: start at 0 and wrap at `u16::MAX`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransactionCounter(u16);

impl TransactionCounter {
    pub fn next(&mut self) -> u16 {
        let current = self.0;
        self.0 = self.0.wrapping_add(1);
        current
    }
}

/// Sleep the device asked for, or `fallback` if it asked for none.
pub(super) fn poll_interval(poll_timeout_ms: u32, fallback: Duration) -> Duration {
    if poll_timeout_ms > 0 {
        Duration::from_millis(poll_timeout_ms as u64)
    } else {
        fallback
    }
}

/// Poll after a block until the device is ready for the next one or has
/// failed. Queries first; sleeps only when the reply is neither.
pub(super) fn wait_for_block<D: DfuDevice>(
    device: &mut D,
    min_poll: Duration,
) -> Result<DeviceStatus, TransportError> {
    loop {
        let status = device.get_status()?;
        if status.is_ready_for_block() || status.is_error() {
            return Ok(status);
        }
        trace!(state = %status.state, poll_ms = status.poll_timeout_ms, "Device busy");
        thread::sleep(poll_interval(status.poll_timeout_ms, min_poll).max(min_poll));
    }
}

/// Download a complete in-memory image: every block, the zero-length
/// terminator, then the manifestation wait.
///
/// A status reply carrying an error comes back as
/// [`TransportError::DeviceStatus`].
pub(super) fn download_image<D: DfuDevice>(
    device: &mut D,
    data: &[u8],
    chunk: usize,
    min_poll: Duration,
    manifest_poll: Duration,
) -> Result<(), TransportError> {
    let mut transaction = TransactionCounter::default();

    for block in data.chunks(chunk) {
        device.download(transaction.next(), block)?;
        let status = wait_for_block(device, min_poll)?;
        if !status.is_ok() || status.is_error() {
            return Err(TransportError::DeviceStatus {
                state: status.state,
                status: status.status,
            });
        }
    }

    debug!(blocks = transaction.0, "Sending end-of-transfer marker");
    device.download(transaction.next(), &[])?;

    loop {
        let status = device.get_status()?;
        match status.state {
            DfuState::DfuIdle | DfuState::DfuManifestWaitReset => return Ok(()),
            DfuState::DfuError => {
                return Err(TransportError::DeviceStatus {
                    state: status.state,
                    status: status.status,
                });
            }
            _ => thread::sleep(poll_interval(status.poll_timeout_ms, manifest_poll)),
        }
    }
}
