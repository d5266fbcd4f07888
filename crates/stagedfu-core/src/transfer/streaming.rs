//! Streaming transfer for large raw images.
//!
//! The image is read block by block so nothing larger than one transfer
//! size is held in memory. Unlike the whole-file path there is no
//! disconnect tolerance here: every USB error while streaming is a failure.

use std::io::Read;
use std::thread;

use tracing::{debug, info, instrument, warn};

use super::block::{self, TransactionCounter, poll_interval};
use super::{TransferEngine, TransferError, chunk_size};
use crate::protocol::DfuState;
use crate::session::ClaimedSession;
use crate::transport::DfuDevice;

/// Progress snapshot passed to the streaming callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProgress {
    pub sent: u64,
    pub total: u64,
}

/// How the manifestation phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestOutcome {
    /// Device returned to dfuIDLE.
    Idle,
    /// Device sat in dfuMANIFEST-WAIT-RESET and was reset.
    Reset,
    /// Status queries failed; the device left the bus on its own.
    Disconnected,
}

/// Summary of a finished streaming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReport {
    pub bytes_sent: u64,
    pub blocks: u32,
    pub manifest: ManifestOutcome,
}

/// Decides when a progress report is due: once per `step` bytes crossed and
/// always on the final block.
struct ProgressTracker {
    total: u64,
    step: u64,
    last_bucket: u64,
}

impl ProgressTracker {
    fn new(total: u64, step: u64) -> Self {
        Self {
            total,
            step: step.max(1),
            last_bucket: 0,
        }
    }

    fn should_report(&mut self, sent: u64) -> bool {
        let bucket = sent / self.step;
        if bucket > self.last_bucket || sent >= self.total {
            self.last_bucket = bucket;
            true
        } else {
            false
        }
    }
}

impl TransferEngine {
    /// Stream `total_size` bytes from `reader` to the device.
    ///
    /// The control timeout is raised for the duration of the transfer and
    /// restored on every exit path. If the device asks for a reset during
    /// manifestation it is reset here and the session is invalid afterwards;
    /// otherwise it is sent DFU_DETACH.
    #[instrument(skip(self, session, reader, on_progress))]
    pub fn send_streaming<D, R, F>(
        &self,
        session: &mut ClaimedSession<'_, D>,
        reader: &mut R,
        total_size: u64,
        mut on_progress: F,
    ) -> Result<StreamReport, TransferError>
    where
        D: DfuDevice,
        R: Read,
        F: FnMut(StreamProgress),
    {
        let device = session.device()?;
        device.set_timeout(self.options.streaming_timeout());
        let result = self.stream(device, reader, total_size, &mut on_progress);
        device.set_timeout(self.options.default_timeout());
        let report = result?;

        match report.manifest {
            ManifestOutcome::Reset => session.reset(),
            ManifestOutcome::Idle | ManifestOutcome::Disconnected => {
                if let Err(e) = session.device()?.detach(self.options.detach_timeout_ms) {
                    debug!(error = %e, "DFU_DETACH failed (device may already be gone)");
                }
            }
        }

        info!(bytes = report.bytes_sent, blocks = report.blocks, "Streaming transfer complete");
        Ok(report)
    }

    fn stream<D: DfuDevice, R: Read>(
        &self,
        device: &mut D,
        reader: &mut R,
        total_size: u64,
        on_progress: &mut dyn FnMut(StreamProgress),
    ) -> Result<StreamReport, TransferError> {
        let chunk = chunk_size(device.transfer_size(), self.options.stream_chunk);
        info!(total_size, chunk, alt = %device.alt_name(), "Streaming image");

        let mut buffer = vec![0u8; chunk];
        let mut transaction = TransactionCounter::default();
        let mut progress = ProgressTracker::new(total_size, self.options.progress_step_bytes);
        let mut sent = 0u64;
        let mut blocks = 0u32;

        while sent < total_size {
            let len = (total_size - sent).min(chunk as u64) as usize;
            let block = &mut buffer[..len];
            reader
                .read_exact(block)
                .map_err(|source| TransferError::FileIo {
                    context: format!("File read error at offset {sent}"),
                    source,
                })?;

            device
                .download(transaction.next(), block)
                .map_err(|source| TransferError::Download { source })?;
            sent += len as u64;
            blocks += 1;

            let status = block::wait_for_block(device, self.options.min_block_poll())
                .map_err(TransferError::StatusQuery)?;
            if !status.is_ok() || status.is_error() {
                return Err(TransferError::DeviceStatus {
                    state: status.state,
                    status: status.status,
                });
            }

            if progress.should_report(sent) {
                debug!(sent, total_size, "Streaming progress");
                on_progress(StreamProgress {
                    sent,
                    total: total_size,
                });
            }
        }

        // Some devices reset as soon as they see the terminator.
        if let Err(e) = device.download(transaction.next(), &[]) {
            warn!(error = %e, "End-of-transfer marker not acknowledged");
        }

        let manifest = self.wait_manifestation(device)?;
        Ok(StreamReport {
            bytes_sent: sent,
            blocks,
            manifest,
        })
    }

    fn wait_manifestation<D: DfuDevice>(
        &self,
        device: &mut D,
    ) -> Result<ManifestOutcome, TransferError> {
        loop {
            let status = match device.get_status() {
                Ok(status) => status,
                Err(e) => {
                    info!(error = %e, "Device left the bus during manifestation");
                    return Ok(ManifestOutcome::Disconnected);
                }
            };

            match status.state {
                DfuState::DfuIdle => return Ok(ManifestOutcome::Idle),
                DfuState::DfuManifestWaitReset => {
                    debug!("Device waiting for reset after manifestation");
                    return Ok(ManifestOutcome::Reset);
                }
                DfuState::DfuError => {
                    return Err(TransferError::Manifestation {
                        status: status.status,
                    });
                }
                _ => thread::sleep(poll_interval(
                    status.poll_timeout_ms,
                    self.options.manifest_poll(),
                )),
            }
        }
    }
}
