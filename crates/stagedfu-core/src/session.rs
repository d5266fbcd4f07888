//! Device session - exclusive ownership of one open DFU device handle.
//!
//! A `DeviceSession` wraps the handle returned by discovery. Claiming it
//! yields a `ClaimedSession` guard: the interface is released when the guard
//! is released or dropped, so claim and release balance on every exit path.
//! Once the device has been reset the session is invalidated for good; the
//! device re-enumerates and must be discovered again.

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::protocol::DeviceStatus;
use crate::transport::{DfuDevice, TransportError};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Cannot claim interface: {0}")]
    Claim(#[source] TransportError),

    #[error("Cannot set alternate interface: {0}")]
    AltSetting(#[source] TransportError),

    #[error("Error getting DFU status: {0}")]
    StatusQuery(#[source] TransportError),

    #[error("Session used after the device was reset")]
    Invalidated,

    #[error("Interface is already claimed")]
    AlreadyClaimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Claimed,
    Invalidated,
}

/// Exclusive owner of an open device handle.
pub struct DeviceSession<D: DfuDevice> {
    device: D,
    lifecycle: Lifecycle,
}

impl<D: DfuDevice> DeviceSession<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            lifecycle: Lifecycle::Open,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn is_claimed(&self) -> bool {
        self.lifecycle == Lifecycle::Claimed
    }

    /// True once the device has been reset or the handle closed.
    pub fn is_invalidated(&self) -> bool {
        self.lifecycle == Lifecycle::Invalidated
    }

    /// Claim the interface, select the alternate setting and bring the device
    /// to a known state.
    ///
    /// A device left in dfuERROR gets CLRSTATUS; one left in dfuDNLOAD-IDLE or
    /// dfuUPLOAD-IDLE by an aborted transfer gets ABORT.
    #[instrument(skip(self), fields(alt = %self.device.alt_name()))]
    pub fn claim(&mut self) -> Result<ClaimedSession<'_, D>, SessionError> {
        match self.lifecycle {
            Lifecycle::Invalidated => return Err(SessionError::Invalidated),
            Lifecycle::Claimed => return Err(SessionError::AlreadyClaimed),
            Lifecycle::Open => {}
        }

        self.device.claim_interface().map_err(SessionError::Claim)?;
        self.lifecycle = Lifecycle::Claimed;

        // From here on an early return drops the guard, which releases.
        let mut claimed = ClaimedSession { session: self };

        if let Some(alt) = claimed.session.device.alt_setting() {
            claimed
                .session
                .device
                .set_alt_setting(alt)
                .map_err(SessionError::AltSetting)?;
        }

        let status = claimed.normalize()?;
        debug!(status = %status, "Interface claimed");
        Ok(claimed)
    }

    /// Release the interface. Idempotent.
    pub fn release(&mut self) -> Result<(), TransportError> {
        if self.lifecycle != Lifecycle::Claimed {
            return Ok(());
        }
        self.lifecycle = Lifecycle::Open;
        self.device.release_interface()
    }

    fn invalidate(&mut self) {
        if let Err(e) = self.release() {
            debug!(error = %e, "Release before close failed");
        }
        self.device.close();
        self.lifecycle = Lifecycle::Invalidated;
    }
}

impl<D: DfuDevice> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "Failed to release interface");
        }
        self.device.close();
    }
}

/// A session whose interface is claimed. Releases on drop.
pub struct ClaimedSession<'a, D: DfuDevice> {
    session: &'a mut DeviceSession<D>,
}

impl<'a, D: DfuDevice> ClaimedSession<'a, D> {
    /// The underlying block/status engine.
    pub fn device(&mut self) -> Result<&mut D, SessionError> {
        if self.session.is_invalidated() {
            return Err(SessionError::Invalidated);
        }
        Ok(&mut self.session.device)
    }

    pub fn is_invalidated(&self) -> bool {
        self.session.is_invalidated()
    }

    /// Explicit release; dropping the guard has the same effect.
    pub fn release(self) -> Result<(), TransportError> {
        self.session.release()
    }

    fn normalize(&mut self) -> Result<DeviceStatus, SessionError> {
        let device = &mut self.session.device;
        let mut status = device.get_status().map_err(SessionError::StatusQuery)?;

        if status.is_error() {
            info!(status = %status, "Device in error state, clearing status");
            if let Err(e) = device.clear_status() {
                warn!(error = %e, "DFU_CLRSTATUS failed");
            }
            match device.get_status() {
                Ok(st) => status = st,
                Err(e) => warn!(error = %e, "Status re-query after clear failed"),
            }
        }

        if status.is_transfer_in_progress() {
            info!(state = %status.state, "Aborting leftover transfer");
            if let Err(e) = device.abort() {
                warn!(error = %e, "DFU_ABORT failed");
            }
        }

        Ok(status)
    }

    /// Detach, release, reset and close: the device leaves the bus and comes
    /// back in a new mode. The session is invalid afterwards.
    pub fn detach_and_reset(&mut self, detach_timeout_ms: u16) {
        let device = &mut self.session.device;
        if let Err(e) = device.detach(detach_timeout_ms) {
            debug!(error = %e, "DFU_DETACH failed (device may already be gone)");
        }
        if let Err(e) = self.session.release() {
            debug!(error = %e, "Release before reset failed");
        }
        if let Err(e) = self.session.device.reset() {
            debug!(error = %e, "USB reset failed (device may already be gone)");
        }
        self.session.invalidate();
    }

    /// Port-reset the device in place. The session is invalid afterwards.
    pub fn reset(&mut self) {
        if let Err(e) = self.session.device.reset() {
            debug!(error = %e, "USB reset failed (device may already be gone)");
        }
        self.session.invalidate();
    }
}

impl<D: DfuDevice> Drop for ClaimedSession<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.session.release() {
            warn!(error = %e, "Failed to release interface");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DfuState, DfuStatusCode};
    use crate::transport::{MockCall, MockDevice, UsbErrorKind};

    fn releases(log: &crate::transport::MockDeviceLog) -> usize {
        log.count(|c| *c == MockCall::ReleaseInterface)
    }

    #[test]
    fn test_claim_selects_alt_and_releases_once() {
        let dev = MockDevice::new("rawemmc").with_alt(Some(2));
        let log = dev.log();
        let mut session = DeviceSession::new(dev);

        let claimed = session.claim().unwrap();
        claimed.release().unwrap();
        assert!(!session.is_claimed());
        session.release().unwrap();

        let calls = log.calls();
        assert_eq!(calls[0], MockCall::ClaimInterface);
        assert_eq!(calls[1], MockCall::SetAltSetting(2));
        assert_eq!(calls[2], MockCall::GetStatus);
        assert_eq!(releases(&log), 1);
    }

    #[test]
    fn test_claim_without_alt_skips_selection() {
        let dev = MockDevice::new("").with_alt(None);
        let log = dev.log();
        let mut session = DeviceSession::new(dev);
        drop(session.claim().unwrap());

        assert_eq!(
            log.count(|c| matches!(c, MockCall::SetAltSetting(_))),
            0
        );
        assert_eq!(releases(&log), 1);
    }

    #[test]
    fn test_alt_setting_failure_releases() {
        let dev = MockDevice::new("rawemmc").fail_alt_setting(UsbErrorKind::Pipe);
        let log = dev.log();
        let mut session = DeviceSession::new(dev);

        let err = session.claim().err().unwrap();
        assert!(matches!(err, SessionError::AltSetting(_)));
        assert_eq!(releases(&log), 1);
        assert!(!session.is_claimed());
    }

    #[test]
    fn test_claim_failure_does_not_release() {
        let dev = MockDevice::new("rawemmc").fail_claim(UsbErrorKind::Busy);
        let log = dev.log();
        let mut session = DeviceSession::new(dev);

        assert!(matches!(session.claim(), Err(SessionError::Claim(_))));
        assert_eq!(releases(&log), 0);
    }

    #[test]
    fn test_error_state_is_cleared() {
        let dev = MockDevice::new("rawemmc").with_idle_statuses([
            DeviceStatus::new(DfuState::DfuError, DfuStatusCode::ErrWrite, 0),
            DeviceStatus::ok(DfuState::DfuIdle),
        ]);
        let log = dev.log();
        let mut session = DeviceSession::new(dev);
        drop(session.claim().unwrap());

        assert_eq!(log.count(|c| *c == MockCall::ClearStatus), 1);
        assert_eq!(log.count(|c| *c == MockCall::GetStatus), 2);
        assert_eq!(log.count(|c| *c == MockCall::Abort), 0);
    }

    #[test]
    fn test_leftover_download_is_aborted() {
        for state in [DfuState::DfuDnloadIdle, DfuState::DfuUploadIdle] {
            let dev = MockDevice::new("rawemmc").with_idle_statuses([DeviceStatus::ok(state)]);
            let log = dev.log();
            let mut session = DeviceSession::new(dev);
            drop(session.claim().unwrap());

            assert_eq!(log.count(|c| *c == MockCall::Abort), 1, "state {state}");
            assert_eq!(log.count(|c| *c == MockCall::ClearStatus), 0);
        }
    }

    #[test]
    fn test_reset_invalidates_session() {
        let dev = MockDevice::new("bootloader");
        let log = dev.log();
        let mut session = DeviceSession::new(dev);
        {
            let mut claimed = session.claim().unwrap();
            claimed.detach_and_reset(1000);
            assert!(claimed.device().is_err());
        }
        assert!(session.is_invalidated());
        assert!(matches!(session.claim(), Err(SessionError::Invalidated)));

        let calls = log.calls();
        let detach = calls.iter().position(|c| *c == MockCall::Detach(1000)).unwrap();
        let reset = calls.iter().position(|c| *c == MockCall::Reset).unwrap();
        assert!(detach < reset);
        assert_eq!(releases(&log), 1);
        assert_eq!(log.count(|c| *c == MockCall::Close), 1);
    }

    #[test]
    fn test_drop_closes_handle() {
        let dev = MockDevice::new("rawemmc");
        let log = dev.log();
        {
            let mut session = DeviceSession::new(dev);
            let _claimed = session.claim().unwrap();
        }
        assert_eq!(releases(&log), 1);
        assert_eq!(log.count(|c| *c == MockCall::Close), 1);
    }
}
