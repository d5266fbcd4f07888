//! Mock USB transport for testing.
//!
//! `MockDevice` models just enough of a DFU device to exercise the session,
//! transfer and orchestration logic: scripted status replies per phase,
//! injectable error classes, and a shared call log that survives the device
//! being moved into a session.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{DeviceIdentity, DfuDevice, TransportError, UsbBus, UsbErrorKind};
use crate::protocol::constants::{DEFAULT_TIMEOUT, TI_DFU_PRODUCT_ID, TI_VENDOR_ID};
use crate::protocol::{DeviceStatus, DfuState};

/// One recorded call into a `MockDevice`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    ClaimInterface,
    SetAltSetting(u8),
    ReleaseInterface,
    GetStatus,
    ClearStatus,
    Abort,
    Download { transaction: u16, len: usize },
    Detach(u16),
    Reset,
    Close,
    SetTimeout(Duration),
}

#[derive(Debug, Default)]
struct DeviceLog {
    calls: Vec<MockCall>,
    data: Vec<u8>,
    bytes: u64,
}

/// Shared view of a `MockDevice`'s call log.
#[derive(Debug, Clone, Default)]
pub struct MockDeviceLog {
    inner: Arc<Mutex<DeviceLog>>,
}

impl MockDeviceLog {
    fn record(&self, call: MockCall) {
        self.inner.lock().unwrap().calls.push(call);
    }

    /// All calls in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Number of calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.inner.lock().unwrap().calls.iter().filter(|c| pred(c)).count()
    }

    /// `(transaction, len)` of every DNLOAD, including the zero-length terminator.
    pub fn downloads(&self) -> Vec<(u16, usize)> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Download { transaction, len } => Some((*transaction, *len)),
                _ => None,
            })
            .collect()
    }

    /// Total payload bytes accepted.
    pub fn bytes_received(&self) -> u64 {
        self.inner.lock().unwrap().bytes
    }

    /// Captured payload (only when capture is enabled).
    pub fn data(&self) -> Vec<u8> {
        self.inner.lock().unwrap().data.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Downloading,
    Manifesting,
    Gone,
}

/// Scripted DFU device.
pub struct MockDevice {
    vid: u16,
    pid: u16,
    alt: Option<u8>,
    alt_name: String,
    transfer_size: u16,
    timeout: Duration,
    idle_statuses: VecDeque<DeviceStatus>,
    block_statuses: VecDeque<Result<DeviceStatus, UsbErrorKind>>,
    manifest_statuses: VecDeque<Result<DeviceStatus, UsbErrorKind>>,
    claim_failure: Option<UsbErrorKind>,
    alt_failure: Option<UsbErrorKind>,
    download_failure: Option<(usize, UsbErrorKind)>,
    terminator_failure: Option<UsbErrorKind>,
    capture: bool,
    phase: Phase,
    downloads: usize,
    claimed: bool,
    closed: bool,
    log: MockDeviceLog,
}

impl MockDevice {
    /// A device on the reference VID/PID exposing `alt_name` as alt setting 0.
    pub fn new(alt_name: impl Into<String>) -> Self {
        Self {
            vid: TI_VENDOR_ID,
            pid: TI_DFU_PRODUCT_ID,
            alt: Some(0),
            alt_name: alt_name.into(),
            transfer_size: 4096,
            timeout: DEFAULT_TIMEOUT,
            idle_statuses: VecDeque::new(),
            block_statuses: VecDeque::new(),
            manifest_statuses: VecDeque::new(),
            claim_failure: None,
            alt_failure: None,
            download_failure: None,
            terminator_failure: None,
            capture: false,
            phase: Phase::Idle,
            downloads: 0,
            claimed: false,
            closed: false,
            log: MockDeviceLog::default(),
        }
    }

    pub fn with_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = vid;
        self.pid = pid;
        self
    }

    pub fn with_alt(mut self, alt: Option<u8>) -> Self {
        self.alt = alt;
        self
    }

    pub fn with_transfer_size(mut self, size: u16) -> Self {
        self.transfer_size = size;
        self
    }

    /// Replies to status queries before the first DNLOAD. Defaults to dfuIDLE.
    pub fn with_idle_statuses(mut self, statuses: impl IntoIterator<Item = DeviceStatus>) -> Self {
        self.idle_statuses = statuses.into_iter().collect();
        self
    }

    /// Replies to status queries after data blocks. Defaults to dfuDNLOAD-IDLE.
    pub fn with_block_statuses(
        mut self,
        statuses: impl IntoIterator<Item = Result<DeviceStatus, UsbErrorKind>>,
    ) -> Self {
        self.block_statuses = statuses.into_iter().collect();
        self
    }

    /// Replies to status queries after the terminator. Defaults to dfuIDLE.
    pub fn with_manifest_statuses(
        mut self,
        statuses: impl IntoIterator<Item = Result<DeviceStatus, UsbErrorKind>>,
    ) -> Self {
        self.manifest_statuses = statuses.into_iter().collect();
        self
    }

    pub fn fail_claim(mut self, kind: UsbErrorKind) -> Self {
        self.claim_failure = Some(kind);
        self
    }

    pub fn fail_alt_setting(mut self, kind: UsbErrorKind) -> Self {
        self.alt_failure = Some(kind);
        self
    }

    /// Fail the `index`-th data block (0-based) and drop off the bus.
    pub fn fail_download(mut self, index: usize, kind: UsbErrorKind) -> Self {
        self.download_failure = Some((index, kind));
        self
    }

    /// Accept every data block, then vanish when the terminator is sent.
    pub fn disconnect_on_terminator(mut self, kind: UsbErrorKind) -> Self {
        self.terminator_failure = Some(kind);
        self
    }

    /// Keep a copy of every payload byte.
    pub fn capture_data(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Handle to the call log; stays valid after the device is moved.
    pub fn log(&self) -> MockDeviceLog {
        self.log.clone()
    }

    fn check_open(&self, request: &'static str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.phase == Phase::Gone {
            return Err(TransportError::Control {
                request,
                kind: UsbErrorKind::NoDevice,
            });
        }
        Ok(())
    }
}

impl DfuDevice for MockDevice {
    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }

    fn interface_number(&self) -> u8 {
        0
    }

    fn alt_setting(&self) -> Option<u8> {
        self.alt
    }

    fn alt_name(&self) -> &str {
        &self.alt_name
    }

    fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    fn claim_interface(&mut self) -> Result<(), TransportError> {
        self.log.record(MockCall::ClaimInterface);
        if let Some(kind) = self.claim_failure {
            return Err(TransportError::ClaimInterfaceFailed {
                interface: 0,
                kind,
                message: kind.to_string(),
            });
        }
        self.claimed = true;
        Ok(())
    }

    fn set_alt_setting(&mut self, alt: u8) -> Result<(), TransportError> {
        self.log.record(MockCall::SetAltSetting(alt));
        if let Some(kind) = self.alt_failure {
            return Err(TransportError::AltSettingFailed {
                alt,
                kind,
                message: kind.to_string(),
            });
        }
        Ok(())
    }

    fn release_interface(&mut self) -> Result<(), TransportError> {
        self.log.record(MockCall::ReleaseInterface);
        self.claimed = false;
        Ok(())
    }

    fn get_status(&mut self) -> Result<DeviceStatus, TransportError> {
        self.log.record(MockCall::GetStatus);
        self.check_open("DFU_GETSTATUS")?;
        let reply = match self.phase {
            Phase::Idle => Ok(self
                .idle_statuses
                .pop_front()
                .unwrap_or(DeviceStatus::ok(DfuState::DfuIdle))),
            Phase::Downloading => self
                .block_statuses
                .pop_front()
                .unwrap_or(Ok(DeviceStatus::ok(DfuState::DfuDnloadIdle))),
            Phase::Manifesting => self
                .manifest_statuses
                .pop_front()
                .unwrap_or(Ok(DeviceStatus::ok(DfuState::DfuIdle))),
            Phase::Gone => unreachable!("checked above"),
        };
        reply.map_err(|kind| TransportError::Control {
            request: "DFU_GETSTATUS",
            kind,
        })
    }

    fn clear_status(&mut self) -> Result<(), TransportError> {
        self.log.record(MockCall::ClearStatus);
        self.check_open("DFU_CLRSTATUS")
    }

    fn abort(&mut self) -> Result<(), TransportError> {
        self.log.record(MockCall::Abort);
        self.check_open("DFU_ABORT")
    }

    fn download(&mut self, transaction: u16, data: &[u8]) -> Result<(), TransportError> {
        self.log.record(MockCall::Download {
            transaction,
            len: data.len(),
        });
        self.check_open("DFU_DNLOAD")?;

        if data.is_empty() {
            if let Some(kind) = self.terminator_failure {
                self.phase = Phase::Gone;
                return Err(TransportError::Control {
                    request: "DFU_DNLOAD",
                    kind,
                });
            }
            self.phase = Phase::Manifesting;
            return Ok(());
        }

        let index = self.downloads;
        self.downloads += 1;
        if let Some((fail_at, kind)) = self.download_failure
            && fail_at == index
        {
            self.phase = Phase::Gone;
            return Err(TransportError::Control {
                request: "DFU_DNLOAD",
                kind,
            });
        }

        self.phase = Phase::Downloading;
        let mut log = self.log.inner.lock().unwrap();
        log.bytes += data.len() as u64;
        if self.capture {
            log.data.extend_from_slice(data);
        }
        Ok(())
    }

    fn detach(&mut self, timeout_ms: u16) -> Result<(), TransportError> {
        self.log.record(MockCall::Detach(timeout_ms));
        self.check_open("DFU_DETACH")
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.log.record(MockCall::Reset);
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.phase = Phase::Gone;
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.log.record(MockCall::Close);
        }
        self.closed = true;
        self.claimed = false;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.log.record(MockCall::SetTimeout(timeout));
        self.timeout = timeout;
    }
}

#[derive(Debug, Default)]
struct BusLog {
    scans: u32,
    forgets: u32,
    shutdowns: u32,
    opened: Vec<String>,
}

/// Shared view of a `MockBus`'s activity.
#[derive(Debug, Clone, Default)]
pub struct MockBusLog {
    inner: Arc<Mutex<BusLog>>,
}

impl MockBusLog {
    pub fn scans(&self) -> u32 {
        self.inner.lock().unwrap().scans
    }

    pub fn forgets(&self) -> u32 {
        self.inner.lock().unwrap().forgets
    }

    pub fn shutdowns(&self) -> u32 {
        self.inner.lock().unwrap().shutdowns
    }

    /// Alt setting names of every device handed out, in order.
    pub fn opened(&self) -> Vec<String> {
        self.inner.lock().unwrap().opened.clone()
    }
}

/// Mock bus handing out queued devices, one per successful scan.
pub struct MockBus {
    slots: VecDeque<Option<MockDevice>>,
    scan_failure: Option<UsbErrorKind>,
    log: MockBusLog,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            slots: VecDeque::new(),
            scan_failure: None,
            log: MockBusLog::default(),
        }
    }

    /// Queue a device; it is returned by the first scan that reaches it and matches.
    pub fn push_device(&mut self, device: MockDevice) -> &mut Self {
        self.slots.push_back(Some(device));
        self
    }

    /// Queue `scans` empty scan results (device not yet enumerated).
    pub fn push_absent(&mut self, scans: usize) -> &mut Self {
        for _ in 0..scans {
            self.slots.push_back(None);
        }
        self
    }

    /// Make every scan fail with `kind`.
    pub fn fail_scans(&mut self, kind: UsbErrorKind) -> &mut Self {
        self.scan_failure = Some(kind);
        self
    }

    pub fn log(&self) -> MockBusLog {
        self.log.clone()
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbBus for MockBus {
    type Device = MockDevice;

    fn scan(&mut self, identity: &DeviceIdentity) -> Result<Option<MockDevice>, TransportError> {
        self.log.inner.lock().unwrap().scans += 1;

        if let Some(kind) = self.scan_failure {
            return Err(TransportError::Enumeration {
                kind,
                message: kind.to_string(),
            });
        }

        match self.slots.pop_front() {
            Some(Some(device)) => {
                if identity.matches(device.vid, device.pid, &device.alt_name) {
                    self.log
                        .inner
                        .lock()
                        .unwrap()
                        .opened
                        .push(device.alt_name.clone());
                    Ok(Some(device))
                } else {
                    self.slots.push_front(Some(device));
                    Ok(None)
                }
            }
            Some(None) | None => Ok(None),
        }
    }

    fn forget_devices(&mut self) {
        self.log.inner.lock().unwrap().forgets += 1;
    }

    fn shutdown(&mut self) {
        self.log.inner.lock().unwrap().shutdowns += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(alt: &str) -> DeviceIdentity {
        DeviceIdentity::new(TI_VENDOR_ID, TI_DFU_PRODUCT_ID, alt)
    }

    #[test]
    fn test_mock_bus_queue() {
        let mut bus = MockBus::new();
        bus.push_absent(1).push_device(MockDevice::new("rawemmc"));

        assert!(bus.scan(&identity("rawemmc")).unwrap().is_none());
        assert!(bus.scan(&identity("bootloader")).unwrap().is_none());
        assert!(bus.scan(&identity("rawemmc")).unwrap().is_some());
        assert!(bus.scan(&identity("rawemmc")).unwrap().is_none());
        assert_eq!(bus.log().scans(), 4);
        assert_eq!(bus.log().opened(), vec!["rawemmc".to_string()]);
    }

    #[test]
    fn test_mock_phases() {
        let mut dev = MockDevice::new("rawemmc").capture_data();
        let log = dev.log();

        assert_eq!(dev.get_status().unwrap().state, DfuState::DfuIdle);
        dev.download(0, b"abc").unwrap();
        assert_eq!(dev.get_status().unwrap().state, DfuState::DfuDnloadIdle);
        dev.download(1, &[]).unwrap();
        assert_eq!(dev.get_status().unwrap().state, DfuState::DfuIdle);

        assert_eq!(log.downloads(), vec![(0, 3), (1, 0)]);
        assert_eq!(log.data(), b"abc");
        assert_eq!(log.bytes_received(), 3);
    }

    #[test]
    fn test_mock_disconnect() {
        let mut dev = MockDevice::new("bootloader").fail_download(1, UsbErrorKind::Io);

        dev.download(0, b"one").unwrap();
        let err = dev.download(1, b"two").unwrap_err();
        assert_eq!(err.kind(), UsbErrorKind::Io);
        assert_eq!(dev.get_status().unwrap_err().kind(), UsbErrorKind::NoDevice);
    }
}
