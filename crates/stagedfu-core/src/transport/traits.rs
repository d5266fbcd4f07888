//! USB Transport layer abstraction.
//!
//! Defines the `UsbBus` and `DfuDevice` traits the transfer logic is built on,
//! allowing different implementations (nusb, mock, etc.).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{DeviceStatus, DfuState, DfuStatusCode, StatusError};

/// Which device and which alternate setting an operation addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Alternate setting name (interface string descriptor). Empty matches any.
    pub alt_setting: String,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16, alt_setting: impl Into<String>) -> Self {
        Self {
            vendor_id,
            product_id,
            alt_setting: alt_setting.into(),
        }
    }

    /// Same device, different alternate setting.
    pub fn with_alt_setting(&self, alt_setting: impl Into<String>) -> Self {
        Self {
            alt_setting: alt_setting.into(),
            ..self.clone()
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16, alt_name: &str) -> bool {
        self.vendor_id == vendor_id
            && self.product_id == product_id
            && (self.alt_setting.is_empty() || self.alt_setting == alt_name)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VID:0x{:04x} PID:0x{:04x} alt:{}",
            self.vendor_id, self.product_id, self.alt_setting
        )
    }
}

/// Error class reported by the USB stack, independent of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbErrorKind {
    InvalidParam,
    Access,
    NoDevice,
    NotFound,
    Busy,
    Timeout,
    Overflow,
    Pipe,
    Interrupted,
    NoMem,
    NotSupported,
    Io,
    Other,
}

impl UsbErrorKind {
    /// Classes that indicate a host-side or configuration problem. These are
    /// never the result of the device resetting mid-transfer.
    pub fn is_always_fatal(&self) -> bool {
        matches!(
            self,
            UsbErrorKind::InvalidParam
                | UsbErrorKind::Access
                | UsbErrorKind::Busy
                | UsbErrorKind::Overflow
                | UsbErrorKind::NoMem
                | UsbErrorKind::NotSupported
        )
    }

    /// The device is not (or no longer) present on the bus.
    pub fn is_absent(&self) -> bool {
        matches!(self, UsbErrorKind::NoDevice | UsbErrorKind::NotFound)
    }
}

impl fmt::Display for UsbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UsbErrorKind::InvalidParam => "invalid parameter",
            UsbErrorKind::Access => "access denied",
            UsbErrorKind::NoDevice => "no such device",
            UsbErrorKind::NotFound => "entity not found",
            UsbErrorKind::Busy => "resource busy",
            UsbErrorKind::Timeout => "operation timed out",
            UsbErrorKind::Overflow => "overflow",
            UsbErrorKind::Pipe => "pipe error",
            UsbErrorKind::Interrupted => "interrupted",
            UsbErrorKind::NoMem => "insufficient memory",
            UsbErrorKind::NotSupported => "operation not supported",
            UsbErrorKind::Io => "input/output error",
            UsbErrorKind::Other => "other error",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Bus enumeration failed: {message}")]
    Enumeration { kind: UsbErrorKind, message: String },

    #[error("Failed to open device: {message}")]
    OpenFailed { kind: UsbErrorKind, message: String },

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed {
        interface: u8,
        kind: UsbErrorKind,
        message: String,
    },

    #[error("Failed to select alternate setting {alt}: {message}")]
    AltSettingFailed {
        alt: u8,
        kind: UsbErrorKind,
        message: String,
    },

    #[error("{request} failed: {kind}")]
    Control {
        request: &'static str,
        kind: UsbErrorKind,
    },

    #[error("Device error: state={state} status={status}")]
    DeviceStatus {
        state: DfuState,
        status: DfuStatusCode,
    },

    #[error("Malformed status reply: {0}")]
    BadStatus(#[from] StatusError),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Device handle closed")]
    Closed,
}

impl TransportError {
    /// Backend-independent error class used for disconnect classification.
    pub fn kind(&self) -> UsbErrorKind {
        match self {
            TransportError::Enumeration { kind, .. }
            | TransportError::OpenFailed { kind, .. }
            | TransportError::ClaimInterfaceFailed { kind, .. }
            | TransportError::AltSettingFailed { kind, .. }
            | TransportError::Control { kind, .. } => *kind,
            TransportError::DeviceStatus { .. } | TransportError::BadStatus(_) => UsbErrorKind::Io,
            TransportError::Disconnected | TransportError::Closed => UsbErrorKind::NoDevice,
        }
    }
}

/// An open DFU-capable device handle: the block-transfer/status engine.
///
/// Implementations are synchronous; every call blocks until the device
/// answers or the current timeout expires.
pub trait DfuDevice: Send {
    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;

    fn interface_number(&self) -> u8;

    /// Alternate setting to select after claiming, if the match named one.
    fn alt_setting(&self) -> Option<u8>;

    /// Name of the matched alternate setting.
    fn alt_name(&self) -> &str;

    /// Device-advertised `wTransferSize`; zero if unknown.
    fn transfer_size(&self) -> u16;

    fn claim_interface(&mut self) -> Result<(), TransportError>;

    fn set_alt_setting(&mut self, alt: u8) -> Result<(), TransportError>;

    fn release_interface(&mut self) -> Result<(), TransportError>;

    fn get_status(&mut self) -> Result<DeviceStatus, TransportError>;

    fn clear_status(&mut self) -> Result<(), TransportError>;

    fn abort(&mut self) -> Result<(), TransportError>;

    /// Send one DNLOAD block. An empty `data` is the end-of-transfer marker.
    fn download(&mut self, transaction: u16, data: &[u8]) -> Result<(), TransportError>;

    fn detach(&mut self, timeout_ms: u16) -> Result<(), TransportError>;

    /// USB port reset; the device re-enumerates afterwards.
    fn reset(&mut self) -> Result<(), TransportError>;

    /// Drop the OS handle. Idempotent.
    fn close(&mut self);

    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration);
}

/// Bus access: enumerate, match and open devices.
pub trait UsbBus: Send {
    type Device: DfuDevice;

    /// Scan once for a device matching `identity` and open it.
    ///
    /// `Ok(None)` means nothing matching is currently visible.
    fn scan(&mut self, identity: &DeviceIdentity) -> Result<Option<Self::Device>, TransportError>;

    /// Drop any device references tracked from a previous scan.
    fn forget_devices(&mut self) {}

    /// Tear down the bus context at the end of a run.
    fn shutdown(&mut self) {}
}
