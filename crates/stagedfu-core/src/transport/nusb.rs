//! nusb-based USB transport implementation.

use std::num::NonZeroU8;
use std::time::Duration;

use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::{MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{DeviceIdentity, DfuDevice, TransportError, UsbBus, UsbErrorKind};
use crate::protocol::constants::*;
use crate::protocol::{DeviceStatus, FunctionalDescriptor};

/// One DFU alternate setting found on a device.
#[derive(Debug, Clone)]
pub struct DfuAltSetting {
    pub interface: u8,
    pub alt_setting: u8,
    pub name: String,
    pub transfer_size: u16,
}

/// Summary of a DFU-capable device, for listing.
#[derive(Debug, Clone)]
pub struct DfuDeviceSummary {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_id: String,
    pub address: u8,
    pub alt_settings: Vec<DfuAltSetting>,
}

/// nusb bus access.
#[derive(Default)]
pub struct NusbBus {
    tracked: Option<nusb::DeviceInfo>,
}

impl NusbBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// List every DFU-capable device with the given IDs and its alt settings.
    pub fn list_dfu_devices(
        vendor_id: Option<u16>,
        product_id: Option<u16>,
    ) -> Result<Vec<DfuDeviceSummary>, TransportError> {
        let devices = list_devices().wait().map_err(|e| TransportError::Enumeration {
            kind: map_error(&e),
            message: e.to_string(),
        })?;

        let mut found = Vec::new();
        for info in devices.filter(|d| {
            vendor_id.is_none_or(|id| d.vendor_id() == id)
                && product_id.is_none_or(|id| d.product_id() == id)
        }) {
            let device = match info.open().wait() {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "Skipping device that could not be opened");
                    continue;
                }
            };
            let alt_settings = dfu_alt_settings(&device);
            if alt_settings.is_empty() {
                continue;
            }
            found.push(DfuDeviceSummary {
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
                bus_id: info.bus_id().to_string(),
                address: info.device_address(),
                alt_settings,
            });
        }
        Ok(found)
    }
}

impl UsbBus for NusbBus {
    type Device = NusbDevice;

    #[instrument(level = "debug", skip(self), fields(identity = %identity))]
    fn scan(&mut self, identity: &DeviceIdentity) -> Result<Option<NusbDevice>, TransportError> {
        let devices = list_devices().wait().map_err(|e| TransportError::Enumeration {
            kind: map_error(&e),
            message: e.to_string(),
        })?;

        for info in devices
            .filter(|d| d.vendor_id() == identity.vendor_id && d.product_id() == identity.product_id)
        {
            let device = match info.open().wait() {
                Ok(d) => d,
                Err(e) => {
                    let kind = map_error(&e);
                    if kind.is_absent() {
                        debug!(error = %e, "Device vanished before open");
                        continue;
                    }
                    return Err(TransportError::OpenFailed {
                        kind,
                        message: e.to_string(),
                    });
                }
            };

            let Some(alt) = dfu_alt_settings(&device)
                .into_iter()
                .find(|alt| identity.alt_setting.is_empty() || alt.name == identity.alt_setting)
            else {
                continue;
            };

            info!(
                vendor_id = %format!("{:04X}", info.vendor_id()),
                product_id = %format!("{:04X}", info.product_id()),
                interface = alt.interface,
                alt = alt.alt_setting,
                name = %alt.name,
                "Found DFU device"
            );

            self.tracked = Some(info.clone());
            return Ok(Some(NusbDevice {
                device: Some(device),
                interface: None,
                vid: info.vendor_id(),
                pid: info.product_id(),
                interface_number: alt.interface,
                alt: (!identity.alt_setting.is_empty()).then_some(alt.alt_setting),
                alt_name: alt.name,
                transfer_size: alt.transfer_size,
                timeout: DEFAULT_TIMEOUT,
            }));
        }

        Ok(None)
    }

    fn forget_devices(&mut self) {
        if let Some(info) = self.tracked.take() {
            debug!(bus = %info.bus_id(), address = info.device_address(), "Dropping tracked device");
        }
    }

    fn shutdown(&mut self) {
        self.forget_devices();
    }
}

/// Open DFU device handle on nusb.
pub struct NusbDevice {
    device: Option<nusb::Device>,
    interface: Option<nusb::Interface>,
    vid: u16,
    pid: u16,
    interface_number: u8,
    alt: Option<u8>,
    alt_name: String,
    transfer_size: u16,
    timeout: Duration,
}

impl NusbDevice {
    fn control_out(
        &self,
        request: u8,
        name: &'static str,
        value: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let interface = self.interface.as_ref().ok_or(TransportError::Closed)?;
        interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: self.interface_number as u16,
                    data,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| TransportError::Control {
                request: name,
                kind: map_transfer_error(&e),
            })
    }

    fn control_in(
        &self,
        request: u8,
        name: &'static str,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        let interface = self.interface.as_ref().ok_or(TransportError::Closed)?;
        interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: self.interface_number as u16,
                    length,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| TransportError::Control {
                request: name,
                kind: map_transfer_error(&e),
            })
    }
}

impl DfuDevice for NusbDevice {
    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }

    fn interface_number(&self) -> u8 {
        self.interface_number
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
        let device = self.device.as_ref().ok_or(TransportError::Closed)?;
        let interface = device
            .claim_interface(self.interface_number)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: self.interface_number,
                kind: map_error(&e),
                message: e.to_string(),
            })?;
        self.interface = Some(interface);
        Ok(())
    }

    fn set_alt_setting(&mut self, alt: u8) -> Result<(), TransportError> {
        let interface = self.interface.as_ref().ok_or(TransportError::Closed)?;
        interface
            .set_alt_setting(alt)
            .wait()
            .map_err(|e| TransportError::AltSettingFailed {
                alt,
                kind: map_error(&e),
                message: e.to_string(),
            })
    }

    fn release_interface(&mut self) -> Result<(), TransportError> {
        // nusb releases the interface when the handle is dropped.
        self.interface = None;
        Ok(())
    }

    fn get_status(&mut self) -> Result<DeviceStatus, TransportError> {
        let data = self.control_in(DFU_GETSTATUS, "DFU_GETSTATUS", 0, DFU_STATUS_LEN)?;
        Ok(DeviceStatus::from_bytes(&data)?)
    }

    fn clear_status(&mut self) -> Result<(), TransportError> {
        self.control_out(DFU_CLRSTATUS, "DFU_CLRSTATUS", 0, &[])
    }

    fn abort(&mut self) -> Result<(), TransportError> {
        self.control_out(DFU_ABORT, "DFU_ABORT", 0, &[])
    }

    fn download(&mut self, transaction: u16, data: &[u8]) -> Result<(), TransportError> {
        self.control_out(DFU_DNLOAD, "DFU_DNLOAD", transaction, data)
    }

    fn detach(&mut self, timeout_ms: u16) -> Result<(), TransportError> {
        self.control_out(DFU_DETACH, "DFU_DETACH", timeout_ms, &[])
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        let device = self.device.as_ref().ok_or(TransportError::Closed)?;
        device.reset().wait().map_err(|e| TransportError::Control {
            request: "USB_RESET",
            kind: map_error(&e),
        })
    }

    fn close(&mut self) {
        self.interface = None;
        self.device = None;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

/// Collect the DFU alt settings of an open device with their interface names.
fn dfu_alt_settings(device: &nusb::Device) -> Vec<DfuAltSetting> {
    let mut found = Vec::new();
    for config in device.configurations() {
        for alt in config.interface_alt_settings() {
            if alt.class() != DFU_INTERFACE_CLASS || alt.subclass() != DFU_INTERFACE_SUBCLASS {
                continue;
            }
            let name = alt
                .string_index()
                .and_then(|idx| get_string_descriptor(device, idx))
                .unwrap_or_default();
            let transfer_size = alt
                .descriptors()
                .find_map(|desc| FunctionalDescriptor::parse(&desc))
                .map(|desc| desc.transfer_size())
                .unwrap_or(0);
            found.push(DfuAltSetting {
                interface: alt.interface_number(),
                alt_setting: alt.alternate_setting(),
                name,
                transfer_size,
            });
        }
    }
    found
}

fn get_string_descriptor(device: &nusb::Device, index: NonZeroU8) -> Option<String> {
    let language = device
        .get_string_descriptor_supported_languages(DEFAULT_TIMEOUT)
        .wait()
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);

    device
        .get_string_descriptor(index, language, DEFAULT_TIMEOUT)
        .wait()
        .ok()
}

fn map_error(err: &nusb::Error) -> UsbErrorKind {
    match err.kind() {
        nusb::ErrorKind::Disconnected => UsbErrorKind::NoDevice,
        nusb::ErrorKind::Busy => UsbErrorKind::Busy,
        nusb::ErrorKind::PermissionDenied => UsbErrorKind::Access,
        nusb::ErrorKind::NotFound => UsbErrorKind::NotFound,
        nusb::ErrorKind::Unsupported => UsbErrorKind::NotSupported,
        _ => UsbErrorKind::Other,
    }
}

fn map_transfer_error(err: &nusb::transfer::TransferError) -> UsbErrorKind {
    use nusb::transfer::TransferError;
    match err {
        // Timed-out transfers are cancelled.
        TransferError::Cancelled => UsbErrorKind::Timeout,
        TransferError::Stall => UsbErrorKind::Pipe,
        TransferError::Disconnected => UsbErrorKind::NoDevice,
        TransferError::Fault => UsbErrorKind::Io,
        _ => UsbErrorKind::Io,
    }
}
