//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockBus, MockBusLog, MockCall, MockDevice, MockDeviceLog};
pub use self::nusb::{DfuAltSetting, DfuDeviceSummary, NusbBus, NusbDevice};
pub use traits::{DeviceIdentity, DfuDevice, TransportError, UsbBus, UsbErrorKind};
