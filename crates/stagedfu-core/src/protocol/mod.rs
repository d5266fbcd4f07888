//! Protocol module - DFU request, state and descriptor definitions.

pub mod constants;
pub mod descriptor;
pub mod status;

pub use constants::*;
pub use descriptor::FunctionalDescriptor;
pub use status::{DeviceStatus, DfuState, DfuStatusCode, StatusError};
