//! DFU_GETSTATUS reply parsing.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

use super::constants::DFU_STATUS_LEN;

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Status reply too short: expected {expected}, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device state (`bState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DfuDnloadSync,
    DfuDnloadBusy,
    DfuDnloadIdle,
    DfuManifestSync,
    DfuManifest,
    DfuManifestWaitReset,
    DfuUploadIdle,
    DfuError,
    Unknown(u8),
}

impl From<u8> for DfuState {
    fn from(raw: u8) -> Self {
        match raw {
            0 => DfuState::AppIdle,
            1 => DfuState::AppDetach,
            2 => DfuState::DfuIdle,
            3 => DfuState::DfuDnloadSync,
            4 => DfuState::DfuDnloadBusy,
            5 => DfuState::DfuDnloadIdle,
            6 => DfuState::DfuManifestSync,
            7 => DfuState::DfuManifest,
            8 => DfuState::DfuManifestWaitReset,
            9 => DfuState::DfuUploadIdle,
            10 => DfuState::DfuError,
            other => DfuState::Unknown(other),
        }
    }
}

impl From<DfuState> for u8 {
    fn from(state: DfuState) -> Self {
        match state {
            DfuState::AppIdle => 0,
            DfuState::AppDetach => 1,
            DfuState::DfuIdle => 2,
            DfuState::DfuDnloadSync => 3,
            DfuState::DfuDnloadBusy => 4,
            DfuState::DfuDnloadIdle => 5,
            DfuState::DfuManifestSync => 6,
            DfuState::DfuManifest => 7,
            DfuState::DfuManifestWaitReset => 8,
            DfuState::DfuUploadIdle => 9,
            DfuState::DfuError => 10,
            DfuState::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::AppIdle => write!(f, "appIDLE"),
            DfuState::AppDetach => write!(f, "appDETACH"),
            DfuState::DfuIdle => write!(f, "dfuIDLE"),
            DfuState::DfuDnloadSync => write!(f, "dfuDNLOAD-SYNC"),
            DfuState::DfuDnloadBusy => write!(f, "dfuDNBUSY"),
            DfuState::DfuDnloadIdle => write!(f, "dfuDNLOAD-IDLE"),
            DfuState::DfuManifestSync => write!(f, "dfuMANIFEST-SYNC"),
            DfuState::DfuManifest => write!(f, "dfuMANIFEST"),
            DfuState::DfuManifestWaitReset => write!(f, "dfuMANIFEST-WAIT-RESET"),
            DfuState::DfuUploadIdle => write!(f, "dfuUPLOAD-IDLE"),
            DfuState::DfuError => write!(f, "dfuERROR"),
            DfuState::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}

/// Device status (`bStatus`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuStatusCode {
    Ok,
    ErrTarget,
    ErrFile,
    ErrWrite,
    ErrErase,
    ErrCheckErased,
    ErrProg,
    ErrVerify,
    ErrAddress,
    ErrNotDone,
    ErrFirmware,
    ErrVendor,
    ErrUsbReset,
    ErrPowerOnReset,
    ErrUnknown,
    ErrStalledPkt,
    Unknown(u8),
}

impl From<u8> for DfuStatusCode {
    fn from(raw: u8) -> Self {
        match raw {
            0x00 => DfuStatusCode::Ok,
            0x01 => DfuStatusCode::ErrTarget,
            0x02 => DfuStatusCode::ErrFile,
            0x03 => DfuStatusCode::ErrWrite,
            0x04 => DfuStatusCode::ErrErase,
            0x05 => DfuStatusCode::ErrCheckErased,
            0x06 => DfuStatusCode::ErrProg,
            0x07 => DfuStatusCode::ErrVerify,
            0x08 => DfuStatusCode::ErrAddress,
            0x09 => DfuStatusCode::ErrNotDone,
            0x0A => DfuStatusCode::ErrFirmware,
            0x0B => DfuStatusCode::ErrVendor,
            0x0C => DfuStatusCode::ErrUsbReset,
            0x0D => DfuStatusCode::ErrPowerOnReset,
            0x0E => DfuStatusCode::ErrUnknown,
            0x0F => DfuStatusCode::ErrStalledPkt,
            other => DfuStatusCode::Unknown(other),
        }
    }
}

impl fmt::Display for DfuStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuStatusCode::Ok => write!(f, "OK"),
            DfuStatusCode::ErrTarget => write!(f, "errTARGET"),
            DfuStatusCode::ErrFile => write!(f, "errFILE"),
            DfuStatusCode::ErrWrite => write!(f, "errWRITE"),
            DfuStatusCode::ErrErase => write!(f, "errERASE"),
            DfuStatusCode::ErrCheckErased => write!(f, "errCHECK_ERASED"),
            DfuStatusCode::ErrProg => write!(f, "errPROG"),
            DfuStatusCode::ErrVerify => write!(f, "errVERIFY"),
            DfuStatusCode::ErrAddress => write!(f, "errADDRESS"),
            DfuStatusCode::ErrNotDone => write!(f, "errNOTDONE"),
            DfuStatusCode::ErrFirmware => write!(f, "errFIRMWARE"),
            DfuStatusCode::ErrVendor => write!(f, "errVENDOR"),
            DfuStatusCode::ErrUsbReset => write!(f, "errUSBR"),
            DfuStatusCode::ErrPowerOnReset => write!(f, "errPOR"),
            DfuStatusCode::ErrUnknown => write!(f, "errUNKNOWN"),
            DfuStatusCode::ErrStalledPkt => write!(f, "errSTALLEDPKT"),
            DfuStatusCode::Unknown(raw) => write!(f, "unknown(0x{:02X})", raw),
        }
    }
}

/// Snapshot returned by one DFU_GETSTATUS request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub status: DfuStatusCode,
    pub state: DfuState,
    /// `bwPollTimeout`, 24-bit milliseconds.
    pub poll_timeout_ms: u32,
}

impl DeviceStatus {
    pub fn new(state: DfuState, status: DfuStatusCode, poll_timeout_ms: u32) -> Self {
        Self {
            status,
            state,
            poll_timeout_ms,
        }
    }

    /// Status with `OK` code and no poll delay.
    pub fn ok(state: DfuState) -> Self {
        Self::new(state, DfuStatusCode::Ok, 0)
    }

    /// Parse the 6-byte GETSTATUS reply.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StatusError> {
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(StatusError::TooShort {
                expected: DFU_STATUS_LEN as usize,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let status = DfuStatusCode::from(cursor.read_u8()?);
        let poll_timeout_ms = cursor.read_u24::<LittleEndian>()?;
        let state = DfuState::from(cursor.read_u8()?);
        Ok(Self {
            status,
            state,
            poll_timeout_ms,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == DfuStatusCode::Ok
    }

    /// The device accepted the last block and wants the next one.
    pub fn is_ready_for_block(&self) -> bool {
        self.state == DfuState::DfuDnloadIdle
    }

    pub fn is_error(&self) -> bool {
        self.state == DfuState::DfuError
    }

    /// Leftover download/upload state from an aborted session.
    pub fn is_transfer_in_progress(&self) -> bool {
        matches!(self.state, DfuState::DfuDnloadIdle | DfuState::DfuUploadIdle)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state={} status={} poll={}ms",
            self.state, self.status, self.poll_timeout_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dnload_idle() {
        let st = DeviceStatus::from_bytes(&[0x00, 0x10, 0x27, 0x00, 0x05, 0x00]).unwrap();
        assert_eq!(st.status, DfuStatusCode::Ok);
        assert_eq!(st.state, DfuState::DfuDnloadIdle);
        assert_eq!(st.poll_timeout_ms, 10_000);
        assert!(st.is_ready_for_block());
        assert!(st.is_transfer_in_progress());
    }

    #[test]
    fn test_parse_error_state() {
        let st = DeviceStatus::from_bytes(&[0x03, 0x00, 0x00, 0x00, 0x0A, 0x00]).unwrap();
        assert_eq!(st.status, DfuStatusCode::ErrWrite);
        assert!(st.is_error());
        assert!(!st.is_ok());
    }

    #[test]
    fn test_parse_24bit_poll_timeout() {
        let st = DeviceStatus::from_bytes(&[0x00, 0x01, 0x02, 0x03, 0x02, 0x00]).unwrap();
        assert_eq!(st.poll_timeout_ms, 0x030201);
        assert_eq!(st.state, DfuState::DfuIdle);
    }

    #[test]
    fn test_short_reply() {
        assert!(matches!(
            DeviceStatus::from_bytes(&[0, 0, 0]),
            Err(StatusError::TooShort { actual: 3, .. })
        ));
    }

    #[test]
    fn test_unknown_codes_preserved() {
        let st = DeviceStatus::from_bytes(&[0x42, 0, 0, 0, 0x20, 0]).unwrap();
        assert_eq!(st.status, DfuStatusCode::Unknown(0x42));
        assert_eq!(st.state, DfuState::Unknown(0x20));
        assert_eq!(u8::from(st.state), 0x20);
    }
}
