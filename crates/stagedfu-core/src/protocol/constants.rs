//! Protocol constants for USB DFU 1.1 and the staged boot target.
//!
//! Request and state numbering follow the USB DFU 1.1 class specification.

use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// Texas Instruments Vendor ID
pub const TI_VENDOR_ID: u16 = 0x0451;
/// AM62x ROM / SPL / U-Boot DFU Product ID
pub const TI_DFU_PRODUCT_ID: u16 = 0x6165;

/// Alt setting accepting the first-stage ROM bootloader (tiboot3.bin).
pub const ALT_BOOTLOADER: &str = "bootloader";
/// Alt setting accepting the SPL bundle.
pub const ALT_TISPL: &str = "tispl.bin";
/// Alt setting accepting the U-Boot proper image.
pub const ALT_UBOOT: &str = "u-boot.img";
/// Alt setting exposing the raw eMMC user area.
pub const ALT_RAWEMMC: &str = "rawemmc";

/// Boot chain file names, in the order the device requests them.
pub const FILE_TIBOOT3: &str = "tiboot3.bin";
pub const FILE_TISPL: &str = "tispl.bin";
pub const FILE_UBOOT: &str = "u-boot.img";

// ============================================================================
// Interface Class
// ============================================================================

/// Application-specific interface class.
pub const DFU_INTERFACE_CLASS: u8 = 0xFE;
/// DFU interface subclass.
pub const DFU_INTERFACE_SUBCLASS: u8 = 0x01;

/// DFU functional descriptor type.
pub const DFU_FUNCTIONAL_DESC_TYPE: u8 = 0x21;
/// DFU functional descriptor length.
pub const DFU_FUNCTIONAL_DESC_LEN: usize = 9;

// ============================================================================
// Class Requests
// ============================================================================

pub const DFU_DETACH: u8 = 0;
pub const DFU_DNLOAD: u8 = 1;
pub const DFU_UPLOAD: u8 = 2;
pub const DFU_GETSTATUS: u8 = 3;
pub const DFU_CLRSTATUS: u8 = 4;
pub const DFU_GETSTATE: u8 = 5;
pub const DFU_ABORT: u8 = 6;

/// GETSTATUS reply length.
pub const DFU_STATUS_LEN: u16 = 6;

// ============================================================================
// Timing
// ============================================================================

/// Default timeout for every control transfer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
/// Timeout while streaming to slow storage; U-Boot may take minutes to flush
/// its DFU buffer to eMMC.
pub const STREAMING_TIMEOUT: Duration = Duration::from_millis(300_000);
/// wTimeout sent with DFU_DETACH.
pub const DETACH_TIMEOUT_MS: u16 = 1000;

/// Whole-file chunk size when the device does not advertise wTransferSize.
pub const DEFAULT_WHOLE_FILE_CHUNK: usize = 1024;
/// Streaming chunk size when the device does not advertise wTransferSize.
pub const DEFAULT_STREAM_CHUNK: usize = 4096;
/// Poll interval floor while waiting for a block to be accepted.
pub const MIN_BLOCK_POLL: Duration = Duration::from_millis(1);
/// Poll interval used during manifestation when the device reports zero.
pub const DEFAULT_MANIFEST_POLL: Duration = Duration::from_millis(100);
/// Streaming progress is reported each time this many bytes are crossed.
pub const PROGRESS_STEP_BYTES: u64 = 10 * 1024 * 1024;
