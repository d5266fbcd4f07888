//! stagedfu-core: staged USB DFU flashing in Rust.
//!
//! This crate drives a multi-stage DFU update: boot-chain binaries are sent
//! one at a time (the device re-enumerates after each), then a raw disk
//! image is streamed to the storage target. The reference target is a TI
//! AM62x-class SoC in USB DFU boot mode.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: DFU 1.1 constants, status and descriptor parsing
//! - **Transport**: USB bus/device abstraction (nusb, mock)
//! - **Session**: Interface claim/release and device state normalization
//! - **Discovery**: Bounded-retry device lookup
//! - **Transfer**: Whole-file and streaming downloads, disconnect classification
//! - **Events**: Observer pattern for UI decoupling
//! - **Flasher**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use stagedfu_core::{DirectoryExtractor, FileImage, FlashConfig, NusbBus, StagedFlasher};
//!
//! let mut flasher = StagedFlasher::new(FlashConfig::default(), NusbBus::new());
//! let mut boot_files = DirectoryExtractor::new("/mnt/boot");
//! flasher
//!     .run(&mut boot_files, &FileImage::new("disk.img"))
//!     .expect("flash failed");
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod extract;
pub mod flasher;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use config::{FlashConfig, StageConfig};
pub use discovery::{DiscoveryError, DiscoveryService, RetryPolicy};
pub use error::FlashError;
pub use events::{
    ChannelObserver, FlashEvent, FlashObserver, FlashPhase, LogLevel, NullObserver,
    TracingObserver,
};
pub use extract::{
    DirectoryExtractor, ExtractError, FileImage, ImageExtractor, MemoryExtractor, RawImage,
};
pub use flasher::{FlashHandle, FlashReport, StageReport, StagedFlasher, start};
pub use protocol::{DeviceStatus, DfuState, DfuStatusCode};
pub use session::{ClaimedSession, DeviceSession, SessionError};
pub use transfer::{
    StreamProgress, StreamReport, TransferEngine, TransferError, TransferOptions,
    WholeFileOutcome,
};
pub use transport::{
    DeviceIdentity, DfuDevice, MockBus, MockDevice, NusbBus, NusbDevice, TransportError, UsbBus,
    UsbErrorKind,
};
