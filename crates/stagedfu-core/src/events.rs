//! Event system for UI decoupling.
//!
//! The flasher reports milestones, transfer progress and the terminal
//! outcome through a `FlashObserver`. A CLI, GUI or test harness picks the
//! observer it needs without the core knowing about it.

use std::fmt;
use std::sync::mpsc::Sender;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Phases of a staged flash run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    /// Pulling the boot binaries out of the source image.
    Extract,
    /// Sending the boot-chain binaries, one stage per re-enumeration.
    Bootloader,
    /// Waiting for the device to come back in its next mode.
    Settle,
    /// Streaming the raw image to the storage target.
    FinalImage,
    /// Device-side commit after the final transfer.
    Finalize,
    Complete,
    Error,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashPhase::Extract => write!(f, "Extract"),
            FlashPhase::Bootloader => write!(f, "Bootloader"),
            FlashPhase::Settle => write!(f, "Settle"),
            FlashPhase::FinalImage => write!(f, "Final Image"),
            FlashPhase::Finalize => write!(f, "Finalize"),
            FlashPhase::Complete => write!(f, "Complete"),
            FlashPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by a flash run.
#[derive(Debug, Clone, PartialEq)]
pub enum FlashEvent {
    /// Overall progress milestone.
    Progress { percent: u8, message: String },
    /// Phase changed.
    PhaseChanged { from: FlashPhase, to: FlashPhase },
    /// A stage found its device.
    DeviceConnected { vid: u16, pid: u16, alt: String },
    /// A stage finished its transfer.
    StageCompleted { stage: String, bytes: u64 },
    /// Streaming progress of the final image.
    Transfer { sent: u64, total: u64 },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Terminal: every stage succeeded.
    Complete,
    /// Terminal: the run stopped at `stage`.
    Failed { stage: String, message: String },
}

impl FlashEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlashEvent::Complete | FlashEvent::Failed { .. })
    }
}

/// Observer trait for receiving flash events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::Progress { percent, message } => {
                tracing::info!(progress = %format!("{}%", percent), "{}", message);
            }
            FlashEvent::PhaseChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Phase changed");
            }
            FlashEvent::DeviceConnected { vid, pid, alt } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), alt = %alt, "Device connected");
            }
            FlashEvent::StageCompleted { stage, bytes } => {
                tracing::info!(stage = %stage, bytes, "Stage complete");
            }
            FlashEvent::Transfer { sent, total } => {
                let pct = if *total > 0 { (*sent * 100) / *total } else { 0 };
                tracing::info!(
                    "Transferred {} / {} MB ({}%)",
                    sent / (1024 * 1024),
                    total / (1024 * 1024),
                    pct
                );
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::Complete => {
                tracing::info!("Flash complete");
            }
            FlashEvent::Failed { stage, message } => {
                tracing::error!(stage = %stage, "{}", message);
            }
        }
    }
}

/// Observer that forwards every event into a channel.
///
/// Events sent after the receiver has gone away are dropped.
pub struct ChannelObserver {
    tx: Sender<FlashEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<FlashEvent>) -> Self {
        Self { tx }
    }
}

impl FlashObserver for ChannelObserver {
    fn on_event(&self, event: &FlashEvent) {
        let _ = self.tx.send(event.clone());
    }
}
