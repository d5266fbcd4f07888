//! Staged flasher - high-level orchestrator for the full update sequence.
//!
//! Extract → boot-chain stages (one re-enumeration each) → settle → raw image
//! → settle → done. Every stage gets a freshly discovered device; nothing is
//! carried across a reset.

use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, instrument};

use crate::config::{FlashConfig, StageConfig};
use crate::discovery::DiscoveryService;
use crate::error::FlashError;
use crate::events::{ChannelObserver, FlashEvent, FlashObserver, FlashPhase, LogLevel, TracingObserver};
use crate::extract::{ImageExtractor, RawImage, extract_all};
use crate::session::DeviceSession;
use crate::transfer::{StreamReport, TransferEngine, WholeFileOutcome};
use crate::transport::{DfuDevice, UsbBus};

/// Result of one boot-chain stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: String,
    pub bytes: u64,
    pub outcome: WholeFileOutcome,
}

/// Result of a complete run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub stages: Vec<StageReport>,
    pub image: StreamReport,
}

/// Staged flasher - owns the bus for one run.
pub struct StagedFlasher<B: UsbBus, O: FlashObserver> {
    config: FlashConfig,
    discovery: DiscoveryService<B>,
    engine: TransferEngine,
    observer: Arc<O>,
    phase: FlashPhase,
}

impl<B: UsbBus> StagedFlasher<B, TracingObserver> {
    /// Create a flasher with the default tracing observer.
    pub fn new(config: FlashConfig, bus: B) -> Self {
        Self::with_observer(config, bus, Arc::new(TracingObserver))
    }
}

impl<B: UsbBus, O: FlashObserver> StagedFlasher<B, O> {
    /// Create a flasher with a custom observer.
    pub fn with_observer(config: FlashConfig, bus: B, observer: Arc<O>) -> Self {
        let engine = TransferEngine::new(config.transfer.clone());
        Self {
            config,
            discovery: DiscoveryService::new(bus),
            engine,
            observer,
            phase: FlashPhase::Extract,
        }
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// Run the complete sequence.
    ///
    /// The first failure ends the run. The bus is shut down exactly once and
    /// the observer sees exactly one terminal event, whatever the outcome.
    #[instrument(skip_all)]
    pub fn run<E, I>(&mut self, extractor: &mut E, image: &I) -> Result<FlashReport, FlashError>
    where
        E: ImageExtractor + ?Sized,
        I: RawImage + ?Sized,
    {
        let result = self.run_sequence(extractor, image);
        self.discovery.shutdown();

        match &result {
            Ok(_) => {
                self.enter(FlashPhase::Complete);
                self.emit(FlashEvent::Complete);
            }
            Err(e) => {
                self.enter(FlashPhase::Error);
                self.emit(FlashEvent::Failed {
                    stage: e.stage().to_string(),
                    message: e.to_string(),
                });
            }
        }
        result
    }

    fn run_sequence<E, I>(&mut self, extractor: &mut E, image: &I) -> Result<FlashReport, FlashError>
    where
        E: ImageExtractor + ?Sized,
        I: RawImage + ?Sized,
    {
        let stages = self.config.stages.clone();

        self.progress(38, "Extracting bootloader files from image...");
        let names: Vec<&str> = stages.iter().map(|s| s.file.as_str()).collect();
        let payloads = extract_all(extractor, &names)?;

        self.enter(FlashPhase::Bootloader);
        self.progress(45, "Sending bootloader files...");
        let mut reports = Vec::with_capacity(stages.len());
        for (i, (stage, payload)) in stages.iter().zip(&payloads).enumerate() {
            let (sending, sent) = stage_percent(i);
            self.progress(sending, format!("Sending {}...", stage.alt_setting));
            let report = self.flash_stage(stage, payload)?;
            self.emit(FlashEvent::StageCompleted {
                stage: report.stage.clone(),
                bytes: report.bytes,
            });
            reports.push(report);
            self.progress(sent, format!("{} sent", stage.alt_setting));

            if i + 1 < stages.len() {
                self.enter(FlashPhase::Settle);
                self.progress(sent, "Waiting for device to reconnect...");
                settle(self.config.stage_settle_ms);
                self.enter(FlashPhase::Bootloader);
            }
        }

        self.enter(FlashPhase::Settle);
        self.progress(77, "Waiting for device to enter DFU mode...");
        settle(self.config.final_settle_ms);

        self.enter(FlashPhase::FinalImage);
        self.progress(80, "Sending image to device (this may take several minutes)...");
        let image_report = self.flash_image(image)?;

        self.enter(FlashPhase::Finalize);
        self.progress(95, "Writing boot binaries to eMMC (do not power off)...");
        settle(self.config.commit_settle_ms);

        self.progress(100, "System image sent successfully!");
        settle(self.config.completion_hold_ms);

        Ok(FlashReport {
            stages: reports,
            image: image_report,
        })
    }

    /// Discover, claim and send one boot binary; the device resets afterwards.
    fn flash_stage(&mut self, stage: &StageConfig, payload: &[u8]) -> Result<StageReport, FlashError> {
        let alt = stage.alt_setting.as_str();
        let mut session = self.acquire(alt)?;
        let mut claimed = session
            .claim()
            .map_err(|e| FlashError::from_session(alt, e))?;

        let outcome = self
            .engine
            .send_whole_file(&mut claimed, payload, true)
            .map_err(|e| FlashError::from_transfer(alt, e))?;

        if let WholeFileOutcome::ExpectedDisconnect(kind) = outcome {
            self.emit(FlashEvent::Log {
                level: LogLevel::Debug,
                message: format!("{alt}: device disconnected after transfer ({kind}), expected"),
            });
        }

        Ok(StageReport {
            stage: alt.to_string(),
            bytes: payload.len() as u64,
            outcome,
        })
    }

    /// Stream the raw image to the final alt setting.
    fn flash_image<I: RawImage + ?Sized>(&mut self, image: &I) -> Result<StreamReport, FlashError> {
        let alt = self.config.final_alt_setting.clone();
        let image_error = |source: io::Error| FlashError::FileIo {
            stage: alt.clone(),
            message: format!("Image not found: {source}"),
            source: Some(source),
        };
        let total = image.size().map_err(image_error)?;
        let mut reader = image.open().map_err(image_error)?;

        let mut session = self.acquire(&alt)?;
        let mut claimed = session
            .claim()
            .map_err(|e| FlashError::from_session(&alt, e))?;

        info!(
            stage = %alt,
            size_mb = total / (1024 * 1024),
            "Streaming image to device"
        );
        let observer = Arc::clone(&self.observer);
        self.engine
            .send_streaming(&mut claimed, &mut reader, total, |p| {
                observer.on_event(&FlashEvent::Transfer {
                    sent: p.sent,
                    total: p.total,
                })
            })
            .map_err(|e| FlashError::from_transfer(&alt, e))
    }

    fn acquire(&mut self, alt: &str) -> Result<DeviceSession<B::Device>, FlashError> {
        let identity = self.config.identity(alt);
        let session = self
            .discovery
            .find(&identity, self.config.retry_policy())
            .map_err(|source| FlashError::DeviceNotFound {
                stage: alt.to_string(),
                source,
            })?;

        let device = session.device();
        self.emit(FlashEvent::DeviceConnected {
            vid: device.vendor_id(),
            pid: device.product_id(),
            alt: device.alt_name().to_string(),
        });
        Ok(session)
    }

    fn enter(&mut self, to: FlashPhase) {
        if self.phase != to {
            let from = self.phase;
            self.phase = to;
            self.emit(FlashEvent::PhaseChanged { from, to });
        }
    }

    fn progress(&self, percent: u8, message: impl Into<String>) {
        self.emit(FlashEvent::Progress {
            percent,
            message: message.into(),
        });
    }

    fn emit(&self, event: FlashEvent) {
        self.observer.on_event(&event);
    }
}

/// Percentages reported around boot-chain stage `index`: (sending, sent).
fn stage_percent(index: usize) -> (u8, u8) {
    let sending = (45 + index * 10).min(75) as u8;
    let sent = (55 + index * 10).min(75) as u8;
    (sending, sent)
}

fn settle(ms: u64) {
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms));
    }
}

/// A flash run on its worker thread.
pub struct FlashHandle {
    events: Receiver<FlashEvent>,
    worker: JoinHandle<Result<FlashReport, FlashError>>,
}

impl FlashHandle {
    /// Event stream; ends after the terminal `Complete` or `Failed`.
    pub fn events(&self) -> &Receiver<FlashEvent> {
        &self.events
    }

    /// Wait for the worker and return its outcome.
    pub fn join(self) -> Result<FlashReport, FlashError> {
        match self.worker.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Run the full sequence on a dedicated worker thread.
pub fn start<B, E, I>(config: FlashConfig, bus: B, extractor: E, image: I) -> io::Result<FlashHandle>
where
    B: UsbBus + 'static,
    E: ImageExtractor + 'static,
    I: RawImage + 'static,
{
    let (tx, events) = mpsc::channel();
    let worker = thread::Builder::new()
        .name("stagedfu-worker".into())
        .spawn(move || {
            let mut extractor = extractor;
            let observer = Arc::new(ChannelObserver::new(tx));
            StagedFlasher::with_observer(config, bus, observer).run(&mut extractor, &image)
        })?;
    Ok(FlashHandle { events, worker })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{FileImage, MemoryExtractor};
    use crate::protocol::{DeviceStatus, DfuState, DfuStatusCode};
    use crate::transfer::ManifestOutcome;
    use crate::transport::{MockBus, MockBusLog, MockDevice, UsbErrorKind};

    const MIB: u64 = 1024 * 1024;

    fn config() -> FlashConfig {
        FlashConfig {
            discovery_attempts: 3,
            ..FlashConfig::default()
        }
        .without_delays()
    }

    fn boot_files() -> MemoryExtractor {
        MemoryExtractor::new()
            .with_file("tiboot3.bin", vec![0x11; 128])
            .with_file("tispl.bin", vec![0x22; 4096])
            .with_file("u-boot.img", vec![0x33; 90_000])
    }

    /// Three boot stages that drop off the bus after the terminator, then
    /// the storage target.
    fn full_bus(rawemmc: MockDevice) -> MockBus {
        let mut bus = MockBus::new();
        for alt in ["bootloader", "tispl.bin", "u-boot.img"] {
            bus.push_device(MockDevice::new(alt).disconnect_on_terminator(UsbErrorKind::NoDevice));
        }
        bus.push_device(rawemmc);
        bus
    }

    fn run(
        bus: MockBus,
        mut extractor: MemoryExtractor,
        image: &dyn RawImage,
    ) -> (Result<FlashReport, FlashError>, Vec<FlashEvent>, MockBusLog) {
        let log = bus.log();
        let (tx, rx) = mpsc::channel();
        let mut flasher =
            StagedFlasher::with_observer(config(), bus, Arc::new(ChannelObserver::new(tx)));
        let result = flasher.run(&mut extractor, image);
        drop(flasher);
        (result, rx.iter().collect(), log)
    }

    fn percents(events: &[FlashEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                FlashEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect()
    }

    fn assert_single_terminal(events: &[FlashEvent]) {
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(events.last().unwrap().is_terminal());
    }

    #[test]
    fn test_three_stages_with_disconnects() {
        let rawemmc = MockDevice::new("rawemmc");
        let raw_log = rawemmc.log();
        let (result, events, log) = run(full_bus(rawemmc), boot_files(), &vec![0x44u8; 8192]);

        let report = result.unwrap();
        let sizes: Vec<u64> = report.stages.iter().map(|s| s.bytes).collect();
        assert_eq!(sizes, vec![128, 4096, 90_000]);
        assert!(report.stages.iter().all(|s| {
            s.outcome == WholeFileOutcome::ExpectedDisconnect(UsbErrorKind::NoDevice)
        }));
        assert_eq!(report.image.bytes_sent, 8192);
        assert_eq!(report.image.manifest, ManifestOutcome::Idle);

        let completed: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                FlashEvent::StageCompleted { stage, .. } => Some(stage.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(completed, ["bootloader", "tispl.bin", "u-boot.img"]);
        assert_eq!(
            percents(&events),
            vec![38, 45, 45, 55, 55, 55, 65, 65, 65, 75, 77, 80, 95, 100]
        );
        assert_eq!(events.last(), Some(&FlashEvent::Complete));
        assert_single_terminal(&events);

        assert_eq!(log.opened(), ["bootloader", "tispl.bin", "u-boot.img", "rawemmc"]);
        assert_eq!(log.scans(), 4);
        assert_eq!(log.shutdowns(), 1);
        assert_eq!(raw_log.bytes_received(), 8192);
    }

    #[test]
    fn test_large_image_reports_every_ten_megabytes() {
        let total = 50 * MIB;
        let rawemmc = MockDevice::new("rawemmc").with_transfer_size(4096);
        let raw_log = rawemmc.log();
        let (result, events, _) = run(full_bus(rawemmc), boot_files(), &vec![0u8; total as usize]);

        assert_eq!(result.unwrap().image.blocks, (total / 4096) as u32);
        let sent: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                FlashEvent::Transfer { sent, total: t } => {
                    assert_eq!(*t, total);
                    Some(*sent)
                }
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![10 * MIB, 20 * MIB, 30 * MIB, 40 * MIB, 50 * MIB]);
        assert_eq!(raw_log.bytes_received(), total);
        assert_single_terminal(&events);
        assert_eq!(events.last(), Some(&FlashEvent::Complete));
    }

    #[test]
    fn test_missing_boot_file_fails_before_any_scan() {
        let extractor = MemoryExtractor::new()
            .with_file("tiboot3.bin", vec![1; 16])
            .with_file("tispl.bin", vec![2; 16]);
        let (result, events, log) = run(full_bus(MockDevice::new("rawemmc")), extractor, &vec![0u8; 16]);

        assert!(matches!(result, Err(FlashError::Extraction(_))));
        assert_eq!(log.scans(), 0);
        assert_eq!(log.shutdowns(), 1);
        match events.last() {
            Some(FlashEvent::Failed { stage, message }) => {
                assert_eq!(stage, "extract");
                assert!(message.contains("u-boot.img"));
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
        assert_single_terminal(&events);
    }

    #[test]
    fn test_device_missing_after_reset_stops_run() {
        let mut bus = MockBus::new();
        bus.push_device(
            MockDevice::new("bootloader").disconnect_on_terminator(UsbErrorKind::NoDevice),
        );
        let (result, events, log) = run(bus, boot_files(), &vec![0u8; 16]);

        match result {
            Err(FlashError::DeviceNotFound { ref stage, .. }) => assert_eq!(stage, "tispl.bin"),
            other => panic!("unexpected: {:?}", other.err()),
        }
        // One scan for stage one, then the configured three attempts.
        assert_eq!(log.scans(), 4);
        assert_eq!(log.shutdowns(), 1);
        assert_single_terminal(&events);
    }

    #[test]
    fn test_fatal_error_class_fails_fast() {
        let mut bus = MockBus::new();
        bus.push_device(MockDevice::new("bootloader").fail_download(0, UsbErrorKind::Busy))
            .push_device(MockDevice::new("tispl.bin"));
        let (result, events, log) = run(bus, boot_files(), &vec![0u8; 16]);

        let err = result.unwrap_err();
        assert!(matches!(err, FlashError::Transfer { .. }));
        assert_eq!(err.stage(), "bootloader");
        assert_eq!(err.usb_kind(), Some(UsbErrorKind::Busy));
        assert_eq!(log.scans(), 1);
        assert_eq!(percents(&events), vec![38, 45, 45]);
        assert_single_terminal(&events);
    }

    #[test]
    fn test_missing_image_fails_before_final_discovery() {
        let image = FileImage::new("/nonexistent/stagedfu/raw.img");
        let (result, events, log) = run(full_bus(MockDevice::new("rawemmc")), boot_files(), &image);

        match result {
            Err(FlashError::FileIo { ref stage, .. }) => assert_eq!(stage, "rawemmc"),
            other => panic!("unexpected: {:?}", other.err()),
        }
        assert_eq!(log.scans(), 3);
        assert_single_terminal(&events);
    }

    #[test]
    fn test_manifestation_error_at_final_stage() {
        let rawemmc = MockDevice::new("rawemmc").with_manifest_statuses([Ok(DeviceStatus::new(
            DfuState::DfuError,
            DfuStatusCode::ErrWrite,
            0,
        ))]);
        let raw_log = rawemmc.log();
        let (result, events, _) = run(full_bus(rawemmc), boot_files(), &vec![0u8; 1000]);

        assert!(matches!(
            result,
            Err(FlashError::Manifestation {
                status: DfuStatusCode::ErrWrite,
                ..
            })
        ));
        assert!(!percents(&events).contains(&95));
        assert_eq!(
            raw_log.count(|c| *c == crate::transport::MockCall::ReleaseInterface),
            1
        );
    }

    #[test]
    fn test_start_runs_on_worker() {
        let handle = start(
            config(),
            full_bus(MockDevice::new("rawemmc")),
            boot_files(),
            vec![0u8; 4096],
        )
        .unwrap();

        let events: Vec<FlashEvent> = handle.events().iter().collect();
        assert_single_terminal(&events);
        assert_eq!(events.last(), Some(&FlashEvent::Complete));
        assert_eq!(handle.join().unwrap().stages.len(), 3);
    }
}
