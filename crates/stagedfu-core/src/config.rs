//! Flash run configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::discovery::{DEFAULT_DISCOVERY_ATTEMPTS, DEFAULT_DISCOVERY_DELAY, RetryPolicy};
use crate::protocol::constants::*;
use crate::transfer::TransferOptions;
use crate::transport::DeviceIdentity;

/// One boot-chain stage: which file to send and which alt setting takes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// File name inside the source image.
    pub file: String,
    /// Alternate setting name the device exposes for this stage.
    pub alt_setting: String,
}

impl StageConfig {
    pub fn new(file: impl Into<String>, alt_setting: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            alt_setting: alt_setting.into(),
        }
    }
}

/// Configuration for a staged flash run.
///
/// Defaults describe the AM62x ROM boot flow: tiboot3 → tispl → u-boot, then
/// the raw image to eMMC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Alt setting that takes the raw image.
    pub final_alt_setting: String,
    pub discovery_attempts: u32,
    pub discovery_interval_ms: u64,
    /// Pause between boot-chain stages while the device re-enumerates.
    pub stage_settle_ms: u64,
    /// Pause after the last boot-chain stage.
    pub final_settle_ms: u64,
    /// Pause after the raw image while the device writes its boot partitions.
    pub commit_settle_ms: u64,
    /// Hold before reporting success.
    pub completion_hold_ms: u64,
    /// Boot-chain stages in transfer order.
    pub stages: Vec<StageConfig>,
    pub transfer: TransferOptions,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            vendor_id: TI_VENDOR_ID,
            product_id: TI_DFU_PRODUCT_ID,
            final_alt_setting: ALT_RAWEMMC.to_string(),
            discovery_attempts: DEFAULT_DISCOVERY_ATTEMPTS,
            discovery_interval_ms: DEFAULT_DISCOVERY_DELAY.as_millis() as u64,
            stage_settle_ms: 2000,
            final_settle_ms: 3000,
            commit_settle_ms: 15_000,
            completion_hold_ms: 1000,
            stages: vec![
                StageConfig::new(FILE_TIBOOT3, ALT_BOOTLOADER),
                StageConfig::new(FILE_TISPL, ALT_TISPL),
                StageConfig::new(FILE_UBOOT, ALT_UBOOT),
            ],
            transfer: TransferOptions::default(),
        }
    }
}

impl FlashConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlashConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Identity for `alt_setting` on the configured device.
    pub fn identity(&self, alt_setting: &str) -> DeviceIdentity {
        DeviceIdentity::new(self.vendor_id, self.product_id, alt_setting)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.discovery_attempts,
            retry_delay: Duration::from_millis(self.discovery_interval_ms),
        }
    }

    /// A copy with every pause zeroed, for simulated devices.
    pub fn without_delays(mut self) -> Self {
        self.discovery_interval_ms = 0;
        self.stage_settle_ms = 0;
        self.final_settle_ms = 0;
        self.commit_settle_ms = 0;
        self.completion_hold_ms = 0;
        self.transfer.min_block_poll_ms = 0;
        self.transfer.manifest_poll_ms = 0;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_reference_flow() {
        let config = FlashConfig::default();
        let alts: Vec<_> = config.stages.iter().map(|s| s.alt_setting.as_str()).collect();
        assert_eq!(alts, ["bootloader", "tispl.bin", "u-boot.img"]);
        assert_eq!(config.stages[0].file, "tiboot3.bin");
        assert_eq!(config.final_alt_setting, "rawemmc");
        assert_eq!(config.retry_policy().max_attempts, 15);
        assert_eq!(config.retry_policy().retry_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: FlashConfig = toml::from_str(
            r#"
            product_id = 0x6166
            stage_settle_ms = 500

            [transfer]
            stream_chunk = 8192
            "#,
        )
        .unwrap();
        assert_eq!(config.product_id, 0x6166);
        assert_eq!(config.vendor_id, TI_VENDOR_ID);
        assert_eq!(config.stage_settle_ms, 500);
        assert_eq!(config.transfer.stream_chunk, 8192);
        assert_eq!(config.stages.len(), 3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stagedfu.toml");
        let mut config = FlashConfig::default();
        config.final_alt_setting = "rawnand".into();

        config.save_to_file(&path).unwrap();
        assert_eq!(FlashConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(FlashConfig::load_from_file("/nonexistent/stagedfu.toml").is_err());
    }
}
