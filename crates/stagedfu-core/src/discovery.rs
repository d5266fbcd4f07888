//! Device discovery with bounded retries.
//!
//! After a reset or a mode switch the target only shows up on the bus after
//! it has re-enumerated, so a miss is retried at a fixed spacing instead of
//! failing straight away.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::session::DeviceSession;
use crate::transport::{DeviceIdentity, DfuDevice, TransportError, UsbBus};

/// Default number of scans before giving up.
pub const DEFAULT_DISCOVERY_ATTEMPTS: u32 = 15;
/// Default spacing between scans.
pub const DEFAULT_DISCOVERY_DELAY: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("No DFU device found ({identity}) after {attempts} attempts")]
    NotFound {
        identity: DeviceIdentity,
        attempts: u32,
    },

    #[error("Bus error while looking for {identity}: {source}")]
    Bus {
        identity: DeviceIdentity,
        #[source]
        source: TransportError,
    },
}

/// How hard to look for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_DISCOVERY_ATTEMPTS,
            retry_delay: DEFAULT_DISCOVERY_DELAY,
        }
    }
}

/// Finds devices on a bus and wraps them in sessions.
pub struct DiscoveryService<B: UsbBus> {
    bus: B,
}

impl<B: UsbBus> DiscoveryService<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Tear down the bus context.
    pub fn shutdown(&mut self) {
        self.bus.forget_devices();
        self.bus.shutdown();
    }

    /// Scan up to `policy.max_attempts` times for a device matching `identity`.
    ///
    /// Returns on the first scan that finds it. A device that disappears while
    /// being opened counts as a miss; any other bus error ends the search.
    #[instrument(skip(self), fields(identity = %identity))]
    pub fn find(
        &mut self,
        identity: &DeviceIdentity,
        policy: RetryPolicy,
    ) -> Result<DeviceSession<B::Device>, DiscoveryError> {
        for attempt in 1..=policy.max_attempts {
            if attempt > 1 {
                debug!(attempt, "Retrying DFU device search");
                thread::sleep(policy.retry_delay);
            }

            self.bus.forget_devices();
            match self.bus.scan(identity) {
                Ok(Some(device)) => {
                    info!(
                        vid = %format!("{:04X}", device.vendor_id()),
                        pid = %format!("{:04X}", device.product_id()),
                        alt = %device.alt_name(),
                        attempt,
                        "Found DFU device"
                    );
                    return Ok(DeviceSession::new(device));
                }
                Ok(None) => {}
                Err(e) if e.kind().is_absent() => {
                    debug!(error = %e, "Device vanished during scan");
                }
                Err(source) => {
                    return Err(DiscoveryError::Bus {
                        identity: identity.clone(),
                        source,
                    });
                }
            }
        }

        Err(DiscoveryError::NotFound {
            identity: identity.clone(),
            attempts: policy.max_attempts,
        })
    }
}
