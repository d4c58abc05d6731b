//! Registration handoff to the monitoring subsystem
//!
//! The monitor discovers its targets through a flag in VM metadata.
//! Handing off means clearing any stale registration, letting a
//! previous monitor instance wind down, and setting the flag fresh.

use std::time::Duration;

use color_eyre::Result;
use tracing::{debug, info};

use crate::xapi::{ControlPlane, VmUuid};

/// VM other-config flag the monitor watches.
pub const MONITOR_FLAG_KEY: &str = "cvk-monitor";

/// The monitor offers no "deregistration complete" acknowledgment, so
/// re-registration waits this long for a previous instance to finish
/// shutting down. Tunable here without touching the controller.
const SETTLE_DELAY: Duration = Duration::from_secs(5);

pub struct Handoff {
    settle_delay: Duration,
}

impl Default for Handoff {
    fn default() -> Self {
        Self {
            settle_delay: SETTLE_DELAY,
        }
    }
}

impl Handoff {
    #[cfg(test)]
    pub fn with_settle_delay(settle_delay: Duration) -> Self {
        Self { settle_delay }
    }

    /// Ensure exactly one active registration exists for the VM.
    /// Registration failures propagate; a silently unmonitored VM is
    /// worse than a failed preparation run.
    pub fn register(&self, cp: &dyn ControlPlane, vm: &VmUuid) -> Result<()> {
        debug!(%vm, "clearing any stale monitor registration");
        cp.vm_other_config_remove(vm, MONITOR_FLAG_KEY)?;
        if !self.settle_delay.is_zero() {
            std::thread::sleep(self.settle_delay);
        }
        cp.vm_other_config_set(vm, MONITOR_FLAG_KEY, "true")?;
        info!("VM {vm} registered for monitoring");
        Ok(())
    }
}
