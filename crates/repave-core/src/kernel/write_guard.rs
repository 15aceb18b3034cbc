//! Bracketed write-protection toggling for patching the host's own pages.

use tracing::warn;

use crate::error::Result;
use crate::platform::KernelSpace;

/// Tracks the enable/sync protocol around the global write-protection bit.
///
/// Interrupts are disabled only while protection is lowered and restored
/// only if they were enabled beforehand. A `sync` enable freezes the guard
/// so a batch of nested toggles becomes a single open/close pair.
#[derive(Debug, Default)]
pub struct WriteGuard {
    sync_active: bool,
    interrupts_were_disabled: bool,
}

impl WriteGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable writing to protected memory.
    pub fn set<K: KernelSpace>(&mut self, kernel: &K, enable: bool, sync: bool) -> Result<()> {
        if sync {
            self.sync_active = enable;
        } else if self.sync_active {
            // Inside a sync batch individual toggles are ignored
            return Ok(());
        }

        let mut enable = enable;
        if enable {
            self.interrupts_were_disabled = kernel.disable_interrupts();
        }

        let mut result = Ok(());
        if let Err(e) = kernel.set_write_protection(!enable) {
            warn!(error = %e, "failed to change write protection");
            enable = false;
            result = Err(e);
        }

        if !enable && !self.interrupts_were_disabled {
            kernel.enable_interrupts();
        }

        result
    }
}
