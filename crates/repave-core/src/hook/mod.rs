//! Function entry hooking through the privileged substrate.
//!
//! A [`Hook`] owns the addresses involved in one rerouted function:
//! installing swaps the live entry for the replacement and keeps the
//! returned trampoline, uninstalling is the symmetric operation.

use tracing::debug;

use crate::error::Result;

/// The substrate that performs the actual entry-point swap.
pub trait Hooking {
    /// Reroute `target` to `replacement`, returning a trampoline that
    /// reaches the original implementation.
    fn hook(&mut self, target: u64, replacement: u64) -> Result<u64>;

    /// Restore a previously hooked target.
    fn unhook(&mut self, target: u64, trampoline: u64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hook {
    /// Entry point that was rerouted
    pub original: u64,
    /// Replacement it now leads to
    pub installed: u64,
    /// Callable path to the original implementation
    pub trampoline: u64,
}

impl Hook {
    pub fn install<H: Hooking>(substrate: &mut H, target: u64, replacement: u64) -> Result<Self> {
        let trampoline = substrate.hook(target, replacement)?;
        debug!(
            target = format_args!("{target:#x}"),
            replacement = format_args!("{replacement:#x}"),
            trampoline = format_args!("{trampoline:#x}"),
            "installed hook"
        );
        Ok(Self {
            original: target,
            installed: replacement,
            trampoline,
        })
    }

    pub fn uninstall<H: Hooking>(self, substrate: &mut H) -> Result<()> {
        substrate.unhook(self.original, self.trampoline)?;
        debug!(target = format_args!("{:#x}", self.original), "removed hook");
        Ok(())
    }
}
