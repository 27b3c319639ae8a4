//! RAII page-protection guard.

use crate::os::{self, Access};

/// Acquires `new_access` over `[address, address + length)` on construction
/// and restores whatever protection was there before on drop. Non-copyable,
/// non-movable: the restore must run against the exact range it changed.
pub struct ScopedProtect {
    address: usize,
    length: usize,
    previous: Option<Access>,
}

impl ScopedProtect {
    pub fn new(address: usize, length: usize, new_access: Access) -> Self {
        match os::vm_protect(address, length, new_access) {
            Ok(previous) => Self {
                address,
                length,
                previous: Some(previous),
            },
            Err(error) => {
                tracing::trace!(address, length, ?error, "scoped protect failed to acquire");
                Self {
                    address,
                    length,
                    previous: None,
                }
            }
        }
    }

    /// Whether the initial protection change succeeded.
    pub fn is_ok(&self) -> bool {
        self.previous.is_some()
    }
}

impl Drop for ScopedProtect {
    fn drop(&mut self) {
        if let Some(previous) = self.previous {
            if let Err(error) = os::vm_protect(self.address, self.length, previous) {
                tracing::trace!(
                    address = self.address,
                    length = self.length,
                    ?error,
                    "scoped protect failed to restore"
                );
            }
        }
    }
}
