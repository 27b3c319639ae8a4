//! Platform virtual-memory primitives and process-wide exception handling.
//!
//! Everything in this module is a thin wrapper around the OS: no logical
//! bookkeeping lives here. The allocator and the hook installer are the
//! layers that interpret these results.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as backend;
#[cfg(windows)]
use windows as backend;

use crate::error::{Error, Result};
use bitflags::bitflags;

bitflags! {
    /// Page protection requested for a VM region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        const READ    = 0b001;
        const WRITE   = 0b010;
        const EXECUTE = 0b100;
    }
}

impl Access {
    pub const R: Access = Access::READ;
    pub const RW: Access = Access::READ.union(Access::WRITE);
    pub const RX: Access = Access::READ.union(Access::EXECUTE);
    pub const RWX: Access = Access::READ.union(Access::WRITE).union(Access::EXECUTE);
}

/// Page size / allocation granularity / addressable range for this process.
#[derive(Debug, Clone, Copy)]
pub struct SystemInfo {
    pub page_size: usize,
    pub granularity: usize,
    pub min_address: usize,
    pub max_address: usize,
}

/// Result of querying the region containing an address.
#[derive(Debug, Clone, Copy)]
pub struct VmInfo {
    pub base: usize,
    pub size: usize,
    pub access: Access,
    pub free: bool,
}

/// Reserve and commit pages at (or near) `hint`. `hint == 0` lets the OS choose.
pub fn vm_alloc(hint: usize, size: usize, access: Access) -> Result<usize> {
    debug_assert!(size > 0);
    backend::vm_alloc(hint, size, access)
}

/// Release an entire reservation previously returned by [`vm_alloc`].
pub fn vm_free(address: usize) {
    backend::vm_free(address);
}

/// Change protection on `[base, base + size)`, returning the previous access.
pub fn vm_protect(base: usize, size: usize, access: Access) -> Result<Access> {
    backend::vm_protect(base, size, access)
}

/// Describe the region containing `address`.
pub fn vm_query(address: usize) -> Result<VmInfo> {
    backend::vm_query(address)
}

/// Page size, allocation granularity, and the OS application-address range.
pub fn system_info() -> SystemInfo {
    backend::system_info()
}

/// Callback invoked with the faulting instruction pointer when a registered
/// exception range catches a fault.
pub type VehCallback = Box<dyn Fn(usize) -> VehVerdict + Send + Sync>;

/// What to do with the faulting thread once a callback has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehVerdict {
    /// Resume execution at `resume_ip` (rewinds past a torn patch write).
    ContinueExecution { resume_ip: usize },
    ContinueSearch,
}

/// Register a process-wide handler entry for `[start, end]`. First match in
/// registration order wins; a handler that doesn't claim the range must
/// return [`VehVerdict::ContinueSearch`].
pub fn register_exception_range(start: usize, end: usize, callback: VehCallback) {
    backend::veh_register(start, end, callback);
}

/// Remove the entry whose start address is `start`, if any.
pub fn unregister_exception_range(start: usize) {
    backend::veh_unregister(start);
}

/// A no-op function whose allocation base is this library's own module,
/// used to tell in-module targets from out-of-module ones (§4.F.4).
#[inline(never)]
pub fn find_me() {}

/// Best-effort check for whether `address` falls inside the OS's protection
/// API entry point itself (patching the protector that would otherwise
/// protect it). Only meaningful on platforms with a single well-known
/// protect entry point; elsewhere this always returns `false`.
pub fn overlaps_protect_entry(address: usize, size: usize) -> bool {
    backend::overlaps_protect_entry(address, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_vm_roundtrip() {
        let addr = vm_alloc(0, 1024, Access::R).expect("alloc");
        assert_ne!(addr, 0);

        let prev = vm_protect(addr, 1024, Access::RWX).expect("protect");
        assert_eq!(prev, Access::R);

        let info = vm_query(addr).expect("query");
        assert_eq!(info.access, Access::RWX);
        assert!(!info.free);

        vm_free(addr);
    }
}
