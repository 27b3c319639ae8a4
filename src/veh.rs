//! Process-wide exception handler registrar.
//!
//! Exactly one native handler is installed, lazily, the first time a range
//! is registered; entries are matched in registration order and the first
//! one whose `[start, end]` contains the faulting instruction pointer wins.

pub use crate::os::VehVerdict;
use crate::os::{self, VehCallback};

/// Register a callback for the instruction range `[start, end]`.
pub fn register(start: usize, end: usize, callback: VehCallback) {
    os::register_exception_range(start, end, callback);
}

/// Remove the entry whose start address is `start`, if any.
pub fn unregister(start: usize) {
    os::unregister_exception_range(start);
}
