//! In-process x86/x86-64 inline function hooking.
//!
//! Three collaborating pieces:
//!
//! - [`allocator`]: reserves executable memory within reach of a target
//!   address, so a near (`E9 rel32`) branch can always reach it.
//! - [`decoder`] + [`hook`]: decodes a target function's prologue, relocates
//!   it into a trampoline, and patches the target to jump to a detour.
//! - [`os`] + [`protect`] + [`veh`]: platform virtual-memory primitives and
//!   a process-wide exception handler that catches a thread executing a
//!   patch mid-write.
//!
//! ```ignore
//! let hook = Hook::new(target as usize, detour as usize, 64)?;
//! hook.enable()?;
//! let original: extern "C" fn(i32) -> i32 = unsafe { call::trampoline_fn(&hook) };
//! ```

pub mod allocator;
#[macro_use]
pub mod call;
pub mod decoder;
pub mod error;
pub mod hook;
pub mod os;
pub mod protect;
pub mod veh;

pub use allocator::{Allocation, Allocator, DEFAULT_MAX_DISTANCE};
pub use error::{Error, Result};
pub use hook::Hook;
pub use os::{Access, SystemInfo, VmInfo};
pub use veh::VehVerdict;
