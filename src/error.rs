//! Error taxonomy for the hooking engine.
//!
//! Every fallible operation returns one of these kinds; none of them carry
//! a language-level exception, and none are retried automatically.

/// Stable error identity for allocator, decoder, and hook-installer failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("virtual memory allocation failed")]
    Allocate,

    #[error("page protection change failed")]
    Protect,

    #[error("virtual memory region query failed")]
    Query,

    #[error("near-memory allocator returned no block within range")]
    BadAllocation,

    #[error("decoder rejected the bytes at the target address")]
    FailedDecodeInstruction,

    #[error("prologue contains an IP-relative instruction form outside the handled set")]
    UnsupportedInstruction,

    #[error("buffer supplied to the branch emitter is smaller than the branch form")]
    NotEnoughSpace,

    #[error("indirect-branch prologue contains an IP-relative instruction")]
    IpRelativeInstructionOutOfRange,
}

pub type Result<T> = std::result::Result<T, Error>;
