//! Inline function hook: relocating trampoline plus a patched entry-point
//! jump, installed and removed through the safe-activation protocol.

use std::cell::RefCell;

use iced_x86::{BlockEncoder, BlockEncoderOptions, Instruction, InstructionBlock};
use parking_lot::ReentrantMutex;

use crate::allocator::{Allocation, Allocator, DEFAULT_MAX_DISTANCE};
use crate::decoder;
use crate::error::{Error, Result};
use crate::os::{self, Access};
use crate::protect::ScopedProtect;
use crate::veh::{self, VehVerdict};

/// Largest prologue this installer will ever capture. Functions that can't
/// fit a patch within 64 bytes of whole instructions are rejected.
const MAX_PROLOGUE_LEN: usize = 64;

/// Which entry-branch form patched `target`, and therefore which trampoline
/// layout backs it (§3, §4.F.2, §4.F.7).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Variant {
    /// `target` holds a 5-byte `E9` into the trampoline's `jmp_to_destination`
    /// slot, which then reaches `detour` however far away it is.
    NearBranch,
    /// `target` holds a 14-byte `FF25`-plus-literal jumping to the
    /// trampoline's own base (not to `detour`); used only when no trampoline
    /// reachable by `E9` from `target` could be found (x86-64 only). The
    /// trampoline's FF epilogue only ever returns to the original function,
    /// so enabling this variant makes `target` callable through the
    /// trampoline but does not redirect `target`'s own callers to `detour`
    /// — see the note on `build_indirect`.
    IndirectBranch,
}

struct State {
    target: usize,
    detour: usize,
    bitness: u32,
    patch_len: usize,
    original_bytes: Vec<u8>,
    trampoline: Option<Allocation>,
    variant: Variant,
    /// Where `target`'s entry branch must point: the trampoline's
    /// `jmp_to_destination` slot for `NearBranch`, the trampoline's own base
    /// for `IndirectBranch`.
    entry_link: usize,
    patch_access: Access,
    skip_restore: bool,
    enabled: bool,
}

/// An installed (or installable) inline hook.
///
/// Enable and disable are guarded by a per-hook recursive lock, so a detour
/// is free to call back into its own hook's `disable` without deadlocking.
pub struct Hook(ReentrantMutex<RefCell<State>>);

/// Output of building either trampoline variant.
struct Built {
    patch_len: usize,
    original_bytes: Vec<u8>,
    trampoline: Allocation,
    entry_link: usize,
}

impl Hook {
    /// Build (but do not enable) a hook redirecting `target` to `detour`.
    /// `bitness` is 32 or 64 and must match the target's code.
    ///
    /// Tries the near-branch (`E9`) variant first. On x86-64, if that fails
    /// for any reason — most commonly no reachable trampoline site — falls
    /// back to the indirect (`FF`) variant (§4.F.7). x86-32 has no fallback:
    /// a 32-bit `rel32` always reaches the full address space, so a
    /// near-branch failure there is a real error, not a reachability problem.
    pub fn new(target: usize, detour: usize, bitness: u32) -> Result<Self> {
        let (variant, built) = match build_near(target, detour, bitness) {
            Ok(built) => (Variant::NearBranch, built),
            Err(near_err) => {
                if bitness != 64 {
                    return Err(near_err);
                }
                (Variant::IndirectBranch, build_indirect(target, detour)?)
            }
        };

        let (patch_access, skip_restore) = choose_patch_access(target, built.patch_len);

        Ok(Self(ReentrantMutex::new(RefCell::new(State {
            target,
            detour,
            bitness,
            patch_len: built.patch_len,
            original_bytes: built.original_bytes,
            trampoline: Some(built.trampoline),
            variant,
            entry_link: built.entry_link,
            patch_access,
            skip_restore,
            enabled: false,
        }))))
    }

    /// Address of the relocated prologue. Call through this (cast to the
    /// original function's signature) to invoke the unhooked behavior.
    pub fn trampoline_ptr(&self) -> usize {
        let guard = self.0.lock();
        let state = guard.borrow();
        state.trampoline.as_ref().map(Allocation::address).unwrap_or(0)
    }

    pub fn target(&self) -> usize {
        self.0.lock().borrow().target
    }

    pub fn is_enabled(&self) -> bool {
        self.0.lock().borrow().enabled
    }

    /// Patch the target so it jumps to the detour.
    pub fn enable(&self) -> Result<()> {
        let guard = self.0.lock();
        let mut state = guard.borrow_mut();
        if state.enabled {
            return Ok(());
        }

        let mut patch = match state.variant {
            // entry_link is the trampoline's jmp_to_destination slot, which
            // sits within reach of target by construction (§4.F.2), so this
            // is always the 5-byte E9 form in practice.
            Variant::NearBranch => build_jump(state.bitness, state.target, state.entry_link),
            // entry_link is the trampoline's own base; the FF25-plus-literal
            // form has no distance constraint because its pointer cell sits
            // immediately after the opcode, not somewhere reachable by rel32.
            Variant::IndirectBranch => emit_indirect_jump(state.entry_link),
        };
        if patch.len() < state.patch_len {
            patch.resize(state.patch_len, 0xCC);
        }

        apply_patch(state.target, state.patch_len, &patch, state.patch_access, state.skip_restore);
        state.enabled = true;
        Ok(())
    }

    /// Restore the target's original bytes.
    pub fn disable(&self) -> Result<()> {
        let guard = self.0.lock();
        let mut state = guard.borrow_mut();
        if !state.enabled {
            return Ok(());
        }

        let original = state.original_bytes.clone();
        apply_patch(state.target, state.patch_len, &original, state.patch_access, state.skip_restore);
        state.enabled = false;
        Ok(())
    }
}

impl Drop for Hook {
    fn drop(&mut self) {
        let _ = self.disable();
    }
}

/// Install the VEH retry guard, flip the page to the requested access, write
/// `bytes` over `target` using the trap-byte protocol, then tear the guard
/// back down.
fn apply_patch(target: usize, patch_len: usize, bytes: &[u8], access: Access, skip_restore: bool) {
    veh::register(target, target + patch_len, retry_at(target));

    let protect = ScopedProtect::new(target, patch_len, access);
    // SAFETY: target is the hook's own patch region, sized to patch_len,
    // and protect has just made it writable.
    unsafe { patch_safely(target, bytes) };

    if skip_restore {
        // Restoring here would call back into the very protection API whose
        // own code this page overlaps; leave access permanently widened
        // instead of risking reentry into a function we just patched.
        std::mem::forget(protect);
    }

    veh::unregister(target);
}

/// A thread observed at `target + 1` was preempted mid-patch, after the trap
/// byte landed but before the branch's tail bytes were in place; rewind it to
/// re-read the completed branch from the start. Any other IP in the
/// registered range is none of this hook's concern.
fn retry_at(target: usize) -> Box<dyn Fn(usize) -> VehVerdict + Send + Sync> {
    Box::new(move |fault_ip| {
        if fault_ip == target + 1 {
            VehVerdict::ContinueExecution { resume_ip: target }
        } else {
            VehVerdict::ContinueSearch
        }
    })
}

/// Choose RW vs RWX for the scoped protector around a patch, and whether the
/// restore-on-drop should be skipped entirely (§4.F.4 step 4).
fn choose_patch_access(target: usize, patch_len: usize) -> (Access, bool) {
    let same_module = matches!(
        (os::vm_query(target), os::vm_query(os::find_me as usize)),
        (Ok(t), Ok(s)) if t.base == s.base
    );
    if same_module {
        // The target shares this library's own module; its page may be
        // executing concurrently, so X must stay up throughout the patch.
        return (Access::RWX, false);
    }
    if os::overlaps_protect_entry(target, patch_len) {
        // Patching the protection API itself: restoring afterward would
        // call back into the function we just rewrote.
        return (Access::RWX, true);
    }
    (Access::RW, false)
}

/// Write `bytes` over `target` so a thread whose instruction pointer is
/// already sitting at `target` never executes a half-written instruction:
/// a single trap byte goes down first (a one-byte write is always atomic),
/// then the remaining bytes, then the real first byte completes the patch.
unsafe fn patch_safely(target: usize, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    let dst = target as *mut u8;
    std::ptr::write_volatile(dst, 0xCC);
    if bytes.len() > 1 {
        std::ptr::copy_nonoverlapping(bytes.as_ptr().add(1), dst.add(1), bytes.len() - 1);
    }
    std::ptr::write_volatile(dst, bytes[0]);
}

/// Decode whole instructions at `target` until at least `min_patch_len`
/// bytes are covered, and copy out the bytes the patch will overwrite.
fn capture_prologue(
    target: usize,
    bitness: u32,
    min_patch_len: usize,
) -> Result<(Vec<Instruction>, usize, Vec<u8>)> {
    // SAFETY: target is caller-asserted to be a valid, executable function
    // entry point with at least MAX_PROLOGUE_LEN readable bytes following it.
    let probe = unsafe { std::slice::from_raw_parts(target as *const u8, MAX_PROLOGUE_LEN) };
    let prologue = decoder::decode_prologue(probe, target as u64, bitness, min_patch_len)?;
    let patch_len = prologue.total_length;
    let original_bytes = probe[..patch_len].to_vec();
    Ok((prologue.instructions, patch_len, original_bytes))
}

/// Build the near-branch (`E9`) variant: relocate the prologue into a
/// trampoline placed within reach of `target` and every relative operand it
/// contains, then give that trampoline an "E9 epilogue" — a jump back to the
/// original function plus a `jmp_to_destination` slot that reaches `detour`
/// regardless of its distance (§4.F.2, §4.F.4 step 5).
fn build_near(target: usize, detour: usize, bitness: u32) -> Result<Built> {
    let (instructions, patch_len, original_bytes) = capture_prologue(target, bitness, 5)?;

    // Every absolute address a relative operand in the stolen prologue
    // touches must stay within reach of wherever the trampoline lands, or
    // the relocated copy can't be re-encoded (§4.F.1).
    let mut desired_addresses = vec![target];
    for instr in &instructions {
        if decoder::is_ip_relative(instr) {
            desired_addresses.push(instr.ip_rel_memory_address() as usize);
        }
        if let Some(branch_target) = decoder::near_branch_target(instr) {
            desired_addresses.push(branch_target as usize);
        }
    }

    const EPILOGUE_RESERVE: usize = 5 /* jmp_to_original E9 */ + 14 /* jmp_to_destination FF */;
    let budget = patch_len + instructions.len() * 6 + EPILOGUE_RESERVE + 16;

    let allocation = Allocator::get()
        .allocate_near(&desired_addresses, budget, DEFAULT_MAX_DISTANCE)
        .ok_or(Error::BadAllocation)?;
    let trampoline_addr = allocation.address();

    for instr in &instructions {
        if decoder::is_ip_relative(instr) {
            let abs_target = instr.ip_rel_memory_address();
            if abs_target.abs_diff(trampoline_addr as u64) > i32::MAX as u64 {
                return Err(Error::IpRelativeInstructionOutOfRange);
            }
        }
    }

    let block = InstructionBlock::new(&instructions, trampoline_addr as u64);
    let encoded = BlockEncoder::encode(bitness, block, BlockEncoderOptions::NONE)
        .map_err(|_| Error::UnsupportedInstruction)?;
    let code = encoded.code_buffer;

    let continuation = target + patch_len;
    let epilogue_addr = trampoline_addr + code.len();

    // jmp_to_original: always an E9 in practice, since the trampoline was
    // placed within DEFAULT_MAX_DISTANCE of target.
    let mut epilogue = build_jump(bitness, epilogue_addr, continuation);
    let jmp_to_destination_addr = epilogue_addr + epilogue.len();

    // jmp_to_destination: on 64-bit this is always the FF25-plus-literal
    // form, regardless of how far detour is — that indirection through an
    // inline pointer cell is the whole point of this slot. On 32-bit, a
    // plain E9 always reaches anywhere in the address space, so there is no
    // literal (§4.F.2).
    if bitness == 64 {
        epilogue.extend(emit_indirect_jump(detour));
    } else {
        epilogue.extend(build_jump(32, jmp_to_destination_addr, detour));
    }

    if code.len() + epilogue.len() > budget {
        return Err(Error::NotEnoughSpace);
    }

    // SAFETY: allocation is RWX, owned exclusively by this hook, and large
    // enough per the checks above.
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), trampoline_addr as *mut u8, code.len());
        std::ptr::copy_nonoverlapping(epilogue.as_ptr(), epilogue_addr as *mut u8, epilogue.len());
    }

    Ok(Built {
        patch_len,
        original_bytes,
        trampoline: allocation,
        entry_link: jmp_to_destination_addr,
    })
}

/// Build the indirect-branch (`FF`) variant, used when no trampoline
/// reachable by `E9` from `target` exists. The entry patch becomes a
/// 14-byte `FF25`-plus-literal jump to the trampoline's own base —
/// unconstrained by distance, since its pointer cell is inline right after
/// the opcode — so the trampoline carrying the relocated prologue can be
/// placed anywhere. That only works if the prologue is purely non-relative
/// (§4.F.2's "FF epilogue"): any IP-relative operand or relative branch in
/// it is rejected up front, since relocating it to an unconstrained address
/// could put its target out of reach.
///
/// `target` jumps to `trampoline.base`, not to `detour` (§4.F.4 step 5), and
/// the trampoline's own FF epilogue only ever jumps back to the original
/// function (§4.F.2) — there is no branch anywhere in this variant that
/// reaches `detour`. Enabling an `IndirectBranch` hook makes `target`
/// transparently callable through the trampoline; it does not redirect
/// `target`'s callers to `detour`. This is not an oversight in this port:
/// it matches `_ff_hook`/`Enable`'s `Type::FF` branch in
/// `examples/original_source/src/inline_hook.cpp` exactly, which passes
/// `trampoline_->address()`, never `destination_`, as the FF jump's target.
fn build_indirect(target: usize, _detour: usize) -> Result<Built> {
    const ENTRY_LEN: usize = 14;
    let (instructions, patch_len, original_bytes) = capture_prologue(target, 64, ENTRY_LEN)?;

    if instructions
        .iter()
        .any(|instr| decoder::is_ip_relative(instr) || decoder::near_branch_target(instr).is_some())
    {
        return Err(Error::IpRelativeInstructionOutOfRange);
    }

    const EPILOGUE_RESERVE: usize = 14;
    let budget = patch_len + EPILOGUE_RESERVE;

    let allocation = Allocator::get().allocate(budget).ok_or(Error::BadAllocation)?;
    let trampoline_addr = allocation.address();

    let block = InstructionBlock::new(&instructions, trampoline_addr as u64);
    let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)
        .map_err(|_| Error::UnsupportedInstruction)?;
    let code = encoded.code_buffer;

    // FF epilogue: a single indirect jump back to the original function,
    // since the trampoline may be arbitrarily far from target and a plain
    // E9 rel32 back-jump might not reach.
    let continuation = target + patch_len;
    let epilogue = emit_indirect_jump(continuation);

    if code.len() + epilogue.len() > budget {
        return Err(Error::NotEnoughSpace);
    }

    // SAFETY: allocation is RWX, owned exclusively by this hook, and large
    // enough per the checks above.
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), trampoline_addr as *mut u8, code.len());
        std::ptr::copy_nonoverlapping(
            epilogue.as_ptr(),
            (trampoline_addr + code.len()) as *mut u8,
            epilogue.len(),
        );
    }

    Ok(Built {
        patch_len,
        original_bytes,
        entry_link: allocation.address(),
        trampoline: allocation,
    })
}

/// Encode a jump from `from` to `to`: a 5-byte `E9 rel32` when `to` is
/// within range, otherwise (x86-64 only) a 14-byte `FF25` indirect through
/// an absolute pointer embedded right after the opcode.
fn build_jump(bitness: u32, from: usize, to: usize) -> Vec<u8> {
    let rel = to as i64 - (from as i64 + 5);
    if bitness == 32 || (i32::MIN as i64..=i32::MAX as i64).contains(&rel) {
        let mut bytes = Vec::with_capacity(5);
        bytes.push(0xE9);
        bytes.extend_from_slice(&(rel as i32).to_le_bytes());
        bytes
    } else {
        emit_indirect_jump(to)
    }
}

/// Unconditionally encode the 14-byte `FF25 00000000` + absolute 64-bit
/// pointer form: a RIP-relative indirect jump whose memory operand is the
/// literal immediately following the opcode, so it reaches anywhere in the
/// address space regardless of distance.
fn emit_indirect_jump(to: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(14);
    bytes.extend_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    bytes.extend_from_slice(&(to as u64).to_le_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn near_jump_encodes_as_e9() {
        let bytes = build_jump(64, 0x1000, 0x1100);
        assert_eq!(bytes[0], 0xE9);
        assert_eq!(bytes.len(), 5);
    }

    #[test]
    fn far_jump_on_64_bit_encodes_as_ff25() {
        let bytes = build_jump(64, 0x1000, 0x7FFF_FFFF_FFFF);
        assert_eq!(&bytes[..2], &[0xFF, 0x25]);
        assert_eq!(bytes.len(), 14);
    }

    #[test]
    fn thirty_two_bit_always_uses_e9() {
        let bytes = build_jump(32, 0x1000, 0xFFFF_0000);
        assert_eq!(bytes[0], 0xE9);
        assert_eq!(bytes.len(), 5);
    }

    #[test]
    fn emit_indirect_jump_layout() {
        let bytes = emit_indirect_jump(0x1122_3344_5566_7788);
        assert_eq!(&bytes[..2], &[0xFF, 0x25]);
        assert_eq!(&bytes[2..6], &[0, 0, 0, 0]);
        assert_eq!(&bytes[6..14], &0x1122_3344_5566_7788u64.to_le_bytes());
    }

    #[test]
    fn hook_lifecycle_sum_function() {
        #[no_mangle]
        extern "C" fn sum(a: i32, b: i32) -> i32 {
            a + b
        }
        extern "C" fn hooked_sum(a: i32, b: i32) -> i32 {
            a + b + 1
        }

        let target = sum as usize;
        let detour = hooked_sum as usize;
        let hook = Hook::new(target, detour, 64).expect("build hook");
        assert!(!hook.is_enabled());

        hook.enable().expect("enable");
        assert!(hook.is_enabled());

        let patched: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(target) };
        assert_eq!(patched(1, 2), 4);

        hook.disable().expect("disable");
        assert!(!hook.is_enabled());
        assert_eq!(sum(1, 2), 3);
    }

    /// The near-branch trampoline's jmp_to_destination slot must itself
    /// reach an arbitrary 64-bit detour, not just ones within +-2GiB of
    /// target — this is the reachability gap the slot indirection exists
    /// to close (§4.F.2, §4.F.4 step 5).
    #[test]
    fn near_branch_trampoline_reaches_a_far_detour() {
        #[no_mangle]
        extern "C" fn sum_far_detour(a: i32, b: i32) -> i32 {
            a + b
        }
        extern "C" fn hooked_sum_far_detour(_a: i32, _b: i32) -> i32 {
            777
        }

        let target = sum_far_detour as usize;
        let real_detour = hooked_sum_far_detour as usize;

        let built = build_near(target, real_detour, 64).expect("build near trampoline");
        assert_ne!(built.entry_link, real_detour, "entry_link is the slot address, not detour");

        let slot_literal = unsafe { std::ptr::read_unaligned((built.entry_link + 6) as *const u64) };
        assert_eq!(slot_literal, real_detour as u64);
    }

    /// The FF variant's entry patch jumps to `trampoline.base`, never to
    /// `detour` (matching `_ff_hook`/`Enable`'s `Type::FF` branch in the
    /// original engine): calling the patched target after enabling this
    /// variant runs the relocated prologue and falls through to the
    /// original continuation, unchanged from calling the unpatched
    /// function — it does not reach the detour.
    #[test]
    fn indirect_variant_round_trip() {
        let page = os::vm_alloc(0, 64, Access::RWX).expect("alloc synthetic target");
        // A 20-byte NOP sled (purely non-relative) followed by a RET that
        // leaves a known value in eax.
        unsafe {
            std::ptr::write_bytes(page as *mut u8, 0x90, 20);
            *((page + 20) as *mut u8) = 0xB8; // mov eax, imm32
            std::ptr::write_unaligned((page + 21) as *mut u32, 99u32);
            *((page + 25) as *mut u8) = 0xC3; // ret
        }

        extern "C" fn indirect_detour() -> i32 {
            4242
        }

        let built = build_indirect(page, indirect_detour as usize).expect("build indirect");
        assert!(built.patch_len >= 14);
        assert_eq!(
            built.entry_link,
            built.trampoline.address(),
            "FF entry patch targets the trampoline base, not detour"
        );

        let mut patch = emit_indirect_jump(built.entry_link);
        patch.resize(built.patch_len, 0xCC);
        apply_patch(page, built.patch_len, &patch, Access::RWX, false);

        // Calling through the patched entry point is indistinguishable from
        // calling the original: it never reaches indirect_detour.
        let patched: extern "C" fn() -> i32 = unsafe { std::mem::transmute(page) };
        assert_eq!(patched(), 99);

        let via_trampoline: extern "C" fn() -> i32 =
            unsafe { std::mem::transmute(built.trampoline.address()) };
        assert_eq!(via_trampoline(), 99);

        apply_patch(page, built.patch_len, &built.original_bytes, Access::RWX, false);
        os::vm_free(page);
    }

    /// Scenario 4: a background thread calls the target in a tight loop
    /// while the main thread enables then disables the hook. No torn read
    /// of the patched prologue should ever crash the reader thread, and it
    /// must observe both the pre- and post-enable results.
    #[test]
    fn concurrent_enable_disable_never_crashes_a_caller() {
        use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
        use std::sync::Arc;

        #[no_mangle]
        extern "C" fn sum2(a: i32, b: i32) -> i32 {
            a + b
        }
        extern "C" fn hooked_sum2(_a: i32, _b: i32) -> i32 {
            1337
        }

        let target = sum2 as usize;
        let detour = hooked_sum2 as usize;
        let hook = Arc::new(Hook::new(target, detour, 64).expect("build hook"));

        let stop = Arc::new(AtomicBool::new(false));
        let saw_hooked = Arc::new(AtomicBool::new(false));
        let last_seen = Arc::new(AtomicI32::new(-1));

        let reader = {
            let stop = Arc::clone(&stop);
            let saw_hooked = Arc::clone(&saw_hooked);
            let last_seen = Arc::clone(&last_seen);
            std::thread::spawn(move || {
                let patched: extern "C" fn(i32, i32) -> i32 =
                    unsafe { std::mem::transmute(target) };
                while !stop.load(Ordering::Relaxed) {
                    let result = patched(1, 1);
                    last_seen.store(result, Ordering::Relaxed);
                    if result == 1337 {
                        saw_hooked.store(true, Ordering::Relaxed);
                    }
                }
            })
        };

        hook.enable().expect("enable");
        while !saw_hooked.load(Ordering::Relaxed) {
            std::thread::yield_now();
        }
        hook.disable().expect("disable");

        stop.store(true, Ordering::Relaxed);
        reader.join().expect("reader thread panicked");

        assert!(saw_hooked.load(Ordering::Relaxed));
        assert_eq!(sum2(1, 1), 2);
    }
}
