//! POSIX backend: mmap/mprotect for VM primitives, `sigaction` as the
//! closest analogue to a Windows vectored exception handler.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::signal::Signal;
use parking_lot::Mutex;

use super::{Access, SystemInfo, VehCallback, VehVerdict, VmInfo};
use crate::error::{Error, Result};

fn to_prot(access: Access) -> ProtFlags {
    let mut prot = ProtFlags::PROT_NONE;
    if access.contains(Access::READ) {
        prot |= ProtFlags::PROT_READ;
    }
    if access.contains(Access::WRITE) {
        prot |= ProtFlags::PROT_WRITE;
    }
    if access.contains(Access::EXECUTE) {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}

fn from_prot_chars(perms: &str) -> Access {
    let mut access = Access::empty();
    if perms.starts_with('r') {
        access |= Access::READ;
    }
    if perms.as_bytes().get(1) == Some(&b'w') {
        access |= Access::WRITE;
    }
    if perms.as_bytes().get(2) == Some(&b'x') {
        access |= Access::EXECUTE;
    }
    access
}

/// mmap doesn't remember the length it mapped; we keep the minimal amount of
/// bookkeeping required to give munmap a correct length on `vm_free`.
static LIVE_MAPPINGS: OnceLock<Mutex<HashMap<usize, usize>>> = OnceLock::new();

fn live_mappings() -> &'static Mutex<HashMap<usize, usize>> {
    LIVE_MAPPINGS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn vm_alloc(hint: usize, size: usize, access: Access) -> Result<usize> {
    let len = std::num::NonZeroUsize::new(size).ok_or(Error::Allocate)?;
    let prot = to_prot(access);

    // A hinted address is what the allocator's proximity search is actually
    // relying on; MAP_FIXED_NOREPLACE makes that hint authoritative (fail
    // with EEXIST rather than silently relocating) instead of the advisory
    // placement a plain `addr` argument gives you.
    let (addr, flags) = if hint == 0 {
        (None, MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS)
    } else {
        (
            std::num::NonZeroUsize::new(hint),
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_FIXED_NOREPLACE,
        )
    };

    // SAFETY: anonymous mapping, no backing fd.
    let ptr = unsafe { mman::mmap_anonymous(addr, len, prot, flags) }.map_err(|e| {
        tracing::debug!(error = %e, hint, size, "mmap failed");
        Error::Allocate
    })?;

    let base = ptr.as_ptr() as usize;
    live_mappings().lock().insert(base, size);
    Ok(base)
}

pub fn vm_free(address: usize) {
    let Some(size) = live_mappings().lock().remove(&address) else {
        tracing::debug!(address, "vm_free on untracked address, ignoring");
        return;
    };
    let ptr = std::ptr::NonNull::new(address as *mut c_void).expect("non-null mapping base");
    // SAFETY: address/size came from a matching mmap_anonymous call.
    unsafe {
        let _ = mman::munmap(ptr, size);
    }
}

pub fn vm_protect(base: usize, size: usize, access: Access) -> Result<Access> {
    let old = vm_query(base)?.access;

    // mprotect(2) requires a page-aligned address and rejects everything
    // else with EINVAL; a patch range almost never starts on a page
    // boundary, so align down and extend the length to cover whole pages,
    // the way VirtualProtect does internally on Windows.
    let page_size = system_info().page_size;
    let aligned_base = base & !(page_size - 1);
    let aligned_end = (base + size + page_size - 1) & !(page_size - 1);
    let aligned_size = aligned_end - aligned_base;

    let ptr = std::ptr::NonNull::new(aligned_base as *mut c_void).ok_or(Error::Protect)?;
    let len = std::num::NonZeroUsize::new(aligned_size).ok_or(Error::Protect)?;
    // SAFETY: caller guarantees [base, base+size) is a valid mapped range;
    // the aligned range only ever widens it to cover whole pages.
    unsafe { mman::mprotect(ptr, len.get(), to_prot(access)) }.map_err(|e| {
        tracing::debug!(error = %e, base, size, aligned_base, aligned_size, "mprotect failed");
        Error::Protect
    })?;
    Ok(old)
}

pub fn vm_query(address: usize) -> Result<VmInfo> {
    let maps = fs::read_to_string("/proc/self/maps").map_err(|_| Error::Query)?;

    let mut regions = Vec::new();
    for line in maps.lines() {
        let mut parts = line.splitn(6, ' ');
        let Some(range) = parts.next() else { continue };
        let Some(perms) = parts.next() else { continue };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            usize::from_str_radix(start, 16),
            usize::from_str_radix(end, 16),
        ) else {
            continue;
        };
        regions.push((start, end, from_prot_chars(perms)));
    }
    regions.sort_by_key(|&(start, _, _)| start);

    if let Some(&(start, end, access)) = regions
        .iter()
        .find(|&&(start, end, _)| start <= address && address < end)
    {
        return Ok(VmInfo {
            base: start,
            size: end - start,
            access,
            free: false,
        });
    }

    let prev_end = regions
        .iter()
        .filter(|&&(_, end, _)| end <= address)
        .map(|&(_, end, _)| end)
        .max()
        .unwrap_or(0);
    let next_start = regions
        .iter()
        .filter(|&&(start, _, _)| start > address)
        .map(|&(start, _, _)| start)
        .min()
        .unwrap_or(system_info().max_address);

    Ok(VmInfo {
        base: prev_end,
        size: next_start.saturating_sub(prev_end),
        access: Access::empty(),
        free: true,
    })
}

pub fn system_info() -> SystemInfo {
    // SAFETY: sysconf with a well-known query name.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(4096) as usize;
    SystemInfo {
        page_size,
        granularity: page_size,
        min_address: page_size,
        #[cfg(target_pointer_width = "64")]
        max_address: 0x0000_7FFF_FFFF_FFFF,
        #[cfg(target_pointer_width = "32")]
        max_address: 0xFFFF_0000,
    }
}

pub fn overlaps_protect_entry(_address: usize, _size: usize) -> bool {
    // mprotect has no single well-known entry point the way
    // VirtualProtect does on Windows; the in-module RWX check already
    // covers the cases that matter on this platform.
    false
}

struct VehEntry {
    start: usize,
    end: usize,
    callback: VehCallback,
}

// The callback trait objects are only ever touched under `ENTRIES`'s lock.
unsafe impl Send for VehEntry {}

static ENTRIES: OnceLock<Mutex<Vec<VehEntry>>> = OnceLock::new();
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

fn entries() -> &'static Mutex<Vec<VehEntry>> {
    ENTRIES.get_or_init(|| Mutex::new(Vec::new()))
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn fault_ip(ctx: *mut c_void) -> usize {
    let ctx = &*(ctx as *const libc::ucontext_t);
    ctx.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn set_fault_ip(ctx: *mut c_void, ip: usize) {
    let ctx = &mut *(ctx as *mut libc::ucontext_t);
    ctx.uc_mcontext.gregs[libc::REG_RIP as usize] = ip as i64;
}

#[cfg(all(target_os = "linux", target_arch = "x86"))]
unsafe fn fault_ip(ctx: *mut c_void) -> usize {
    let ctx = &*(ctx as *const libc::ucontext_t);
    ctx.uc_mcontext.gregs[libc::REG_EIP as usize] as usize
}

#[cfg(all(target_os = "linux", target_arch = "x86"))]
unsafe fn set_fault_ip(ctx: *mut c_void, ip: usize) {
    let ctx = &mut *(ctx as *mut libc::ucontext_t);
    ctx.uc_mcontext.gregs[libc::REG_EIP as usize] = ip as i32;
}

#[cfg(not(any(
    all(target_os = "linux", target_arch = "x86_64"),
    all(target_os = "linux", target_arch = "x86")
)))]
unsafe fn fault_ip(_ctx: *mut c_void) -> usize {
    0
}

#[cfg(not(any(
    all(target_os = "linux", target_arch = "x86_64"),
    all(target_os = "linux", target_arch = "x86")
)))]
unsafe fn set_fault_ip(_ctx: *mut c_void, _ip: usize) {}

extern "C" fn handler(_signum: libc::c_int, _info: *mut libc::siginfo_t, ctx: *mut c_void) {
    // SAFETY: invoked by the kernel with a valid ucontext for this thread.
    let ip = unsafe { fault_ip(ctx) };

    let guard = entries().lock();
    for entry in guard.iter() {
        if entry.start <= ip && ip <= entry.end {
            match (entry.callback)(ip) {
                VehVerdict::ContinueExecution { resume_ip } => {
                    drop(guard);
                    // SAFETY: ctx is the ucontext_t the kernel handed this
                    // handler; writing the IP back redirects the faulting
                    // thread once the handler returns.
                    unsafe { set_fault_ip(ctx, resume_ip) };
                    return;
                }
                VehVerdict::ContinueSearch => continue,
            }
        }
    }
    drop(guard);

    // No handler claimed it: re-raise with the default disposition so the
    // process terminates as it would have without this handler installed.
    unsafe {
        libc::signal(_signum, libc::SIG_DFL);
        libc::raise(_signum);
    }
}

fn install_handler_once() {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    // SAFETY: installing a process-wide SA_SIGINFO handler at first use,
    // matching the Windows AddVectoredExceptionHandler(1, ...) lazy init.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        for sig in [Signal::SIGSEGV, Signal::SIGTRAP, Signal::SIGILL] {
            libc::sigaction(sig as libc::c_int, &action, std::ptr::null_mut());
        }
    }
}

pub fn veh_register(start: usize, end: usize, callback: VehCallback) {
    install_handler_once();
    entries().lock().push(VehEntry {
        start,
        end,
        callback,
    });
}

pub fn veh_unregister(start: usize) {
    entries().lock().retain(|e| e.start != start);
}
