//! Windows backend: VirtualAlloc/Protect/Query and a native vectored
//! exception handler.

use std::sync::OnceLock;

use parking_lot::Mutex;
use windows::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, RemoveVectoredExceptionHandler, EXCEPTION_CONTINUE_EXECUTION,
    EXCEPTION_CONTINUE_SEARCH, EXCEPTION_POINTERS,
};
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, VirtualQuery, MEM_COMMIT, MEM_FREE, MEM_RELEASE,
    MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
    PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE,
};
use windows::Win32::System::SystemInformation::GetSystemInfo;

use super::{Access, SystemInfo, VehCallback, VehVerdict, VmInfo};
use crate::error::{Error, Result};

/// Windows protection constants are a mutually exclusive enum rather than
/// independent bits, so `Access` <-> `PAGE_PROTECTION_FLAGS` is a table
/// lookup rather than a fold over individual flags.
const ACCESS_MAPPINGS: &[(Access, PAGE_PROTECTION_FLAGS)] = &[
    (Access::RWX, PAGE_EXECUTE_READWRITE),
    (Access::RX, PAGE_EXECUTE_READ),
    (Access::RW, PAGE_READWRITE),
    (Access::R, PAGE_READONLY),
];

fn to_native(access: Access) -> PAGE_PROTECTION_FLAGS {
    ACCESS_MAPPINGS
        .iter()
        .find(|(a, _)| *a == access)
        .map(|(_, flags)| *flags)
        .unwrap_or(PAGE_NOACCESS)
}

fn from_native(flags: PAGE_PROTECTION_FLAGS) -> Access {
    ACCESS_MAPPINGS
        .iter()
        .find(|(_, f)| *f == flags)
        .map(|(access, _)| *access)
        .unwrap_or(Access::empty())
}

pub fn vm_alloc(hint: usize, size: usize, access: Access) -> Result<usize> {
    // SAFETY: hint, size are caller-validated; VirtualAlloc with a null hint
    // lets the OS choose the address.
    let ptr = unsafe {
        VirtualAlloc(
            Some(hint as *const _),
            size,
            MEM_COMMIT | MEM_RESERVE,
            to_native(access),
        )
    };
    if ptr.is_null() {
        tracing::debug!(hint, size, "VirtualAlloc failed");
        return Err(Error::Allocate);
    }
    Ok(ptr as usize)
}

pub fn vm_free(address: usize) {
    // SAFETY: address is a base previously returned by vm_alloc.
    unsafe {
        let _ = VirtualFree(address as *mut _, 0, MEM_RELEASE);
    }
}

pub fn vm_protect(base: usize, size: usize, access: Access) -> Result<Access> {
    let mut old = PAGE_PROTECTION_FLAGS(0);
    // SAFETY: base/size describe a range previously committed by vm_alloc.
    let ok = unsafe { VirtualProtect(base as *const _, size, to_native(access), &mut old) };
    if ok.is_err() {
        tracing::debug!(base, size, "VirtualProtect failed");
        return Err(Error::Protect);
    }
    Ok(from_native(old))
}

pub fn vm_query(address: usize) -> Result<VmInfo> {
    let mut mbi = MEMORY_BASIC_INFORMATION::default();
    // SAFETY: mbi is sized correctly for the call.
    let written = unsafe {
        VirtualQuery(
            Some(address as *const _),
            &mut mbi,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if written == 0 {
        return Err(Error::Query);
    }
    Ok(VmInfo {
        base: mbi.BaseAddress as usize,
        size: mbi.RegionSize,
        access: from_native(mbi.Protect),
        free: mbi.State == MEM_FREE,
    })
}

pub fn system_info() -> SystemInfo {
    let mut info = Default::default();
    // SAFETY: plain out-parameter call.
    unsafe { GetSystemInfo(&mut info) };
    SystemInfo {
        page_size: info.dwPageSize as usize,
        granularity: info.dwAllocationGranularity as usize,
        min_address: info.lpMinimumApplicationAddress as usize,
        max_address: info.lpMaximumApplicationAddress as usize,
    }
}

pub fn overlaps_protect_entry(address: usize, size: usize) -> bool {
    let si = system_info();
    let page_start = address & !(si.page_size - 1);
    let page_end = (address + size + si.page_size - 1) & !(si.page_size - 1);
    let vp_start = VirtualProtect as usize;
    let vp_end = vp_start + 0x20;
    page_end >= vp_start && vp_end >= page_start
}

struct VehEntry {
    start: usize,
    end: usize,
    callback: VehCallback,
}

unsafe impl Send for VehEntry {}

static ENTRIES: OnceLock<Mutex<Vec<VehEntry>>> = OnceLock::new();
static HANDLE: OnceLock<Mutex<Option<isize>>> = OnceLock::new();

fn entries() -> &'static Mutex<Vec<VehEntry>> {
    ENTRIES.get_or_init(|| Mutex::new(Vec::new()))
}

unsafe extern "system" fn dispatch(info: *mut EXCEPTION_POINTERS) -> i32 {
    const CXX_EXCEPTION: u32 = 0xE06D_7363;
    const GUARD_PAGE: u32 = 0x8000_0001;
    const ACCESS_VIOLATION: u32 = 0xC000_0005;
    const BREAKPOINT: u32 = 0x8000_0003;
    const SINGLE_STEP: u32 = 0x8000_0004;

    let record = &*(*info).ExceptionRecord;
    let code = record.ExceptionCode.0 as u32;
    if code == CXX_EXCEPTION {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    if !matches!(code, GUARD_PAGE | ACCESS_VIOLATION | BREAKPOINT | SINGLE_STEP) {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let ctx = &mut *(*info).ContextRecord;
    #[cfg(target_arch = "x86_64")]
    let current_ip = ctx.Rip as usize;
    #[cfg(target_arch = "x86")]
    let current_ip = ctx.Eip as usize;

    let guard = entries().lock();
    for entry in guard.iter() {
        if entry.start <= current_ip && current_ip <= entry.end {
            match (entry.callback)(current_ip) {
                VehVerdict::ContinueExecution { resume_ip } => {
                    #[cfg(target_arch = "x86_64")]
                    {
                        ctx.Rip = resume_ip as u64;
                    }
                    #[cfg(target_arch = "x86")]
                    {
                        ctx.Eip = resume_ip as u32;
                    }
                    return EXCEPTION_CONTINUE_EXECUTION;
                }
                VehVerdict::ContinueSearch => continue,
            }
        }
    }
    EXCEPTION_CONTINUE_SEARCH
}

pub fn veh_register(start: usize, end: usize, callback: VehCallback) {
    let handle_lock = HANDLE.get_or_init(|| Mutex::new(None));
    let mut handle = handle_lock.lock();
    if handle.is_none() {
        // SAFETY: first-priority registration of a process-wide handler,
        // done once behind this lock.
        let raw = unsafe { AddVectoredExceptionHandler(1, Some(dispatch)) };
        *handle = Some(raw as isize);
    }
    drop(handle);

    entries().lock().push(VehEntry {
        start,
        end,
        callback,
    });
}

pub fn veh_unregister(start: usize) {
    entries().lock().retain(|e| e.start != start);
}

#[allow(dead_code)]
pub fn teardown() {
    if let Some(handle_lock) = HANDLE.get() {
        if let Some(raw) = handle_lock.lock().take() {
            // SAFETY: raw came from a matching AddVectoredExceptionHandler.
            unsafe {
                let _ = RemoveVectoredExceptionHandler(raw as *const _);
            }
        }
    }
}
