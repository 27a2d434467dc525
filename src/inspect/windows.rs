// src/inspect/windows.rs

//! Win32 backend: `OpenProcess` / `VirtualQueryEx` / `ReadProcessMemory`.

use super::{
    list_processes_by_name, InspectError, ProcessInspector, ProcessMemory, Protection, RegionInfo,
    RegionKind, RegionState,
};
use std::{ffi::c_void, mem};
use windows_sys::Win32::{
    Foundation::{
        CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER, ERROR_PARTIAL_COPY,
        HANDLE,
    },
    System::{
        Diagnostics::Debug::ReadProcessMemory,
        Memory::{
            VirtualQueryEx, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_FREE, MEM_IMAGE, MEM_MAPPED,
            MEM_PRIVATE, PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS,
            PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
        },
        Threading::{OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ},
    },
};

/// Guard / no-cache / write-combine bits that modify a base protection.
const PAGE_MODIFIERS: u32 = 0x100 | 0x200 | 0x400;

#[derive(Debug, Default)]
pub struct WinInspector;

impl ProcessInspector for WinInspector {
    fn list_processes(&self, names: &[String]) -> Vec<u32> {
        list_processes_by_name(names)
    }

    fn open(&self, pid: u32) -> Result<Box<dyn ProcessMemory>, InspectError> {
        let handle = unsafe { OpenProcess(PROCESS_VM_READ | PROCESS_QUERY_INFORMATION, 0, pid) };
        if handle.is_null() {
            let code = unsafe { GetLastError() };
            return Err(InspectError::Open { pid, code });
        }
        Ok(Box::new(WinProcess { pid, handle }))
    }
}

/// Owned process handle; closed on drop.
struct WinProcess {
    pid:    u32,
    handle: HANDLE,
}

// Process handles are plain kernel object references; the memory APIs are
// safe to call on the same handle from several threads.
unsafe impl Send for WinProcess {}
unsafe impl Sync for WinProcess {}

impl ProcessMemory for WinProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn query_region(&self, cursor: usize) -> Result<RegionInfo, InspectError> {
        let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
        let len = mem::size_of::<MEMORY_BASIC_INFORMATION>();
        let queried = unsafe {
            VirtualQueryEx(self.handle, cursor as *const c_void, std::ptr::from_mut(&mut mbi), len)
        };
        if queried != len {
            return Err(last_error());
        }

        // the allocation protection is what the allocator asked for; the
        // current page protection may have been narrowed since
        Ok(RegionInfo {
            base:       mbi.BaseAddress as usize,
            size:       mbi.RegionSize,
            protection: protection(mbi.AllocationProtect),
            state:      match mbi.State {
                MEM_COMMIT => RegionState::Committed,
                MEM_FREE => RegionState::Free,
                _ => RegionState::Reserved,
            },
            kind:       match mbi.Type {
                MEM_PRIVATE => RegionKind::Private,
                MEM_MAPPED => RegionKind::Mapped,
                MEM_IMAGE => RegionKind::Image,
                _ => RegionKind::None,
            },
        })
    }

    fn read(&self, address: usize, buf: &mut [u8]) -> Result<usize, InspectError> {
        let mut read: usize = 0;
        let ok = unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const c_void,
                buf.as_mut_ptr().cast(),
                buf.len(),
                std::ptr::from_mut(&mut read),
            )
        };
        if ok != 0 {
            return Ok(read);
        }
        match last_error() {
            InspectError::Os(ERROR_PARTIAL_COPY) => {
                Err(InspectError::PartialCopy { read, requested: buf.len() })
            }
            other => Err(other),
        }
    }
}

impl Drop for WinProcess {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.handle);
        }
    }
}

fn last_error() -> InspectError {
    match unsafe { GetLastError() } {
        ERROR_INVALID_PARAMETER => InspectError::InvalidParameter,
        ERROR_ACCESS_DENIED => InspectError::AccessDenied,
        code => InspectError::Os(code),
    }
}

fn protection(raw: u32) -> Protection {
    match raw & !PAGE_MODIFIERS {
        PAGE_NOACCESS => Protection::NoAccess,
        PAGE_READONLY => Protection::ReadOnly,
        PAGE_READWRITE => Protection::ReadWrite,
        PAGE_WRITECOPY => Protection::WriteCopy,
        PAGE_EXECUTE => Protection::Execute,
        PAGE_EXECUTE_READ => Protection::ExecuteRead,
        PAGE_EXECUTE_READWRITE => Protection::ExecuteReadWrite,
        other => Protection::Other(other),
    }
}
