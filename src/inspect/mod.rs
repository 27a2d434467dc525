//! Process inspection capability.
//!
//! Everything the engine needs from the OS goes through two traits:
//! `ProcessInspector` lists and opens processes, `ProcessMemory` is an open
//! handle that can describe and read the target's address space. Dropping a
//! `ProcessMemory` closes the underlying OS handle.
//!
//! Backends:
//! - `windows::WinInspector` (Win32, `windows-sys`), the production one;
//! - `image::ImageInspector`, in-memory process images for replaying dumps
//!   and for tests.

pub mod image;
#[cfg(windows)]
pub mod windows;

use sysinfo::{ProcessRefreshKind, RefreshKind, System};
use thiserror::Error;

/// Page protection of a region, modifiers (guard, no-cache) stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    NoAccess,
    ReadOnly,
    ReadWrite,
    WriteCopy,
    Execute,
    ExecuteRead,
    ExecuteReadWrite,
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Committed,
    Reserved,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Private,
    Mapped,
    Image,
    /// Free regions have no type.
    None,
}

/// One region descriptor as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub base:       usize,
    pub size:       usize,
    pub protection: Protection,
    pub state:      RegionState,
    pub kind:       RegionKind,
}

impl RegionInfo {
    /// First address past this region.
    pub fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InspectError {
    /// Returned by region queries past the end of the address space.
    #[error("invalid parameter")]
    InvalidParameter,

    #[error("access denied")]
    AccessDenied,

    /// The region was (partly) unmapped between enumeration and read.
    #[error("partial copy ({read} of {requested} bytes)")]
    PartialCopy { read: usize, requested: usize },

    #[error("cannot open pid {pid}: OS error {code}")]
    Open { pid: u32, code: u32 },

    #[error("OS error {0}")]
    Os(u32),

    #[error("process inspection is not supported on this platform")]
    Unsupported,
}

pub trait ProcessInspector: Send + Sync {
    /// Pids of running processes whose executable name contains any of `names`.
    fn list_processes(&self, names: &[String]) -> Vec<u32>;

    /// Opens `pid` with read and query access.
    fn open(&self, pid: u32) -> Result<Box<dyn ProcessMemory>, InspectError>;
}

pub trait ProcessMemory: Send + Sync {
    fn pid(&self) -> u32;

    /// Describes the region containing `cursor`, or the next one after it.
    fn query_region(&self, cursor: usize) -> Result<RegionInfo, InspectError>;

    /// Reads `buf.len()` bytes at `address`; returns the byte count read.
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<usize, InspectError>;
}

/// Process listing shared by the OS backends.
pub fn list_processes_by_name(names: &[String]) -> Vec<u32> {
    let sys = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    let mut pids: Vec<u32> = sys
        .processes()
        .iter()
        .filter(|(_, p)| {
            let exe = p.name().to_string_lossy();
            names.iter().any(|n| !n.is_empty() && exe.contains(n.as_str()))
        })
        .map(|(pid, _)| pid.as_u32())
        .collect();
    pids.sort_unstable();
    pids
}

/// Inspector for platforms without a memory backend: lists processes but
/// refuses to open them.
#[derive(Debug, Default)]
pub struct UnsupportedInspector;

impl ProcessInspector for UnsupportedInspector {
    fn list_processes(&self, names: &[String]) -> Vec<u32> {
        list_processes_by_name(names)
    }

    fn open(&self, _pid: u32) -> Result<Box<dyn ProcessMemory>, InspectError> {
        Err(InspectError::Unsupported)
    }
}

/// The memory backend for the platform this was built for.
pub fn native() -> Box<dyn ProcessInspector> {
    #[cfg(windows)]
    {
        Box::new(windows::WinInspector)
    }
    #[cfg(not(windows))]
    {
        Box::new(UnsupportedInspector)
    }
}
