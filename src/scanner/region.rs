// src/scanner/region.rs

//! Address-space walk and region filtering.

use crate::config::types::ScannerConfig;
use crate::inspect::{InspectError, ProcessMemory, Protection, RegionInfo, RegionKind, RegionState};

/// A span of target memory queued for one worker to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: usize,
    pub len:  usize,
}

/// Where cipher state can live: committed, private, read-write heap
/// allocations of moderate size. Everything else is skipped unread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionFilter {
    /// Exclusive lower bound.
    pub min_bytes: usize,
    /// Inclusive upper bound.
    pub max_bytes: usize,
}

impl RegionFilter {
    pub fn from_config(cfg: &ScannerConfig) -> Self {
        Self { min_bytes: cfg.min_region_bytes, max_bytes: cfg.max_region_bytes }
    }

    pub fn accepts(&self, info: &RegionInfo) -> bool {
        info.protection == Protection::ReadWrite
            && info.state == RegionState::Committed
            && info.kind == RegionKind::Private
            && info.size > self.min_bytes
            && info.size <= self.max_bytes
    }
}

impl Default for RegionFilter {
    fn default() -> Self {
        Self::from_config(&ScannerConfig::default())
    }
}

/// Result of one enumeration step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A region worth scanning.
    Region(MemoryRegion),
    /// A region that failed the filter; keep going.
    Skipped,
    /// The walk hit the end of the address space or a failed query. The
    /// cursor is back at address 0; the caller should pause before the next
    /// step.
    Restart(Option<InspectError>),
    /// The process cannot be inspected any further.
    Denied,
}

/// Cursor over a process's address space.
pub struct RegionEnumerator<'a> {
    memory: &'a dyn ProcessMemory,
    filter: RegionFilter,
    cursor: usize,
}

impl<'a> RegionEnumerator<'a> {
    pub fn new(memory: &'a dyn ProcessMemory, filter: RegionFilter) -> Self {
        Self { memory, filter, cursor: 0 }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn step(&mut self) -> Step {
        match self.memory.query_region(self.cursor) {
            Ok(info) => {
                let next = info.end();
                if next <= self.cursor {
                    // top of the address space
                    self.cursor = 0;
                    return Step::Restart(None);
                }
                self.cursor = next;
                if self.filter.accepts(&info) {
                    Step::Region(MemoryRegion { base: info.base, len: info.size })
                } else {
                    Step::Skipped
                }
            }
            Err(InspectError::AccessDenied) => Step::Denied,
            Err(InspectError::InvalidParameter) => {
                self.cursor = 0;
                Step::Restart(None)
            }
            Err(e) => {
                self.cursor = 0;
                Step::Restart(Some(e))
            }
        }
    }
}
