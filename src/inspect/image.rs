//! In-memory process images.
//!
//! A `MemoryImage` is a list of regions with their bytes, which lets the
//! whole scan pipeline run against a captured dump or a hand-built fixture.
//! `ImageInspector` hosts any number of images under fake pids and can make
//! them appear and disappear, deny access, or fail reads, so every error
//! path of the engine can be driven deterministically.

use super::{
    InspectError, ProcessInspector, ProcessMemory, Protection, RegionInfo, RegionKind, RegionState,
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadBehaviour {
    Ok,
    PartialCopy,
    Fail(u32),
}

#[derive(Debug, Clone)]
struct ImageRegion {
    info:  RegionInfo,
    bytes: Vec<u8>,
    read:  ReadBehaviour,
}

/// Address space of one fake process.
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    regions:    Vec<ImageRegion>,
    deny_after: Option<usize>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a committed, private, read-write region holding `bytes`.
    pub fn with_heap(self, base: usize, bytes: Vec<u8>) -> Self {
        let size = bytes.len();
        self.with_region(
            RegionInfo {
                base,
                size,
                protection: Protection::ReadWrite,
                state: RegionState::Committed,
                kind: RegionKind::Private,
            },
            bytes,
        )
    }

    /// Adds a region with explicit attributes. `bytes` is zero-padded or
    /// truncated to `info.size`.
    pub fn with_region(mut self, info: RegionInfo, mut bytes: Vec<u8>) -> Self {
        bytes.resize(info.size, 0);
        self.regions.push(ImageRegion { info, bytes, read: ReadBehaviour::Ok });
        self.regions.sort_by_key(|r| r.info.base);
        self
    }

    /// Reads of the region at `base` fail with a partial copy.
    pub fn with_partial_copy(mut self, base: usize) -> Self {
        self.set_read(base, ReadBehaviour::PartialCopy);
        self
    }

    /// Reads of the region at `base` fail with OS error `code`.
    pub fn with_read_error(mut self, base: usize, code: u32) -> Self {
        self.set_read(base, ReadBehaviour::Fail(code));
        self
    }

    /// Region queries start failing with access denied after `n` successes.
    pub fn deny_queries_after(mut self, n: usize) -> Self {
        self.deny_after = Some(n);
        self
    }

    fn set_read(&mut self, base: usize, read: ReadBehaviour) {
        if let Some(r) = self.regions.iter_mut().find(|r| r.info.base == base) {
            r.read = read;
        }
    }
}

struct FakeProcess {
    exe:   String,
    image: Arc<MemoryImage>,
}

#[derive(Default)]
struct InspectorState {
    running:   BTreeMap<u32, FakeProcess>,
    deny_open: HashSet<u32>,
}

/// Hosts `MemoryImage`s as running processes.
#[derive(Clone, Default)]
pub struct ImageInspector {
    state:        Arc<Mutex<InspectorState>>,
    open_handles: Arc<AtomicUsize>,
    opened_total: Arc<AtomicUsize>,
}

impl ImageInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `image` visible as a running process named `exe`.
    pub fn spawn(&self, pid: u32, exe: &str, image: MemoryImage) {
        self.state().running.insert(pid, FakeProcess { exe: exe.to_string(), image: Arc::new(image) });
    }

    /// Removes `pid` from the process list. Open handles stay usable.
    pub fn kill(&self, pid: u32) {
        self.state().running.remove(&pid);
    }

    /// `open(pid)` fails as if the process were protected.
    pub fn deny_open(&self, pid: u32) {
        self.state().deny_open.insert(pid);
    }

    /// Handles currently open (not yet dropped).
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Handles ever opened.
    pub fn opened_total(&self) -> usize {
        self.opened_total.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, InspectorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProcessInspector for ImageInspector {
    fn list_processes(&self, names: &[String]) -> Vec<u32> {
        self.state()
            .running
            .iter()
            .filter(|(_, p)| names.iter().any(|n| !n.is_empty() && p.exe.contains(n.as_str())))
            .map(|(pid, _)| *pid)
            .collect()
    }

    fn open(&self, pid: u32) -> Result<Box<dyn ProcessMemory>, InspectError> {
        let state = self.state();
        if state.deny_open.contains(&pid) {
            return Err(InspectError::Open { pid, code: 5 });
        }
        let Some(process) = state.running.get(&pid) else {
            return Err(InspectError::Open { pid, code: 87 });
        };
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        self.opened_total.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ImageHandle {
            pid,
            image: Arc::clone(&process.image),
            queries: AtomicUsize::new(0),
            open_handles: Arc::clone(&self.open_handles),
        }))
    }
}

struct ImageHandle {
    pid:          u32,
    image:        Arc<MemoryImage>,
    queries:      AtomicUsize,
    open_handles: Arc<AtomicUsize>,
}

impl ProcessMemory for ImageHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn query_region(&self, cursor: usize) -> Result<RegionInfo, InspectError> {
        let done = self.queries.fetch_add(1, Ordering::SeqCst);
        if self.image.deny_after.is_some_and(|n| done >= n) {
            return Err(InspectError::AccessDenied);
        }

        let next = self.image.regions.iter().find(|r| r.info.end() > cursor);
        match next {
            Some(r) if r.info.base <= cursor => Ok(r.info),
            // report the unmapped gap up to the next region
            Some(r) => Ok(RegionInfo {
                base: cursor,
                size: r.info.base - cursor,
                protection: Protection::NoAccess,
                state: RegionState::Free,
                kind: RegionKind::None,
            }),
            None => Err(InspectError::InvalidParameter),
        }
    }

    fn read(&self, address: usize, buf: &mut [u8]) -> Result<usize, InspectError> {
        let region = self
            .image
            .regions
            .iter()
            .find(|r| r.info.base <= address && address < r.info.end())
            .ok_or(InspectError::PartialCopy { read: 0, requested: buf.len() })?;

        match region.read {
            ReadBehaviour::PartialCopy => {
                return Err(InspectError::PartialCopy { read: 0, requested: buf.len() });
            }
            ReadBehaviour::Fail(code) => return Err(InspectError::Os(code)),
            ReadBehaviour::Ok => {}
        }

        let offset = address - region.info.base;
        let available = &region.bytes[offset..];
        if available.len() < buf.len() {
            return Err(InspectError::PartialCopy { read: available.len(), requested: buf.len() });
        }
        buf.copy_from_slice(&available[..buf.len()]);
        Ok(buf.len())
    }
}

impl Drop for ImageHandle {
    fn drop(&mut self) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_walks_regions_and_gaps() {
        let image = MemoryImage::new().with_heap(0x1000, vec![1; 0x800]).with_heap(0x4000, vec![2; 0x800]);
        let inspector = ImageInspector::new();
        inspector.spawn(1, "PathOfExile.exe", image);
        let handle = inspector.open(1).unwrap();

        let first = handle.query_region(0).unwrap();
        assert_eq!((first.base, first.size, first.state), (0, 0x1000, RegionState::Free));
        let heap = handle.query_region(first.end()).unwrap();
        assert_eq!((heap.base, heap.state), (0x1000, RegionState::Committed));
        let gap = handle.query_region(heap.end()).unwrap();
        assert_eq!((gap.base, gap.size), (0x1800, 0x2800));
        assert_eq!(handle.query_region(0x4800), Err(InspectError::InvalidParameter));
    }

    #[test]
    fn handles_are_counted_until_dropped() {
        let inspector = ImageInspector::new();
        inspector.spawn(1, "PathOfExile.exe", MemoryImage::new());
        let a = inspector.open(1).unwrap();
        let b = inspector.open(1).unwrap();
        assert_eq!(inspector.open_handles(), 2);
        drop(a);
        drop(b);
        assert_eq!(inspector.open_handles(), 0);
        assert_eq!(inspector.opened_total(), 2);
    }

    #[test]
    fn list_matches_substrings() {
        let inspector = ImageInspector::new();
        inspector.spawn(1, "PathOfExile_x64.exe", MemoryImage::new());
        inspector.spawn(2, "notepad.exe", MemoryImage::new());
        assert_eq!(inspector.list_processes(&["PathOfExile".into()]), vec![1]);
        inspector.kill(1);
        assert!(inspector.list_processes(&["PathOfExile".into()]).is_empty());
    }

    #[test]
    fn read_errors_are_distinguished() {
        let image = MemoryImage::new()
            .with_heap(0x1000, vec![0; 16])
            .with_heap(0x2000, vec![0; 16])
            .with_partial_copy(0x1000)
            .with_read_error(0x2000, 998);
        let inspector = ImageInspector::new();
        inspector.spawn(1, "x.exe", image);
        let handle = inspector.open(1).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(handle.read(0x1000, &mut buf), Err(InspectError::PartialCopy { .. })));
        assert_eq!(handle.read(0x2000, &mut buf), Err(InspectError::Os(998)));
    }
}
