// src/scanner/worker.rs

//! Scan workers: drain a client's region queue, read each region and feed
//! any key blocks found into the shared store.

use super::process::{QueueEntry, WorkerGuard};
use super::region::MemoryRegion;
use super::signature::find_key_blocks;
use crate::config::types::ScannerConfig;
use crate::inspect::{InspectError, ProcessMemory};
use crate::keygrab_log;
use crate::keys::{KeyMaterial, KeyStore};
use log::Level;
use std::{io, sync::Arc, thread, time::Duration};

#[derive(Debug, Clone, Copy)]
struct Pacing {
    queue_wait:        Duration,
    empty_queue_sleep: Duration,
}

/// Starts worker `index` for the process owning `guard`. The guard travels
/// into the thread and is dropped when the worker exits.
pub fn spawn_worker(
    index: usize,
    guard: WorkerGuard,
    store: Arc<KeyStore>,
    cfg: &ScannerConfig,
) -> io::Result<thread::JoinHandle<()>> {
    let pid = guard.process().pid();
    let pacing = Pacing { queue_wait: cfg.queue_wait, empty_queue_sleep: cfg.empty_queue_sleep };
    thread::Builder::new()
        .name(format!("scan-{pid}-{index}"))
        .spawn(move || run_worker(guard, &store, pacing))
}

fn run_worker(guard: WorkerGuard, store: &KeyStore, pacing: Pacing) {
    let process = Arc::clone(guard.process());
    let pid = process.pid();
    keygrab_log!(Level::Debug, "scanner", "pid {pid}: worker up");

    let mut buf = Vec::new();
    let mut scanned = 0usize;
    loop {
        match process.queue().pop_within(pacing.queue_wait) {
            None => thread::sleep(pacing.empty_queue_sleep),
            Some(QueueEntry::Terminate) => break,
            Some(QueueEntry::Scan(region)) => {
                scan_region(guard.memory(), region, &mut buf, store);
                scanned += 1;
            }
        }
    }

    keygrab_log!(Level::Debug, "scanner", "pid {pid}: worker done after {scanned} region(s)");
    drop(guard);
}

/// Reads `region` into `buf` and inserts every live key block found.
/// Returns the number of candidates the store accepted.
pub fn scan_region(
    memory: &dyn ProcessMemory,
    region: MemoryRegion,
    buf: &mut Vec<u8>,
    store: &KeyStore,
) -> usize {
    if buf.len() < region.len {
        buf.resize(region.len, 0);
    }
    let dst = &mut buf[..region.len];

    let read = match memory.read(region.base, dst) {
        Ok(n) => n.min(region.len),
        Err(InspectError::PartialCopy { .. }) => {
            // pages went away under us; the next pass picks it up again
            keygrab_log!(Level::Trace, "scanner", "pid {}: partial copy at {:#x}", memory.pid(), region.base);
            return 0;
        }
        Err(e) => {
            keygrab_log!(
                Level::Debug,
                "scanner",
                "pid {}: read of {:#x}+{:#x} failed: {}",
                memory.pid(),
                region.base,
                region.len,
                e
            );
            return 0;
        }
    };

    let mut accepted = 0;
    for block in find_key_blocks(&buf[..read]) {
        if block.is_zeroed() {
            store.note_zeroed();
            continue;
        }
        let material = KeyMaterial::from_memory(block.key, block.iv, region.base + block.offset, memory.pid());
        if store.insert(material) {
            accepted += 1;
        }
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::image::{ImageInspector, MemoryImage};
    use crate::inspect::ProcessInspector;
    use crate::scanner::signature::encode_block;

    const KEY: [u32; 8] = [0x1111_1111; 8];

    fn heap_with_block(at: usize, key: [u32; 8]) -> Vec<u8> {
        let mut bytes = vec![0u8; 4096];
        let block = encode_block(&key, &[7, 8]);
        bytes[at..at + block.len()].copy_from_slice(&block);
        bytes
    }

    #[test]
    fn found_address_is_region_base_plus_offset() {
        let inspector = ImageInspector::new();
        inspector.spawn(3, "game.exe", MemoryImage::new().with_heap(0x20000, heap_with_block(0x100, KEY)));
        let memory = inspector.open(3).unwrap();
        let store = KeyStore::default();
        let mut buf = Vec::new();

        let n = scan_region(memory.as_ref(), MemoryRegion { base: 0x20000, len: 4096 }, &mut buf, &store);
        assert_eq!(n, 1);
        let hit = store.search(1, crate::keys::Direction::Receive, None).unwrap();
        assert_eq!(hit.found_address(), Some(0x20100));
        assert_eq!(hit.source_pid(), 3);
        assert_eq!(hit.key(), &KEY);
        assert_eq!(hit.iv(), &[7, 8]);
    }

    #[test]
    fn zeroed_blocks_are_counted_not_stored() {
        let inspector = ImageInspector::new();
        let mut key = KEY;
        key[0] = 0;
        key[3] = 0;
        key[7] = 0;
        inspector.spawn(3, "game.exe", MemoryImage::new().with_heap(0x20000, heap_with_block(0, key)));
        let memory = inspector.open(3).unwrap();
        let store = KeyStore::default();

        scan_region(memory.as_ref(), MemoryRegion { base: 0x20000, len: 4096 }, &mut Vec::new(), &store);
        assert!(store.is_empty());
        assert_eq!(store.stats().zeroed, 1);
    }

    #[test]
    fn read_failures_skip_the_region() {
        let inspector = ImageInspector::new();
        let image = MemoryImage::new()
            .with_heap(0x20000, heap_with_block(0, KEY))
            .with_heap(0x30000, heap_with_block(0, [2; 8]))
            .with_partial_copy(0x20000)
            .with_read_error(0x30000, 998);
        inspector.spawn(3, "game.exe", image);
        let memory = inspector.open(3).unwrap();
        let store = KeyStore::default();
        let mut buf = Vec::new();

        assert_eq!(scan_region(memory.as_ref(), MemoryRegion { base: 0x20000, len: 4096 }, &mut buf, &store), 0);
        assert_eq!(scan_region(memory.as_ref(), MemoryRegion { base: 0x30000, len: 4096 }, &mut buf, &store), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn buffer_is_reused_across_regions() {
        let inspector = ImageInspector::new();
        let image = MemoryImage::new()
            .with_heap(0x20000, heap_with_block(3072, KEY))
            .with_heap(0x40000, vec![0; 2048]);
        inspector.spawn(3, "game.exe", image);
        let memory = inspector.open(3).unwrap();
        let store = KeyStore::default();
        let mut buf = Vec::new();

        scan_region(memory.as_ref(), MemoryRegion { base: 0x20000, len: 4096 }, &mut buf, &store);
        // stale bytes past the second region's length must not be rescanned
        scan_region(memory.as_ref(), MemoryRegion { base: 0x40000, len: 2048 }, &mut buf, &store);
        assert_eq!(buf.len(), 4096);
        assert_eq!(store.len(), 1);
    }
}
