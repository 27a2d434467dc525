// src/scanner/process.rs

//! Per-client scan state shared between the lifecycle thread and its
//! workers.

use super::region::MemoryRegion;
use crate::inspect::ProcessMemory;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    time::Duration,
};

/// Where a monitored client is in its scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Scanning,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An item on a client's region queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEntry {
    Scan(MemoryRegion),
    /// Tells exactly one worker to exit.
    Terminate,
}

/// FIFO of regions awaiting a worker, with its own lock.
#[derive(Default)]
pub struct RegionQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    ready:   Condvar,
}

impl RegionQueue {
    pub fn push(&self, region: MemoryRegion) {
        self.lock().push_back(QueueEntry::Scan(region));
        self.ready.notify_one();
    }

    /// Queues `n` termination sentinels behind any pending regions.
    pub fn push_terminate(&self, n: usize) {
        let mut entries = self.lock();
        entries.extend(std::iter::repeat(QueueEntry::Terminate).take(n));
        drop(entries);
        self.ready.notify_all();
    }

    /// Pops the oldest entry, waiting up to `wait` for one to arrive.
    pub fn pop_within(&self, wait: Duration) -> Option<QueueEntry> {
        let entries = self.lock();
        let (mut entries, _) = self
            .ready
            .wait_timeout_while(entries, wait, |q| q.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.pop_front()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A game client being scanned.
///
/// The OS handle lives here, not in the workers: each worker holds a
/// `WorkerGuard` that counts it as active, and `close_handle` waits for that
/// count to drop to zero before releasing the handle.
pub struct MonitoredProcess {
    pid:             u32,
    needs_login_key: AtomicBool,
    state:           Mutex<LifecycleState>,
    queue:           RegionQueue,
    handle:          Mutex<Option<Arc<dyn ProcessMemory>>>,
    active:          Mutex<usize>,
    idle:            Condvar,
}

impl MonitoredProcess {
    pub fn new(pid: u32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            needs_login_key: AtomicBool::new(true),
            state: Mutex::new(LifecycleState::Starting),
            queue: RegionQueue::default(),
            handle: Mutex::new(None),
            active: Mutex::new(0),
            idle: Condvar::new(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn queue(&self) -> &RegionQueue {
        &self.queue
    }

    pub fn needs_login_key(&self) -> bool {
        self.needs_login_key.load(Ordering::SeqCst)
    }

    /// Ends the scanning phase at the next enumeration step.
    pub fn clear_needs_login_key(&self) {
        self.needs_login_key.store(false, Ordering::SeqCst);
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Takes ownership of an open handle; workers borrow it from here.
    pub fn install_handle(&self, memory: Box<dyn ProcessMemory>) -> Arc<dyn ProcessMemory> {
        let memory: Arc<dyn ProcessMemory> = Arc::from(memory);
        *self.handle_slot() = Some(Arc::clone(&memory));
        memory
    }

    pub fn has_handle(&self) -> bool {
        self.handle_slot().is_some()
    }

    /// Registers a worker before it starts. `None` if no handle is open.
    pub fn enter_worker(self: &Arc<Self>) -> Option<WorkerGuard> {
        let memory = self.handle_slot().as_ref().map(Arc::clone)?;
        *self.active_count() += 1;
        Some(WorkerGuard { memory, slot: ActiveSlot(Arc::clone(self)) })
    }

    pub fn active_workers(&self) -> usize {
        *self.active_count()
    }

    /// Blocks until every `WorkerGuard` has been dropped.
    pub fn wait_workers_idle(&self) {
        let active = self.active_count();
        let _idle = self
            .idle
            .wait_while(active, |n| *n > 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }

    /// Waits for all workers to finish, then drops the handle.
    pub fn close_handle(&self) {
        self.wait_workers_idle();
        let handle = self.handle_slot().take();
        drop(handle);
    }

    fn handle_slot(&self) -> MutexGuard<'_, Option<Arc<dyn ProcessMemory>>> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn active_count(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Marks one worker as active for as long as it lives.
pub struct WorkerGuard {
    // declared first so the handle share is released before the slot
    memory: Arc<dyn ProcessMemory>,
    slot:   ActiveSlot,
}

impl WorkerGuard {
    pub fn process(&self) -> &Arc<MonitoredProcess> {
        &self.slot.0
    }

    pub fn memory(&self) -> &dyn ProcessMemory {
        self.memory.as_ref()
    }
}

struct ActiveSlot(Arc<MonitoredProcess>);

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let mut active = self.0.active_count();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.0.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::image::{ImageInspector, MemoryImage};
    use crate::inspect::ProcessInspector;
    use std::{thread, time::Instant};

    fn opened(inspector: &ImageInspector) -> Arc<MonitoredProcess> {
        inspector.spawn(7, "game.exe", MemoryImage::new());
        let process = MonitoredProcess::new(7);
        process.install_handle(inspector.open(7).unwrap());
        process
    }

    #[test]
    fn queue_is_fifo() {
        let q = RegionQueue::default();
        q.push(MemoryRegion { base: 1, len: 10 });
        q.push(MemoryRegion { base: 2, len: 20 });
        q.push_terminate(1);
        let wait = Duration::from_millis(1);
        assert_eq!(q.pop_within(wait), Some(QueueEntry::Scan(MemoryRegion { base: 1, len: 10 })));
        assert_eq!(q.pop_within(wait), Some(QueueEntry::Scan(MemoryRegion { base: 2, len: 20 })));
        assert_eq!(q.pop_within(wait), Some(QueueEntry::Terminate));
        assert_eq!(q.pop_within(wait), None);
    }

    #[test]
    fn pop_wakes_on_push() {
        let q = Arc::new(RegionQueue::default());
        let q2 = Arc::clone(&q);
        let t = thread::spawn(move || q2.pop_within(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        q.push(MemoryRegion { base: 9, len: 9 });
        assert_eq!(t.join().unwrap(), Some(QueueEntry::Scan(MemoryRegion { base: 9, len: 9 })));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn handle_outlives_workers() {
        let inspector = ImageInspector::new();
        let process = opened(&inspector);
        let guard = process.enter_worker().unwrap();
        assert_eq!(process.active_workers(), 1);

        let closer = {
            let process = Arc::clone(&process);
            thread::spawn(move || process.close_handle())
        };
        thread::sleep(Duration::from_millis(30));
        // still blocked on the active worker
        assert!(!closer.is_finished());
        assert_eq!(inspector.open_handles(), 1);

        drop(guard);
        closer.join().unwrap();
        assert_eq!(process.active_workers(), 0);
        assert_eq!(inspector.open_handles(), 0);
        assert!(process.enter_worker().is_none());
    }

    #[test]
    fn needs_login_key_starts_set() {
        let process = MonitoredProcess::new(1);
        assert!(process.needs_login_key());
        process.clear_needs_login_key();
        assert!(!process.needs_login_key());
        assert_eq!(process.state(), LifecycleState::Starting);
    }
}
