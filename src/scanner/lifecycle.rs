// src/scanner/lifecycle.rs

//! Drives one client through Starting → Scanning → Stopping → Stopped.

use super::process::{LifecycleState, MonitoredProcess};
use super::region::{RegionEnumerator, RegionFilter, Step};
use super::worker::spawn_worker;
use crate::comms::events::{EventSink, ScanEvent};
use crate::config::types::ScannerConfig;
use crate::inspect::{ProcessInspector, ProcessMemory};
use crate::keygrab_log;
use crate::keys::KeyStore;
use log::Level;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Everything a lifecycle run needs besides the process itself.
pub struct ScanContext {
    pub store:       Arc<KeyStore>,
    pub sink:        Arc<dyn EventSink>,
    pub inspector:   Arc<dyn ProcessInspector>,
    pub scanner:     ScannerConfig,
    pub executables: Vec<String>,
    shutdown:        AtomicBool,
}

impl ScanContext {
    pub fn new(
        store: Arc<KeyStore>,
        sink: Arc<dyn EventSink>,
        inspector: Arc<dyn ProcessInspector>,
        scanner: ScannerConfig,
        executables: Vec<String>,
    ) -> Self {
        Self { store, sink, inspector, scanner, executables, shutdown: AtomicBool::new(false) }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Whether `pid` still shows up in the process list.
    pub fn is_listed(&self, pid: u32) -> bool {
        self.inspector.list_processes(&self.executables).contains(&pid)
    }

    /// Sleeps for `total` unless shutdown is requested or `cancel` turns
    /// true first.
    pub fn sleep(&self, total: Duration, cancel: impl Fn() -> bool) {
        let deadline = Instant::now() + total;
        loop {
            if self.is_shutting_down() || cancel() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Runs the full scan of `process`, blocking until it is Stopped.
pub fn run_lifecycle(ctx: &ScanContext, process: &Arc<MonitoredProcess>) {
    let pid = process.pid();

    // Starting
    process.set_state(LifecycleState::Starting);
    process.queue().clear();
    let memory = match ctx.inspector.open(pid) {
        Ok(m) => process.install_handle(m),
        Err(e) => {
            keygrab_log!(Level::Warn, "lifecycle", "pid {pid}: cannot open process: {e}");
            process.set_state(LifecycleState::Stopped);
            return;
        }
    };
    if let Err(e) = memory.query_region(0) {
        keygrab_log!(Level::Warn, "lifecycle", "pid {pid}: handle unusable: {e}");
        drop(memory);
        finish(ctx, process, false);
        return;
    }

    // Scanning
    process.set_state(LifecycleState::Scanning);
    let mut workers = Vec::with_capacity(ctx.scanner.workers);
    for index in 0..ctx.scanner.workers {
        let Some(guard) = process.enter_worker() else { break };
        match spawn_worker(index, guard, Arc::clone(&ctx.store), &ctx.scanner) {
            Ok(handle) => workers.push(handle),
            Err(e) => keygrab_log!(Level::Warn, "lifecycle", "pid {pid}: worker {index} failed to start: {e}"),
        }
    }
    if workers.is_empty() {
        keygrab_log!(Level::Error, "lifecycle", "pid {pid}: no scan worker started, giving up");
        drop(memory);
        process.set_state(LifecycleState::Stopping);
        finish(ctx, process, false);
        return;
    }
    ctx.sink.emit(ScanEvent::ScanStarted { pid });
    keygrab_log!(Level::Info, "lifecycle", "pid {pid}: scanning with {} worker(s)", workers.len());

    enumerate(ctx, process, memory.as_ref());
    drop(memory);

    // Stopping
    process.set_state(LifecycleState::Stopping);
    process.queue().push_terminate(workers.len());
    process.wait_workers_idle();
    for handle in workers {
        if handle.join().is_err() {
            keygrab_log!(Level::Error, "lifecycle", "pid {pid}: scan worker panicked");
        }
    }

    finish(ctx, process, true);
}

/// Feeds matching regions to the queue until the login key is no longer
/// needed, the process is gone, or it refuses further queries.
fn enumerate(ctx: &ScanContext, process: &MonitoredProcess, memory: &dyn ProcessMemory) {
    let pid = process.pid();
    let released = || !process.needs_login_key();
    let mut walk = RegionEnumerator::new(memory, RegionFilter::from_config(&ctx.scanner));
    let mut passes = 0u64;

    while process.needs_login_key() && !ctx.is_shutting_down() {
        match walk.step() {
            Step::Region(region) => process.queue().push(region),
            Step::Skipped => {}
            Step::Restart(err) => {
                passes += 1;
                if let Some(e) = err {
                    keygrab_log!(Level::Debug, "lifecycle", "pid {pid}: region query failed: {e}");
                }
                ctx.sleep(ctx.scanner.query_backoff, released);
                // let the workers catch up before queueing the next pass
                while !process.queue().is_empty()
                    && process.active_workers() > 0
                    && process.needs_login_key()
                    && !ctx.is_shutting_down()
                {
                    ctx.sleep(ctx.scanner.empty_queue_sleep, released);
                }
                if process.active_workers() == 0 {
                    keygrab_log!(Level::Error, "lifecycle", "pid {pid}: every scan worker exited");
                    break;
                }
                if !ctx.is_listed(pid) {
                    keygrab_log!(Level::Info, "lifecycle", "pid {pid}: process exited");
                    break;
                }
            }
            Step::Denied => {
                keygrab_log!(Level::Warn, "lifecycle", "pid {pid}: access denied, scan aborted");
                break;
            }
        }
    }
    keygrab_log!(Level::Debug, "lifecycle", "pid {pid}: enumeration ended after {passes} pass(es)");
}

fn finish(ctx: &ScanContext, process: &MonitoredProcess, scanned: bool) {
    let pid = process.pid();
    process.close_handle();
    process.queue().clear();
    let purged = ctx.store.purge(pid);
    process.set_state(LifecycleState::Stopped);
    if scanned {
        ctx.sink.emit(ScanEvent::ScanEnded { pid });
    }
    keygrab_log!(Level::Info, "lifecycle", "pid {pid}: stopped, {purged} unclaimed candidate(s) purged");
}
