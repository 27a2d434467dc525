// src/scanner/detector.rs

//! Top-level detection loop: watches the process list for game clients and
//! runs a scan for each one that appears.

use super::lifecycle::{run_lifecycle, ScanContext};
use super::process::{LifecycleState, MonitoredProcess};
use crate::comms::events::{EventSink, ScanEvent};
use crate::config::types::{Config, DetectionConfig};
use crate::inspect::ProcessInspector;
use crate::keygrab_log;
use crate::keys::KeyStore;
use log::Level;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

/// Finds game clients, scans them for keys and keeps the shared candidate
/// store that decode streams search and claim from.
pub struct KeyGrabber {
    ctx:       ScanContext,
    detection: DetectionConfig,
    clients:   Mutex<BTreeMap<u32, Arc<MonitoredProcess>>>,
}

impl KeyGrabber {
    pub fn new(cfg: Config, inspector: Arc<dyn ProcessInspector>, sink: Arc<dyn EventSink>) -> Self {
        let store = Arc::new(KeyStore::new(cfg.store).with_sink(Arc::clone(&sink)));
        let executables = cfg.detection.executables.clone();
        Self {
            ctx: ScanContext::new(store, sink, inspector, cfg.scanner, executables),
            detection: cfg.detection,
            clients: Mutex::new(BTreeMap::new()),
        }
    }

    /// The candidate store fed by every client's scan.
    pub fn store(&self) -> Arc<KeyStore> {
        Arc::clone(&self.ctx.store)
    }

    /// Polls until `shutdown` is called.
    pub fn run(&self) {
        keygrab_log!(
            Level::Info,
            "detector",
            "watching for {:?} (idle poll {:?}, active poll {:?})",
            self.detection.executables,
            self.detection.idle_poll,
            self.detection.active_poll
        );
        while !self.ctx.is_shutting_down() {
            let found = self.poll_once();
            let pause = if found == 0 { self.detection.idle_poll } else { self.detection.active_poll };
            self.ctx.sleep(pause, || false);
        }
        keygrab_log!(Level::Info, "detector", "detection loop stopped");
    }

    /// One detection pass. Retires clients that vanished, then scans each
    /// new one to completion. Returns the number of clients listed.
    pub fn poll_once(&self) -> usize {
        let pids = self.ctx.inspector.list_processes(&self.ctx.executables);

        let gone: Vec<Arc<MonitoredProcess>> = {
            let mut clients = self.clients();
            let gone_pids: Vec<u32> = clients.keys().filter(|pid| !pids.contains(*pid)).copied().collect();
            gone_pids.iter().filter_map(|pid| clients.remove(pid)).collect()
        };
        for process in gone {
            self.retire(&process);
        }

        for &pid in &pids {
            if self.ctx.is_shutting_down() {
                break;
            }
            let process = {
                let mut clients = self.clients();
                if clients.contains_key(&pid) {
                    continue;
                }
                let process = MonitoredProcess::new(pid);
                clients.insert(pid, Arc::clone(&process));
                process
            };
            keygrab_log!(Level::Info, "detector", "client started: pid {pid}");
            self.ctx.sink.emit(ScanEvent::ClientStarted { pid });
            run_lifecycle(&self.ctx, &process);
        }

        pids.len()
    }

    fn retire(&self, process: &MonitoredProcess) {
        let pid = process.pid();
        keygrab_log!(Level::Info, "detector", "client stopped: pid {pid}");
        self.ctx.sink.emit(ScanEvent::ClientStopped { pid });
        if process.state() != LifecycleState::Stopped {
            process.clear_needs_login_key();
            process.close_handle();
            process.set_state(LifecycleState::Stopped);
        }
        self.ctx.store.purge(pid);
    }

    /// Ends the scanning phase of `pid`, e.g. once its login key has been
    /// claimed. Returns false for an unknown pid.
    pub fn stop_scan(&self, pid: u32) -> bool {
        match self.clients().get(&pid) {
            Some(process) => {
                keygrab_log!(Level::Debug, "detector", "pid {pid}: scan stop requested");
                process.clear_needs_login_key();
                true
            }
            None => false,
        }
    }

    /// Forgets a finished client so the next poll scans it again, e.g. after
    /// it logged out and needs a fresh login key. Returns false unless `pid`
    /// was known and Stopped.
    pub fn request_rescan(&self, pid: u32) -> bool {
        let mut clients = self.clients();
        let stopped = clients.get(&pid).is_some_and(|p| p.state() == LifecycleState::Stopped);
        if stopped {
            clients.remove(&pid);
            keygrab_log!(Level::Debug, "detector", "pid {pid}: rescan requested");
        }
        stopped
    }

    /// Stops the detection loop and any scan in progress.
    pub fn shutdown(&self) {
        self.ctx.shutdown();
        for process in self.clients().values() {
            process.clear_needs_login_key();
        }
    }

    pub fn client_state(&self, pid: u32) -> Option<LifecycleState> {
        self.clients().get(&pid).map(|p| p.state())
    }

    /// Known clients and their state, ordered by pid.
    pub fn client_states(&self) -> Vec<(u32, LifecycleState)> {
        self.clients().iter().map(|(pid, p)| (*pid, p.state())).collect()
    }

    fn clients(&self) -> MutexGuard<'_, BTreeMap<u32, Arc<MonitoredProcess>>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
