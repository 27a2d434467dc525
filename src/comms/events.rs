//! Events surfaced to whatever renders client state (UI log, console).
//!
//! The engine only emits plain structured values; how they are displayed is
//! the sink's business. Two sinks ship with the crate:
//! - `ChannelSink` forwards into a crossbeam channel for a consumer thread;
//! - `LogSink` writes each event as a JSON line through the `log` facade.

use crate::keygrab_log;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use log::Level;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ScanEvent {
    ClientStarted { pid: u32 },
    ClientStopped { pid: u32 },
    ScanStarted { pid: u32 },
    ScanEnded { pid: u32 },
    CandidateFound { pid: u32, address: usize },
    ClaimError { stream_id: u32, pid: u32 },
}

impl ScanEvent {
    pub fn pid(&self) -> u32 {
        match *self {
            ScanEvent::ClientStarted { pid }
            | ScanEvent::ClientStopped { pid }
            | ScanEvent::ScanStarted { pid }
            | ScanEvent::ScanEnded { pid }
            | ScanEvent::CandidateFound { pid, .. }
            | ScanEvent::ClaimError { pid, .. } => pid,
        }
    }
}

/// Receives engine events. Must never block the caller for long; scan
/// workers emit while running.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ScanEvent);
}

/// Forwards events into a crossbeam channel. A full bounded channel drops
/// the event rather than stalling a scan worker.
pub struct ChannelSink {
    tx: Sender<ScanEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<ScanEvent>) -> Self {
        Self { tx }
    }

    pub fn unbounded() -> (Self, Receiver<ScanEvent>) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, rx)
    }

    pub fn bounded(capacity: usize) -> (Self, Receiver<ScanEvent>) {
        let (tx, rx) = channel::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ScanEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(ev)) => {
                keygrab_log!(Level::Warn, "events", "event queue full, dropped {:?}", ev)
            }
            // receiver gone: nobody is listening any more
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Writes events to the log as JSON, prefixed with the client pid.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl LogSink {
    fn level(event: &ScanEvent) -> Level {
        match event {
            ScanEvent::ClaimError { .. } => Level::Error,
            ScanEvent::CandidateFound { .. } => Level::Debug,
            _ => Level::Info,
        }
    }

    fn line(event: &ScanEvent) -> serde_json::Result<String> {
        Ok(format!("pid {}: {}", event.pid(), serde_json::to_string(event)?))
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: ScanEvent) {
        match Self::line(&event) {
            Ok(line) => keygrab_log!(Self::level(&event), "events", "{}", line),
            Err(e) => keygrab_log!(Level::Warn, "events", "unserializable event {:?}: {}", event, e),
        }
    }
}
