//! Outbound notifications to external collaborators.

pub mod events;

pub use events::{ChannelSink, EventSink, LogSink, ScanEvent};
