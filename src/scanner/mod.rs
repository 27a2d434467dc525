// src/scanner/mod.rs

pub mod detector;
pub mod lifecycle;
pub mod process;
pub mod region;
pub mod signature;
pub mod worker;

pub use detector::KeyGrabber;
pub use process::{LifecycleState, MonitoredProcess};
pub use region::{MemoryRegion, RegionEnumerator, RegionFilter};
pub use signature::{encode_block, find_key_blocks, KeyBlock};
