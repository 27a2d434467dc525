// src/lib.rs
// ────────────────────────────────────────────────────────────────────────────
// Public library entry point.  Re-export everything for both `main.rs` and
// integration tests.

pub mod macros;

pub mod comms;
pub mod config;
pub mod inspect;
pub mod keys;
pub mod scanner;

pub use keys::{Direction, KeyMaterial, KeyOrigin, KeyStore};
pub use scanner::KeyGrabber;
