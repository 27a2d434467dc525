//! Key material and the shared candidate pool.

pub mod ledger;
pub mod material;
pub mod store;

pub use ledger::TestState;
pub use material::{Direction, KeyMaterial, KeyOrigin, IV_WORDS, KEY_WORDS};
pub use store::{ClaimError, KeyStore, StatsSnapshot};
