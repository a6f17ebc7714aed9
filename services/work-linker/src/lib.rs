//!
//! src/lib.rs  Andrew Belles  Oct 16th, 2026
//!
//! Batch linker for "recording is a performance of work" relationships.
//! Rate limited lookup and edit queues, fuzzy work suggestions, and a
//! ledger that keeps repeated triggers from reaching the edit service.
//!

pub mod config;
pub mod errors;
pub mod logging;

pub mod cache;
pub mod fetch;
pub mod ledger;
pub mod linker;
pub mod matcher;
pub mod normalize;
pub mod period;
pub mod persistent;
pub mod rate;
pub mod scheduler;
pub mod types;

pub use errors::LinkerError;
pub use linker::{Linker, LinkerSettings};
