//! # Call Orchestration
//!
//! One outbound call attempt from dial to persisted transcript, plus the
//! registry the HTTP layer reads from.

pub mod registry;
pub mod runner;
pub mod storage;

pub use registry::{CallRegistry, CallSnapshot};
pub use runner::{CallReport, CallRunner, Contact};
pub use storage::{CallStore, InMemoryStore, JsonFileStore};
