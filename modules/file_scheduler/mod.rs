//! File Completion Scheduler
//!
//! Completes one conversation document per call:
//! - Parses the document into ordered conversation units
//! - Runs one retrying job per pending unit under a per-file concurrency cap
//! - Reassembles the units in document order
//! - Writes the result atomically, in place or to a new path

pub mod types;
pub mod writer;
pub mod core;

// Re-export main types and structs
pub use types::{AggregateStatus, FileTaskResult, UnitReport};
pub use writer::{write_atomic, TEMP_PREFIX};
pub use self::core::FileCompletionScheduler;
