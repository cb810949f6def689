//! Stale share-link cleanup: link classification, staleness probes, and the
//! checkpointed background job.

pub mod checkpoint;
pub mod job;
pub mod links;
pub mod probe;
pub mod retry;

pub use job::{CleanupJobs, CleanupSettings, JobSnapshot, JobStatus};
pub use links::parse_providers;
pub use probe::build_probe;
