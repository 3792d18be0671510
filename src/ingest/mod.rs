//! Data ingestion: file uploads and live device polling

pub mod poll;
pub mod scheduler;
pub mod upload;

pub use poll::{poll_once, JsonFileFetcher, PollOutcome, Snapshot, SnapshotFetcher, SnapshotItem};
pub use scheduler::PollScheduler;
pub use upload::{upload, UploadReport};
