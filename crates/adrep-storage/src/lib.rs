//! Durable local state and HTTP plumbing shared by the adrep report jobs.

pub mod artifacts;
pub mod checkpoint;
pub mod http;
pub mod object_store;
pub mod paging;
pub mod poll;

pub use artifacts::{RawDumpStore, StoredDump};
pub use checkpoint::{CheckpointStore, JsonFileCheckpointStore};
pub use http::{
    classify_reqwest_error, classify_status, ErrorClass, FetchError, HttpClientConfig, HttpFetcher,
};
pub use object_store::{dated_object_path, upload_best_effort, DirectoryBucket, ObjectStorage};
pub use paging::{fetch_all_pages, Page, PageLimits, Paged};
pub use poll::{poll_until, PollError, PollPolicy, PollStatus};

pub const CRATE_NAME: &str = "adrep-storage";
