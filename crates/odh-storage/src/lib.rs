//! HTTP fetch utilities and the relational record store.

pub mod buckets;
pub mod fetch;
pub mod records;

pub use buckets::{group_bucket_rows, BucketRow};
pub use fetch::{
    is_transient_error, is_transient_status, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher,
    ReachabilityChecker, RequestPacer, RetryPolicy,
};
pub use records::{
    retraction_decision, PurgeOutcome, RecordStore, RetractionDecision, RetractionMode, RetractionOutcome,
    RetractionPolicy, SourceWriteScope, StoreError, UpsertBuffer, DEFAULT_BATCH_SIZE,
};

pub const CRATE_NAME: &str = "odh-storage";
