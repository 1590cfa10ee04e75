//! Harvest jobs, bucket aggregation and index submission.

pub mod aggregate;
pub mod cancel;
pub mod config;
pub mod pipeline;
pub mod report;

pub use aggregate::{
    aggregate_bucket, aggregator_for_profile, AggregationError, Aggregator, DcatAggregator, GeoAggregator,
};
pub use cancel::CancellationToken;
pub use config::{HarvestConfig, Profile, SourceConfig, SourceRegistry};
pub use pipeline::{build_index_backend, HarvestReport, SyncPipeline};
pub use report::{render_run_brief, write_aggregation_report, write_run_report};

pub const CRATE_NAME: &str = "odh-sync";

