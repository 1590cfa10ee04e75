//! Bulk Index Writer: chunked, per-index batched writes to the search engine.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub mod backend;
pub mod writer;

pub use backend::{
    parse_bulk_response, render_bulk_body, BulkResponse, BulkSink, ElasticBackend, InMemoryBackend,
    IndexBackend, ItemFailure,
};
pub use writer::{BulkIndexWriter, SubmitOutcome, WriterReport, DEFAULT_CHUNK_SIZE};

pub const CRATE_NAME: &str = "odh-index";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("bulk request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bulk endpoint answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("serializing index document: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unexpected bulk response: {0}")]
    InvalidResponse(String),
    #[error("unknown index flavor {0:?} (expected elasticsearch6, elasticsearch7 or opensearch)")]
    UnknownFlavor(String),
}

/// Wire dialect of the target engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineFlavor {
    Elasticsearch6,
    #[default]
    Elasticsearch7,
    OpenSearch,
}

impl EngineFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Elasticsearch6 => "elasticsearch6",
            Self::Elasticsearch7 => "elasticsearch7",
            Self::OpenSearch => "opensearch",
        }
    }

    /// ES6 still requires a mapping type in every bulk action.
    pub fn requires_type(&self) -> bool {
        matches!(self, Self::Elasticsearch6)
    }
}

impl fmt::Display for EngineFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineFlavor {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "elasticsearch6" | "es6" => Ok(Self::Elasticsearch6),
            "elasticsearch7" | "elasticsearch" | "es7" => Ok(Self::Elasticsearch7),
            "opensearch" => Ok(Self::OpenSearch),
            other => Err(IndexError::UnknownFlavor(other.to_string())),
        }
    }
}
