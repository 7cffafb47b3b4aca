//! MeshError: unified error type for the redistribution APIs.
//!
//! Every public entry point returns `Result<_, MeshError>`. Failures that
//! could leave workers waiting on each other are voted through
//! [`SubGroup::all_vote`](crate::algs::sub_group::SubGroup::all_vote) before
//! they surface, so a failed pass yields `Err` on every worker.

use thiserror::Error;

/// Unified error type for partitioning and redistribution.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeshError {
    /// Invalid or inconsistent configuration, detected before any collective call.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Fewer cells in total than there are workers.
    #[error("Insufficient data: {total} cells for {workers} workers")]
    InsufficientData { total: usize, workers: usize },
    /// A worker could not allocate a buffer it needed.
    #[error("Allocation failure: {0}")]
    AllocationFailure(String),
    /// A global id field cannot travel on the wire without truncation.
    #[error("Schema mismatch on field `{field}`: {reason}")]
    SchemaMismatch { field: String, reason: String },
    /// All data collapses onto a point or a plane the tree cannot split.
    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),
    /// Clipping requested on a worker whose regions are not one convex box.
    #[error("Unsupported topology: {0}")]
    UnsupportedTopology(String),
    /// Point-to-point communication with `neighbor` failed.
    #[error("Communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: CommFailure,
    },
    /// A received buffer did not have the expected length.
    #[error("Buffer size mismatch from rank {neighbor}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },
    /// Encoding or decoding a mesh or tree failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// A worker holds a point the owner of its region does not know.
    #[error("Point {point:?} is not held by its owner, rank {owner}")]
    MissingPoint { point: [f64; 3], owner: usize },
    /// Some other worker failed during `stage`; this worker aborts with it.
    #[error("Remote failure during {stage}")]
    RemoteFailure { stage: &'static str },
    /// A named attribute array is absent or has the wrong shape.
    #[error("Attribute `{0}` is missing or malformed")]
    MissingAttribute(String),
}

/// Free-form transport failure carried inside [`MeshError::CommError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CommFailure(pub String);

impl From<String> for CommFailure {
    fn from(s: String) -> Self {
        CommFailure(s)
    }
}

impl From<&str> for CommFailure {
    fn from(s: &str) -> Self {
        CommFailure(s.to_owned())
    }
}

impl From<bincode::Error> for MeshError {
    fn from(e: bincode::Error) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

impl MeshError {
    /// Whether a redistribution pass reports this and carries on.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            MeshError::DegenerateGeometry(_) | MeshError::UnsupportedTopology(_)
        )
    }
}
