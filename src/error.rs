//! Error types for the rollup engine

use thiserror::Error;

/// Main error type for the rollup engine
#[derive(Error, Debug)]
pub enum Error {
    /// The project is unknown to the metastore or the rule registry
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    /// The rule is not registered for the project
    #[error("Rule not found: {rule} (project {project})")]
    RuleNotFound {
        /// Project the lookup was made against
        project: String,
        /// Rule identifier that was requested
        rule: String,
    },

    /// Request or definition failed validation
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Bucket store error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Metastore error
    #[error("Metastore error: {0}")]
    Metastore(#[from] MetastoreError),

    /// Two accumulator states could not be merged
    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Background service error
    #[error("Service error: {0}")]
    Service(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Validation errors
///
/// Raised before any state is read or written; terminal for the request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Query interval is not an integer multiple of the rule interval
    #[error("Interval {query} is not an integer multiple of the rule interval {native}")]
    IncompatibleInterval {
        /// Requested query interval
        query: String,
        /// Native interval of the rule
        native: String,
    },

    /// Interval could not be parsed or is degenerate
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// Frame count is zero or above the configured maximum
    #[error("Frame {frame} is out of range [1, {max}]")]
    InvalidFrame {
        /// Requested frame count
        frame: usize,
        /// Configured maximum
        max: usize,
    },

    /// The analysis cannot be rendered from the state the rule collects
    #[error("Analysis {analysis} is not supported by {aggregation} rules")]
    UnsupportedAnalysis {
        /// Rule aggregation type
        aggregation: String,
        /// Requested analysis type
        analysis: String,
    },

    /// The aggregation type reads a value but the rule has no value script
    #[error("Aggregation {0} requires a value script")]
    MissingValueScript(String),

    /// A value script references a field whose type cannot be aggregated
    #[error("Field '{field}' has type {actual}, expected {expected}")]
    FieldTypeMismatch {
        /// Field name
        field: String,
        /// What the aggregation needs
        expected: String,
        /// What the metastore reports
        actual: String,
    },

    /// A project, collection or rule name is not acceptable
    #[error("Invalid {kind} name '{name}': {reason}")]
    InvalidName {
        /// Kind of name (project, collection, rule)
        kind: &'static str,
        /// Offending name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// A rule with the same id already exists in the project
    #[error("Rule {0} is already registered")]
    DuplicateRule(String),

    /// Configuration value out of range
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Field name being validated
        field: String,
        /// The invalid value
        value: String,
        /// Minimum allowed value
        min: String,
        /// Maximum allowed value
        max: String,
    },
}

/// Bucket store errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bucket state could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stored bucket could not be interpreted
    #[error("Corrupted bucket: {0}")]
    CorruptedBucket(String),

    /// The store is temporarily unable to serve the request
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A key component cannot be used as a storage location
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Metastore errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetastoreError {
    /// Project already exists
    #[error("Project already exists: {0}")]
    ProjectAlreadyExists(String),

    /// Project does not exist
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    /// Name rejected by the metastore rules
    #[error("Invalid name '{name}': {reason}")]
    InvalidName {
        /// Offending name
        name: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Errors raised when combining two accumulator states
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// States belong to different aggregation types
    #[error("Cannot merge {left} state with {right} state")]
    StateMismatch {
        /// Kind of the receiving state
        left: &'static str,
        /// Kind of the merged-in state
        right: &'static str,
    },

    /// Estimators were built with different precisions
    #[error("Cannot merge estimators with precision {left} and {right}")]
    PrecisionMismatch {
        /// Precision of the receiving estimator
        left: u8,
        /// Precision of the merged-in estimator
        right: u8,
    },
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl Error {
    /// Short label used for the `error_type` metric dimension
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ProjectNotFound(_) => "project_not_found",
            Error::RuleNotFound { .. } => "rule_not_found",
            Error::Validation(_) => "validation",
            Error::Storage(_) => "storage",
            Error::Metastore(_) => "metastore",
            Error::Merge(_) => "merge",
            Error::Configuration(_) => "configuration",
            Error::Service(_) => "service",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
