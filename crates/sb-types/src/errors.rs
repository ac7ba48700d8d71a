use std::path::PathBuf;
use thiserror::Error;

/// Main error type for StepBBO
#[derive(Error, Debug)]
pub enum SbError {
    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Resumption error: {0}")]
    Resumption(#[from] ResumptionError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Updater error: {0}")]
    Updater(#[from] UpdaterError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The on-disk run state does not allow the requested step to be closed.
#[derive(Error, Debug)]
pub enum ResumptionError {
    #[error("Missing file for step {step}: {}", path.display())]
    MissingFile { step: usize, path: PathBuf },

    #[error("Rollout {rollout} of step {step} has no cost_vars yet")]
    MissingCostVars { step: usize, rollout: String },

    #[error("Step {step} is inconsistent: {message}")]
    Inconsistent { step: usize, message: String },

    #[error("Step {requested} cannot be resumed; the highest open step is {highest_open:?}")]
    StepOutOfRange {
        requested: usize,
        highest_open: Option<usize>,
    },

    #[error("Run at {} is not initialized", root.display())]
    NotInitialized { root: PathBuf },

    #[error("Manifest is corrupt: {message}")]
    CorruptManifest { message: String },
}

/// Errors raised while reading or writing state store files
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {} at line {line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Shape mismatch in {}: expected {expected}, found {found}", path.display())]
    ShapeMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("Unsupported schema version {found} in {} (supported: {supported})", path.display())]
    UnsupportedSchema {
        path: PathBuf,
        found: u32,
        supported: u32,
    },
}

/// Errors raised by a task's cost function
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Malformed cost_vars: {message}")]
    MalformedCostVars { message: String },

    #[error("Invalid task configuration: {message}")]
    InvalidConfig { message: String },
}

/// Errors raised by a distribution updater
#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error("Shape mismatch: {message}")]
    ShapeMismatch { message: String },

    #[error("Invalid updater configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Update produced an invalid distribution: {message}")]
    InvalidDistribution { message: String },
}

/// Result type alias for StepBBO operations
pub type SbResult<T> = Result<T, SbError>;

/// Macro for creating setup errors
#[macro_export]
macro_rules! setup_error {
    ($($arg:tt)*) => {
        $crate::SbError::Setup(format!($($arg)*))
    };
}

/// Macro for creating step inconsistency errors
#[macro_export]
macro_rules! resumption_error {
    ($step:expr, $($arg:tt)*) => {
        $crate::SbError::Resumption($crate::ResumptionError::Inconsistent {
            step: $step,
            message: format!($($arg)*),
        })
    };
}
