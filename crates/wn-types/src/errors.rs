use thiserror::Error;

/// Main error type for the Winnow system
#[derive(Error, Debug)]
pub enum WnError {
    #[error("Search space error: {0}")]
    Space(#[from] SpaceError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Search-space construction and narrowing errors
#[derive(Error, Debug)]
pub enum SpaceError {
    #[error("Invalid removal of {value} from {path}: {reason}")]
    InvalidRemoval {
        path: String,
        value: String,
        reason: String,
    },

    #[error("Unknown dimension path: {path}")]
    UnknownDimension { path: String },

    #[error("Unknown stage type: {name}")]
    UnknownStage { name: String },

    #[error("Unknown slot: {name}")]
    UnknownSlot { name: String },

    #[error("Stage {stage} has no hyperparameter named {name}")]
    UnknownHyperparameter { stage: String, name: String },

    #[error("Stage {stage} is missing hyperparameter {name}")]
    MissingHyperparameter { stage: String, name: String },

    #[error("Empty domain at {path}")]
    EmptyDomain { path: String },

    #[error("Invalid value {value} at {path}")]
    InvalidValue { path: String, value: String },

    #[error("Stage {stage} cannot occupy slot {slot}")]
    FamilyMismatch { slot: String, stage: String },
}

/// Sampling, scoring and training errors
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Sampler exhausted: no valid configuration after {attempts} attempts")]
    SamplerExhausted { attempts: usize },

    #[error("Metric not reported by trainer: {metric}")]
    MissingMetric { metric: String },

    #[error("Trainer failed fatally: {message}")]
    TrainerFatal { message: String },
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Corrupt document {path} after {attempts} read attempts: {message}")]
    Corruption {
        path: String,
        attempts: usize,
        message: String,
    },

    #[error("Run configuration at {path} does not match the requested one (differs in: {})", .differing.join(", "))]
    ConfigMismatch { path: String, differing: Vec<String> },

    #[error("Inconsistent run directory {path}: {message}")]
    Layout { path: String, message: String },
}

impl WnError {
    /// Whether the error leaves the run resumable but must stop the process.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WnError::Search(SearchError::SamplerExhausted { .. }))
    }
}

/// Result type alias for Winnow operations
pub type WnResult<T> = Result<T, WnError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::WnError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::WnError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::WnError::Config(format!($($arg)*))
    };
}
