//! Error types for vidreason.
//!
//! All errors are strongly typed using thiserror. Per-sample failures
//! (compile, runtime, parse) are turned into data by the executor and the
//! answer selector; the types here describe them before that conversion.

use thiserror::Error;

use crate::dispatch::ModelId;

/// Errors raised while compiling or running a reasoning program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    #[error("line {line}, column {column}: {message}")]
    Compile {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("line {line}: {message}")]
    Runtime {
        line: usize,
        message: String,
    },

    #[error("program exceeded the step limit of {limit}")]
    StepLimit {
        limit: u64,
    },
}

impl ProgramError {
    /// Creates a compile error at the given position.
    #[must_use]
    pub fn compile(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self::Compile {
            line,
            column,
            message: message.into(),
        }
    }

    /// Creates a runtime error at the given line.
    #[must_use]
    pub fn runtime(line: usize, message: impl Into<String>) -> Self {
        Self::Runtime {
            line,
            message: message.into(),
        }
    }

    /// Returns true if this is a compile-time error.
    #[must_use]
    pub const fn is_compile(&self) -> bool {
        matches!(self, Self::Compile { .. })
    }
}

/// Errors produced by the model dispatch layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Model '{model}' did not reply within {duration_ms}ms")]
    Timeout {
        model: ModelId,
        duration_ms: u64,
    },

    #[error("Dispatch channel disconnected: {channel}")]
    Disconnected {
        channel: String,
    },

    #[error("Circuit open for model '{model}'")]
    CircuitOpen {
        model: ModelId,
    },

    #[error("No backend registered for model '{model}'")]
    UnknownModel {
        model: ModelId,
    },

    #[error("Model '{model}' failed: {message}")]
    ModelFailed {
        model: ModelId,
        message: String,
    },

    #[error("Model '{model}' returned {actual}, expected {expected}")]
    UnexpectedOutput {
        model: ModelId,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Request queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },
}

impl DispatchError {
    /// Returns true if issuing the same request again may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::QueueFull { .. })
    }

    /// Returns true if the failure says the model servers are unreachable
    /// or overloaded, rather than that one request was bad.
    #[must_use]
    pub const fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Disconnected { .. } | Self::QueueFull { .. }
        )
    }
}

/// Misuse of the frame/segment API from inside a program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Segment [{start}, {end}) has no frames")]
    EmptySegment {
        start: usize,
        end: usize,
    },

    #[error("Video has {frames} frames but {annotations} annotations")]
    AnnotationMismatch {
        frames: usize,
        annotations: usize,
    },

    #[error("Invalid crop ({left}, {lower}, {right}, {upper})")]
    InvalidCrop {
        left: i64,
        lower: i64,
        right: i64,
        upper: i64,
    },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Failure while computing an accuracy report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccuracyError {
    #[error("No samples to score")]
    Empty,

    #[error("{predictions} predictions for {groundtruths} ground-truth labels")]
    LengthMismatch {
        predictions: usize,
        groundtruths: usize,
    },
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration field '{field}': {reason}")]
    Invalid {
        field: String,
        reason: String,
    },

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// Creates an invalid-field error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Failure while writing or reading a result table.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Top-level error type for vidreason.
#[derive(Debug, Error)]
pub enum VidError {
    #[error("Program error: {0}")]
    Program(#[from] ProgramError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Accuracy error: {0}")]
    Accuracy(#[from] AccuracyError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("Dataset error: {message}")]
    Dataset {
        message: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl VidError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a dataset error.
    #[must_use]
    pub fn dataset(message: impl Into<String>) -> Self {
        Self::Dataset {
            message: message.into(),
        }
    }

    /// Returns true if this is a dispatch error.
    #[must_use]
    pub const fn is_dispatch(&self) -> bool {
        matches!(self, Self::Dispatch(_) | Self::Api(ApiError::Dispatch(_)))
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Dispatch(e) | Self::Api(ApiError::Dispatch(e)) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias for vidreason operations.
pub type VidResult<T> = Result<T, VidError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display() {
        let err = ProgramError::compile(3, 7, "unexpected token ')'");
        let msg = format!("{err}");
        assert!(msg.contains("line 3"));
        assert!(msg.contains("column 7"));
        assert!(err.is_compile());
    }

    #[test]
    fn test_runtime_error_display() {
        let err = ProgramError::runtime(12, "name 'foo' is not defined");
        assert!(!err.is_compile());
        assert_eq!(format!("{err}"), "line 12: name 'foo' is not defined");
    }

    #[test]
    fn test_dispatch_timeout() {
        let err = DispatchError::Timeout {
            model: ModelId::Vqa,
            duration_ms: 250,
        };
        let msg = format!("{err}");
        assert!(msg.contains("250ms"));
        assert!(msg.contains("vqa"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_dispatch_circuit_not_retryable() {
        let err = DispatchError::CircuitOpen {
            model: ModelId::ObjectDetector,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_vid_error_from_api_dispatch() {
        let err: VidError = ApiError::Dispatch(DispatchError::Timeout {
            model: ModelId::Summarizer,
            duration_ms: 1,
        })
        .into();
        assert!(err.is_dispatch());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_vid_error_internal() {
        let err = VidError::internal("unexpected state");
        assert!(err.is_internal());
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("unexpected state"));
    }

    #[test]
    fn test_config_error_invalid() {
        let err: VidError = ConfigError::invalid("chunk_limit", "must be below prompt_budget").into();
        assert!(err.is_config());
        assert!(format!("{err}").contains("chunk_limit"));
    }

    #[test]
    fn test_accuracy_length_mismatch() {
        let err = AccuracyError::LengthMismatch {
            predictions: 2,
            groundtruths: 3,
        };
        assert_eq!(format!("{err}"), "2 predictions for 3 ground-truth labels");
    }
}
