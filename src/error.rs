//src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the profiler.
///
/// `Format` and `Lookup` are recoverable at record/group granularity; callers
/// decide whether to skip or abort. `Configuration` is always fatal.
#[derive(Debug, Error)]
pub enum ShogunError {
    #[error("format error in {source_name} line {line}: {message}")]
    Format {
        source_name: String,
        line: usize,
        message: String,
    },

    #[error("lookup failed for {what} `{name}`")]
    Lookup { what: &'static str, name: String },

    #[error("{program} failed ({status}): {stderr}")]
    ExternalTool {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("I/O error on {path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ShogunError {
    pub fn format(source_name: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        ShogunError::Format {
            source_name: source_name.into(),
            line,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        ShogunError::Configuration(message.into())
    }

    /// Attach a path to an I/O error.
    pub fn at_path(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ShogunError::Path { path, source }
    }
}

pub type Result<T> = std::result::Result<T, ShogunError>;
