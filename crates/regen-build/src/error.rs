/// Build engine error types
use std::path::PathBuf;
use thiserror::Error;

pub type BuildResult<T> = Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Could not find '{name}' in sources or intermediates (needed by '{target}')")]
    MissingSource { target: String, name: String },

    #[error("Unknown command for target '{target}': {command}")]
    UnrecognizedCommand { target: String, command: String },

    #[error("Malformed rule for target '{target}': {reason}")]
    MalformedRule { target: String, reason: String },

    #[error("Error running command {tool} (exit code {exit_code:?}):\n\n{stderr}")]
    CommandExecution {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Cyclic source materialization: {0}")]
    CyclicDependency(String),

    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),

    #[error("Target '{target}' depends on '{dependency}', which is not in the graph")]
    UnknownTarget { target: String, dependency: String },

    #[error("Failed to start {tool}: {error}")]
    ToolSpawn {
        tool: String,
        error: std::io::Error,
    },

    #[error("Invalid build description {path}:{line}: {reason}")]
    DescriptionError {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error at {path}: {error}")]
    IoError {
        path: PathBuf,
        error: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            error,
        }
    }

    /// Create a missing source error
    pub fn missing_source(target: impl Into<String>, name: impl Into<String>) -> Self {
        Self::MissingSource {
            target: target.into(),
            name: name.into(),
        }
    }

    /// Create a malformed rule error
    pub fn malformed(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedRule {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a description parse error
    pub fn description(path: impl Into<PathBuf>, line: usize, reason: impl ToString) -> Self {
        Self::DescriptionError {
            path: path.into(),
            line,
            reason: reason.to_string(),
        }
    }
}
