//! `machined::error` is a module containing error utilities for the machined project.

use std::{
    error::Error,
    fmt::{self, Display},
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a machined-related operation.
pub type MachinedResult<T> = Result<T, MachinedError>;

/// An error that occurred during a machine lifecycle operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum MachinedError {
    /// No machine with the given name is defined.
    #[error("machine not found: {0}")]
    NotFound(String),

    /// A machine with the given name is already defined.
    #[error("machine already exists: {0}")]
    AlreadyExists(String),

    /// The operation is not permitted in the machine's current state.
    #[error("{0}")]
    Busy(String),

    /// The machine definition failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// A constructed socket path would exceed the UNIX socket path limit.
    #[error("socket path too long ({len} bytes incl. NUL): {path}")]
    PathTooLong {
        /// The offending path.
        path: String,
        /// The byte length of the path including the trailing NUL.
        len: usize,
    },

    /// A required binary, firmware blob, or referenced file was not found.
    #[error("asset missing: {0}")]
    AssetMissing(String),

    /// A child process failed to start or exited before becoming ready.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// A QMP protocol failure.
    #[error("qmp error: {0}")]
    Qmp(String),

    /// The QMP connection closed before or during a request.
    #[error("qmp connection closed")]
    QmpClosed,

    /// A readiness or shutdown deadline was exceeded.
    #[error("timed out: {0}")]
    Timeout(String),

    /// An error that occurred when performing an IO operation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that occurred when reading or writing a machine definition.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An error that occurred when encoding or decoding JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Custom error.
    #[error("custom error: {0}")]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MachinedError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> MachinedError {
        MachinedError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Returns true if the error marks a missing machine.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MachinedError::NotFound(_))
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `MachinedResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> MachinedResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
