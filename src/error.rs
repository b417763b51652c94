use std::sync::Arc;

use thiserror::Error;

use crate::flag_types::FlagType;

/// Represents a result type for operations in the provider.
///
/// The error variant is the crate-wide [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the provider.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The flag is not part of the local configuration, or the evaluation module could not find
    /// it.
    #[error("flag {flag_key:?} not found")]
    FlagNotFound {
        /// Key of the requested flag.
        flag_key: String,
        /// Extra details reported by the evaluation module, if any.
        details: Option<String>,
    },

    /// The flag resolved to a value whose type does not match the requested accessor.
    #[error("type mismatch for flag {flag_key:?} (expected: {expected}, found: {found})")]
    TypeMismatch {
        /// Key of the requested flag.
        flag_key: String,
        /// Type requested by the caller.
        expected: FlagType,
        /// Runtime type of the resolved value, as reported by JSON.
        found: String,
    },

    /// The evaluation module reported an error code that has no dedicated variant.
    #[error("error evaluating flag {flag_key:?}: {code}: {message}")]
    General {
        /// Key of the requested flag.
        flag_key: String,
        /// Error code returned by the evaluation module.
        code: String,
        /// Human readable error details.
        message: String,
    },

    /// A resolution call was made while the evaluator was not ready.
    #[error("evaluator is not ready (state: {state})")]
    NotReady {
        /// Name of the state the evaluator was in.
        state: &'static str,
    },

    /// The evaluation module could not be loaded or instantiated.
    #[error("failed to load evaluation module: {0}")]
    BridgeLoad(String),

    /// `evaluate` was called before `initialize` or after `dispose`.
    #[error("evaluation module is not loaded, call initialize() first")]
    BridgeNotLoaded,

    /// A required export is missing from the evaluation module.
    #[error("evaluation module export {0:?} not found")]
    BridgeExportMissing(&'static str),

    /// The module startup routine exited with a non-zero code.
    #[error("evaluation module startup exited with code {0}")]
    BridgeStartup(i32),

    /// The module returned a null pointer or an empty output.
    #[error("evaluation module returned an invalid result: {0}")]
    BridgeInvalidResult(String),

    /// A call into the module trapped or memory access failed.
    #[error("evaluation module call failed: {0}")]
    BridgeCall(String),

    /// Flag configuration could not be retrieved (network, 4xx or 5xx).
    #[error("flag configuration unavailable: {0}")]
    ConfigUnavailable(String),

    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// Events could not be delivered to the data collector.
    #[error("data collector error: {0}")]
    DataCollector(String),

    /// Invalid endpoint configuration.
    #[error("invalid endpoint configuration")]
    InvalidEndpoint(#[source] url::ParseError),

    /// Options failed validation.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Indicates that a background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    PollerThreadPanicked,

    /// JSON encoding or decoding failed.
    #[error(transparent)]
    // serde_json::Error is not clonable, so we're wrapping it in an Arc.
    Serialization(Arc<serde_json::Error>),

    /// An I/O error.
    #[error(transparent)]
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl Error {
    /// Error code understood by OpenFeature-style clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::FlagNotFound { .. } => "FLAG_NOT_FOUND",
            Error::TypeMismatch { .. } => "TYPE_MISMATCH",
            Error::NotReady { .. } | Error::BridgeNotLoaded => "PROVIDER_NOT_READY",
            Error::Serialization(_) => "PARSE_ERROR",
            _ => "GENERAL",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}
