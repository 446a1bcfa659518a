use std::sync::Arc;

/// Result alias used throughout the SDK, with the error variant fixed to the
/// Lodestar [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the Lodestar SDK.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Error produced while resolving a config value.
    #[error(transparent)]
    Evaluation(EvaluationError),

    /// No asynchronous source delivered data before the initialization
    /// timeout fired. Surfaced at most once per process; see
    /// `OnInitializationFailure`.
    #[error("initialization timeout")]
    InitializationTimeout,

    /// The SDK key was neither set in options nor found in the environment.
    #[error("SDK key is not set and not found in environment variables {preferred} or {legacy}")]
    MissingSdkKey {
        preferred: &'static str,
        legacy: &'static str,
    },

    /// The combination of configured options is not valid.
    #[error("{0}")]
    InvalidOptions(String),

    /// Invalid API URL configuration.
    #[error("invalid api_url configuration")]
    InvalidApiUrl(#[source] url::ParseError),

    /// Indicates that a background thread panicked. This should normally
    /// never happen.
    #[error("background thread panicked")]
    BackgroundThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<EvaluationError> for Error {
    fn from(value: EvaluationError) -> Self {
        Error::Evaluation(value)
    }
}

/// Enum representing possible errors that can occur during config resolution.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvaluationError {
    /// The requested key is absent in every sub-store.
    #[error("config \"{0}\" not found")]
    ConfigNotFound(String),

    /// A Provided reference named an environment variable that does not
    /// exist.
    #[error("environment variable \"{0}\" does not exist")]
    EnvVarNotExist(String),

    /// Decrypt-with indirection failed: the key config was missing, its
    /// value was not a string, or the decrypter itself errored.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Rule evaluation produced no match and the caller did not supply a
    /// default.
    #[error("config did not produce a result and no default is specified")]
    NoDefault,
}

impl EvaluationError {
    /// Return `true` if the error is a normal running condition where typed
    /// lookups should silently fall back to the caller's default.
    pub fn is_normal(&self) -> bool {
        match self {
            EvaluationError::ConfigNotFound(_) | EvaluationError::NoDefault => true,
            EvaluationError::EnvVarNotExist(_) | EvaluationError::DecryptionFailed(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EvaluationError;

    #[test]
    fn only_missing_data_conditions_are_normal() {
        assert!(EvaluationError::ConfigNotFound("k".to_owned()).is_normal());
        assert!(EvaluationError::NoDefault.is_normal());
        assert!(!EvaluationError::EnvVarNotExist("SOME_ENV".to_owned()).is_normal());
        assert!(!EvaluationError::DecryptionFailed("bad key".to_owned()).is_normal());
    }
}
