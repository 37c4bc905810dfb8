//! Error types for vlmrs.

use std::path::PathBuf;

use thiserror::Error;

/// Error type for the vlmrs core library.
///
/// Startup failures ([`UnresolvedModel`](Self::UnresolvedModel),
/// [`EngineLoad`](Self::EngineLoad), [`Registry`](Self::Registry),
/// [`Config`](Self::Config)) end the process. Everything raised while a turn
/// is running is recoverable, see [`Error::is_fatal`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The model reference is neither a hub key nor a valid local model/projector pair.
    #[error("could not resolve model `{reference}`: {reason}")]
    UnresolvedModel { reference: String, reason: String },

    /// A turn was submitted with neither text nor an image.
    #[error("please provide an image or text input")]
    EmptyInput,

    /// The inference engine failed to initialize.
    #[error("failed to load model: {0}")]
    EngineLoad(String),

    /// A failure while streaming a response.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Downloading an artifact from the model hub failed.
    #[error("failed to pull `{artifact}` from the hub: {source}")]
    Hub {
        artifact: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The built-in hub tables disagree with each other.
    #[error("model registry is inconsistent: {0}")]
    Registry(String),

    /// A configuration file could not be read or parsed.
    #[error("invalid configuration at {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn unresolved(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnresolvedModel {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error should terminate the process rather than just the current turn.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnresolvedModel { .. }
                | Self::EngineLoad(_)
                | Self::Registry(_)
                | Self::Config { .. }
                | Self::Hub { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_errors_are_fatal() {
        assert!(Error::unresolved("foo", "nope").is_fatal());
        assert!(Error::EngineLoad("boom".to_string()).is_fatal());
        assert!(!Error::EmptyInput.is_fatal());
        assert!(!Error::Generation("eof".to_string()).is_fatal());
    }

    #[test]
    fn unresolved_message_names_reference() {
        let msg = Error::unresolved("llava-foo", "no such file").to_string();
        assert!(msg.contains("llava-foo"));
        assert!(msg.contains("no such file"));
    }
}
