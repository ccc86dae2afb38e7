use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

/// Result type for kmsenvelope operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the envelope transformer and its collaborators
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Stored bytes could not be parsed as an encrypted object
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Authentication tag or authenticated-data mismatch
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// The cached DEK is past its validity window and could not be refreshed
    #[error(
        "EDEK with keyID \"{key_id}\" expired at {}: {source}",
        .expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )]
    DekExpired {
        key_id: String,
        expires_at: DateTime<Utc>,
        #[source]
        source: Box<Error>,
    },

    /// Transient backend failure or timeout
    #[error("kms unavailable: {0}")]
    Unavailable(String),

    /// The backend reports the key itself is unusable
    #[error("failed precondition: {0}")]
    Precondition(String),

    /// Unknown key or ciphertext reference
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid configuration or argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),

    /// Annotates an error with the provider it came from
    #[error("kms provider \"{provider}\": {source}")]
    Provider {
        provider: String,
        #[source]
        source: Box<Error>,
    },
}

/// The kind of an [`Error`], independent of provider annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedEnvelope,
    DecryptionFailed,
    DekExpired,
    Unavailable,
    Precondition,
    NotFound,
    InvalidArgument,
    Internal,
}

impl Error {
    /// Returns the kind of this error, looking through provider annotations
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedEnvelope(_) => ErrorKind::MalformedEnvelope,
            Error::DecryptionFailed(_) => ErrorKind::DecryptionFailed,
            Error::DekExpired { .. } => ErrorKind::DekExpired,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::Precondition(_) => ErrorKind::Precondition,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Provider { source, .. } => source.kind(),
        }
    }

    /// Wraps this error with the name of the provider that produced it.
    ///
    /// Errors already annotated are returned as is.
    pub fn for_provider(self, provider: &str) -> Self {
        match self {
            Error::Provider { .. } => self,
            other => Error::Provider {
                provider: provider.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Returns true for errors the caller may retry
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }
}
