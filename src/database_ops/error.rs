use thiserror::Error;

/// Errors raised by the resolution and batch upsert core.
#[derive(Debug, Error)]
pub enum Error {
    /// The identifier has no backing row and could not be allocated.
    ///
    /// Expected and recoverable: the batch builder catches it per field and applies its
    /// drop/null policy.
    #[error("identifier not resolved: {key}")]
    IdentifierNotResolved { key: String },

    /// Anything the store reports. Never caught inside the core.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn not_resolved(key: impl Into<String>) -> Self {
        Error::IdentifierNotResolved { key: key.into() }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn is_not_resolved(&self) -> bool {
        matches!(self, Error::IdentifierNotResolved { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
