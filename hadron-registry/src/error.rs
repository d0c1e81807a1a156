//! Hadron registry error abstractions.

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";
pub const ERR_DECODE_MEMBER: &str = "error decoding member record from storage";

/// Registry error variants.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Any failure communicating with or decoding from the backing store.
    #[error("storage fault: {0}")]
    StorageFault(#[from] anyhow::Error),
    /// The service account's credential pair is not yet active.
    ///
    /// This is an expected transient state. Callers own any retry policy.
    #[error("waiting for API keys for service account")]
    NotReady,
}

impl From<sled::Error> for RegistryError {
    fn from(err: sled::Error) -> Self {
        Self::StorageFault(anyhow::Error::from(err))
    }
}

/// A result type where the error is a `RegistryError`.
pub type RegistryResult<T> = ::std::result::Result<T, RegistryError>;

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
