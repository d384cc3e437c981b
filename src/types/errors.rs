use thiserror::Error;
use uuid::Uuid;

// === StoreError ===

/// Errors reported by the row store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The table is not served by this store.
    #[error("Unknown table: {0}")]
    UnknownTable(String),
    /// The store refused the operation.
    #[error("Store rejected operation: {0}")]
    Rejected(String),
    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// No open subscription carries the given id.
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(Uuid),
    /// Database operation failed.
    #[error("Store database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

// === AuthError ===

/// Errors related to the identity provider.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The identity provider could not be reached.
    #[error("Identity provider unreachable: {0}")]
    Unreachable(String),
    /// A sign-in completion arrived without a matching request.
    #[error("No sign-in in progress")]
    NoPendingSignIn,
    /// The provider refused the request.
    #[error("Identity provider error: {0}")]
    Provider(String),
}

// === GateError ===

/// Raised when protected functionality is requested without a live session.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Sign-in required, redirecting to {0}")]
    SignInRequired(String),
}

// === SyncError ===

/// Errors from bookmark synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A required bookmark field was empty. No remote call was made.
    #[error("Bookmark {0} must not be empty")]
    EmptyField(&'static str),
    /// The row store failed or rejected the operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// === SettingsError ===

/// Errors related to client settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// An I/O error occurred while reading or writing settings.
    #[error("Settings I/O error: {0}")]
    Io(String),
    /// Failed to serialize or deserialize settings.
    #[error("Settings serialization error: {0}")]
    Serialization(String),
    /// The provided settings key is invalid.
    #[error("Invalid settings key: {0}")]
    InvalidKey(String),
    /// The provided settings value is invalid.
    #[error("Invalid settings value: {0}")]
    InvalidValue(String),
}
