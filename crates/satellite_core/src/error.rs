//! Error types shared across the Satellite client.

use thiserror::Error;

/// Result type for Satellite operations.
pub type SatelliteResult<T> = Result<T, SatelliteError>;

/// Classification of a [`SatelliteError`].
///
/// The connection controller routes errors by kind: transient kinds are
/// retried with backoff, auth kinds wait for a new token, and
/// `BehindWindow` forces a local reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Programmer error or broken invariant.
    Internal,
    /// No authentication token was supplied.
    AuthRequired,
    /// The authentication token has expired.
    AuthExpired,
    /// The client's LSN is older than the server's retained window.
    BehindWindow,
    /// A pending connect was cancelled by `disconnect()`.
    ConnectionCancelledByDisconnect,
    /// A referenced table does not exist.
    TableNotFound,
    /// A subscription with this key is already being established.
    SubscriptionAlreadyExists,
    /// A foreign-key constraint was violated.
    FkViolation,
    /// Initial shape data could not be delivered or applied.
    ShapeDeliveryError,
}

/// Errors that can occur in the Satellite client.
#[derive(Debug, Clone, Error)]
pub enum SatelliteError {
    /// Programmer error or broken invariant.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the broken invariant.
        message: String,
    },

    /// No authentication token was supplied.
    #[error("authentication required: {message}")]
    AuthRequired {
        /// What was missing.
        message: String,
    },

    /// The authentication token has expired.
    #[error("authentication expired: {message}")]
    AuthExpired {
        /// Server-provided detail.
        message: String,
    },

    /// The client's LSN is older than the server's retained window.
    #[error("client is behind the server's replication window")]
    BehindWindow,

    /// A pending connect was cancelled by `disconnect()`.
    #[error("connection cancelled by disconnect")]
    ConnectionCancelledByDisconnect,

    /// A referenced table does not exist.
    #[error("table not found: {table}")]
    TableNotFound {
        /// The missing table name.
        table: String,
    },

    /// A subscription with this key already exists with different shapes.
    #[error("subscription already exists for key {key}")]
    SubscriptionAlreadyExists {
        /// The duplicated subscription key.
        key: String,
    },

    /// A foreign-key constraint was violated.
    #[error("foreign key violation: {message}")]
    FkViolation {
        /// Which constraint failed.
        message: String,
    },

    /// Initial shape data could not be delivered or applied.
    #[error("shape delivery failed: {message}")]
    ShapeDeliveryError {
        /// What went wrong during delivery.
        message: String,
    },
}

impl SatelliteError {
    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an auth-required error.
    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::AuthRequired {
            message: message.into(),
        }
    }

    /// Creates an auth-expired error.
    pub fn auth_expired(message: impl Into<String>) -> Self {
        Self::AuthExpired {
            message: message.into(),
        }
    }

    /// Creates a table-not-found error.
    pub fn table_not_found(table: impl Into<String>) -> Self {
        Self::TableNotFound {
            table: table.into(),
        }
    }

    /// Creates a subscription-already-exists error.
    pub fn subscription_already_exists(key: impl Into<String>) -> Self {
        Self::SubscriptionAlreadyExists { key: key.into() }
    }

    /// Creates a foreign-key violation error.
    pub fn fk_violation(message: impl Into<String>) -> Self {
        Self::FkViolation {
            message: message.into(),
        }
    }

    /// Creates a shape delivery error.
    pub fn shape_delivery(message: impl Into<String>) -> Self {
        Self::ShapeDeliveryError {
            message: message.into(),
        }
    }

    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SatelliteError::Internal { .. } => ErrorKind::Internal,
            SatelliteError::AuthRequired { .. } => ErrorKind::AuthRequired,
            SatelliteError::AuthExpired { .. } => ErrorKind::AuthExpired,
            SatelliteError::BehindWindow => ErrorKind::BehindWindow,
            SatelliteError::ConnectionCancelledByDisconnect => {
                ErrorKind::ConnectionCancelledByDisconnect
            }
            SatelliteError::TableNotFound { .. } => ErrorKind::TableNotFound,
            SatelliteError::SubscriptionAlreadyExists { .. } => {
                ErrorKind::SubscriptionAlreadyExists
            }
            SatelliteError::FkViolation { .. } => ErrorKind::FkViolation,
            SatelliteError::ShapeDeliveryError { .. } => ErrorKind::ShapeDeliveryError,
        }
    }

    /// Returns true if this error is worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::AuthRequired
                | ErrorKind::AuthExpired
                | ErrorKind::ConnectionCancelledByDisconnect
        )
    }
}
