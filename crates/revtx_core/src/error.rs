//! Error types for RevTx core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type TxResult<T> = Result<T, TxError>;

/// Errors that can occur in RevTx core operations.
///
/// Public facade methods never surface these directly - they are converted
/// into response envelopes (see [`crate::response::Response`]). `TxError` is
/// the internal propagation currency plus the constructor's fatal path.
#[derive(Debug, Error)]
pub enum TxError {
    /// Database error from the underlying store.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The on-disk schema predates the supported version.
    ///
    /// This is the one non-recoverable constructor failure: silently
    /// upgrading would destroy user data. The operator must migrate the
    /// data directory or downgrade.
    #[error(
        "schema version {found} is too old (supported: {supported}); \
         migrate the data directory or downgrade"
    )]
    SchemaTooOld {
        /// Version found in the `_meta` table.
        found: i64,
        /// Version this build supports.
        supported: i64,
    },

    /// The on-disk schema postdates the supported version.
    #[error("schema version {found} is newer than supported ({supported})")]
    SchemaTooNew {
        /// Version found in the `_meta` table.
        found: i64,
        /// Version this build supports.
        supported: i64,
    },

    /// Lock acquisition exhausted its retry schedule.
    #[error("could not acquire lock on {path}: {message}")]
    LockTimeout {
        /// The lock sidecar path.
        path: String,
        /// Description of the failure.
        message: String,
    },

    /// A persisted status character is not one of the ten known codes.
    #[error("unknown transaction status code {code:?}")]
    UnknownStatus {
        /// The offending character.
        code: char,
    },

    /// A failure inside the call loop, carrying the envelope code it
    /// should surface with.
    #[error("{message}")]
    Call {
        /// Envelope status code for this failure.
        code: u16,
        /// Human-readable description.
        message: String,
    },

    /// Invalid argument provided to an API.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the argument issue.
        message: String,
    },
}

impl TxError {
    /// Creates a call-loop error with an explicit envelope code.
    pub fn call(code: u16, message: impl Into<String>) -> Self {
        Self::Call {
            code,
            message: message.into(),
        }
    }

    /// Creates a lock timeout error.
    pub fn lock_timeout(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LockTimeout {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// The envelope status code this error surfaces with.
    ///
    /// Environmental failures (database, I/O, locks) map to `532`; bad
    /// arguments map to `400`; call-loop errors carry their own code.
    #[must_use]
    pub fn envelope_code(&self) -> u16 {
        match self {
            Self::Call { code, .. } => *code,
            Self::InvalidArgument { .. } => 400,
            _ => 532,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_error_keeps_code() {
        let err = TxError::call(412, "no capability");
        assert_eq!(err.envelope_code(), 412);
        assert_eq!(err.to_string(), "no capability");
    }

    #[test]
    fn environmental_errors_map_to_532() {
        let err = TxError::lock_timeout("/tmp/x.lck", "busy");
        assert_eq!(err.envelope_code(), 532);
    }

    #[test]
    fn invalid_argument_maps_to_400() {
        let err = TxError::invalid_argument("tx_id too long");
        assert_eq!(err.envelope_code(), 400);
    }
}
