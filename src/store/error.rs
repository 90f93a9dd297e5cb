//! Error taxonomy for the session store client.

use std::time::Duration;
use thiserror::Error;

/// Failure talking to the session store.
///
/// None of these ever reach the accounting path: the tracker collapses every
/// variant into "tracking not updated".
#[derive(Debug, Error)]
pub enum StoreError {
    /// Dialing or namespace selection failed; no connection is held.
    #[error("session store at {addr} unavailable: {reason}")]
    Unavailable { addr: String, reason: String },

    /// A write or read on an established connection failed.
    #[error("session store i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The store did not answer within the configured I/O timeout.
    #[error("session store did not respond within {0:?}")]
    Timeout(Duration),

    /// The store sent bytes that do not form a valid reply.
    #[error("session store protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        StoreError::Protocol(msg.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
