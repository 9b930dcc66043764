//! Error taxonomy for the crossmatch service.
//!
//! Every component surfaces its errors to the correlation loop, which is the
//! single recovery boundary. The variant tells the loop how to react: `Auth`
//! stops the process during startup validation, everything else is survivable.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrossmatchError {
    /// The backend rejected our credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The backend is unreachable or timed out. The current cycle is skipped
    /// and retried on the next tick.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A response arrived but did not match the expected shape. The offending
    /// item is skipped and the batch continues.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A notification sink failed to deliver. Logged, never blocks progress.
    #[error("notification delivery failed: {0}")]
    NotificationDelivery(String),
}

impl CrossmatchError {
    /// Errors the polling loop cannot recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CrossmatchError::Auth(_))
    }
}

impl From<reqwest::Error> for CrossmatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CrossmatchError::MalformedResponse(err.to_string())
        } else {
            // Timeouts, connection refusals and TLS failures all mean the
            // backend cannot be talked to right now.
            CrossmatchError::Unavailable(err.to_string())
        }
    }
}
