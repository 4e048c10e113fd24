//! Error types for the crawl engine.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while crawling.
///
/// Provider errors (`Connection`, `Subscription`, `Receive`) are handled inside
/// the owning session and never reach the manager.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport dial or handshake failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Protocol negotiation failed after the transport was up.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// Mid-stream read failure; the session reconnects.
    #[error("receive error: {0}")]
    Receive(String),

    /// The provider factory does not know this platform type.
    #[error("unsupported platform type: {0}")]
    UnsupportedPlatform(String),

    /// Writing a record or file failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] fedarchive_core::Error),

    /// NodeInfo discovery failed.
    #[error("NodeInfo error: {0}")]
    NodeInfo(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An asset request answered with something other than 200.
    #[error("unexpected status {status} for {url}")]
    UnexpectedStatus { url: String, status: u16 },

    /// A remote-supplied name cannot be used as an archive path.
    #[error("unsafe archive path component: {0:?}")]
    UnsafePath(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A channel was closed while sending.
    #[error("channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::UnsupportedPlatform("pleroma".into()).to_string(),
            "unsupported platform type: pleroma"
        );
        assert_eq!(Error::ChannelClosed.to_string(), "channel closed");
        assert!(
            Error::Receive("reset by peer".into())
                .to_string()
                .contains("reset by peer")
        );
    }

    #[test]
    fn test_from_core_error() {
        let core = fedarchive_core::Error::InvalidServerLine {
            line: 1,
            reason: "bad".into(),
        };
        let err: Error = core.into();
        assert!(matches!(err, Error::Persistence(_)));
    }
}
