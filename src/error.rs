// ── OMChat Client: Error Types ─────────────────────────────────────────────
// Single canonical error enum for the client, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, storage, network, auth…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • No variant carries secret material (tokens, passwords) in its message.
//   • Terminal stream failures reach the UI through the event callback; the
//     same error is also returned so programmatic callers can branch on it.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ClientError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite persistence failure.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// No usable session at send time (never logged in, or restore failed).
    #[error("Not authenticated")]
    Unauthenticated,

    /// The server rejected our credentials mid-request (401/403).
    /// Recoverable: the stream client refreshes and retries.
    #[error("Authentication rejected with status {status}")]
    AuthExpired { status: u16 },

    /// Refresh-and-retry budget exhausted against a persistently
    /// rejecting server.
    #[error("Authentication failed after {attempts} retries")]
    AuthExhausted { attempts: u32 },

    /// The token refresh exchange itself failed; tokens have been cleared.
    #[error("Token refresh failed: {0}")]
    RefreshFailure(String),

    /// Non-2xx API response other than 401/403.
    #[error("Server error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure while reading a stream body.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Client configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All client operations return this type.
pub type ClientResult<T> = Result<T, ClientError>;

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_formats_like_the_wire_message() {
        let e = ClientError::Api { status: 502, message: "bad gateway".into() };
        assert_eq!(e.to_string(), "Server error: 502 - bad gateway");
    }
}
