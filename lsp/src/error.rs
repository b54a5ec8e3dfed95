//! Error type surfaced by the language server layer.
//!
//! Every variant is recoverable from the caller's point of view: a missing
//! client means "fall back to text search", a timeout fails one call, and a
//! crashed server is replaced on the next [`ServerCache::get_client`].
//!
//! [`ServerCache::get_client`]: crate::ServerCache::get_client

use std::path::PathBuf;
use std::time::Duration;

use crate::types::TransportState;

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    /// The configured server binary is not on `PATH`.
    #[error("language server command '{command}' not found in PATH")]
    CommandNotFound { command: String },

    /// The OS refused to start the server process.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process started but the `initialize` exchange failed.
    #[error("handshake with '{server}' failed: {reason}")]
    Handshake { server: String, reason: String },

    /// No registry entry exists for the project's language.
    #[error("no language server registered for '{0}'")]
    UnsupportedLanguage(String),

    /// The transport is not in the `Initialized` state.
    #[error("language server not initialized (state: {state})")]
    NotInitialized { state: TransportState },

    /// A request exceeded its deadline. The transport stays usable.
    #[error("'{method}' timed out after {}ms", elapsed.as_millis())]
    Timeout { method: String, elapsed: Duration },

    /// The connection closed while a request was outstanding.
    #[error("language server connection closed")]
    ConnectionClosed,

    /// The server answered with a JSON-RPC error object.
    #[error("'{method}' failed with code {code}: {message}")]
    Server {
        method: String,
        code: i64,
        message: String,
    },

    /// The server answered with a result we could not interpret.
    #[error("invalid '{method}' response: {reason}")]
    InvalidResponse { method: String, reason: String },

    #[error("cannot convert path to file URI: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("failed to encode '{method}': {source}")]
    Encode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

impl LspError {
    /// Whether this error means no server could be brought up at all.
    ///
    /// Callers use this to pick the non-LSP fallback route.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::CommandNotFound { .. }
                | Self::Spawn { .. }
                | Self::Handshake { .. }
                | Self::UnsupportedLanguage(_)
        )
    }
}
