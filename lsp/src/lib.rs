//! Language server integration for code-navigation tools.
//!
//! [`ServerCache`] is the entry point: it resolves a file to its project,
//! keeps at most one language server alive, and hands out short-lived
//! [`LspClient`] handles for symbol, definition, reference, hover and
//! diagnostics queries.

pub mod cache;
pub mod codec;
pub mod config;
pub mod detect;
pub mod error;
pub mod registry;
pub mod types;

pub(crate) mod diagnostics;
pub(crate) mod process;
pub(crate) mod progress;
pub(crate) mod protocol;
pub(crate) mod server;

pub use cache::{Launcher, ProcessLauncher, ServerCache};
pub use config::{ConfigError, LspConfig, ScanConfig, ServerConfig};
pub use detect::{DetectorConfig, WorkspaceDetector};
pub use error::LspError;
pub use registry::{ServerDescriptor, ServerRegistry, WorkspaceKind};
pub use server::{ClientSettings, LspClient, file_uri};
pub use types::{
    Diagnostic, DiagnosticSeverity, DiagnosticsSnapshot, HoverInfo, IndexingOutcome, Location,
    Position, ProjectRoot, Range, SymbolInfo, TransportState,
};
