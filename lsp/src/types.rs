//! Public types consumed by callers of the language server layer.
//!
//! Search, diagnostics and outline tools receive these values; none of them
//! carry protocol plumbing. Wire-level serde types live in `protocol`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// Lifecycle of one transport. Only `Initialized` serves requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Unstarted,
    Starting,
    Initialized,
    Stopping,
    Stopped,
    Crashed,
}

impl TransportState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Initialized => "initialized",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single addressable project found by detection.
///
/// Equality and hashing use the path and language: one directory can hold a
/// Rust and a TypeScript project, each served by its own server. The marker
/// does not take part.
#[derive(Debug, Clone)]
pub struct ProjectRoot {
    path: PathBuf,
    language_id: String,
    marker: String,
    is_workspace_root: bool,
}

impl ProjectRoot {
    #[must_use]
    pub fn new(
        path: PathBuf,
        language_id: impl Into<String>,
        marker: impl Into<String>,
        is_workspace_root: bool,
    ) -> Self {
        Self {
            path,
            language_id: language_id.into(),
            marker: marker.into(),
            is_workspace_root,
        }
    }

    /// Absolute directory the server is rooted at.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    /// Marker file that identified the project, relative to [`path`](Self::path)
    /// (e.g. `Cargo.toml`, `build/compile_commands.json`).
    #[must_use]
    pub fn marker(&self) -> &str {
        &self.marker
    }

    #[must_use]
    pub fn is_workspace_root(&self) -> bool {
        self.is_workspace_root
    }
}

impl PartialEq for ProjectRoot {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.language_id == other.language_id
    }
}

impl Eq for ProjectRoot {}

impl Hash for ProjectRoot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.language_id.hash(state);
    }
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// LSP numeric severity, or `None` outside 1..=4.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single diagnostic from a language server.
///
/// Fields are private; external consumers read via accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    range: Range,
    /// Resolved to a concrete string at the boundary (`"unknown"` when absent).
    source: String,
    code: Option<String>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: String,
        range: Range,
        source: String,
        code: Option<String>,
    ) -> Self {
        Self {
            severity,
            message,
            range,
            source,
            code,
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    /// 0-indexed line of the range start.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.range.start.line
    }

    /// 0-indexed column of the range start.
    #[must_use]
    pub fn col(&self) -> u32 {
        self.range.start.character
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Format as `path:line:col: severity: [source] message` (1-indexed for display).
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            path.display(),
            self.line() + 1,
            self.col() + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// Immutable snapshot of all diagnostics held by one transport.
///
/// Counts are computed from `files`, never cached alongside it.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Per-document diagnostics, error-containing documents first.
    files: Vec<(String, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(files: Vec<(String, Vec<Diagnostic>)>) -> Self {
        Self { files }
    }

    /// Per-document diagnostics keyed by URI, error-containing documents first.
    #[must_use]
    pub fn files(&self) -> &[(String, Vec<Diagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }

    /// Compact status string like "E:3 W:5".
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}

/// Zero-based line/character position (UTF-16 code units, as on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

/// A location inside a document, normalized from every shape servers return.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

impl Location {
    /// Filesystem path for `file://` URIs.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        crate::protocol::file_uri_to_path(&self.uri)
    }
}

/// A symbol from a workspace search or a document outline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    /// LSP `SymbolKind` number; see [`SymbolInfo::kind_label`].
    pub kind: u32,
    pub location: Location,
    pub container_name: Option<String>,
}

impl SymbolInfo {
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        symbol_kind_label(self.kind)
    }
}

/// Human-readable name for an LSP `SymbolKind`.
#[must_use]
pub fn symbol_kind_label(kind: u32) -> &'static str {
    match kind {
        1 => "file",
        2 => "module",
        3 => "namespace",
        4 => "package",
        5 => "class",
        6 => "method",
        7 => "property",
        8 => "field",
        9 => "constructor",
        10 => "enum",
        11 => "interface",
        12 => "function",
        13 => "variable",
        14 => "constant",
        15 => "string",
        16 => "number",
        17 => "boolean",
        18 => "array",
        19 => "object",
        20 => "key",
        21 => "null",
        22 => "enum member",
        23 => "struct",
        24 => "event",
        25 => "operator",
        26 => "type parameter",
        _ => "symbol",
    }
}

/// Hover text, flattened from `MarkupContent` / `MarkedString` forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoverInfo {
    pub contents: String,
    pub range: Option<Range>,
}

/// How a wait for background indexing ended.
///
/// Every outcome lets the caller proceed; `TimedOut` means results may be
/// incomplete because the server is still indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexingOutcome {
    /// At least one progress token was seen and all have ended.
    Complete,
    /// The server reported no progress within the grace period.
    NoProgressReported,
    /// The soft ceiling elapsed with tokens still outstanding.
    TimedOut,
}
