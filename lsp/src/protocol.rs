//! Internal LSP message serde types and parameter builders.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{
    Diagnostic, DiagnosticSeverity, HoverInfo, Location, Position, Range, SymbolInfo,
};

/// JSON-RPC `MethodNotFound`.
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Reply to a request the server sent us.
pub(crate) fn response(id: &serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub(crate) fn error_response(
    id: &serde_json::Value,
    code: i64,
    message: &str,
) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

/// A frame read from the server, classified by shape.
#[derive(Debug)]
pub(crate) enum IncomingFrame {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

pub(crate) fn parse_incoming(frame: serde_json::Value) -> Option<IncomingFrame> {
    let serde_json::Value::Object(mut map) = frame else {
        return None;
    };
    let method = match map.remove("method") {
        Some(serde_json::Value::String(m)) => Some(m),
        _ => None,
    };
    let has_result_or_error = map.contains_key("result") || map.contains_key("error");
    let id = map.get("id").cloned();

    match (id, method, has_result_or_error) {
        (Some(id), None, true) => {
            let id = id.as_u64()?;
            Some(IncomingFrame::Response {
                id,
                body: serde_json::Value::Object(map),
            })
        }
        (Some(id), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id,
            method,
            params: map.remove("params"),
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: map.remove("params"),
        }),
        _ => None,
    }
}

pub(crate) fn initialize_params(
    root_uri: &str,
    root_name: &str,
    initialization_options: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut params = serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": { "name": "lodestar", "version": env!("CARGO_PKG_VERSION") },
        "rootUri": root_uri,
        "capabilities": {
            "general": { "positionEncodings": ["utf-16"] },
            "window": { "workDoneProgress": true },
            "workspace": {
                "configuration": true,
                "workspaceFolders": true,
                "symbol": { "dynamicRegistration": false }
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "publishDiagnostics": {
                    "relatedInformation": false,
                    "versionSupport": false
                },
                "definition": { "linkSupport": true },
                "references": {},
                "hover": { "contentFormat": ["markdown", "plaintext"] },
                "documentSymbol": { "hierarchicalDocumentSymbolSupport": true }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": root_name
        }]
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options;
    }
    params
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_close_params(uri: &str) -> serde_json::Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn position_params(uri: &str, line: u32, character: u32) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character }
    })
}

pub(crate) fn reference_params(uri: &str, line: u32, character: u32) -> serde_json::Value {
    let mut params = position_params(uri, line, character);
    params["context"] = serde_json::json!({ "includeDeclaration": true });
    params
}

pub(crate) fn workspace_symbol_params(query: &str) -> serde_json::Value {
    serde_json::json!({ "query": query })
}

pub(crate) fn document_symbol_params(uri: &str) -> serde_json::Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

// ── Incoming payloads ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: LspRange,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub code: Option<serde_json::Value>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct LspRange {
    pub start: LspPosition,
    pub end: LspPosition,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct LspPosition {
    pub line: u32,
    pub character: u32,
}

impl From<LspRange> for Range {
    fn from(range: LspRange) -> Self {
        Range::new(
            Position::new(range.start.line, range.start.character),
            Position::new(range.end.line, range.end.character),
        )
    }
}

impl LspDiagnostic {
    pub fn into_diagnostic(self) -> Diagnostic {
        let code = self.code.and_then(|c| match c {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        Diagnostic::new(
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.message,
            self.range.into(),
            self.source.unwrap_or_else(|| String::from("unknown")),
            code,
        )
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProgressParams {
    pub token: ProgressToken,
    pub value: ProgressValue,
}

/// Progress tokens are `integer | string` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(untagged)]
pub(crate) enum ProgressToken {
    Number(i64),
    String(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub(crate) enum ProgressValue {
    Begin {
        title: Option<String>,
        percentage: Option<u32>,
    },
    Report {
        percentage: Option<u32>,
    },
    End {},
}

#[derive(Debug, Deserialize)]
pub(crate) struct LogMessageParams {
    #[serde(rename = "type")]
    pub kind: u8,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LspLocation {
    uri: String,
    range: LspRange,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LspLocationLink {
    target_uri: String,
    target_selection_range: Option<LspRange>,
    target_range: LspRange,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnyLocation {
    Location(LspLocation),
    Link(LspLocationLink),
}

impl From<AnyLocation> for Location {
    fn from(loc: AnyLocation) -> Self {
        match loc {
            AnyLocation::Location(l) => Location {
                uri: l.uri,
                range: l.range.into(),
            },
            AnyLocation::Link(l) => Location {
                uri: l.target_uri,
                range: l.target_selection_range.unwrap_or(l.target_range).into(),
            },
        }
    }
}

/// Flatten `Location | Location[] | LocationLink[] | null` to a list.
pub(crate) fn parse_locations(result: serde_json::Value) -> Result<Vec<Location>, String> {
    match result {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| {
                serde_json::from_value::<AnyLocation>(item)
                    .map(Location::from)
                    .map_err(|e| e.to_string())
            })
            .collect(),
        single => serde_json::from_value::<AnyLocation>(single)
            .map(|loc| vec![loc.into()])
            .map_err(|e| e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LspSymbolInformation {
    name: String,
    kind: u32,
    location: SymbolLocation,
    container_name: Option<String>,
}

/// `WorkspaceSymbol.location` may omit the range (resolve-later form).
#[derive(Debug, Deserialize)]
struct SymbolLocation {
    uri: String,
    range: Option<LspRange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LspDocumentSymbol {
    name: String,
    kind: u32,
    selection_range: LspRange,
    #[serde(default)]
    children: Vec<LspDocumentSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnySymbol {
    // Order matters: `DocumentSymbol` has no `location`, `SymbolInformation` has no `selectionRange`.
    Information(LspSymbolInformation),
    Document(LspDocumentSymbol),
}

/// Flatten `SymbolInformation[] | WorkspaceSymbol[] | DocumentSymbol[] | null`.
///
/// Hierarchical document symbols are walked depth-first; each child records
/// its parent's name as `container_name`.
pub(crate) fn parse_symbols(
    result: serde_json::Value,
    document_uri: Option<&str>,
) -> Result<Vec<SymbolInfo>, String> {
    let items = match result {
        serde_json::Value::Null => return Ok(Vec::new()),
        serde_json::Value::Array(items) => items,
        other => return Err(format!("expected array, got {other}")),
    };

    let mut out = Vec::new();
    for item in items {
        match serde_json::from_value::<AnySymbol>(item).map_err(|e| e.to_string())? {
            AnySymbol::Information(info) => out.push(SymbolInfo {
                name: info.name,
                kind: info.kind,
                location: Location {
                    uri: info.location.uri,
                    range: info.location.range.map(Range::from).unwrap_or_default(),
                },
                container_name: info.container_name.filter(|c| !c.is_empty()),
            }),
            AnySymbol::Document(doc) => {
                let Some(uri) = document_uri else {
                    return Err("document symbol outside a document request".to_string());
                };
                flatten_document_symbol(doc, uri, None, &mut out);
            }
        }
    }
    Ok(out)
}

fn flatten_document_symbol(
    symbol: LspDocumentSymbol,
    uri: &str,
    container: Option<&str>,
    out: &mut Vec<SymbolInfo>,
) {
    out.push(SymbolInfo {
        name: symbol.name.clone(),
        kind: symbol.kind,
        location: Location {
            uri: uri.to_string(),
            range: symbol.selection_range.into(),
        },
        container_name: container.map(String::from),
    });
    for child in symbol.children {
        flatten_document_symbol(child, uri, Some(&symbol.name), out);
    }
}

#[derive(Debug, Deserialize)]
struct LspHover {
    contents: serde_json::Value,
    range: Option<LspRange>,
}

/// Normalize a hover result; `null` or empty contents mean no hover.
pub(crate) fn parse_hover(result: serde_json::Value) -> Result<Option<HoverInfo>, String> {
    if result.is_null() {
        return Ok(None);
    }
    let hover: LspHover = serde_json::from_value(result).map_err(|e| e.to_string())?;
    let contents = hover_text(&hover.contents);
    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(HoverInfo {
        contents,
        range: hover.range.map(Range::from),
    }))
}

/// `MarkupContent | MarkedString | MarkedString[]` → text.
fn hover_text(contents: &serde_json::Value) -> String {
    match contents {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .map(hover_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        serde_json::Value::Object(obj) => {
            let value = obj.get("value").and_then(|v| v.as_str()).unwrap_or("");
            match obj.get("language").and_then(|l| l.as_str()) {
                Some(lang) => format!("```{lang}\n{value}\n```"),
                None => value.to_string(),
            }
        }
        _ => String::new(),
    }
}

pub(crate) fn path_to_file_uri(path: &Path) -> Option<url::Url> {
    url::Url::from_file_path(path).ok()
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
