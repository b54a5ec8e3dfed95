//! Shared test utilities and fixtures
//!
//! An in-process language server speaking Content-Length framed JSON-RPC
//! over `tokio::io::duplex`, and a launcher that wires it into the cache.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lodestar_lsp::codec::{FrameReader, FrameWriter};
use lodestar_lsp::{
    ClientSettings, Launcher, LspClient, LspError, ProjectRoot, ServerDescriptor,
};
use serde_json::{Value, json};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const PIPE_BYTES: usize = 64 * 1024;

/// What the fake does in response to one incoming message.
#[derive(Debug, Clone)]
pub enum Action {
    /// Answer the request with `result`.
    Respond(Value),
    /// Answer the request with a JSON-RPC error.
    RespondError(i64, String),
    /// Answer the request after a delay, without blocking later messages.
    RespondAfter(Duration, Value),
    /// Push a notification to the client.
    Notify(String, Value),
    /// Push a notification after a delay.
    NotifyAfter(Duration, String, Value),
    /// Send a server-to-client request.
    Request(Value, String, Value),
    /// Close the connection as if the process died.
    Hangup,
    /// Stop reading input but keep the output stream open, like a server
    /// that died while a helper still holds its stdout.
    Deafen,
}

/// Custom behavior; `None` falls through to the defaults.
pub type Handler = Arc<dyn Fn(&str, &Value) -> Option<Vec<Action>> + Send + Sync>;

/// Every frame the fake received, in arrival order.
#[derive(Clone, Default)]
pub struct Received(Arc<Mutex<Vec<Value>>>);

impl Received {
    pub fn frames(&self) -> Vec<Value> {
        self.0.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.frames()
            .iter()
            .filter_map(|f| f.get("method").and_then(Value::as_str).map(String::from))
            .collect()
    }

    /// Params of every message with `method`.
    pub fn params_of(&self, method: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f.get("method").and_then(Value::as_str) == Some(method))
            .map(|f| f.get("params").cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Client replies to server-initiated requests.
    pub fn replies(&self) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f.get("method").is_none() && f.get("id").is_some())
            .collect()
    }
}

pub fn initialize_result() -> Value {
    json!({
        "capabilities": {
            "hoverProvider": true,
            "definitionProvider": true,
            "referencesProvider": true,
            "workspaceSymbolProvider": true,
            "documentSymbolProvider": true
        },
        "serverInfo": { "name": "fake-ls", "version": "0.0.0" }
    })
}

fn default_actions(method: &str) -> Vec<Action> {
    match method {
        "initialize" => vec![Action::Respond(initialize_result())],
        "shutdown" => vec![Action::Respond(Value::Null)],
        "exit" => vec![Action::Hangup],
        "initialized" | "textDocument/didOpen" | "textDocument/didChange"
        | "textDocument/didClose" => Vec::new(),
        _ => vec![Action::Respond(Value::Null)],
    }
}

enum Outgoing {
    Frame(Value),
    Close,
}

/// Client-side halves of a running fake server.
pub struct FakeConnection {
    pub reader: DuplexStream,
    pub writer: DuplexStream,
    pub received: Received,
}

/// Start a fake server. `live` is incremented now and decremented before the
/// server's output stream closes, so a client that has observed EOF always
/// sees the count already dropped.
pub fn spawn_fake_server(handler: Option<Handler>, live: Arc<AtomicUsize>) -> FakeConnection {
    let (client_writer, server_reader) = tokio::io::duplex(PIPE_BYTES);
    let (server_writer, client_reader) = tokio::io::duplex(PIPE_BYTES);
    let received = Received::default();
    live.fetch_add(1, Ordering::SeqCst);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
    tokio::spawn(async move {
        let mut writer = FrameWriter::new(server_writer);
        while let Some(out) = out_rx.recv().await {
            match out {
                Outgoing::Frame(frame) => {
                    if writer.write_frame(&frame).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close => break,
            }
        }
    });

    let log = received.clone();
    tokio::spawn(async move {
        let mut reader = FrameReader::new(server_reader);
        'serve: while let Ok(Some(frame)) = reader.read_frame().await {
            log.0.lock().unwrap().push(frame.clone());
            let Some(method) = frame.get("method").and_then(Value::as_str) else {
                continue;
            };
            let params = frame.get("params").cloned().unwrap_or(Value::Null);
            let id = frame.get("id").cloned();
            let actions = handler
                .as_ref()
                .and_then(|h| h(method, &params))
                .unwrap_or_else(|| default_actions(method));

            for action in actions {
                match action {
                    Action::Respond(result) => {
                        if let Some(id) = &id {
                            let _ = out_tx.send(Outgoing::Frame(
                                json!({"jsonrpc": "2.0", "id": id, "result": result}),
                            ));
                        }
                    }
                    Action::RespondError(code, message) => {
                        if let Some(id) = &id {
                            let _ = out_tx.send(Outgoing::Frame(json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "error": {"code": code, "message": message}
                            })));
                        }
                    }
                    Action::RespondAfter(delay, result) => {
                        if let Some(id) = id.clone() {
                            let tx = out_tx.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = tx.send(Outgoing::Frame(
                                    json!({"jsonrpc": "2.0", "id": id, "result": result}),
                                ));
                            });
                        }
                    }
                    Action::Notify(method, params) => {
                        let _ = out_tx.send(Outgoing::Frame(
                            json!({"jsonrpc": "2.0", "method": method, "params": params}),
                        ));
                    }
                    Action::NotifyAfter(delay, method, params) => {
                        let tx = out_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(Outgoing::Frame(
                                json!({"jsonrpc": "2.0", "method": method, "params": params}),
                            ));
                        });
                    }
                    Action::Request(id, method, params) => {
                        let _ = out_tx.send(Outgoing::Frame(json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "method": method,
                            "params": params
                        })));
                    }
                    Action::Hangup => break 'serve,
                    Action::Deafen => {
                        live.fetch_sub(1, Ordering::SeqCst);
                        tokio::spawn(async move {
                            let _held = out_tx;
                            std::future::pending::<()>().await;
                        });
                        return;
                    }
                }
            }
        }
        live.fetch_sub(1, Ordering::SeqCst);
        let _ = out_tx.send(Outgoing::Close);
    });

    FakeConnection {
        reader: client_reader,
        writer: client_writer,
        received,
    }
}

/// Settings with short budgets for in-process servers.
pub fn fast_settings() -> ClientSettings {
    ClientSettings {
        init_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        indexing_timeout: Duration::from_millis(500),
        indexing_grace: Duration::from_millis(100),
        settle_window: Duration::from_millis(50),
        shutdown_grace: Duration::from_millis(500),
        ..ClientSettings::default()
    }
}

pub fn project(path: &str, language: &str) -> ProjectRoot {
    let marker = match language {
        "rust" => "Cargo.toml",
        "typescript" => "tsconfig.json",
        "go" => "go.mod",
        "python" => "pyproject.toml",
        _ => "compile_commands.json",
    };
    ProjectRoot::new(PathBuf::from(path), language, marker, false)
}

/// Fake server plus a connected, initialized client.
pub async fn connect(handler: Option<Handler>, settings: ClientSettings) -> (LspClient, Received) {
    let live = Arc::new(AtomicUsize::new(0));
    let conn = spawn_fake_server(handler, live);
    let client = LspClient::connect(
        conn.reader,
        conn.writer,
        project("/ws/app", "rust"),
        settings,
    )
    .await
    .expect("handshake with fake server");
    (client, conn.received)
}

/// Launches fake servers and counts them.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    pub launches: Arc<AtomicUsize>,
    pub live: Arc<AtomicUsize>,
    pub max_live: Arc<AtomicUsize>,
    pub handler: Option<Handler>,
    pub launched: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeLauncher {
    pub fn with_handler(handler: Handler) -> Self {
        Self {
            handler: Some(handler),
            ..Self::default()
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

impl Launcher for FakeLauncher {
    async fn launch(
        &self,
        _descriptor: &ServerDescriptor,
        project: &ProjectRoot,
        mut settings: ClientSettings,
    ) -> Result<LspClient, LspError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.launched
            .lock()
            .unwrap()
            .push(project.path().to_path_buf());
        settings.shutdown_grace = Duration::from_millis(500);

        let conn = spawn_fake_server(self.handler.clone(), self.live.clone());
        self.max_live
            .fetch_max(self.live.load(Ordering::SeqCst), Ordering::SeqCst);
        LspClient::connect(conn.reader, conn.writer, project.clone(), settings).await
    }
}
