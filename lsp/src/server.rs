//! Client transport: owns one language server connection and manages the LSP
//! lifecycle over it.
//!
//! Four tasks serve a connection: a writer draining an mpsc queue of frames,
//! a reader decoding frames and routing responses by id, a notification pump
//! applying diagnostics and progress, and (for spawned servers) a stderr
//! forwarder. Callers only ever touch the correlation table and the two
//! waiter stores, all of which are safe under concurrent use.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{FrameReader, FrameWriter};
use crate::config::LspConfig;
use crate::diagnostics::DiagnosticsStore;
use crate::error::LspError;
use crate::process::{ServerProcess, scrub_env, set_new_session};
use crate::progress::IndexingTracker;
use crate::protocol::{
    self, IncomingFrame, LogMessageParams, Notification, ProgressParams,
    PublishDiagnosticsParams, Request,
};
use crate::registry::{self, ServerDescriptor};
use crate::types::{
    Diagnostic, DiagnosticsSnapshot, HoverInfo, IndexingOutcome, Location, ProjectRoot,
    SymbolInfo, TransportState,
};

const WRITER_CHANNEL_CAPACITY: usize = 64;

const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

/// Budget for the `shutdown` request; a wedged server is killed anyway.
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeouts and options for one client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Budget for the `initialize` exchange.
    pub init_timeout: Duration,
    pub request_timeout: Duration,
    /// Soft ceiling for [`LspClient::wait_for_indexing`].
    pub indexing_timeout: Duration,
    /// How long to wait for a first progress token before concluding the
    /// server does not report progress.
    pub indexing_grace: Duration,
    /// Quiet window for [`LspClient::wait_for_diagnostics`].
    pub settle_window: Duration,
    /// Wait between SIGTERM and SIGKILL, and for the stream to close.
    pub shutdown_grace: Duration,
    pub initialization_options: Option<Value>,
    pub env_denylist: Vec<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            init_timeout: registry::DEFAULT_INIT_TIMEOUT,
            request_timeout: registry::DEFAULT_REQUEST_TIMEOUT,
            indexing_timeout: registry::DEFAULT_INDEXING_TIMEOUT,
            indexing_grace: Duration::from_secs(3),
            settle_window: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
            initialization_options: None,
            env_denylist: Vec::new(),
        }
    }
}

impl ClientSettings {
    /// Settings for serving `project` with `descriptor` under `config`.
    #[must_use]
    pub fn for_project(
        descriptor: &ServerDescriptor,
        project: &ProjectRoot,
        config: &LspConfig,
    ) -> Self {
        Self {
            init_timeout: descriptor.init_timeout,
            request_timeout: descriptor.request_timeout,
            indexing_timeout: descriptor.indexing_timeout,
            indexing_grace: config.indexing_grace(),
            settle_window: config.settle_window(),
            initialization_options: descriptor.initialization_options(project),
            env_denylist: config.env_denylist(),
            ..Self::default()
        }
    }
}

enum WriterCommand {
    Send(Value),
    Shutdown,
}

type Waiter = oneshot::Sender<Result<Value, LspError>>;

/// Outstanding request id → waiter. An entry is claimed by removal, so a
/// response and a timeout racing for the same id produce exactly one outcome.
#[derive(Default)]
pub(crate) struct PendingRequests {
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: u64) -> oneshot::Receiver<Result<Value, LspError>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    fn claim(&self, id: u64) -> Option<Waiter> {
        self.lock().remove(&id)
    }

    /// Fail every outstanding request.
    fn drain(&self) {
        let waiters: Vec<Waiter> = self.lock().drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(LspError::ConnectionClosed));
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// State shared between the client and its I/O tasks.
struct Shared {
    label: String,
    state: watch::Sender<TransportState>,
    pending: PendingRequests,
    diagnostics: DiagnosticsStore,
    progress: IndexingTracker,
}

impl Shared {
    /// Record that the server is gone: its output ended, a write failed or
    /// the process exited. Whichever is seen first decides the state.
    fn connection_lost(&self, reason: &str) {
        self.state.send_if_modified(|state| {
            let next = match *state {
                TransportState::Stopping | TransportState::Stopped => TransportState::Stopped,
                _ => TransportState::Crashed,
            };
            if *state == next {
                return false;
            }
            if next == TransportState::Crashed {
                tracing::warn!(server = %self.label, "Language server connection lost: {reason}");
            } else {
                tracing::debug!(server = %self.label, "Language server closed: {reason}");
            }
            *state = next;
            true
        });
        self.pending.drain();
    }
}

/// A live connection to one language server.
///
/// Obtained from [`ServerCache::get_client`](crate::ServerCache::get_client)
/// and valid only until the next cache call; do not hold on to it.
pub struct LspClient {
    shared: Arc<Shared>,
    project: ProjectRoot,
    settings: ClientSettings,
    next_id: AtomicU64,
    writer_tx: mpsc::Sender<WriterCommand>,
    /// Open documents → last version sent.
    documents: Mutex<HashMap<String, i32>>,
    /// `None` for connected streams and once terminated.
    process: tokio::sync::Mutex<Option<ServerProcess>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LspClient {
    /// Spawn the server for `project` and complete the handshake.
    pub async fn start(
        descriptor: &ServerDescriptor,
        project: &ProjectRoot,
        settings: ClientSettings,
    ) -> Result<Self, LspError> {
        let command = descriptor.command.clone();
        let program = which::which(&command).map_err(|_| LspError::CommandNotFound {
            command: command.clone(),
        })?;

        let mut cmd = Command::new(&program);
        cmd.args(descriptor.launch_args(project))
            .current_dir(project.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        set_new_session(&mut cmd);
        let scrubbed = scrub_env(&mut cmd, &settings.env_denylist);
        if !scrubbed.is_empty() {
            tracing::debug!(
                server = %command,
                count = scrubbed.len(),
                "Removed secret-bearing variables from server environment"
            );
        }

        let mut child = cmd.spawn().map_err(|source| LspError::Spawn {
            command: command.clone(),
            source,
        })?;
        let missing_pipe = |name: &str| LspError::Spawn {
            command: command.clone(),
            source: std::io::Error::other(format!("{name} not captured")),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take();

        let label = client_label(project);
        tracing::info!(
            server = %label,
            command = %program.display(),
            pid = child.id().unwrap_or_default(),
            "Starting language server"
        );
        let client = Self::assemble(stdout, stdin, project.clone(), settings, label.clone());
        let shared = client.shared.clone();
        let process = ServerProcess::new(child, label, move |status| {
            let reason = status.map_or_else(
                || "process exited".to_string(),
                |status| format!("process exited ({status})"),
            );
            shared.connection_lost(&reason);
        });
        *client.process.lock().await = Some(process);
        if let Some(stderr) = stderr {
            client.spawn_task(forward_stderr(stderr, client.shared.label.clone()));
        }

        client.handshake_or_stop().await?;
        Ok(client)
    }

    /// Complete the handshake over already-connected streams.
    pub async fn connect<R, W>(
        reader: R,
        writer: W,
        project: ProjectRoot,
        settings: ClientSettings,
    ) -> Result<Self, LspError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label = client_label(&project);
        let client = Self::assemble(reader, writer, project, settings, label);
        client.handshake_or_stop().await?;
        Ok(client)
    }

    fn assemble<R, W>(
        reader: R,
        writer: W,
        project: ProjectRoot,
        settings: ClientSettings,
        label: String,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            label,
            state: watch::Sender::new(TransportState::Unstarted),
            pending: PendingRequests::default(),
            diagnostics: DiagnosticsStore::new(),
            progress: IndexingTracker::new(),
        });
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (notif_tx, notif_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);

        let tasks = vec![
            tokio::spawn(run_writer(writer, writer_rx, reply_rx, shared.clone())),
            tokio::spawn(run_reader(reader, shared.clone(), reply_tx, notif_tx)),
            tokio::spawn(run_notification_pump(notif_rx, shared.clone())),
        ];

        Self {
            shared,
            project,
            settings,
            next_id: AtomicU64::new(1),
            writer_tx,
            documents: Mutex::new(HashMap::new()),
            process: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(tasks),
        }
    }

    fn spawn_task<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    async fn handshake_or_stop(&self) -> Result<(), LspError> {
        if let Err(err) = self.handshake().await {
            self.shutdown().await;
            return Err(err);
        }
        Ok(())
    }

    async fn handshake(&self) -> Result<(), LspError> {
        self.shared.state.send_replace(TransportState::Starting);
        let started = Instant::now();

        let root = self.project.path();
        let root_uri = protocol::path_to_file_uri(root)
            .ok_or_else(|| LspError::InvalidPath(root.to_path_buf()))?;
        let root_name = root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workspace");
        let params = protocol::initialize_params(
            root_uri.as_str(),
            root_name,
            self.settings.initialization_options.clone(),
        );

        let handshake_err = |reason: String| LspError::Handshake {
            server: self.shared.label.clone(),
            reason,
        };
        let result = self
            .send_request("initialize", Some(params), self.settings.init_timeout)
            .await
            .map_err(|e| handshake_err(e.to_string()))?;
        if !result.get("capabilities").is_some_and(Value::is_object) {
            return Err(handshake_err("initialize result has no capabilities".into()));
        }

        self.send_notification("initialized", Some(serde_json::json!({})))
            .await
            .map_err(|e| handshake_err(e.to_string()))?;

        let initialized = self.shared.state.send_if_modified(|state| {
            if *state == TransportState::Starting {
                *state = TransportState::Initialized;
                true
            } else {
                false
            }
        });
        if !initialized {
            return Err(handshake_err(format!(
                "server went {} during initialize",
                self.state()
            )));
        }

        let server_name = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        tracing::info!(
            server = %self.shared.label,
            server_name,
            elapsed_ms = started.elapsed().as_millis(),
            "Language server initialized"
        );
        Ok(())
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn state(&self) -> TransportState {
        *self.shared.state.borrow()
    }

    /// Whether the client can serve requests.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state() == TransportState::Initialized
    }

    #[must_use]
    pub fn project(&self) -> &ProjectRoot {
        &self.project
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        self.project.language_id()
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Stop the server: `shutdown` request, `exit` notification, then
    /// SIGTERM/SIGKILL to its process group. Safe to call repeatedly and on
    /// a crashed client.
    pub async fn shutdown(&self) {
        // Holding the process lock serializes concurrent shutdowns.
        let mut process = self.process.lock().await;
        let before = self.state();
        if before == TransportState::Stopped {
            return;
        }

        self.shared.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = TransportState::Stopping;
                true
            }
        });

        if before == TransportState::Initialized {
            if let Err(e) = self
                .send_request("shutdown", None, SHUTDOWN_REQUEST_TIMEOUT)
                .await
            {
                tracing::debug!(server = %self.shared.label, "shutdown request failed: {e}");
            }
            let _ = self.send_notification("exit", None).await;
        }
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;

        // Well-behaved servers close stdout after `exit`.
        let mut state_rx = self.shared.state.subscribe();
        let closed = tokio::time::timeout(
            self.settings.shutdown_grace,
            state_rx.wait_for(|s| s.is_terminal()),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        if !closed {
            tracing::debug!(server = %self.shared.label, "Server did not close its stream in time");
        }

        if let Some(mut proc) = process.take() {
            let status = proc.terminate(self.settings.shutdown_grace).await;
            tracing::debug!(server = %self.shared.label, ?status, "Language server process ended");
        }

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.shared.pending.drain();

        if before != TransportState::Crashed {
            self.shared.state.send_replace(TransportState::Stopped);
        }
        tracing::info!(server = %self.shared.label, "Language server stopped");
    }

    // ── Documents ──────────────────────────────────────────────────────────

    /// Send the full text of a document. The first open sends `didOpen` at
    /// version 1; re-opening sends `didChange` with the next version.
    /// Diagnostics cached for the document are cleared either way.
    pub async fn open_document(&self, uri: &str, text: &str) -> Result<(), LspError> {
        self.ensure_initialized()?;
        self.shared.diagnostics.clear(uri);

        let previous = {
            let mut documents = self.lock_documents();
            let previous = documents.get(uri).copied();
            documents.insert(uri.to_string(), previous.map_or(1, |v| v + 1));
            previous
        };

        match previous {
            Some(version) => {
                let params = protocol::did_change_params(uri, version + 1, text);
                self.send_notification("textDocument/didChange", Some(params))
                    .await
            }
            None => {
                let language_id = protocol::file_uri_to_path(uri).map_or_else(
                    || self.language_id().to_string(),
                    |path| registry::document_language_id(self.language_id(), &path),
                );
                let params = protocol::did_open_params(uri, &language_id, 1, text);
                self.send_notification("textDocument/didOpen", Some(params))
                    .await
            }
        }
    }

    /// Close a document and forget its diagnostics.
    pub async fn close_document(&self, uri: &str) -> Result<(), LspError> {
        let was_open = self.lock_documents().remove(uri).is_some();
        self.shared.diagnostics.clear(uri);
        if !was_open {
            return Ok(());
        }
        self.ensure_initialized()?;
        self.send_notification(
            "textDocument/didClose",
            Some(protocol::did_close_params(uri)),
        )
        .await
    }

    #[must_use]
    pub fn is_open(&self, uri: &str) -> bool {
        self.lock_documents().contains_key(uri)
    }

    fn lock_documents(&self) -> MutexGuard<'_, HashMap<String, i32>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Queries ────────────────────────────────────────────────────────────

    pub async fn workspace_symbols(&self, query: &str) -> Result<Vec<SymbolInfo>, LspError> {
        const METHOD: &str = "workspace/symbol";
        let result = self
            .request(METHOD, protocol::workspace_symbol_params(query))
            .await?;
        protocol::parse_symbols(result, None).map_err(|reason| invalid(METHOD, reason))
    }

    /// Outline of one document, flattened with parent names as containers.
    pub async fn document_symbols(&self, uri: &str) -> Result<Vec<SymbolInfo>, LspError> {
        const METHOD: &str = "textDocument/documentSymbol";
        let result = self
            .request(METHOD, protocol::document_symbol_params(uri))
            .await?;
        protocol::parse_symbols(result, Some(uri)).map_err(|reason| invalid(METHOD, reason))
    }

    pub async fn definition(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<Location>, LspError> {
        const METHOD: &str = "textDocument/definition";
        let result = self
            .request(METHOD, protocol::position_params(uri, line, character))
            .await?;
        protocol::parse_locations(result).map_err(|reason| invalid(METHOD, reason))
    }

    /// References including the declaration itself.
    pub async fn references(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<Location>, LspError> {
        const METHOD: &str = "textDocument/references";
        let result = self
            .request(METHOD, protocol::reference_params(uri, line, character))
            .await?;
        protocol::parse_locations(result).map_err(|reason| invalid(METHOD, reason))
    }

    pub async fn hover(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Option<HoverInfo>, LspError> {
        const METHOD: &str = "textDocument/hover";
        let result = self
            .request(METHOD, protocol::position_params(uri, line, character))
            .await?;
        protocol::parse_hover(result).map_err(|reason| invalid(METHOD, reason))
    }

    // ── Waiters ────────────────────────────────────────────────────────────

    /// Diagnostics for `uri` once the server has gone quiet for the settle
    /// window, or whatever is cached when `max_wait` runs out. Never fails.
    pub async fn wait_for_diagnostics(&self, uri: &str, max_wait: Duration) -> Vec<Diagnostic> {
        self.shared
            .diagnostics
            .wait_for_settle(uri, self.settings.settle_window, max_wait)
            .await
    }

    /// Best-effort wait for background indexing. Always lets the caller
    /// proceed; see [`IndexingOutcome`].
    pub async fn wait_for_indexing(&self) -> IndexingOutcome {
        self.shared
            .progress
            .wait_until_indexed(self.settings.indexing_grace, self.settings.indexing_timeout)
            .await
    }

    /// Cached diagnostics for one document.
    #[must_use]
    pub fn diagnostics(&self, uri: &str) -> Vec<Diagnostic> {
        self.shared.diagnostics.get(uri)
    }

    #[must_use]
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    /// Whether any `publishDiagnostics` has arrived on this connection.
    #[must_use]
    pub fn received_diagnostics(&self) -> bool {
        self.shared.diagnostics.received_any()
    }

    /// Progress tokens currently outstanding.
    #[must_use]
    pub fn indexing_in_progress(&self) -> usize {
        self.shared.progress.outstanding()
    }

    /// Lowest percentage among outstanding progress tokens.
    #[must_use]
    pub fn indexing_percentage(&self) -> Option<u32> {
        self.shared.progress.min_percentage()
    }

    // ── Wire ───────────────────────────────────────────────────────────────

    fn ensure_initialized(&self) -> Result<(), LspError> {
        match self.state() {
            TransportState::Initialized => Ok(()),
            state => Err(LspError::NotInitialized { state }),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, LspError> {
        self.ensure_initialized()?;
        self.send_request(method, Some(params), self.settings.request_timeout)
            .await
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, LspError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_value(Request::new(id, method, params)).map_err(|source| {
            LspError::Encode {
                method: method.to_string(),
                source,
            }
        })?;

        // Register before queueing so a fast response always finds its waiter.
        let mut rx = self.shared.pending.register(id);
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.shared.pending.claim(id);
            return Err(LspError::ConnectionClosed);
        }

        let started = Instant::now();
        let waited = tokio::time::timeout(timeout, &mut rx).await;
        let outcome = match waited {
            Ok(outcome) => outcome,
            Err(_) => {
                if self.shared.pending.claim(id).is_some() {
                    tracing::debug!(
                        server = %self.shared.label,
                        method,
                        id,
                        "Request timed out"
                    );
                    return Err(LspError::Timeout {
                        method: method.to_string(),
                        elapsed: started.elapsed(),
                    });
                }
                // The reader claimed the entry first; its send is in flight.
                rx.await
            }
        };

        let body = outcome.map_err(|_| LspError::ConnectionClosed)??;
        response_result(method, body)
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), LspError> {
        let frame = serde_json::to_value(Notification::new(method, params)).map_err(|source| {
            LspError::Encode {
                method: method.to_string(),
                source,
            }
        })?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| LspError::ConnectionClosed)
    }
}

impl Drop for LspClient {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.shared.pending.drain();
    }
}

impl std::fmt::Debug for LspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspClient")
            .field("server", &self.shared.label)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn client_label(project: &ProjectRoot) -> String {
    format!("{}@{}", project.language_id(), project.path().display())
}

fn invalid(method: &str, reason: String) -> LspError {
    LspError::InvalidResponse {
        method: method.to_string(),
        reason,
    }
}

/// Split a response body into its result or a server error.
fn response_result(method: &str, mut body: Value) -> Result<Value, LspError> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Err(LspError::Server {
            method: method.to_string(),
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(body.get_mut("result").map(Value::take).unwrap_or(Value::Null))
}

// ── Tasks ──────────────────────────────────────────────────────────────────

/// Replies to server requests go first and never wait on queue space, so a
/// server blocked on its own output cannot stall the reader.
async fn run_writer<W>(
    writer: W,
    mut rx: mpsc::Receiver<WriterCommand>,
    mut replies: mpsc::UnboundedReceiver<Value>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = FrameWriter::new(writer);
    loop {
        let frame = tokio::select! {
            biased;
            Some(reply) = replies.recv() => reply,
            cmd = rx.recv() => match cmd {
                Some(WriterCommand::Send(frame)) => frame,
                Some(WriterCommand::Shutdown) => {
                    let _ = writer.shutdown().await;
                    break;
                }
                None => break,
            },
        };
        if let Err(e) = writer.write_frame(&frame).await {
            shared.connection_lost(&format!("write failed: {e:#}"));
            break;
        }
    }
}

async fn run_reader<R>(
    reader: R,
    shared: Arc<Shared>,
    replies: mpsc::UnboundedSender<Value>,
    notif_tx: mpsc::Sender<(String, Option<Value>)>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(reader);
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => dispatch_frame(frame, &shared, &replies, &notif_tx).await,
            Ok(None) => {
                shared.connection_lost("stream closed");
                break;
            }
            Err(e) => {
                shared.connection_lost(&format!("{e:#}"));
                break;
            }
        }
    }
}

async fn dispatch_frame(
    frame: Value,
    shared: &Shared,
    replies: &mpsc::UnboundedSender<Value>,
    notif_tx: &mpsc::Sender<(String, Option<Value>)>,
) {
    let Some(incoming) = protocol::parse_incoming(frame) else {
        tracing::trace!(server = %shared.label, "Ignoring unclassifiable JSON-RPC frame");
        return;
    };

    match incoming {
        IncomingFrame::Response { id, body } => match shared.pending.claim(id) {
            Some(waiter) => {
                let _ = waiter.send(Ok(body));
            }
            None => {
                tracing::debug!(server = %shared.label, id, "Response for unknown or expired request");
            }
        },
        IncomingFrame::ServerRequest { id, method, params } => {
            let reply = server_request_reply(&id, &method, params.as_ref());
            if reply.get("error").is_some() {
                tracing::debug!(server = %shared.label, "Server sent request: {method}; replying method not found");
            }
            let _ = replies.send(reply);
        }
        IncomingFrame::Notification { method, params } => {
            let _ = notif_tx.send((method, params)).await;
        }
    }
}

/// Reply to a request the server sent us. Servers block on some of these,
/// so every request gets an answer.
fn server_request_reply(id: &Value, method: &str, params: Option<&Value>) -> Value {
    match method {
        "window/workDoneProgress/create"
        | "client/registerCapability"
        | "client/unregisterCapability" => protocol::response(id, Value::Null),
        "workspace/configuration" => {
            let items = params
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            protocol::response(id, Value::Array(vec![Value::Null; items]))
        }
        _ => protocol::error_response(
            id,
            protocol::METHOD_NOT_FOUND,
            &format!("Method not found: {method}"),
        ),
    }
}

async fn run_notification_pump(
    mut rx: mpsc::Receiver<(String, Option<Value>)>,
    shared: Arc<Shared>,
) {
    while let Some((method, params)) = rx.recv().await {
        handle_notification(&shared, &method, params);
    }
}

fn handle_notification(shared: &Shared, method: &str, params: Option<Value>) {
    let label = &shared.label;
    match method {
        "textDocument/publishDiagnostics" => {
            let Some(params) = params else { return };
            match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                Ok(params) => {
                    let items: Vec<Diagnostic> = params
                        .diagnostics
                        .into_iter()
                        .map(protocol::LspDiagnostic::into_diagnostic)
                        .collect();
                    tracing::trace!(server = %label, uri = %params.uri, count = items.len(), "Diagnostics published");
                    shared.diagnostics.update(params.uri, items);
                }
                Err(e) => {
                    tracing::debug!(server = %label, "Failed to parse publishDiagnostics: {e}");
                }
            }
        }
        "$/progress" => {
            let Some(params) = params else { return };
            match serde_json::from_value::<ProgressParams>(params) {
                Ok(progress) => shared.progress.apply(progress),
                // Partial-result tokens carry arbitrary payloads.
                Err(e) => tracing::trace!(server = %label, "Ignoring $/progress payload: {e}"),
            }
        }
        "window/logMessage" | "window/showMessage" => {
            let Some(params) = params else { return };
            let Ok(log) = serde_json::from_value::<LogMessageParams>(params) else {
                return;
            };
            match log.kind {
                1 => tracing::warn!(server = %label, "{}", log.message),
                2 => tracing::info!(server = %label, "{}", log.message),
                _ => tracing::debug!(server = %label, "{}", log.message),
            }
        }
        _ => {
            tracing::trace!(server = %label, "Ignoring notification: {method}");
        }
    }
}

async fn forward_stderr<E>(stderr: E, label: String)
where
    E: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tracing::debug!(server = %label, "stderr: {line}");
        }
    }
}

/// `file://` URI for `path`.
pub fn file_uri(path: &Path) -> Result<String, LspError> {
    protocol::path_to_file_uri(path)
        .map(|uri| uri.to_string())
        .ok_or_else(|| LspError::InvalidPath(path.to_path_buf()))
}
