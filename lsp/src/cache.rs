//! Single-slot server cache: the entry point for callers.
//!
//! At most one language server runs at a time. Asking for a different
//! project stops the held server before the next one starts, and an idle
//! timer stops it after a quiet period. Every successful access re-arms the
//! timer; a generation counter keeps a stale timer from evicting a client
//! that was touched after it was armed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::LspConfig;
use crate::detect::{DetectorConfig, WorkspaceDetector};
use crate::error::LspError;
use crate::registry::{ServerDescriptor, ServerRegistry};
use crate::server::{ClientSettings, LspClient};
use crate::types::ProjectRoot;

/// Starts clients. The seam between the cache and real processes.
pub trait Launcher: Send + Sync + 'static {
    fn launch(
        &self,
        descriptor: &ServerDescriptor,
        project: &ProjectRoot,
        settings: ClientSettings,
    ) -> impl Future<Output = Result<LspClient, LspError>> + Send;
}

/// Spawns the descriptor's command as a child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(
        &self,
        descriptor: &ServerDescriptor,
        project: &ProjectRoot,
        settings: ClientSettings,
    ) -> impl Future<Output = Result<LspClient, LspError>> + Send {
        LspClient::start(descriptor, project, settings)
    }
}

#[derive(Default)]
pub(crate) struct Slot {
    project: Option<ProjectRoot>,
    client: Option<Arc<LspClient>>,
    idle_timer: Option<JoinHandle<()>>,
}

impl Slot {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    /// Empty the slot and stop its client.
    async fn evict(&mut self) {
        self.cancel_timer();
        self.project = None;
        if let Some(client) = self.client.take() {
            tracing::info!(
                project = %client.project().path().display(),
                language = client.language_id(),
                "Stopping language server"
            );
            client.shutdown().await;
        }
    }
}

struct CacheInner<L> {
    launcher: L,
    registry: ServerRegistry,
    detector: Arc<WorkspaceDetector>,
    config: LspConfig,
    slot: Mutex<Slot>,
    /// Bumped each time the idle timer is armed.
    generation: AtomicU64,
}

impl<L: Launcher> CacheInner<L> {
    async fn evict_if_idle(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        // This task owns the timer handle; dropping it detaches instead of
        // aborting ourselves mid-shutdown.
        slot.idle_timer = None;
        if slot.client.is_some() {
            tracing::debug!("Idle timeout reached");
        }
        slot.evict().await;
    }
}

/// Holds at most one live [`LspClient`], keyed by project.
pub struct ServerCache<L: Launcher = ProcessLauncher> {
    inner: Arc<CacheInner<L>>,
}

impl ServerCache<ProcessLauncher> {
    /// Cache spawning real server processes for projects under
    /// `workspace_root`.
    #[must_use]
    pub fn new(config: LspConfig, workspace_root: &Path) -> Self {
        Self::with_launcher(ProcessLauncher, config, workspace_root)
    }
}

impl<L: Launcher> ServerCache<L> {
    #[must_use]
    pub fn with_launcher(launcher: L, config: LspConfig, workspace_root: &Path) -> Self {
        let registry = ServerRegistry::from_config(&config);
        let detector = WorkspaceDetector::new(
            workspace_root,
            DetectorConfig::from_scan(&config.scan),
            &registry,
        );
        Self {
            inner: Arc::new(CacheInner {
                launcher,
                registry,
                detector: Arc::new(detector),
                config,
                slot: Mutex::new(Slot::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ServerRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn config(&self) -> &LspConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        self.inner.detector.root()
    }

    /// A client serving `project`, reusing the held one when it serves the
    /// same path in the same language and is still initialized.
    ///
    /// The returned handle is only valid until the next call into the cache
    /// or the idle timeout; callers must not keep it. `init_timeout`
    /// overrides the descriptor's handshake budget for a fresh start.
    pub async fn get_client(
        &self,
        project: &ProjectRoot,
        init_timeout: Option<Duration>,
    ) -> Result<Arc<LspClient>, LspError> {
        let mut slot = self.inner.slot.lock().await;

        if let Some(client) = &slot.client
            && slot.project.as_ref() == Some(project)
            && client.is_alive()
        {
            let client = client.clone();
            self.arm_idle_timer(&mut slot);
            return Ok(client);
        }

        slot.evict().await;

        let descriptor = self
            .inner
            .registry
            .get(project.language_id())
            .ok_or_else(|| LspError::UnsupportedLanguage(project.language_id().to_string()))?;
        let mut settings = ClientSettings::for_project(descriptor, project, &self.inner.config);
        if let Some(timeout) = init_timeout {
            settings.init_timeout = timeout;
        }

        tracing::info!(
            project = %project.path().display(),
            language = project.language_id(),
            command = %descriptor.command,
            "Starting language server for project"
        );
        match self.inner.launcher.launch(descriptor, project, settings).await {
            Ok(client) => {
                let client = Arc::new(client);
                slot.project = Some(project.clone());
                slot.client = Some(client.clone());
                self.arm_idle_timer(&mut slot);
                Ok(client)
            }
            Err(err) => {
                tracing::warn!(
                    project = %project.path().display(),
                    "Language server unavailable: {err}"
                );
                Err(err)
            }
        }
    }

    fn arm_idle_timer(&self, slot: &mut Slot) {
        slot.cancel_timer();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let idle = self.inner.config.idle_timeout();
        let weak: Weak<CacheInner<L>> = Arc::downgrade(&self.inner);
        slot.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(inner) = weak.upgrade() {
                inner.evict_if_idle(generation).await;
            }
        }));
    }

    /// Project serving `file`, promoted to its workspace root. `None` when
    /// the file belongs to no detectable project.
    pub async fn resolve_project(&self, file: &Path) -> Option<ProjectRoot> {
        let detector = self.inner.detector.clone();
        let file: PathBuf = file.to_path_buf();
        match tokio::task::spawn_blocking(move || detector.resolve(&file)).await {
            Ok(project) => project,
            Err(e) => {
                tracing::warn!("Project resolution failed: {e}");
                None
            }
        }
    }

    /// Resolve `file` and get a client for its project in one step.
    /// `Ok(None)` when no project owns the file.
    pub async fn client_for_file(&self, file: &Path) -> Result<Option<Arc<LspClient>>, LspError> {
        let Some(project) = self.resolve_project(file).await else {
            return Ok(None);
        };
        self.get_client(&project, None).await.map(Some)
    }

    /// Every project under the workspace root (cached scan).
    pub async fn projects(&self) -> Vec<ProjectRoot> {
        let detector = self.inner.detector.clone();
        match tokio::task::spawn_blocking(move || detector.scan()).await {
            Ok(projects) => projects.as_ref().clone(),
            Err(e) => {
                tracing::warn!("Workspace scan failed: {e}");
                Vec::new()
            }
        }
    }

    /// Forget cached scan results, e.g. after files were created or deleted.
    pub fn invalidate_projects(&self) {
        self.inner.detector.invalidate();
    }

    /// Project served by the held client, if any.
    pub async fn current_project(&self) -> Option<ProjectRoot> {
        self.inner.slot.lock().await.project.clone()
    }

    /// Stop the held client, if any.
    pub async fn stop_current(&self) {
        self.inner.slot.lock().await.evict().await;
    }

    /// Stop everything. The cache stays usable; the next `get_client`
    /// starts afresh.
    pub async fn shutdown(&self) {
        self.stop_current().await;
    }
}

impl<L: Launcher> Clone for ServerCache<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
