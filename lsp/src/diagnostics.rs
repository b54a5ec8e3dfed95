//! Diagnostics store: latest published diagnostics per document URI, plus
//! the settle waiter built on top of it.
//!
//! Many servers publish in passes (syntax first, semantic analysis shortly
//! after), so "diagnostics are ready" means "nothing new arrived for a quiet
//! window". The waiter holds one `Sleep` and re-arms it on every update.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::types::{Diagnostic, DiagnosticsSnapshot};

struct DocEntry {
    items: Vec<Diagnostic>,
    updated_at: Instant,
}

pub(crate) struct DiagnosticsStore {
    data: Mutex<HashMap<String, DocEntry>>,
    /// Bumped on every mutation; waiters subscribe to it.
    generation: watch::Sender<u64>,
    received_any: AtomicBool,
}

impl DiagnosticsStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            generation: watch::Sender::new(0),
            received_any: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DocEntry>> {
        // A poisoned map still holds valid diagnostics; keep serving them.
        self.data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record a `publishDiagnostics` for `uri`. An empty list is kept: it is
    /// still a fresh answer for the settle waiter.
    pub fn update(&self, uri: String, items: Vec<Diagnostic>) {
        self.lock().insert(
            uri,
            DocEntry {
                items,
                updated_at: Instant::now(),
            },
        );
        self.received_any.store(true, Ordering::Release);
        self.generation.send_modify(|g| *g += 1);
    }

    /// Forget `uri` (document closed or re-opened).
    pub fn clear(&self, uri: &str) {
        if self.lock().remove(uri).is_some() {
            self.generation.send_modify(|g| *g += 1);
        }
    }

    pub fn get(&self, uri: &str) -> Vec<Diagnostic> {
        self.lock()
            .get(uri)
            .map(|entry| entry.items.clone())
            .unwrap_or_default()
    }

    /// Whether any diagnostics notification has arrived since startup.
    pub fn received_any(&self) -> bool {
        self.received_any.load(Ordering::Acquire)
    }

    fn last_update(&self, uri: &str) -> Option<Instant> {
        self.lock().get(uri).map(|entry| entry.updated_at)
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut files: Vec<(String, Vec<Diagnostic>)> = self
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.items.is_empty())
            .map(|(uri, entry)| (uri.clone(), entry.items.clone()))
            .collect();

        // Documents with errors first, then by URI.
        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot::new(files)
    }

    /// Wait until `uri` has been quiet for `settle`, or until `max_wait`.
    ///
    /// Never fails: at the ceiling it returns whatever is cached, possibly
    /// nothing. A publish that arrived before the call still counts toward
    /// the quiet window, so an already-settled document returns at once.
    pub async fn wait_for_settle(
        &self,
        uri: &str,
        settle: Duration,
        max_wait: Duration,
    ) -> Vec<Diagnostic> {
        let ceiling = Instant::now() + max_wait;
        // Subscribe before reading state so no update slips between the two.
        let mut updates = self.generation.subscribe();
        let sleep = tokio::time::sleep_until(self.settle_deadline(uri, settle, ceiling));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    sleep.as_mut().reset(self.settle_deadline(uri, settle, ceiling));
                }
            }
        }

        self.get(uri)
    }

    fn settle_deadline(&self, uri: &str, settle: Duration, ceiling: Instant) -> Instant {
        match self.last_update(uri) {
            Some(at) => (at + settle).min(ceiling),
            None => ceiling,
        }
    }
}
