//! Indexing readiness, inferred from `$/progress` begin/report/end.
//!
//! Servers announce background work with progress tokens. Indexing is taken
//! to be finished once every token that began has ended. The waiter is soft:
//! it always lets the caller proceed (see [`IndexingOutcome`]).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::protocol::{ProgressParams, ProgressToken, ProgressValue};
use crate::types::IndexingOutcome;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ProgressState {
    outstanding: usize,
    /// Whether any token has ever begun on this transport.
    seen_any: bool,
}

pub(crate) struct IndexingTracker {
    /// Token → last reported percentage.
    tokens: Mutex<HashMap<ProgressToken, Option<u32>>>,
    state: watch::Sender<ProgressState>,
}

impl IndexingTracker {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            state: watch::Sender::new(ProgressState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProgressToken, Option<u32>>> {
        self.tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn apply(&self, params: ProgressParams) {
        let mut tokens = self.lock();
        match params.value {
            ProgressValue::Begin { title, percentage } => {
                tracing::debug!(
                    token = ?params.token,
                    title = title.as_deref().unwrap_or(""),
                    "Progress began"
                );
                tokens.insert(params.token, percentage);
            }
            ProgressValue::Report { percentage } => {
                // A report for a token we never saw begin still counts as work.
                tokens.insert(params.token, percentage);
            }
            ProgressValue::End {} => {
                tokens.remove(&params.token);
            }
        }
        let next = ProgressState {
            outstanding: tokens.len(),
            seen_any: true,
        };
        drop(tokens);
        self.state.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
    }

    pub fn outstanding(&self) -> usize {
        self.state.borrow().outstanding
    }

    /// Lowest reported percentage among outstanding tokens.
    pub fn min_percentage(&self) -> Option<u32> {
        self.lock().values().filter_map(|p| *p).min()
    }

    /// Wait for indexing to finish, best effort.
    ///
    /// Resolves `Complete` once tokens were seen and none remain,
    /// `NoProgressReported` if nothing begins within `grace`, and `TimedOut`
    /// at `ceiling`. The ceiling is soft: callers proceed with their query
    /// and accept that results may be incomplete.
    pub async fn wait_until_indexed(&self, grace: Duration, ceiling: Duration) -> IndexingOutcome {
        let start = Instant::now();
        let grace_deadline = start + grace.min(ceiling);
        let ceiling_deadline = start + ceiling;
        let mut updates = self.state.subscribe();

        loop {
            let state = *updates.borrow_and_update();
            if state.seen_any && state.outstanding == 0 {
                return IndexingOutcome::Complete;
            }
            let deadline = if state.seen_any {
                ceiling_deadline
            } else {
                grace_deadline
            };

            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    return if state.seen_any {
                        tracing::debug!(
                            outstanding = state.outstanding,
                            "Indexing wait hit its ceiling; proceeding"
                        );
                        IndexingOutcome::TimedOut
                    } else {
                        IndexingOutcome::NoProgressReported
                    };
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        return IndexingOutcome::TimedOut;
                    }
                }
            }
        }
    }
}
