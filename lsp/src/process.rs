//! Server subprocess management.
//!
//! Language servers fork helpers (tsserver, cargo, clang workers), so every
//! server is spawned as the leader of a new session and torn down by
//! signalling the whole process group: SIGTERM, a grace period, then SIGKILL.

use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::env_glob_matches;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    NotRunning,
    Signalled,
}

/// Make the spawned process the leader of a new session (pid == pgid) so
/// its whole tree can be signalled at once.
#[cfg(unix)]
pub fn set_new_session(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.as_std_mut().pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // Linux-only: the server dies with us even on SIGKILL.
            #[cfg(target_os = "linux")]
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn set_new_session(_cmd: &mut Command) {}

/// Remove variables matching `denylist` from the child's environment.
/// Returns the removed names, for logging.
pub fn scrub_env(cmd: &mut Command, denylist: &[String]) -> Vec<String> {
    let mut removed = Vec::new();
    for (key, _) in std::env::vars_os() {
        let Some(key) = key.to_str() else {
            continue;
        };
        let upper = key.to_uppercase();
        if denylist.iter().any(|pat| env_glob_matches(pat, &upper)) {
            cmd.env_remove(key);
            removed.push(key.to_string());
        }
    }
    removed
}

/// Send `signal` to the process group led by `pid`.
///
/// ESRCH (no such group) is reported as [`KillOutcome::NotRunning`], not an error.
#[cfg(unix)]
pub fn signal_process_group(pid: u32, signal: libc::c_int) -> std::io::Result<KillOutcome> {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return Ok(KillOutcome::NotRunning);
    };
    unsafe {
        if libc::killpg(pgid, signal) == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(KillOutcome::NotRunning);
            }
            return Err(err);
        }
    }
    Ok(KillOutcome::Signalled)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leader {
    Running,
    Exited(Option<ExitStatus>),
}

#[derive(Debug, Clone, Copy)]
enum Stop {
    Term,
    Kill,
}

/// A spawned server process.
///
/// A watcher task owns the child. When the leader exits, the watcher kills
/// the rest of its group, reaps the leader and hands the exit status to the
/// `on_exit` callback. The group id is given up under a lock before the
/// leader is reaped, so a recycled pid is never signalled.
///
/// Killed (with its group) on drop if still running.
pub struct ServerProcess {
    group: Arc<Mutex<Option<u32>>>,
    exit_rx: watch::Receiver<Leader>,
    watcher: JoinHandle<()>,
    label: String,
}

impl ServerProcess {
    pub fn new<F>(child: Child, label: impl Into<String>, on_exit: F) -> Self
    where
        F: FnOnce(Option<ExitStatus>) + Send + 'static,
    {
        let label = label.into();
        let group = Arc::new(Mutex::new(child.id()));
        let (exit_tx, exit_rx) = watch::channel(Leader::Running);
        let watcher = tokio::spawn(watch_exit(
            child,
            group.clone(),
            label.clone(),
            exit_tx,
            on_exit,
        ));
        Self {
            group,
            exit_rx,
            watcher,
            label,
        }
    }

    /// Polite-then-forceful teardown of the process group.
    ///
    /// Waits `grace` after SIGTERM before escalating to SIGKILL. Returns the
    /// leader's exit status when one could be collected.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Leader::Exited(status) = *self.exit_rx.borrow() {
            return status;
        }

        self.stop(Stop::Term);
        if let Some(status) = self.wait_exit(grace).await {
            return status;
        }

        tracing::debug!(server = %self.label, "Server ignored SIGTERM; killing process group");
        self.stop(Stop::Kill);
        if let Some(status) = self.wait_exit(grace).await {
            return status;
        }
        tracing::warn!(server = %self.label, "Server still running after SIGKILL");
        None
    }

    /// Whether the leader has exited and been reaped.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        matches!(*self.exit_rx.borrow(), Leader::Exited(_))
    }

    /// `Some(status)` once the watcher reported an exit within `limit`.
    async fn wait_exit(&mut self, limit: Duration) -> Option<Option<ExitStatus>> {
        let waited = tokio::time::timeout(
            limit,
            self.exit_rx.wait_for(|leader| matches!(leader, Leader::Exited(_))),
        )
        .await;
        match waited {
            Ok(Ok(leader)) => match *leader {
                Leader::Exited(status) => Some(status),
                Leader::Running => None,
            },
            // Watcher gone without reporting.
            Ok(Err(_)) => Some(None),
            Err(_) => None,
        }
    }

    #[cfg(unix)]
    fn stop(&self, stop: Stop) {
        let signal = match stop {
            Stop::Term => libc::SIGTERM,
            Stop::Kill => libc::SIGKILL,
        };
        let group = lock_group(&self.group);
        if let Some(pid) = *group
            && let Err(e) = signal_process_group(pid, signal)
        {
            tracing::debug!(server = %self.label, "{stop:?} to group {pid} failed: {e}");
        }
    }

    // Without process groups the only lever is dropping the child, which
    // kills it.
    #[cfg(not(unix))]
    fn stop(&self, _stop: Stop) {
        self.watcher.abort();
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            tracing::debug!(server = %self.label, "Dropping live server; killing process group");
            self.stop(Stop::Kill);
        }
        self.watcher.abort();
    }
}

fn lock_group(group: &Mutex<Option<u32>>) -> MutexGuard<'_, Option<u32>> {
    group.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn watch_exit<F>(
    mut child: Child,
    group: Arc<Mutex<Option<u32>>>,
    label: String,
    exit_tx: watch::Sender<Leader>,
    on_exit: F,
) where
    F: FnOnce(Option<ExitStatus>),
{
    let held = wait_unreaped(child.id()).await;
    if held {
        release_group(&group, &label, true);
    }
    let status = match child.wait().await {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(server = %label, "Failed to reap server: {e}");
            None
        }
    };
    if !held {
        release_group(&group, &label, false);
    }

    tracing::debug!(server = %label, ?status, "Language server process exited");
    exit_tx.send_replace(Leader::Exited(status));
    on_exit(status);
}

/// Forget the group id, first killing helpers the leader left behind when
/// `kill_leftovers` is set. Only valid while the leader is unreaped.
fn release_group(group: &Mutex<Option<u32>>, label: &str, kill_leftovers: bool) {
    let mut group = lock_group(group);
    let Some(pid) = group.take() else {
        return;
    };
    #[cfg(unix)]
    if kill_leftovers
        && let Ok(KillOutcome::Signalled) = signal_process_group(pid, libc::SIGKILL)
    {
        tracing::debug!(server = %label, "Killed process group {pid} after leader exit");
    }
    #[cfg(not(unix))]
    let _ = (pid, label, kill_leftovers);
}

/// Wait until the leader has exited without reaping it, keeping its pid (and
/// so its process group id) reserved. Returns `false` when that cannot be
/// observed and the caller must reap first.
#[cfg(target_os = "linux")]
async fn wait_unreaped(pid: Option<u32>) -> bool {
    use tokio::signal::unix::{SignalKind, signal};

    let Some(pid) = pid else {
        return false;
    };
    let Ok(mut sigchld) = signal(SignalKind::child()) else {
        return false;
    };
    loop {
        match leader_exited(pid) {
            Ok(true) => return true,
            Ok(false) => {}
            Err(_) => return false,
        }
        if sigchld.recv().await.is_none() {
            return false;
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn wait_unreaped(_pid: Option<u32>) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn leader_exited(pid: u32) -> std::io::Result<bool> {
    // SAFETY: siginfo_t is plain data; waitid fills it in.
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::waitid(
            libc::P_PID,
            pid as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
        )
    };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    // With WNOHANG, si_pid stays zero while the child is running.
    Ok(unsafe { info.si_pid() } != 0)
}
