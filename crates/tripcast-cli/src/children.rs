// SPDX-License-Identifier: Apache-2.0

//! Supervision of the auxiliary subprocesses (dashboard UI, tracking UI).
//! Each child gets its own task and walks
//! `Starting -> Running -> Exited -> Backoff -> Starting`, with `Stopped`
//! reached only through supervisor shutdown and `Failed` only through
//! crash-loop detection. A failed child never takes the main HTTP service
//! down with it.

use std::env;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

const CRASH_LOOP_THRESHOLD: u32 = 3;
const CRASH_WINDOW: Duration = Duration::from_secs(5);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const TERM_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub name: String,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Starting,
    Running,
    Exited,
    Backoff,
    Failed,
    Stopped,
}

impl ChildSpec {
    /// Builds a spec from an env override (a space-separated argv) or the
    /// built-in default command line.
    pub fn from_env(name: &str, env_key: &str, default_argv: Vec<String>) -> Self {
        let argv = match env::var(env_key) {
            Ok(raw) => {
                let parsed: Vec<String> =
                    raw.split_whitespace().map(ToString::to_string).collect();
                if parsed.is_empty() {
                    warn!(name, env_key, "empty command override; using default");
                    default_argv
                } else {
                    parsed
                }
            }
            Err(_) => default_argv,
        };
        Self {
            name: name.to_string(),
            argv,
        }
    }
}

pub fn dashboard_spec(port: u16) -> ChildSpec {
    ChildSpec::from_env(
        "dashboard",
        "DASHBOARD_COMMAND",
        vec![
            "streamlit".to_string(),
            "run".to_string(),
            "observability/dashboards/dashboard.py".to_string(),
            "--server.port".to_string(),
            port.to_string(),
            "--server.headless".to_string(),
            "true".to_string(),
        ],
    )
}

pub fn tracking_ui_spec(port: u16) -> ChildSpec {
    ChildSpec::from_env(
        "tracking-ui",
        "TRACKING_UI_COMMAND",
        vec![
            "mlflow".to_string(),
            "ui".to_string(),
            "--host".to_string(),
            "0.0.0.0".to_string(),
            "--port".to_string(),
            port.to_string(),
        ],
    )
}

/// Runs one child until shutdown, restarting on unexpected exit with
/// exponential backoff. Returns the terminal state.
pub async fn supervise(spec: ChildSpec, mut stop: watch::Receiver<bool>) -> ChildState {
    let mut consecutive_fast_exits = 0u32;
    let mut restarts = 0u32;

    loop {
        if *stop.borrow() {
            return ChildState::Stopped;
        }

        note_state(&spec.name, ChildState::Starting);
        let mut command = Command::new(&spec.argv[0]);
        command.args(&spec.argv[1..]);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(name = %spec.name, error = %e, "subprocess failed to start");
                consecutive_fast_exits += 1;
                if consecutive_fast_exits >= CRASH_LOOP_THRESHOLD {
                    warn!(name = %spec.name, "crash loop detected; giving up on subprocess");
                    return ChildState::Failed;
                }
                note_state(&spec.name, ChildState::Backoff);
                let delay = backoff_delay(restarts);
                restarts += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = stop.changed() => return ChildState::Stopped,
                }
            }
        };
        let started = Instant::now();
        note_state(&spec.name, ChildState::Running);
        info!(name = %spec.name, pid = child.id(), "subprocess started");

        tokio::select! {
            status = child.wait() => {
                note_state(&spec.name, ChildState::Exited);
                let lived = started.elapsed();
                warn!(name = %spec.name, ?status, lived_ms = lived.as_millis() as u64, "subprocess exited unexpectedly");
                if lived < CRASH_WINDOW {
                    consecutive_fast_exits += 1;
                } else {
                    consecutive_fast_exits = 0;
                }
                if consecutive_fast_exits >= CRASH_LOOP_THRESHOLD {
                    warn!(name = %spec.name, "crash loop detected; giving up on subprocess");
                    return ChildState::Failed;
                }
                note_state(&spec.name, ChildState::Backoff);
                let delay = backoff_delay(restarts);
                restarts += 1;
                info!(name = %spec.name, backoff_ms = delay.as_millis() as u64, "restarting after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.changed() => return ChildState::Stopped,
                }
            }
            _ = stop.changed() => {
                terminate(&mut child, &spec.name).await;
                return ChildState::Stopped;
            }
        }
    }
}

fn note_state(name: &str, state: ChildState) {
    tracing::debug!(name, ?state, "subprocess state transition");
}

fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_CAP)
}

/// Two-phase shutdown: polite termination signal, bounded wait, then a hard
/// kill.
async fn terminate(child: &mut Child, name: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) with a pid we own and a constant signal number;
        // no memory is involved.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            if let Ok(status) = timeout(TERM_WAIT, child.wait()).await {
                info!(name, ?status, "subprocess terminated politely");
                return;
            }
            warn!(name, "subprocess ignored SIGTERM; killing");
        }
    }
    if let Err(e) = child.kill().await {
        warn!(name, error = %e, "failed to kill subprocess");
    } else {
        info!(name, "subprocess killed");
    }
}
