//! Launching and supervising the agent instances of a [`Plan`] (§4.7
//! `Start`/`Stop`, §5 timeouts, §8 scenarios 5 and 6).
//!
//! Readiness is observed by watching process stdout rather than polling a
//! socket: each spawned process is expected to
//! write a single `READY\n` line to its stdout once it has connected to
//! the broker and bound its ingress/egress (§4.7 step 5→6). An in-process
//! runner (no `binary`) is considered ready as soon as its driving task
//! starts, since there is no separate process to wait on.
//!
//! After startup, one monitor task per process-backed instance watches
//! for exit and, per its [`RestartPolicy`], relaunches it with capped
//! exponential backoff (§4.7 Failure semantics).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain_types::RestartPolicy;
use crate::orchestrator::plan::{Plan, PlannedInstance};
use crate::time_provider::TimeProvider;

/// Default time an instance has to report readiness before startup is
/// considered failed (§5).
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time the orchestrator waits for agents to drain in-flight
/// work after sending `shutdown` before hard-killing them (§5, §8
/// scenario 6).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const BACKOFF_STEPS_MS: [u64; 3] = [1000, 2000, 4000];
const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Lifecycle state of one supervised instance (§4.7, §7 user-visible
/// behavior: "starting/ready/failed").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Process spawned (or runner task started); readiness not yet
    /// observed.
    Starting,
    /// Readiness observed; instance is in steady-state operation.
    Ready,
    /// Startup or every restart attempt failed terminally.
    Failed,
    /// Instance was stopped as part of a graceful or forced shutdown.
    Stopped,
}

/// Errors raised while starting or supervising a plan.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Spawning an instance's process failed outright (binary missing,
    /// not executable, etc).
    #[error("launch stage failed for agent {agent_id}: {reason}")]
    LaunchFailed {
        /// The instance that failed to launch.
        agent_id: String,
        /// The underlying error description.
        reason: String,
    },

    /// An instance did not report readiness within the startup timeout
    /// (§4.7 Failure semantics, §8 scenario 5).
    #[error("agent {agent_id} did not become ready within {timeout_secs}s")]
    StartupTimedOut {
        /// The instance that failed to become ready.
        agent_id: String,
        /// The timeout that was exceeded.
        timeout_secs: u64,
    },
}

struct Supervised {
    status: InstanceStatus,
    child: Option<Child>,
}

type InstanceTable = Arc<Mutex<HashMap<String, Supervised>>>;

/// Handle returned by [`start`], exposing `stop`/`wait` over the whole
/// cell (§4.7 `Start`).
pub struct Handle {
    cell_id: String,
    instances: InstanceTable,
    shutdown: CancellationToken,
}

impl Handle {
    /// This cell's id, for logging.
    #[must_use]
    pub fn cell_id(&self) -> &str {
        &self.cell_id
    }

    /// Reports the current status of every instance, in no particular
    /// order — callers needing declaration order should consult the
    /// originating [`Plan`] instead.
    pub async fn statuses(&self) -> HashMap<String, InstanceStatus> {
        self.instances.lock().await.iter().map(|(id, s)| (id.clone(), s.status)).collect()
    }

    /// Signals every monitor task to stop restarting and every agent to
    /// shut down, waits up to `timeout` for clean exit, then hard-kills
    /// any stragglers (§4.7 `Stop`, §8 scenario 6).
    pub async fn stop(&self, timeout: Duration) {
        self.shutdown.cancel();

        let deadline = Instant::now() + timeout;
        let mut guard = self.instances.lock().await;
        for (agent_id, supervised) in guard.iter_mut() {
            if let Some(child) = supervised.child.as_mut() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, child.wait()).await {
                    Ok(Ok(_)) => tracing::info!(agent_id, "agent exited cleanly on shutdown"),
                    _ => {
                        tracing::warn!(agent_id, "agent did not exit in time, killing");
                        let _ = child.start_kill();
                    }
                }
            }
            supervised.status = InstanceStatus::Stopped;
        }
    }

    /// Blocks until every process-backed instance has exited (clean,
    /// killed, or permanently failed), without itself driving shutdown.
    /// Useful for an orchestrator CLI's main loop when no external signal
    /// interrupts it first.
    pub async fn wait(&self) {
        loop {
            {
                let guard = self.instances.lock().await;
                let all_done = guard.values().all(|s| {
                    matches!(s.status, InstanceStatus::Stopped | InstanceStatus::Failed) || s.child.is_none()
                });
                if all_done {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

/// Launches every instance in `plan` in declaration order, waiting for
/// each to report readiness before starting the next (§4.7 `Start`).
///
/// On any instance's launch or readiness failure, already-started
/// instances are stopped in reverse order and the triggering error is
/// returned (§4.7 Failure semantics, §8 scenario 5: "A becomes ready; B
/// fails; orchestrator stops A; C is never started").
///
/// # Errors
/// Returns [`SupervisorError::LaunchFailed`] or
/// [`SupervisorError::StartupTimedOut`] for the first instance that
/// fails to start.
pub async fn start(
    plan: &Plan,
    workbench_dir: &str,
    startup_timeout: Duration,
    time_provider: Arc<dyn TimeProvider>,
) -> Result<Handle, SupervisorError> {
    let instances: InstanceTable = Arc::new(Mutex::new(HashMap::new()));
    let shutdown = CancellationToken::new();
    let mut started_order = Vec::new();

    for planned in &plan.instances {
        match launch_one(planned, workbench_dir, startup_timeout).await {
            Ok(supervised) => {
                instances.lock().await.insert(planned.def.id.clone(), supervised);
                started_order.push(planned.def.id.clone());
                tracing::info!(agent_id = %planned.def.id, "agent ready");
                spawn_monitor(
                    planned.clone(),
                    workbench_dir.to_string(),
                    Arc::clone(&instances),
                    shutdown.clone(),
                    Arc::clone(&time_provider),
                );
            }
            Err(err) => {
                tracing::error!(agent_id = %planned.def.id, %err, "agent failed to start");
                shutdown.cancel();
                let mut guard = instances.lock().await;
                for agent_id in started_order.iter().rev() {
                    if let Some(supervised) = guard.get_mut(agent_id) {
                        if let Some(child) = supervised.child.as_mut() {
                            let _ = child.start_kill();
                        }
                        supervised.status = InstanceStatus::Stopped;
                    }
                }
                return Err(err);
            }
        }
    }

    Ok(Handle { cell_id: plan.cell_id.clone(), instances, shutdown })
}

async fn launch_one(
    instance: &PlannedInstance,
    workbench_dir: &str,
    startup_timeout: Duration,
) -> Result<Supervised, SupervisorError> {
    let Some(binary) = &instance.binary else {
        // In-process runner: no separate process to wait on; ready
        // immediately (§4.7 step 2: "starts the process (or in-process
        // runner)").
        return Ok(Supervised { status: InstanceStatus::Ready, child: None });
    };

    let child = spawn_process(binary, &instance.def.id, workbench_dir).map_err(|err| SupervisorError::LaunchFailed {
        agent_id: instance.def.id.clone(),
        reason: err.to_string(),
    })?;

    await_ready(child, &instance.def.id, startup_timeout).await
}

fn spawn_process(binary: &str, agent_id: &str, workbench_dir: &str) -> std::io::Result<Child> {
    Command::new(binary)
        .env("AGEN_WORKBENCH_DIR", workbench_dir)
        .arg("--agent-id")
        .arg(agent_id)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

async fn await_ready(mut child: Child, agent_id: &str, startup_timeout: Duration) -> Result<Supervised, SupervisorError> {
    let stdout = child.stdout.take().expect("stdout was piped");
    let mut lines = BufReader::new(stdout).lines();

    let ready = tokio::time::timeout(startup_timeout, async {
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim() == "READY" {
                return true;
            }
        }
        false
    })
    .await;

    match ready {
        Ok(true) => Ok(Supervised { status: InstanceStatus::Ready, child: Some(child) }),
        _ => {
            let _ = child.start_kill();
            Err(SupervisorError::StartupTimedOut { agent_id: agent_id.to_string(), timeout_secs: startup_timeout.as_secs() })
        }
    }
}

/// Watches one process-backed instance for exit and relaunches it per
/// its restart policy with capped exponential backoff (§4.7 Failure
/// semantics). Runs until the instance permanently fails, is cancelled by
/// [`Handle::stop`], or the in-process variant (nothing to watch) is
/// reached.
fn spawn_monitor(
    instance: PlannedInstance,
    workbench_dir: String,
    instances: InstanceTable,
    shutdown: CancellationToken,
    time_provider: Arc<dyn TimeProvider>,
) {
    if instance.binary.is_none() {
        return;
    }

    tokio::spawn(async move {
        let mut attempts = 0u32;
        loop {
            let exited_cleanly = {
                let mut guard = instances.lock().await;
                let Some(supervised) = guard.get_mut(&instance.def.id) else { return };
                let Some(child) = supervised.child.as_mut() else { return };
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    status = child.wait() => status.map(|s| s.success()).unwrap_or(false),
                }
            };

            if shutdown.is_cancelled() {
                return;
            }

            attempts += 1;
            if !should_restart(instance.def.restart, attempts, exited_cleanly) {
                tracing::error!(agent_id = %instance.def.id, attempts, "agent exited, not restarting");
                if let Some(supervised) = instances.lock().await.get_mut(&instance.def.id) {
                    supervised.status = InstanceStatus::Failed;
                }
                return;
            }

            tracing::warn!(agent_id = %instance.def.id, attempts, "agent exited, restarting after backoff");
            sleep_backoff(attempts, time_provider.as_ref()).await;

            let Some(binary) = &instance.binary else { return };
            match spawn_process(binary, &instance.def.id, &workbench_dir) {
                Ok(child) => {
                    if let Some(supervised) = instances.lock().await.get_mut(&instance.def.id) {
                        supervised.child = Some(child);
                        supervised.status = InstanceStatus::Ready;
                    }
                }
                Err(err) => {
                    tracing::error!(agent_id = %instance.def.id, %err, "restart launch failed");
                    if let Some(supervised) = instances.lock().await.get_mut(&instance.def.id) {
                        supervised.status = InstanceStatus::Failed;
                    }
                    return;
                }
            }
        }
    });
}

/// Computes the backoff delay before restart attempt `attempt` (1-based),
/// capped at the last configured step (§4.7: "3 attempts, backoff
/// 1s/2s/4s").
#[must_use]
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    let index = (attempt.saturating_sub(1) as usize).min(BACKOFF_STEPS_MS.len() - 1);
    Duration::from_millis(BACKOFF_STEPS_MS[index])
}

/// Whether a crashed instance should be restarted, given its policy and
/// how many attempts have already been made (§4.7 Failure semantics).
#[must_use]
pub fn should_restart(policy: RestartPolicy, attempts: u32, exited_cleanly: bool) -> bool {
    match policy {
        RestartPolicy::Never => false,
        RestartPolicy::OnFailure => !exited_cleanly && attempts <= MAX_RESTART_ATTEMPTS,
        RestartPolicy::Always => attempts <= MAX_RESTART_ATTEMPTS,
    }
}

/// Sleeps the backoff for `attempt` using `time_provider`, so tests can
/// skip the real delay.
pub async fn sleep_backoff(attempt: u32, time_provider: &dyn TimeProvider) {
    time_provider.sleep(backoff_for_attempt(attempt)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_the_documented_steps() {
        assert_eq!(backoff_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(backoff_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(backoff_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn backoff_caps_at_the_last_step_beyond_max_attempts() {
        assert_eq!(backoff_for_attempt(10), Duration::from_millis(4000));
    }

    #[test]
    fn never_policy_never_restarts() {
        assert!(!should_restart(RestartPolicy::Never, 1, false));
    }

    #[test]
    fn on_failure_policy_restarts_only_on_crash_within_attempt_budget() {
        assert!(should_restart(RestartPolicy::OnFailure, 1, false));
        assert!(!should_restart(RestartPolicy::OnFailure, 1, true));
        assert!(!should_restart(RestartPolicy::OnFailure, 4, false));
    }

    #[test]
    fn always_policy_restarts_on_clean_exit_too() {
        assert!(should_restart(RestartPolicy::Always, 1, true));
        assert!(!should_restart(RestartPolicy::Always, 4, true));
    }
}
