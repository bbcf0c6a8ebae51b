//! Child process management: process-group spawning, liveness probing, and
//! the graceful-then-forceful termination escalation.
//!
//! Children are spawned as leaders of their own process groups so the whole
//! tree can be signalled at once. Termination follows a fixed contract:
//! graceful signal, verify, force signal, verify; a zombie counts as
//! terminated at every step.

use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use super::error::ServiceError;

/// Budget for the graceful phase of the escalation.
pub const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(15);

const POLL_START: Duration = Duration::from_millis(100);
const POLL_CAP: Duration = Duration::from_millis(500);
const POLL_FACTOR: f64 = 1.2;
const FORCE_POLL: Duration = Duration::from_millis(200);

/// Coarse process state as seen through the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidState {
    /// No such process.
    Missing,
    /// Exists but is a zombie, dead, or stopped; counts as terminated.
    Defunct,
    /// Alive and schedulable.
    Running,
}

/// Returns true when a process with `pid` exists in the process table.
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    probe_pid(pid) != PidState::Missing
}

/// Probes the state of `pid`.
#[must_use]
pub fn probe_pid(pid: u32) -> PidState {
    let mut sys = System::new();
    let target = Pid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    match sys.process(target) {
        None => PidState::Missing,
        Some(process) => match process.status() {
            ProcessStatus::Zombie | ProcessStatus::Dead | ProcessStatus::Stop => PidState::Defunct,
            _ => PidState::Running,
        },
    }
}

/// Recursively enumerates the descendants of `pid`.
#[must_use]
pub fn child_pids(pid: u32) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut descendants = Vec::new();
    let mut frontier = vec![Pid::from_u32(pid)];
    while let Some(parent) = frontier.pop() {
        for (child_pid, process) in sys.processes() {
            if process.parent() == Some(parent) {
                descendants.push(child_pid.as_u32());
                frontier.push(*child_pid);
            }
        }
    }
    descendants
}

/// Spawns `argv` as the leader of a new process group, with stderr
/// redirected to `stderr_log` (truncated) and stdout inherited.
///
/// # Errors
///
/// Returns [`ServiceError::Spawn`] if the log file or the child cannot be
/// created.
pub fn spawn_in_group(
    argv: &[String],
    stderr_log: &Path,
    name: &'static str,
) -> Result<Child, ServiceError> {
    let (program, args) = argv.split_first().ok_or_else(|| ServiceError::Spawn {
        name,
        source: std::io::Error::other("empty command line"),
    })?;

    if let Some(parent) = stderr_log.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ServiceError::Spawn { name, source: e })?;
    }
    let log = File::create(stderr_log).map_err(|e| ServiceError::Spawn { name, source: e })?;

    let child = {
        use std::os::unix::process::CommandExt;
        Command::new(program)
            .args(args)
            .stderr(Stdio::from(log))
            .process_group(0)
            .spawn()
            .map_err(|e| ServiceError::Spawn { name, source: e })?
    };

    info!(name, pid = child.id(), log = %stderr_log.display(), "child spawned");
    Ok(child)
}

/// Terminates `pid` and its whole process tree.
///
/// Escalation: SIGTERM to the process group (falling back to per-process
/// signals), adaptive liveness polling for `timeout`, then SIGKILL with a
/// shorter wait. Returns true once the process is gone or defunct; false
/// only for a live process that survived SIGKILL.
pub async fn terminate_tree(pid: u32, name: &str, timeout: Duration) -> bool {
    match probe_pid(pid) {
        PidState::Missing => {
            info!(name, pid, "process not found, assuming already stopped");
            return true;
        }
        PidState::Defunct => {
            info!(name, pid, "process already defunct");
            return true;
        }
        PidState::Running => {}
    }

    let children = child_pids(pid);
    debug!(name, pid, children = children.len(), "terminating process tree");

    signal_tree(pid, &children, libc::SIGTERM, name);
    if wait_for_exit(pid, timeout, true).await {
        info!(name, pid, "terminated gracefully");
        return true;
    }

    warn!(name, pid, "still running after graceful signal, force-killing");
    let children = child_pids(pid);
    signal_tree(pid, &children, libc::SIGKILL, name);

    let force_timeout = (timeout / 2).min(Duration::from_secs(10));
    if wait_for_exit(pid, force_timeout, false).await {
        info!(name, pid, "killed");
        return true;
    }

    match probe_pid(pid) {
        PidState::Missing | PidState::Defunct => true,
        PidState::Running => {
            warn!(name, pid, "process survived SIGKILL");
            false
        }
    }
}

/// Signals the whole group led by `pid`, falling back to per-process
/// delivery when the group signal is refused.
fn signal_tree(pid: u32, children: &[u32], signal: i32, name: &str) {
    #[allow(clippy::cast_possible_wrap)]
    let raw = pid as libc::pid_t;
    let pgid = unsafe { libc::getpgid(raw) };
    let group_ok = pgid > 0 && unsafe { libc::killpg(pgid, signal) } == 0;
    if group_ok {
        debug!(name, pgid, signal, "signalled process group");
        return;
    }

    debug!(name, pid, signal, "group signal failed, signalling individually");
    unsafe {
        libc::kill(raw, signal);
    }
    for child in children {
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            libc::kill(*child as libc::pid_t, signal);
        }
    }
}

/// Polls until `pid` is missing or defunct, within `timeout`. The graceful
/// phase uses an adaptive interval; the force phase a fixed one.
async fn wait_for_exit(pid: u32, timeout: Duration, adaptive: bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut interval = if adaptive { POLL_START } else { FORCE_POLL };
    while tokio::time::Instant::now() < deadline {
        match probe_pid(pid) {
            PidState::Missing | PidState::Defunct => return true,
            PidState::Running => {}
        }
        tokio::time::sleep(interval).await;
        if adaptive {
            interval = interval.mul_f64(POLL_FACTOR).min(POLL_CAP);
        }
    }
    matches!(probe_pid(pid), PidState::Missing | PidState::Defunct)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_missing_pid() {
        // PIDs near the 32-bit ceiling are far above any real pid_max.
        assert_eq!(probe_pid(999_999_999), PidState::Missing);
    }

    #[test]
    fn test_probe_own_pid_is_running() {
        assert_eq!(probe_pid(std::process::id()), PidState::Running);
        assert!(pid_alive(std::process::id()));
    }

    #[tokio::test]
    async fn test_terminate_missing_pid_is_success() {
        assert!(terminate_tree(999_999_999, "ghost", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_terminate_live_child() {
        let dir = tempfile::tempdir().unwrap();
        let child = spawn_in_group(
            &["sleep".to_string(), "30".to_string()],
            &dir.path().join("sleep.log"),
            "sleeper",
        )
        .unwrap();
        let pid = child.id();

        assert!(terminate_tree(pid, "sleeper", Duration::from_secs(10)).await);
        assert_ne!(probe_pid(pid), PidState::Running);
    }

    #[tokio::test]
    async fn test_unreaped_child_counts_as_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let child = spawn_in_group(
            &["true".to_string()],
            &dir.path().join("true.log"),
            "one-shot",
        )
        .unwrap();
        let pid = child.id();

        // Give the child time to exit; without a wait() it stays a zombie,
        // which the escalation must treat as already terminated.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(terminate_tree(pid, "one-shot", Duration::from_secs(5)).await);
    }

    #[test]
    fn test_spawn_rejects_empty_argv() {
        let dir = tempfile::tempdir().unwrap();
        let result = spawn_in_group(&[], &dir.path().join("x.log"), "empty");
        assert!(matches!(result, Err(ServiceError::Spawn { .. })));
    }

    #[test]
    fn test_spawn_writes_stderr_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("err.log");
        let mut child = spawn_in_group(
            &[
                "sh".to_string(),
                "-c".to_string(),
                "echo oops >&2".to_string(),
            ],
            &log,
            "sh",
        )
        .unwrap();
        child.wait().unwrap();

        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("oops"), "stderr should land in the log");
    }
}
