//! OS-level process plumbing: detached spawning, group signalling, liveness.

use std::io::{self, Write};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::process::{Child, Command};

use crate::persistence::open_append;

/// How `terminate` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    /// The process had already exited before any signal was sent.
    AlreadyExited,
    /// The process exited within the grace period after SIGTERM.
    Graceful,
    /// SIGKILL was required.
    Forced,
}

/// Launch `command` through `shell -c` as the leader of a new session.
///
/// The child gets its own process group and no controlling terminal, so it
/// survives the supervisor exiting. stdout and stderr are appended to
/// `log_file`; stdin is closed.
pub(crate) fn spawn_detached(
    name: &str,
    shell: &str,
    command: &str,
    work_dir: &Path,
    log_file: &Path,
) -> io::Result<Child> {
    let mut log = open_append(log_file)?;
    writeln!(
        log,
        "[{}] starting service '{name}': {command}",
        Utc::now().to_rfc3339()
    )?;
    let stderr = log.try_clone()?;

    let mut cmd = Command::new(shell);
    cmd.arg("-c")
        .arg(command)
        .current_dir(work_dir)
        .env("ANUBIS_SERVICE", name)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(false);

    #[cfg(unix)]
    // Safety: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Stop `child` (and its whole process group): SIGTERM, wait up to `grace`,
/// then SIGKILL. Never waits longer than `grace` plus a fixed reap window.
///
/// The stop only counts as graceful when the whole group is gone within
/// `grace`, not just the leader.
pub(crate) async fn terminate(
    child: &mut Child,
    pid: u32,
    grace: Duration,
) -> io::Result<Termination> {
    if child.try_wait()?.is_some() {
        return Ok(Termination::AlreadyExited);
    }

    let deadline = tokio::time::Instant::now() + grace;
    if let Err(e) = signal_group(pid, GroupSignal::Terminate) {
        tracing::warn!(pid, error = %e, "SIGTERM to process group failed, escalating");
    } else if tokio::time::timeout_at(deadline, child.wait()).await.is_ok() {
        if wait_group_exit(pid, deadline).await {
            return Ok(Termination::Graceful);
        }
        tracing::debug!(pid, "Group leader exited but members survived SIGTERM");
        signal_group(pid, GroupSignal::Kill)?;
        return Ok(Termination::Forced);
    }

    if let Err(e) = signal_group(pid, GroupSignal::Kill) {
        tracing::warn!(pid, error = %e, "SIGKILL to process group failed, killing leader");
        child.start_kill()?;
    }
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(result) => {
            result?;
        }
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("PID {pid} did not exit after SIGKILL"),
            ));
        }
    }
    Ok(Termination::Forced)
}

const REAP_TIMEOUT: Duration = Duration::from_secs(5);
const GROUP_POLL: Duration = Duration::from_millis(50);

/// Poll until no process is left in the group led by `pid`, or `deadline`
/// passes. Returns whether the group is gone.
async fn wait_group_exit(pid: u32, deadline: tokio::time::Instant) -> bool {
    loop {
        if !group_exists(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(GROUP_POLL).await;
    }
}

/// Whether any process still belongs to the group led by `pid`.
fn group_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Safety: signal 0 only probes; killpg has no memory-safety preconditions.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, 0) };
        rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Send a signal to the process group led by `pid`. A group that no longer
/// exists is not an error.
fn signal_group(pid: u32, signal: GroupSignal) -> io::Result<()> {
    #[cfg(unix)]
    {
        let sig = match signal {
            GroupSignal::Terminate => libc::SIGTERM,
            GroupSignal::Kill => libc::SIGKILL,
        };
        // Safety: killpg has no memory-safety preconditions.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, sig) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process groups are not supported on this platform",
        ))
    }
}

/// Check whether any process with the given PID exists.
///
/// This is a raw OS probe: it says nothing about whether the PID still
/// belongs to a supervised service.
pub fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 checks if process exists without sending a signal.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Live and not a zombie waiting for its reaper.
    fn running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) if Path::new("/proc/self").exists() => false,
            Err(_) => process_exists(pid),
        }
    }

    #[tokio::test]
    async fn test_spawn_writes_header_and_output() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("echo.log");

        let mut child = spawn_detached("echo", "sh", "echo hello-from-child", dir.path(), &log).unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());

        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("starting service 'echo': echo hello-from-child"));
        assert!(content.contains("hello-from-child\n"));
    }

    #[tokio::test]
    async fn test_spawned_child_leads_its_own_group() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("sleep.log");

        let mut child = spawn_detached("sleep", "sh", "exec sleep 30", dir.path(), &log).unwrap();
        let pid = child.id().unwrap();
        let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
        assert_eq!(pgid, pid as libc::pid_t);

        let outcome = terminate(&mut child, pid, Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, Termination::Graceful);
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("stubborn.log");

        let mut child =
            spawn_detached("stubborn", "sh", "trap '' TERM; sleep 30", dir.path(), &log).unwrap();
        let pid = child.id().unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = terminate(&mut child, pid, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::Forced);
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_terminate_kills_group_member_ignoring_term() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("orphan.log");
        let pid_file = dir.path().join("member.pid");
        let command = format!(
            "(trap '' TERM; sh -c 'echo $PPID' > {}; while true; do sleep 1; done) & wait",
            pid_file.display()
        );

        let mut child = spawn_detached("orphan", "sh", &command, dir.path(), &log).unwrap();
        let pid = child.id().unwrap();
        let mut member = None;
        for _ in 0..50 {
            if let Ok(text) = std::fs::read_to_string(&pid_file)
                && let Ok(p) = text.trim().parse::<u32>()
            {
                member = Some(p);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let member = member.expect("group member pid written");
        assert!(process_exists(member));

        let outcome = terminate(&mut child, pid, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::Forced);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!running(member));
    }

    #[tokio::test]
    async fn test_terminate_already_exited() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("quick.log");

        let mut child = spawn_detached("quick", "sh", "true", dir.path(), &log).unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let outcome = terminate(&mut child, pid, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, Termination::AlreadyExited);
    }

    #[test]
    fn test_process_exists_for_self() {
        assert!(process_exists(std::process::id()));
    }
}
