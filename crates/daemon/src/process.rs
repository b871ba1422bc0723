//! Child process lifecycle.
//!
//! A [`ProcessHandle`] owns one spawned child: its combined stdout/stderr
//! is relayed line-by-line into an append-only log file, liveness is
//! tracked by the wait task through a watch channel, and termination
//! escalates from the polite signal to the forceful one. Everything here
//! is best-effort; a handle whose spawn failed stays "never alive" and
//! every later operation on it is a no-op.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::platform::Platform;

const TERM_GRACE_SECS: u64 = 5;
const KILL_GRACE_SECS: u64 = 5;

pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    #[cfg(unix)]
    pgid: Option<i32>,
    platform: Platform,
    alive: watch::Receiver<bool>,
    force_kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessHandle {
    /// Spawn `program args...`, teeing its output to `log_path`. A spawn
    /// failure is logged and swallowed: the returned handle reports
    /// `spawned() == false` and `kill`/`wait` do nothing.
    pub async fn spawn(
        name: &str,
        program: &std::path::Path,
        args: &[String],
        log_path: Option<PathBuf>,
        platform: Platform,
    ) -> Self {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(child = name, program = %program.display(), error = %e, "spawn failed");
                return Self::never_alive(name, platform);
            }
        };

        let pid = child.id();
        info!(child = name, pid, "spawned");

        let log_tx = log_path.map(spawn_log_writer);
        if let Some(out) = child.stdout.take() {
            spawn_relay(out, log_tx.clone());
        }
        if let Some(err) = child.stderr.take() {
            spawn_relay(err, log_tx);
        }

        let (alive_tx, alive_rx) = watch::channel(true);
        let (force_tx, force_rx) = oneshot::channel::<()>();
        let wait_name = name.to_string();
        tokio::spawn(async move {
            let mut force_rx = Some(force_rx);
            let status = loop {
                match force_rx.take() {
                    Some(mut rx) => {
                        tokio::select! {
                            res = child.wait() => break res,
                            req = &mut rx => {
                                if req.is_ok() {
                                    let _ = child.start_kill();
                                }
                            }
                        }
                    }
                    None => break child.wait().await,
                }
            };
            match status {
                Ok(status) => info!(child = %wait_name, code = status.code(), "exited"),
                Err(e) => warn!(child = %wait_name, error = %e, "wait failed"),
            }
            let _ = alive_tx.send(false);
        });

        Self {
            name: name.to_string(),
            #[cfg(unix)]
            pgid: pid.map(|p| p as i32),
            pid,
            platform,
            alive: alive_rx,
            force_kill: Mutex::new(Some(force_tx)),
        }
    }

    /// A handle with no process behind it.
    pub fn never_alive(name: &str, platform: Platform) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self {
            name: name.to_string(),
            pid: None,
            #[cfg(unix)]
            pgid: None,
            platform,
            alive: rx,
            force_kill: Mutex::new(None),
        }
    }

    /// Whether the spawn itself succeeded.
    pub fn spawned(&self) -> bool {
        self.pid.is_some()
    }

    /// Whether the wait task has not yet observed the exit.
    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Block until the child exits. Returns immediately for never-alive
    /// handles and already-exited children.
    pub async fn wait(&self) {
        let mut rx = self.alive.clone();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Graceful-then-forceful termination. Idempotent and infallible:
    /// repeated calls and "no such process" races are all fine.
    pub async fn kill(&self) {
        if !self.is_alive() {
            debug!(child = %self.name, "kill: already gone");
            return;
        }

        if self.platform.supports_signals() {
            self.send_signal(Signal::Term);
            if self.poll_exit(TERM_GRACE_SECS).await {
                info!(child = %self.name, "terminated");
                return;
            }
            warn!(child = %self.name, "did not stop in time; escalating");
            self.send_signal(Signal::Kill);
        } else {
            // No polite option here; go straight to forceful.
            if let Some(tx) = self.force_kill.lock().await.take() {
                let _ = tx.send(());
            }
        }

        if self.poll_exit(KILL_GRACE_SECS).await {
            info!(child = %self.name, "killed");
        } else {
            warn!(child = %self.name, "still alive after forceful termination");
        }
    }

    async fn poll_exit(&self, secs: u64) -> bool {
        for _ in 0..secs {
            if !self.is_alive() {
                return true;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        !self.is_alive()
    }

    #[cfg(unix)]
    fn send_signal(&self, signal: Signal) {
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // The child led its own session, so target the whole group; fall
        // back to the bare pid if the group is already gone.
        if let Some(pgid) = self.pgid {
            let rc = unsafe { libc::kill(-pgid, sig) };
            if rc == 0 {
                return;
            }
        }
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as i32, sig);
            }
        }
    }

    #[cfg(not(unix))]
    fn send_signal(&self, _signal: Signal) {}
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Terminate an arbitrary pid with the same escalation a handle gets.
/// Used for children that report their real pid over the control channel
/// because the handle only holds the launcher shell.
pub async fn terminate_pid(name: &str, pid: i32, platform: Platform) {
    if !platform.supports_signals() {
        debug!(child = name, pid, "no signal support; skipping reported-pid termination");
        return;
    }
    #[cfg(unix)]
    {
        if unsafe { libc::kill(pid, 0) } != 0 {
            debug!(child = name, pid, "reported pid already gone");
            return;
        }
        unsafe { libc::kill(pid, libc::SIGTERM) };
        if poll_pid_gone(pid, TERM_GRACE_SECS).await {
            info!(child = name, pid, "reported pid terminated");
            return;
        }
        warn!(child = name, pid, "reported pid did not stop in time; escalating");
        unsafe { libc::kill(pid, libc::SIGKILL) };
        if poll_pid_gone(pid, KILL_GRACE_SECS).await {
            info!(child = name, pid, "reported pid killed");
        } else {
            warn!(child = name, pid, "reported pid still alive after forceful termination");
        }
    }
}

#[cfg(unix)]
async fn poll_pid_gone(pid: i32, secs: u64) -> bool {
    for _ in 0..secs {
        if unsafe { libc::kill(pid, 0) } != 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    unsafe { libc::kill(pid, 0) != 0 }
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> std::io::Result<()> {
    // If the daemon itself is killed without running cleanup, the kernel
    // still delivers a terminating signal to the children.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Single writer task per log file; the relay tasks feed it over a
/// channel so lines from stdout and stderr interleave whole.
fn spawn_log_writer(path: PathBuf) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "cannot open child log; output dropped");
                return;
            }
        };
        while let Some(line) = rx.recv().await {
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }
        let _ = file.flush().await;
    });
    tx
}

fn spawn_relay(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    log_tx: Option<mpsc::UnboundedSender<String>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(tx) = &log_tx {
                let _ = tx.send(line);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn failed_spawn_is_never_alive_and_inert() {
        let handle = ProcessHandle::spawn(
            "ghost",
            Path::new("/nonexistent/studio-daemon-test-binary"),
            &[],
            None,
            Platform::detect(),
        )
        .await;
        assert!(!handle.spawned());
        assert!(!handle.is_alive());
        handle.kill().await;
        handle.wait().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_is_teed_to_the_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("child.log");
        let handle = ProcessHandle::spawn(
            "echoer",
            Path::new("sh"),
            &args(&["-c", "echo out-line; echo err-line >&2"]),
            Some(log.clone()),
            Platform::detect(),
        )
        .await;
        assert!(handle.spawned());
        handle.wait().await;

        // The relay and writer tasks run behind the wait; give them a beat.
        let mut contents = String::new();
        for _ in 0..50 {
            contents = std::fs::read_to_string(&log).unwrap_or_default();
            if contents.contains("out-line") && contents.contains("err-line") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(contents.contains("out-line"));
        assert!(contents.contains("err-line"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_terminates_and_is_idempotent() {
        let handle = ProcessHandle::spawn(
            "sleeper",
            Path::new("sh"),
            &args(&["-c", "sleep 30"]),
            None,
            Platform::detect(),
        )
        .await;
        assert!(handle.is_alive());

        handle.kill().await;
        assert!(!handle.is_alive());

        // Second and third calls observe the same post-state.
        handle.kill().await;
        handle.kill().await;
        assert!(!handle.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn wait_observes_natural_exit() {
        let handle = ProcessHandle::spawn(
            "quick",
            Path::new("true"),
            &[],
            None,
            Platform::detect(),
        )
        .await;
        handle.wait().await;
        assert!(!handle.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_pid_tolerates_missing_process() {
        // A pid that certainly is not ours to signal anymore.
        terminate_pid("phantom", i32::MAX - 1, Platform::detect()).await;
    }
}
