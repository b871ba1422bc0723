//! BEAM IO server supervisor.
//!
//! The IO server is launched through a shell script, so the pid the
//! daemon holds may be a wrapper rather than the BEAM VM itself. The
//! child therefore reports its real OS pid back over the control channel;
//! until it does, a background task re-requests it every second. Restart
//! requests arrive over the control channel too and must coalesce: a
//! restart already in flight absorbs any concurrent request.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use rand::RngCore;
use rosc::{OscMessage, OscPacket, OscType};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RuntimeEnv;
use crate::control::{PidSlot, Token};
use crate::paths::Paths;
use crate::platform::Platform;
use crate::ports::PortMap;
use crate::process::{self, ProcessHandle};

const PID_WAIT: Duration = Duration::from_secs(30);
const PID_REQUEST_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the launcher script is told, in the order it reads it.
#[derive(Debug, Clone)]
pub struct TauBootParams {
    pub cues_on: bool,
    pub osc_in_udp_loopback_restricted: bool,
    pub midi_on: bool,
    pub link_on: bool,
    pub osc_in_udp_port: u16,
    pub api_port: u16,
    pub spider_port: u16,
    pub daemon_port: u16,
    pub log_path: PathBuf,
    pub midi_enabled: bool,
    pub link_enabled: bool,
    pub phx_port: u16,
    pub token: Token,
    pub env: RuntimeEnv,
}

impl TauBootParams {
    pub fn from_ports(ports: &PortMap, log_path: PathBuf, token: Token, env: RuntimeEnv) -> Self {
        Self {
            cues_on: true,
            osc_in_udp_loopback_restricted: true,
            midi_on: true,
            link_on: true,
            osc_in_udp_port: ports.osc_cues,
            api_port: ports.tau,
            spider_port: ports.spider,
            daemon_port: ports.daemon,
            log_path,
            midi_enabled: true,
            link_enabled: true,
            phx_port: ports.phx,
            token,
            env,
        }
    }
}

#[derive(Clone)]
pub struct TauSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    boot_script: PathBuf,
    platform: Platform,
    params: TauBootParams,
    pid_slot: Arc<PidSlot>,
    handle: Mutex<ProcessHandle>,
    restart_gate: Mutex<()>,
    restarting: AtomicBool,
    shutdown: CancellationToken,
}

impl TauSupervisor {
    pub async fn boot(
        paths: &Paths,
        platform: Platform,
        params: TauBootParams,
        pid_slot: Arc<PidSlot>,
        shutdown: CancellationToken,
    ) -> Self {
        let boot_script = paths.tau_boot_script(platform);
        let handle = spawn_launcher(&boot_script, platform, &params).await;
        let supervisor = Self {
            inner: Arc::new(Inner {
                boot_script,
                platform,
                params,
                pid_slot,
                handle: Mutex::new(handle),
                restart_gate: Mutex::new(()),
                restarting: AtomicBool::new(false),
                shutdown,
            }),
        };
        supervisor.spawn_pid_requester();
        supervisor
    }

    pub async fn spawned(&self) -> bool {
        self.inner.handle.lock().await.spawned()
    }

    /// Bounded wait for the self-reported pid.
    pub async fn wait_for_pid(&self) -> Option<i32> {
        self.inner.pid_slot.wait(PID_WAIT).await
    }

    /// Terminate the IO server. The launcher handle may be a shell
    /// wrapper, so the self-reported pid is terminated as well; if the
    /// report has not arrived yet and the launcher still runs, wait for
    /// it up to the bound before proceeding without it.
    pub async fn kill(&self) {
        let mut pid = self.inner.pid_slot.get();
        if pid.is_none() && self.inner.handle.lock().await.is_alive() {
            debug!("waiting for the io server pid before termination");
            pid = self.inner.pid_slot.wait(PID_WAIT).await;
        }
        if let Some(pid) = pid {
            process::terminate_pid("tau", pid, self.inner.platform).await;
        }
        self.inner.handle.lock().await.kill().await;
    }

    /// Kill and boot again. Concurrent calls collapse: whoever sees the
    /// re-entry flag set simply returns while the first caller finishes.
    pub async fn restart(&self) {
        if self.inner.restarting.swap(true, Ordering::SeqCst) {
            debug!("io server restart already in flight");
            return;
        }
        let _gate = self.inner.restart_gate.lock().await;
        info!("restarting io server");

        self.kill().await;
        self.inner.pid_slot.reset();

        let fresh = spawn_launcher(&self.inner.boot_script, self.inner.platform, &self.inner.params)
            .await;
        if !fresh.spawned() {
            warn!("io server failed to respawn");
        }
        *self.inner.handle.lock().await = fresh;
        self.spawn_pid_requester();

        self.inner.restarting.store(false, Ordering::SeqCst);
    }

    /// Ask the child for its pid once a second until the slot fills. The
    /// child listens on its API port; the request carries the token like
    /// every other control message.
    fn spawn_pid_requester(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let socket = match UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(error = %e, "cannot bind pid-request socket");
                    return;
                }
            };
            let request = OscPacket::Message(OscMessage {
                addr: "/send-pid-to-daemon".to_string(),
                args: vec![OscType::Int(inner.params.token.0)],
            });
            let bytes = match rosc::encoder::encode(&request) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "cannot encode pid request");
                    return;
                }
            };
            let target = (Ipv4Addr::LOCALHOST, inner.params.api_port);

            loop {
                if inner.pid_slot.get().is_some() {
                    debug!("pid received; stopping pid requests");
                    return;
                }
                if let Err(e) = socket.send_to(&bytes, target).await {
                    debug!(error = %e, "pid request send failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(PID_REQUEST_INTERVAL) => {}
                    _ = inner.shutdown.cancelled() => return,
                }
            }
        });
    }
}

async fn spawn_launcher(
    boot_script: &Path,
    platform: Platform,
    params: &TauBootParams,
) -> ProcessHandle {
    let script_args = argv(boot_script, params);
    let (program, args) = match platform.launcher_shell() {
        Some(shell) => (PathBuf::from(shell), script_args),
        None => (boot_script.to_path_buf(), script_args[1..].to_vec()),
    };
    info!(script = %boot_script.display(), "booting io server");
    ProcessHandle::spawn("tau", &program, &args, Some(params.log_path.clone()), platform).await
}

/// The launcher's fixed 15-argument contract, script path first.
fn argv(boot_script: &Path, params: &TauBootParams) -> Vec<String> {
    let flag = |b: bool| if b { "true" } else { "false" }.to_string();
    vec![
        boot_script.display().to_string(),
        flag(params.cues_on),
        flag(params.osc_in_udp_loopback_restricted),
        flag(params.midi_on),
        flag(params.link_on),
        params.osc_in_udp_port.to_string(),
        params.api_port.to_string(),
        params.spider_port.to_string(),
        params.daemon_port.to_string(),
        params.log_path.display().to_string(),
        flag(params.midi_enabled),
        flag(params.link_enabled),
        params.phx_port.to_string(),
        phx_secret(),
        params.token.to_string(),
        params.env.to_string(),
    ]
}

/// Fresh web session secret for every boot of the child.
fn phx_secret() -> String {
    let mut buf = [0u8; 64];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    base64::engine::general_purpose::STANDARD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TauBootParams {
        TauBootParams {
            cues_on: true,
            osc_in_udp_loopback_restricted: true,
            midi_on: true,
            link_on: false,
            osc_in_udp_port: 4560,
            api_port: 31003,
            spider_port: 31004,
            daemon_port: 31006,
            log_path: PathBuf::from("/tmp/tau.log"),
            midi_enabled: true,
            link_enabled: false,
            phx_port: 31005,
            token: Token(77),
            env: RuntimeEnv::Dev,
        }
    }

    #[test]
    fn argv_carries_fifteen_items_in_contract_order() {
        let script = PathBuf::from("boot.sh");
        let args = argv(&script, &params());
        // Script path plus the 15-item contract.
        assert_eq!(args.len(), 16);
        assert_eq!(args[0], "boot.sh");
        assert_eq!(args[1], "true"); // cues
        assert_eq!(args[2], "true"); // loopback restricted
        assert_eq!(args[3], "true"); // midi
        assert_eq!(args[4], "false"); // link
        assert_eq!(args[5], "4560");
        assert_eq!(args[6], "31003");
        assert_eq!(args[7], "31004");
        assert_eq!(args[8], "31006");
        assert_eq!(args[9], "/tmp/tau.log");
        assert_eq!(args[10], "true"); // midi enabled
        assert_eq!(args[11], "false"); // link enabled
        assert_eq!(args[12], "31005");
        assert_eq!(args[14], "77");
        assert_eq!(args[15], "dev");
    }

    #[test]
    fn phx_secret_is_fresh_and_long() {
        let a = phx_secret();
        let b = phx_secret();
        assert_ne!(a, b);
        // 64 raw bytes come out to 88 base64 characters.
        assert_eq!(a.len(), 88);
    }

    /// Count the spawn markers the stub launcher has written so far,
    /// polling until the count reaches `at_least` or the deadline
    /// passes.
    #[cfg(unix)]
    async fn wait_for_spawns(marker: &Path, at_least: usize) -> usize {
        for _ in 0..100 {
            let count = std::fs::read_to_string(marker)
                .unwrap_or_default()
                .lines()
                .count();
            if count >= at_least {
                return count;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        std::fs::read_to_string(marker)
            .unwrap_or_default()
            .lines()
            .count()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_restarts_coalesce_to_one_respawn() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::for_root(tmp.path());

        // Stub launcher: record the spawn, then stay alive like the real
        // child would.
        let script_dir = tmp.path().join("server").join("tau");
        std::fs::create_dir_all(&script_dir).unwrap();
        let marker = tmp.path().join("spawns");
        std::fs::write(
            script_dir.join("boot.sh"),
            format!("echo spawned >> {}\nsleep 30\n", marker.display()),
        )
        .unwrap();

        let mut boot_params = params();
        boot_params.log_path = tmp.path().join("tau.log");

        let pid_slot = Arc::new(PidSlot::new());
        let shutdown = CancellationToken::new();
        let tau = TauSupervisor::boot(
            &paths,
            Platform::detect(),
            boot_params,
            pid_slot.clone(),
            shutdown.clone(),
        )
        .await;
        assert!(tau.spawned().await);
        assert_eq!(wait_for_spawns(&marker, 1).await, 1);

        // The stub never reports a pid; hand one in so `kill` skips the
        // bounded reported-pid wait. The pid is long gone, which the
        // termination path must tolerate anyway.
        assert!(pid_slot.fulfill(i32::MAX - 2));

        // Two restart requests land while the first kill+respawn is
        // still in flight; the second must hit the re-entry guard.
        let first = {
            let tau = tau.clone();
            tokio::spawn(async move { tau.restart().await })
        };
        let second = {
            let tau = tau.clone();
            tokio::spawn(async move { tau.restart().await })
        };
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(wait_for_spawns(&marker, 2).await, 2);

        // Settle, then recount: a coalesced restart spawns exactly once.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(wait_for_spawns(&marker, 2).await, 2);

        shutdown.cancel();
        pid_slot.fulfill(i32::MAX - 2);
        tau.kill().await;
    }
}
