//! Audio engine supervisor.
//!
//! On Linux-family systems the engine needs a JACK server: the supervisor
//! probes for one and, failing that, starts its own with the dummy
//! driver. Five seconds after the engine comes up, loopback modules and
//! port connections are wired so the engine reaches the system I/O. All
//! of the wiring is advisory; a desktop without PulseAudio just logs and
//! moves on.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AudioArgs;
use crate::paths::Paths;
use crate::platform::Platform;
use crate::process::ProcessHandle;

const JACK_BOOT_ARGS: [&str; 7] = ["-T", "-d", "dummy", "-r", "48000", "-p", "1024"];
const WIRING_DELAY: Duration = Duration::from_secs(5);

/// Connect the engine to system I/O when JACK was already running.
const JACK_WIRING: [&str; 4] = [
    "jack_connect SuperCollider:out_1 system:playback_1",
    "jack_connect SuperCollider:out_2 system:playback_2",
    "jack_connect system:capture_1 SuperCollider:in_1",
    "jack_connect system:capture_2 SuperCollider:in_2",
];

/// When the daemon booted JACK itself there is no hardware behind it;
/// route through PulseAudio loopback modules instead.
const PULSE_JACK_WIRING: [&str; 6] = [
    "pactl load-module module-jack-sink channels=2",
    "pactl load-module module-jack-source channels=2",
    "jack_connect SuperCollider:out_1 'Jack sink:playback_1'",
    "jack_connect SuperCollider:out_2 'Jack sink:playback_2'",
    "jack_connect 'Jack source:capture_1' SuperCollider:in_1",
    "jack_connect 'Jack source:capture_2' SuperCollider:in_2",
];

#[derive(Clone)]
pub struct ScsynthSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    engine: ProcessHandle,
    jackd: Mutex<Option<ProcessHandle>>,
}

impl ScsynthSupervisor {
    pub async fn boot(
        paths: &Paths,
        platform: Platform,
        audio: AudioArgs,
        shutdown: CancellationToken,
    ) -> Self {
        let mut jackd = None;
        let mut booted_jack = false;
        if platform.wants_jack() {
            if jack_running().await {
                info!("jack server already running");
            } else {
                info!("no jack server found; starting one with the dummy driver");
                let args: Vec<String> = JACK_BOOT_ARGS.iter().map(|s| s.to_string()).collect();
                let handle = ProcessHandle::spawn(
                    "jackd",
                    std::path::Path::new("jackd"),
                    &args,
                    None,
                    platform,
                )
                .await;
                if handle.spawned() {
                    booted_jack = true;
                    jackd = Some(handle);
                    // Give the server a moment to open its sockets.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }

        info!(args = ?audio.args, "booting audio engine");
        let engine = ProcessHandle::spawn(
            "scsynth",
            &paths.scsynth(),
            &audio.args,
            Some(paths.scsynth_log()),
            platform,
        )
        .await;

        if platform.wants_jack() && engine.spawned() {
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(WIRING_DELAY) => wire_audio(booted_jack).await,
                    _ = shutdown.cancelled() => {}
                }
            });
        }

        Self {
            inner: Arc::new(Inner {
                engine,
                jackd: Mutex::new(jackd),
            }),
        }
    }

    pub fn spawned(&self) -> bool {
        self.inner.engine.spawned()
    }

    pub async fn kill(&self) {
        self.inner.engine.kill().await;
        if let Some(jackd) = self.inner.jackd.lock().await.take() {
            jackd.kill().await;
        }
    }
}

async fn jack_running() -> bool {
    match tokio::process::Command::new("jack_wait").arg("-c").output().await {
        Ok(output) => output.status.success(),
        Err(e) => {
            debug!(error = %e, "jack_wait not available; assuming no jack server");
            false
        }
    }
}

async fn wire_audio(daemon_started_jack: bool) {
    let script: &[&str] = if daemon_started_jack {
        &PULSE_JACK_WIRING
    } else {
        &JACK_WIRING
    };
    for &command in script {
        match tokio::process::Command::new("sh")
            .args(["-c", command])
            .output()
            .await
        {
            Ok(output) if output.status.success() => debug!(command, "audio wiring ok"),
            Ok(output) => debug!(command, code = output.status.code(), "audio wiring command failed"),
            Err(e) => warn!(command, error = %e, "cannot run audio wiring command"),
        }
    }
    info!("audio wiring pass finished");
}
