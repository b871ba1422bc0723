//! Boot daemon for the studio live-coding environment.
//!
//! Resolves ports, reads user config, launches the audio engine, the
//! language runtime server and the BEAM IO server, announces a one-line
//! handshake on stdout, and guarantees every child terminates when the
//! front-end goes away or the daemon exits for any reason.

use std::io::Write as _;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use crate::control::{Handlers, PidSlot, Token};
use crate::exit::SafeExit;
use crate::killswitch::{KillSwitch, Timings};
use crate::paths::Paths;
use crate::platform::Platform;
use crate::ports::PortMap;
use crate::tau::{TauBootParams, TauSupervisor};

mod config;
mod control;
mod exit;
mod killswitch;
mod logrotate;
mod paths;
mod platform;
mod ports;
mod process;
mod scsynth;
mod spider;
mod tau;

#[tokio::main]
async fn main() {
    let paths = match Paths::resolve() {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("studio-daemon: {e:#}");
            std::process::exit(1);
        }
    };

    let log_guard = init_tracing(&paths);
    logrotate::rotate(&paths.log_dir());

    let safe_exit = Arc::new(SafeExit::new());
    install_panic_hook(safe_exit.shutdown_token());
    spawn_signal_listener(safe_exit.shutdown_token());

    // The daemon proper runs in its own task so that even a panic inside
    // it funnels back here and the cleanup still runs.
    let code = match tokio::spawn(run(paths, safe_exit.clone())).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "daemon task aborted");
            1
        }
    };

    safe_exit.cleanup().await;
    info!(code, "exiting");
    drop(log_guard);
    std::process::exit(code);
}

async fn run(paths: Paths, safe_exit: Arc<SafeExit>) -> i32 {
    let platform = Platform::detect();
    let shutdown = safe_exit.shutdown_token();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        ?platform,
        "studio daemon starting"
    );

    let runtime_config = config::load_runtime(&paths.config_dir());

    let ports = match ports::allocate(runtime_config.phx_port) {
        Ok(ports) => ports,
        Err(e) => return fatal("port allocation failed", &e.into(), &safe_exit),
    };
    let token = Token::generate();

    let kill_switch = KillSwitch::arm(Timings::default(), shutdown.clone());

    // The control server must be listening before the IO server boots:
    // the child reports its pid over this channel.
    let control_socket = match control::bind(ports.daemon).await {
        Ok(socket) => socket,
        Err(e) => return fatal("cannot bind the control port", &e, &safe_exit),
    };
    let pid_slot = Arc::new(PidSlot::new());
    let (restart_tx, mut restart_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    control::spawn(
        control_socket,
        Handlers {
            token,
            keep_alive: kill_switch.sender(),
            restart_tau: restart_tx,
            pid_slot: pid_slot.clone(),
            shutdown: shutdown.clone(),
        },
    );

    let tau_params = TauBootParams::from_ports(&ports, paths.tau_log(), token, runtime_config.env);
    let tau = TauSupervisor::boot(&paths, platform, tau_params, pid_slot.clone(), shutdown.clone())
        .await;
    if !tau.spawned().await {
        error!("io server could not be spawned");
        safe_exit.request_exit();
        return 1;
    }
    {
        let tau = tau.clone();
        safe_exit.register("tau", move || {
            let tau = tau.clone();
            async move { tau.kill().await }
        })
        .await;
    }
    match tau.wait_for_pid().await {
        Some(pid) => info!(pid, "io server is up"),
        None => warn!("io server did not report its pid in time; continuing without it"),
    }

    // Restart requests from the control channel. Each request gets its
    // own task: awaiting `restart()` inline would serialize rapid
    // requests into back-to-back respawns instead of letting them hit
    // the supervisor's re-entry guard and collapse.
    {
        let tau = tau.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    request = restart_rx.recv() => match request {
                        Some(()) => {
                            let tau = tau.clone();
                            tokio::spawn(async move { tau.restart().await });
                        }
                        None => break,
                    }
                }
            }
        });
    }

    // The handshake is the only machine-readable stdout line; the parent
    // blocks on it, so flush immediately.
    println!("{}", handshake_line(&ports, token));
    let _ = std::io::stdout().flush();

    let audio = config::load_audio(&paths.config_dir(), platform, ports.scsynth);
    let engine =
        scsynth::ScsynthSupervisor::boot(&paths, platform, audio, shutdown.clone()).await;
    {
        let engine = engine.clone();
        safe_exit.register("scsynth", move || {
            let engine = engine.clone();
            async move { engine.kill().await }
        })
        .await;
    }

    let runtime = spider::boot(&paths, platform, &ports, token).await;
    {
        let runtime = runtime.clone();
        safe_exit.register("spider", move || {
            let runtime = runtime.clone();
            async move { runtime.kill().await }
        })
        .await;
    }

    info!("boot complete; waiting for exit");
    shutdown.cancelled().await;
    info!("exit requested");
    0
}

/// `daemon gui-listen gui-send scsynth osc-cues tau phx token`, the order
/// the front-end parses.
fn handshake_line(ports: &PortMap, token: Token) -> String {
    format!(
        "{} {} {} {} {} {} {} {}",
        ports.daemon,
        ports.gui_listen_to_spider,
        ports.gui_send_to_spider,
        ports.scsynth,
        ports.osc_cues,
        ports.tau,
        ports.phx,
        token
    )
}

fn fatal(context: &str, err: &anyhow::Error, safe_exit: &SafeExit) -> i32 {
    error!(error = %format_args!("{err:#}"), "{context}");
    safe_exit.request_exit();
    1
}

/// Console layer on stderr (stdout belongs to the handshake) plus a plain
/// file layer on `daemon.log`. If the log file cannot be opened the
/// daemon reports it once and carries on with stderr only.
fn init_tracing(paths: &Paths) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.daemon_log());
    let (file_layer, guard) = match file {
        Ok(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!(
                "studio-daemon: cannot open {}: {e}; logging to stderr only",
                paths.daemon_log().display()
            );
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(file_layer)
        .init();
    guard
}

fn install_panic_hook(shutdown: CancellationToken) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        error!("panic; requesting shutdown");
        shutdown.cancel();
    }));
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("interrupt received");
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = term.recv() => info!("termination signal received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received");
        }
        shutdown.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_is_eight_space_separated_fields() {
        let ports = PortMap {
            spider_listen_to_gui: 31000,
            gui_send_to_spider: 31000,
            gui_listen_to_spider: 31001,
            spider_send_to_gui: 31001,
            scsynth: 31002,
            scsynth_send: 31002,
            osc_cues: 4560,
            tau: 31003,
            spider: 31004,
            phx: 31005,
            daemon: 31006,
            spider_listen_to_tau: 31007,
        };
        let line = handshake_line(&ports, Token(-1234567));
        let fields: Vec<&str> = line.split(' ').collect();
        assert_eq!(
            fields,
            vec![
                "31006", "31001", "31000", "31002", "4560", "31003", "31005", "-1234567",
            ]
        );
        // Every field parses as a signed decimal.
        for field in fields {
            field.parse::<i64>().unwrap();
        }
    }
}
