//! UDP control surface.
//!
//! A tiny OSC method table on the loopback `daemon` port. Every method is
//! gated by the per-boot token; mismatches and malformed datagrams are
//! logged and dropped, and no responses are ever sent. Handlers hold
//! channel senders back into the daemon, never owning references.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rosc::{OscMessage, OscPacket, OscType};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-boot authenticator for control messages. Chosen uniformly at
/// random, immutable for the process lifetime, printed on the handshake
/// line as a signed 32-bit decimal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token(pub i32);

impl Token {
    pub fn generate() -> Self {
        Token(rand::thread_rng().gen_range(-2147483647..=2147483647))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Single-assignment slot for the IO server's self-reported OS pid.
/// Filled at most once per boot; a second fulfilment is dropped.
pub struct PidSlot {
    tx: watch::Sender<Option<i32>>,
}

impl PidSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Returns true iff this call filled the slot.
    pub fn fulfill(&self, pid: i32) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(pid);
                true
            } else {
                false
            }
        })
    }

    pub fn get(&self) -> Option<i32> {
        *self.tx.borrow()
    }

    /// Empty the slot for the next boot of the child.
    pub fn reset(&self) {
        self.tx.send_replace(None);
    }

    /// Wait up to `timeout` for the slot to fill.
    pub async fn wait(&self, timeout: Duration) -> Option<i32> {
        let mut rx = self.tx.subscribe();
        let filled = async {
            loop {
                if let Some(pid) = *rx.borrow_and_update() {
                    return pid;
                }
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::time::timeout(timeout, filled).await.ok()
    }
}

/// Where each authenticated method lands.
pub struct Handlers {
    pub token: Token,
    pub keep_alive: mpsc::UnboundedSender<()>,
    pub restart_tau: mpsc::UnboundedSender<()>,
    pub pid_slot: Arc<PidSlot>,
    pub shutdown: CancellationToken,
}

/// Bind the control socket. Split from [`spawn`] so the orchestrator can
/// treat a bind failure as fatal before any child boots.
pub async fn bind(port: u16) -> anyhow::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).await?;
    info!(port, "control server listening");
    Ok(socket)
}

pub fn spawn(socket: UdpSocket, handlers: Handlers) {
    tokio::spawn(async move {
        let shutdown = handlers.shutdown.clone();
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, _from)) => handle_datagram(&buf[..len], &handlers),
                    Err(e) => {
                        warn!(error = %e, "control socket receive failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        debug!("control server stopped");
    });
}

fn handle_datagram(datagram: &[u8], handlers: &Handlers) {
    match rosc::decoder::decode_udp(datagram) {
        Ok((_rest, packet)) => dispatch(packet, handlers),
        Err(e) => warn!(error = %e, "malformed control datagram dropped"),
    }
}

fn dispatch(packet: OscPacket, handlers: &Handlers) {
    match packet {
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                dispatch(inner, handlers);
            }
        }
        OscPacket::Message(message) => dispatch_message(message, handlers),
    }
}

fn dispatch_message(message: OscMessage, handlers: &Handlers) {
    if !token_matches(&message, handlers.token) {
        warn!(addr = %message.addr, "control message with mismatched token dropped");
        return;
    }
    match message.addr.as_str() {
        "/daemon/keep-alive" => {
            let _ = handlers.keep_alive.send(());
        }
        "/daemon/exit" => {
            info!("exit requested over the control channel");
            handlers.shutdown.cancel();
        }
        "/daemon/restart-tau" => {
            info!("io server restart requested over the control channel");
            let _ = handlers.restart_tau.send(());
        }
        "/tau/pid" => match int_arg(&message, 1) {
            Some(pid) => {
                if handlers.pid_slot.fulfill(pid) {
                    info!(pid, "io server reported its pid");
                } else {
                    debug!(pid, "pid already recorded; report dropped");
                }
            }
            None => warn!("pid report without a pid argument dropped"),
        },
        other => warn!(addr = other, "unknown control address"),
    }
}

fn token_matches(message: &OscMessage, token: Token) -> bool {
    int_arg(message, 0) == Some(token.0)
}

fn int_arg(message: &OscMessage, index: usize) -> Option<i32> {
    match message.args.get(index)? {
        OscType::Int(value) => Some(*value),
        OscType::Long(value) => i32::try_from(*value).ok(),
        _ => None,
    }
}
