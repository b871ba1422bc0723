//! Language runtime server supervisor.
//!
//! The runtime server receives the music programs from the front-end and
//! drives the audio engine. It takes every port it talks on as positional
//! arguments after `-u`, followed by the control token.

use std::sync::Arc;

use tracing::info;

use crate::control::Token;
use crate::paths::Paths;
use crate::platform::Platform;
use crate::ports::PortMap;
use crate::process::ProcessHandle;

pub async fn boot(
    paths: &Paths,
    platform: Platform,
    ports: &PortMap,
    token: Token,
) -> Arc<ProcessHandle> {
    let script = paths.spider_server_script();
    let args = argv(&script.display().to_string(), ports, token);
    info!(script = %script.display(), "booting runtime server");
    let handle =
        ProcessHandle::spawn("spider", &paths.ruby(), &args, Some(paths.spider_log()), platform)
            .await;
    Arc::new(handle)
}

/// `<script> -u <listen-from-gui> <send-to-gui> <scsynth> <scsynth-send>
/// <osc-cues> <tau> <listen-from-tau> <token>`
fn argv(script: &str, ports: &PortMap, token: Token) -> Vec<String> {
    vec![
        script.to_string(),
        "-u".to_string(),
        ports.spider_listen_to_gui.to_string(),
        ports.spider_send_to_gui.to_string(),
        ports.scsynth.to_string(),
        ports.scsynth_send.to_string(),
        ports.osc_cues.to_string(),
        ports.tau.to_string(),
        ports.spider_listen_to_tau.to_string(),
        token.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports() -> PortMap {
        PortMap {
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
        }
    }

    #[test]
    fn argv_orders_ports_the_way_the_server_reads_them() {
        let args = argv("spider-server.rb", &ports(), Token(-99));
        assert_eq!(
            args,
            vec![
                "spider-server.rb",
                "-u",
                "31000",
                "31001",
                "31002",
                "31002",
                "4560",
                "31003",
                "31007",
                "-99",
            ]
        );
    }
}
