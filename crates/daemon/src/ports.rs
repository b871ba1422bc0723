//! Port discovery.
//!
//! The daemon and its children speak to each other over a fixed set of
//! named UDP channels. Each name resolves to a port under one of three
//! policies: a fixed default (probed, with dynamic fallback), a dynamic
//! pick from the ephemeral range, or a pair with an earlier name (the two
//! ends of one logical channel share a value by contract).

use std::collections::{BTreeMap, HashSet};
use std::net::{Ipv4Addr, UdpSocket};

use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

/// Bottom of the search range for dynamic ports.
pub const EPHEMERAL_LOW: u16 = 29153;
/// Dynamic searches seed somewhere in `[EPHEMERAL_LOW, SEED_HIGH]` so that
/// consecutive boots spread across the range instead of piling onto the
/// same ports.
const SEED_HIGH: u16 = 39152;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortPolicy {
    Fixed(u16),
    Dynamic,
    Paired(&'static str),
}

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free UDP port between {low} and 65535")]
    Exhausted { low: u16 },
    #[error("port {name} is paired with {partner}, which has not been resolved yet")]
    UnresolvedPartner { name: String, partner: String },
    #[error("port {name} is paired with {partner}, which is itself paired")]
    PairedWithPaired { name: String, partner: String },
}

/// Every port the system uses, fully resolved. Immutable once built.
#[derive(Debug, Clone)]
pub struct PortMap {
    pub spider_listen_to_gui: u16,
    pub gui_send_to_spider: u16,
    pub gui_listen_to_spider: u16,
    pub spider_send_to_gui: u16,
    pub scsynth: u16,
    pub scsynth_send: u16,
    pub osc_cues: u16,
    pub tau: u16,
    pub spider: u16,
    pub phx: u16,
    pub daemon: u16,
    pub spider_listen_to_tau: u16,
}

/// The ordered policy table. Order matters: a `Paired` entry may only
/// reference a name declared before it.
fn policy_table(phx_port: Option<u16>) -> Vec<(&'static str, PortPolicy)> {
    use PortPolicy::*;
    vec![
        ("spider-listen-to-gui", Dynamic),
        ("gui-send-to-spider", Paired("spider-listen-to-gui")),
        ("gui-listen-to-spider", Dynamic),
        ("spider-send-to-gui", Paired("gui-listen-to-spider")),
        ("scsynth", Dynamic),
        ("scsynth-send", Paired("scsynth")),
        ("osc-cues", Fixed(4560)),
        ("tau", Dynamic),
        ("spider", Dynamic),
        (
            "phx",
            match phx_port {
                Some(p) => Fixed(p),
                None => Dynamic,
            },
        ),
        ("daemon", Dynamic),
        ("spider-listen-to-tau", Dynamic),
    ]
}

/// Resolve the standard table. `phx_port` is the user-configured web port,
/// which is honored when free and degrades to dynamic like any fixed port.
pub fn allocate(phx_port: Option<u16>) -> Result<PortMap, PortError> {
    let table = policy_table(phx_port);
    let resolved = allocate_table(&table)?;
    let get = |name: &str| resolved[name];

    let map = PortMap {
        spider_listen_to_gui: get("spider-listen-to-gui"),
        gui_send_to_spider: get("gui-send-to-spider"),
        gui_listen_to_spider: get("gui-listen-to-spider"),
        spider_send_to_gui: get("spider-send-to-gui"),
        scsynth: get("scsynth"),
        scsynth_send: get("scsynth-send"),
        osc_cues: get("osc-cues"),
        tau: get("tau"),
        spider: get("spider"),
        phx: get("phx"),
        daemon: get("daemon"),
        spider_listen_to_tau: get("spider-listen-to-tau"),
    };
    info!(
        daemon = map.daemon,
        scsynth = map.scsynth,
        osc_cues = map.osc_cues,
        tau = map.tau,
        spider = map.spider,
        phx = map.phx,
        "ports resolved"
    );
    Ok(map)
}

/// Resolve an arbitrary policy table in declaration order.
fn allocate_table(
    table: &[(&'static str, PortPolicy)],
) -> Result<BTreeMap<&'static str, u16>, PortError> {
    let mut resolved: BTreeMap<&'static str, u16> = BTreeMap::new();
    let mut used: HashSet<u16> = HashSet::new();
    let mut cursor = rand::thread_rng().gen_range(EPHEMERAL_LOW..=SEED_HIGH) as u32;

    for &(name, policy) in table {
        let value = match policy {
            PortPolicy::Fixed(preferred) => {
                if !used.contains(&preferred) && udp_free(preferred) {
                    preferred
                } else {
                    warn!(
                        name,
                        port = preferred,
                        "fixed port unavailable; falling back to a dynamic port"
                    );
                    next_free(&mut cursor, &used)?
                }
            }
            PortPolicy::Dynamic => next_free(&mut cursor, &used)?,
            PortPolicy::Paired(partner) => {
                if let Some(&(_, partner_policy)) =
                    table.iter().find(|(other, _)| *other == partner)
                {
                    if matches!(partner_policy, PortPolicy::Paired(_)) {
                        return Err(PortError::PairedWithPaired {
                            name: name.to_string(),
                            partner: partner.to_string(),
                        });
                    }
                }
                *resolved
                    .get(partner)
                    .ok_or_else(|| PortError::UnresolvedPartner {
                        name: name.to_string(),
                        partner: partner.to_string(),
                    })?
            }
        };

        if !matches!(policy, PortPolicy::Paired(_)) {
            used.insert(value);
        }
        resolved.insert(name, value);
    }
    Ok(resolved)
}

/// Scan upward from the cursor for a bindable port. The cursor persists
/// across calls so every allocation continues where the last one stopped.
fn next_free(cursor: &mut u32, used: &HashSet<u16>) -> Result<u16, PortError> {
    while *cursor <= u16::MAX as u32 {
        let port = *cursor as u16;
        *cursor += 1;
        if used.contains(&port) {
            continue;
        }
        if udp_free(port) {
            return Ok(port);
        }
    }
    Err(PortError::Exhausted { low: EPHEMERAL_LOW })
}

/// A port is free iff a UDP socket can be bound to it on loopback. Any
/// bind failure counts as occupied.
fn udp_free(port: u16) -> bool {
    UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_satisfies_invariants() {
        let map = allocate(None).unwrap();
        let all = [
            map.spider_listen_to_gui,
            map.gui_send_to_spider,
            map.gui_listen_to_spider,
            map.spider_send_to_gui,
            map.scsynth,
            map.scsynth_send,
            map.osc_cues,
            map.tau,
            map.spider,
            map.phx,
            map.daemon,
            map.spider_listen_to_tau,
        ];
        for port in all {
            assert_ne!(port, 0);
        }

        // Pair partners share a value by design.
        assert_eq!(map.spider_listen_to_gui, map.gui_send_to_spider);
        assert_eq!(map.gui_listen_to_spider, map.spider_send_to_gui);
        assert_eq!(map.scsynth, map.scsynth_send);

        // Everything else is distinct.
        let distinct = [
            map.spider_listen_to_gui,
            map.gui_listen_to_spider,
            map.scsynth,
            map.osc_cues,
            map.tau,
            map.spider,
            map.phx,
            map.daemon,
            map.spider_listen_to_tau,
        ];
        let set: HashSet<u16> = distinct.iter().copied().collect();
        assert_eq!(set.len(), distinct.len());

        // Dynamic values stay in the ephemeral range.
        for port in [map.spider_listen_to_gui, map.tau, map.daemon] {
            assert!(port >= EPHEMERAL_LOW);
        }
    }

    #[test]
    fn paired_copies_partner_value() {
        let table = [
            ("left", PortPolicy::Dynamic),
            ("right", PortPolicy::Paired("left")),
        ];
        let resolved = allocate_table(&table).unwrap();
        assert_eq!(resolved["left"], resolved["right"]);
    }

    #[test]
    fn paired_with_paired_partner_is_rejected() {
        let table = [
            ("a", PortPolicy::Dynamic),
            ("b", PortPolicy::Paired("a")),
            ("c", PortPolicy::Paired("b")),
        ];
        let err = allocate_table(&table).unwrap_err();
        assert!(matches!(err, PortError::PairedWithPaired { .. }));
    }

    #[test]
    fn paired_with_later_partner_is_rejected() {
        let table = [
            ("b", PortPolicy::Paired("a")),
            ("a", PortPolicy::Dynamic),
        ];
        let err = allocate_table(&table).unwrap_err();
        assert!(matches!(err, PortError::UnresolvedPartner { .. }));
    }

    #[test]
    fn occupied_fixed_port_falls_back_to_dynamic() {
        // Grab a port from the OS and hold it so the fixed probe fails.
        let holder = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken = holder.local_addr().unwrap().port();

        let table = [("cues", PortPolicy::Fixed(taken))];
        let resolved = allocate_table(&table).unwrap();
        assert_ne!(resolved["cues"], taken);
        assert!(resolved["cues"] >= EPHEMERAL_LOW);
    }

    #[test]
    fn free_fixed_port_is_kept() {
        // Find a currently free port, release it, then ask for it as fixed.
        let probe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let table = [("cues", PortPolicy::Fixed(port))];
        let resolved = allocate_table(&table).unwrap();
        assert_eq!(resolved["cues"], port);
    }

    #[test]
    fn dynamic_values_are_distinct() {
        let table = [
            ("one", PortPolicy::Dynamic),
            ("two", PortPolicy::Dynamic),
            ("three", PortPolicy::Dynamic),
        ];
        let resolved = allocate_table(&table).unwrap();
        let set: HashSet<u16> = resolved.values().copied().collect();
        assert_eq!(set.len(), 3);
    }
}
