//! User configuration.
//!
//! Two optional TOML files live in the config directory. Both are parsed
//! tolerantly: a missing or broken file logs a warning and yields
//! defaults, unknown keys are skipped, out-of-range values are ignored.
//! Nothing in here can fail the boot.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use tracing::{debug, warn};

use crate::platform::Platform;

const AUDIO_SETTINGS_FILE: &str = "audio-settings.toml";
const RUNTIME_SETTINGS_FILE: &str = "runtime-settings.toml";

/// Human-readable audio keys and the engine flags they become.
const KEY_FLAGS: [(&str, &str); 6] = [
    ("sound_card_name", "-H"),
    ("sound_card_sample_rate", "-S"),
    ("sound_card_buffer_size", "-Z"),
    ("num_inputs", "-i"),
    ("num_outputs", "-o"),
    ("block_size", "-z"),
];

/// Keys consumed by the loader itself rather than converted to flags.
const META_KEYS: [&str; 4] = [
    "enable_inputs",
    "enable_outputs",
    "other_scsynth_options",
    "scsynth_override",
];

const ENGINE_DEFAULTS: [(&str, &str); 9] = [
    ("-a", "1024"),
    ("-m", "131072"),
    ("-D", "0"),
    ("-R", "0"),
    ("-l", "1"),
    ("-i", "16"),
    ("-o", "16"),
    ("-b", "4096"),
    ("-B", "127.0.0.1"),
];

/// Final audio engine command line fragment, `-u <port>` included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioArgs {
    pub args: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeEnv {
    Dev,
    Prod,
}

impl fmt::Display for RuntimeEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeEnv::Dev => write!(f, "dev"),
            RuntimeEnv::Prod => write!(f, "prod"),
        }
    }
}

/// Settings for the BEAM IO server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub env: RuntimeEnv,
    pub phx_port: Option<u16>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            env: RuntimeEnv::Prod,
            phx_port: None,
        }
    }
}

pub fn load_audio(config_dir: &Path, platform: Platform, scsynth_port: u16) -> AudioArgs {
    let table = read_table(&config_dir.join(AUDIO_SETTINGS_FILE)).unwrap_or_default();
    audio_args(&table, platform, scsynth_port)
}

fn audio_args(table: &toml::Table, platform: Platform, scsynth_port: u16) -> AudioArgs {
    // Full-replacement hatch: a non-empty override wins outright.
    if let Some(raw) = table.get("scsynth_override").and_then(|v| v.as_str()) {
        let raw = raw.trim();
        if !raw.is_empty() {
            warn!("scsynth_override is set; all other audio settings are ignored");
            let args = shlex::split(raw).unwrap_or_else(|| {
                warn!("scsynth_override has unbalanced quoting; dropping it");
                Vec::new()
            });
            return AudioArgs { args };
        }
    }

    let mut opts: BTreeMap<String, String> = BTreeMap::new();
    opts.insert("-u".to_string(), scsynth_port.to_string());
    for (flag, value) in ENGINE_DEFAULTS {
        opts.insert(flag.to_string(), value.to_string());
    }
    for (flag, value) in os_defaults(platform) {
        opts.insert(flag.to_string(), value.to_string());
    }

    for (key, flag) in KEY_FLAGS {
        if let Some(value) = table.get(key).and_then(flag_value) {
            opts.insert(flag.to_string(), value);
        }
    }
    for key in table.keys() {
        let known =
            KEY_FLAGS.iter().any(|(k, _)| *k == key.as_str()) || META_KEYS.contains(&key.as_str());
        if !known {
            debug!(key, "ignoring unknown audio setting");
        }
    }

    let mut trailing = Vec::new();
    if let Some(extra) = table.get("other_scsynth_options").and_then(|v| v.as_str()) {
        match shlex::split(extra) {
            Some(tokens) => merge_tokens(&mut opts, &mut trailing, tokens),
            None => warn!("other_scsynth_options has unbalanced quoting; dropping it"),
        }
    }

    if toggle(table, "enable_inputs") == Some(false) {
        opts.insert("-i".to_string(), "0".to_string());
    }
    if toggle(table, "enable_outputs") == Some(false) {
        opts.insert("-o".to_string(), "0".to_string());
    }

    let mut args = Vec::new();
    for (flag, value) in &opts {
        args.push(flag.clone());
        if !value.is_empty() {
            args.push(value.clone());
        }
    }
    args.extend(trailing);
    AudioArgs { args }
}

fn os_defaults(platform: Platform) -> &'static [(&'static str, &'static str)] {
    match platform {
        // Small boards cannot afford the desktop real-time memory pool.
        Platform::UnixArmEmbedded => &[("-m", "65536")],
        Platform::UnixDesktop | Platform::Windows => &[],
    }
}

/// Fold shell-split extra tokens into the option map. A `-flag` token
/// captures the following token as its value unless that token is itself
/// a flag; anything that is not a flag and not captured is passed through
/// verbatim at the end of the command line.
fn merge_tokens(
    opts: &mut BTreeMap<String, String>,
    trailing: &mut Vec<String>,
    tokens: Vec<String>,
) {
    let is_flag = |t: &str| {
        t.len() > 1
            && t.starts_with('-')
            && !t.chars().nth(1).is_some_and(|c| c.is_ascii_digit())
    };

    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        if is_flag(&token) {
            let value = match iter.peek() {
                Some(next) if !is_flag(next) => iter.next().unwrap_or_default(),
                _ => String::new(),
            };
            opts.insert(token, value);
        } else {
            trailing.push(token);
        }
    }
}

fn flag_value(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.trim().to_string()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(if *b { "1" } else { "0" }.to_string()),
        _ => None,
    }
}

fn toggle(table: &toml::Table, key: &str) -> Option<bool> {
    match table.get(key)? {
        toml::Value::Boolean(b) => Some(*b),
        toml::Value::Integer(i) => Some(*i != 0),
        _ => None,
    }
}

pub fn load_runtime(config_dir: &Path) -> RuntimeConfig {
    let table = read_table(&config_dir.join(RUNTIME_SETTINGS_FILE)).unwrap_or_default();
    let mut config = runtime_config(&table);

    // The environment variable outranks the file.
    if let Ok(tag) = std::env::var("STUDIO_ENV") {
        match parse_env(&tag) {
            Some(env) => config.env = env,
            None => warn!(value = %tag, "STUDIO_ENV must be dev or prod; keeping {}", config.env),
        }
    }
    config
}

fn runtime_config(table: &toml::Table) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();

    if let Some(raw) = table.get("env").and_then(|v| v.as_str()) {
        match parse_env(raw) {
            Some(env) => config.env = env,
            None => warn!(value = raw, "runtime env must be dev or prod; keeping {}", config.env),
        }
    }

    if let Some(value) = table.get("phx_port") {
        match value.as_integer() {
            Some(port) if port > 0 && port <= u16::MAX as i64 => {
                config.phx_port = Some(port as u16);
            }
            _ => warn!("phx_port must be a positive integer; ignoring it"),
        }
    }
    config
}

fn parse_env(raw: &str) -> Option<RuntimeEnv> {
    match raw.trim() {
        "dev" => Some(RuntimeEnv::Dev),
        "prod" => Some(RuntimeEnv::Prod),
        _ => None,
    }
}

/// Read and parse a TOML file, tolerating absence and parse errors.
fn read_table(path: &Path) -> Option<toml::Table> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(file = %path.display(), "config file absent; using defaults");
            return None;
        }
        Err(e) => {
            warn!(file = %path.display(), error = %e, "cannot read config file; using defaults");
            return None;
        }
    };
    match contents.parse::<toml::Table>() {
        Ok(table) => Some(table),
        Err(e) => {
            warn!(file = %path.display(), error = %e, "config file failed to parse; using defaults");
            None
        }
    }
}
