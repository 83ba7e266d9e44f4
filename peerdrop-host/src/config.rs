//! Load config from file and environment, mirroring the teacher's
//! `pea-linux/src/config.rs` merge order: defaults, then config file, then
//! environment variables.

use std::path::PathBuf;

use serde::Deserialize;

/// Daemon configuration. File: `~/.config/peerdrop/config.toml` or
/// `/etc/peerdrop/config.toml`. Env overrides: `PEERDROP_LISTEN_PORT`,
/// `PEERDROP_CONTENT_DIR`, `PEERDROP_CHUNK_SIZE`, `PEERDROP_MAX_UNCHOKED`,
/// `PEERDROP_CHOKE_INTERVAL_SECS`, `PEERDROP_SUPER_SEED`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Reliable-stream listen port (default 4949).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Directory served by the default content provider.
    #[serde(default = "default_content_dir")]
    pub content_dir: PathBuf,
    /// Chunk size in bytes used when serving from `content_dir`.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Enable the choking policy (spec §4.10). Off by default: a small swarm
    /// gains nothing from withholding chunks and it only adds latency.
    #[serde(default)]
    pub choking_enabled: bool,
    #[serde(default = "default_max_unchoked")]
    pub max_unchoked: usize,
    #[serde(default = "default_choke_interval_secs")]
    pub choke_interval_secs: u64,
    #[serde(default)]
    pub super_seed: bool,
}

fn default_listen_port() -> u16 {
    4949
}
fn default_content_dir() -> PathBuf {
    PathBuf::from("./peerdrop-content")
}
fn default_chunk_size() -> u64 {
    256 * 1024
}
fn default_max_unchoked() -> usize {
    4
}
fn default_choke_interval_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            content_dir: default_content_dir(),
            chunk_size: default_chunk_size(),
            choking_enabled: false,
            max_unchoked: default_max_unchoked(),
            choke_interval_secs: default_choke_interval_secs(),
            super_seed: false,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("PEERDROP_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Ok(s) = std::env::var("PEERDROP_CONTENT_DIR") {
        c.content_dir = PathBuf::from(s);
    }
    if let Ok(s) = std::env::var("PEERDROP_CHUNK_SIZE") {
        if let Ok(n) = s.parse::<u64>() {
            c.chunk_size = n;
        }
    }
    if let Ok(s) = std::env::var("PEERDROP_MAX_UNCHOKED") {
        if let Ok(n) = s.parse::<usize>() {
            c.max_unchoked = n;
        }
    }
    if let Ok(s) = std::env::var("PEERDROP_CHOKE_INTERVAL_SECS") {
        if let Ok(n) = s.parse::<u64>() {
            c.choke_interval_secs = n;
        }
    }
    if let Ok(s) = std::env::var("PEERDROP_SUPER_SEED") {
        c.super_seed = s == "1" || s.eq_ignore_ascii_case("true");
        c.choking_enabled = true;
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerdrop/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerdrop/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.listen_port, 4949);
        assert_eq!(c.max_unchoked, 4);
        assert!(!c.choking_enabled);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let c: Config = toml::from_str("listen_port = 6000\n").unwrap();
        assert_eq!(c.listen_port, 6000);
        assert_eq!(c.chunk_size, default_chunk_size());
    }
}
