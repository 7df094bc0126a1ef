// Broker configuration. Defaults match every "bit-exact constant" named in
// the protocol spec; a TOML file at startup can override any subset of
// them. Grounded on the toml+serde daemon-config pattern (e.g.
// LINBIT-drbd-reactor's plugin configs), not a bespoke parser.

use std::fs;
use std::path::Path;

use serde::Deserialize;

fn default_reg_path() -> String {
    "/tmp/opbroker/register".to_owned()
}

fn default_req_path() -> String {
    "/tmp/opbroker/request".to_owned()
}

const fn default_tick_rate_hz() -> u32 {
    12
}

const fn default_max_accept() -> usize {
    100
}

const fn default_max_reg_handshakes() -> usize {
    25
}

const fn default_max_req_handshakes() -> usize {
    25
}

const fn default_max_hosts() -> usize {
    150
}

const fn default_max_hosts_per_uid() -> usize {
    5
}

const fn default_max_reg_handshakes_per_uid() -> usize {
    5
}

const fn default_caller_handshake_cap() -> usize {
    20
}

const fn default_reg_timeout_ms() -> u64 {
    5000
}

const fn default_req_timeout_ms() -> u64 {
    5000
}

const fn default_keepalive_interval_ms() -> u64 {
    5000
}

const fn default_worker_poll_interval_ms() -> u64 {
    50
}

const fn default_host_accept_batch() -> usize {
    10
}

const fn default_connect_poll_interval_ms() -> u64 {
    1
}

const fn default_shutdown_drain_ms() -> u64 {
    250
}

/// Runtime configuration for the broker daemon and, where relevant, the
/// host client.
///
/// `Config::default()` reproduces every default named in the protocol spec.
/// `Config::load` overlays a TOML file (missing keys fall back to defaults
/// via `#[serde(default = ...)]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Abstract path for the registration listening endpoint.
    pub reg_path: String,
    /// Abstract path for the request listening endpoint.
    pub req_path: String,
    /// Main loop tick frequency, in Hz.
    pub tick_rate_hz: u32,
    /// Max connections accepted per listening socket per tick.
    pub max_accept_per_tick: usize,
    /// Capacity of the pending-registration handshake slot array.
    pub max_reg_handshakes: usize,
    /// Capacity of the pending-request handshake slot array.
    pub max_req_handshakes: usize,
    /// Maximum number of confirmed + unconfirmed hosts in the roster.
    pub max_hosts: usize,
    /// Per-uid host quota (root is exempt).
    pub max_hosts_per_uid: usize,
    /// Per-uid limit on simultaneous pending registration handshakes.
    pub max_reg_handshakes_per_uid: usize,
    /// Bound on a host's caller-handshake queue.
    pub caller_handshake_cap: usize,
    /// Pending-registration timeout, in milliseconds.
    pub reg_timeout_ms: u64,
    /// Pending-request timeout, in milliseconds.
    pub req_timeout_ms: u64,
    /// Minimum interval between host keepalive ('K') sends.
    pub keepalive_interval_ms: u64,
    /// Worker back-off interval while polling for the relayed FD.
    pub worker_poll_interval_ms: u64,
    /// Max single-byte reads a host client drains from its broker socket
    /// per `Accept` call.
    pub host_accept_batch: usize,
    /// Back-off between polls while a peer's `Connect` or a host's
    /// `Register` waits for a relayed file descriptor.
    pub connect_poll_interval_ms: u64,
    /// Optional host watchdog: evict a host whose last keepalive is older
    /// than this many milliseconds. `None` (the default) disables eviction,
    /// matching the original's "no timeout-based host eviction is
    /// mandatory" — see SPEC_FULL.md open question (b).
    pub host_idle_timeout_ms: Option<u64>,
    /// How long `Broker::run`'s graceful-shutdown drain waits after
    /// notifying hosts (best-effort `'Q'` byte) before the process exits.
    pub shutdown_drain_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reg_path: default_reg_path(),
            req_path: default_req_path(),
            tick_rate_hz: default_tick_rate_hz(),
            max_accept_per_tick: default_max_accept(),
            max_reg_handshakes: default_max_reg_handshakes(),
            max_req_handshakes: default_max_req_handshakes(),
            max_hosts: default_max_hosts(),
            max_hosts_per_uid: default_max_hosts_per_uid(),
            max_reg_handshakes_per_uid: default_max_reg_handshakes_per_uid(),
            caller_handshake_cap: default_caller_handshake_cap(),
            reg_timeout_ms: default_reg_timeout_ms(),
            req_timeout_ms: default_req_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            worker_poll_interval_ms: default_worker_poll_interval_ms(),
            host_accept_batch: default_host_accept_batch(),
            connect_poll_interval_ms: default_connect_poll_interval_ms(),
            host_idle_timeout_ms: None,
            shutdown_drain_ms: default_shutdown_drain_ms(),
        }
    }
}

impl Config {
    /// Load a TOML config file, overlaying it on top of the defaults.
    /// A missing file is not an error — callers that want to require a
    /// config file should check existence themselves.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&text)?;
        Ok(cfg)
    }

    /// Per-tick sleep duration derived from `tick_rate_hz`.
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.tick_rate_hz.max(1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.tick_rate_hz, 12);
        assert_eq!(cfg.max_accept_per_tick, 100);
        assert_eq!(cfg.max_reg_handshakes, 25);
        assert_eq!(cfg.max_req_handshakes, 25);
        assert_eq!(cfg.max_hosts, 150);
        assert_eq!(cfg.max_hosts_per_uid, 5);
        assert_eq!(cfg.caller_handshake_cap, 20);
        assert_eq!(cfg.reg_timeout_ms, 5000);
        assert_eq!(cfg.req_timeout_ms, 5000);
        assert_eq!(cfg.host_idle_timeout_ms, None);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let cfg = Config::load("/nonexistent/opbroker.toml").unwrap();
        assert_eq!(cfg.tick_rate_hz, 12);
    }

    #[test]
    fn load_overlays_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opbroker.toml");
        fs::write(&path, "tick_rate_hz = 30\nmax_hosts = 64\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.tick_rate_hz, 30);
        assert_eq!(cfg.max_hosts, 64);
        // untouched fields keep their defaults
        assert_eq!(cfg.reg_timeout_ms, 5000);
    }
}
