//! Configuration management for mujina-pool.
//!
//! Configuration is read from a TOML file. Every section and field has a
//! default, so an empty file (or none at all) yields a runnable pool on
//! regtest-friendly settings. [`Config::validate`] checks cross-field
//! consistency and converts the serde-facing structs into the typed
//! parameters the subsystems take.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use bitcoin::secp256k1::SecretKey;
use bitcoin::{Network, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::JobParams;
use crate::types::{Difficulty, ShareRate};
use crate::validator::{ValidationParams, VersionMaskPolicy};
use crate::vardiff::VardiffParams;

/// System-wide config file, used when no path is given and it exists.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mujina/pool.toml";

/// Main configuration structure for the pool.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub listen: ListenConfig,
    pub encrypted: EncryptedConfig,
    pub jobs: JobsConfig,
    pub validation: ValidationConfig,
    pub vardiff: VardiffConfig,
    pub upstream: UpstreamConfig,
    pub events: EventsConfig,
    pub tags: TagsConfig,
    pub api: ApiConfig,
}

/// Daemon process configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Log level when RUST_LOG is unset
    pub log_level: String,

    /// Identifies this pool instance in published events
    pub instance_id: String,

    /// bitcoin, testnet, signet, or regtest
    pub network: String,

    /// Upper bound on concurrent sessions
    pub max_sessions: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            instance_id: "mujina-pool".into(),
            network: "regtest".into(),
            max_sessions: 10_000,
        }
    }
}

/// Listening sockets.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenConfig {
    /// Stratum v1 listener
    pub plaintext: SocketAddr,

    /// Encrypted listener; needs the [encrypted] keys
    pub encrypted: Option<SocketAddr>,

    pub handshake_timeout_secs: u64,
    pub authorize_timeout_secs: u64,

    /// Longest accepted Stratum line in bytes
    pub max_line_length: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            plaintext: SocketAddr::from(([0, 0, 0, 0], 3333)),
            encrypted: None,
            handshake_timeout_secs: 10,
            authorize_timeout_secs: 30,
            max_line_length: crate::protocol::plaintext::DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl ListenConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn authorize_timeout(&self) -> Duration {
        Duration::from_secs(self.authorize_timeout_secs)
    }
}

/// Keys for the encrypted protocol.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncryptedConfig {
    /// Authority secret key, hex. Each connection's static key is signed
    /// with it; miners pin the matching x-only public key.
    pub authority_secret_key: Option<String>,

    /// Lifetime of the certificate signed at startup
    pub certificate_validity_secs: u64,

    /// Largest accepted ciphertext frame in bytes
    pub max_frame_len: usize,
}

impl Default for EncryptedConfig {
    fn default() -> Self {
        Self {
            authority_secret_key: None,
            certificate_validity_secs: 365 * 24 * 3600,
            max_frame_len: 8 * 1024 * 1024,
        }
    }
}

impl EncryptedConfig {
    /// Parsed authority key, if configured.
    pub fn authority_key(&self) -> Result<Option<SecretKey>> {
        self.authority_secret_key
            .as_deref()
            .map(parse_secret_key)
            .transpose()
    }
}

fn parse_secret_key(hex_str: &str) -> Result<SecretKey> {
    SecretKey::from_str(hex_str.trim())
        .map_err(|e| Error::Config(format!("encrypted: bad secret key: {}", e)))
}

/// Job construction and negotiation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobsConfig {
    /// Tag written into every coinbase scriptSig
    pub pool_tag: String,

    /// Bytes of extranonce2 the miner rolls
    pub extranonce2_size: usize,

    /// Re-fetch the template at least this often even without a new tip
    pub refresh_interval_secs: u64,

    /// Negotiated templates must have ntime within this many seconds of now
    pub max_time_drift_secs: u64,

    /// Block weight limit for negotiated templates
    pub max_block_weight: u64,

    /// Unspent negotiation tokens one session may hold
    pub max_tokens_per_session: usize,

    /// Negotiated templates kept per session; older ones are dropped
    pub max_commitments_per_session: usize,

    /// If set (hex script), negotiated coinbases must pay this script
    pub required_payout_script: Option<String>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            pool_tag: "/mujina/".into(),
            extranonce2_size: 8,
            refresh_interval_secs: 30,
            max_time_drift_secs: 7200,
            max_block_weight: 4_000_000,
            max_tokens_per_session: 8,
            max_commitments_per_session: 2,
            required_payout_script: None,
        }
    }
}

impl JobsConfig {
    pub fn required_payout_script(&self) -> Result<Option<ScriptBuf>> {
        self.required_payout_script
            .as_deref()
            .map(|s| {
                ScriptBuf::from_hex(s)
                    .map_err(|e| Error::Config(format!("jobs: bad required_payout_script: {}", e)))
            })
            .transpose()
    }
}

/// Share validation policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfig {
    /// How long after a new job a share for the previous one still counts
    pub stale_grace_ms: u64,

    /// Version bits miners may roll, hex
    pub version_mask: String,

    /// What to do with bits rolled outside the mask
    pub version_mask_policy: VersionMaskPolicy,

    /// Recent shares remembered per session for duplicate detection
    pub duplicate_window: usize,

    /// How far past the job's time a share's ntime may be
    pub max_ntime_ahead_secs: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            stale_grace_ms: 5000,
            version_mask: "1fffe000".into(),
            version_mask_policy: VersionMaskPolicy::Reject,
            duplicate_window: 4096,
            max_ntime_ahead_secs: 7200,
        }
    }
}

/// Vardiff control loop.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct VardiffConfig {
    /// Seconds between shares the controller aims for
    pub target_interval: ShareRate,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
    pub start_difficulty: f64,
    pub retarget_interval_secs: u64,
    pub dead_band: f64,
    pub max_step_up: f64,
    pub max_step_down: f64,
    pub dampening: f64,
    pub ema_alpha: f64,
    pub fast_ramp_threshold: f64,
    pub fast_ramp_cap: f64,
    pub min_stable_secs: u64,

    /// Lower difficulty after this many target intervals without a share
    pub idle_intervals: u32,

    pub snapshot_ttl_secs: u64,

    /// JSON file for stable values across restarts; in-memory if unset
    pub snapshot_file: Option<PathBuf>,
}

impl Default for VardiffConfig {
    fn default() -> Self {
        Self {
            target_interval: ShareRate::default(),
            min_difficulty: 0.001,
            max_difficulty: 1e15,
            start_difficulty: 1.0,
            retarget_interval_secs: 30,
            dead_band: 0.2,
            max_step_up: 2.0,
            max_step_down: 0.5,
            dampening: 0.5,
            ema_alpha: 0.3,
            fast_ramp_threshold: 4.0,
            fast_ramp_cap: 64.0,
            min_stable_secs: 300,
            idle_intervals: 6,
            snapshot_ttl_secs: 24 * 3600,
            snapshot_file: None,
        }
    }
}

/// bitcoind JSON-RPC.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,

    /// getblocktemplate polling interval
    pub poll_interval_ms: u64,

    pub request_timeout_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:18443".into(),
            username: None,
            password: None,
            poll_interval_ms: 1000,
            request_timeout_secs: 10,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Log,
    Tcp,
}

/// Event publication.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventsConfig {
    pub sink: SinkKind,

    /// host:port for the tcp sink
    pub tcp_addr: Option<String>,

    /// Facts buffered before new ones are dropped
    pub queue_capacity: usize,

    pub publish_timeout_ms: u64,

    /// Provenance tag on every envelope
    pub source: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::Log,
            tcp_addr: None,
            queue_capacity: 4096,
            publish_timeout_ms: 500,
            source: "mujina-pool".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TagSourceKind {
    Static,
    Http,
}

/// Per-identity coinbase tags.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TagsConfig {
    pub source: TagSourceKind,

    /// identity -> tag, for the static source
    pub static_tags: HashMap<String, String>,

    /// Base URL for the http source; GET {base}/{identity}
    pub http_base_url: Option<String>,

    pub refresh_interval_secs: u64,
    pub request_timeout_ms: u64,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            source: TagSourceKind::Static,
            static_tags: HashMap::new(),
            http_base_url: None,
            refresh_interval_secs: 300,
            request_timeout_ms: 2000,
        }
    }
}

/// API server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    /// Listen address; empty disables the API
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7785".into(),
        }
    }
}

impl Config {
    /// Load from `path`, else [`DEFAULT_CONFIG_PATH`] if present, else
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::load_from(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn network(&self) -> Result<Network> {
        Network::from_str(&self.daemon.network)
            .map_err(|_| Error::Config(format!("daemon: unknown network {:?}", self.daemon.network)))
    }

    pub fn validation_params(&self) -> Result<ValidationParams> {
        let v = &self.validation;
        let version_mask = u32::from_str_radix(v.version_mask.trim_start_matches("0x"), 16)
            .map_err(|_| Error::Config(format!("validation: bad version_mask {:?}", v.version_mask)))?;
        if v.duplicate_window == 0 {
            return Err(Error::Config("validation: duplicate_window must be > 0".into()));
        }
        Ok(ValidationParams {
            stale_grace: Duration::from_millis(v.stale_grace_ms),
            version_mask,
            version_mask_policy: v.version_mask_policy,
            extranonce2_size: self.jobs.extranonce2_size,
            max_ntime_ahead: v.max_ntime_ahead_secs,
            duplicate_window: v.duplicate_window,
        })
    }

    pub fn vardiff_params(&self) -> Result<VardiffParams> {
        let v = &self.vardiff;
        let diff = |name: &str, value: f64| {
            Difficulty::new(value)
                .ok_or_else(|| Error::Config(format!("vardiff: {} must be positive", name)))
        };
        let min = diff("min_difficulty", v.min_difficulty)?;
        let max = diff("max_difficulty", v.max_difficulty)?;
        let start = diff("start_difficulty", v.start_difficulty)?;
        if min > max {
            return Err(Error::Config("vardiff: min_difficulty exceeds max_difficulty".into()));
        }
        if start < min || start > max {
            return Err(Error::Config("vardiff: start_difficulty outside [min, max]".into()));
        }
        let unit = |name: &str, value: f64| {
            if value > 0.0 && value <= 1.0 {
                Ok(value)
            } else {
                Err(Error::Config(format!("vardiff: {} must be in (0, 1]", name)))
            }
        };
        let dead_band = unit("dead_band", v.dead_band)?;
        let dampening = unit("dampening", v.dampening)?;
        let ema_alpha = unit("ema_alpha", v.ema_alpha)?;
        let max_step_down = unit("max_step_down", v.max_step_down)?;
        if v.max_step_up < 1.0 {
            return Err(Error::Config("vardiff: max_step_up must be >= 1".into()));
        }
        if v.fast_ramp_threshold < 1.0 || v.fast_ramp_cap < 1.0 {
            return Err(Error::Config("vardiff: fast ramp parameters must be >= 1".into()));
        }
        if v.retarget_interval_secs == 0 {
            return Err(Error::Config("vardiff: retarget_interval_secs must be > 0".into()));
        }
        Ok(VardiffParams {
            target_interval: v.target_interval,
            min,
            max,
            start,
            retarget_interval: Duration::from_secs(v.retarget_interval_secs),
            dead_band,
            max_step_up: v.max_step_up,
            max_step_down,
            dampening,
            ema_alpha,
            fast_ramp_threshold: v.fast_ramp_threshold,
            fast_ramp_cap: v.fast_ramp_cap,
            min_stable: Duration::from_secs(v.min_stable_secs),
            idle_intervals: v.idle_intervals.max(1),
            snapshot_ttl: Duration::from_secs(v.snapshot_ttl_secs),
        })
    }

    pub fn job_params(&self) -> Result<JobParams> {
        let u = &self.upstream;
        if u.backoff_initial_ms == 0 || u.backoff_initial_ms > u.backoff_max_ms {
            return Err(Error::Config(
                "upstream: backoff_initial_ms must be in (0, backoff_max_ms]".into(),
            ));
        }
        Ok(JobParams {
            refresh_interval: Duration::from_secs(self.jobs.refresh_interval_secs),
            poll_interval: Duration::from_millis(u.poll_interval_ms),
            backoff_initial: Duration::from_millis(u.backoff_initial_ms),
            backoff_max: Duration::from_millis(u.backoff_max_ms),
            max_time_drift: Duration::from_secs(self.jobs.max_time_drift_secs),
            max_block_weight: self.jobs.max_block_weight,
            required_payout_script: self.jobs.required_payout_script()?,
            max_tokens_per_session: self.jobs.max_tokens_per_session,
            max_commitments_per_session: self.jobs.max_commitments_per_session,
        })
    }

    /// Check the whole configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        self.network()?;
        self.validation_params()?;
        self.vardiff_params()?;
        self.encrypted.authority_key()?;
        self.job_params()?;

        if self.daemon.max_sessions == 0 {
            return Err(Error::Config("daemon: max_sessions must be > 0".into()));
        }
        if !(1..=8).contains(&self.jobs.extranonce2_size) {
            return Err(Error::Config("jobs: extranonce2_size must be 1-8".into()));
        }
        if self.jobs.pool_tag.len() > crate::job::MAX_POOL_TAG_LEN {
            return Err(Error::Config(format!(
                "jobs: pool_tag longer than {} bytes",
                crate::job::MAX_POOL_TAG_LEN
            )));
        }
        if self.listen.encrypted.is_some() && self.encrypted.authority_key()?.is_none() {
            return Err(Error::Config(
                "listen.encrypted requires [encrypted] authority_secret_key".into(),
            ));
        }
        if self.events.sink == SinkKind::Tcp && self.events.tcp_addr.is_none() {
            return Err(Error::Config("events: tcp sink needs tcp_addr".into()));
        }
        if self.events.queue_capacity == 0 {
            return Err(Error::Config("events: queue_capacity must be > 0".into()));
        }
        if self.tags.source == TagSourceKind::Http && self.tags.http_base_url.is_none() {
            return Err(Error::Config("tags: http source needs http_base_url".into()));
        }
        if self.upstream.poll_interval_ms == 0 {
            return Err(Error::Config("upstream: poll_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_is_valid() {
        let config = Config::from_toml_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen.plaintext.port(), 3333);
        assert_eq!(config.validation.version_mask_policy, VersionMaskPolicy::Reject);
    }

    #[test]
    fn test_parse_full_sections() {
        let config = Config::from_toml_str(
            r#"
            [daemon]
            network = "signet"
            instance_id = "pool-a"

            [listen]
            plaintext = "127.0.0.1:4444"

            [validation]
            stale_grace_ms = 2000
            version_mask_policy = "ignore_rolled_bits"

            [vardiff]
            target_interval = 15
            min_difficulty = 1.0
            start_difficulty = 64.0

            [events]
            sink = "tcp"
            tcp_addr = "127.0.0.1:9000"

            [tags.static_tags]
            "bc1qexample" = "hello"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.network().unwrap(), Network::Signet);
        let params = config.validation_params().unwrap();
        assert_eq!(params.stale_grace, Duration::from_secs(2));
        assert_eq!(params.version_mask_policy, VersionMaskPolicy::IgnoreRolledBits);
        let vardiff = config.vardiff_params().unwrap();
        assert_eq!(vardiff.target_interval.as_interval(), Duration::from_secs(15));
        assert_eq!(vardiff.start.as_f64(), 64.0);
        assert_eq!(config.tags.static_tags["bc1qexample"], "hello");
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(Config::from_toml_str("[daemon]\nbogus = 1\n").is_err());
    }

    #[test]
    fn test_min_above_max_is_rejected() {
        let config = Config::from_toml_str(
            "[vardiff]\nmin_difficulty = 100.0\nmax_difficulty = 10.0\nstart_difficulty = 50.0\n",
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_encrypted_listener_requires_keys() {
        let config = Config::from_toml_str("[listen]\nencrypted = \"0.0.0.0:3334\"\n").unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_toml_str(
            r#"
            [listen]
            encrypted = "0.0.0.0:3334"
            [encrypted]
            authority_secret_key = "2222222222222222222222222222222222222222222222222222222222222222"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert!(config.encrypted.authority_key().unwrap().is_some());

        let config = Config::from_toml_str(
            "[encrypted]\nauthority_secret_key = \"not-hex\"\n",
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[jobs]\npool_tag = \"/solo/\"").unwrap();
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.jobs.pool_tag, "/solo/");
    }

    #[test]
    fn test_job_params_from_sections() {
        let config = Config::from_toml_str(
            "[jobs]\nrefresh_interval_secs = 10\n[upstream]\npoll_interval_ms = 250\n",
        )
        .unwrap();
        let params = config.job_params().unwrap();
        assert_eq!(params.refresh_interval, Duration::from_secs(10));
        assert_eq!(params.poll_interval, Duration::from_millis(250));
        assert!(params.required_payout_script.is_none());

        let config = Config::from_toml_str(
            "[upstream]\nbackoff_initial_ms = 5000\nbackoff_max_ms = 100\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = Config::from_toml_str(include_str!("../pool.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.api.listen, "127.0.0.1:7785");
    }

    #[test]
    fn test_bad_network() {
        let config = Config::from_toml_str("[daemon]\nnetwork = \"moonnet\"\n").unwrap();
        assert!(config.validate().is_err());
    }
}
