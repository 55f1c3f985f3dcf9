//! Load config from file and environment. Command-line flags are applied on
//! top by `main`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use dbs_core::protocol::{Version, MAX_REPLICATION_DEGREE};
use dbs_core::RetryPolicy;
use serde::Deserialize;

/// Peer configuration. File: `--config <path>`, ~/.config/dbs/config.toml or
/// /etc/dbs/config.toml. Env overrides: DBS_PEER_ID, DBS_MC, DBS_MDB, DBS_MDR,
/// DBS_STORAGE_DIR, DBS_CAPACITY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_peer_id")]
    pub peer_id: u32,
    /// Version written in outgoing headers, `d.d`.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Control channel, `address:port`.
    #[serde(default = "default_mc")]
    pub mc: String,
    /// Backup data channel.
    #[serde(default = "default_mdb")]
    pub mdb: String,
    /// Restore data channel.
    #[serde(default = "default_mdr")]
    pub mdr: String,
    /// Replicas, restored files and metadata.json. Defaults to `peer<id>`.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    /// Bytes available for replicas of other peers' chunks.
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    #[serde(default = "default_pool_workers")]
    pub pool_workers: usize,
    #[serde(default = "default_pool_queue")]
    pub pool_queue: usize,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_max_reply_delay_ms")]
    pub max_reply_delay_ms: u64,
    /// DELETE has no acknowledgement, so it is repeated.
    #[serde(default = "default_delete_repeats")]
    pub delete_repeats: u32,
    /// Chunks of one file backed up or restored at the same time.
    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,
}

fn default_peer_id() -> u32 {
    1
}
fn default_protocol_version() -> String {
    "1.0".into()
}
fn default_mc() -> String {
    "224.0.0.1:8001".into()
}
fn default_mdb() -> String {
    "224.0.0.2:8002".into()
}
fn default_mdr() -> String {
    "224.0.0.3:8003".into()
}
fn default_capacity() -> u64 {
    64 * 1024 * 1024
}
fn default_pool_workers() -> usize {
    8
}
fn default_pool_queue() -> usize {
    256
}
fn default_retry_initial_ms() -> u64 {
    1000
}
fn default_retry_attempts() -> u32 {
    5
}
fn default_max_reply_delay_ms() -> u64 {
    400
}
fn default_delete_repeats() -> u32 {
    3
}
fn default_max_parallel_chunks() -> usize {
    8
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            protocol_version: default_protocol_version(),
            mc: default_mc(),
            mdb: default_mdb(),
            mdr: default_mdr(),
            storage_dir: None,
            capacity: default_capacity(),
            pool_workers: default_pool_workers(),
            pool_queue: default_pool_queue(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_attempts: default_retry_attempts(),
            max_reply_delay_ms: default_max_reply_delay_ms(),
            delete_repeats: default_delete_repeats(),
            max_parallel_chunks: default_max_parallel_chunks(),
        }
    }
}

impl Config {
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("peer{}", self.peer_id)))
    }

    pub fn version(&self) -> anyhow::Result<Version> {
        Version::parse(&self.protocol_version)
            .with_context(|| format!("invalid protocol version {:?}", self.protocol_version))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_initial_ms),
            self.retry_attempts,
        )
    }

    pub fn max_reply_delay(&self) -> Duration {
        Duration::from_millis(self.max_reply_delay_ms)
    }

    /// Reject values the peer cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.version()?;
        anyhow::ensure!(self.pool_workers > 0, "pool_workers must be at least 1");
        anyhow::ensure!(self.pool_queue > 0, "pool_queue must be at least 1");
        anyhow::ensure!(self.retry_attempts > 0, "retry_attempts must be at least 1");
        anyhow::ensure!(
            self.max_parallel_chunks > 0,
            "max_parallel_chunks must be at least 1"
        );
        Ok(())
    }

    /// Apply DBS_* overrides. Unparseable values are reported and skipped.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_from(&lookup, "DBS_PEER_ID", &mut self.peer_id);
        override_from(&lookup, "DBS_MC", &mut self.mc);
        override_from(&lookup, "DBS_MDB", &mut self.mdb);
        override_from(&lookup, "DBS_MDR", &mut self.mdr);
        override_from(&lookup, "DBS_CAPACITY", &mut self.capacity);
        if let Some(dir) = lookup("DBS_STORAGE_DIR") {
            self.storage_dir = Some(PathBuf::from(dir));
        }
    }
}

fn override_from<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) {
    if let Some(s) = lookup(name) {
        match s.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => {
                tracing::warn!(var = name, value = %s, "ignoring invalid environment override")
            }
        }
    }
}

/// Load config: default, then config file (explicit path or first existing
/// default location), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|name| std::env::var(name).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/dbs/config.toml"));
    }
    out.push(PathBuf::from("/etc/dbs/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str::<Config>(&s).with_context(|| format!("parsing config {}", path.display()))
}

/// Desired degree accepted by the `backup` command.
pub fn parse_degree(s: &str) -> Result<u8, String> {
    let d: u8 = s.parse().map_err(|_| format!("{s:?} is not a number"))?;
    if (1..=MAX_REPLICATION_DEGREE).contains(&d) {
        Ok(d)
    } else {
        Err(format!("replication degree must be 1..={MAX_REPLICATION_DEGREE}"))
    }
}
