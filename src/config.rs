use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Agora realtime messaging server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "agora-server", version, about = "Agora realtime messaging server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "AGORA_PORT", default_value = "8320")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "AGORA_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./agora.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "AGORA_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "AGORA_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Realtime tuning (loaded from [realtime] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

/// Tuning knobs for the realtime core. All have workable defaults; the
/// integration tests shrink some of them to force the edge paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Per-connection outbound queue capacity. On overflow the connection is
    /// marked resync-required instead of blocking other consumers.
    #[serde(default = "default_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Events retained per room for replay after reconnect. Older ranges
    /// answer with a resync signal.
    #[serde(default = "default_replay_retention")]
    pub replay_retention: usize,

    /// Seconds without any client frame before a connection is treated as a
    /// disconnect (default: 60)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Grace period in days for room deletion requests and soft-deleted
    /// room purges (default: 7)
    #[serde(default = "default_deletion_grace")]
    pub deletion_grace_days: i64,

    /// Interval in seconds between lifecycle sweeper runs (default: 3600)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            replay_retention: 512,
            idle_timeout_secs: 60,
            deletion_grace_days: 7,
            sweep_interval_secs: 3600,
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

fn default_replay_retention() -> usize {
    512
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_deletion_grace() -> i64 {
    7
}

fn default_sweep_interval() -> u64 {
    3600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8320,
            bind_address: "0.0.0.0".to_string(),
            config: "./agora.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            realtime: RealtimeConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (AGORA_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("AGORA_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Agora Realtime Messaging Server Configuration
# Place this file at ./agora.toml or specify with --config <path>
# All settings can be overridden via environment variables (AGORA_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8320)
# port = 8320

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for SQLite database and key material
# data_dir = "./data"

# ---- Realtime Core ----
# [realtime]

# Per-connection outbound queue capacity. A connection that falls this far
# behind is marked resync-required rather than slowing everyone else down.
# outbound_queue_capacity = 256

# Events kept per room for replay-after-reconnect. Clients further behind
# than this get a resync signal and refetch over REST.
# replay_retention = 512

# Seconds without a heartbeat before an idle connection is dropped
# idle_timeout_secs = 60

# Days a room deletion request stays pending before reverting, and days a
# soft-deleted room is kept before purge
# deletion_grace_days = 7

# Interval in seconds between deletion/purge sweeper runs
# sweep_interval_secs = 3600
"#
    .to_string()
}
