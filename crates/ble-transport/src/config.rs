use anyhow::{ensure, Context};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::TransportResult;
use crate::fragment::MIN_UNIT_SIZE;

/// Tunables for the link transport
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum number of peers holding at least one live role (default: 7)
    pub max_peers: usize,
    /// Maximum number of peer records kept, connected or not (default: 100)
    pub max_tracked_peers: usize,
    /// Discoveries weaker than this are ignored, in dBm (default: -85)
    pub min_signal_strength: i32,
    /// Signal strength that normalizes to zero when scoring, in dBm (default: -100)
    pub signal_floor: i32,
    /// Window over which the recency component decays to zero (default: 30)
    pub recency_window_secs: u64,
    /// Timeout for a single scheduled link operation (default: 5000)
    pub operation_timeout_ms: u64,
    /// Timeout for establishing an outgoing link (default: 30)
    pub connect_timeout_secs: u64,
    /// Time a partial transfer may wait for its remaining fragments (default: 30)
    pub reassembly_timeout_secs: u64,
    /// Unit size requested when negotiating on an outgoing link (default: 517)
    pub requested_unit_size: u32,
    /// Unit size used until a negotiation completes (default: 23)
    pub default_unit_size: u32,
    /// Failures retried immediately before blacklisting starts (default: 3)
    pub max_immediate_retries: u32,
    /// First blacklist window (default: 30)
    pub blacklist_base_secs: u64,
    /// Longest blacklist window (default: 240)
    pub blacklist_cap_secs: u64,
    /// Interval of the maintenance sweep (default: 30)
    pub maintenance_interval_secs: u64,
    /// Unconnected records not rediscovered for this long are evicted (default: 120)
    pub peer_stale_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_peers: 7,
            max_tracked_peers: 100,
            min_signal_strength: -85,
            signal_floor: -100,
            recency_window_secs: 30,
            operation_timeout_ms: 5_000,
            connect_timeout_secs: 30,
            reassembly_timeout_secs: 30,
            requested_unit_size: 517,
            default_unit_size: 23,
            max_immediate_retries: 3,
            blacklist_base_secs: 30,
            blacklist_cap_secs: 240,
            maintenance_interval_secs: 30,
            peer_stale_secs: 120,
        }
    }
}

impl TransportConfig {
    /// Load configuration from `BLE_TRANSPORT_*` environment variables
    ///
    /// Unset variables keep their defaults; a `.env` file is read first if present.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            max_peers: env_or("BLE_TRANSPORT_MAX_PEERS", defaults.max_peers)?,
            max_tracked_peers: env_or(
                "BLE_TRANSPORT_MAX_TRACKED_PEERS",
                defaults.max_tracked_peers,
            )?,
            min_signal_strength: env_or(
                "BLE_TRANSPORT_MIN_SIGNAL_STRENGTH",
                defaults.min_signal_strength,
            )?,
            signal_floor: env_or("BLE_TRANSPORT_SIGNAL_FLOOR", defaults.signal_floor)?,
            recency_window_secs: env_or(
                "BLE_TRANSPORT_RECENCY_WINDOW_SECS",
                defaults.recency_window_secs,
            )?,
            operation_timeout_ms: env_or(
                "BLE_TRANSPORT_OPERATION_TIMEOUT_MS",
                defaults.operation_timeout_ms,
            )?,
            connect_timeout_secs: env_or(
                "BLE_TRANSPORT_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout_secs,
            )?,
            reassembly_timeout_secs: env_or(
                "BLE_TRANSPORT_REASSEMBLY_TIMEOUT_SECS",
                defaults.reassembly_timeout_secs,
            )?,
            requested_unit_size: env_or(
                "BLE_TRANSPORT_REQUESTED_UNIT_SIZE",
                defaults.requested_unit_size,
            )?,
            default_unit_size: env_or(
                "BLE_TRANSPORT_DEFAULT_UNIT_SIZE",
                defaults.default_unit_size,
            )?,
            max_immediate_retries: env_or(
                "BLE_TRANSPORT_MAX_IMMEDIATE_RETRIES",
                defaults.max_immediate_retries,
            )?,
            blacklist_base_secs: env_or(
                "BLE_TRANSPORT_BLACKLIST_BASE_SECS",
                defaults.blacklist_base_secs,
            )?,
            blacklist_cap_secs: env_or(
                "BLE_TRANSPORT_BLACKLIST_CAP_SECS",
                defaults.blacklist_cap_secs,
            )?,
            maintenance_interval_secs: env_or(
                "BLE_TRANSPORT_MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval_secs,
            )?,
            peer_stale_secs: env_or("BLE_TRANSPORT_PEER_STALE_SECS", defaults.peer_stale_secs)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> TransportResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.max_peers > 0, "max_peers must be at least 1");
        ensure!(
            self.max_tracked_peers >= self.max_peers,
            "max_tracked_peers ({}) must not be below max_peers ({})",
            self.max_tracked_peers,
            self.max_peers
        );
        ensure!(self.signal_floor < 0, "signal_floor must be negative");
        ensure!(
            self.default_unit_size >= MIN_UNIT_SIZE,
            "default_unit_size must be at least {}",
            MIN_UNIT_SIZE
        );
        ensure!(
            self.requested_unit_size >= self.default_unit_size,
            "requested_unit_size must not be below default_unit_size"
        );
        ensure!(
            self.operation_timeout_ms > 0,
            "operation_timeout_ms must be positive"
        );
        ensure!(
            self.blacklist_cap_secs >= self.blacklist_base_secs,
            "blacklist_cap_secs must not be below blacklist_base_secs"
        );
        ensure!(
            self.maintenance_interval_secs > 0,
            "maintenance_interval_secs must be positive"
        );
        Ok(())
    }

    pub fn recency_window(&self) -> Duration {
        Duration::from_secs(self.recency_window_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_secs(self.reassembly_timeout_secs)
    }

    pub fn blacklist_base(&self) -> Duration {
        Duration::from_secs(self.blacklist_base_secs)
    }

    pub fn blacklist_cap(&self) -> Duration {
        Duration::from_secs(self.blacklist_cap_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn peer_stale_after(&self) -> Duration {
        Duration::from_secs(self.peer_stale_secs)
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}
