//! grid.toml configuration.
//!
//! Every section and field is optional; missing values take the defaults
//! below. Durations are strings such as `"500ms"`, `"3s"`, `"4m"` or a
//! bare number of seconds.
//!
//! ```toml
//! [deployer]
//! revert_on_failure = true
//! submit_timeout = "4m"
//!
//! [deployer.poll]
//! initial_interval = "3s"
//! multiplier = 1.25
//!
//! [network]
//! keepalive = 25
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub deployer: DeployerConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployerConfig {
    /// Restore the previous deployments when a pass fails.
    pub revert_on_failure: bool,
    /// Deadline for a single create/update RPC to a node.
    pub submit_timeout: String,
    /// Per-node deadline when fetching the live fleet.
    pub fetch_timeout: String,
    /// Minimum free balance required before any contract is created.
    pub min_balance: u64,
    pub poll: PollConfig,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            revert_on_failure: false,
            submit_timeout: "4m".to_string(),
            fetch_timeout: "10s".to_string(),
            min_balance: 20_000,
            poll: PollConfig::default(),
        }
    }
}

/// Convergence polling: exponential backoff plus a stall window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub initial_interval: String,
    pub multiplier: f64,
    pub max_interval: String,
    pub max_elapsed: String,
    /// Give up when no additional workload turned `ok` for this long.
    pub stall_timeout: String,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: "3s".to_string(),
            multiplier: 1.25,
            max_interval: "40s".to_string(),
            max_elapsed: "50m".to_string(),
            stall_timeout: "4m".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address range carved into /32 carrier addresses for wireguard peers.
    pub carrier_range: String,
    pub wg_port_min: u16,
    pub wg_port_max: u16,
    /// PersistentKeepalive for generated wg-quick configs, in seconds.
    pub keepalive: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            carrier_range: "100.64.0.0/16".to_string(),
            wg_port_min: 1024,
            wg_port_max: 32767,
            keepalive: 25,
        }
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.deployer;
        for (field, value) in [
            ("deployer.submit_timeout", &d.submit_timeout),
            ("deployer.fetch_timeout", &d.fetch_timeout),
            ("deployer.poll.initial_interval", &d.poll.initial_interval),
            ("deployer.poll.max_interval", &d.poll.max_interval),
            ("deployer.poll.max_elapsed", &d.poll.max_elapsed),
            ("deployer.poll.stall_timeout", &d.poll.stall_timeout),
        ] {
            parse_duration(value).ok_or_else(|| ConfigError::Invalid {
                field,
                reason: format!("{value:?} is not a duration"),
            })?;
        }
        if !d.poll.multiplier.is_finite() || d.poll.multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "deployer.poll.multiplier",
                reason: "must be a finite number of at least 1.0".to_string(),
            });
        }

        let n = &self.network;
        n.carrier_range()?;
        if n.wg_port_min >= n.wg_port_max {
            return Err(ConfigError::Invalid {
                field: "network.wg_port_min",
                reason: "must be lower than wg_port_max".to_string(),
            });
        }
        Ok(())
    }
}

impl DeployerConfig {
    pub fn submit_timeout(&self) -> Duration {
        parse_duration(&self.submit_timeout).unwrap_or(Duration::from_secs(240))
    }

    pub fn fetch_timeout(&self) -> Duration {
        parse_duration(&self.fetch_timeout).unwrap_or(Duration::from_secs(10))
    }
}

impl PollConfig {
    pub fn initial_interval(&self) -> Duration {
        parse_duration(&self.initial_interval).unwrap_or(Duration::from_secs(3))
    }

    pub fn max_interval(&self) -> Duration {
        parse_duration(&self.max_interval).unwrap_or(Duration::from_secs(40))
    }

    pub fn max_elapsed(&self) -> Duration {
        parse_duration(&self.max_elapsed).unwrap_or(Duration::from_secs(50 * 60))
    }

    pub fn stall_timeout(&self) -> Duration {
        parse_duration(&self.stall_timeout).unwrap_or(Duration::from_secs(240))
    }
}

impl NetworkConfig {
    pub fn carrier_range(&self) -> Result<ipnet::Ipv4Net, ConfigError> {
        self.carrier_range.parse().map_err(|_| ConfigError::Invalid {
            field: "network.carrier_range",
            reason: format!("{:?} is not an IPv4 network", self.carrier_range),
        })
    }
}

/// Parse `"500ms"`, `"3s"`, `"2m"` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse().ok().map(Duration::from_secs)
    }
}
