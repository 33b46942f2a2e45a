//! Diameter node configuration
//!
//! Configuration may be built in code or loaded from YAML:
//!
//! ```yaml
//! origin_host: server.test.realm
//! realm: test.realm
//! listen_addresses: [127.0.0.1]
//! port: 3868
//! timers:
//!   watchdog_interval_ms: 30000
//! peers:
//!   - uri: aaa://client0.test.realm
//! ```

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{DiameterError, DiameterResult};
use crate::DIAMETER_PORT;

/// Diameter node configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Diameter Identity of the local node (FQDN)
    pub origin_host: String,

    /// Diameter realm of the local node
    pub realm: String,

    /// Addresses to listen on; empty means no listener (client role)
    pub listen_addresses: Vec<IpAddr>,

    /// Listen port (default: 3868)
    pub port: Option<u16>,

    /// Product-Name advertised in CER/CEA
    pub product_name: String,

    /// Vendor-Id advertised in CER/CEA
    pub vendor_id: u32,

    /// Protocol timers
    pub timers: TimerConfig,

    /// Peers registered by [`Node::from_config`](crate::Node::from_config)
    pub peers: Vec<PeerConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            origin_host: String::new(),
            realm: String::new(),
            listen_addresses: Vec::new(),
            port: None,
            product_name: "diam-node".to_string(),
            vendor_id: 0,
            timers: TimerConfig::default(),
            peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn new(origin_host: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            origin_host: origin_host.into(),
            realm: realm.into(),
            ..Default::default()
        }
    }

    /// Builder-style listener configuration
    pub fn listen_on(mut self, addresses: Vec<IpAddr>, port: Option<u16>) -> Self {
        self.listen_addresses = addresses;
        self.port = port;
        self
    }

    pub fn with_timers(mut self, timers: TimerConfig) -> Self {
        self.timers = timers;
        self
    }

    pub fn from_yaml_str(yaml: &str) -> DiameterResult<Self> {
        let config: NodeConfig = serde_yaml::from_str(yaml)
            .map_err(|e| DiameterError::Config(format!("invalid YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> DiameterResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DiameterError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Listen port, falling back to the well-known Diameter port
    pub fn listen_port(&self) -> u16 {
        self.port.unwrap_or(DIAMETER_PORT)
    }

    pub fn is_server(&self) -> bool {
        !self.listen_addresses.is_empty()
    }

    pub fn validate(&self) -> DiameterResult<()> {
        if self.origin_host.trim().is_empty() {
            return Err(DiameterError::Config("origin_host must not be empty".into()));
        }
        if self.realm.trim().is_empty() {
            return Err(DiameterError::Config("realm must not be empty".into()));
        }
        self.timers.validate()
    }
}

/// Protocol timers, in milliseconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Tw: idle time on an open connection before a DWR is sent
    pub watchdog_interval_ms: u64,
    /// Time to wait for any traffic after each DWR
    pub watchdog_answer_timeout_ms: u64,
    /// Time to wait for CER (accepting side) or CEA (connecting side)
    pub capabilities_timeout_ms: u64,
    /// TCP connect timeout per candidate address
    pub connect_timeout_ms: u64,
    /// First reconnect delay for persistent peers
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap
    pub reconnect_max_ms: u64,
    /// Default deadline for `send_request`
    pub request_timeout_ms: u64,
    /// How long `stop()` waits for connections and workers to drain
    pub shutdown_grace_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            watchdog_interval_ms: 30_000,
            watchdog_answer_timeout_ms: 4_000,
            capabilities_timeout_ms: 4_000,
            connect_timeout_ms: 4_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            request_timeout_ms: 30_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl TimerConfig {
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn watchdog_answer_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_answer_timeout_ms)
    }

    pub fn capabilities_timeout(&self) -> Duration {
        Duration::from_millis(self.capabilities_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> DiameterResult<()> {
        let timers = [
            ("watchdog_interval_ms", self.watchdog_interval_ms),
            ("watchdog_answer_timeout_ms", self.watchdog_answer_timeout_ms),
            ("capabilities_timeout_ms", self.capabilities_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("reconnect_base_ms", self.reconnect_base_ms),
            ("reconnect_max_ms", self.reconnect_max_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        for (name, value) in timers {
            if value == 0 {
                return Err(DiameterError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(DiameterError::Config(
                "reconnect_max_ms must not be below reconnect_base_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Statically configured peer
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    /// Diameter URI, e.g. `aaa://server.test.realm:3868;transport=tcp`
    pub uri: String,

    /// Realm of the peer; defaults to the local realm
    #[serde(default)]
    pub realm: Option<String>,

    /// Candidate addresses for outbound connections
    #[serde(default)]
    pub addresses: Vec<IpAddr>,

    /// Reconnect after failures
    #[serde(default)]
    pub persistent: bool,
}
