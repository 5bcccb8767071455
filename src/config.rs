//! Configuration for a peerwire instance
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (PEERWIRE_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::communicator::CommunicatorConfig;
use crate::error::{Error, Result};
use crate::peer::PeerTimeouts;
use crate::transport::FaultInjectionConfig;

/// Main instance configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity of this instance
    pub instance: InstanceSettings,

    /// The run this instance takes part in
    pub group: GroupSettings,

    /// Peer discovery
    pub discovery: DiscoverySettings,

    /// Protocol retry and abort timeouts
    pub timeouts: TimeoutSettings,

    /// Leader-based registration forwarding
    pub forwarding: ForwardingSettings,

    /// Random send drops for reliability testing
    pub fault_injection: FaultInjectionConfig,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Instance identity settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSettings {
    /// Unique instance name (auto-generated if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Position of this instance on its machine (0 leads localhost discovery)
    pub local_position: usize,
}

/// Group layout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSettings {
    /// Identifier shared by every instance of one run
    pub identifier: String,

    /// Machine name (hostname if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Address other machines reach this one at
    pub node_ip: String,

    pub instances_per_node: usize,

    pub number_of_nodes: usize,

    /// This machine hosts the multi-node discovery leader
    pub is_discovery_leader_node: bool,
}

/// Discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// UDP port of the localhost discovery leader
    pub local_port: u16,

    /// `host:port` of the multi-node discovery leader
    pub global_address: String,

    /// Interval between discovery pings in milliseconds
    pub ping_interval_ms: u64,

    /// Give up discovery after this many milliseconds
    pub timeout_ms: u64,
}

/// Timeouts in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub synchronize_retry_ms: u64,
    pub connection_abort_ms: u64,
    pub register_peer_retry_ms: u64,
    pub register_peer_abort_ms: u64,
    pub register_peer_wait_ms: u64,
    pub payload_retry_ms: u64,
    pub payload_abort_ms: u64,
    pub close_retry_ms: u64,
    pub close_abort_ms: u64,
    pub connection_is_closed_wait_ms: u64,

    /// Control loop tick
    pub poll_interval_ms: u64,

    /// Upper bound for each receive inside gather and broadcast
    pub collective_ms: u64,
}

/// Registration forwarding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingSettings {
    /// Let the discovery leader introduce peers to each other
    pub enabled: bool,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// ─────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            identifier: "default".to_string(),
            node_name: None,
            node_ip: "127.0.0.1".to_string(),
            instances_per_node: 1,
            number_of_nodes: 1,
            is_discovery_leader_node: true,
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            local_port: 7100,
            global_address: "127.0.0.1:7200".to_string(),
            ping_interval_ms: 100,
            timeout_ms: 60_000,
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let timeouts = PeerTimeouts::default();
        Self {
            synchronize_retry_ms: timeouts.synchronize_retry.as_millis() as u64,
            connection_abort_ms: timeouts.connection_abort.as_millis() as u64,
            register_peer_retry_ms: timeouts.register_peer_retry.as_millis() as u64,
            register_peer_abort_ms: timeouts.register_peer_abort.as_millis() as u64,
            register_peer_wait_ms: timeouts.register_peer_wait.as_millis() as u64,
            payload_retry_ms: timeouts.payload_retry.as_millis() as u64,
            payload_abort_ms: timeouts.payload_abort.as_millis() as u64,
            close_retry_ms: timeouts.close_retry.as_millis() as u64,
            close_abort_ms: timeouts.close_abort.as_millis() as u64,
            connection_is_closed_wait_ms: timeouts.connection_is_closed_wait.as_millis() as u64,
            poll_interval_ms: 10,
            collective_ms: 60_000,
        }
    }
}

impl TimeoutSettings {
    pub fn peer_timeouts(&self) -> PeerTimeouts {
        PeerTimeouts {
            synchronize_retry: Duration::from_millis(self.synchronize_retry_ms),
            connection_abort: Duration::from_millis(self.connection_abort_ms),
            register_peer_retry: Duration::from_millis(self.register_peer_retry_ms),
            register_peer_abort: Duration::from_millis(self.register_peer_abort_ms),
            register_peer_wait: Duration::from_millis(self.register_peer_wait_ms),
            payload_retry: Duration::from_millis(self.payload_retry_ms),
            payload_abort: Duration::from_millis(self.payload_abort_ms),
            close_retry: Duration::from_millis(self.close_retry_ms),
            close_abort: Duration::from_millis(self.close_abort_ms),
            connection_is_closed_wait: Duration::from_millis(self.connection_is_closed_wait_ms),
        }
    }

    fn named(&self) -> [(&'static str, u64); 12] {
        [
            ("synchronize_retry_ms", self.synchronize_retry_ms),
            ("connection_abort_ms", self.connection_abort_ms),
            ("register_peer_retry_ms", self.register_peer_retry_ms),
            ("register_peer_abort_ms", self.register_peer_abort_ms),
            ("register_peer_wait_ms", self.register_peer_wait_ms),
            ("payload_retry_ms", self.payload_retry_ms),
            ("payload_abort_ms", self.payload_abort_ms),
            ("close_retry_ms", self.close_retry_ms),
            ("close_abort_ms", self.close_abort_ms),
            ("connection_is_closed_wait_ms", self.connection_is_closed_wait_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("collective_ms", self.collective_ms),
        ]
    }
}

impl Default for ForwardingSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|source| Error::IoRead {
                path: path.clone(),
                source,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e.message()),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // An explicit path must exist
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            PathBuf::from("peerwire.toml"),
            dirs::config_dir()
                .map(|p| p.join("peerwire").join("node.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".peerwire").join("node.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/peerwire/node.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Instance
        if let Ok(val) = std::env::var("PEERWIRE_INSTANCE_NAME") {
            self.instance.name = Some(val);
        }
        env_parse("PEERWIRE_LOCAL_POSITION", &mut self.instance.local_position);

        // Group
        if let Ok(val) = std::env::var("PEERWIRE_GROUP") {
            self.group.identifier = val;
        }
        if let Ok(val) = std::env::var("PEERWIRE_NODE_NAME") {
            self.group.node_name = Some(val);
        }
        if let Ok(val) = std::env::var("PEERWIRE_NODE_IP") {
            self.group.node_ip = val;
        }
        env_parse("PEERWIRE_INSTANCES_PER_NODE", &mut self.group.instances_per_node);
        env_parse("PEERWIRE_NUMBER_OF_NODES", &mut self.group.number_of_nodes);
        env_flag("PEERWIRE_DISCOVERY_LEADER_NODE", &mut self.group.is_discovery_leader_node);

        // Discovery
        env_parse("PEERWIRE_LOCAL_DISCOVERY_PORT", &mut self.discovery.local_port);
        if let Ok(val) = std::env::var("PEERWIRE_GLOBAL_DISCOVERY_ADDRESS") {
            self.discovery.global_address = val;
        }
        env_parse("PEERWIRE_DISCOVERY_TIMEOUT_MS", &mut self.discovery.timeout_ms);

        // Timeouts
        env_parse("PEERWIRE_PAYLOAD_RETRY_MS", &mut self.timeouts.payload_retry_ms);
        env_parse("PEERWIRE_PAYLOAD_ABORT_MS", &mut self.timeouts.payload_abort_ms);
        env_parse("PEERWIRE_CLOSE_ABORT_MS", &mut self.timeouts.close_abort_ms);

        // Forwarding
        env_flag("PEERWIRE_FORWARDING", &mut self.forwarding.enabled);

        // Fault injection
        env_parse("PEERWIRE_DROP_PROBABILITY", &mut self.fault_injection.drop_probability);
        if let Ok(val) = std::env::var("PEERWIRE_FAULT_SEED") {
            if let Ok(n) = val.parse() {
                self.fault_injection.seed = Some(n);
            }
        }

        // Logging
        if let Ok(val) = std::env::var("PEERWIRE_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("PEERWIRE_LOG_FILE") {
            self.logging.file = Some(val);
        }
        env_flag("PEERWIRE_LOG_JSON", &mut self.logging.json_format);
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.group.identifier.trim().is_empty() {
            return Err(Error::config_field_invalid("group.identifier", "cannot be empty"));
        }
        if self.group.instances_per_node == 0 {
            return Err(Error::config_field_invalid(
                "group.instances_per_node",
                "must be at least 1",
            ));
        }
        if self.group.number_of_nodes == 0 {
            return Err(Error::config_field_invalid("group.number_of_nodes", "must be at least 1"));
        }
        if self.instance.local_position >= self.group.instances_per_node {
            return Err(Error::config_field_invalid(
                "instance.local_position",
                format!(
                    "{} is out of range for {} instances per node",
                    self.instance.local_position, self.group.instances_per_node
                ),
            ));
        }
        if self.group.number_of_nodes > 1 && self.discovery.global_address.is_empty() {
            return Err(Error::config_field_invalid(
                "discovery.global_address",
                "required with more than one node",
            ));
        }
        if self.discovery.ping_interval_ms == 0 {
            return Err(Error::config_field_invalid(
                "discovery.ping_interval_ms",
                "must be greater than 0",
            ));
        }
        for (name, value) in self.timeouts.named() {
            if value == 0 {
                return Err(Error::config_field_invalid(
                    format!("timeouts.{}", name),
                    "must be greater than 0",
                ));
            }
        }
        self.fault_injection.validate()?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Instance name, generated once if not configured
    pub fn instance_name(&self) -> String {
        self.instance.name.clone().unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("instance-{}", &id[..8])
        })
    }

    /// Machine name, the hostname if not configured
    pub fn node_name(&self) -> String {
        self.group.node_name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string())
        })
    }

    /// Runtime settings of the communicator
    pub fn communicator_config(&self) -> CommunicatorConfig {
        CommunicatorConfig {
            instance_name: self.instance_name(),
            group_identifier: self.group.identifier.clone(),
            node_name: self.node_name(),
            local_position: self.instance.local_position,
            instances_per_node: self.group.instances_per_node,
            number_of_nodes: self.group.number_of_nodes,
            is_discovery_leader_node: self.group.is_discovery_leader_node,
            local_discovery_port: self.discovery.local_port,
            global_discovery_address: self.discovery.global_address.clone(),
            node_ip: self.group.node_ip.clone(),
            forward_register_peer: self.forwarding.enabled,
            ping_interval: Duration::from_millis(self.discovery.ping_interval_ms),
            discovery_timeout: Duration::from_millis(self.discovery.timeout_ms),
            collective_timeout: Duration::from_millis(self.timeouts.collective_ms),
            poll_interval: Duration::from_millis(self.timeouts.poll_interval_ms),
            timeouts: self.timeouts.peer_timeouts(),
            fault_injection: self.fault_injection.clone(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        if let Ok(n) = val.parse() {
            *target = n;
        }
    }
}

fn env_flag(name: &str, target: &mut bool) {
    if let Ok(val) = std::env::var(name) {
        *target = val.to_lowercase() == "true" || val == "1";
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location written by `peerwire config init`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peerwire")
        .join("node.toml")
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| Error::IoWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|source| Error::IoWrite {
        path: config_path.clone(),
        source,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# peerwire instance configuration

[instance]
# Unique instance name (auto-generated if not set)
# name = "instance-0"

# Position of this instance on its machine (0 leads localhost discovery)
local_position = 0

[group]
# Identifier shared by every instance of one run
identifier = "default"

# Machine name (hostname if not set)
# node_name = "node-a"

# Address other machines reach this one at
node_ip = "127.0.0.1"

# Instances started on every machine
instances_per_node = 1

# Machines taking part in the run
number_of_nodes = 1

# This machine hosts the multi-node discovery leader
is_discovery_leader_node = true

[discovery]
# UDP port of the localhost discovery leader
local_port = 7100

# host:port of the multi-node discovery leader
global_address = "127.0.0.1:7200"

# Interval between discovery pings in milliseconds
ping_interval_ms = 100

# Give up discovery after this many milliseconds
timeout_ms = 60000

[timeouts]
synchronize_retry_ms = 100
connection_abort_ms = 30000
register_peer_retry_ms = 100
register_peer_abort_ms = 30000
register_peer_wait_ms = 10000
payload_retry_ms = 200
payload_abort_ms = 30000
close_retry_ms = 100
close_abort_ms = 10000
connection_is_closed_wait_ms = 500

# Control loop tick
poll_interval_ms = 10

# Upper bound for each receive inside gather and broadcast
collective_ms = 60000

[forwarding]
# Let the discovery leader introduce peers to each other
enabled = true

[fault_injection]
# Probability that a single send is dropped (0.0 disables)
drop_probability = 0.0

# Seed for reproducible drop patterns
# seed = 42

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.peerwire/logs/peerwire.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
