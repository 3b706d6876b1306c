// rust/compat-core/src/config.rs

//! Configuration management for the cluster compatibility checker.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values. Command-line
//! flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CompatError, Result};

pub const DEFAULT_CONTROL_PORT: u16 = 29610;
pub const DEFAULT_MASTER_PORT: u16 = 29500;
pub const DEFAULT_COLLECTIVE_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_BANDWIDTH_DURATION_SECS: u64 = 5;
pub const DEFAULT_BANDWIDTH_PORT_BASE: u16 = 5301;

// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatConfig {
    pub cluster: ClusterConfig,
    pub timeouts: TimeoutConfig,
    pub collective: CollectiveConfig,
    pub mesh: MeshConfig,
    pub probe: ProbeConfig,
}

/// Cluster topology and addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Total number of nodes, coordinator included.
    pub cluster_size: u32,
    /// Address the collective backend rendezvous on. Empty means "guess".
    pub master_addr: String,
    /// Port the collective backend rendezvous on.
    pub master_port: u16,
    /// Port of the coordinator's control channel.
    pub control_port: u16,
    /// Interface the coordinator binds the control port on.
    pub bind_address: String,
    /// Coordinator address a worker connects to.
    pub host: String,
    /// Address a worker advertises to its peers. Defaults to the local
    /// address of the control connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_addr: Option<String>,
}

/// Bounded waits used by both roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    // Coordinator: window for the cluster to fill up.
    pub registration_secs: u64,
    // Coordinator: how long a new connection may take to send `register`.
    pub handshake_secs: u64,
    // Coordinator: window for the operator to confirm start.
    pub confirm_secs: u64,
    // Worker: how long to wait for the `registered` reply.
    pub register_reply_secs: u64,
    // Worker: bound on the AwaitingStart wait.
    pub start_secs: u64,
    // Worker: connection attempts before giving up.
    pub max_connect_attempts: u32,
    // Worker: initial backoff between connection attempts.
    pub reconnect_delay_ms: u64,
    // Coordinator: wait for `shutdown_ack` per worker.
    pub shutdown_ack_secs: u64,
}

/// Collective-communication backend invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectiveConfig {
    /// Interpreter or executable that runs the all-reduce exercise.
    pub program: String,
    /// Extra arguments. When empty the built-in all-reduce driver is passed.
    pub args: Vec<String>,
    /// Backend-side timeout for the collective.
    pub timeout_secs: u64,
    /// Slack the coordinator adds on top of `timeout_secs` before a rank
    /// is recorded as timed out.
    pub report_grace_secs: u64,
    /// Size of the all-reduce buffer in MiB used for the bandwidth figure.
    pub buffer_mib: u64,
}

/// Pairwise bandwidth mesh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub enabled: bool,
    /// Bandwidth tool executable.
    pub program: String,
    /// Seconds per direction.
    pub duration_secs: u64,
    /// First port handed out to bandwidth servers; each pair uses two.
    pub port_base: u16,
    /// Upper bound on concurrent pairs per wave. `None` means the wave
    /// is only limited by node availability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_pairs: Option<usize>,
    /// Delay between starting a server and starting its client.
    pub server_startup_delay_ms: u64,
}

/// Local environment probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub nvidia_smi: String,
    pub command_timeout_secs: u64,
    /// Whether a missing collective library blocks `single` and `host`/`worker`.
    pub require_collective_library: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_size: 2,
            master_addr: String::new(),
            master_port: DEFAULT_MASTER_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            bind_address: "0.0.0.0".to_string(),
            host: String::new(),
            advertise_addr: None,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            registration_secs: 600,
            handshake_secs: 30,
            confirm_secs: 300,
            register_reply_secs: 60,
            start_secs: 900,
            max_connect_attempts: 5,
            reconnect_delay_ms: 1_000,
            shutdown_ack_secs: 5,
        }
    }
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: Vec::new(),
            timeout_secs: DEFAULT_COLLECTIVE_TIMEOUT_SECS,
            report_grace_secs: 90,
            buffer_mib: 64,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "iperf3".to_string(),
            duration_secs: DEFAULT_BANDWIDTH_DURATION_SECS,
            port_base: DEFAULT_BANDWIDTH_PORT_BASE,
            max_concurrent_pairs: None,
            server_startup_delay_ms: 800,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            nvidia_smi: "nvidia-smi".to_string(),
            command_timeout_secs: 20,
            require_collective_library: true,
        }
    }
}

impl TimeoutConfig {
    pub fn registration(&self) -> Duration {
        Duration::from_secs(self.registration_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn confirm(&self) -> Duration {
        Duration::from_secs(self.confirm_secs)
    }

    pub fn register_reply(&self) -> Duration {
        Duration::from_secs(self.register_reply_secs)
    }

    pub fn start(&self) -> Duration {
        Duration::from_secs(self.start_secs)
    }

    pub fn shutdown_ack(&self) -> Duration {
        Duration::from_secs(self.shutdown_ack_secs)
    }
}

impl CollectiveConfig {
    /// How long the coordinator waits for every rank to report.
    pub fn report_deadline(&self) -> Duration {
        Duration::from_secs(self.timeout_secs + self.report_grace_secs)
    }
}

impl FromStr for CompatConfig {
    type Err = CompatError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| CompatError::config_with_source("failed to parse TOML config", e))
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl CompatConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CompatError::config_with_source(
                format!("failed to read config file '{}'", path.display()),
                e,
            )
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `CCC_`. For example:
    // - `CCC_CLUSTER_SIZE` overrides `cluster.cluster_size`
    // - `CCC_MASTER_ADDR` overrides `cluster.master_addr`
    // - `CCC_COLLECTIVE_TIMEOUT_SECS` overrides `collective.timeout_secs`
    // - `CCC_MESH_PROGRAM` overrides `mesh.program`
    // Unparsable values are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Cluster overrides
        if let Some(v) = env_parse("CCC_CLUSTER_SIZE") {
            self.cluster.cluster_size = v;
        }
        if let Ok(val) = std::env::var("CCC_MASTER_ADDR") {
            self.cluster.master_addr = val;
        }
        if let Some(v) = env_parse("CCC_MASTER_PORT") {
            self.cluster.master_port = v;
        }
        if let Some(v) = env_parse("CCC_CONTROL_PORT") {
            self.cluster.control_port = v;
        }
        if let Ok(val) = std::env::var("CCC_BIND_ADDRESS") {
            self.cluster.bind_address = val;
        }
        if let Ok(val) = std::env::var("CCC_HOST") {
            self.cluster.host = val;
        }
        if let Ok(val) = std::env::var("CCC_ADVERTISE_ADDR") {
            self.cluster.advertise_addr = Some(val);
        }

        // Timeout overrides
        if let Some(v) = env_parse("CCC_REGISTRATION_TIMEOUT_SECS") {
            self.timeouts.registration_secs = v;
        }
        if let Some(v) = env_parse("CCC_CONFIRM_TIMEOUT_SECS") {
            self.timeouts.confirm_secs = v;
        }
        if let Some(v) = env_parse("CCC_START_TIMEOUT_SECS") {
            self.timeouts.start_secs = v;
        }
        if let Some(v) = env_parse("CCC_MAX_CONNECT_ATTEMPTS") {
            self.timeouts.max_connect_attempts = v;
        }

        // Collective overrides
        if let Ok(val) = std::env::var("CCC_COLLECTIVE_PROGRAM") {
            self.collective.program = val;
        }
        if let Some(v) = env_parse("CCC_COLLECTIVE_TIMEOUT_SECS") {
            self.collective.timeout_secs = v;
        }

        // Mesh overrides
        if let Some(v) = env_parse("CCC_MESH_ENABLED") {
            self.mesh.enabled = v;
        }
        if let Ok(val) = std::env::var("CCC_MESH_PROGRAM") {
            self.mesh.program = val;
        }
        if let Some(v) = env_parse("CCC_MESH_DURATION_SECS") {
            self.mesh.duration_secs = v;
        }
        if let Some(v) = env_parse("CCC_MESH_PORT_BASE") {
            self.mesh.port_base = v;
        }
        if let Some(v) = env_parse("CCC_MESH_MAX_CONCURRENT_PAIRS") {
            self.mesh.max_concurrent_pairs = Some(v);
        }

        self
    }

    // Validate settings shared by every mode.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.cluster_size < 1 {
            return Err(CompatError::config(
                "cluster.cluster_size must be at least 1",
            ));
        }
        if self.cluster.master_port == 0 {
            return Err(CompatError::config(
                "cluster.master_port must be greater than 0",
            ));
        }
        if self.cluster.control_port == 0 {
            return Err(CompatError::config(
                "cluster.control_port must be greater than 0",
            ));
        }
        if !self.cluster.master_addr.is_empty() && !is_valid_host(&self.cluster.master_addr) {
            return Err(CompatError::config(format!(
                "cluster.master_addr '{}' is not a valid address",
                self.cluster.master_addr
            )));
        }
        if let Some(addr) = &self.cluster.advertise_addr {
            if !is_valid_host(addr) {
                return Err(CompatError::config(format!(
                    "cluster.advertise_addr '{}' is not a valid address",
                    addr
                )));
            }
        }
        if self.cluster.bind_address.parse::<IpAddr>().is_err() {
            return Err(CompatError::config(format!(
                "cluster.bind_address '{}' is not an IP address",
                self.cluster.bind_address
            )));
        }

        if self.timeouts.registration_secs == 0
            || self.timeouts.handshake_secs == 0
            || self.timeouts.confirm_secs == 0
            || self.timeouts.register_reply_secs == 0
            || self.timeouts.start_secs == 0
        {
            return Err(CompatError::config("timeouts must be greater than 0"));
        }
        if self.timeouts.max_connect_attempts == 0 {
            return Err(CompatError::config(
                "timeouts.max_connect_attempts must be greater than 0",
            ));
        }

        if self.collective.program.trim().is_empty() {
            return Err(CompatError::config("collective.program must not be empty"));
        }
        if self.collective.timeout_secs == 0 {
            return Err(CompatError::config(
                "collective.timeout_secs must be greater than 0",
            ));
        }

        if self.mesh.program.trim().is_empty() {
            return Err(CompatError::config("mesh.program must not be empty"));
        }
        if self.mesh.duration_secs == 0 {
            return Err(CompatError::config(
                "mesh.duration_secs must be greater than 0",
            ));
        }
        if self.mesh.port_base == 0 {
            return Err(CompatError::config("mesh.port_base must be greater than 0"));
        }
        if self.mesh.max_concurrent_pairs == Some(0) {
            return Err(CompatError::config(
                "mesh.max_concurrent_pairs must be greater than 0 when set",
            ));
        }
        let pairs = u64::from(self.cluster.cluster_size) * u64::from(self.cluster.cluster_size.saturating_sub(1)) / 2;
        if u64::from(self.mesh.port_base) + 2 * pairs > u64::from(u16::MAX) {
            return Err(CompatError::config(
                "mesh.port_base leaves too few ports for every pair",
            ));
        }

        Ok(())
    }

    /// Extra checks for the coordinator role.
    pub fn validate_host(&self) -> Result<()> {
        self.validate()?;
        if self.cluster.master_addr.is_empty() {
            return Err(CompatError::config(
                "cluster.master_addr must be set for the host role",
            ));
        }
        Ok(())
    }

    /// Extra checks for the worker role.
    pub fn validate_worker(&self) -> Result<()> {
        self.validate()?;
        if !is_valid_host(&self.cluster.host) {
            return Err(CompatError::config(format!(
                "cluster.host '{}' is not a valid coordinator address",
                self.cluster.host
            )));
        }
        Ok(())
    }
}

/// Accepts IP literals and DNS-style hostnames.
pub fn is_valid_host(s: &str) -> bool {
    if s.parse::<IpAddr>().is_ok() {
        return true;
    }
    !s.is_empty()
        && s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}
