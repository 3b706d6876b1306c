//! In-memory capability implementations.
//!
//! Stand-ins for the collective backend and the bandwidth tool so the
//! control plane can be exercised without GPUs or iperf3.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::bandwidth::{BandwidthSample, BandwidthTool, ToolStatus};
use crate::collective::{CollectiveBackend, CollectiveParams, CollectiveStatus, CollectiveTestResult};
use crate::error::{CompatError, Result};

#[derive(Debug, Clone)]
enum Outcome {
    Ok { bus_bandwidth_gb_s: f64 },
    Fail(String),
    Hang,
}

/// Collective backend with a fixed outcome.
#[derive(Debug)]
pub struct FakeCollective {
    outcome: Outcome,
    runs: AtomicUsize,
}

impl FakeCollective {
    /// Reduces correctly and reports the given bus bandwidth.
    pub fn ok(bus_bandwidth_gb_s: f64) -> Self {
        Self::with(Outcome::Ok { bus_bandwidth_gb_s })
    }

    pub fn failing(error: impl Into<String>) -> Self {
        Self::with(Outcome::Fail(error.into()))
    }

    /// Never returns.
    pub fn hanging() -> Self {
        Self::with(Outcome::Hang)
    }

    fn with(outcome: Outcome) -> Self {
        Self {
            outcome,
            runs: AtomicUsize::new(0),
        }
    }

    /// How many times `run` was entered.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CollectiveBackend for FakeCollective {
    fn name(&self) -> &str {
        "fake"
    }

    async fn run(&self, params: &CollectiveParams, hostname: &str) -> CollectiveTestResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match &self.outcome {
            Outcome::Ok { bus_bandwidth_gb_s } => CollectiveTestResult {
                rank: params.rank,
                world_size: params.world_size,
                hostname: hostname.to_string(),
                status: CollectiveStatus::Ok,
                sum: Some(params.expected_sum()),
                expected_sum: params.expected_sum(),
                elapsed_secs: 0.01,
                bus_bandwidth_gb_s: Some(*bus_bandwidth_gb_s),
                error: String::new(),
            },
            Outcome::Fail(error) => CollectiveTestResult::failed(params, hostname, error.clone()),
            Outcome::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                CollectiveTestResult::failed(params, hostname, "hang ended")
            }
        }
    }
}

/// Bandwidth tool reporting a fixed throughput.
#[derive(Debug)]
pub struct FakeBandwidth {
    bits_per_second: f64,
    available: bool,
    servers: Mutex<HashSet<u16>>,
    clients: AtomicUsize,
}

impl FakeBandwidth {
    pub fn new(bits_per_second: f64) -> Self {
        Self {
            bits_per_second,
            available: true,
            servers: Mutex::new(HashSet::new()),
            clients: AtomicUsize::new(0),
        }
    }

    /// Reports the tool as missing and fails every operation.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(0.0)
        }
    }

    pub async fn open_servers(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.servers.lock().await.iter().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// How many client runs were attempted.
    pub fn client_runs(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BandwidthTool for FakeBandwidth {
    async fn check(&self) -> ToolStatus {
        ToolStatus {
            ok: self.available,
            detail: if self.available {
                "fake 1.0".to_string()
            } else {
                "fake tool not found".to_string()
            },
        }
    }

    async fn start_server(&self, port: u16) -> Result<()> {
        if !self.available {
            return Err(CompatError::tool("fake", "not found"));
        }
        if !self.servers.lock().await.insert(port) {
            return Err(CompatError::tool("fake", format!("server already running on port {}", port)));
        }
        Ok(())
    }

    async fn wait_server(&self, port: u16, _timeout: Duration) -> Result<()> {
        if self.servers.lock().await.remove(&port) {
            Ok(())
        } else {
            Err(CompatError::tool("fake", format!("no server on port {}", port)))
        }
    }

    async fn run_client(&self, _target: &str, _port: u16, _duration: Duration) -> BandwidthSample {
        self.clients.fetch_add(1, Ordering::SeqCst);
        if self.available {
            BandwidthSample::measured(self.bits_per_second)
        } else {
            BandwidthSample::failed("fake tool not found")
        }
    }

    async fn shutdown(&self) {
        self.servers.lock().await.clear();
    }
}
