//! Point-to-point bandwidth measurement.
//!
//! The measurement itself is delegated to an external tool (iperf3 by
//! default). A measurement in one direction is: start a one-shot server on
//! the receiving node, run the client on the sending node against it, then
//! reap the server.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Child;
use tokio::sync::Mutex;

use crate::error::{CompatError, Result};
use crate::exec::{self, CommandSpec, EXIT_NOT_FOUND};

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_SLACK: Duration = Duration::from_secs(30);

/// Whether the tool is usable on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStatus {
    pub ok: bool,
    pub detail: String,
}

/// One directional measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthSample {
    pub ok: bool,
    pub bits_per_second: Option<f64>,
    pub error: String,
}

impl BandwidthSample {
    pub fn measured(bits_per_second: f64) -> Self {
        Self {
            ok: true,
            bits_per_second: Some(bits_per_second),
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            bits_per_second: None,
            error: error.into(),
        }
    }

    pub fn gbit_per_sec(&self) -> Option<f64> {
        if self.ok {
            self.bits_per_second.map(|bps| bps / 1e9)
        } else {
            None
        }
    }
}

/// Capability interface over the bandwidth tool on one node.
#[async_trait]
pub trait BandwidthTool: Send + Sync {
    /// Report whether the tool can run here.
    async fn check(&self) -> ToolStatus;

    /// Start a server that accepts exactly one client on `port`.
    async fn start_server(&self, port: u16) -> Result<()>;

    /// Wait for the server on `port` to finish serving its client.
    async fn wait_server(&self, port: u16, timeout: Duration) -> Result<()>;

    /// Send traffic to `target:port` for `duration` and report throughput.
    async fn run_client(&self, target: &str, port: u16, duration: Duration) -> BandwidthSample;

    /// Kill any servers still running.
    async fn shutdown(&self);
}

/// iperf3 in JSON mode.
pub struct Iperf3Tool {
    program: String,
    servers: Mutex<HashMap<u16, Child>>,
}

impl Iperf3Tool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            servers: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BandwidthTool for Iperf3Tool {
    async fn check(&self) -> ToolStatus {
        let out = exec::run(&CommandSpec::new(&self.program, CHECK_TIMEOUT).arg("--version")).await;
        if out.success() {
            let line = out.first_line();
            ToolStatus {
                ok: true,
                detail: if line.is_empty() { format!("{} ok", self.program) } else { line.to_string() },
            }
        } else {
            ToolStatus {
                ok: false,
                detail: out.detail(),
            }
        }
    }

    async fn start_server(&self, port: u16) -> Result<()> {
        let mut servers = self.servers.lock().await;
        if servers.contains_key(&port) {
            return Err(CompatError::tool(
                &self.program,
                format!("server already running on port {}", port),
            ));
        }
        let spec = CommandSpec::new(&self.program, Duration::ZERO)
            .args(["-s", "-1", "-p"])
            .arg(port.to_string())
            .arg("-J");
        let child = spec
            .to_command()
            .spawn()
            .map_err(|e| CompatError::tool(&self.program, format!("server start failed: {}", e)))?;
        tracing::debug!(port, "bandwidth server started");
        servers.insert(port, child);
        Ok(())
    }

    async fn wait_server(&self, port: u16, timeout: Duration) -> Result<()> {
        let child = self.servers.lock().await.remove(&port).ok_or_else(|| {
            CompatError::tool(&self.program, format!("no server on port {}", port))
        })?;
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(CompatError::tool(
                &self.program,
                format!(
                    "server exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )),
            Ok(Err(e)) => Err(CompatError::tool(&self.program, e.to_string())),
            Err(_) => Err(CompatError::timeout(
                format!("waiting for bandwidth server on port {}", port),
                timeout.as_secs(),
            )),
        }
    }

    async fn run_client(&self, target: &str, port: u16, duration: Duration) -> BandwidthSample {
        let spec = CommandSpec::new(&self.program, duration + CLIENT_SLACK)
            .args(["-c", target, "-p"])
            .arg(port.to_string())
            .arg("-t")
            .arg(duration.as_secs().max(1).to_string())
            .arg("-J");
        let out = exec::run(&spec).await;
        if out.code == EXIT_NOT_FOUND {
            return BandwidthSample::failed(format!("{} not found", self.program));
        }
        if !out.success() {
            // iperf3 -J reports its own errors inside the JSON document.
            let error = extract_error(&out.stdout).unwrap_or_else(|| out.detail());
            return BandwidthSample::failed(error);
        }
        match extract_bits_per_second(&out.stdout) {
            Some(bps) => BandwidthSample::measured(bps),
            None => BandwidthSample::failed("cannot parse throughput from tool output"),
        }
    }

    async fn shutdown(&self) {
        let mut servers = self.servers.lock().await;
        for (port, mut child) in servers.drain() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(port, error = %e, "bandwidth server already gone");
            }
        }
    }
}

/// A roster member as seen by the mesh phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshNode {
    pub rank: u32,
    pub hostname: String,
    pub address: String,
}

/// Tool availability reported by one node before the mesh runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolAvailability {
    pub node: MeshNode,
    pub status: ToolStatus,
}

/// Result for one unordered pair of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthMatrixEntry {
    pub a: MeshNode,
    pub b: MeshNode,
    pub forward: BandwidthSample,
    pub reverse: BandwidthSample,
}

impl BandwidthMatrixEntry {
    /// Both directions succeeded.
    pub fn is_ok(&self) -> bool {
        self.forward.ok && self.reverse.ok
    }

    /// Mean of the directions that produced a figure, in Gbit/s.
    pub fn average_gbit_per_sec(&self) -> Option<f64> {
        let figures: Vec<f64> = [self.forward.gbit_per_sec(), self.reverse.gbit_per_sec()]
            .into_iter()
            .flatten()
            .collect();
        if figures.is_empty() {
            None
        } else {
            Some(figures.iter().sum::<f64>() / figures.len() as f64)
        }
    }

    /// Joined failure details of both directions.
    pub fn detail(&self) -> String {
        let mut parts = Vec::new();
        if !self.forward.ok {
            parts.push(format!("A->B: {}", self.forward.error));
        }
        if !self.reverse.ok {
            parts.push(format!("B->A: {}", self.reverse.error));
        }
        parts.join("; ")
    }
}

/// Symmetric pairwise throughput over a fixed roster. Each unordered pair
/// holds one entry; the diagonal is never measured.
#[derive(Debug, Clone, Default)]
pub struct BandwidthMatrix {
    nodes: Vec<MeshNode>,
    entries: BTreeMap<(u32, u32), BandwidthMatrixEntry>,
}

impl BandwidthMatrix {
    pub fn new(nodes: Vec<MeshNode>) -> Self {
        Self {
            nodes,
            entries: BTreeMap::new(),
        }
    }

    fn key(a: u32, b: u32) -> (u32, u32) {
        (a.min(b), a.max(b))
    }

    /// Store the entry for its pair, replacing any previous one.
    pub fn record(&mut self, entry: BandwidthMatrixEntry) {
        self.entries.insert(Self::key(entry.a.rank, entry.b.rank), entry);
    }

    /// Entry for the pair, in either order. `None` on the diagonal.
    pub fn get(&self, a: u32, b: u32) -> Option<&BandwidthMatrixEntry> {
        if a == b {
            return None;
        }
        self.entries.get(&Self::key(a, b))
    }

    pub fn nodes(&self) -> &[MeshNode] {
        &self.nodes
    }

    /// Entries ordered by `(lower rank, higher rank)`.
    pub fn entries(&self) -> impl Iterator<Item = &BandwidthMatrixEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every pair of the roster has an entry.
    pub fn is_complete(&self) -> bool {
        let m = self.nodes.len();
        self.entries.len() == m * m.saturating_sub(1) / 2
    }

    pub fn all_ok(&self) -> bool {
        self.entries.values().all(BandwidthMatrixEntry::is_ok)
    }
}

fn as_bps(value: Option<&Value>) -> Option<f64> {
    value?.get("bits_per_second")?.as_f64()
}

/// Pull the achieved throughput out of iperf3's JSON report: the larger of
/// the summed sent/received rates, falling back to per-stream figures.
pub fn extract_bits_per_second(json: &str) -> Option<f64> {
    let doc: Value = serde_json::from_str(json).ok()?;
    let end = doc.get("end")?;

    let summed = ["sum_received", "sum_sent"]
        .iter()
        .filter_map(|key| as_bps(end.get(*key)))
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));
    if summed.is_some() {
        return summed;
    }

    end.get("streams")?
        .as_array()?
        .iter()
        .flat_map(|stream| [as_bps(stream.get("sender")), as_bps(stream.get("receiver"))])
        .flatten()
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
}

fn extract_error(json: &str) -> Option<String> {
    let doc: Value = serde_json::from_str(json).ok()?;
    doc.get("error")?.as_str().map(str::to_string)
}
