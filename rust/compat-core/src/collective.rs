//! Collective-communication test.
//!
//! The all-reduce itself is performed by an external backend (by default
//! PyTorch's NCCL process group driven by a small inline program); this
//! module only launches it with the rendezvous parameters, parses the one
//! JSON line it prints, and checks the reduced value.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::CollectiveConfig;
use crate::error::{CompatError, Result};
use crate::exec::{self, CommandSpec, EXIT_NOT_FOUND};

/// Port offset used by the single-node test so it never collides with a
/// multi-node rendezvous on the same host.
pub const SINGLE_NODE_PORT_OFFSET: u16 = 1;

const SINGLE_NODE_TIMEOUT_SECS: u64 = 60;
const PROCESS_SLACK_SECS: u64 = 30;
const SUM_TOLERANCE: f64 = 1e-4;

/// Rendezvous parameters handed to every rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectiveParams {
    pub rank: u32,
    pub world_size: u32,
    pub master_addr: String,
    pub master_port: u16,
    pub timeout_secs: u64,
}

impl CollectiveParams {
    /// World of one on the loopback interface.
    pub fn single_node(master_port: u16) -> Self {
        Self {
            rank: 0,
            world_size: 1,
            master_addr: "127.0.0.1".to_string(),
            master_port: master_port.wrapping_add(SINGLE_NODE_PORT_OFFSET),
            timeout_secs: SINGLE_NODE_TIMEOUT_SECS,
        }
    }

    /// Read `RANK`, `WORLD_SIZE`, `MASTER_ADDR`, `MASTER_PORT` and
    /// `NCCL_TEST_TIMEOUT_SECONDS` as set by an external launcher.
    pub fn from_env(default_master_port: u16, default_timeout_secs: u64) -> Result<Self> {
        fn var<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
            match std::env::var(key) {
                Ok(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| CompatError::config(format!("{} has invalid value '{}'", key, raw))),
                Err(_) => Ok(default),
            }
        }

        let params = Self {
            rank: var("RANK", 0)?,
            world_size: var("WORLD_SIZE", 1)?,
            master_addr: var("MASTER_ADDR", "127.0.0.1".to_string())?,
            master_port: var("MASTER_PORT", default_master_port)?,
            timeout_secs: var("NCCL_TEST_TIMEOUT_SECONDS", default_timeout_secs)?,
        };
        if params.world_size == 0 || params.rank >= params.world_size {
            return Err(CompatError::config(format!(
                "rank {} is outside world size {}",
                params.rank, params.world_size
            )));
        }
        Ok(params)
    }

    /// Every rank contributes its own rank, so the reduced value is
    /// `0 + 1 + ... + (world_size - 1)`.
    pub fn expected_sum(&self) -> f64 {
        expected_sum(self.world_size)
    }
}

pub fn expected_sum(world_size: u32) -> f64 {
    let n = f64::from(world_size);
    n * (n - 1.0) / 2.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectiveStatus {
    Ok,
    Failed,
    Timeout,
}

impl CollectiveStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Failed => "FAIL",
            Self::Timeout => "TIMEOUT",
        }
    }
}

/// Outcome of one rank's participation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectiveTestResult {
    pub rank: u32,
    pub world_size: u32,
    pub hostname: String,
    pub status: CollectiveStatus,
    pub sum: Option<f64>,
    pub expected_sum: f64,
    pub elapsed_secs: f64,
    /// Achieved all-reduce bus bandwidth in GB/s, when the backend measured it.
    pub bus_bandwidth_gb_s: Option<f64>,
    pub error: String,
}

impl CollectiveTestResult {
    pub fn is_ok(&self) -> bool {
        self.status == CollectiveStatus::Ok
    }

    pub fn failed(params: &CollectiveParams, hostname: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            rank: params.rank,
            world_size: params.world_size,
            hostname: hostname.into(),
            status: CollectiveStatus::Failed,
            sum: None,
            expected_sum: params.expected_sum(),
            elapsed_secs: 0.0,
            bus_bandwidth_gb_s: None,
            error: error.into(),
        }
    }

    pub fn timed_out(rank: u32, world_size: u32, hostname: impl Into<String>, waited: Duration) -> Self {
        Self {
            rank,
            world_size,
            hostname: hostname.into(),
            status: CollectiveStatus::Timeout,
            sum: None,
            expected_sum: expected_sum(world_size),
            elapsed_secs: waited.as_secs_f64(),
            bus_bandwidth_gb_s: None,
            error: format!("no result within {}s", waited.as_secs()),
        }
    }
}

/// Runs one rank of the collective exercise.
#[async_trait]
pub trait CollectiveBackend: Send + Sync {
    /// Human-readable backend name for diagnostics.
    fn name(&self) -> &str;

    /// Run the collective with the given rendezvous parameters. Never
    /// fails: backend problems are reported inside the result.
    async fn run(&self, params: &CollectiveParams, hostname: &str) -> CollectiveTestResult;
}

/// All-reduce driver passed to the interpreter when no custom arguments
/// are configured. Prints a single JSON object on stdout.
pub const DEFAULT_ALL_REDUCE_DRIVER: &str = r#"
import datetime, json, os, time
out = {"ok": False, "sum": None, "elapsed_seconds": 0.0, "busbw_gb_s": None, "error": ""}
start = time.time()
try:
    import torch
    import torch.distributed as dist
    if not torch.cuda.is_available() or torch.cuda.device_count() < 1:
        raise RuntimeError("no CUDA GPU detected")
    rank = int(os.environ["RANK"])
    world = int(os.environ["WORLD_SIZE"])
    torch.cuda.set_device(0)
    dist.init_process_group("nccl", rank=rank, world_size=world,
        timeout=datetime.timedelta(seconds=int(os.environ["COMPAT_TIMEOUT_SECONDS"])))
    try:
        x = torch.tensor([float(rank)], device="cuda")
        dist.all_reduce(x)
        dist.barrier()
        out["sum"] = float(x.item())
        n = int(os.environ["COMPAT_BUFFER_MIB"]) * 1024 * 1024 // 4
        buf = torch.ones(n, device="cuda")
        torch.cuda.synchronize()
        t0 = time.time()
        dist.all_reduce(buf)
        torch.cuda.synchronize()
        dt = time.time() - t0
        if dt > 0:
            factor = 2.0 * (world - 1) / world if world > 1 else 1.0
            out["busbw_gb_s"] = n * 4 * factor / dt / 1e9
        out["ok"] = True
    finally:
        dist.destroy_process_group()
except Exception as e:
    out["error"] = repr(e)
out["elapsed_seconds"] = round(time.time() - start, 3)
print(json.dumps(out))
"#;

/// What the backend program prints.
#[derive(Debug, Deserialize)]
struct BackendReport {
    ok: bool,
    sum: Option<f64>,
    #[serde(default)]
    elapsed_seconds: f64,
    #[serde(default)]
    busbw_gb_s: Option<f64>,
    #[serde(default)]
    error: String,
}

/// Launches the configured program once per rank.
#[derive(Debug, Clone)]
pub struct ProcessCollectiveBackend {
    program: String,
    args: Vec<String>,
    buffer_mib: u64,
}

impl ProcessCollectiveBackend {
    pub fn new(config: &CollectiveConfig) -> Self {
        let args = if config.args.is_empty() {
            vec!["-c".to_string(), DEFAULT_ALL_REDUCE_DRIVER.to_string()]
        } else {
            config.args.clone()
        };
        Self {
            program: config.program.clone(),
            args,
            buffer_mib: config.buffer_mib,
        }
    }

    fn command(&self, params: &CollectiveParams) -> CommandSpec {
        CommandSpec::new(
            &self.program,
            Duration::from_secs(params.timeout_secs + PROCESS_SLACK_SECS),
        )
        .args(self.args.iter().cloned())
        .env("RANK", params.rank.to_string())
        .env("LOCAL_RANK", "0")
        .env("WORLD_SIZE", params.world_size.to_string())
        .env("MASTER_ADDR", &params.master_addr)
        .env("MASTER_PORT", params.master_port.to_string())
        .env("COMPAT_TIMEOUT_SECONDS", params.timeout_secs.to_string())
        .env("COMPAT_BUFFER_MIB", self.buffer_mib.to_string())
    }
}

#[async_trait]
impl CollectiveBackend for ProcessCollectiveBackend {
    fn name(&self) -> &str {
        &self.program
    }

    async fn run(&self, params: &CollectiveParams, hostname: &str) -> CollectiveTestResult {
        tracing::info!(
            rank = params.rank,
            world_size = params.world_size,
            master = %format!("{}:{}", params.master_addr, params.master_port),
            "starting collective backend"
        );
        let output = exec::run(&self.command(params)).await;

        if output.code == EXIT_NOT_FOUND {
            return CollectiveTestResult::failed(
                params,
                hostname,
                format!("collective backend '{}' not found", self.program),
            );
        }

        let report = match parse_backend_report(&output.stdout) {
            Some(report) => report,
            None if !output.success() => {
                return CollectiveTestResult::failed(
                    params,
                    hostname,
                    format!("backend exited with code {}: {}", output.code, output.detail()),
                );
            }
            None => {
                return CollectiveTestResult::failed(params, hostname, "cannot parse backend output");
            }
        };

        evaluate_report(params, hostname, report)
    }
}

/// The last line of stdout that parses as a report wins; backends may log
/// freely before it.
fn parse_backend_report(stdout: &str) -> Option<BackendReport> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str(line).ok())
}

fn evaluate_report(params: &CollectiveParams, hostname: &str, report: BackendReport) -> CollectiveTestResult {
    let expected = params.expected_sum();
    let mut result = CollectiveTestResult {
        rank: params.rank,
        world_size: params.world_size,
        hostname: hostname.to_string(),
        status: CollectiveStatus::Failed,
        sum: report.sum,
        expected_sum: expected,
        elapsed_secs: report.elapsed_seconds,
        bus_bandwidth_gb_s: report.busbw_gb_s,
        error: report.error,
    };

    if !report.ok {
        if result.error.is_empty() {
            result.error = "backend reported failure".to_string();
        }
        return result;
    }

    match report.sum {
        Some(sum) if (sum - expected).abs() < SUM_TOLERANCE => {
            result.status = CollectiveStatus::Ok;
        }
        Some(sum) => {
            result.error = format!("all_reduce sum mismatch: got={}, expected={}", sum, expected);
        }
        None => {
            result.error = "backend reported success without a reduced value".to_string();
        }
    }
    result
}

/// Rank-indexed collection of per-node results.
#[derive(Debug, Clone, Default)]
pub struct CollectiveTable {
    results: BTreeMap<u32, CollectiveTestResult>,
}

impl CollectiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rank's result. A later result for the same rank replaces
    /// the earlier one.
    pub fn record(&mut self, result: CollectiveTestResult) {
        self.results.insert(result.rank, result);
    }

    pub fn contains(&self, rank: u32) -> bool {
        self.results.contains_key(&rank)
    }

    /// Fill every rank in `roster` that has not reported with a timeout entry.
    pub fn fill_missing<'a>(
        &mut self,
        roster: impl IntoIterator<Item = (u32, &'a str)>,
        world_size: u32,
        waited: Duration,
    ) {
        for (rank, hostname) in roster {
            self.results
                .entry(rank)
                .or_insert_with(|| CollectiveTestResult::timed_out(rank, world_size, hostname, waited));
        }
    }

    /// Results in rank order.
    pub fn rows(&self) -> impl Iterator<Item = &CollectiveTestResult> {
        self.results.values()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn all_ok(&self) -> bool {
        !self.results.is_empty() && self.results.values().all(CollectiveTestResult::is_ok)
    }
}
