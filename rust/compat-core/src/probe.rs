//! Local environment inspection.
//!
//! Each check runs independently and records pass, fail or unknown. Nothing
//! here fails: a broken probe command simply marks its check. Checks flagged
//! mandatory gate the modes that go on to run the collective test.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::CompatConfig;
use crate::exec::{self, CommandOutput, CommandSpec, EXIT_NOT_FOUND};
use crate::net;

pub const CHECK_PLATFORM: &str = "platform";
pub const CHECK_RUNTIME: &str = "runtime";
pub const CHECK_GPU: &str = "gpu";
pub const CHECK_DRIVER: &str = "driver";
pub const CHECK_COLLECTIVE_LIBRARY: &str = "collective_library";
pub const CHECK_BANDWIDTH_TOOL: &str = "bandwidth_tool";
pub const CHECK_NETWORK: &str = "network";

const LIBRARY_PROBE: &str = r#"
import json
out = {}
try:
    import torch
    import torch.distributed as dist
    out["torch"] = torch.__version__
    out["cuda"] = torch.version.cuda
    out["cuda_available"] = bool(torch.cuda.is_available())
    out["nccl_available"] = bool(dist.is_available() and dist.is_nccl_available())
    try:
        out["nccl"] = ".".join(str(v) for v in torch.cuda.nccl.version())
    except Exception:
        out["nccl"] = None
except Exception as e:
    out["error"] = repr(e)
print(json.dumps(out))
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Unknown,
}

impl CheckStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub mandatory: bool,
    pub detail: String,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            mandatory: false,
            detail: detail.into(),
        }
    }

    fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }
}

/// Flat record of local checks for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentReport {
    pub hostname: String,
    pub gpu_count: u32,
    pub checks: Vec<CheckResult>,
}

impl EnvironmentReport {
    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Mandatory checks that did not pass.
    pub fn mandatory_failures(&self) -> Vec<&CheckResult> {
        self.checks
            .iter()
            .filter(|c| c.mandatory && c.status != CheckStatus::Pass)
            .collect()
    }

    pub fn is_ready(&self) -> bool {
        self.mandatory_failures().is_empty()
    }

    /// Operator-facing line naming every failed mandatory dependency.
    pub fn failure_summary(&self) -> String {
        self.mandatory_failures()
            .iter()
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Runs probe commands. Swapped for a fake in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> CommandOutput;
}

/// Runs commands on the local system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> CommandOutput {
        exec::run(spec).await
    }
}

#[derive(Debug, Default, Deserialize)]
struct LibraryReport {
    torch: Option<String>,
    cuda: Option<String>,
    #[serde(default)]
    cuda_available: bool,
    #[serde(default)]
    nccl_available: bool,
    nccl: Option<String>,
    error: Option<String>,
}

pub struct EnvironmentProber<R = SystemRunner> {
    runner: R,
    nvidia_smi: String,
    runtime_program: String,
    probe_library: bool,
    require_library: bool,
    bandwidth_program: String,
    timeout: Duration,
}

impl EnvironmentProber<SystemRunner> {
    pub fn new(config: &CompatConfig) -> Self {
        Self::with_runner(config, SystemRunner)
    }
}

impl<R: CommandRunner> EnvironmentProber<R> {
    pub fn with_runner(config: &CompatConfig, runner: R) -> Self {
        Self {
            runner,
            nvidia_smi: config.probe.nvidia_smi.clone(),
            runtime_program: config.collective.program.clone(),
            // A custom backend is opaque; only the built-in driver's library can be probed.
            probe_library: config.collective.args.is_empty(),
            require_library: config.probe.require_collective_library,
            bandwidth_program: config.mesh.program.clone(),
            timeout: Duration::from_secs(config.probe.command_timeout_secs),
        }
    }

    fn spec(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program, self.timeout)
    }

    pub async fn probe(&self) -> EnvironmentReport {
        let (runtime, (gpu, gpu_count), driver, library, tool, network) = tokio::join!(
            self.check_runtime(),
            self.check_gpus(),
            self.check_driver(),
            self.check_library(),
            self.check_bandwidth_tool(),
            self.check_network(),
        );

        let platform = CheckResult::new(
            CHECK_PLATFORM,
            CheckStatus::Pass,
            format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        );

        let report = EnvironmentReport {
            hostname: net::hostname(),
            gpu_count,
            checks: vec![platform, runtime, gpu, driver, library, tool, network],
        };
        for check in &report.checks {
            tracing::debug!(check = %check.name, status = check.status.label(), detail = %check.detail, "probe");
        }
        report
    }

    async fn check_runtime(&self) -> CheckResult {
        let out = self
            .runner
            .run(&self.spec(&self.runtime_program).arg("--version"))
            .await;
        let check = if out.success() {
            // Older interpreters print the version on stderr.
            let version = if out.first_line().is_empty() {
                exec::first_non_empty_line(&out.stderr).to_string()
            } else {
                out.first_line().to_string()
            };
            CheckResult::new(CHECK_RUNTIME, CheckStatus::Pass, version)
        } else {
            CheckResult::new(CHECK_RUNTIME, CheckStatus::Fail, missing_or_detail(&self.runtime_program, &out))
        };
        check.mandatory(self.require_library)
    }

    async fn check_gpus(&self) -> (CheckResult, u32) {
        let out = self.runner.run(&self.spec(&self.nvidia_smi).arg("-L")).await;
        if !out.success() {
            let status = if out.code == EXIT_NOT_FOUND {
                CheckStatus::Unknown
            } else {
                CheckStatus::Fail
            };
            return (
                CheckResult::new(CHECK_GPU, status, missing_or_detail(&self.nvidia_smi, &out)),
                0,
            );
        }
        let count = out
            .stdout
            .lines()
            .filter(|line| line.trim_start().starts_with("GPU "))
            .count() as u32;
        let status = if count > 0 {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        };
        (CheckResult::new(CHECK_GPU, status, format!("{} GPU(s)", count)), count)
    }

    async fn check_driver(&self) -> CheckResult {
        let out = self
            .runner
            .run(
                &self
                    .spec(&self.nvidia_smi)
                    .args(["--query-gpu=driver_version", "--format=csv,noheader"]),
            )
            .await;
        if out.success() && !out.first_line().is_empty() {
            CheckResult::new(CHECK_DRIVER, CheckStatus::Pass, out.first_line())
        } else if out.code == EXIT_NOT_FOUND {
            CheckResult::new(CHECK_DRIVER, CheckStatus::Unknown, missing_or_detail(&self.nvidia_smi, &out))
        } else {
            CheckResult::new(CHECK_DRIVER, CheckStatus::Fail, out.detail())
        }
    }

    async fn check_library(&self) -> CheckResult {
        if !self.probe_library {
            return CheckResult::new(
                CHECK_COLLECTIVE_LIBRARY,
                CheckStatus::Unknown,
                format!("custom backend '{}', library not probed", self.runtime_program),
            );
        }

        let out = self
            .runner
            .run(&self.spec(&self.runtime_program).args(["-c", LIBRARY_PROBE]))
            .await;
        let check = if out.code == EXIT_NOT_FOUND {
            CheckResult::new(
                CHECK_COLLECTIVE_LIBRARY,
                CheckStatus::Fail,
                format!("NCCL via torch.distributed unavailable: {} not found", self.runtime_program),
            )
        } else {
            match serde_json::from_str::<LibraryReport>(out.first_line()) {
                Ok(report) => library_check(report),
                Err(_) => CheckResult::new(
                    CHECK_COLLECTIVE_LIBRARY,
                    CheckStatus::Fail,
                    format!("NCCL via torch.distributed unavailable: {}", out.detail()),
                ),
            }
        };
        check.mandatory(self.require_library)
    }

    async fn check_bandwidth_tool(&self) -> CheckResult {
        let out = self
            .runner
            .run(&self.spec(&self.bandwidth_program).arg("--version"))
            .await;
        if out.success() {
            CheckResult::new(CHECK_BANDWIDTH_TOOL, CheckStatus::Pass, out.first_line())
        } else {
            CheckResult::new(
                CHECK_BANDWIDTH_TOOL,
                CheckStatus::Fail,
                missing_or_detail(&self.bandwidth_program, &out),
            )
        }
    }

    async fn check_network(&self) -> CheckResult {
        let out = self.runner.run(&self.spec("ip").args(["-br", "addr"])).await;
        if !out.success() {
            return CheckResult::new(CHECK_NETWORK, CheckStatus::Unknown, missing_or_detail("ip", &out));
        }
        let up: Vec<String> = out
            .stdout
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let name = fields.next()?;
                let state = fields.next()?;
                let addr = fields.next()?;
                (name != "lo" && state != "DOWN").then(|| format!("{} {}", name, addr))
            })
            .collect();
        if up.is_empty() {
            CheckResult::new(CHECK_NETWORK, CheckStatus::Fail, "no non-loopback interface with an address")
        } else {
            CheckResult::new(CHECK_NETWORK, CheckStatus::Pass, up.join(", "))
        }
    }
}

fn library_check(report: LibraryReport) -> CheckResult {
    if let Some(error) = report.error {
        return CheckResult::new(
            CHECK_COLLECTIVE_LIBRARY,
            CheckStatus::Fail,
            format!("NCCL via torch.distributed unavailable: {}", error),
        );
    }
    let torch = report.torch.unwrap_or_else(|| "?".to_string());
    if !report.nccl_available {
        return CheckResult::new(
            CHECK_COLLECTIVE_LIBRARY,
            CheckStatus::Fail,
            format!("NCCL backend not available in torch {}", torch),
        );
    }
    CheckResult::new(
        CHECK_COLLECTIVE_LIBRARY,
        CheckStatus::Pass,
        format!(
            "torch {} cuda {} (available={}) nccl {}",
            torch,
            report.cuda.as_deref().unwrap_or("none"),
            report.cuda_available,
            report.nccl.as_deref().unwrap_or("?"),
        ),
    )
}

fn missing_or_detail(program: &str, out: &CommandOutput) -> String {
    if out.code == EXIT_NOT_FOUND {
        format!("{} not found", program)
    } else {
        out.detail()
    }
}
