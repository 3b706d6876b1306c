//! Single-node collective test, gated on the environment probe.

use crate::collective::{CollectiveBackend, CollectiveParams, CollectiveTable, CollectiveTestResult};
use crate::probe::{CommandRunner, EnvironmentProber, EnvironmentReport};
use crate::report;

#[derive(Debug, Clone)]
pub enum SingleNodeOutcome {
    /// A mandatory dependency is missing; the benchmark was not attempted.
    Blocked(EnvironmentReport),
    Ran {
        environment: EnvironmentReport,
        result: CollectiveTestResult,
    },
}

impl SingleNodeOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Ran { result, .. } if result.is_ok() => 0,
            _ => 1,
        }
    }

    /// One-line operator diagnostic for a failed run.
    pub fn diagnostic(&self) -> Option<String> {
        match self {
            Self::Blocked(environment) => Some(format!(
                "single-node test not attempted: {}",
                environment.failure_summary()
            )),
            Self::Ran { result, .. } if !result.is_ok() => Some(format!(
                "single-node collective {}: {}",
                result.status.label(),
                result.error
            )),
            Self::Ran { .. } => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Blocked(environment) => report::render_environment(environment),
            Self::Ran { environment, result } => {
                let mut table = CollectiveTable::new();
                table.record(result.clone());
                format!(
                    "{}\n\nSingle-node collective\n{}",
                    report::render_environment(environment),
                    report::render_collective(&table)
                )
            }
        }
    }
}

/// Probe the local node and, when nothing mandatory is missing, run a
/// world-of-one collective on loopback.
pub async fn run_single_node<R: CommandRunner>(
    prober: &EnvironmentProber<R>,
    backend: &dyn CollectiveBackend,
    master_port: u16,
) -> SingleNodeOutcome {
    let environment = prober.probe().await;
    if !environment.is_ready() {
        tracing::error!(missing = %environment.failure_summary(), "environment not ready, skipping single-node test");
        return SingleNodeOutcome::Blocked(environment);
    }

    let params = CollectiveParams::single_node(master_port);
    tracing::info!(backend = backend.name(), port = params.master_port, "running single-node collective");
    let result = backend.run(&params, &environment.hostname).await;
    SingleNodeOutcome::Ran { environment, result }
}
