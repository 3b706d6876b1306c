//! Cluster compatibility checker
//!
//! Checks whether a set of GPU nodes can train together: local
//! environment, a single-node collective, a cluster-wide collective and
//! a pairwise bandwidth mesh.
//!
//! # Usage
//!
//! ```bash
//! # Interactive walk-through (default)
//! compat-check
//!
//! # Local environment only
//! compat-check --mode check-env
//!
//! # Coordinator of a 4-node session
//! compat-check --mode host --cluster-size 4 --master-addr 10.0.0.1
//!
//! # Worker joining it
//! compat-check --mode worker --host 10.0.0.1
//! ```

mod operator;

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use compat_core::collective::CollectiveTable;
use compat_core::{
    net, report, run_single_node, CollectiveBackend, CollectiveParams, CompatConfig, CompatError,
    Coordinator, EnvironmentProber, EnvironmentReport, Iperf3Tool, NodeAgent, ProcessCollectiveBackend,
    Result, WorkerClient,
};
use operator::Operator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Environment check, single-node test, then an optional multi-node session.
    Full,
    /// Local environment probe only.
    CheckEnv,
    /// Single-node collective test.
    Single,
    /// One rank of the collective, configured by launcher environment variables.
    DistEnv,
    /// Coordinator of a multi-node session.
    Host,
    /// Worker of a multi-node session.
    Worker,
}

/// Cluster compatibility checker
#[derive(Parser, Debug)]
#[command(name = "compat-check")]
#[command(about = "Checks that GPU nodes can run multi-node training together")]
struct Args {
    #[arg(long, value_enum, default_value = "full")]
    mode: Mode,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Total number of nodes, coordinator included
    #[arg(long)]
    cluster_size: Option<u32>,

    /// Rendezvous address for the collective backend (guessed when omitted)
    #[arg(long)]
    master_addr: Option<String>,

    /// Rendezvous port for the collective backend
    #[arg(long)]
    master_port: Option<u16>,

    /// Coordinator control port
    #[arg(long)]
    control_port: Option<u16>,

    /// Coordinator address (worker mode)
    #[arg(long)]
    host: Option<String>,

    /// Address this worker advertises to its peers
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Collective backend timeout in seconds
    #[arg(long)]
    collective_timeout_seconds: Option<u64>,

    /// Seconds per bandwidth measurement direction
    #[arg(long)]
    bandwidth_duration_seconds: Option<u64>,

    /// Skip the pairwise bandwidth mesh
    #[arg(long)]
    no_mesh: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// File, then environment, then flags.
    fn load_config(&self) -> Result<CompatConfig> {
        let mut config = match &self.config {
            Some(path) => CompatConfig::from_file(path)?,
            None => CompatConfig::default(),
        }
        .with_env_overrides();

        if let Some(v) = self.cluster_size {
            config.cluster.cluster_size = v;
        }
        if let Some(v) = &self.master_addr {
            config.cluster.master_addr = v.clone();
        }
        if let Some(v) = self.master_port {
            config.cluster.master_port = v;
        }
        if let Some(v) = self.control_port {
            config.cluster.control_port = v;
        }
        if let Some(v) = &self.host {
            config.cluster.host = v.clone();
        }
        if let Some(v) = &self.advertise_addr {
            config.cluster.advertise_addr = Some(v.clone());
        }
        if let Some(v) = self.collective_timeout_seconds {
            config.collective.timeout_secs = v;
        }
        if let Some(v) = self.bandwidth_duration_seconds {
            config.mesh.duration_secs = v;
        }
        if self.no_mesh {
            config.mesh.enabled = false;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let code = match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "compat-check failed");
            1
        }
    };
    // The stdin reader may still be blocked on a read; leave without
    // waiting for the runtime to drain it.
    std::process::exit(code);
}

async fn run(args: &Args) -> Result<i32> {
    let config = args.load_config()?;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted");
                cancel.cancel();
            }
        });
    }

    match args.mode {
        Mode::CheckEnv => {
            check_env(&config).await;
            Ok(0)
        }
        Mode::Single => Ok(single(&config).await),
        Mode::DistEnv => dist_env(&config).await,
        Mode::Host => {
            let environment = gate(&config).await?;
            host(config, &environment, Operator::from_stdin(), cancel).await
        }
        Mode::Worker => {
            let environment = gate(&config).await?;
            worker(config, &environment, cancel).await
        }
        Mode::Full => full(config, cancel).await,
    }
}

fn collective_backend(config: &CompatConfig) -> Arc<dyn CollectiveBackend> {
    Arc::new(ProcessCollectiveBackend::new(&config.collective))
}

fn agent(config: &CompatConfig, environment: &EnvironmentReport) -> NodeAgent {
    NodeAgent::new(
        environment.hostname.clone(),
        collective_backend(config),
        Arc::new(Iperf3Tool::new(config.mesh.program.clone())),
    )
    .with_gpu_count(environment.gpu_count)
}

async fn check_env(config: &CompatConfig) -> EnvironmentReport {
    let environment = EnvironmentProber::new(config).probe().await;
    println!("{}", report::render_environment(&environment));
    if !environment.is_ready() {
        tracing::warn!(missing = %environment.failure_summary(), "environment is missing required dependencies");
    }
    environment
}

/// Probe and refuse to join a session when a mandatory check failed.
async fn gate(config: &CompatConfig) -> Result<EnvironmentReport> {
    let environment = check_env(config).await;
    if environment.is_ready() {
        Ok(environment)
    } else {
        Err(CompatError::config(format!(
            "environment not ready: {}",
            environment.failure_summary()
        )))
    }
}

async fn single(config: &CompatConfig) -> i32 {
    let prober = EnvironmentProber::new(config);
    let backend = collective_backend(config);
    let outcome = run_single_node(&prober, backend.as_ref(), config.cluster.master_port).await;
    println!("{}", outcome.render());
    if let Some(diagnostic) = outcome.diagnostic() {
        tracing::error!("{}", diagnostic);
    }
    outcome.exit_code()
}

async fn dist_env(config: &CompatConfig) -> Result<i32> {
    let params = CollectiveParams::from_env(config.cluster.master_port, config.collective.timeout_secs)?;
    tracing::info!(
        rank = params.rank,
        world_size = params.world_size,
        master = %format!("{}:{}", params.master_addr, params.master_port),
        "running collective rank from environment"
    );
    let result = collective_backend(config).run(&params, &net::hostname()).await;
    let ok = result.is_ok();
    let mut table = CollectiveTable::new();
    table.record(result);
    println!("{}", report::render_collective(&table));
    Ok(if ok { 0 } else { 1 })
}

async fn host(
    mut config: CompatConfig,
    environment: &EnvironmentReport,
    operator: Operator,
    cancel: CancellationToken,
) -> Result<i32> {
    if config.cluster.master_addr.is_empty() {
        let guessed = net::guess_host_ip().to_string();
        tracing::info!(master_addr = %guessed, "no master address given, using guessed host address");
        config.cluster.master_addr = guessed;
    }
    config.validate_host()?;

    let cluster_size = config.cluster.cluster_size;
    let coordinator = Coordinator::bind(config.clone(), agent(&config, environment)).await?;
    println!(
        "Coordinator listening on port {}. Start workers with: compat-check --mode worker --host {} --control-port {}",
        config.cluster.control_port, config.cluster.master_addr, config.cluster.control_port
    );
    operator::spawn_confirm_prompt(coordinator.subscribe(), cluster_size);

    let report = coordinator.run(operator.into_confirmations(), cancel).await;
    println!("{}", report.render());
    if let Some(reason) = &report.abort_reason {
        tracing::error!(session = %report.session_id, reason = %reason, "session aborted");
    }
    Ok(report.exit_code())
}

async fn worker(config: CompatConfig, environment: &EnvironmentReport, cancel: CancellationToken) -> Result<i32> {
    config.validate_worker()?;
    let agent = agent(&config, environment);
    let outcome = WorkerClient::new(config, agent).run(cancel).await;

    if let Some(assignment) = &outcome.assignment {
        println!(
            "Session {}: rank {} of {}",
            assignment.session_id, assignment.rank, assignment.world_size
        );
    }
    if let Some(result) = &outcome.collective {
        let mut table = CollectiveTable::new();
        table.record(result.clone());
        println!("{}", report::render_collective(&table));
    }
    match &outcome.reason {
        Some(reason) => tracing::error!(state = %outcome.state, reason = %reason, "worker finished"),
        None => tracing::info!(state = %outcome.state, "worker finished"),
    }
    Ok(outcome.exit_code())
}

/// Walk the operator through every stage, prompting for what the
/// command line left out.
async fn full(mut config: CompatConfig, cancel: CancellationToken) -> Result<i32> {
    let mut operator = Operator::from_stdin();

    let single_code = single(&config).await;
    if single_code != 0 {
        println!("The single-node test did not pass on this node.");
    }
    let proceed = operator
        .confirm("Continue with the multi-node test?", single_code == 0)
        .await
        .unwrap_or(false);
    if !proceed {
        return Ok(single_code);
    }

    let role = loop {
        match operator.ask::<String>("Role of this node (host/worker)", Some("host".to_string())).await {
            Some(r) if r.eq_ignore_ascii_case("host") => break Mode::Host,
            Some(r) if r.eq_ignore_ascii_case("worker") => break Mode::Worker,
            Some(r) => println!("Unknown role '{}'.", r),
            None => return Err(CompatError::aborted("input closed")),
        }
    };

    let closed = || CompatError::aborted("input closed");
    if role == Mode::Host {
        config.cluster.cluster_size = operator
            .ask("Number of nodes, this one included", Some(config.cluster.cluster_size))
            .await
            .ok_or_else(closed)?;
        let default_addr = if config.cluster.master_addr.is_empty() {
            net::guess_host_ip().to_string()
        } else {
            config.cluster.master_addr.clone()
        };
        config.cluster.master_addr = operator
            .ask("Address of this node", Some(default_addr))
            .await
            .ok_or_else(closed)?;
        config.cluster.master_port = operator
            .ask("Collective rendezvous port", Some(config.cluster.master_port))
            .await
            .ok_or_else(closed)?;
        config.cluster.control_port = operator
            .ask("Control port", Some(config.cluster.control_port))
            .await
            .ok_or_else(closed)?;
        config.validate_host()?;
        let environment = gate(&config).await?;
        host(config, &environment, operator, cancel).await
    } else {
        let default_host = if config.cluster.host.is_empty() {
            None
        } else {
            Some(config.cluster.host.clone())
        };
        config.cluster.host = operator
            .ask("Coordinator address", default_host)
            .await
            .ok_or_else(closed)?;
        config.cluster.control_port = operator
            .ask("Control port", Some(config.cluster.control_port))
            .await
            .ok_or_else(closed)?;
        config.validate_worker()?;
        let environment = gate(&config).await?;
        worker(config, &environment, cancel).await
    }
}
