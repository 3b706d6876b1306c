//! Cluster Compatibility Checker - Core Library
//!
//! Checks whether a group of GPU nodes can run multi-node training
//! together: local environment probes, a cluster-wide all-reduce and a
//! pairwise bandwidth mesh, orchestrated by a coordinator over a small
//! TCP control protocol.

pub mod config;
pub mod error;
pub mod exec;
pub mod net;

// Re-export commonly used types for convenience
pub use config::CompatConfig;
pub use error::{CompatError, Result};

pub mod probe;
pub use probe::{CheckResult, CheckStatus, EnvironmentProber, EnvironmentReport};

pub mod collective;
pub use collective::{
    CollectiveBackend, CollectiveParams, CollectiveStatus, CollectiveTable, CollectiveTestResult,
    ProcessCollectiveBackend,
};

pub mod bandwidth;
pub use bandwidth::{BandwidthMatrix, BandwidthSample, BandwidthTool, Iperf3Tool, ToolStatus};

pub mod agent;
pub use agent::NodeAgent;

pub mod single;
pub use single::{run_single_node, SingleNodeOutcome};

pub mod coordinator;
pub use coordinator::{Coordinator, SessionReport, SessionState, WorkerClient, WorkerOutcome};

pub mod report;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
