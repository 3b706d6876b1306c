//! Control-channel messages.
//!
//! Every message is a JSON object tagged by `type`. Worker-to-coordinator
//! and coordinator-to-worker messages share one enum; each side rejects the
//! variants it does not expect.

use serde::{Deserialize, Serialize};

use crate::bandwidth::{BandwidthSample, ToolStatus};
use crate::collective::{CollectiveParams, CollectiveTestResult};

/// What a worker tells the coordinator about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub hostname: String,
    pub gpu_count: u32,
    /// Version of the checker binary the worker runs.
    pub version: String,
}

/// Session parameters handed to a worker on successful registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub session_id: String,
    pub rank: u32,
    pub world_size: u32,
    pub master_addr: String,
    pub master_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Worker -> coordinator. `address` is what peers use to reach the
    /// worker; empty means "use the connection's peer address".
    Register {
        address: String,
        capabilities: WorkerCapabilities,
    },
    Registered {
        assignment: Assignment,
    },
    Rejected {
        reason: String,
    },

    StartCollective {
        session_id: String,
        params: CollectiveParams,
    },
    CollectiveResult {
        result: CollectiveTestResult,
    },

    CheckBandwidthTool,
    BandwidthToolStatus {
        status: ToolStatus,
    },
    BandwidthServerStart {
        port: u16,
    },
    BandwidthServerStarted {
        port: u16,
        ok: bool,
        #[serde(default)]
        error: String,
    },
    BandwidthServerWait {
        port: u16,
        timeout_secs: u64,
    },
    BandwidthServerFinished {
        port: u16,
        ok: bool,
        #[serde(default)]
        error: String,
    },
    BandwidthClientRun {
        target: String,
        port: u16,
        duration_secs: u64,
    },
    BandwidthClientResult {
        port: u16,
        sample: BandwidthSample,
    },

    /// Either direction: the session is over.
    Abort {
        reason: String,
    },
    Shutdown,
    ShutdownAck,
}

impl Message {
    /// Wire tag, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Registered { .. } => "registered",
            Self::Rejected { .. } => "rejected",
            Self::StartCollective { .. } => "start_collective",
            Self::CollectiveResult { .. } => "collective_result",
            Self::CheckBandwidthTool => "check_bandwidth_tool",
            Self::BandwidthToolStatus { .. } => "bandwidth_tool_status",
            Self::BandwidthServerStart { .. } => "bandwidth_server_start",
            Self::BandwidthServerStarted { .. } => "bandwidth_server_started",
            Self::BandwidthServerWait { .. } => "bandwidth_server_wait",
            Self::BandwidthServerFinished { .. } => "bandwidth_server_finished",
            Self::BandwidthClientRun { .. } => "bandwidth_client_run",
            Self::BandwidthClientResult { .. } => "bandwidth_client_result",
            Self::Abort { .. } => "abort",
            Self::Shutdown => "shutdown",
            Self::ShutdownAck => "shutdown_ack",
        }
    }

    /// Commands the coordinator sends for a worker to execute.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::StartCollective { .. }
                | Self::CheckBandwidthTool
                | Self::BandwidthServerStart { .. }
                | Self::BandwidthServerWait { .. }
                | Self::BandwidthClientRun { .. }
        )
    }
}
