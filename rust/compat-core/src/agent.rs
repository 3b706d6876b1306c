//! Executes coordinator commands on the local node.
//!
//! Workers run every command received over the control channel through a
//! [`NodeAgent`]; the coordinator runs its own rank through the same agent.

use std::sync::Arc;
use std::time::Duration;

use crate::bandwidth::BandwidthTool;
use crate::collective::CollectiveBackend;
use crate::coordinator::protocol::{Message, WorkerCapabilities};

#[derive(Clone)]
pub struct NodeAgent {
    hostname: String,
    gpu_count: u32,
    collective: Arc<dyn CollectiveBackend>,
    bandwidth: Arc<dyn BandwidthTool>,
}

impl NodeAgent {
    pub fn new(
        hostname: impl Into<String>,
        collective: Arc<dyn CollectiveBackend>,
        bandwidth: Arc<dyn BandwidthTool>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            gpu_count: 0,
            collective,
            bandwidth,
        }
    }

    #[must_use]
    pub fn with_gpu_count(mut self, gpu_count: u32) -> Self {
        self.gpu_count = gpu_count;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// What this node reports when it registers.
    pub fn capabilities(&self) -> WorkerCapabilities {
        WorkerCapabilities {
            hostname: self.hostname.clone(),
            gpu_count: self.gpu_count,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Execute one command and produce its reply. Returns `None` for
    /// messages that are not commands.
    pub async fn handle(&self, command: Message) -> Option<Message> {
        let reply = match command {
            Message::StartCollective { params, .. } => Message::CollectiveResult {
                result: self.collective.run(&params, &self.hostname).await,
            },
            Message::CheckBandwidthTool => Message::BandwidthToolStatus {
                status: self.bandwidth.check().await,
            },
            Message::BandwidthServerStart { port } => {
                let outcome = self.bandwidth.start_server(port).await;
                Message::BandwidthServerStarted {
                    port,
                    ok: outcome.is_ok(),
                    error: outcome.err().map(|e| e.to_string()).unwrap_or_default(),
                }
            }
            Message::BandwidthServerWait { port, timeout_secs } => {
                let outcome = self
                    .bandwidth
                    .wait_server(port, Duration::from_secs(timeout_secs))
                    .await;
                Message::BandwidthServerFinished {
                    port,
                    ok: outcome.is_ok(),
                    error: outcome.err().map(|e| e.to_string()).unwrap_or_default(),
                }
            }
            Message::BandwidthClientRun {
                target,
                port,
                duration_secs,
            } => Message::BandwidthClientResult {
                port,
                sample: self
                    .bandwidth
                    .run_client(&target, port, Duration::from_secs(duration_secs))
                    .await,
            },
            other => {
                tracing::debug!(kind = other.kind(), "not a command");
                return None;
            }
        };
        Some(reply)
    }

    /// Stop anything left running by earlier commands.
    pub async fn shutdown(&self) {
        self.bandwidth.shutdown().await;
    }
}
