//! Coordinator-side session state.
//!
//! [`ClusterSession`] is owned by the coordinator's event loop and is the
//! only place rank assignment and session state live. It performs no I/O.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::protocol::{Assignment, WorkerCapabilities};
use crate::config::is_valid_host;
use crate::error::{CompatError, Result};

/// Identifies one control connection for the lifetime of the process.
pub type ConnectionId = u64;

/// Pseudo-connection of the coordinator's own node.
pub const LOCAL_CONNECTION: ConnectionId = 0;

/// Token the operator types to start the run.
pub const CONFIRM_TOKEN: &str = "start";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Listening,
    AwaitingWorkers,
    ReadyPendingConfirm,
    Running,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Aborted) => !self.is_terminal(),
            (Listening, AwaitingWorkers) => true,
            (AwaitingWorkers, ReadyPendingConfirm) => true,
            (ReadyPendingConfirm, AwaitingWorkers) => true,
            (ReadyPendingConfirm, Running) => true,
            (Running, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Listening => "listening",
            Self::AwaitingWorkers => "awaiting_workers",
            Self::ReadyPendingConfirm => "ready_pending_confirm",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Coordinator,
    Worker,
}

/// Lifecycle of a node as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Registered,
    Participating,
    Done,
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub rank: u32,
    pub role: NodeRole,
    pub address: String,
    pub hostname: String,
    pub gpu_count: u32,
    pub connection: ConnectionId,
    pub status: NodeStatus,
    pub registered_at: DateTime<Utc>,
}

/// Why a single registration was refused. The session carries on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("address {0} is already registered")]
    DuplicateAddress(String),

    #[error("session is {0}, not accepting registrations")]
    NotAccepting(SessionState),

    #[error("malformed registration: {0}")]
    Malformed(String),

    #[error("session already has {0} nodes")]
    SessionFull(u32),

    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),
}

/// What a dropped connection meant for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    /// The connection never registered.
    Unregistered,
    /// Before the run: the node was removed and its rank freed.
    Removed(NodeInfo),
    /// During the run: the node stays in the roster, marked lost.
    Lost(NodeInfo),
}

#[derive(Debug)]
pub struct ClusterSession {
    session_id: Uuid,
    cluster_size: u32,
    master_addr: String,
    master_port: u16,
    state: SessionState,
    nodes: BTreeMap<u32, NodeInfo>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    abort_reason: Option<String>,
}

impl ClusterSession {
    /// New session with the coordinator pre-registered as rank 0 under
    /// `master_addr`.
    pub fn new(cluster_size: u32, master_addr: impl Into<String>, master_port: u16, coordinator: WorkerCapabilities) -> Self {
        let master_addr = master_addr.into();
        let now = Utc::now();
        let mut nodes = BTreeMap::new();
        nodes.insert(
            0,
            NodeInfo {
                rank: 0,
                role: NodeRole::Coordinator,
                address: master_addr.clone(),
                hostname: coordinator.hostname,
                gpu_count: coordinator.gpu_count,
                connection: LOCAL_CONNECTION,
                status: NodeStatus::Registered,
                registered_at: now,
            },
        );
        Self {
            session_id: Uuid::new_v4(),
            cluster_size,
            master_addr,
            master_port,
            state: SessionState::Listening,
            nodes,
            created_at: now,
            started_at: None,
            abort_reason: None,
        }
    }

    pub fn session_id(&self) -> String {
        self.session_id.to_string()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn master_addr(&self) -> &str {
        &self.master_addr
    }

    pub fn master_port(&self) -> u16 {
        self.master_port
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    pub fn registered_count(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn is_full(&self) -> bool {
        self.registered_count() == self.cluster_size
    }

    /// Nodes in rank order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn node(&self, rank: u32) -> Option<&NodeInfo> {
        self.nodes.get(&rank)
    }

    pub fn rank_of(&self, connection: ConnectionId) -> Option<u32> {
        self.nodes
            .values()
            .find(|n| n.connection == connection)
            .map(|n| n.rank)
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CompatError::protocol(format!(
                "illegal session transition {} -> {}",
                self.state, next
            )));
        }
        tracing::info!(session = %self.session_id, from = %self.state, to = %next, "session state");
        self.state = next;
        Ok(())
    }

    /// The control port is bound; start accepting workers. A cluster of
    /// one is immediately ready.
    pub fn open(&mut self) -> Result<()> {
        self.transition(SessionState::AwaitingWorkers)?;
        if self.is_full() {
            self.transition(SessionState::ReadyPendingConfirm)?;
        }
        Ok(())
    }

    /// Register a worker under the lowest free rank.
    pub fn register(
        &mut self,
        connection: ConnectionId,
        address: &str,
        capabilities: WorkerCapabilities,
    ) -> std::result::Result<Assignment, RegistrationError> {
        if self.state != SessionState::AwaitingWorkers {
            return Err(RegistrationError::NotAccepting(self.state));
        }
        let address = address.trim();
        if !is_valid_host(address) {
            return Err(RegistrationError::Malformed(format!("invalid address '{}'", address)));
        }
        if self.rank_of(connection).is_some() {
            return Err(RegistrationError::AlreadyRegistered(connection));
        }
        if self.nodes.values().any(|n| n.address.eq_ignore_ascii_case(address)) {
            return Err(RegistrationError::DuplicateAddress(address.to_string()));
        }
        let rank = (1..self.cluster_size)
            .find(|r| !self.nodes.contains_key(r))
            .ok_or(RegistrationError::SessionFull(self.cluster_size))?;

        self.nodes.insert(
            rank,
            NodeInfo {
                rank,
                role: NodeRole::Worker,
                address: address.to_string(),
                hostname: capabilities.hostname,
                gpu_count: capabilities.gpu_count,
                connection,
                status: NodeStatus::Registered,
                registered_at: Utc::now(),
            },
        );
        tracing::info!(
            rank,
            address,
            registered = self.registered_count(),
            expected = self.cluster_size,
            "worker registered"
        );

        if self.is_full() {
            // Only fails if the state table is wrong.
            let _ = self.transition(SessionState::ReadyPendingConfirm);
        }

        Ok(Assignment {
            session_id: self.session_id(),
            rank,
            world_size: self.cluster_size,
            master_addr: self.master_addr.clone(),
            master_port: self.master_port,
        })
    }

    /// Account for a closed connection.
    pub fn disconnect(&mut self, connection: ConnectionId) -> Departure {
        let Some(rank) = self.rank_of(connection) else {
            return Departure::Unregistered;
        };
        match self.state {
            SessionState::AwaitingWorkers | SessionState::ReadyPendingConfirm => {
                let node = self.nodes.remove(&rank);
                if self.state == SessionState::ReadyPendingConfirm {
                    let _ = self.transition(SessionState::AwaitingWorkers);
                }
                match node {
                    Some(node) => {
                        tracing::warn!(rank, address = %node.address, "worker left before start, rank freed");
                        Departure::Removed(node)
                    }
                    None => Departure::Unregistered,
                }
            }
            _ => match self.nodes.get_mut(&rank) {
                Some(node) => {
                    node.status = NodeStatus::Lost;
                    Departure::Lost(node.clone())
                }
                None => Departure::Unregistered,
            },
        }
    }

    /// Apply the operator's answer. Only the exact token starts the run;
    /// anything else aborts.
    pub fn confirm(&mut self, input: &str) -> Result<()> {
        if self.state != SessionState::ReadyPendingConfirm || !self.is_full() {
            return Err(CompatError::protocol(format!(
                "cannot confirm start while {} with {}/{} nodes",
                self.state,
                self.registered_count(),
                self.cluster_size
            )));
        }
        if input.trim().eq_ignore_ascii_case(CONFIRM_TOKEN) {
            self.transition(SessionState::Running)?;
            self.started_at = Some(Utc::now());
            for node in self.nodes.values_mut() {
                node.status = NodeStatus::Participating;
            }
            Ok(())
        } else {
            let reason = format!("operator answered '{}' instead of '{}'", input.trim(), CONFIRM_TOKEN);
            self.abort(reason.clone());
            Err(CompatError::aborted(reason))
        }
    }

    /// Move to `Aborted` unless already terminal. The first reason sticks.
    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        let reason = reason.into();
        tracing::error!(session = %self.session_id, state = %self.state, reason = %reason, "session aborted");
        self.state = SessionState::Aborted;
        self.abort_reason = Some(reason);
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(SessionState::Completed)?;
        for node in self.nodes.values_mut() {
            if node.status == NodeStatus::Participating {
                node.status = NodeStatus::Done;
            }
        }
        Ok(())
    }
}
