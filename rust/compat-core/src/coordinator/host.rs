//! Coordinator role.
//!
//! One task accepts connections and one reader task per connection turns
//! frames into [`Event`]s on a single queue. The event loop in
//! [`HostLoop`] is the only writer of the [`ClusterSession`] and of every
//! connection's write half. The coordinator's own node takes part as rank 0
//! through a [`NodeAgent`] whose replies are pushed onto the same queue.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::codec::{FrameReader, FrameWriter};
use super::protocol::{Message, WorkerCapabilities};
use super::schedule::{schedule_waves, ScheduledPair};
use super::session::{
    ClusterSession, ConnectionId, Departure, NodeInfo, RegistrationError, SessionState,
    LOCAL_CONNECTION,
};
use crate::agent::NodeAgent;
use crate::bandwidth::{BandwidthMatrix, BandwidthMatrixEntry, BandwidthSample, MeshNode, ToolAvailability, ToolStatus};
use crate::collective::{CollectiveParams, CollectiveTable};
use crate::config::CompatConfig;
use crate::error::{CompatError, Result};
use crate::report;

const EVENT_QUEUE_DEPTH: usize = 256;
/// Added to every tool step's own duration before a node counts as silent.
const STEP_SLACK: Duration = Duration::from_secs(30);

type Writer = FrameWriter<OwnedWriteHalf>;

/// Everything the event loop reacts to, besides operator input.
enum Event {
    Registration {
        conn: ConnectionId,
        peer: SocketAddr,
        address: String,
        capabilities: WorkerCapabilities,
        writer: Writer,
    },
    Message {
        conn: ConnectionId,
        msg: Message,
    },
    Closed {
        conn: ConnectionId,
        error: Option<String>,
    },
}

/// Final account of a session, complete or aborted.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub state: SessionState,
    pub abort_reason: Option<String>,
    pub roster: Vec<NodeInfo>,
    pub collective: CollectiveTable,
    pub bandwidth_tool: String,
    pub tool_availability: Vec<ToolAvailability>,
    pub bandwidth: Option<BandwidthMatrix>,
}

impl SessionReport {
    /// `0` all good, `1` aborted, `2` completed with failing nodes or pairs.
    pub fn exit_code(&self) -> i32 {
        if self.state != SessionState::Completed {
            return 1;
        }
        let tools_ok = self.tool_availability.iter().all(|a| a.status.ok);
        let mesh_ok = self.bandwidth.as_ref().map_or(true, BandwidthMatrix::all_ok);
        if self.collective.all_ok() && tools_ok && mesh_ok {
            0
        } else {
            2
        }
    }

    pub fn render(&self) -> String {
        let mut sections = vec![format!("Session {} ({})", self.session_id, self.state)];
        if let Some(reason) = &self.abort_reason {
            sections.push(format!("Aborted: {}", reason));
        }
        if !self.roster.is_empty() {
            sections.push(format!("Nodes\n{}", report::render_roster(&self.roster)));
        }
        if !self.collective.is_empty() {
            sections.push(format!("Collective test\n{}", report::render_collective(&self.collective)));
        }
        if !self.tool_availability.is_empty() {
            sections.push(format!(
                "Bandwidth tool availability\n{}",
                report::render_tool_availability(&self.bandwidth_tool, &self.tool_availability)
            ));
        }
        if let Some(matrix) = self.bandwidth.as_ref().filter(|m| !m.is_empty()) {
            sections.push(format!("Pairwise bandwidth\n{}", report::render_bandwidth_pairs(matrix)));
            sections.push(format!("Bandwidth matrix (avg Gbps)\n{}", report::render_bandwidth_matrix(matrix)));
        }
        sections.join("\n\n")
    }
}

pub struct Coordinator {
    config: CompatConfig,
    agent: NodeAgent,
    listener: TcpListener,
    state_tx: watch::Sender<SessionState>,
}

impl Coordinator {
    /// Bind the control port.
    pub async fn bind(config: CompatConfig, agent: NodeAgent) -> Result<Self> {
        let addr = format!("{}:{}", config.cluster.bind_address, config.cluster.control_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| CompatError::transport_with_source(format!("cannot bind control port {}", addr), e))?;
        Ok(Self::with_listener(config, agent, listener))
    }

    pub fn with_listener(config: CompatConfig, agent: NodeAgent, listener: TcpListener) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Listening);
        Self {
            config,
            agent,
            listener,
            state_tx,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| CompatError::transport_with_source("control listener address", e))
    }

    /// Follow session state changes, e.g. to prompt the operator.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Run the whole session. Operator input lines arrive on
    /// `confirmations`; `cancel` is the operator interrupt.
    pub async fn run(self, mut confirmations: mpsc::Receiver<String>, cancel: CancellationToken) -> SessionReport {
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let stop = CancellationToken::new();
        let handshake = self.config.timeouts.handshake();

        tracing::info!(
            control = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            master_addr = %self.config.cluster.master_addr,
            master_port = self.config.cluster.master_port,
            cluster_size = self.config.cluster.cluster_size,
            "coordinator listening"
        );
        tokio::spawn(accept_loop(self.listener, events_tx.clone(), handshake, stop.clone()));

        let session = ClusterSession::new(
            self.config.cluster.cluster_size,
            self.config.cluster.master_addr.clone(),
            self.config.cluster.master_port,
            self.agent.capabilities(),
        );
        tracing::info!(session = %session.session_id(), "session created");

        let mut host = HostLoop {
            collective: CollectiveTable::new(),
            bandwidth_tool: self.config.mesh.program.clone(),
            tool_availability: Vec::new(),
            bandwidth: None,
            config: self.config,
            agent: self.agent,
            session,
            writers: HashMap::new(),
            events,
            events_tx,
            local_tasks: JoinSet::new(),
            state_tx: self.state_tx,
            cancel,
        };

        match host.drive(&mut confirmations).await {
            Ok(()) => host.finish().await,
            Err(e) => host.abort(e.reason()).await,
        }
        stop.cancel();
        host.report()
    }
}

struct HostLoop {
    config: CompatConfig,
    agent: NodeAgent,
    session: ClusterSession,
    writers: HashMap<ConnectionId, Writer>,
    events: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<Event>,
    local_tasks: JoinSet<()>,
    state_tx: watch::Sender<SessionState>,
    cancel: CancellationToken,

    collective: CollectiveTable,
    bandwidth_tool: String,
    tool_availability: Vec<ToolAvailability>,
    bandwidth: Option<BandwidthMatrix>,
}

impl HostLoop {
    fn publish_state(&self) {
        let state = self.session.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    async fn drive(&mut self, confirmations: &mut mpsc::Receiver<String>) -> Result<()> {
        self.session.open()?;
        self.publish_state();
        self.rendezvous(confirmations).await?;
        self.publish_state();
        self.broadcast_start().await?;
        self.collective_phase().await?;
        if self.config.mesh.enabled {
            self.mesh_phase().await?;
        } else {
            tracing::info!("bandwidth mesh disabled");
        }
        self.session.complete()?;
        self.publish_state();
        Ok(())
    }

    // -- Rendezvous ----------------------------------------------------------

    async fn rendezvous(&mut self, confirmations: &mut mpsc::Receiver<String>) -> Result<()> {
        let registration_secs = self.config.timeouts.registration_secs;
        let registration_deadline = Instant::now() + self.config.timeouts.registration();
        let mut confirm_deadline: Option<Instant> = None;
        let mut input_open = true;

        loop {
            let state = self.session.state();
            if state == SessionState::ReadyPendingConfirm {
                if confirm_deadline.is_none() {
                    confirm_deadline = Some(Instant::now() + self.config.timeouts.confirm());
                    self.announce_ready();
                }
                if !input_open {
                    return Err(CompatError::aborted("operator input closed before start was confirmed"));
                }
            } else {
                confirm_deadline = None;
            }
            let deadline = confirm_deadline.unwrap_or(registration_deadline);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(CompatError::aborted("interrupted by operator"));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(if confirm_deadline.is_some() {
                        CompatError::timeout("waiting for operator confirmation", self.config.timeouts.confirm_secs)
                    } else {
                        CompatError::timeout(
                            format!(
                                "waiting for workers ({}/{} nodes registered)",
                                self.session.registered_count(),
                                self.session.cluster_size()
                            ),
                            registration_secs,
                        )
                    });
                }
                line = confirmations.recv(), if input_open => match line {
                    None => input_open = false,
                    Some(line) if state == SessionState::ReadyPendingConfirm => {
                        return self.session.confirm(&line);
                    }
                    Some(line) => tracing::warn!(
                        input = %line.trim(),
                        registered = self.session.registered_count(),
                        expected = self.session.cluster_size(),
                        "input ignored until every node has registered"
                    ),
                },
                event = self.events.recv() => {
                    if let Some(event) = event {
                        self.rendezvous_event(event).await;
                    }
                }
            }
            self.publish_state();
        }
    }

    fn announce_ready(&self) {
        tracing::info!(
            nodes = self.session.registered_count(),
            "all nodes registered, waiting for operator confirmation"
        );
        for node in self.session.nodes() {
            tracing::info!(rank = node.rank, hostname = %node.hostname, address = %node.address, gpus = node.gpu_count, "roster");
        }
    }

    async fn rendezvous_event(&mut self, event: Event) {
        match event {
            Event::Registration {
                conn,
                peer,
                address,
                capabilities,
                mut writer,
            } => {
                let hostname = capabilities.hostname.clone();
                match self.session.register(conn, &address, capabilities) {
                    Ok(assignment) => {
                        tracing::info!(rank = assignment.rank, %peer, %hostname, "sending assignment");
                        match writer.send(&Message::Registered { assignment }).await {
                            Ok(()) => {
                                self.writers.insert(conn, writer);
                            }
                            Err(e) => {
                                tracing::warn!(%peer, error = %e, "worker vanished during registration");
                                self.session.disconnect(conn);
                            }
                        }
                    }
                    Err(e) => reject(writer, peer, e).await,
                }
            }
            Event::Message {
                conn,
                msg: Message::Abort { reason },
            } => {
                tracing::warn!(conn, reason = %reason, "worker withdrew before start");
                self.writers.remove(&conn);
                self.session.disconnect(conn);
            }
            Event::Message { conn, msg } => {
                tracing::warn!(conn, kind = msg.kind(), "unexpected message before start");
            }
            Event::Closed { conn, error } => {
                self.writers.remove(&conn);
                if let Departure::Removed(node) = self.session.disconnect(conn) {
                    tracing::warn!(rank = node.rank, address = %node.address, error = ?error, "worker disconnected before start");
                }
            }
        }
    }

    // -- Running -------------------------------------------------------------

    fn params_for(&self, rank: u32) -> CollectiveParams {
        CollectiveParams {
            rank,
            world_size: self.session.cluster_size(),
            master_addr: self.session.master_addr().to_string(),
            master_port: self.session.master_port(),
            timeout_secs: self.config.collective.timeout_secs,
        }
    }

    /// Send a command to a rank. The local rank runs it on a task whose
    /// reply comes back through the event queue.
    async fn dispatch(&mut self, rank: u32, msg: Message) -> Result<()> {
        let conn = self
            .session
            .node(rank)
            .map(|n| n.connection)
            .ok_or_else(|| CompatError::protocol(format!("no node with rank {}", rank)))?;

        if conn == LOCAL_CONNECTION {
            let agent = self.agent.clone();
            let events = self.events_tx.clone();
            self.local_tasks.spawn(async move {
                if let Some(reply) = agent.handle(msg).await {
                    let _ = events.send(Event::Message { conn: LOCAL_CONNECTION, msg: reply }).await;
                }
            });
            return Ok(());
        }

        let writer = self
            .writers
            .get_mut(&conn)
            .ok_or_else(|| CompatError::aborted(format!("connection to rank {} is gone", rank)))?;
        writer
            .send(&msg)
            .await
            .map_err(|e| CompatError::aborted(format!("lost connection to rank {}: {}", rank, e)))
    }

    /// Start every rank, or none. Queued events are handled first so a
    /// connection that died just before confirmation is noticed.
    async fn broadcast_start(&mut self) -> Result<()> {
        while let Ok(event) = self.events.try_recv() {
            self.running_event(event, &BTreeSet::new(), &mut BTreeMap::new(), |_, _| false)
                .await?;
        }
        let ranks: Vec<(u32, ConnectionId)> = self.session.nodes().map(|n| (n.rank, n.connection)).collect();
        if let Some((rank, _)) = ranks
            .iter()
            .find(|(_, conn)| *conn != LOCAL_CONNECTION && !self.writers.contains_key(conn))
        {
            return Err(CompatError::aborted(format!("rank {} has no live connection at start", rank)));
        }

        let session_id = self.session.session_id();
        tracing::info!(session = %session_id, nodes = ranks.len(), "broadcasting start");
        for (rank, _) in ranks {
            let msg = Message::StartCollective {
                session_id: session_id.clone(),
                params: self.params_for(rank),
            };
            self.dispatch(rank, msg).await?;
        }
        Ok(())
    }

    /// Handle one event while a phase is running. Replies from ranks in
    /// `expected` that pass `accept` are collected into `replies`; losing a
    /// registered node or receiving its abort is fatal.
    async fn running_event<F>(
        &mut self,
        event: Event,
        expected: &BTreeSet<u32>,
        replies: &mut BTreeMap<u32, Message>,
        mut accept: F,
    ) -> Result<()>
    where
        F: FnMut(u32, &Message) -> bool,
    {
        match event {
            Event::Registration { peer, writer, .. } => {
                reject(writer, peer, RegistrationError::NotAccepting(self.session.state())).await;
            }
            Event::Message { conn, msg } => {
                let Some(rank) = self.session.rank_of(conn) else {
                    tracing::debug!(conn, kind = msg.kind(), "message from unregistered connection");
                    return Ok(());
                };
                if let Message::Abort { reason } = &msg {
                    return Err(CompatError::aborted(format!("rank {} aborted: {}", rank, reason)));
                }
                if expected.contains(&rank) && !replies.contains_key(&rank) && accept(rank, &msg) {
                    replies.insert(rank, msg);
                } else {
                    tracing::debug!(rank, kind = msg.kind(), "ignoring stale reply");
                }
            }
            Event::Closed { conn, error } => {
                self.writers.remove(&conn);
                if let Departure::Lost(node) = self.session.disconnect(conn) {
                    return Err(CompatError::aborted(format!(
                        "rank {} ({}) disconnected during the run{}",
                        node.rank,
                        node.address,
                        error.map(|e| format!(": {}", e)).unwrap_or_default()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Collect one reply per rank in `expected` until `deadline`. Ranks
    /// that stay silent are simply absent from the result.
    async fn gather<F>(&mut self, expected: &BTreeSet<u32>, deadline: Instant, accept: F) -> Result<BTreeMap<u32, Message>>
    where
        F: FnMut(u32, &Message) -> bool,
    {
        let mut replies = BTreeMap::new();
        self.gather_into(expected, deadline, &mut replies, accept).await?;
        Ok(replies)
    }

    /// Like [`Self::gather`], but replies received before a fatal event
    /// stay in `replies`.
    async fn gather_into<F>(
        &mut self,
        expected: &BTreeSet<u32>,
        deadline: Instant,
        replies: &mut BTreeMap<u32, Message>,
        mut accept: F,
    ) -> Result<()>
    where
        F: FnMut(u32, &Message) -> bool,
    {
        while replies.len() < expected.len() {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(CompatError::aborted("interrupted by operator"));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let missing: Vec<_> = expected.iter().filter(|r| !replies.contains_key(*r)).collect();
                    tracing::warn!(?missing, "no reply before deadline");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.running_event(event, expected, replies, &mut accept).await?,
                    None => return Err(CompatError::aborted("event queue closed")),
                },
            }
        }
        Ok(())
    }

    async fn collective_phase(&mut self) -> Result<()> {
        let ranks: BTreeSet<u32> = self.session.nodes().map(|n| n.rank).collect();
        let waited = self.config.collective.report_deadline();
        tracing::info!(ranks = ranks.len(), deadline_secs = waited.as_secs(), "waiting for collective results");

        let deadline = Instant::now() + waited;
        let mut replies = BTreeMap::new();
        let gathered = self
            .gather_into(&ranks, deadline, &mut replies, |_, m| matches!(m, Message::CollectiveResult { .. }))
            .await;
        // Partial results are kept even when the phase ends fatally.
        for (rank, msg) in replies {
            if let Message::CollectiveResult { mut result } = msg {
                if result.rank != rank {
                    tracing::warn!(rank, reported = result.rank, "result rank differs from sender, using sender");
                    result.rank = rank;
                }
                tracing::info!(rank, status = result.status.label(), "collective result");
                self.collective.record(result);
            }
        }
        gathered?;
        let roster: Vec<(u32, String)> = self.session.nodes().map(|n| (n.rank, n.hostname.clone())).collect();
        self.collective.fill_missing(
            roster.iter().map(|(r, h)| (*r, h.as_str())),
            self.session.cluster_size(),
            waited,
        );
        Ok(())
    }

    // -- Mesh ----------------------------------------------------------------

    fn mesh_roster(&self) -> Vec<MeshNode> {
        self.session
            .nodes()
            .map(|n| MeshNode {
                rank: n.rank,
                hostname: n.hostname.clone(),
                address: n.address.clone(),
            })
            .collect()
    }

    async fn mesh_phase(&mut self) -> Result<()> {
        let roster = self.mesh_roster();
        if roster.len() < 2 {
            tracing::info!("fewer than two nodes, no pairs to measure");
            return Ok(());
        }

        let ranks: BTreeSet<u32> = roster.iter().map(|n| n.rank).collect();
        for rank in &ranks {
            self.dispatch(*rank, Message::CheckBandwidthTool).await?;
        }
        let deadline = Instant::now() + Duration::from_secs(self.config.probe.command_timeout_secs) + STEP_SLACK;
        let mut replies = self
            .gather(&ranks, deadline, |_, m| matches!(m, Message::BandwidthToolStatus { .. }))
            .await?;
        self.tool_availability = roster
            .iter()
            .map(|node| {
                let status = match replies.remove(&node.rank) {
                    Some(Message::BandwidthToolStatus { status }) => status,
                    _ => ToolStatus {
                        ok: false,
                        detail: "no reply to availability check".to_string(),
                    },
                };
                ToolAvailability {
                    node: node.clone(),
                    status,
                }
            })
            .collect();
        let available: HashSet<u32> = self
            .tool_availability
            .iter()
            .filter(|a| a.status.ok)
            .map(|a| a.node.rank)
            .collect();

        self.bandwidth = Some(BandwidthMatrix::new(roster.clone()));
        let waves = schedule_waves(roster.len(), self.config.mesh.max_concurrent_pairs, self.config.mesh.port_base);
        let total = waves.len();
        for (index, wave) in waves.into_iter().enumerate() {
            tracing::info!(wave = index + 1, of = total, pairs = wave.len(), "bandwidth wave");

            let mut runnable = Vec::new();
            for pair in wave {
                let missing: Vec<String> = [&roster[pair.a], &roster[pair.b]]
                    .iter()
                    .filter(|n| !available.contains(&n.rank))
                    .map(|n| format!("rank {}", n.rank))
                    .collect();
                if missing.is_empty() {
                    runnable.push(pair);
                } else {
                    let error = format!("{} unavailable on {}", self.bandwidth_tool, missing.join(", "));
                    self.record_pair(&roster, pair, BandwidthSample::failed(&error), BandwidthSample::failed(&error));
                }
            }
            if runnable.is_empty() {
                continue;
            }

            let forward = self.measure(&roster, &runnable, Direction::Forward).await?;
            let reverse = self.measure(&roster, &runnable, Direction::Reverse).await?;
            for ((pair, f), r) in runnable.into_iter().zip(forward).zip(reverse) {
                self.record_pair(&roster, pair, f, r);
            }
        }
        Ok(())
    }

    fn record_pair(&mut self, roster: &[MeshNode], pair: ScheduledPair, forward: BandwidthSample, reverse: BandwidthSample) {
        let entry = BandwidthMatrixEntry {
            a: roster[pair.a].clone(),
            b: roster[pair.b].clone(),
            forward,
            reverse,
        };
        tracing::info!(
            a = entry.a.rank,
            b = entry.b.rank,
            ok = entry.is_ok(),
            avg_gbps = entry.average_gbit_per_sec().unwrap_or(0.0),
            "pair measured"
        );
        if let Some(matrix) = self.bandwidth.as_mut() {
            matrix.record(entry);
        }
    }

    /// Measure one direction of every pair in a wave: start servers, run
    /// clients, reap servers. Returns one sample per pair, in order.
    async fn measure(&mut self, roster: &[MeshNode], pairs: &[ScheduledPair], direction: Direction) -> Result<Vec<BandwidthSample>> {
        let legs: Vec<Leg> = pairs
            .iter()
            .map(|pair| direction.leg(roster, pair))
            .collect();
        let mut samples: Vec<Option<BandwidthSample>> = vec![None; legs.len()];
        let server_port: HashMap<u32, u16> = legs.iter().map(|l| (l.server.rank, l.port)).collect();
        let client_port: HashMap<u32, u16> = legs.iter().map(|l| (l.client.rank, l.port)).collect();

        // Servers.
        for leg in &legs {
            self.dispatch(leg.server.rank, Message::BandwidthServerStart { port: leg.port }).await?;
        }
        let servers: BTreeSet<u32> = legs.iter().map(|l| l.server.rank).collect();
        let started = self
            .gather(&servers, Instant::now() + STEP_SLACK, |rank, m| {
                matches!(m, Message::BandwidthServerStarted { port, .. } if server_port.get(&rank) == Some(port))
            })
            .await?;
        for (leg, sample) in legs.iter().zip(samples.iter_mut()) {
            match started.get(&leg.server.rank) {
                Some(Message::BandwidthServerStarted { ok: true, .. }) => {}
                Some(Message::BandwidthServerStarted { error, .. }) => {
                    *sample = Some(BandwidthSample::failed(format!(
                        "server on rank {} failed: {}",
                        leg.server.rank, error
                    )));
                }
                _ => {
                    *sample = Some(BandwidthSample::failed(format!(
                        "rank {} did not start its server",
                        leg.server.rank
                    )));
                }
            }
        }
        if samples.iter().all(Option::is_some) {
            return Ok(samples.into_iter().flatten().collect());
        }
        tokio::time::sleep(Duration::from_millis(self.config.mesh.server_startup_delay_ms)).await;

        // Clients.
        let duration_secs = self.config.mesh.duration_secs;
        let mut clients = BTreeSet::new();
        for (leg, sample) in legs.iter().zip(samples.iter()) {
            if sample.is_none() {
                clients.insert(leg.client.rank);
                let msg = Message::BandwidthClientRun {
                    target: leg.server.address.clone(),
                    port: leg.port,
                    duration_secs,
                };
                self.dispatch(leg.client.rank, msg).await?;
            }
        }
        let deadline = Instant::now() + Duration::from_secs(duration_secs) + STEP_SLACK;
        let mut results = self
            .gather(&clients, deadline, |rank, m| {
                matches!(m, Message::BandwidthClientResult { port, .. } if client_port.get(&rank) == Some(port))
            })
            .await?;
        for (leg, sample) in legs.iter().zip(samples.iter_mut()) {
            if sample.is_some() {
                continue;
            }
            *sample = Some(match results.remove(&leg.client.rank) {
                Some(Message::BandwidthClientResult { sample, .. }) => sample,
                _ => BandwidthSample::failed(format!(
                    "no result from rank {} within {}s",
                    leg.client.rank,
                    duration_secs + STEP_SLACK.as_secs()
                )),
            });
        }

        // Reap the servers that were started; a client failure leaves them
        // waiting, which the bounded wait cleans up.
        let mut reaping = BTreeSet::new();
        for leg in &legs {
            if matches!(started.get(&leg.server.rank), Some(Message::BandwidthServerStarted { ok: true, .. })) {
                reaping.insert(leg.server.rank);
                let msg = Message::BandwidthServerWait {
                    port: leg.port,
                    timeout_secs: STEP_SLACK.as_secs(),
                };
                self.dispatch(leg.server.rank, msg).await?;
            }
        }
        let finished = self
            .gather(&reaping, Instant::now() + STEP_SLACK + STEP_SLACK, |rank, m| {
                matches!(m, Message::BandwidthServerFinished { port, .. } if server_port.get(&rank) == Some(port))
            })
            .await?;
        for (rank, msg) in finished {
            if let Message::BandwidthServerFinished { ok: false, error, port } = msg {
                tracing::warn!(rank, port, error = %error, "bandwidth server did not finish cleanly");
            }
        }

        Ok(samples
            .into_iter()
            .map(|s| s.unwrap_or_else(|| BandwidthSample::failed("not measured")))
            .collect())
    }

    // -- Teardown ------------------------------------------------------------

    /// Tell every worker the session is over and wait briefly for acks.
    async fn finish(&mut self) {
        tracing::info!(session = %self.session.session_id(), "session completed, shutting down workers");
        let mut pending: HashSet<ConnectionId> = self.writers.keys().copied().collect();
        for (conn, writer) in self.writers.iter_mut() {
            if writer.send(&Message::Shutdown).await.is_err() {
                pending.remove(conn);
            }
        }

        let deadline = Instant::now() + self.config.timeouts.shutdown_ack();
        while !pending.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(remaining = pending.len(), "workers did not acknowledge shutdown");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(Event::Message { conn, msg: Message::ShutdownAck }) | Some(Event::Closed { conn, .. }) => {
                        pending.remove(&conn);
                    }
                    Some(Event::Registration { peer, writer, .. }) => {
                        reject(writer, peer, RegistrationError::NotAccepting(self.session.state())).await;
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        self.teardown().await;
    }

    /// Abort the session and notify every connected worker.
    async fn abort(&mut self, reason: String) {
        self.session.abort(reason.clone());
        self.publish_state();
        let reason = self.session.abort_reason().map(str::to_string).unwrap_or(reason);
        for (conn, writer) in self.writers.iter_mut() {
            if let Err(e) = writer.send(&Message::Abort { reason: reason.clone() }).await {
                tracing::debug!(conn, error = %e, "abort not delivered");
            }
        }
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        for (_, mut writer) in self.writers.drain() {
            writer.shutdown().await;
        }
        self.local_tasks.abort_all();
        self.agent.shutdown().await;
    }

    fn report(self) -> SessionReport {
        SessionReport {
            session_id: self.session.session_id(),
            state: self.session.state(),
            abort_reason: self.session.abort_reason().map(str::to_string),
            roster: self.session.nodes().cloned().collect(),
            collective: self.collective,
            bandwidth_tool: self.bandwidth_tool,
            tool_availability: self.tool_availability,
            bandwidth: self.bandwidth,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    /// Lower rank sends to higher rank.
    Forward,
    Reverse,
}

struct Leg {
    server: MeshNode,
    client: MeshNode,
    port: u16,
}

impl Direction {
    fn leg(self, roster: &[MeshNode], pair: &ScheduledPair) -> Leg {
        let (a, b) = (&roster[pair.a], &roster[pair.b]);
        match self {
            Self::Forward => Leg {
                server: b.clone(),
                client: a.clone(),
                port: pair.forward_port,
            },
            Self::Reverse => Leg {
                server: a.clone(),
                client: b.clone(),
                port: pair.reverse_port,
            },
        }
    }
}

async fn reject(mut writer: Writer, peer: SocketAddr, error: RegistrationError) {
    tracing::warn!(%peer, error = %error, "registration rejected");
    let _ = writer.send(&Message::Rejected { reason: error.to_string() }).await;
    writer.shutdown().await;
}

async fn accept_loop(listener: TcpListener, events: mpsc::Sender<Event>, handshake: Duration, stop: CancellationToken) {
    let mut next_conn: ConnectionId = LOCAL_CONNECTION + 1;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn = next_conn;
                    next_conn += 1;
                    tracing::debug!(conn, %peer, "connection accepted");
                    tokio::spawn(connection_task(conn, stream, peer, events.clone(), handshake, stop.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

/// Per-connection reader: handshake, then forward every frame.
async fn connection_task(
    conn: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::Sender<Event>,
    handshake: Duration,
    stop: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    let mut reader = FrameReader::new(read);
    let writer = FrameWriter::new(write);

    let first = tokio::select! {
        _ = stop.cancelled() => return,
        first = tokio::time::timeout(handshake, reader.read()) => first,
    };
    let (address, capabilities) = match first {
        Ok(Ok(Some(Message::Register { address, capabilities }))) => (address, capabilities),
        Ok(Ok(Some(other))) => {
            let error = RegistrationError::Malformed(format!("expected register, got {}", other.kind()));
            return reject(writer, peer, error).await;
        }
        Ok(Ok(None)) => return,
        Ok(Err(e)) => return reject(writer, peer, RegistrationError::Malformed(e.to_string())).await,
        Err(_) => {
            let error = RegistrationError::Malformed(format!("no register within {}s", handshake.as_secs()));
            return reject(writer, peer, error).await;
        }
    };
    let address = if address.trim().is_empty() {
        peer.ip().to_string()
    } else {
        address
    };
    let registration = Event::Registration {
        conn,
        peer,
        address,
        capabilities,
        writer,
    };
    if events.send(registration).await.is_err() {
        return;
    }

    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return,
            next = reader.read() => next,
        };
        let event = match next {
            Ok(Some(msg)) => Event::Message { conn, msg },
            Ok(None) => Event::Closed { conn, error: None },
            Err(e) => Event::Closed {
                conn,
                error: Some(e.to_string()),
            },
        };
        let closed = matches!(event, Event::Closed { .. });
        if events.send(event).await.is_err() || closed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::CollectiveStatus;
    use crate::testing::{FakeBandwidth, FakeCollective};
    use std::sync::Arc;

    fn local_agent() -> NodeAgent {
        NodeAgent::new(
            "coord",
            Arc::new(FakeCollective::ok(180.0)),
            Arc::new(FakeBandwidth::new(9.4e9)),
        )
    }

    fn single_node_config() -> CompatConfig {
        let mut config = CompatConfig::default();
        config.cluster.cluster_size = 1;
        config.cluster.master_addr = "127.0.0.1".to_string();
        config
    }

    async fn coordinator(config: CompatConfig) -> Coordinator {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Coordinator::with_listener(config, local_agent(), listener)
    }

    #[tokio::test]
    async fn test_single_node_session_completes() {
        let coord = coordinator(single_node_config()).await;
        let mut state = coord.subscribe();
        let (tx, rx) = mpsc::channel(4);
        let run = tokio::spawn(coord.run(rx, CancellationToken::new()));

        state
            .wait_for(|s| *s == SessionState::ReadyPendingConfirm)
            .await
            .unwrap();
        tx.send("start".to_string()).await.unwrap();

        let report = run.await.unwrap();
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.collective.len(), 1);
        assert!(report.collective.all_ok());
        assert!(report.bandwidth.is_none());
        assert_eq!(report.exit_code(), 0);
        assert!(report.render().contains("Collective test"));
    }

    #[tokio::test]
    async fn test_wrong_confirmation_aborts() {
        let coord = coordinator(single_node_config()).await;
        let mut state = coord.subscribe();
        let (tx, rx) = mpsc::channel(4);
        let run = tokio::spawn(coord.run(rx, CancellationToken::new()));

        state
            .wait_for(|s| *s == SessionState::ReadyPendingConfirm)
            .await
            .unwrap();
        tx.send("yes".to_string()).await.unwrap();

        let report = run.await.unwrap();
        assert_eq!(report.state, SessionState::Aborted);
        assert!(report.collective.is_empty());
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_closed_input_aborts() {
        let coord = coordinator(single_node_config()).await;
        let (tx, rx) = mpsc::channel(4);
        drop(tx);
        let report = coord.run(rx, CancellationToken::new()).await;
        assert_eq!(report.state, SessionState::Aborted);
        let reason = report.abort_reason.unwrap();
        assert!(reason.contains("input closed"));
        assert!(!reason.starts_with("Session aborted"), "{}", reason);
    }

    #[tokio::test]
    async fn test_interrupt_aborts() {
        let mut config = single_node_config();
        config.cluster.cluster_size = 2;
        let coord = coordinator(config).await;
        let (_tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = coord.run(rx, cancel).await;
        assert_eq!(report.state, SessionState::Aborted);
        assert!(report.abort_reason.unwrap().contains("interrupted"));
    }

    #[tokio::test]
    async fn test_local_collective_timeout_recorded() {
        let mut config = single_node_config();
        config.collective.timeout_secs = 1;
        config.collective.report_grace_secs = 0;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent = NodeAgent::new(
            "coord",
            Arc::new(FakeCollective::hanging()),
            Arc::new(FakeBandwidth::new(9.4e9)),
        );
        let coord = Coordinator::with_listener(config, agent, listener);
        let mut state = coord.subscribe();
        let (tx, rx) = mpsc::channel(4);
        let run = tokio::spawn(coord.run(rx, CancellationToken::new()));
        state
            .wait_for(|s| *s == SessionState::ReadyPendingConfirm)
            .await
            .unwrap();
        tx.send("start".to_string()).await.unwrap();

        let report = run.await.unwrap();
        assert_eq!(report.state, SessionState::Completed);
        let row = report.collective.rows().next().unwrap();
        assert_eq!(row.status, CollectiveStatus::Timeout);
        assert_eq!(report.exit_code(), 2);
    }
}
