//! Worker role.
//!
//! A worker connects out to the coordinator, registers, waits (bounded)
//! for the start signal and then executes commands until told to shut
//! down. Frames are read on a dedicated task so the main loop only ever
//! waits on channels.

use std::fmt;
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::codec::{FrameReader, FrameWriter};
use super::protocol::{Assignment, Message};
use crate::agent::NodeAgent;
use crate::collective::CollectiveTestResult;
use crate::config::CompatConfig;
use crate::error::{CompatError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Registered,
    AwaitingStart,
    Participating,
    Done,
    Aborted,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Registered => "registered",
            Self::AwaitingStart => "awaiting_start",
            Self::Participating => "participating",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub state: WorkerState,
    pub assignment: Option<Assignment>,
    pub reason: Option<String>,
    /// This node's own collective result, when it ran.
    pub collective: Option<CollectiveTestResult>,
}

impl WorkerOutcome {
    pub fn exit_code(&self) -> i32 {
        match self.state {
            WorkerState::Done => 0,
            _ => 1,
        }
    }
}

enum Inbound {
    Frame(Message),
    Closed(Option<String>),
}

/// How a connection ended before the run started.
enum Interrupted {
    /// Connection lost; registering again is allowed.
    Lost(String),
    /// The session is over for this worker.
    Fatal(CompatError),
}

type Writer = FrameWriter<OwnedWriteHalf>;

pub struct WorkerClient {
    config: CompatConfig,
    agent: NodeAgent,
    state: WorkerState,
    assignment: Option<Assignment>,
    collective: Option<CollectiveTestResult>,
}

impl WorkerClient {
    pub fn new(config: CompatConfig, agent: NodeAgent) -> Self {
        Self {
            config,
            agent,
            state: WorkerState::Connecting,
            assignment: None,
            collective: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn set_state(&mut self, next: WorkerState) {
        if self.state != next {
            tracing::info!(from = %self.state, to = %next, "worker state");
            self.state = next;
        }
    }

    fn coordinator_addr(&self) -> String {
        format!("{}:{}", self.config.cluster.host, self.config.cluster.control_port)
    }

    /// Run until the session ends for this worker.
    pub async fn run(mut self, cancel: CancellationToken) -> WorkerOutcome {
        let result = self.session(&cancel).await;
        self.agent.shutdown().await;
        let reason = match result {
            Ok(()) => {
                self.set_state(WorkerState::Done);
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "worker aborted");
                self.set_state(WorkerState::Aborted);
                Some(e.reason())
            }
        };
        WorkerOutcome {
            state: self.state,
            assignment: self.assignment,
            reason,
            collective: self.collective,
        }
    }

    async fn session(&mut self, cancel: &CancellationToken) -> Result<()> {
        let start_deadline = Instant::now() + self.config.timeouts.start();
        loop {
            self.set_state(WorkerState::Connecting);
            let stream = self.connect_with_retry(cancel).await?;
            let (inbound, writer) = split(stream);
            match self.await_start(inbound, writer, start_deadline, cancel).await {
                Ok(()) => return Ok(()),
                Err(Interrupted::Lost(reason)) => {
                    tracing::warn!(reason = %reason, "connection lost before start, registering again");
                    self.assignment = None;
                }
                Err(Interrupted::Fatal(e)) => return Err(e),
            }
        }
    }

    /// Connect with exponential backoff, up to the configured attempts.
    async fn connect_with_retry(&self, cancel: &CancellationToken) -> Result<TcpStream> {
        let addr = self.coordinator_addr();
        let attempts = self.config.timeouts.max_connect_attempts;
        let mut delay = Duration::from_millis(self.config.timeouts.reconnect_delay_ms);
        let max_delay = delay.max(Duration::from_secs(30));
        let mut attempt = 0;

        loop {
            attempt += 1;
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    tracing::info!(coordinator = %addr, attempt, "connected");
                    return Ok(stream);
                }
                Err(e) if attempt >= attempts => {
                    return Err(CompatError::transport_with_source(
                        format!("failed to connect to {} after {} attempts", addr, attempt),
                        e,
                    ));
                }
                Err(e) => {
                    tracing::warn!(coordinator = %addr, attempt, error = %e, "connect failed, retrying");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(CompatError::aborted("interrupted by operator")),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = std::cmp::min(delay * 2, max_delay);
        }
    }

    /// Register and wait for the start signal, then participate.
    async fn await_start(
        &mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut writer: Writer,
        start_deadline: Instant,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Interrupted> {
        let address = match &self.config.cluster.advertise_addr {
            Some(addr) => addr.clone(),
            None => String::new(),
        };
        let register = Message::Register {
            address,
            capabilities: self.agent.capabilities(),
        };
        writer
            .send(&register)
            .await
            .map_err(|e| Interrupted::Lost(e.to_string()))?;

        let reply_deadline = Instant::now() + self.config.timeouts.register_reply();
        let reply = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Interrupted::Fatal(abort(&mut writer, "interrupted by operator").await));
            }
            _ = tokio::time::sleep_until(reply_deadline) => {
                return Err(Interrupted::Fatal(CompatError::timeout(
                    "waiting for registration reply",
                    self.config.timeouts.register_reply_secs,
                )));
            }
            reply = inbound.recv() => reply,
        };
        match reply {
            Some(Inbound::Frame(Message::Registered { assignment })) => {
                tracing::info!(
                    rank = assignment.rank,
                    world_size = assignment.world_size,
                    session = %assignment.session_id,
                    "registered"
                );
                self.assignment = Some(assignment);
                self.set_state(WorkerState::Registered);
            }
            Some(Inbound::Frame(Message::Rejected { reason })) => {
                return Err(Interrupted::Fatal(CompatError::registration(reason)));
            }
            Some(Inbound::Frame(Message::Abort { reason })) => {
                return Err(Interrupted::Fatal(CompatError::aborted(format!("coordinator aborted: {}", reason))));
            }
            Some(Inbound::Frame(other)) => {
                return Err(Interrupted::Fatal(CompatError::protocol(format!(
                    "expected registration reply, got {}",
                    other.kind()
                ))));
            }
            Some(Inbound::Closed(error)) => {
                return Err(Interrupted::Lost(
                    error.unwrap_or_else(|| "connection closed before registration reply".to_string()),
                ));
            }
            None => return Err(Interrupted::Lost("reader stopped".to_string())),
        }

        self.set_state(WorkerState::AwaitingStart);
        let first = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Interrupted::Fatal(abort(&mut writer, "interrupted by operator").await));
                }
                _ = tokio::time::sleep_until(start_deadline) => {
                    let secs = self.config.timeouts.start_secs;
                    let reason = format!("no start signal within {}s", secs);
                    abort(&mut writer, &reason).await;
                    return Err(Interrupted::Fatal(CompatError::timeout("waiting for start", secs)));
                }
                frame = inbound.recv() => match frame {
                    Some(Inbound::Frame(msg @ Message::StartCollective { .. })) => break msg,
                    Some(Inbound::Frame(Message::Abort { reason })) | Some(Inbound::Frame(Message::Rejected { reason })) => {
                        return Err(Interrupted::Fatal(CompatError::aborted(format!("coordinator aborted: {}", reason))));
                    }
                    Some(Inbound::Frame(Message::Shutdown)) => {
                        return Err(Interrupted::Fatal(CompatError::aborted("coordinator shut down before start")));
                    }
                    Some(Inbound::Frame(other)) => {
                        tracing::warn!(kind = other.kind(), "unexpected message while awaiting start");
                    }
                    Some(Inbound::Closed(error)) => {
                        return Err(Interrupted::Lost(error.unwrap_or_else(|| "closed by coordinator".to_string())));
                    }
                    None => return Err(Interrupted::Lost("reader stopped".to_string())),
                },
            }
        };

        self.set_state(WorkerState::Participating);
        self.participate(first, inbound, writer, cancel)
            .await
            .map_err(Interrupted::Fatal)
    }

    /// Execute commands concurrently with reading, so an abort is seen
    /// even while a long command runs.
    async fn participate(
        &mut self,
        first: Message,
        mut inbound: mpsc::Receiver<Inbound>,
        mut writer: Writer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (reply_tx, mut replies) = mpsc::channel::<Message>(16);
        let mut tasks = JoinSet::new();
        self.spawn_command(&mut tasks, &reply_tx, first);

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break Err(abort(&mut writer, "interrupted by operator").await);
                }
                Some(reply) = replies.recv() => {
                    if let Message::CollectiveResult { result } = &reply {
                        tracing::info!(status = result.status.label(), error = %result.error, "local collective finished");
                        self.collective = Some(result.clone());
                    }
                    if let Err(e) = writer.send(&reply).await {
                        break Err(CompatError::aborted(format!("lost coordinator during the run: {}", e)));
                    }
                }
                frame = inbound.recv() => match frame {
                    Some(Inbound::Frame(Message::Shutdown)) => {
                        tracing::info!("coordinator finished the session");
                        if let Err(e) = writer.send(&Message::ShutdownAck).await {
                            tracing::debug!(error = %e, "shutdown ack not delivered");
                        }
                        break Ok(());
                    }
                    Some(Inbound::Frame(Message::Abort { reason })) => {
                        break Err(CompatError::aborted(format!("coordinator aborted: {}", reason)));
                    }
                    Some(Inbound::Frame(msg)) if msg.is_command() => {
                        self.spawn_command(&mut tasks, &reply_tx, msg);
                    }
                    Some(Inbound::Frame(other)) => {
                        tracing::warn!(kind = other.kind(), "unexpected message during the run");
                    }
                    Some(Inbound::Closed(error)) => {
                        break Err(CompatError::aborted(format!(
                            "lost coordinator during the run{}",
                            error.map(|e| format!(": {}", e)).unwrap_or_default()
                        )));
                    }
                    None => break Err(CompatError::aborted("reader stopped during the run")),
                },
            }
        };
        tasks.abort_all();
        writer.shutdown().await;
        result
    }

    fn spawn_command(&self, tasks: &mut JoinSet<()>, replies: &mpsc::Sender<Message>, command: Message) {
        tracing::debug!(kind = command.kind(), "command");
        let agent = self.agent.clone();
        let replies = replies.clone();
        tasks.spawn(async move {
            if let Some(reply) = agent.handle(command).await {
                let _ = replies.send(reply).await;
            }
        });
    }
}

/// Tell the coordinator this worker is leaving, then report why.
async fn abort(writer: &mut Writer, reason: &str) -> CompatError {
    if let Err(e) = writer
        .send(&Message::Abort {
            reason: reason.to_string(),
        })
        .await
    {
        tracing::debug!(error = %e, "abort not delivered");
    }
    writer.shutdown().await;
    CompatError::aborted(reason)
}

/// Split a connection into a channel of inbound frames and a writer.
fn split(stream: TcpStream) -> (mpsc::Receiver<Inbound>, Writer) {
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut reader = FrameReader::new(read);
        loop {
            let inbound = match reader.read().await {
                Ok(Some(msg)) => Inbound::Frame(msg),
                Ok(None) => Inbound::Closed(None),
                Err(e) => Inbound::Closed(Some(e.to_string())),
            };
            let closed = matches!(inbound, Inbound::Closed(_));
            if tx.send(inbound).await.is_err() || closed {
                return;
            }
        }
    });
    (rx, FrameWriter::new(write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::CollectiveParams;
    use crate::testing::{FakeBandwidth, FakeCollective};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn agent() -> NodeAgent {
        NodeAgent::new(
            "worker-a",
            Arc::new(FakeCollective::ok(178.0)),
            Arc::new(FakeBandwidth::new(9.4e9)),
        )
    }

    fn config(port: u16) -> CompatConfig {
        let mut config = CompatConfig::default();
        config.cluster.host = "127.0.0.1".to_string();
        config.cluster.control_port = port;
        config.cluster.advertise_addr = Some("10.0.0.2".to_string());
        config.timeouts.max_connect_attempts = 2;
        config.timeouts.reconnect_delay_ms = 10;
        config
    }

    #[tokio::test]
    async fn test_connect_gives_up() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let outcome = WorkerClient::new(config(port), agent())
            .run(CancellationToken::new())
            .await;
        assert_eq!(outcome.state, WorkerState::Aborted);
        assert!(outcome.reason.as_ref().unwrap().contains("after 2 attempts"));
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_rejection_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, write) = stream.into_split();
            let mut reader = FrameReader::new(read);
            let mut writer = FrameWriter::new(write);
            let first = reader.read().await.unwrap().unwrap();
            assert!(matches!(first, Message::Register { ref address, .. } if address == "10.0.0.2"));
            writer
                .send(&Message::Rejected {
                    reason: "address 10.0.0.2 is already registered".to_string(),
                })
                .await
                .unwrap();
        });

        let outcome = WorkerClient::new(config(port), agent())
            .run(CancellationToken::new())
            .await;
        server.await.unwrap();
        assert_eq!(outcome.state, WorkerState::Aborted);
        assert!(outcome.reason.unwrap().contains("already registered"));
    }

    #[tokio::test]
    async fn test_start_wait_is_bounded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, write) = stream.into_split();
            let mut reader = FrameReader::new(read);
            let mut writer = FrameWriter::new(write);
            reader.read().await.unwrap();
            writer
                .send(&Message::Registered {
                    assignment: Assignment {
                        session_id: "s".to_string(),
                        rank: 1,
                        world_size: 2,
                        master_addr: "10.0.0.1".to_string(),
                        master_port: 29500,
                    },
                })
                .await
                .unwrap();
            // The worker gives up and says so.
            reader.read().await.unwrap()
        });

        let mut config = config(port);
        config.timeouts.start_secs = 1;
        let outcome = WorkerClient::new(config, agent()).run(CancellationToken::new()).await;
        assert_eq!(outcome.state, WorkerState::Aborted);
        assert_eq!(outcome.assignment.map(|a| a.rank), Some(1));
        assert!(matches!(server.await.unwrap(), Some(Message::Abort { .. })));
    }

    fn assignment(rank: u32) -> Assignment {
        Assignment {
            session_id: "s".to_string(),
            rank,
            world_size: 3,
            master_addr: "10.0.0.1".to_string(),
            master_port: 29500,
        }
    }

    #[tokio::test]
    async fn test_lost_before_start_registers_again() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            // First connection: accept the registration, then hang up.
            let (stream, _) = listener.accept().await.unwrap();
            let (read, write) = stream.into_split();
            let mut reader = FrameReader::new(read);
            let mut writer = FrameWriter::new(write);
            let first = reader.read().await.unwrap().unwrap();
            assert!(matches!(first, Message::Register { .. }));
            writer.send(&Message::Registered { assignment: assignment(1) }).await.unwrap();
            drop(writer);
            drop(reader);

            // Second connection carries the whole session.
            let (stream, _) = listener.accept().await.unwrap();
            let (read, write) = stream.into_split();
            let mut reader = FrameReader::new(read);
            let mut writer = FrameWriter::new(write);
            let again = reader.read().await.unwrap().unwrap();
            assert!(matches!(again, Message::Register { ref address, .. } if address == "10.0.0.2"));
            writer.send(&Message::Registered { assignment: assignment(2) }).await.unwrap();
            writer
                .send(&Message::StartCollective {
                    session_id: "s".to_string(),
                    params: CollectiveParams {
                        rank: 2,
                        world_size: 3,
                        master_addr: "10.0.0.1".to_string(),
                        master_port: 29500,
                        timeout_secs: 5,
                    },
                })
                .await
                .unwrap();
            let reply = reader.read().await.unwrap().unwrap();
            assert!(matches!(reply, Message::CollectiveResult { ref result } if result.rank == 2));
            writer.send(&Message::Shutdown).await.unwrap();
            reader.read().await.unwrap()
        });

        let collective = Arc::new(FakeCollective::ok(178.0));
        let agent = NodeAgent::new("worker-a", collective.clone(), Arc::new(FakeBandwidth::new(9.4e9)));
        let outcome = WorkerClient::new(config(port), agent).run(CancellationToken::new()).await;

        assert_eq!(server.await.unwrap(), Some(Message::ShutdownAck));
        assert_eq!(outcome.state, WorkerState::Done);
        assert_eq!(outcome.exit_code(), 0);
        assert!(outcome.reason.is_none());
        assert_eq!(outcome.assignment.map(|a| a.rank), Some(2));
        assert!(outcome.collective.map(|r| r.is_ok()).unwrap_or(false));
        assert_eq!(collective.runs(), 1);
    }
}
