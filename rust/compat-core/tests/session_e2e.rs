//! Whole sessions over loopback TCP: a real coordinator and real workers,
//! with in-memory collective and bandwidth backends.

use std::sync::Arc;

use compat_core::coordinator::codec::{FrameReader, FrameWriter};
use compat_core::coordinator::{Message, WorkerCapabilities, WorkerState};
use compat_core::testing::{FakeBandwidth, FakeCollective};
use compat_core::{CompatConfig, Coordinator, NodeAgent, SessionState, WorkerClient};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

fn host_config(cluster_size: u32) -> CompatConfig {
    let mut config = CompatConfig::default();
    config.cluster.cluster_size = cluster_size;
    config.cluster.master_addr = "10.0.0.1".to_string();
    config.mesh.duration_secs = 1;
    config.mesh.server_startup_delay_ms = 10;
    config.timeouts.shutdown_ack_secs = 2;
    config
}

fn worker_config(port: u16, advertise: &str) -> CompatConfig {
    let mut config = CompatConfig::default();
    config.cluster.host = "127.0.0.1".to_string();
    config.cluster.control_port = port;
    config.cluster.advertise_addr = Some(advertise.to_string());
    config.timeouts.max_connect_attempts = 3;
    config.timeouts.reconnect_delay_ms = 50;
    config
}

fn agent(hostname: &str, collective: &Arc<FakeCollective>, bandwidth: &Arc<FakeBandwidth>) -> NodeAgent {
    NodeAgent::new(hostname, collective.clone(), bandwidth.clone())
}

async fn coordinator(config: CompatConfig, agent: NodeAgent) -> (Coordinator, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let coordinator = Coordinator::with_listener(config, agent, listener);
    let port = coordinator.local_addr().unwrap().port();
    (coordinator, port)
}

/// Answer the confirmation prompt once the cluster is full.
fn answer_when_ready(mut state: watch::Receiver<SessionState>, answer: &str) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(4);
    let answer = answer.to_string();
    tokio::spawn(async move {
        if state
            .wait_for(|s| *s == SessionState::ReadyPendingConfirm)
            .await
            .is_ok()
        {
            let _ = tx.send(answer).await;
        }
    });
    rx
}

fn spawn_worker(port: u16, advertise: &str, agent: NodeAgent) -> tokio::task::JoinHandle<compat_core::WorkerOutcome> {
    let client = WorkerClient::new(worker_config(port, advertise), agent);
    tokio::spawn(client.run(CancellationToken::new()))
}

#[tokio::test]
async fn test_two_node_session_completes() {
    let coord_collective = Arc::new(FakeCollective::ok(180.0));
    let coord_bandwidth = Arc::new(FakeBandwidth::new(9.4e9));
    let worker_collective = Arc::new(FakeCollective::ok(178.0));
    let worker_bandwidth = Arc::new(FakeBandwidth::new(9.4e9));

    let (coord, port) = coordinator(host_config(2), agent("gpu-a", &coord_collective, &coord_bandwidth)).await;
    let confirmations = answer_when_ready(coord.subscribe(), "start");
    let host = tokio::spawn(coord.run(confirmations, CancellationToken::new()));
    let worker = spawn_worker(port, "10.0.0.2", agent("gpu-b", &worker_collective, &worker_bandwidth));

    let report = host.await.unwrap();
    let outcome = worker.await.unwrap();

    assert_eq!(report.state, SessionState::Completed, "{:?}", report.abort_reason);
    assert_eq!(report.exit_code(), 0);
    let addresses: Vec<&str> = report.roster.iter().map(|n| n.address.as_str()).collect();
    assert_eq!(addresses, ["10.0.0.1", "10.0.0.2"]);

    let rows: Vec<_> = report.collective.rows().collect();
    assert_eq!(rows.len(), 2);
    assert!(report.collective.all_ok());
    assert_eq!(rows[0].bus_bandwidth_gb_s, Some(180.0));
    assert_eq!(rows[1].bus_bandwidth_gb_s, Some(178.0));
    assert_eq!(rows[1].hostname, "gpu-b");

    let matrix = report.bandwidth.as_ref().unwrap();
    assert_eq!(matrix.len(), 1);
    assert!(matrix.is_complete());
    let entry = matrix.get(0, 1).unwrap();
    assert!(entry.is_ok());
    assert!((entry.average_gbit_per_sec().unwrap() - 9.4).abs() < 1e-9);
    assert_eq!(coord_bandwidth.client_runs() + worker_bandwidth.client_runs(), 2);
    assert!(coord_bandwidth.open_servers().await.is_empty());
    assert!(worker_bandwidth.open_servers().await.is_empty());

    assert_eq!(outcome.state, WorkerState::Done);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.assignment.as_ref().map(|a| a.rank), Some(1));
    assert_eq!(outcome.collective.and_then(|r| r.bus_bandwidth_gb_s), Some(178.0));

    let rendered = report.render();
    assert!(rendered.contains("Pairwise bandwidth"));
    assert!(rendered.contains("gpu-b (10.0.0.2)"));
}

#[tokio::test]
async fn test_short_cluster_times_out() {
    let coord_collective = Arc::new(FakeCollective::ok(180.0));
    let worker_collective = Arc::new(FakeCollective::ok(178.0));
    let bandwidth = Arc::new(FakeBandwidth::new(9.4e9));

    let mut config = host_config(3);
    config.timeouts.registration_secs = 1;
    let (coord, port) = coordinator(config, agent("gpu-a", &coord_collective, &bandwidth)).await;
    let confirmations = answer_when_ready(coord.subscribe(), "start");
    let host = tokio::spawn(coord.run(confirmations, CancellationToken::new()));
    let worker = spawn_worker(port, "10.0.0.2", agent("gpu-b", &worker_collective, &bandwidth));

    let report = host.await.unwrap();
    let outcome = worker.await.unwrap();

    assert_eq!(report.state, SessionState::Aborted);
    assert_eq!(report.exit_code(), 1);
    let reason = report.abort_reason.clone().unwrap();
    assert!(reason.contains("waiting for workers (2/3 nodes registered)"), "{}", reason);
    assert!(report.collective.is_empty());
    assert!(report.bandwidth.is_none());
    assert_eq!(coord_collective.runs(), 0);
    assert_eq!(worker_collective.runs(), 0);

    assert_eq!(outcome.state, WorkerState::Aborted);
    assert!(outcome.reason.unwrap().contains("coordinator aborted"));
}

#[tokio::test]
async fn test_wrong_confirmation_aborts_every_worker() {
    let coord_collective = Arc::new(FakeCollective::ok(180.0));
    let worker_collective = Arc::new(FakeCollective::ok(178.0));
    let bandwidth = Arc::new(FakeBandwidth::new(9.4e9));

    let (coord, port) = coordinator(host_config(3), agent("gpu-a", &coord_collective, &bandwidth)).await;
    let confirmations = answer_when_ready(coord.subscribe(), "yes");
    let host = tokio::spawn(coord.run(confirmations, CancellationToken::new()));
    let first = spawn_worker(port, "10.0.0.2", agent("gpu-b", &worker_collective, &bandwidth));
    let second = spawn_worker(port, "10.0.0.3", agent("gpu-c", &worker_collective, &bandwidth));

    let report = host.await.unwrap();
    assert_eq!(report.state, SessionState::Aborted);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.roster.len(), 3);

    for worker in [first, second] {
        let outcome = worker.await.unwrap();
        assert_eq!(outcome.state, WorkerState::Aborted);
        assert!(outcome.reason.unwrap().contains("coordinator aborted"));
    }
    assert_eq!(coord_collective.runs(), 0);
    assert_eq!(worker_collective.runs(), 0);
}

#[tokio::test]
async fn test_worker_leaving_before_start_is_forgotten() {
    let collective = Arc::new(FakeCollective::ok(180.0));
    let bandwidth = Arc::new(FakeBandwidth::new(9.4e9));
    let worker_collective = Arc::new(FakeCollective::ok(178.0));
    let worker_bandwidth = Arc::new(FakeBandwidth::new(9.4e9));

    let (coord, port) = coordinator(host_config(2), agent("gpu-a", &collective, &bandwidth)).await;
    let mut state = coord.subscribe();
    let (tx, rx) = mpsc::channel(4);
    let host = tokio::spawn(coord.run(rx, CancellationToken::new()));

    // A worker that registers and then goes away.
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (read, write) = stream.into_split();
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);
    writer
        .send(&Message::Register {
            address: "10.0.0.9".to_string(),
            capabilities: WorkerCapabilities {
                hostname: "flaky".to_string(),
                gpu_count: 8,
                version: "0.1.0".to_string(),
            },
        })
        .await
        .unwrap();
    let reply = reader.read().await.unwrap().unwrap();
    assert!(matches!(reply, Message::Registered { ref assignment } if assignment.rank == 1));
    state
        .wait_for(|s| *s == SessionState::ReadyPendingConfirm)
        .await
        .unwrap();
    drop(reader);
    drop(writer);
    state
        .wait_for(|s| *s == SessionState::AwaitingWorkers)
        .await
        .unwrap();

    let worker = spawn_worker(port, "10.0.0.2", agent("gpu-b", &worker_collective, &worker_bandwidth));
    state
        .wait_for(|s| *s == SessionState::ReadyPendingConfirm)
        .await
        .unwrap();
    tx.send("start".to_string()).await.unwrap();

    let report = host.await.unwrap();
    let outcome = worker.await.unwrap();

    assert_eq!(report.state, SessionState::Completed, "{:?}", report.abort_reason);
    let addresses: Vec<&str> = report.roster.iter().map(|n| n.address.as_str()).collect();
    assert_eq!(addresses, ["10.0.0.1", "10.0.0.2"]);
    assert!(!report.render().contains("flaky"));
    assert_eq!(outcome.state, WorkerState::Done);
    assert_eq!(outcome.assignment.map(|a| a.rank), Some(1));
}

#[tokio::test]
async fn test_duplicate_address_rejected_session_continues() {
    let collective = Arc::new(FakeCollective::ok(180.0));
    let bandwidth = Arc::new(FakeBandwidth::new(9.4e9));
    let worker_collective = Arc::new(FakeCollective::ok(178.0));
    let worker_bandwidth = Arc::new(FakeBandwidth::new(9.4e9));

    let mut config = host_config(2);
    config.mesh.enabled = false;
    let (coord, port) = coordinator(config, agent("gpu-a", &collective, &bandwidth)).await;
    let confirmations = answer_when_ready(coord.subscribe(), "start");
    let host = tokio::spawn(coord.run(confirmations, CancellationToken::new()));

    // Claims the coordinator's own address.
    let duplicate = spawn_worker(port, "10.0.0.1", agent("gpu-x", &worker_collective, &worker_bandwidth))
        .await
        .unwrap();
    assert_eq!(duplicate.state, WorkerState::Aborted);
    assert!(duplicate.assignment.is_none());
    assert!(duplicate.reason.unwrap().contains("address 10.0.0.1 is already registered"));

    let worker = spawn_worker(port, "10.0.0.2", agent("gpu-b", &worker_collective, &worker_bandwidth));
    let report = host.await.unwrap();
    let outcome = worker.await.unwrap();

    assert_eq!(report.state, SessionState::Completed, "{:?}", report.abort_reason);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.collective.len(), 2);
    assert_eq!(worker_collective.runs(), 1);
    assert_eq!(outcome.state, WorkerState::Done);
}

#[tokio::test]
async fn test_missing_bandwidth_tool_fails_pairs() {
    let collective = Arc::new(FakeCollective::ok(180.0));
    let bandwidth = Arc::new(FakeBandwidth::new(9.4e9));
    let worker_bandwidth = Arc::new(FakeBandwidth::unavailable());

    let (coord, port) = coordinator(host_config(2), agent("gpu-a", &collective, &bandwidth)).await;
    let confirmations = answer_when_ready(coord.subscribe(), "start");
    let host = tokio::spawn(coord.run(confirmations, CancellationToken::new()));
    let worker = spawn_worker(port, "10.0.0.2", agent("gpu-b", &collective, &worker_bandwidth));

    let report = host.await.unwrap();
    let outcome = worker.await.unwrap();

    assert_eq!(report.state, SessionState::Completed, "{:?}", report.abort_reason);
    assert_eq!(report.exit_code(), 2);
    assert!(report.collective.all_ok());
    assert_eq!(report.tool_availability.len(), 2);
    assert!(!report.tool_availability[1].status.ok);

    let entry = report.bandwidth.as_ref().unwrap().get(0, 1).unwrap();
    assert!(!entry.is_ok());
    assert!(entry.detail().contains("unavailable on rank 1"), "{}", entry.detail());
    assert_eq!(bandwidth.client_runs(), 0);
    assert_eq!(worker_bandwidth.client_runs(), 0);
    assert_eq!(outcome.state, WorkerState::Done);
}

#[tokio::test]
async fn test_four_node_mesh_covers_every_pair() {
    let coord_collective = Arc::new(FakeCollective::ok(180.0));
    let coord_bandwidth = Arc::new(FakeBandwidth::new(9.4e9));
    let (coord, port) = coordinator(host_config(4), agent("gpu-a", &coord_collective, &coord_bandwidth)).await;
    let confirmations = answer_when_ready(coord.subscribe(), "start");
    let host = tokio::spawn(coord.run(confirmations, CancellationToken::new()));

    let mut bandwidths = vec![coord_bandwidth];
    let mut workers = Vec::new();
    for (hostname, address) in [("gpu-b", "10.0.0.2"), ("gpu-c", "10.0.0.3"), ("gpu-d", "10.0.0.4")] {
        let collective = Arc::new(FakeCollective::ok(178.0));
        let bandwidth = Arc::new(FakeBandwidth::new(9.4e9));
        workers.push(spawn_worker(port, address, agent(hostname, &collective, &bandwidth)));
        bandwidths.push(bandwidth);
    }

    let report = host.await.unwrap();
    assert_eq!(report.state, SessionState::Completed, "{:?}", report.abort_reason);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.roster.len(), 4);
    assert_eq!(report.collective.rows().count(), 4);
    assert!(report.collective.all_ok());

    let matrix = report.bandwidth.as_ref().unwrap();
    assert_eq!(matrix.entries().count(), 6);
    assert!(matrix.is_complete());
    assert!(matrix.all_ok());
    for a in 0..4 {
        for b in (a + 1)..4 {
            let entry = matrix.get(a, b).unwrap_or_else(|| panic!("pair {}-{} missing", a, b));
            assert!(entry.is_ok(), "pair {}-{}: {}", a, b, entry.detail());
        }
    }

    // One client run per direction of every pair, and no server left behind.
    let client_runs: usize = bandwidths.iter().map(|b| b.client_runs()).sum();
    assert_eq!(client_runs, 12);
    for bandwidth in &bandwidths {
        assert!(bandwidth.open_servers().await.is_empty());
    }

    let mut ranks = Vec::new();
    for worker in workers {
        let outcome = worker.await.unwrap();
        assert_eq!(outcome.state, WorkerState::Done, "{:?}", outcome.reason);
        assert_eq!(outcome.exit_code(), 0);
        ranks.push(outcome.assignment.map(|a| a.rank).unwrap());
    }
    ranks.sort_unstable();
    assert_eq!(ranks, [1, 2, 3]);
}

#[tokio::test]
async fn test_disconnect_after_start_aborts_with_partial_results() {
    let collective = Arc::new(FakeCollective::ok(180.0));
    let bandwidth = Arc::new(FakeBandwidth::new(9.4e9));
    let worker_collective = Arc::new(FakeCollective::ok(178.0));
    let worker_bandwidth = Arc::new(FakeBandwidth::new(9.4e9));

    let (coord, port) = coordinator(host_config(3), agent("gpu-a", &collective, &bandwidth)).await;
    let confirmations = answer_when_ready(coord.subscribe(), "start");
    let host = tokio::spawn(coord.run(confirmations, CancellationToken::new()));

    // Registers first so it holds rank 1, then vanishes once the run starts.
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (read, write) = stream.into_split();
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);
    writer
        .send(&Message::Register {
            address: "10.0.0.3".to_string(),
            capabilities: WorkerCapabilities {
                hostname: "flaky".to_string(),
                gpu_count: 8,
                version: "0.1.0".to_string(),
            },
        })
        .await
        .unwrap();
    let reply = reader.read().await.unwrap().unwrap();
    assert!(matches!(reply, Message::Registered { ref assignment } if assignment.rank == 1));

    let worker = spawn_worker(port, "10.0.0.2", agent("gpu-b", &worker_collective, &worker_bandwidth));
    loop {
        match reader.read().await.unwrap() {
            Some(Message::StartCollective { params, .. }) => {
                assert_eq!(params.rank, 1);
                break;
            }
            Some(_) => continue,
            None => panic!("coordinator closed before the start"),
        }
    }
    // Let the other ranks report before leaving.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    drop(reader);
    drop(writer);

    let report = host.await.unwrap();
    let outcome = worker.await.unwrap();

    assert_eq!(report.state, SessionState::Aborted);
    assert_eq!(report.exit_code(), 1);
    let reason = report.abort_reason.clone().unwrap();
    assert!(reason.starts_with("rank 1 (10.0.0.3) disconnected during the run"), "{}", reason);
    assert!(report.collective.rows().count() >= 1);
    assert!(report.collective.rows().all(|r| r.rank != 1));
    assert!(report.bandwidth.is_none());

    assert_eq!(outcome.state, WorkerState::Aborted);
    assert_eq!(outcome.exit_code(), 1);
    let worker_reason = outcome.reason.unwrap();
    assert!(
        worker_reason.starts_with("coordinator aborted: rank 1 (10.0.0.3) disconnected during the run"),
        "{}",
        worker_reason
    );
    assert!(!worker_reason.contains("Session aborted"), "{}", worker_reason);
}
