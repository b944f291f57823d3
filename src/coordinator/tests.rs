//! Round scenarios driving a coordinator through its handle.
//!
//! The readiness interval is set far beyond the test runtime and ticks are
//! injected by hand, so the scenarios run at full speed.

use std::{os::unix::fs::PermissionsExt, path::Path, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
    time,
};

use crate::{
    channel::{self, EndpointId},
    message::{
        ClientHandle,
        ClientMessage,
        CoordinatorMessage,
        JoinRoundRequest,
        PublicKey,
        RoundEvent,
    },
    settings::{CoordinatorSettings, TrainerSettings},
};

use super::RoundCoordinator;

struct TestClient {
    id: String,
    endpoint: EndpointId,
    handle: ClientHandle,
    rx: UnboundedReceiver<ClientMessage>,
}

impl TestClient {
    fn new(i: usize) -> Self {
        let (handle, rx) = channel::endpoint();
        Self {
            id: format!("client-{}", i),
            endpoint: handle.id(),
            handle,
            rx,
        }
    }

    async fn recv(&mut self) -> ClientMessage {
        time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("no message within five seconds")
            .expect("client mailbox closed")
    }
}

struct TestRound {
    coordinator: crate::message::CoordinatorHandle,
    events: UnboundedReceiver<RoundEvent>,
    clients: Vec<TestClient>,
    dir: tempfile::TempDir,
}

impl TestRound {
    /// Start a coordinator with a round already open, `n` clients joined and
    /// a counting stub as the training driver.
    fn start(n: usize, min_participants: usize, secure_agg: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = CoordinatorSettings {
            min_participants,
            readiness_interval_secs: 3600,
            max_wait_secs: 3600,
            secure_agg,
            dp_threshold: 0.5,
            model_config: "mnist".to_string(),
            resources_path: dir.path().join("resources"),
            output_dir: dir.path().join("out"),
            rounds: 1,
        };
        let trainer = TrainerSettings {
            command: counting_stub(dir.path()),
            module: dir.path().join("server.py"),
            secure_module: dir.path().join("server_sa.py"),
            data_path: dir.path().join("data"),
            epochs: 1,
            model_path: dir.path().join("model.pt"),
            target_output_size: 10,
        };
        std::fs::write(dir.path().join("model.pt"), b"weights").unwrap();

        let (events_tx, events) = unbounded_channel();
        let (coordinator, service) = RoundCoordinator::new(settings, trainer, events_tx);
        tokio::spawn(service.run());

        coordinator.send(CoordinatorMessage::StartRound);
        let clients: Vec<TestClient> = (0..n).map(TestClient::new).collect();
        for client in &clients {
            coordinator.send(CoordinatorMessage::JoinRound(join_request(client)));
        }
        Self {
            coordinator,
            events,
            clients,
            dir,
        }
    }

    async fn recv_event(&mut self) -> RoundEvent {
        time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("no round event within five seconds")
            .expect("event channel closed")
    }

    fn training_runs(&self) -> usize {
        match std::fs::read_to_string(self.dir.path().join("runs.log")) {
            Ok(log) => log.lines().count(),
            Err(_) => 0,
        }
    }

    /// Tick, then confirm every client's module start.
    async fn advance_to_all_started(&mut self) {
        self.coordinator.send(CoordinatorMessage::ReadinessTick);
        for client in &mut self.clients {
            assert!(matches!(
                client.recv().await,
                ClientMessage::StartLearningProcess { .. }
            ));
        }
        for client in &self.clients {
            self.coordinator.send(CoordinatorMessage::ModuleStarted {
                sender: client.endpoint,
            });
        }
    }

    /// Confirm liveness for every client and return which clients then
    /// received a `DataSpread`, with its contents.
    async fn advance_to_spread(&mut self) -> Vec<(String, crate::message::DataSpread)> {
        for client in &mut self.clients {
            assert!(matches!(
                client.recv().await,
                ClientMessage::LivenessProbe { .. }
            ));
        }
        for client in &self.clients {
            self.coordinator.send(CoordinatorMessage::LivenessReply {
                sender: client.endpoint,
                public_key: PublicKey::random(),
            });
        }

        time::sleep(Duration::from_millis(200)).await;
        let mut spreads = Vec::new();
        for client in &mut self.clients {
            if let Ok(ClientMessage::DataSpread(spread)) = client.rx.try_recv() {
                spreads.push((client.id.clone(), spread));
            }
        }
        spreads
    }
}

fn join_request(client: &TestClient) -> JoinRoundRequest {
    JoinRoundRequest {
        timestamp: Utc::now(),
        task_id: "mnist".to_string(),
        client_id: client.id.clone(),
        address: "localhost".to_string(),
        port: 5000,
        handle: client.handle.clone(),
    }
}

/// A coordinator without any joined clients, with a no-op training driver.
fn bare_coordinator(
    dir: &Path,
    min_participants: usize,
    max_wait_secs: u64,
) -> (
    crate::message::CoordinatorHandle,
    UnboundedReceiver<RoundEvent>,
) {
    let settings = CoordinatorSettings {
        min_participants,
        readiness_interval_secs: 3600,
        max_wait_secs,
        secure_agg: false,
        dp_threshold: 0.5,
        model_config: "mnist".to_string(),
        resources_path: dir.join("resources"),
        output_dir: dir.join("out"),
        rounds: 1,
    };
    let trainer = TrainerSettings {
        command: "true".to_string(),
        module: dir.join("server.py"),
        secure_module: dir.join("server_sa.py"),
        data_path: dir.join("data"),
        epochs: 1,
        model_path: dir.join("model.pt"),
        target_output_size: 10,
    };
    let (events_tx, events) = unbounded_channel();
    let (coordinator, service) = RoundCoordinator::new(settings, trainer, events_tx);
    tokio::spawn(service.run());
    (coordinator, events)
}

/// A training-driver stub that appends one line to `runs.log` per invocation.
fn counting_stub(dir: &Path) -> String {
    let script = dir.join("trainer.sh");
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho run >> {}\n", dir.join("runs.log").display()),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script.display().to_string()
}

#[tokio::test]
async fn test_plain_round_runs_training_once_and_ends() {
    let mut round = TestRound::start(3, 3, false);
    round.advance_to_all_started().await;
    assert_eq!(round.recv_event().await, RoundEvent::Ended);
    assert_eq!(round.training_runs(), 1);
}

#[tokio::test]
async fn test_tick_below_quorum_starts_nothing() {
    let mut round = TestRound::start(2, 3, false);
    round.coordinator.send(CoordinatorMessage::ReadinessTick);

    time::sleep(Duration::from_millis(100)).await;
    for client in &mut round.clients {
        assert!(client.rx.try_recv().is_err());
    }
}

#[tokio::test]
async fn test_quorum_never_met_aborts_the_round() {
    let dir = tempfile::tempdir().unwrap();
    // a zero wait budget turns the first below-quorum tick into an abort
    let (coordinator, mut events) = bare_coordinator(dir.path(), 3, 0);
    coordinator.send(CoordinatorMessage::StartRound);
    coordinator.send(CoordinatorMessage::ReadinessTick);

    let event = time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, RoundEvent::Failed);
}

#[tokio::test]
async fn test_join_outside_an_open_round_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (coordinator, _events) = bare_coordinator(dir.path(), 1, 3600);

    // no StartRound: the coordinator is idle
    let mut client = TestClient::new(0);
    coordinator.send(CoordinatorMessage::JoinRound(join_request(&client)));
    assert!(matches!(
        client.recv().await,
        ClientMessage::JoinRoundResponse { can_join: false }
    ));
}

#[tokio::test]
async fn test_start_round_clears_previous_participants() {
    let mut round = TestRound::start(1, 1, false);

    // reset before the quorum tick; the old participant must be gone
    round.coordinator.send(CoordinatorMessage::StartRound);
    round.coordinator.send(CoordinatorMessage::ReadinessTick);
    time::sleep(Duration::from_millis(100)).await;
    assert!(round.clients[0].rx.try_recv().is_err());

    // rejoining makes the quorum again
    round
        .coordinator
        .send(CoordinatorMessage::JoinRound(join_request(&round.clients[0])));
    round.coordinator.send(CoordinatorMessage::ReadinessTick);
    assert!(matches!(
        round.clients[0].recv().await,
        ClientMessage::StartLearningProcess { .. }
    ));
}

#[tokio::test]
async fn test_secure_round_spreads_keys_to_non_testers_only() {
    let mut round = TestRound::start(4, 4, true);
    round.advance_to_all_started().await;

    let spreads = round.advance_to_spread().await;
    // ceil(0.3 * 4) = 2 testers, so exactly 2 non-testers get the spread
    assert_eq!(spreads.len(), 2);

    let receivers: Vec<&String> = spreads.iter().map(|(id, _)| id).collect();
    for (_, spread) in &spreads {
        assert_eq!(spread.trainer_count, 2);
        assert_eq!(spread.public_keys.len(), 2);
        for id in spread.public_keys.keys() {
            assert!(receivers.contains(&id), "tester key in the spread: {}", id);
        }
    }
}

#[tokio::test]
async fn test_encrypted_value_is_relayed_to_its_receiver() {
    let mut round = TestRound::start(4, 4, true);
    round.advance_to_all_started().await;
    let spreads = round.advance_to_spread().await;
    let receiver_id = spreads[0].0.clone();

    round.coordinator.send(CoordinatorMessage::SendValue {
        receiver: receiver_id.clone(),
        bytes: Bytes::from_static(b"masked"),
    });

    // a value for a receiver nobody registered is dropped with a warning
    round.coordinator.send(CoordinatorMessage::SendValue {
        receiver: "nobody".to_string(),
        bytes: Bytes::from_static(b"masked"),
    });

    let receiver = round
        .clients
        .iter_mut()
        .find(|client| client.id == receiver_id)
        .unwrap();
    match receiver.recv().await {
        ClientMessage::EncryptedValue { bytes } => assert_eq!(&bytes[..], b"masked"),
        other => panic!("unexpected message: {:?}", other),
    }

    // the unknown receiver changed nothing; the round is still collecting
    time::sleep(Duration::from_millis(100)).await;
    assert!(round.events.try_recv().is_err());
    for client in &mut round.clients {
        assert!(client.rx.try_recv().is_err());
    }
}

#[tokio::test]
async fn test_unknown_module_start_report_is_ignored() {
    let mut round = TestRound::start(1, 1, false);
    round.coordinator.send(CoordinatorMessage::ReadinessTick);
    assert!(matches!(
        round.clients[0].recv().await,
        ClientMessage::StartLearningProcess { .. }
    ));

    // a report from a sender the registry never saw changes nothing
    round.coordinator.send(CoordinatorMessage::ModuleStarted {
        sender: EndpointId::new(),
    });
    time::sleep(Duration::from_millis(100)).await;
    assert!(round.events.try_recv().is_err());
    assert_eq!(round.training_runs(), 0);

    // the registered participant still completes the round
    round.coordinator.send(CoordinatorMessage::ModuleStarted {
        sender: round.clients[0].endpoint,
    });
    assert_eq!(round.recv_event().await, RoundEvent::Ended);
    assert_eq!(round.training_runs(), 1);
}

#[tokio::test]
async fn test_full_result_countdown_trains_exactly_once() {
    let mut round = TestRound::start(5, 5, true);
    round.advance_to_all_started().await;
    let spreads = round.advance_to_spread().await;
    // ceil(0.3 * 5) = 2 testers, 3 trainers
    assert_eq!(spreads.len(), 3);

    for client in &round.clients {
        round.coordinator.send(CoordinatorMessage::IntermediateResult {
            sender_id: client.id.clone(),
            bytes: Bytes::from_static(b"tensor"),
        });
    }

    // the selected testers receive the trained model
    let mut testers = Vec::new();
    let deadline = time::Instant::now() + Duration::from_secs(5);
    while testers.len() < 2 && time::Instant::now() < deadline {
        for client in &mut round.clients {
            if let Ok(ClientMessage::TestModel { bytes }) = client.rx.try_recv() {
                assert_eq!(&bytes[..], b"weights");
                testers.push(client.id.clone());
            }
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(testers.len(), 2);
    assert_eq!(round.training_runs(), 1);

    // a straggler after completion must not trigger a second run
    round.coordinator.send(CoordinatorMessage::IntermediateResult {
        sender_id: "client-0".to_string(),
        bytes: Bytes::from_static(b"tensor"),
    });
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(round.training_runs(), 1);

    // the round ends once every tester reported
    for tester in &testers {
        round.coordinator.send(CoordinatorMessage::TestResult {
            sender_id: tester.clone(),
            bytes: Bytes::from_static(b"accuracy: 0.9"),
        });
    }
    assert_eq!(round.recv_event().await, RoundEvent::Ended);

    // test outputs were persisted per tester
    for tester in &testers {
        let path = round.dir.path().join("out").join(format!("{}.txt", tester));
        assert_eq!(std::fs::read(path).unwrap(), b"accuracy: 0.9");
    }
}

#[tokio::test]
async fn test_failing_trainer_fails_the_round() {
    let mut round = TestRound::start(1, 1, false);
    // replace the stub with one that exits non-zero
    std::fs::write(
        round.dir.path().join("trainer.sh"),
        "#!/bin/sh\nexit 1\n",
    )
    .unwrap();

    round.advance_to_all_started().await;
    assert_eq!(round.recv_event().await, RoundEvent::Failed);
}
