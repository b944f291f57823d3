//! The round coordinator: a single-task service that owns the state of the
//! current round and processes one message to completion before the next.

pub mod collector;
pub mod handshake;
pub mod registry;
pub mod ticker;
pub mod trainer;

#[cfg(test)]
mod tests;

use std::time::{Duration, Instant};

use bytes::Bytes;
use derive_more::Display;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{
    channel::{self, EndpointId},
    message::{
        ClientMessage,
        CoordinatorHandle,
        CoordinatorMessage,
        JoinRoundRequest,
        PublicKey,
        RoundEvent,
    },
    settings::{CoordinatorSettings, TrainerSettings},
};

use self::{
    collector::{Countdown, ResultCollector},
    registry::{Participant, ParticipantRegistry},
    ticker::TickerHandle,
};

/// Round phases of the coordinator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum Phase {
    Idle,
    AwaitingParticipants,
    AwaitingModuleStart,
    SecureHandshake,
    AwaitingResults,
    RoundComplete,
}

/// All state owned by one round. Replaced wholesale on `StartRound`, so
/// nothing from a previous round can leak into the next.
#[derive(Debug)]
struct RoundState {
    phase: Phase,
    registry: ParticipantRegistry,
    collector: ResultCollector,
    testers: Vec<String>,
    test_countdown: Countdown,
    /// When the round opened for joining; bounds the readiness wait.
    opened_at: Instant,
    /// When the quorum was met and learning commands went out.
    started_at: Option<Instant>,
}

impl RoundState {
    fn new(settings: &CoordinatorSettings) -> Self {
        Self {
            phase: Phase::Idle,
            registry: ParticipantRegistry::new(),
            collector: ResultCollector::new(
                settings.resources_path.clone(),
                settings.output_dir.clone(),
            ),
            testers: Vec::new(),
            test_countdown: Countdown::new(),
            opened_at: Instant::now(),
            started_at: None,
        }
    }
}

pub struct RoundCoordinator {
    settings: CoordinatorSettings,
    trainer: TrainerSettings,
    /// The coordinator's own handle, given to the ticker and to clients as
    /// the reply address.
    handle: CoordinatorHandle,
    inbox: UnboundedReceiver<CoordinatorMessage>,
    /// Round lifecycle notifications for the external round supervisor.
    events: UnboundedSender<RoundEvent>,
    round: RoundState,
    ticker: TickerHandle,
}

impl RoundCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        trainer: TrainerSettings,
        events: UnboundedSender<RoundEvent>,
    ) -> (CoordinatorHandle, Self) {
        let (handle, inbox) = channel::endpoint();
        let round = RoundState::new(&settings);
        let coordinator = Self {
            settings,
            trainer,
            handle: handle.clone(),
            inbox,
            events,
            round,
            ticker: TickerHandle::default(),
        };
        (handle, coordinator)
    }

    /// Process messages until every handle to this coordinator is dropped.
    pub async fn run(mut self) {
        while let Some(message) = self.inbox.recv().await {
            self.handle_message(message).await;
        }
        info!("coordinator terminated: all handles dropped");
    }

    async fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::StartRound => self.handle_start_round(),
            CoordinatorMessage::JoinRound(request) => self.handle_join(request),
            CoordinatorMessage::ReadinessTick => self.handle_readiness_tick(),
            CoordinatorMessage::ModuleStarted { sender } => {
                self.handle_module_started(sender).await
            }
            CoordinatorMessage::LivenessReply { sender, public_key } => {
                self.handle_liveness_reply(sender, public_key)
            }
            CoordinatorMessage::SendValue { receiver, bytes } => {
                self.handle_send_value(receiver, bytes)
            }
            CoordinatorMessage::IntermediateResult { sender_id, bytes } => {
                self.handle_intermediate_result(sender_id, bytes).await
            }
            CoordinatorMessage::TestResult { sender_id, bytes } => {
                self.handle_test_result(sender_id, bytes)
            }
        }
    }

    /// Reset the round and open it for joining.
    fn handle_start_round(&mut self) {
        info!("starting a new round");
        self.ticker.cancel();
        self.round = RoundState::new(&self.settings);
        self.round.phase = Phase::AwaitingParticipants;
        self.ticker = ticker::spawn(
            Duration::from_secs(self.settings.readiness_interval_secs),
            self.handle.clone(),
        );
    }

    fn handle_join(&mut self, request: JoinRoundRequest) {
        if self.round.phase != Phase::AwaitingParticipants {
            warn!(
                client_id = %request.client_id,
                phase = %self.round.phase,
                "rejecting join: round is not open",
            );
            request
                .handle
                .send(ClientMessage::JoinRoundResponse { can_join: false });
            return;
        }
        debug!(
            client_id = %request.client_id,
            task_id = %request.task_id,
            timestamp = %request.timestamp,
            "participant joined",
        );
        self.round.registry.insert(Participant::new(
            request.client_id,
            request.address,
            request.port,
            request.handle,
        ));
    }

    /// Re-evaluate the readiness quorum. Proceeds once enough participants
    /// joined; aborts the round when the bounded wait is exhausted.
    fn handle_readiness_tick(&mut self) {
        if self.round.phase != Phase::AwaitingParticipants {
            trace!("ignoring readiness tick: not awaiting participants");
            return;
        }
        let count = self.round.registry.len();
        if count >= self.settings.min_participants {
            info!(participants = count, "quorum met, starting learning");
            self.ticker.cancel();
            self.round.started_at = Some(Instant::now());
            for participant in self.round.registry.iter() {
                participant.handle.send(ClientMessage::StartLearningProcess {
                    model_config: self.settings.model_config.clone(),
                    secure_agg: self.settings.secure_agg,
                    dp_threshold: self.settings.dp_threshold,
                    reply_to: self.handle.clone(),
                });
            }
            self.round.phase = Phase::AwaitingModuleStart;
        } else if self.round.opened_at.elapsed() >= Duration::from_secs(self.settings.max_wait_secs)
        {
            warn!(
                participants = count,
                required = self.settings.min_participants,
                "quorum not met within the maximum wait, aborting round",
            );
            self.ticker.cancel();
            self.round.phase = Phase::Idle;
            self.emit(RoundEvent::Failed);
        } else {
            info!(
                participants = count,
                required = self.settings.min_participants,
                "waiting for quorum",
            );
        }
    }

    async fn handle_module_started(&mut self, sender: EndpointId) {
        if self.round.phase != Phase::AwaitingModuleStart {
            warn!(%sender, phase = %self.round.phase, "ignoring unexpected module start report");
            return;
        }
        let client_id = match self.round.registry.by_sender(sender) {
            Some(participant) => {
                participant.module_started = true;
                participant.client_id.clone()
            }
            None => {
                warn!(%sender, "ignoring module start report from unregistered sender");
                return;
            }
        };
        debug!(%client_id, "module started");

        // set exactly once per round, at the first matched report
        if !self.round.collector.is_awaiting() {
            let count = self.round.registry.len();
            self.round.collector.await_results(count);
        }

        if !self.round.registry.all_started() {
            return;
        }
        if self.settings.secure_agg {
            info!("all modules started, probing liveness");
            for participant in self.round.registry.iter() {
                participant.handle.send(ClientMessage::LivenessProbe {
                    reply_to: self.handle.clone(),
                });
            }
            self.round.phase = Phase::SecureHandshake;
        } else {
            info!("all modules started, running learning");
            match self.run_learning().await {
                Ok(()) => {
                    self.round.phase = Phase::RoundComplete;
                    self.log_round_time();
                    self.emit(RoundEvent::Ended);
                }
                Err(e) => self.fail_round(e),
            }
        }
    }

    fn handle_liveness_reply(&mut self, sender: EndpointId, public_key: PublicKey) {
        if self.round.phase != Phase::SecureHandshake {
            warn!(%sender, phase = %self.round.phase, "ignoring unexpected liveness reply");
            return;
        }
        match self.round.registry.by_sender(sender) {
            Some(participant) => {
                participant.module_alive = true;
                participant.public_key = Some(public_key);
            }
            // an unmatched liveness reply is a no-op, not an error
            None => {
                debug!(%sender, "ignoring liveness reply from unregistered sender");
                return;
            }
        }
        if !self.round.registry.all_alive() {
            return;
        }

        info!("everyone alive, spreading data");
        self.round.testers = handshake::select_testers(&self.round.registry);
        self.round
            .test_countdown
            .initialize(self.round.testers.len());
        debug!(testers = ?self.round.testers, "testers selected");

        let messages = handshake::spread_messages(
            &self.round.registry,
            &self.round.testers,
            self.settings.secure_agg,
            self.settings.dp_threshold,
        );
        for (handle, spread) in messages {
            handle.send(ClientMessage::DataSpread(spread));
        }
        self.round.phase = Phase::AwaitingResults;
    }

    /// Route an encrypted value to its receiver. The coordinator never looks
    /// inside; it is a relay between trainers during the secure exchange.
    fn handle_send_value(&mut self, receiver: String, bytes: Bytes) {
        if self.round.phase != Phase::AwaitingResults {
            warn!(%receiver, phase = %self.round.phase, "ignoring unexpected value relay");
            return;
        }
        match self.round.registry.get(&receiver) {
            Some(participant) => {
                trace!(%receiver, size = bytes.len(), "relaying value");
                participant.handle.send(ClientMessage::EncryptedValue { bytes });
            }
            None => warn!(%receiver, "cannot relay value: receiver unknown"),
        }
    }

    async fn handle_intermediate_result(&mut self, sender_id: String, bytes: Bytes) {
        if self.round.phase != Phase::AwaitingResults {
            warn!(%sender_id, phase = %self.round.phase, "ignoring unexpected intermediate result");
            return;
        }
        let remaining = self.round.collector.collect_intermediate(&sender_id, &bytes);
        if remaining > 0 {
            info!(remaining, "tensor received");
            return;
        }
        info!("all tensors received");

        match self.run_learning().await {
            Ok(()) => {
                self.round.phase = Phase::RoundComplete;
                self.log_round_time();
                if let Err(e) = self.send_model_to_testers().await {
                    self.fail_round(e);
                }
            }
            Err(e) => self.fail_round(e),
        }
    }

    fn handle_test_result(&mut self, sender_id: String, bytes: Bytes) {
        if self.round.phase != Phase::RoundComplete {
            warn!(%sender_id, phase = %self.round.phase, "ignoring unexpected test result");
            return;
        }
        if self.round.test_countdown.is_complete() {
            warn!(%sender_id, "ignoring test result: all testers already reported");
            return;
        }
        self.round.collector.collect_test_output(&sender_id, &bytes);
        let remaining = self.round.test_countdown.decrement();
        if remaining > 0 {
            info!(remaining, "test result received");
        } else {
            info!("all test results received, round ended");
            self.emit(RoundEvent::Ended);
        }
    }

    /// Invoke the external training driver. This blocks the coordinator's
    /// message loop until the driver exits, by design.
    async fn run_learning(&mut self) -> Result<(), anyhow::Error> {
        trainer::run(
            &self.trainer,
            self.settings.secure_agg,
            &self.settings.model_config,
            self.round.collector.resources_path(),
            &self.round.registry,
        )
        .await?;
        Ok(())
    }

    /// Ship the trained artifact to every selected tester.
    async fn send_model_to_testers(&self) -> Result<(), anyhow::Error> {
        let bytes = Bytes::from(tokio::fs::read(&self.trainer.model_path).await?);
        for tester in &self.round.testers {
            info!(%tester, "chosen for test");
            match self.round.registry.get(tester) {
                Some(participant) => participant.handle.send(ClientMessage::TestModel {
                    bytes: bytes.clone(),
                }),
                None => warn!(%tester, "tester vanished from the registry"),
            }
        }
        Ok(())
    }

    fn log_round_time(&self) {
        if let Some(started_at) = self.round.started_at {
            info!(
                seconds = started_at.elapsed().as_secs_f32(),
                "time of learning round",
            );
        }
    }

    /// Abort the round: the failure is reported to the supervisor instead of
    /// leaving the protocol hanging.
    fn fail_round(&mut self, error: anyhow::Error) {
        error!(error = %error, "round failed");
        self.ticker.cancel();
        self.round.phase = Phase::Idle;
        self.emit(RoundEvent::Failed);
    }

    fn emit(&self, event: RoundEvent) {
        if self.events.send(event).is_err() {
            warn!("failed to notify supervisor: channel closed");
        }
    }
}
