//! The client side of the round protocol: module resolution, joining,
//! running the training module and reporting back.

pub mod modules;

use std::{path::PathBuf, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use derive_more::Display;
use thiserror::Error;
use tokio::{process::Command, sync::mpsc::UnboundedReceiver, task::JoinHandle, time};

use crate::{
    channel,
    message::{
        ClientHandle,
        ClientMessage,
        CoordinatorHandle,
        CoordinatorMessage,
        DataSpread,
        InjectorHandle,
        InjectorMessage,
        JoinRoundRequest,
        PublicKey,
    },
    settings::ClientSettings,
};

use self::modules::{ModuleError, ModuleLibrary};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Module(#[from] ModuleError),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
enum ClientState {
    Idle,
    AwaitingModuleResolution,
    AwaitingModuleTransfer,
    JoinedRound,
    Running,
    Reported,
}

/// A single client: one task, one mailbox, messages processed to completion.
///
/// The training computation itself is an external child process; the protocol
/// only launches it and reports its liveness to the coordinator.
pub struct ClientProtocol {
    settings: ClientSettings,
    handle: ClientHandle,
    inbox: UnboundedReceiver<ClientMessage>,
    coordinator: CoordinatorHandle,
    injector: InjectorHandle,
    library: ModuleLibrary,
    state: ClientState,
    /// The task this client is currently working on.
    task_id: String,
    /// Resolved path of the module to run, once known.
    module: Option<PathBuf>,
    /// The pending delayed module-started acknowledgment, if any.
    ack: Option<JoinHandle<()>>,
    public_key: PublicKey,
    /// Keys and roster for the external aggregation layer.
    spread: Option<DataSpread>,
    /// Values relayed from other trainers, held for the aggregation layer.
    encrypted_values: Vec<Bytes>,
}

impl ClientProtocol {
    pub fn new(
        settings: ClientSettings,
        coordinator: CoordinatorHandle,
        injector: InjectorHandle,
    ) -> Result<(ClientHandle, Self), ClientError> {
        let library = ModuleLibrary::open(settings.module_dir.clone())?;
        let (handle, inbox) = channel::endpoint();
        let task_id = settings.task_id.clone();
        let client = Self {
            settings,
            handle: handle.clone(),
            inbox,
            coordinator,
            injector,
            library,
            state: ClientState::Idle,
            task_id,
            module: None,
            ack: None,
            public_key: PublicKey::random(),
            spread: None,
            encrypted_values: Vec::new(),
        };
        Ok((handle, client))
    }

    pub async fn run(mut self) {
        while let Some(message) = self.inbox.recv().await {
            self.handle_message(message);
        }
        info!(client_id = %self.settings.id, "client terminated: all handles dropped");
    }

    fn handle_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::StartLearning { task_id } => self.handle_start_learning(task_id),
            ClientMessage::ModuleListResponse { modules } => self.handle_module_list(modules),
            ClientMessage::ModuleResponse { file_name, content } => {
                self.handle_module_response(file_name, content)
            }
            ClientMessage::JoinRoundResponse { can_join } => self.handle_join_response(can_join),
            ClientMessage::StartLearningProcess {
                model_config,
                secure_agg,
                dp_threshold,
                reply_to,
            } => self.handle_start_process(model_config, secure_agg, dp_threshold, reply_to),
            ClientMessage::LivenessProbe { reply_to } => {
                reply_to.send(CoordinatorMessage::LivenessReply {
                    sender: self.handle.id(),
                    public_key: self.public_key.clone(),
                });
            }
            ClientMessage::DataSpread(spread) => {
                info!(
                    client_id = %self.settings.id,
                    trainers = spread.trainer_count,
                    "received key spread",
                );
                self.spread = Some(spread);
            }
            ClientMessage::EncryptedValue { bytes } => {
                debug!(client_id = %self.settings.id, size = bytes.len(), "received encrypted value");
                self.encrypted_values.push(bytes);
            }
            ClientMessage::TestModel { bytes } => self.handle_test_model(bytes),
            ClientMessage::ModuleRunFailed => self.handle_module_run_failed(),
            ClientMessage::ModuleStartReported => self.handle_module_start_reported(),
        }
    }

    /// Resolve a module for the task and join the round.
    ///
    /// A fresh round may begin from `Idle` or after the previous one was
    /// fully reported. A client still in `JoinedRound` or `Running` was
    /// abandoned by the coordinator (quorum never met, round aborted), so a
    /// new start cancels whatever is pending and begins over; a wedged
    /// client would otherwise sit out every later round.
    fn handle_start_learning(&mut self, task_id: String) {
        match self.state {
            ClientState::Idle | ClientState::Reported => {}
            ClientState::JoinedRound | ClientState::Running => {
                info!(client_id = %self.settings.id, state = %self.state, "previous round abandoned, starting over");
                self.cancel_ack();
            }
            other => {
                warn!(client_id = %self.settings.id, state = %other, "ignoring start: module transfer in progress");
                return;
            }
        }
        self.task_id = task_id;
        // scratch from a previous round must not leak into this one
        self.spread = None;
        self.encrypted_values.clear();
        match self.library.lookup(&self.task_id) {
            Some(path) => {
                debug!(client_id = %self.settings.id, module = %path.display(), "module cached");
                self.module = Some(path);
                self.join_round();
            }
            None => {
                debug!(client_id = %self.settings.id, task_id = %self.task_id, "module unknown, asking the injector");
                self.injector.send(InjectorMessage::ModuleListRequest {
                    task_id: self.task_id.clone(),
                    reply_to: self.handle.clone(),
                });
                self.state = ClientState::AwaitingModuleResolution;
            }
        }
    }

    fn handle_module_list(&mut self, candidates: Vec<crate::message::ModuleDescriptor>) {
        if self.state != ClientState::AwaitingModuleResolution {
            warn!(client_id = %self.settings.id, state = %self.state, "ignoring unexpected module list");
            return;
        }
        match modules::select_module(&candidates, &self.settings) {
            Ok(module) => {
                debug!(client_id = %self.settings.id, file_name = %module.file_name, "module selected");
                self.injector.send(InjectorMessage::ModuleRequest {
                    file_name: module.file_name.clone(),
                    reply_to: self.handle.clone(),
                });
                self.state = ClientState::AwaitingModuleTransfer;
            }
            Err(e) => {
                error!(client_id = %self.settings.id, error = %e, "cannot take part in this round");
                self.state = ClientState::Idle;
            }
        }
    }

    fn handle_module_response(&mut self, file_name: String, content: Bytes) {
        if self.state != ClientState::AwaitingModuleTransfer {
            warn!(client_id = %self.settings.id, state = %self.state, "ignoring unexpected module transfer");
            return;
        }
        match self.library.register(&self.task_id, &file_name, &content) {
            Ok(path) => {
                self.module = Some(path);
                self.join_round();
            }
            Err(e) => {
                error!(client_id = %self.settings.id, error = %e, "failed to store module");
                self.state = ClientState::Idle;
            }
        }
    }

    fn join_round(&mut self) {
        self.coordinator
            .send(CoordinatorMessage::JoinRound(JoinRoundRequest {
                timestamp: Utc::now(),
                task_id: self.task_id.clone(),
                client_id: self.settings.id.clone(),
                address: self.settings.address.clone(),
                port: self.settings.port,
                handle: self.handle.clone(),
            }));
        self.state = ClientState::JoinedRound;
    }

    fn handle_join_response(&mut self, can_join: bool) {
        if can_join {
            debug!(client_id = %self.settings.id, "admitted to the round");
        } else {
            error!(client_id = %self.settings.id, "not admitted to the round");
            self.cancel_ack();
            self.state = ClientState::Idle;
        }
    }

    /// Launch the module as a detached child process and schedule the delayed
    /// module-started acknowledgment. The ack is cancelled if the run fails
    /// before it fires.
    fn handle_start_process(
        &mut self,
        model_config: String,
        secure_agg: bool,
        dp_threshold: f64,
        reply_to: CoordinatorHandle,
    ) {
        if self.state != ClientState::JoinedRound {
            warn!(client_id = %self.settings.id, state = %self.state, "ignoring unexpected learning command");
            return;
        }
        let module = match self.module.clone() {
            Some(module) => module,
            None => {
                error!(client_id = %self.settings.id, "no module resolved for this round");
                self.state = ClientState::Idle;
                return;
            }
        };
        info!(
            client_id = %self.settings.id,
            module = %module.display(),
            %model_config,
            secure_agg,
            dp_threshold,
            "launching training module",
        );

        let mut child = match Command::new(&self.settings.runner).arg(&module).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(client_id = %self.settings.id, error = %e, "failed to launch training module");
                self.state = ClientState::Idle;
                return;
            }
        };

        // watch the child independently; a failed run aborts the pending ack
        let watcher_id = self.settings.id.clone();
        let own_handle = self.handle.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    info!(client_id = %watcher_id, "training module finished")
                }
                Ok(status) => {
                    warn!(client_id = %watcher_id, %status, "training module failed");
                    own_handle.send(ClientMessage::ModuleRunFailed);
                }
                Err(e) => {
                    warn!(client_id = %watcher_id, error = %e, "lost track of the training module");
                    own_handle.send(ClientMessage::ModuleRunFailed);
                }
            }
        });

        let delay = Duration::from_secs(self.settings.started_ack_delay_secs);
        let sender = self.handle.id();
        let own_handle = self.handle.clone();
        self.cancel_ack();
        self.ack = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            reply_to.send(CoordinatorMessage::ModuleStarted { sender });
            own_handle.send(ClientMessage::ModuleStartReported);
        }));
        self.state = ClientState::Running;
    }

    fn handle_module_run_failed(&mut self) {
        error!(client_id = %self.settings.id, "module run failed, withdrawing from the round");
        self.cancel_ack();
        self.state = ClientState::Idle;
    }

    fn handle_module_start_reported(&mut self) {
        if self.state == ClientState::Running {
            debug!(client_id = %self.settings.id, "module start reported");
            self.ack = None;
            self.state = ClientState::Reported;
        }
    }

    /// Store the trained model for the external evaluation step.
    fn handle_test_model(&mut self, bytes: Bytes) {
        info!(client_id = %self.settings.id, size = bytes.len(), "received model for evaluation");
        let path = self.library.dir().join("test_model.pt");
        if let Err(e) = std::fs::write(&path, &bytes) {
            error!(client_id = %self.settings.id, error = %e, "failed to store model for evaluation");
        }
    }

    fn cancel_ack(&mut self) {
        if let Some(ack) = self.ack.take() {
            ack.abort();
            debug!(client_id = %self.settings.id, "pending start report cancelled");
        }
    }
}
