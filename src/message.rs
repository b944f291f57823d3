//! Protocol messages exchanged between the coordinator, the clients, the
//! module injector and the round supervisor.
//!
//! The field lists are the contract; payloads that other subsystems produce
//! or consume (model weights, intermediate tensors, public keys) stay opaque
//! bytes here.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::channel::{EndpointId, Handle};

pub type CoordinatorHandle = Handle<CoordinatorMessage>;
pub type ClientHandle = Handle<ClientMessage>;
pub type InjectorHandle = Handle<InjectorMessage>;

/// An opaque public key exchanged during the secure-aggregation handshake.
///
/// Key generation and use belong to the external crypto layer; the protocol
/// only stores and forwards these bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey(pub Bytes);

impl PublicKey {
    /// A fresh random key, for clients without a provisioned one.
    pub fn random() -> Self {
        let bytes: Vec<u8> = (0..32).map(|_| rand::random::<u8>()).collect();
        Self(Bytes::from(bytes))
    }
}

/// Messages delivered to the coordinator's mailbox.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// Trigger a new round, discarding any previous round state.
    StartRound,
    /// A client asks to take part in the current round.
    JoinRound(JoinRoundRequest),
    /// Periodic readiness re-evaluation from the ticker.
    ReadinessTick,
    /// A participant reports that its training module is up.
    ModuleStarted { sender: EndpointId },
    /// Liveness confirmation plus the participant's public key.
    LivenessReply {
        sender: EndpointId,
        public_key: PublicKey,
    },
    /// An encrypted value for another participant; the coordinator routes
    /// it to the named receiver during the secure exchange.
    SendValue { receiver: String, bytes: Bytes },
    /// A per-participant intermediate result (e.g. a partial tensor).
    IntermediateResult { sender_id: String, bytes: Bytes },
    /// A tester's model evaluation output.
    TestResult { sender_id: String, bytes: Bytes },
}

#[derive(Debug)]
pub struct JoinRoundRequest {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub client_id: String,
    pub address: String,
    pub port: u16,
    /// How the coordinator reaches this client for the rest of the round.
    pub handle: ClientHandle,
}

/// Messages delivered to a client's mailbox.
#[derive(Debug)]
pub enum ClientMessage {
    /// From the supervisor: resolve a module for this task and join a round.
    StartLearning { task_id: String },
    /// Module candidates for the requested task.
    ModuleListResponse { modules: Vec<ModuleDescriptor> },
    /// The content of a previously requested module.
    ModuleResponse { file_name: String, content: Bytes },
    /// Whether the coordinator let this client into the round.
    JoinRoundResponse { can_join: bool },
    /// From the coordinator: launch the training module.
    StartLearningProcess {
        model_config: String,
        secure_agg: bool,
        dp_threshold: f64,
        reply_to: CoordinatorHandle,
    },
    /// Secure-aggregation liveness probe.
    LivenessProbe { reply_to: CoordinatorHandle },
    /// Trainer roster and keys for the secure exchange.
    DataSpread(DataSpread),
    /// An encrypted value relayed from another participant.
    EncryptedValue { bytes: Bytes },
    /// The trained model, sent to selected testers for evaluation.
    TestModel { bytes: Bytes },
    /// Internal: the detached module run terminated unsuccessfully.
    ModuleRunFailed,
    /// Internal: the delayed module-started acknowledgment went out.
    ModuleStartReported,
}

/// Data spread to every non-tester once liveness is confirmed.
#[derive(Clone, Debug)]
pub struct DataSpread {
    /// Number of training (non-tester) participants.
    pub trainer_count: usize,
    /// Public keys of the non-tester participants only.
    pub public_keys: HashMap<String, PublicKey>,
    pub secure_agg: bool,
    pub dp_threshold: f64,
    /// Mock weighting value carried for the external aggregation step.
    pub weighting: f64,
}

/// Messages delivered to the module injector's mailbox.
#[derive(Debug)]
pub enum InjectorMessage {
    ModuleListRequest {
        task_id: String,
        reply_to: ClientHandle,
    },
    ModuleRequest {
        file_name: String,
        reply_to: ClientHandle,
    },
}

/// A module made available by the injector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub file_name: String,
    pub use_cuda: bool,
    pub instance_type: InstanceType,
    pub min_ram_gb: u32,
    pub task_id: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceType {
    Computer,
    Phone,
}

/// Round lifecycle notifications for the external round supervisor.
#[derive(Debug, PartialEq, Eq)]
pub enum RoundEvent {
    /// The round ran to completion.
    Ended,
    /// The round was aborted (quorum never met, or training failed).
    Failed,
}
