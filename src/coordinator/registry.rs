//! Per-round participant bookkeeping.

use std::collections::HashMap;

use crate::{
    channel::EndpointId,
    message::{ClientHandle, PublicKey},
};

/// One client within the current round.
#[derive(Debug)]
pub struct Participant {
    pub client_id: String,
    pub address: String,
    pub port: u16,
    pub handle: ClientHandle,
    pub module_started: bool,
    pub module_alive: bool,
    /// Present only once the participant answered the liveness probe.
    pub public_key: Option<PublicKey>,
    /// Numeric intermediate results; currently unused by consumers but
    /// retained for the aggregation layer.
    pub inter_res: Vec<f32>,
}

impl Participant {
    pub fn new(client_id: String, address: String, port: u16, handle: ClientHandle) -> Self {
        Self {
            client_id,
            address,
            port,
            handle,
            module_started: false,
            module_alive: false,
            public_key: None,
            inter_res: Vec::new(),
        }
    }
}

/// Registry of the current round's participants, keyed by client id, with a
/// secondary index from the sender endpoint for message attribution.
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    by_id: HashMap<String, Participant>,
    by_endpoint: HashMap<EndpointId, String>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant. A duplicate join by the same id overwrites the
    /// prior entry; the stale endpoint index entry is dropped.
    pub fn insert(&mut self, participant: Participant) {
        if let Some(previous) = self.by_id.get(&participant.client_id) {
            self.by_endpoint.remove(&previous.handle.id());
        }
        self.by_endpoint
            .insert(participant.handle.id(), participant.client_id.clone());
        self.by_id
            .insert(participant.client_id.clone(), participant);
    }

    pub fn get(&self, client_id: &str) -> Option<&Participant> {
        self.by_id.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut Participant> {
        self.by_id.get_mut(client_id)
    }

    /// Attribute a message to a participant by its sender endpoint.
    pub fn by_sender(&mut self, sender: EndpointId) -> Option<&mut Participant> {
        let id = self.by_endpoint.get(&sender)?;
        self.by_id.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_endpoint.clear();
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.by_id.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.by_id.values()
    }

    pub fn all_started(&self) -> bool {
        !self.is_empty() && self.by_id.values().all(|p| p.module_started)
    }

    pub fn all_alive(&self) -> bool {
        !self.is_empty() && self.by_id.values().all(|p| p.module_alive)
    }
}
