//! The message channel surface: named endpoints connected by reliable,
//! ordered, asynchronous senders.
//!
//! Transport-level addressing is not this crate's concern. An endpoint is an
//! in-process mailbox; a [`Handle`] is the only way to reach it, and every
//! handle carries a stable [`EndpointId`] so that a receiver can attribute a
//! message to its sender without comparing channels.

use std::fmt;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Stable identity of a message endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(Uuid);

impl EndpointId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A typed sender to a single endpoint.
///
/// Sends never block and never fail loudly: once the receiving task is gone
/// the message is dropped with a warning, which is the delivery model the
/// protocol assumes (lost participants are handled by timeouts and quorum
/// checks, not by the channel).
pub struct Handle<T> {
    id: EndpointId,
    tx: UnboundedSender<T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Handle").field("id", &self.id).finish()
    }
}

impl<T> Handle<T> {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn send(&self, message: T) {
        if self.tx.send(message).is_err() {
            warn!(endpoint = %self.id, "failed to deliver message: endpoint is gone");
        }
    }
}

/// Create a new endpoint, returning a handle to it and its mailbox.
pub fn endpoint<T>() -> (Handle<T>, UnboundedReceiver<T>) {
    let (tx, rx) = unbounded_channel();
    (
        Handle {
            id: EndpointId::new(),
            tx,
        },
        rx,
    )
}
