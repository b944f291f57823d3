//! Periodic readiness re-evaluation.
//!
//! The ticker delivers `ReadinessTick` messages into the coordinator's own
//! mailbox so that quorum checks never race with registry mutation.

use std::time::Duration;

use tokio::{task::JoinHandle, time};

use crate::message::{CoordinatorHandle, CoordinatorMessage};

/// Handle to a running readiness ticker. Cancelling is idempotent;
/// cancelling an already-cancelled ticker is a no-op.
#[derive(Debug, Default)]
pub struct TickerHandle {
    task: Option<JoinHandle<()>>,
}

impl TickerHandle {
    pub fn cancel(&mut self) {
        match self.task.take() {
            Some(task) => {
                task.abort();
                debug!("readiness ticker cancelled");
            }
            None => trace!("readiness ticker already cancelled"),
        }
    }
}

/// Spawn a ticker that sends `ReadinessTick` every `period`, starting one
/// period from now.
pub fn spawn(period: Duration, coordinator: CoordinatorHandle) -> TickerHandle {
    let task = tokio::spawn(async move {
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            coordinator.send(CoordinatorMessage::ReadinessTick);
        }
    });
    TickerHandle { task: Some(task) }
}
