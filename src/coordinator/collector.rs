//! Countdown-based collection of per-participant binary payloads.

use std::{
    io,
    path::{Path, PathBuf},
};

use bytes::Bytes;

/// A set-once, saturating countdown.
///
/// The round advances exactly when a countdown reaches zero, so the counter
/// must neither be re-initialized mid-round nor driven below zero by a
/// duplicate or late decrement.
#[derive(Debug, Default)]
pub struct Countdown(Option<usize>);

impl Countdown {
    pub fn new() -> Self {
        Self(None)
    }

    /// Set the counter. A no-op if it was already set this round.
    pub fn initialize(&mut self, count: usize) {
        if self.0.is_none() {
            self.0 = Some(count);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.0.is_some()
    }

    /// Decrement and return the post-decrement value. Decrementing an unset
    /// or exhausted counter is a no-op that reports zero remaining.
    pub fn decrement(&mut self) -> usize {
        match self.0 {
            Some(ref mut remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining
            }
            None => 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.0 == Some(0)
    }
}

/// Persists intermediate results and test outputs, counting down until every
/// awaited participant has reported.
#[derive(Debug)]
pub struct ResultCollector {
    awaited: Countdown,
    resources_path: PathBuf,
    output_dir: PathBuf,
}

impl ResultCollector {
    pub fn new(resources_path: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            awaited: Countdown::new(),
            resources_path,
            output_dir,
        }
    }

    /// Set the number of intermediate results to await. Set-once per round.
    pub fn await_results(&mut self, count: usize) {
        self.awaited.initialize(count);
    }

    pub fn is_awaiting(&self) -> bool {
        self.awaited.is_initialized()
    }

    /// Store one intermediate result under `<resources>/interRes/<id>.pt` and
    /// return how many results are still missing.
    ///
    /// A failed write is logged but still counts the result as received: the
    /// round must reach completion rather than hang on a storage error.
    pub fn collect_intermediate(&mut self, sender_id: &str, bytes: &Bytes) -> usize {
        if let Err(e) = self.persist_intermediate(sender_id, bytes) {
            error!(sender_id, error = %e, "failed to persist intermediate result");
        }
        self.awaited.decrement()
    }

    fn persist_intermediate(&self, sender_id: &str, bytes: &Bytes) -> io::Result<()> {
        let dir = self.resources_path.join("interRes");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(format!("{}.pt", sender_id)), bytes)
    }

    pub fn is_complete(&self) -> bool {
        self.awaited.is_complete()
    }

    /// Store a tester's output under `<output_dir>/<id>.txt`.
    pub fn collect_test_output(&self, sender_id: &str, bytes: &Bytes) {
        let persist = || -> io::Result<()> {
            std::fs::create_dir_all(&self.output_dir)?;
            std::fs::write(self.output_dir.join(format!("{}.txt", sender_id)), bytes)
        };
        if let Err(e) = persist() {
            error!(sender_id, error = %e, "failed to persist test output");
        }
    }

    pub fn intermediate_path(&self, sender_id: &str) -> PathBuf {
        self.resources_path.join("interRes").join(format!("{}.pt", sender_id))
    }

    pub fn resources_path(&self) -> &Path {
        &self.resources_path
    }
}
