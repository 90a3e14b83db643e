//! Undo list for multi-step operations that span the ledger and the blob
//! store. Steps register their inverse as they succeed; on failure the
//! inverses run newest-first.

use std::{future::Future, pin::Pin};
use tracing::{debug, warn};

type UndoFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

#[derive(Default)]
pub struct Compensations {
    steps: Vec<(String, UndoFuture)>,
}

impl Compensations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the inverse of a step that just succeeded. The future is not
    /// polled unless [`unwind`](Self::unwind) runs.
    pub fn push<F>(&mut self, label: impl Into<String>, undo: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push((label.into(), Box::pin(undo)));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every registered undo in reverse order. Failing undos are logged
    /// and do not stop the rest. Returns how many failed.
    pub async fn unwind(self) -> usize {
        let mut failed = 0;
        for (label, undo) in self.steps.into_iter().rev() {
            match undo.await {
                Ok(()) => debug!("compensated: {}", label),
                Err(err) => {
                    warn!("compensation `{}` failed: {:#}", label, err);
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Drop all undos; the operation completed.
    pub fn commit(self) {
        debug!("committed after {} steps", self.steps.len());
    }
}
