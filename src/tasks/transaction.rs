//! Ordered rollback log for multi-step operations.
//!
//! Each forward step that succeeds records its inverse. When a later step
//! fails, or the owner calls [`Transaction::rollback`], the recorded inverses
//! run newest first. A failing inverse is logged and the remaining ones still
//! run. A transaction dropped without `commit` rolls itself back.

use std::fmt;

use crate::core::TransactionError;

type Undo = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

struct RollbackEntry {
    forward: String,
    inverse: String,
    outcome: String,
    undo: Undo,
}

/// What a rollback did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub attempted: usize,
    /// Descriptions of the inverse steps that failed, with their errors.
    pub failed: Vec<String>,
}

impl RollbackReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for RollbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failed.is_empty() {
            write!(f, "rolled back {} step(s)", self.attempted)
        } else {
            write!(
                f,
                "rollback incomplete, {} of {} step(s) could not be undone: {}",
                self.failed.len(),
                self.attempted,
                self.failed.join("; ")
            )
        }
    }
}

pub struct Transaction {
    name: String,
    log: Vec<RollbackEntry>,
}

impl Transaction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            log: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Forward descriptions of the recorded steps, oldest first.
    pub fn steps(&self) -> impl Iterator<Item = &str> {
        self.log.iter().map(|e| e.forward.as_str())
    }

    /// Runs `forward(&args)`. On success records `inverse(&result, &args)`
    /// and returns the result. On failure rolls back everything recorded so
    /// far and returns the original error together with the rollback report.
    pub fn execute_with_rollback<A, R, F, I>(
        &mut self,
        forward_label: impl Into<String>,
        inverse_label: impl Into<String>,
        forward: F,
        inverse: I,
        args: A,
    ) -> Result<R, TransactionError>
    where
        A: Send + 'static,
        R: Clone + fmt::Debug + Send + 'static,
        F: FnOnce(&A) -> anyhow::Result<R>,
        I: FnOnce(&R, &A) -> anyhow::Result<()> + Send + 'static,
    {
        let forward_label = forward_label.into();
        match forward(&args) {
            Ok(result) => {
                let kept = result.clone();
                self.log.push(RollbackEntry {
                    outcome: format!("{:?}", result),
                    forward: forward_label,
                    inverse: inverse_label.into(),
                    undo: Box::new(move || inverse(&kept, &args)),
                });
                Ok(result)
            }
            Err(source) => {
                tracing::warn!(
                    transaction = %self.name,
                    step = %forward_label,
                    "Step failed: {:#}; rolling back {} completed step(s)",
                    source,
                    self.log.len()
                );
                let rollback = self.rollback();
                Err(TransactionError {
                    step: forward_label,
                    source,
                    rollback,
                })
            }
        }
    }

    /// Undoes every recorded step, newest first, and clears the log.
    pub fn rollback(&mut self) -> RollbackReport {
        let mut report = RollbackReport::default();
        for entry in self.log.drain(..).rev() {
            report.attempted += 1;
            match (entry.undo)() {
                Ok(()) => tracing::debug!(
                    transaction = %self.name,
                    "Undid '{}' via '{}'",
                    entry.forward,
                    entry.inverse
                ),
                Err(e) => {
                    tracing::error!(
                        transaction = %self.name,
                        "Could not undo '{}' (result {}): {:#}",
                        entry.forward,
                        entry.outcome,
                        e
                    );
                    report.failed.push(format!("{}: {:#}", entry.inverse, e));
                }
            }
        }
        report
    }

    /// Keeps all recorded steps. Returns how many there were.
    pub fn commit(&mut self) -> usize {
        let steps = self.log.len();
        self.log.clear();
        tracing::debug!(transaction = %self.name, steps, "committed");
        steps
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.log.is_empty() {
            tracing::warn!(
                transaction = %self.name,
                "Dropped with {} uncommitted step(s); rolling back",
                self.log.len()
            );
            let report = self.rollback();
            tracing::info!(transaction = %self.name, "{}", report);
        }
    }
}
