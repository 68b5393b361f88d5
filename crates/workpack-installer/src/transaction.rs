use anyhow::Result;

use crate::Reporter;

type RollbackFn<'a> = Box<dyn FnMut() -> Result<()> + 'a>;
type CleanupFn<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Applying,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applying => "applying",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }
}

struct Step<'a> {
    label: String,
    rollback: Option<RollbackFn<'a>>,
}

/// Ordered undo log for one top-level operation.
///
/// Every step registers its rollback before its action runs, so a step that
/// fails halfway is undone together with everything registered before it.
/// Steps started from inside another step's action are nested: they land
/// after their parent and are undone first. Cleanups are deferred until the
/// transaction ends, after any rollback has finished with them.
pub struct Transaction<'a> {
    reporter: Reporter,
    steps: Vec<Step<'a>>,
    cleanups: Vec<(String, CleanupFn<'a>)>,
    status: TransactionStatus,
}

impl<'a> Transaction<'a> {
    pub fn new(reporter: Reporter) -> Self {
        Self {
            reporter,
            steps: Vec::new(),
            cleanups: Vec::new(),
            status: TransactionStatus::Applying,
        }
    }

    /// Runs `body` in a fresh transaction. On error every registered step is
    /// rolled back in reverse order before the error is returned; cleanups
    /// run in both cases.
    pub fn execute<T>(
        reporter: &Reporter,
        body: impl FnOnce(&mut Transaction<'a>) -> Result<T>,
    ) -> Result<T> {
        let mut tx = Transaction::new(reporter.clone());
        match body(&mut tx) {
            Ok(value) => {
                tx.status = TransactionStatus::Committed;
                tx.finish();
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(error = %format!("{err:#}"), "transaction failed; rolling back");
                tx.rollback();
                tx.finish();
                Err(err)
            }
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn step_labels(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.label.as_str()).collect()
    }

    pub fn run<T>(
        &mut self,
        label: impl Into<String>,
        action: impl FnOnce(&mut Transaction<'a>) -> Result<T>,
        rollback: impl FnMut() -> Result<()> + 'a,
        cleanup: impl FnOnce() -> Result<()> + 'a,
    ) -> Result<T> {
        let label = label.into();
        self.cleanups.push((label.clone(), Box::new(cleanup)));
        self.steps.push(Step {
            label: label.clone(),
            rollback: Some(Box::new(rollback)),
        });
        tracing::debug!(step = %label, "running transaction step");
        action(self)
    }

    pub fn run_with_rollback<T>(
        &mut self,
        label: impl Into<String>,
        action: impl FnOnce(&mut Transaction<'a>) -> Result<T>,
        rollback: impl FnMut() -> Result<()> + 'a,
    ) -> Result<T> {
        self.run(label, action, rollback, || Ok(()))
    }

    /// Registers a step that has nothing to undo.
    pub fn run_action<T>(
        &mut self,
        label: impl Into<String>,
        action: impl FnOnce(&mut Transaction<'a>) -> Result<T>,
    ) -> Result<T> {
        let label = label.into();
        self.steps.push(Step {
            label: label.clone(),
            rollback: None,
        });
        tracing::debug!(step = %label, "running transaction step");
        action(self)
    }

    /// Undoes every registered step, newest first. Failures are logged and
    /// skipped so the error that triggered the rollback is the one reported.
    pub fn rollback(&mut self) {
        for step in self.steps.iter_mut().rev() {
            let Some(rollback) = step.rollback.as_mut() else {
                continue;
            };
            tracing::debug!(step = %step.label, "rolling back transaction step");
            if let Err(err) = rollback() {
                tracing::warn!(step = %step.label, error = %format!("{err:#}"), "rollback failed");
                self.reporter
                    .warning(format!("Rollback of '{}' failed: {err:#}", step.label));
            }
        }
        self.status = TransactionStatus::RolledBack;
    }

    fn run_cleanups(&mut self) {
        while let Some((label, cleanup)) = self.cleanups.pop() {
            if let Err(err) = cleanup() {
                tracing::warn!(step = %label, error = %format!("{err:#}"), "cleanup failed");
            }
        }
    }

    pub fn finish(mut self) {
        self.run_cleanups();
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.run_cleanups();
    }
}
