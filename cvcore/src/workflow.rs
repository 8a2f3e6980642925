use crate::keys::KeyBundle;
use crate::progress::{BatchOperation, ItemFailure, OperationStatus};

/// The wizard's current stage. Transitions are one-directional; recovery from
/// a failed action re-enters the same phase rather than moving backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkflowPhase {
    #[default]
    AwaitingDatabaseKey,
    AwaitingMediaKeys,
    MediaDecryptReady,
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowPhase::AwaitingDatabaseKey => write!(f, "awaiting database key"),
            WorkflowPhase::AwaitingMediaKeys => write!(f, "awaiting media keys"),
            WorkflowPhase::MediaDecryptReady => write!(f, "ready for media decrypt"),
        }
    }
}

/// Everything that survives across phases: the current phase, the key
/// material gathered so far, the validated storage path, and whether the
/// workflow as a whole has finished (including via the skip exit).
#[derive(Debug, Clone, Default)]
pub struct WorkflowState {
    pub phase: WorkflowPhase,
    pub keys: KeyBundle,
    pub storage_path: String,
    pub completed: bool,
}

impl WorkflowState {
    pub fn advance_to_media_keys(&mut self) {
        self.phase = WorkflowPhase::AwaitingMediaKeys;
    }

    pub fn advance_to_media_ready(&mut self) {
        self.phase = WorkflowPhase::MediaDecryptReady;
    }

    pub fn mark_complete(&mut self) {
        self.completed = true;
    }
}

/// How a finished batch operation is interpreted by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    /// Every item decrypted (or was legitimately skipped).
    CleanSuccess,
    /// Some items failed but at least one succeeded; forward progress.
    PartialSuccess {
        failed: u64,
        failures: Vec<ItemFailure>,
    },
    /// Completed with zero successes, zero failures and no known total:
    /// nothing to decrypt was found at all.
    NoWorkFound,
    /// Completed, but every attempted item failed.
    TotalFailure { failed: u64 },
    /// The operation itself failed: a terminal `error` event, a dropped
    /// stream, or a failed fallback call.
    TransportFailed { message: String },
}

impl TerminalOutcome {
    /// Whether this outcome counts as forward progress for the phase.
    pub fn advances(&self) -> bool {
        matches!(
            self,
            TerminalOutcome::CleanSuccess | TerminalOutcome::PartialSuccess { .. }
        )
    }
}

/// Classifies a terminal [`BatchOperation`], or returns `None` while the
/// operation is still pending or running.
pub fn classify_terminal(op: &BatchOperation) -> Option<TerminalOutcome> {
    match op.status {
        OperationStatus::Pending | OperationStatus::Running => None,
        OperationStatus::Failed => Some(TerminalOutcome::TransportFailed {
            message: op
                .error
                .clone()
                .unwrap_or_else(|| "operation failed without a reason".to_string()),
        }),
        OperationStatus::Complete => {
            if op.succeeded == 0 && op.failed == 0 && op.total_items == 0 {
                return Some(TerminalOutcome::NoWorkFound);
            }
            if op.failed == 0 {
                return Some(TerminalOutcome::CleanSuccess);
            }
            if op.succeeded > 0 {
                let failures = op
                    .summary
                    .as_ref()
                    .map(|s| s.failures.clone())
                    .unwrap_or_default();
                Some(TerminalOutcome::PartialSuccess {
                    failed: op.failed,
                    failures,
                })
            } else {
                Some(TerminalOutcome::TotalFailure { failed: op.failed })
            }
        }
    }
}
