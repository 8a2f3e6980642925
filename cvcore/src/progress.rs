use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

/// Which batch pass an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Database,
    Media,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Database => "database",
            OperationKind::Media => "media",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Complete | OperationStatus::Failed)
    }
}

/// One failed work item, as reported in a terminal summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item: String,
    pub reason: String,
}

/// Payload of a terminal `complete` event. Every field is optional on the
/// wire; the database pass additionally reports media keys it discovered
/// inside the decrypted store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionSummary {
    #[serde(default)]
    pub success_count: Option<u64>,
    #[serde(default)]
    pub failure_count: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub skip_count: Option<u64>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub xor_key: Option<String>,
    #[serde(default)]
    pub aes_key: Option<String>,
    #[serde(default)]
    pub failures: Vec<ItemFailure>,
}

/// A server-pushed progress message. `progress` counts are absolute
/// snapshots, not deltas; a later event fully supersedes an earlier one.
/// `complete` and `error` are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Scanning {
        #[serde(default)]
        message: Option<String>,
    },
    Start {
        total: u64,
    },
    Progress {
        current: u64,
        #[serde(default)]
        total: Option<u64>,
        #[serde(default)]
        success_count: u64,
        #[serde(default)]
        fail_count: u64,
        #[serde(default)]
        skip_count: u64,
        #[serde(default)]
        current_file: Option<String>,
        #[serde(default)]
        status: Option<String>,
    },
    Phase {
        message: String,
    },
    Complete(CompletionSummary),
    Error {
        message: String,
    },
}

impl ProgressEvent {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Complete(_) | ProgressEvent::Error { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ProgressEvent::Scanning { .. } => "scanning",
            ProgressEvent::Start { .. } => "start",
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Phase { .. } => "phase",
            ProgressEvent::Complete(_) => "complete",
            ProgressEvent::Error { .. } => "error",
        }
    }
}

/// Running state of one batch decrypt pass. Mutated exclusively through
/// [`ProgressAggregator::apply`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOperation {
    pub kind: OperationKind,
    pub status: OperationStatus,
    /// 0 until a `start` event arrives; never decreases once set.
    pub total_items: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub current_item: Option<String>,
    /// Last informational label from a `scanning` or `phase` event.
    pub stage: Option<String>,
    /// Message of a terminal `error` event.
    pub error: Option<String>,
    /// Frozen payload of a terminal `complete` event.
    pub summary: Option<CompletionSummary>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchOperation {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            status: OperationStatus::Pending,
            total_items: 0,
            processed: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            current_item: None,
            stage: None,
            error: None,
            summary: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock seconds between creation and the terminal event, if both
    /// timestamps are known.
    pub fn elapsed_secs(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => {
                Some(end.signed_duration_since(start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// `processed` is the saturating sum of the outcome counts; the wire
    /// values are untrusted.
    fn recount_processed(&mut self) {
        self.processed = self
            .succeeded
            .saturating_add(self.failed)
            .saturating_add(self.skipped);
    }
}

/// Accumulates progress events into a [`BatchOperation`], independent of the
/// transport that produced them. Events arriving after a terminal state are
/// ignored, which makes late or duplicate delivery harmless.
#[derive(Debug)]
pub struct ProgressAggregator {
    op: BatchOperation,
}

impl ProgressAggregator {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            op: BatchOperation::new(kind),
        }
    }

    /// Discards all accumulated state for a fresh attempt.
    pub fn reset(&mut self, kind: OperationKind) {
        self.op = BatchOperation::new(kind);
    }

    pub fn operation(&self) -> &BatchOperation {
        &self.op
    }

    pub fn apply(&mut self, event: &ProgressEvent) -> &BatchOperation {
        if self.op.status.is_terminal() {
            debug!(
                "Ignoring {} event after terminal {} operation state",
                event.type_name(),
                self.op.kind.as_str()
            );
            return &self.op;
        }

        match event {
            ProgressEvent::Scanning { message } => {
                self.op.status = OperationStatus::Running;
                if let Some(msg) = message {
                    self.op.stage = Some(msg.clone());
                }
            }
            ProgressEvent::Start { total } => {
                self.op.status = OperationStatus::Running;
                if *total > self.op.total_items {
                    self.op.total_items = *total;
                }
            }
            ProgressEvent::Progress {
                current,
                total,
                success_count,
                fail_count,
                skip_count,
                current_file,
                status: _,
            } => {
                self.op.status = OperationStatus::Running;
                self.op.succeeded = *success_count;
                self.op.failed = *fail_count;
                self.op.skipped = *skip_count;
                self.op.recount_processed();
                if self.op.processed != *current {
                    debug!(
                        "Progress snapshot disagrees with itself: current={} but counts sum to {}",
                        current, self.op.processed
                    );
                }
                if let Some(total) = total
                    && *total > self.op.total_items
                {
                    self.op.total_items = *total;
                }
                if let Some(file) = current_file {
                    self.op.current_item = Some(file.clone());
                }
            }
            ProgressEvent::Phase { message } => {
                self.op.stage = Some(message.clone());
            }
            ProgressEvent::Complete(summary) => {
                self.op.status = OperationStatus::Complete;
                if let Some(n) = summary.success_count {
                    self.op.succeeded = n;
                }
                if let Some(n) = summary.failure_count {
                    self.op.failed = n;
                }
                if let Some(n) = summary.skip_count {
                    self.op.skipped = n;
                }
                self.op.recount_processed();
                if let Some(total) = summary.total
                    && total > self.op.total_items
                {
                    self.op.total_items = total;
                }
                self.op.summary = Some(summary.clone());
                self.op.finished_at = Some(Utc::now());
            }
            ProgressEvent::Error { message } => {
                self.op.status = OperationStatus::Failed;
                self.op.error = Some(message.clone());
                self.op.finished_at = Some(Utc::now());
            }
        }

        &self.op
    }
}
