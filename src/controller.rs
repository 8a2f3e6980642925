use crate::cloudkeys::{HttpKeyService, KeyService};
use crate::config::WorkflowConfig;
use crate::fallback::SyncTransport;
use crate::keystore::KeyStore;
use crate::stream::StreamingTransport;
use crate::transport::{BatchTransport, TransportError, TransportMode, probe_transport_mode};
use cvcore::keys::{
    KeyBundle, KeyError, normalize_aes_key, normalize_database_key, normalize_xor_key,
};
use cvcore::progress::{
    BatchOperation, ItemFailure, OperationKind, ProgressAggregator, ProgressEvent,
};
use cvcore::request::BatchRequest;
use cvcore::workflow::{TerminalOutcome, WorkflowPhase, WorkflowState, classify_terminal};
use futures_util::FutureExt;
use log::{debug, info, warn};
use rand::RngCore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Notify;

/// Emit a progress log line every this many processed items.
const PROGRESS_LOG_EVERY: u64 = 25;

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    InvalidKey(#[from] KeyError),

    #[error("storage path must not be empty")]
    EmptyStoragePath,

    #[error("{action} is not available while {phase}")]
    WrongPhase {
        action: &'static str,
        phase: WorkflowPhase,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("decrypt operation failed: {0}")]
    OperationFailed(String),

    #[error(
        "decryption failed for every item ({failed} failures); check the keys and storage path, then retry"
    )]
    TotalFailure { failed: u64 },

    #[error("no encrypted items were found at the supplied storage path")]
    NoWorkFound,

    #[error("a media XOR key is required to continue; enter one or skip media decryption")]
    MissingXorKey,
}

/// Which button the operator pressed on the media key form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmTrigger {
    Next,
    Skip,
}

/// Immutable snapshot returned by every phase action.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: WorkflowPhase,
    pub operation: BatchOperation,
    pub keys: KeyBundle,
    /// Non-fatal condition worth surfacing, such as a partial failure.
    pub warning: Option<String>,
    /// The operation was interrupted by the operator before finishing.
    pub cancelled: bool,
    pub workflow_complete: bool,
}

/// Requests cancellation of whatever batch operation is currently running.
/// Cloneable so a signal handler can own one while the controller runs.
#[derive(Clone)]
pub struct CancelHandle {
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.notify.notify_one();
    }
}

/// Drives the three-phase decrypt workflow: database pass, media key entry,
/// media pass. Owns the phase state, the accumulated key material and the
/// progress aggregation; talks to the decrypt service through the
/// [`BatchTransport`] seam and to the key lookup through [`KeyService`].
pub struct WorkflowController {
    config: WorkflowConfig,
    transport: Arc<dyn BatchTransport>,
    key_service: Arc<dyn KeyService>,
    key_store: Option<Arc<dyn KeyStore>>,
    state: WorkflowState,
    aggregator: ProgressAggregator,
    cancel_notify: Arc<Notify>,
    backfill_done: bool,
    unique_id: String,
    op_counter: AtomicU64,
}

impl WorkflowController {
    pub fn new(
        config: WorkflowConfig,
        transport: Arc<dyn BatchTransport>,
        key_service: Arc<dyn KeyService>,
        key_store: Option<Arc<dyn KeyStore>>,
    ) -> Self {
        let mut unique_id_bytes = [0u8; 2];
        rand::rng().fill_bytes(&mut unique_id_bytes);

        Self {
            config,
            transport,
            key_service,
            key_store,
            state: WorkflowState::default(),
            aggregator: ProgressAggregator::new(OperationKind::Database),
            cancel_notify: Arc::new(Notify::new()),
            backfill_done: false,
            unique_id: format!("{}.{}", unique_id_bytes[0], unique_id_bytes[1]),
            op_counter: AtomicU64::new(0),
        }
    }

    /// Builds a controller with the transports implied by the endpoint
    /// scheme: `ws`/`wss` streams progress, anything else uses the
    /// single-call HTTP fallback.
    pub fn from_config(config: WorkflowConfig, key_store: Option<Arc<dyn KeyStore>>) -> Self {
        let mode = probe_transport_mode(&config.endpoint, config.force_sync);
        let transport: Arc<dyn BatchTransport> = match mode {
            TransportMode::Streaming => Arc::new(StreamingTransport::new(&config.endpoint)),
            TransportMode::Sync => Arc::new(SyncTransport::new(&config.endpoint)),
        };
        let key_service = Arc::new(HttpKeyService::new(&config.endpoint));
        info!(
            target: "Workflow",
            "Using {} transport for {}",
            mode.as_str(),
            config.endpoint
        );
        Self::new(config, transport, key_service, key_store)
    }

    pub fn phase(&self) -> WorkflowPhase {
        self.state.phase
    }

    pub fn keys(&self) -> &KeyBundle {
        &self.state.keys
    }

    pub fn operation(&self) -> &BatchOperation {
        self.aggregator.operation()
    }

    pub fn is_complete(&self) -> bool {
        self.state.completed
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            notify: self.cancel_notify.clone(),
        }
    }

    /// Seeds the key bundle from the persisted store, best-effort. A load
    /// failure is logged and the workflow starts with whatever it has.
    pub async fn load_stored_keys(&mut self) {
        let Some(store) = &self.key_store else { return };
        match store.load_keys(&self.config.account).await {
            Ok(Some(stored)) => {
                self.state.keys.merge_stored(stored);
                info!(
                    target: "Workflow",
                    "Loaded stored keys for {} (db: {}, xor: {}, aes: {})",
                    self.config.account,
                    !self.state.keys.database_key.is_empty(),
                    self.state.keys.xor_key.is_some(),
                    self.state.keys.aes_key.is_some()
                );
            }
            Ok(None) => {
                debug!(target: "Workflow", "No stored keys for {}", self.config.account)
            }
            Err(e) => warn!(target: "Workflow", "Failed to load stored keys: {e}"),
        }
    }

    /// Phase 0: validates the database key and storage path, runs the
    /// database decrypt batch, and on success advances to media key entry.
    /// Validation failures never start an operation.
    pub async fn submit_database_credentials(
        &mut self,
        raw_db_key: &str,
        raw_storage_path: &str,
    ) -> Result<PhaseReport> {
        if self.state.phase != WorkflowPhase::AwaitingDatabaseKey {
            return Err(WorkflowError::WrongPhase {
                action: "database decrypt",
                phase: self.state.phase,
            });
        }

        let db_key = normalize_database_key(raw_db_key)?;
        let storage_path = raw_storage_path.trim().to_string();
        if storage_path.is_empty() {
            return Err(WorkflowError::EmptyStoragePath);
        }

        let request = BatchRequest::DecryptDatabase {
            account: self.config.account.clone(),
            storage_path: storage_path.clone(),
            db_key: db_key.clone(),
        };
        let (op, cancelled) = self.run_operation(request).await?;
        if cancelled {
            return Ok(self.report(None, true));
        }

        match self.classify(&op)? {
            TerminalOutcome::CleanSuccess => {
                self.finish_database_phase(db_key, storage_path, &op).await;
                Ok(self.report(None, false))
            }
            TerminalOutcome::PartialSuccess { failed, failures } => {
                self.finish_database_phase(db_key, storage_path, &op).await;
                Ok(self.report(Some(partial_warning(failed, &failures)), false))
            }
            TerminalOutcome::NoWorkFound => Err(WorkflowError::NoWorkFound),
            TerminalOutcome::TotalFailure { failed } => Err(WorkflowError::TotalFailure { failed }),
            TerminalOutcome::TransportFailed { message } => {
                Err(WorkflowError::OperationFailed(message))
            }
        }
    }

    async fn finish_database_phase(
        &mut self,
        db_key: String,
        storage_path: String,
        op: &BatchOperation,
    ) {
        self.state.keys.database_key = db_key;
        self.state.storage_path = storage_path;
        if let Some(summary) = &op.summary {
            self.state
                .keys
                .merge_reported(None, summary.xor_key.as_deref(), summary.aes_key.as_deref());
        }
        self.state.advance_to_media_keys();
        info!(
            target: "Workflow",
            "Database store decrypted; keys on hand: xor={}, aes={}",
            self.state.keys.xor_key.is_some(),
            self.state.keys.aes_key.is_some()
        );
        self.backfill_missing_keys().await;
    }

    /// Asks the cloud key service for any media keys still missing. Runs at
    /// most once per workflow and never overwrites a key already on hand.
    async fn backfill_missing_keys(&mut self) {
        if self.backfill_done {
            return;
        }
        self.backfill_done = true;

        if self.state.keys.has_media_keys() {
            debug!(
                target: "Workflow/Backfill",
                "Media keys already on hand; skipping cloud lookup"
            );
            return;
        }

        match self
            .key_service
            .fetch_account_keys(&self.config.account)
            .await
        {
            Ok(response) => {
                self.state.keys.merge_reported(
                    response.db_key.as_deref(),
                    response.xor_key.as_deref(),
                    response.aes_key.as_deref(),
                );
                info!(
                    target: "Workflow/Backfill",
                    "Cloud key lookup finished (xor: {}, aes: {})",
                    self.state.keys.xor_key.is_some(),
                    self.state.keys.aes_key.is_some()
                );
            }
            Err(e) => {
                warn!(
                    target: "Workflow/Backfill",
                    "Cloud key lookup failed: {e}; keys can still be entered manually"
                );
            }
        }
    }

    /// Phase 1: accepts manual media keys. `Next` requires a XOR key (typed
    /// now or already on hand) and advances to the media decrypt. `Skip`
    /// ends the workflow without a media pass; it stores whatever valid keys
    /// were typed but never fails on invalid ones.
    pub async fn confirm_media_keys(
        &mut self,
        raw_xor: &str,
        raw_aes: &str,
        trigger: ConfirmTrigger,
    ) -> Result<PhaseReport> {
        if self.state.phase != WorkflowPhase::AwaitingMediaKeys {
            return Err(WorkflowError::WrongPhase {
                action: "media key entry",
                phase: self.state.phase,
            });
        }

        match trigger {
            ConfirmTrigger::Next => {
                let xor = if raw_xor.trim().is_empty() {
                    self.state.keys.xor_key.ok_or(WorkflowError::MissingXorKey)?
                } else {
                    normalize_xor_key(raw_xor)?
                };
                let aes = normalize_aes_key(raw_aes)?;

                self.state.keys.xor_key = Some(xor);
                if !aes.is_empty() {
                    self.state.keys.aes_key = Some(aes);
                }
                self.persist_keys().await;
                self.state.advance_to_media_ready();
                info!(target: "Workflow", "Media keys confirmed; ready to decrypt media");
                Ok(self.report(None, false))
            }
            ConfirmTrigger::Skip => {
                if let Ok(xor) = normalize_xor_key(raw_xor) {
                    self.state.keys.xor_key = Some(xor);
                    if let Ok(aes) = normalize_aes_key(raw_aes)
                        && !aes.is_empty()
                    {
                        self.state.keys.aes_key = Some(aes);
                    }
                    self.persist_keys().await;
                } else {
                    debug!(
                        target: "Workflow",
                        "Skipping media decrypt without persistable keys"
                    );
                }
                self.state.mark_complete();
                info!(target: "Workflow", "Media decrypt skipped; workflow complete");
                Ok(self.report(None, false))
            }
        }
    }

    /// Phase 2: runs the media decrypt batch with the keys on hand. May be
    /// invoked repeatedly; every attempt starts from a fresh aggregator.
    pub async fn run_media_batch_decrypt(&mut self) -> Result<PhaseReport> {
        if self.state.phase != WorkflowPhase::MediaDecryptReady {
            return Err(WorkflowError::WrongPhase {
                action: "media decrypt",
                phase: self.state.phase,
            });
        }

        let request = BatchRequest::DecryptMedia {
            account: self.config.account.clone(),
            storage_path: self.state.storage_path.clone(),
            xor_key: self.state.keys.xor_key_display(),
            aes_key: self.state.keys.aes_key.clone(),
        };
        let (op, cancelled) = self.run_operation(request).await?;
        if cancelled {
            return Ok(self.report(None, true));
        }

        match self.classify(&op)? {
            TerminalOutcome::CleanSuccess => {
                self.state.mark_complete();
                info!(target: "Workflow", "Media decrypt finished; workflow complete");
                Ok(self.report(None, false))
            }
            TerminalOutcome::PartialSuccess { failed, failures } => {
                self.state.mark_complete();
                Ok(self.report(Some(partial_warning(failed, &failures)), false))
            }
            TerminalOutcome::NoWorkFound => Err(WorkflowError::NoWorkFound),
            TerminalOutcome::TotalFailure { failed } => Err(WorkflowError::TotalFailure { failed }),
            TerminalOutcome::TransportFailed { message } => {
                Err(WorkflowError::OperationFailed(message))
            }
        }
    }

    /// Starts a batch operation and drives it to a terminal event, applying
    /// every received event to the aggregator. Returns the terminal
    /// operation snapshot and whether the operator cancelled mid-run. The
    /// handle is closed on every exit path, so a retry never leaves a stale
    /// stream feeding the aggregator.
    async fn run_operation(&mut self, request: BatchRequest) -> Result<(BatchOperation, bool)> {
        let kind = request.kind();
        let op_id = self.generate_operation_id();
        self.aggregator.reset(kind);

        // A cancel requested before this operation started must not abort it.
        let _ = self.cancel_notify.notified().now_or_never();

        info!(
            target: "Workflow",
            "Starting {} decrypt batch {} over {} transport",
            kind.as_str(),
            op_id,
            self.transport.mode().as_str()
        );

        let handle = self.transport.start(request).await?;
        let mut handle = scopeguard::guard(handle, |mut h| h.close());

        let cancel = self.cancel_notify.clone();
        let mut cancelled = false;
        loop {
            tokio::select! {
                event = handle.next_event() => match event {
                    Some(event) => {
                        match &event {
                            ProgressEvent::Scanning { message: Some(m) }
                            | ProgressEvent::Phase { message: m } => {
                                info!(target: "Workflow", "Batch {op_id}: {m}");
                            }
                            _ => {}
                        }
                        let is_progress = matches!(event, ProgressEvent::Progress { .. });
                        let op = self.aggregator.apply(&event);
                        if op.is_terminal() {
                            break;
                        }
                        if is_progress
                            && op.processed > 0
                            && op.processed % PROGRESS_LOG_EVERY == 0
                        {
                            info!(
                                target: "Workflow",
                                "Batch {op_id}: {}/{} processed ({} failed, {} skipped)",
                                op.processed,
                                op.total_items,
                                op.failed,
                                op.skipped
                            );
                        }
                    }
                    None => {
                        self.aggregator.apply(&ProgressEvent::Error {
                            message: "progress stream ended unexpectedly".to_string(),
                        });
                        break;
                    }
                },
                _ = cancel.notified() => {
                    info!(target: "Workflow", "Batch {op_id} cancelled by the operator");
                    cancelled = true;
                    break;
                }
            }
        }
        drop(handle);

        let op = self.aggregator.operation().clone();
        if let Some(secs) = op.elapsed_secs() {
            info!(
                target: "Workflow",
                "Batch {op_id} finished in {secs:.1}s: {} ok, {} failed, {} skipped",
                op.succeeded,
                op.failed,
                op.skipped
            );
        }
        Ok((op, cancelled))
    }

    fn classify(&self, op: &BatchOperation) -> Result<TerminalOutcome> {
        classify_terminal(op).ok_or_else(|| {
            WorkflowError::OperationFailed("operation ended without a terminal event".to_string())
        })
    }

    async fn persist_keys(&self) {
        let Some(store) = &self.key_store else { return };
        match store.save_keys(&self.config.account, &self.state.keys).await {
            Ok(()) => {
                debug!(target: "Workflow", "Persisted key bundle for {}", self.config.account)
            }
            Err(e) => warn!(target: "Workflow", "Failed to persist keys: {e}"),
        }
    }

    fn report(&self, warning: Option<String>, cancelled: bool) -> PhaseReport {
        PhaseReport {
            phase: self.state.phase,
            operation: self.aggregator.operation().clone(),
            keys: self.state.keys.clone(),
            warning,
            cancelled,
            workflow_complete: self.state.completed,
        }
    }

    fn generate_operation_id(&self) -> String {
        let count = self.op_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.unique_id, count)
    }
}

fn partial_warning(failed: u64, failures: &[ItemFailure]) -> String {
    let mut warning = format!("{failed} item(s) failed to decrypt");
    if !failures.is_empty() {
        let detail = failures
            .iter()
            .take(3)
            .map(|f| format!("{}: {}", f.item, f.reason))
            .collect::<Vec<_>>()
            .join("; ");
        warning.push_str(&format!(" ({detail}"));
        if failures.len() > 3 {
            warning.push_str(", ...");
        }
        warning.push(')');
    }
    warning
}
