//! Registry of runs, live and finished.
//!
//! The outer map is only locked to insert or look up a handle. Each run has
//! its own lock, so updates from one run never contend with another.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{RegistryError, RunError};
use crate::events::{ProgressEvent, ProgressLine};
use crate::run::{Run, RunId};

/// Buffered events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Shared state of one run.
pub struct RunHandle {
    id: RunId,
    record: RwLock<Run>,
    progress: RwLock<Vec<ProgressLine>>,
    events: broadcast::Sender<ProgressEvent>,
    cancel: CancellationToken,
}

impl RunHandle {
    fn new(run: Run) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id: run.id(),
            record: RwLock::new(run),
            progress: RwLock::new(Vec::new()),
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    /// Copy of the current record.
    pub async fn snapshot(&self) -> Run {
        self.record.read().await.clone()
    }

    /// Replace the stored record. Refused once the stored record is final.
    pub async fn store(&self, run: &Run) -> Result<(), RunError> {
        let mut record = self.record.write().await;
        if record.is_finalized() {
            return Err(RunError::Finalized(self.id.to_string()));
        }
        *record = run.clone();
        Ok(())
    }

    /// Publish an event to subscribers, retaining progress lines.
    ///
    /// The progress lock is held across the send so a concurrent
    /// [`subscribe_with_history`](Self::subscribe_with_history) sees each
    /// line either in its history or on its receiver, never both.
    pub async fn emit(&self, event: ProgressEvent) {
        let mut progress = self.progress.write().await;
        if let ProgressEvent::Progress { message, timestamp } = &event {
            progress.push(ProgressLine {
                timestamp: *timestamp,
                message: message.clone(),
            });
        }
        // No subscribers is fine.
        if self.events.send(event).is_err() {
            debug!(run_id = %self.id, "No progress subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Subscribe and copy the retained lines as one step.
    pub async fn subscribe_with_history(
        &self,
    ) -> (broadcast::Receiver<ProgressEvent>, Vec<ProgressLine>) {
        let progress = self.progress.read().await;
        (self.events.subscribe(), progress.clone())
    }

    pub async fn progress_lines(&self) -> Vec<ProgressLine> {
        self.progress.read().await.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<RwLock<HashMap<RunId, Arc<RunHandle>>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, run: Run) -> Arc<RunHandle> {
        let handle = Arc::new(RunHandle::new(run));
        self.runs.write().await.insert(handle.id(), handle.clone());
        handle
    }

    pub async fn get(&self, id: RunId) -> Result<Arc<RunHandle>, RegistryError> {
        self.runs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub async fn snapshot(&self, id: RunId) -> Result<Run, RegistryError> {
        Ok(self.get(id).await?.snapshot().await)
    }

    /// Snapshots of every run, oldest first.
    pub async fn list(&self) -> Vec<Run> {
        let handles: Vec<Arc<RunHandle>> = self.runs.read().await.values().cloned().collect();
        let mut runs = Vec::with_capacity(handles.len());
        for handle in handles {
            runs.push(handle.snapshot().await);
        }
        runs.sort_by_key(Run::started_at);
        runs
    }

    pub async fn cancel(&self, id: RunId) -> Result<(), RegistryError> {
        self.get(id).await?.cancel();
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}
