use super::{
    service::{CompletionSubscription, TransferError, TransferService},
    types::{ListenerOptions, TransferId, TransferRequest, TransferStatus},
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Mutex, MutexGuard, PoisonError,
};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Default)]
struct MemoryState {
    enqueued: Vec<(TransferId, TransferRequest)>,
    statuses: HashMap<TransferId, TransferStatus>,
    scripted: HashMap<TransferId, VecDeque<TransferStatus>>,
    reject_enqueue: Option<String>,
    fail_queries: Option<String>,
    listener_options: Vec<ListenerOptions>,
}

/// In-process transfer service that never touches the network.
///
/// Records every enqueued request and lets the owner script statuses and
/// fire completion events by hand. With `auto_complete` set, each enqueue
/// is immediately settled with that status and announced. With an
/// `enqueue_delay`, `enqueue` returns only after that delay, so the
/// announcement reaches listeners before the caller learns the id.
pub struct MemoryTransferService {
    next_id: AtomicI64,
    state: Mutex<MemoryState>,
    events: broadcast::Sender<TransferId>,
    auto_complete: Option<TransferStatus>,
    enqueue_delay: Option<Duration>,
}

impl MemoryTransferService {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            next_id: AtomicI64::new(1),
            state: Mutex::new(MemoryState::default()),
            events,
            auto_complete: None,
            enqueue_delay: None,
        }
    }

    pub fn with_auto_complete(status: TransferStatus) -> Self {
        Self {
            auto_complete: Some(status),
            ..Self::new()
        }
    }

    pub fn with_enqueue_delay(mut self, delay: Duration) -> Self {
        self.enqueue_delay = Some(delay);
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueued(&self) -> Vec<(TransferId, TransferRequest)> {
        self.state().enqueued.clone()
    }

    pub fn set_status(&self, id: TransferId, status: TransferStatus) {
        self.state().statuses.insert(id, status);
    }

    /// Forget any status recorded for `id`, as if the service had no record.
    pub fn clear_status(&self, id: TransferId) {
        let mut state = self.state();
        state.statuses.remove(&id);
        state.scripted.remove(&id);
    }

    /// Answer successive status queries for `id` from `statuses` in order;
    /// the last one keeps being reported once the script runs out.
    pub fn script_statuses(
        &self,
        id: TransferId,
        statuses: impl IntoIterator<Item = TransferStatus>,
    ) {
        self.state().scripted.insert(id, statuses.into_iter().collect());
    }

    /// Record a status and broadcast the completion event for `id`.
    pub fn complete(&self, id: TransferId, status: TransferStatus) {
        self.set_status(id, status);
        self.notify(id);
    }

    /// Broadcast a completion event without touching any status.
    pub fn notify(&self, id: TransferId) {
        if self.events.send(id).is_err() {
            debug!("No completion listeners for transfer {}", id);
        }
    }

    pub fn reject_enqueue(&self, message: impl Into<String>) {
        self.state().reject_enqueue = Some(message.into());
    }

    pub fn fail_queries(&self, message: impl Into<String>) {
        self.state().fail_queries = Some(message.into());
    }

    pub fn listener_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn listener_options(&self) -> Vec<ListenerOptions> {
        self.state().listener_options.clone()
    }
}

impl Default for MemoryTransferService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferService for MemoryTransferService {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, request: TransferRequest) -> Result<TransferId, TransferError> {
        let id = {
            let mut state = self.state();
            if let Some(message) = &state.reject_enqueue {
                return Err(TransferError::Rejected(message.clone()));
            }
            let id = TransferId(self.next_id.fetch_add(1, Ordering::SeqCst));
            state.enqueued.push((id, request));
            state.statuses.insert(id, TransferStatus::Pending);
            id
        };

        if let Some(status) = self.auto_complete {
            self.complete(id, status);
        }
        if let Some(delay) = self.enqueue_delay {
            tokio::time::sleep(delay).await;
        }

        Ok(id)
    }

    async fn query_status(&self, id: TransferId) -> Result<Option<TransferStatus>, TransferError> {
        let mut state = self.state();
        if let Some(message) = &state.fail_queries {
            return Err(TransferError::Unavailable(message.clone()));
        }
        if let Some(script) = state.scripted.get_mut(&id) {
            let next = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().copied()
            };
            if let Some(status) = next {
                state.statuses.insert(id, status);
            }
        }
        Ok(state.statuses.get(&id).copied())
    }

    fn register_completion_listener(
        &self,
        options: ListenerOptions,
    ) -> Result<CompletionSubscription, TransferError> {
        self.state().listener_options.push(options);
        Ok(CompletionSubscription::new(self.events.subscribe()))
    }
}
