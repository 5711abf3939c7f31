use super::{
    service::{CompletionSubscription, TransferError, TransferService},
    types::{reason, ListenerOptions, TransferId, TransferRequest, TransferStatus},
};
use crate::utils::resolve_destination;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, Mutex, PoisonError,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// How many finished transfers keep their status by default.
pub const DEFAULT_FINISHED_RETENTION: usize = 1024;

/// Transfer statuses, keeping only the most recent finished ones.
///
/// Transfers still in flight are never evicted.
struct StatusTable {
    statuses: HashMap<TransferId, TransferStatus>,
    finished: VecDeque<TransferId>,
    retain: usize,
}

impl StatusTable {
    fn new(retain: usize) -> Self {
        Self {
            statuses: HashMap::new(),
            finished: VecDeque::new(),
            retain,
        }
    }

    fn set(&mut self, id: TransferId, status: TransferStatus) {
        let was_terminal = self
            .statuses
            .get(&id)
            .is_some_and(TransferStatus::is_terminal);
        self.statuses.insert(id, status);
        if status.is_terminal() && !was_terminal {
            self.finished.push_back(id);
        }
        while self.finished.len() > self.retain {
            if let Some(oldest) = self.finished.pop_front() {
                self.statuses.remove(&oldest);
                debug!("Forgot status of transfer {}", oldest);
            }
        }
    }

    fn get(&self, id: TransferId) -> Option<TransferStatus> {
        self.statuses.get(&id).copied()
    }

    fn len(&self) -> usize {
        self.statuses.len()
    }
}

type SharedStatuses = Arc<Mutex<StatusTable>>;

/// Transfer service for desktop hosts: fetches over HTTP with `reqwest` and
/// writes the body under a download root.
///
/// Network-class, roaming and notification settings have no meaning here
/// and are accepted as-is.
pub struct HttpTransferService {
    client: reqwest::Client,
    root: PathBuf,
    next_id: AtomicI64,
    statuses: SharedStatuses,
    events: broadcast::Sender<TransferId>,
}

impl HttpTransferService {
    pub fn new(root: impl Into<PathBuf>, event_capacity: usize) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| TransferError::Unavailable(format!("failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(root, event_capacity, client))
    }

    pub fn with_client(
        root: impl Into<PathBuf>,
        event_capacity: usize,
        client: reqwest::Client,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            client,
            root: root.into(),
            next_id: AtomicI64::new(1),
            statuses: Arc::new(Mutex::new(StatusTable::new(
                DEFAULT_FINISHED_RETENTION,
            ))),
            events,
        }
    }

    /// Keep the status of at most `retain` finished transfers; older ones
    /// are answered with no record.
    pub fn with_finished_retention(self, retain: usize) -> Self {
        *self
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = StatusTable::new(retain);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tracked_statuses(&self) -> usize {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn set_status(statuses: &SharedStatuses, id: TransferId, status: TransferStatus) {
    statuses
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .set(id, status);
}

fn partial_path(target: &Path, id: TransferId) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{id}.part"));
    target.with_file_name(name)
}

async fn fetch_to_file(
    client: &reqwest::Client,
    request: &TransferRequest,
    target: &Path,
    id: TransferId,
) -> Result<u64, i32> {
    let mut builder = client.get(request.url.clone());
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder.send().await.map_err(|e| {
        warn!("Request to {} failed: {}", request.url, e);
        reason::ERROR_HTTP_DATA_ERROR
    })?;

    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        warn!("{} answered HTTP {}", request.url, status);
        return Err(i32::from(status.as_u16()));
    }
    if !status.is_success() {
        warn!("{} answered unhandled HTTP {}", request.url, status);
        return Err(reason::ERROR_UNHANDLED_HTTP_CODE);
    }

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            error!("Failed to create {}: {}", parent.display(), e);
            reason::ERROR_FILE_ERROR
        })?;
    }

    // The body lands next to the target and only replaces it once complete.
    let partial = partial_path(target, id);
    let written = match stream_body(response, &partial).await {
        Ok(written) => written,
        Err(reason) => {
            discard(&partial).await;
            return Err(reason);
        }
    };
    if let Err(e) = tokio::fs::rename(&partial, target).await {
        error!("Failed to move {} into place: {}", target.display(), e);
        discard(&partial).await;
        return Err(reason::ERROR_FILE_ERROR);
    }

    Ok(written)
}

async fn stream_body(mut response: reqwest::Response, partial: &Path) -> Result<u64, i32> {
    let url = response.url().clone();
    let mut file = tokio::fs::File::create(partial).await.map_err(|e| {
        error!("Failed to create {}: {}", partial.display(), e);
        reason::ERROR_FILE_ERROR
    })?;

    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await.map_err(|e| {
        warn!("Failed to read body from {}: {}", url, e);
        reason::ERROR_HTTP_DATA_ERROR
    })? {
        file.write_all(&chunk).await.map_err(|e| {
            error!("Failed to write {}: {}", partial.display(), e);
            reason::ERROR_FILE_ERROR
        })?;
        written += chunk.len() as u64;
    }

    file.flush().await.map_err(|e| {
        error!("Failed to flush {}: {}", partial.display(), e);
        reason::ERROR_FILE_ERROR
    })?;
    Ok(written)
}

async fn discard(partial: &Path) {
    if let Err(e) = tokio::fs::remove_file(partial).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", partial.display(), e);
        }
    }
}

#[async_trait]
impl TransferService for HttpTransferService {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn enqueue(&self, request: TransferRequest) -> Result<TransferId, TransferError> {
        let relative = request
            .destination
            .as_ref()
            .map(|d| d.relative_path.as_str())
            .ok_or_else(|| TransferError::Rejected("no destination set".to_string()))?;
        let target = resolve_destination(&self.root, relative).ok_or_else(|| {
            TransferError::Rejected(format!("destination '{relative}' escapes the download root"))
        })?;

        let id = TransferId(self.next_id.fetch_add(1, Ordering::SeqCst));
        set_status(&self.statuses, id, TransferStatus::Pending);
        debug!(
            "Transfer {} queued: {} -> {} ({:?}, roaming: {})",
            id,
            request.url,
            target.display(),
            request.network_types,
            request.allow_roaming
        );

        let client = self.client.clone();
        let statuses = Arc::clone(&self.statuses);
        let events = self.events.clone();
        tokio::spawn(async move {
            set_status(&statuses, id, TransferStatus::Running);

            let status = match fetch_to_file(&client, &request, &target, id).await {
                Ok(bytes) => {
                    info!("Transfer {} finished, {} bytes at {}", id, bytes, target.display());
                    TransferStatus::Successful
                }
                Err(reason) => TransferStatus::Failed { reason },
            };
            set_status(&statuses, id, status);

            if events.send(id).is_err() {
                debug!("No completion listeners for transfer {}", id);
            }
        });

        Ok(id)
    }

    async fn query_status(&self, id: TransferId) -> Result<Option<TransferStatus>, TransferError> {
        Ok(self
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id))
    }

    fn register_completion_listener(
        &self,
        options: ListenerOptions,
    ) -> Result<CompletionSubscription, TransferError> {
        debug!(
            "Completion listener registered (exported: {})",
            options.exported
        );
        Ok(CompletionSubscription::new(self.events.subscribe()))
    }
}
