use super::types::{ListenerOptions, TransferId, TransferRequest, TransferStatus};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer service rejected the request: {0}")]
    Rejected(String),

    #[error("transfer service unavailable: {0}")]
    Unavailable(String),

    #[error("transfer service I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The download service that actually moves bytes.
///
/// Completion events are multiplexed for every transfer the service runs,
/// not just the ones a given subscriber enqueued.
#[async_trait]
pub trait TransferService: Send + Sync {
    /// Human-readable name of the service
    fn name(&self) -> &'static str;

    /// Queue a transfer and return immediately with its identifier
    async fn enqueue(&self, request: TransferRequest) -> Result<TransferId, TransferError>;

    /// Current status of a transfer, `None` when the service has no record of it
    async fn query_status(&self, id: TransferId) -> Result<Option<TransferStatus>, TransferError>;

    /// Subscribe to completion events; dropping the subscription deregisters it
    fn register_completion_listener(
        &self,
        options: ListenerOptions,
    ) -> Result<CompletionSubscription, TransferError>;
}

/// Stream of completed transfer identifiers.
pub struct CompletionSubscription {
    rx: broadcast::Receiver<TransferId>,
}

impl CompletionSubscription {
    pub fn new(rx: broadcast::Receiver<TransferId>) -> Self {
        Self { rx }
    }

    /// Next completed identifier, or `None` once the service stops publishing.
    pub async fn next(&mut self) -> Option<TransferId> {
        loop {
            match self.rx.recv().await {
                Ok(id) => return Some(id),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Completion listener lagged, {} notifications dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
