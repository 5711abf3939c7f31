use super::errors::DownloadError;
use anyhow::Result;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Caller-supplied receiver of a download's terminal result.
pub trait ResultHandler: Send + Sync {
    /// Consume the success payload. An error is redirected to `on_failure`.
    fn on_success(&self, location: &str) -> Result<()>;

    fn on_failure(&self, error: &DownloadError);
}

/// One-shot handle resolving a single download.
///
/// Both terminal methods take `self`, so a sink can be resolved at most
/// once. A sink dropped without resolution resolves nothing.
pub struct ResultSink {
    handler: Box<dyn ResultHandler>,
}

impl std::fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSink").finish_non_exhaustive()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "result handler panicked".to_string()
    }
}

impl ResultSink {
    pub fn new(handler: impl ResultHandler + 'static) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    /// Sink backed by a oneshot channel; the returned handle awaits the outcome.
    pub fn channel() -> (Self, PendingDownload) {
        let (tx, rx) = oneshot::channel();
        let sink = Self::new(ChannelHandler {
            tx: Mutex::new(Some(tx)),
        });
        (sink, PendingDownload { rx })
    }

    /// Deliver the success payload.
    ///
    /// If the handler fails or panics, the failure path is invoked with its
    /// message instead and the redirected error is returned.
    pub fn succeed(self, location: &str) -> Result<(), DownloadError> {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.on_success(location)));
        let message = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => format!("{e:#}"),
            Err(payload) => panic_message(payload),
        };

        warn!("Success handler failed, reporting failure instead: {}", message);
        let error = DownloadError::Handler { message };
        self.deliver_failure(&error);
        Err(error)
    }

    pub fn fail(self, error: DownloadError) {
        self.deliver_failure(&error);
    }

    fn deliver_failure(&self, error: &DownloadError) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.handler.on_failure(error))) {
            error!("Failure handler panicked: {}", panic_message(payload));
        }
    }
}

type Outcome = std::result::Result<String, DownloadError>;

struct ChannelHandler {
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl ChannelHandler {
    fn send(&self, outcome: Outcome) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!("Download caller went away before the result arrived");
                }
            }
            None => debug!("Download result already delivered"),
        }
    }
}

impl ResultHandler for ChannelHandler {
    fn on_success(&self, location: &str) -> Result<()> {
        self.send(Ok(location.to_string()));
        Ok(())
    }

    fn on_failure(&self, error: &DownloadError) {
        self.send(Err(error.clone()));
    }
}

/// Caller-side half of [`ResultSink::channel`].
#[derive(Debug)]
pub struct PendingDownload {
    rx: oneshot::Receiver<Outcome>,
}

impl PendingDownload {
    /// Wait for the outcome; `None` if the sink was dropped unresolved.
    pub async fn wait(self) -> Option<Outcome> {
        self.rx.await.ok()
    }

    /// Outcome if one has arrived, without waiting.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        self.rx.try_recv().ok()
    }
}
