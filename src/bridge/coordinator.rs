use super::{
    errors::{DownloadError, SubmissionError},
    registry::{CompletionRegistry, PendingRequest},
    request::DownloadRequest,
    sink::ResultSink,
};
use crate::config::{BridgeSettings, NonTerminalPolicy};
use crate::transfer::{
    CompletionSubscription, ListenerOptions, TransferError, TransferId, TransferService,
    TransferStatus,
};
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What handling one completion event amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// Not one of ours, or already resolved.
    Ignored,
    Succeeded,
    /// The success handler failed and the caller got a failure instead.
    HandlerFailed,
    Failed { reason: i32 },
    QueryFailed,
    /// Non-terminal status after the request was taken; the caller is never resolved.
    Lost { status: Option<TransferStatus> },
    Requeued { status: Option<TransferStatus> },
}

struct CoordinatorInner {
    service: Arc<dyn TransferService>,
    registry: CompletionRegistry,
    settings: BridgeSettings,
    // Held shared by submits across enqueue + insert; a notification takes it
    // exclusively before looking up its entry.
    submissions: RwLock<()>,
}

impl CoordinatorInner {
    async fn submit(
        &self,
        request: DownloadRequest,
        sink: ResultSink,
    ) -> Result<TransferId, SubmissionError> {
        let transfer = match request.to_transfer_request(&self.settings.downloads_dir) {
            Ok(transfer) => transfer,
            Err(e) => return Err(reject(e, sink)),
        };

        let _guard = self.submissions.read().await;
        let id = match self.service.enqueue(transfer).await {
            Ok(id) => id,
            Err(e) => return Err(reject(e.into(), sink)),
        };

        info!(
            "Enqueued {} as transfer {} via {}",
            request.url,
            id,
            self.service.name()
        );
        self.registry.insert(id, PendingRequest::new(request.path, sink));
        Ok(id)
    }

    async fn on_completion_notification(&self, id: TransferId) -> NotificationOutcome {
        let mut status = self.service.query_status(id).await;

        drop(self.submissions.write().await);
        let Some(mut pending) = self.registry.take_and_remove(id) else {
            debug!("Ignoring completion of transfer {} (not tracked)", id);
            return NotificationOutcome::Ignored;
        };

        loop {
            let current = match status {
                Ok(current) => current,
                Err(e) => {
                    warn!("Could not query status of transfer {}: {}", id, e);
                    pending.sink.fail(DownloadError::StatusQuery {
                        message: e.to_string(),
                    });
                    return NotificationOutcome::QueryFailed;
                }
            };

            match current {
                Some(TransferStatus::Successful) => {
                    info!(
                        "Transfer {} for {} completed",
                        id, pending.destination_path
                    );
                    return match pending.sink.succeed(&self.settings.downloads_dir) {
                        Ok(()) => NotificationOutcome::Succeeded,
                        Err(_) => NotificationOutcome::HandlerFailed,
                    };
                }
                Some(TransferStatus::Failed { reason }) => {
                    info!(
                        "Transfer {} for {} failed with reason {}",
                        id, pending.destination_path, reason
                    );
                    pending.sink.fail(DownloadError::Transfer { reason });
                    return NotificationOutcome::Failed { reason };
                }
                current => match self.settings.non_terminal {
                    NonTerminalPolicy::Drop => {
                        warn!(
                            "Transfer {} for {} reported {:?} after completion, caller will not be resolved",
                            id, pending.destination_path, current
                        );
                        return NotificationOutcome::Lost { status: current };
                    }
                    NonTerminalPolicy::Requeue => {
                        debug!(
                            "Transfer {} reported {:?}, waiting for a later completion",
                            id, current
                        );
                        self.registry.insert(id, pending);

                        // The final event may have arrived while the entry was
                        // out of the registry and found nothing to take.
                        let recheck = self.service.query_status(id).await;
                        if !matches!(recheck, Ok(Some(s)) if s.is_terminal()) {
                            return NotificationOutcome::Requeued { status: current };
                        }
                        let Some(retaken) = self.registry.take_and_remove(id) else {
                            // Another notification resolved it first.
                            return NotificationOutcome::Requeued { status: current };
                        };
                        debug!("Transfer {} finished while requeueing", id);
                        pending = retaken;
                        status = recheck;
                    }
                },
            }
        }
    }
}

fn reject(error: SubmissionError, sink: ResultSink) -> SubmissionError {
    warn!("Download request rejected: {}", error);
    sink.fail(DownloadError::from(&error));
    error
}

struct Listener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

async fn listen(
    inner: Arc<CoordinatorInner>,
    mut subscription: CompletionSubscription,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            next = subscription.next() => {
                let Some(id) = next else {
                    info!("Completion events ended");
                    break;
                };
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    inner.on_completion_notification(id).await;
                });
            }
        }
    }
    debug!("Completion listener stopped");
}

/// Sends download requests to a [`TransferService`] and resolves each
/// caller when the service announces its transfer finished.
pub struct DownloadCoordinator {
    inner: Arc<CoordinatorInner>,
    listener: Option<Listener>,
}

impl DownloadCoordinator {
    /// Create a coordinator and subscribe it to the service's completion events.
    pub fn start(
        service: Arc<dyn TransferService>,
        settings: BridgeSettings,
    ) -> Result<Self, TransferError> {
        let subscription = service.register_completion_listener(ListenerOptions {
            exported: settings.exported_listener,
        })?;
        let mut coordinator = Self::detached(service, settings);

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(listen(
            Arc::clone(&coordinator.inner),
            subscription,
            stop_rx,
        ));
        coordinator.listener = Some(Listener { stop, task });
        info!("Download coordinator started");
        Ok(coordinator)
    }

    /// Coordinator without a completion listener; events must be fed by hand.
    pub(crate) fn detached(service: Arc<dyn TransferService>, settings: BridgeSettings) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                service,
                registry: CompletionRegistry::new(),
                settings,
                submissions: RwLock::new(()),
            }),
            listener: None,
        }
    }

    /// Validate and enqueue a download; `sink` is resolved later.
    ///
    /// On error the sink has already been failed with the error's message
    /// and nothing was registered.
    pub async fn submit(
        &self,
        request: DownloadRequest,
        sink: ResultSink,
    ) -> Result<TransferId, SubmissionError> {
        self.inner.submit(request, sink).await
    }

    /// Handle one completion event from the transfer service.
    pub async fn on_completion_notification(&self, id: TransferId) -> NotificationOutcome {
        self.inner.on_completion_notification(id).await
    }

    pub fn registry(&self) -> &CompletionRegistry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.inner.settings
    }

    /// Stop listening for completion events and drop the subscription.
    pub async fn shutdown(mut self) {
        if let Some(listener) = self.listener.take() {
            let _ = listener.stop.send(());
            if let Err(e) = listener.task.await {
                warn!("Completion listener ended abnormally: {}", e);
            }
        }
        info!(
            "Download coordinator stopped with {} unresolved downloads",
            self.inner.registry.len()
        );
    }
}

impl Drop for DownloadCoordinator {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::sink::ResultHandler;
    use crate::transfer::{reason, MemoryTransferService};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counts {
        successes: AtomicUsize,
        failures: AtomicUsize,
    }

    struct Counting(Arc<Counts>);

    impl ResultHandler for Counting {
        fn on_success(&self, _location: &str) -> anyhow::Result<()> {
            self.0.successes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_failure(&self, _error: &DownloadError) {
            self.0.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Throwing;

    impl ResultHandler for Throwing {
        fn on_success(&self, _location: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("view already destroyed"))
        }

        fn on_failure(&self, _error: &DownloadError) {}
    }

    fn setup(policy: NonTerminalPolicy) -> (Arc<MemoryTransferService>, DownloadCoordinator) {
        let service = Arc::new(MemoryTransferService::new());
        let settings = BridgeSettings {
            non_terminal: policy,
            ..BridgeSettings::default()
        };
        let coordinator = DownloadCoordinator::detached(service.clone(), settings);
        (service, coordinator)
    }

    fn request() -> DownloadRequest {
        DownloadRequest::new("https://example.com/report.pdf", "reports/report.pdf")
    }

    #[tokio::test]
    async fn test_submit_registers_returned_id() {
        let (service, coordinator) = setup(NonTerminalPolicy::Drop);
        let (sink, _pending) = ResultSink::channel();

        let id = coordinator.submit(request(), sink).await.unwrap();

        let enqueued = service.enqueued();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].0, id);
        assert_eq!(coordinator.registry().ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_submit_forwards_headers() {
        let (service, coordinator) = setup(NonTerminalPolicy::Drop);
        let (sink, _pending) = ResultSink::channel();

        coordinator
            .submit(request().with_header("X-Test", "v1"), sink)
            .await
            .unwrap();

        let (_, transfer) = &service.enqueued()[0];
        assert_eq!(
            transfer.headers,
            vec![("X-Test".to_string(), "v1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_missing_url_is_rejected_without_registration() {
        let (service, coordinator) = setup(NonTerminalPolicy::Drop);
        let (sink, pending) = ResultSink::channel();

        let result = coordinator
            .submit(DownloadRequest::new("", "a.pdf"), sink)
            .await;

        assert!(matches!(result, Err(SubmissionError::MissingField("url"))));
        assert!(coordinator.registry().is_empty());
        assert!(service.enqueued().is_empty());
        assert_eq!(
            pending.wait().await,
            Some(Err(DownloadError::Submission {
                message: "missing required field `url`".to_string()
            }))
        );
    }

    #[tokio::test]
    async fn test_enqueue_failure_is_a_submission_error() {
        let (service, coordinator) = setup(NonTerminalPolicy::Drop);
        service.reject_enqueue("storage not mounted");
        let (sink, pending) = ResultSink::channel();

        let result = coordinator.submit(request(), sink).await;

        assert!(matches!(result, Err(SubmissionError::Enqueue(_))));
        assert!(coordinator.registry().is_empty());
        match pending.wait().await {
            Some(Err(DownloadError::Submission { message })) => {
                assert!(message.contains("storage not mounted"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_untracked_notification_is_ignored() {
        let (service, coordinator) = setup(NonTerminalPolicy::Drop);
        let counts = Arc::new(Counts::default());
        let id = coordinator
            .submit(request(), ResultSink::new(Counting(counts.clone())))
            .await
            .unwrap();
        service.set_status(TransferId(9000), TransferStatus::Successful);

        let outcome = coordinator
            .on_completion_notification(TransferId(9000))
            .await;

        assert_eq!(outcome, NotificationOutcome::Ignored);
        assert!(coordinator.registry().contains(id));
        assert_eq!(counts.successes.load(Ordering::SeqCst), 0);
        assert_eq!(counts.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_delivers_generic_location() {
        let (service, coordinator) = setup(NonTerminalPolicy::Drop);
        let (sink, pending) = ResultSink::channel();
        let id = coordinator.submit(request(), sink).await.unwrap();
        service.set_status(id, TransferStatus::Successful);

        let outcome = coordinator.on_completion_notification(id).await;

        assert_eq!(outcome, NotificationOutcome::Succeeded);
        assert!(coordinator.registry().is_empty());
        let location = pending.wait().await.unwrap().unwrap();
        assert_eq!(location, crate::config::DEFAULT_DOWNLOADS_DIR);
        assert_ne!(location, "reports/report.pdf");
    }

    #[tokio::test]
    async fn test_failure_delivers_reason_code() {
        let (service, coordinator) = setup(NonTerminalPolicy::Drop);
        let (sink, pending) = ResultSink::channel();
        let id = coordinator.submit(request(), sink).await.unwrap();
        service.set_status(
            id,
            TransferStatus::Failed {
                reason: reason::ERROR_FILE_ERROR,
            },
        );

        let outcome = coordinator.on_completion_notification(id).await;

        assert_eq!(
            outcome,
            NotificationOutcome::Failed {
                reason: reason::ERROR_FILE_ERROR
            }
        );
        let error = pending.wait().await.unwrap().unwrap_err();
        assert_eq!(
            error.payload(),
            serde_json::Value::from(reason::ERROR_FILE_ERROR)
        );
    }

    #[tokio::test]
    async fn test_throwing_success_handler_is_contained() {
        let (service, coordinator) = setup(NonTerminalPolicy::Drop);
        let first = coordinator
            .submit(request(), ResultSink::new(Throwing))
            .await
            .unwrap();
        let (sink, pending) = ResultSink::channel();
        let second = coordinator.submit(request(), sink).await.unwrap();
        service.set_status(first, TransferStatus::Successful);
        service.set_status(second, TransferStatus::Successful);

        assert_eq!(
            coordinator.on_completion_notification(first).await,
            NotificationOutcome::HandlerFailed
        );
        assert_eq!(
            coordinator.on_completion_notification(second).await,
            NotificationOutcome::Succeeded
        );
        assert!(pending.wait().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_non_terminal_status_loses_request() {
        for status in [
            Some(TransferStatus::Running),
            Some(TransferStatus::Pending),
            Some(TransferStatus::Paused),
            Some(TransferStatus::Unknown { code: 3 }),
            None,
        ] {
            let (service, coordinator) = setup(NonTerminalPolicy::Drop);
            let counts = Arc::new(Counts::default());
            let id = coordinator
                .submit(request(), ResultSink::new(Counting(counts.clone())))
                .await
                .unwrap();
            match status {
                Some(status) => service.set_status(id, status),
                None => service.clear_status(id),
            }

            let outcome = coordinator.on_completion_notification(id).await;

            assert_eq!(outcome, NotificationOutcome::Lost { status });
            assert!(!coordinator.registry().contains(id));
            assert_eq!(counts.successes.load(Ordering::SeqCst), 0);
            assert_eq!(counts.failures.load(Ordering::SeqCst), 0);

            // A later terminal event can no longer reach the caller.
            service.set_status(id, TransferStatus::Successful);
            assert_eq!(
                coordinator.on_completion_notification(id).await,
                NotificationOutcome::Ignored
            );
            assert_eq!(counts.successes.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_requeue_policy_waits_for_terminal_status() {
        let (service, coordinator) = setup(NonTerminalPolicy::Requeue);
        let (sink, mut pending) = ResultSink::channel();
        let id = coordinator.submit(request(), sink).await.unwrap();
        service.set_status(id, TransferStatus::Running);

        assert_eq!(
            coordinator.on_completion_notification(id).await,
            NotificationOutcome::Requeued {
                status: Some(TransferStatus::Running)
            }
        );
        assert!(coordinator.registry().contains(id));
        assert_eq!(pending.try_outcome(), None);

        service.set_status(id, TransferStatus::Successful);
        assert_eq!(
            coordinator.on_completion_notification(id).await,
            NotificationOutcome::Succeeded
        );
        assert!(coordinator.registry().is_empty());
        assert_eq!(pending.wait().await, Some(Ok("Download".to_string())));
    }

    #[tokio::test]
    async fn test_requeue_policy_keeps_request_without_status_record() {
        let (service, coordinator) = setup(NonTerminalPolicy::Requeue);
        let (sink, mut pending) = ResultSink::channel();
        let id = coordinator.submit(request(), sink).await.unwrap();
        service.clear_status(id);

        assert_eq!(
            coordinator.on_completion_notification(id).await,
            NotificationOutcome::Requeued { status: None }
        );
        assert!(coordinator.registry().contains(id));
        assert_eq!(pending.try_outcome(), None);

        service.set_status(id, TransferStatus::Successful);
        assert_eq!(
            coordinator.on_completion_notification(id).await,
            NotificationOutcome::Succeeded
        );
        assert_eq!(pending.wait().await, Some(Ok("Download".to_string())));
    }

    #[tokio::test]
    async fn test_requeue_picks_up_completion_that_landed_during_requeue() {
        let (service, coordinator) = setup(NonTerminalPolicy::Requeue);
        let (sink, pending) = ResultSink::channel();
        let id = coordinator.submit(request(), sink).await.unwrap();
        // First query sees the transfer still running; by the time the entry
        // is back in the registry it has finished, and its own event was
        // already spent on an empty registry.
        service.script_statuses(id, [TransferStatus::Running, TransferStatus::Successful]);

        assert_eq!(
            coordinator.on_completion_notification(id).await,
            NotificationOutcome::Succeeded
        );
        assert!(coordinator.registry().is_empty());
        assert_eq!(pending.wait().await, Some(Ok("Download".to_string())));
    }

    #[tokio::test]
    async fn test_requeue_recheck_delivers_failure_reason() {
        let (service, coordinator) = setup(NonTerminalPolicy::Requeue);
        let (sink, pending) = ResultSink::channel();
        let id = coordinator.submit(request(), sink).await.unwrap();
        service.script_statuses(
            id,
            [TransferStatus::Paused, TransferStatus::Failed { reason: 404 }],
        );

        assert_eq!(
            coordinator.on_completion_notification(id).await,
            NotificationOutcome::Failed { reason: 404 }
        );
        assert!(coordinator.registry().is_empty());
        assert_eq!(
            pending.wait().await,
            Some(Err(DownloadError::Transfer { reason: 404 }))
        );
    }

    #[tokio::test]
    async fn test_status_query_failure_fails_caller() {
        let (service, coordinator) = setup(NonTerminalPolicy::Drop);
        let (sink, pending) = ResultSink::channel();
        let id = coordinator.submit(request(), sink).await.unwrap();
        service.fail_queries("service restarting");

        assert_eq!(
            coordinator.on_completion_notification(id).await,
            NotificationOutcome::QueryFailed
        );
        assert!(coordinator.registry().is_empty());
        assert!(matches!(
            pending.wait().await,
            Some(Err(DownloadError::StatusQuery { .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_duplicate_notifications_resolve_once() {
        for _ in 0..50 {
            let (service, coordinator) = setup(NonTerminalPolicy::Drop);
            let coordinator = Arc::new(coordinator);
            let counts = Arc::new(Counts::default());
            let id = coordinator
                .submit(request(), ResultSink::new(Counting(counts.clone())))
                .await
                .unwrap();
            service.set_status(id, TransferStatus::Successful);

            let a = tokio::spawn({
                let coordinator = coordinator.clone();
                async move { coordinator.on_completion_notification(id).await }
            });
            let b = tokio::spawn({
                let coordinator = coordinator.clone();
                async move { coordinator.on_completion_notification(id).await }
            });
            let (a, b) = (a.await.unwrap(), b.await.unwrap());

            let resolved = [a, b]
                .iter()
                .filter(|o| **o == NotificationOutcome::Succeeded)
                .count();
            assert_eq!(resolved, 1);
            assert_eq!(counts.successes.load(Ordering::SeqCst), 1);
            assert_eq!(counts.failures.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_listener_resolves_from_broadcast() {
        let service = Arc::new(MemoryTransferService::new());
        let coordinator =
            DownloadCoordinator::start(service.clone(), BridgeSettings::default()).unwrap();
        let (sink, pending) = ResultSink::channel();
        let id = coordinator.submit(request(), sink).await.unwrap();

        // Someone else's download finishing first must not disturb ours.
        service.complete(TransferId(555), TransferStatus::Successful);
        service.complete(id, TransferStatus::Failed { reason: 404 });

        let outcome = tokio::time::timeout(Duration::from_secs(5), pending.wait())
            .await
            .unwrap();
        assert_eq!(outcome, Some(Err(DownloadError::Transfer { reason: 404 })));
        assert!(coordinator.registry().is_empty());
        coordinator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_completion_during_enqueue_is_not_orphaned() {
        // The service announces completion and only then returns the id, so
        // the listener handles the event while the submit is still in flight.
        let service = Arc::new(
            MemoryTransferService::with_auto_complete(TransferStatus::Successful)
                .with_enqueue_delay(Duration::from_millis(50)),
        );
        let coordinator =
            DownloadCoordinator::start(service.clone(), BridgeSettings::default()).unwrap();
        let (sink, pending) = ResultSink::channel();

        coordinator.submit(request(), sink).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), pending.wait())
            .await
            .expect("completion announced during enqueue was never delivered");
        assert_eq!(outcome, Some(Ok("Download".to_string())));
        assert!(coordinator.registry().is_empty());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_and_shutdown_manage_subscription() {
        let service = Arc::new(MemoryTransferService::new());
        let settings = BridgeSettings {
            exported_listener: false,
            ..BridgeSettings::default()
        };

        let coordinator = DownloadCoordinator::start(service.clone(), settings).unwrap();
        assert_eq!(service.listener_count(), 1);
        assert_eq!(
            service.listener_options(),
            vec![ListenerOptions { exported: false }]
        );

        coordinator.shutdown().await;
        assert_eq!(service.listener_count(), 0);
    }
}
