//! Per-link operation scheduler
//!
//! The radio stack silently drops a second operation issued on a link while
//! one is outstanding. Every primitive against an established link therefore
//! goes through the link's [`OperationScheduler`], which runs them one at a
//! time in FIFO order on a dedicated task.

use crate::adapter::{LinkAdapter, LinkHandle};
use crate::error::{TransportError, TransportResult};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A link primitive to run through the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Write(Vec<u8>),
    Read,
    EnableNotifications,
    NegotiateUnitSize(u32),
    DiscoverCapabilities,
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Write(_) => "write",
            Operation::Read => "read",
            Operation::EnableNotifications => "enable-notifications",
            Operation::NegotiateUnitSize(_) => "negotiate-unit-size",
            Operation::DiscoverCapabilities => "discover-capabilities",
        }
    }
}

/// Result of a completed operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    Written,
    Data(Vec<u8>),
    NotificationsEnabled,
    UnitSize(u32),
    CapabilitiesDiscovered,
}

struct QueueEntry {
    id: Uuid,
    operation: Operation,
    enqueued_at: Instant,
    completion: oneshot::Sender<TransportResult<OperationOutput>>,
}

/// Serializes link operations for a single link
pub struct OperationScheduler {
    link: LinkHandle,
    queue: mpsc::UnboundedSender<QueueEntry>,
    cancel: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl OperationScheduler {
    /// Create a scheduler for `link` and start its worker task
    pub fn new(link: LinkHandle, adapter: Arc<dyn LinkAdapter>, op_timeout: Duration) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_queue(
            link.clone(),
            adapter,
            rx,
            cancel.clone(),
            op_timeout,
            Arc::clone(&pending),
        ));

        debug!("Operation scheduler started for link {}", link.id);

        Self {
            link,
            queue,
            cancel,
            pending,
        }
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    /// Queue an operation
    ///
    /// The position in the queue is fixed when this is called; the returned
    /// future resolves once the operation has run, failed, timed out or been
    /// cancelled.
    pub fn enqueue(
        &self,
        operation: Operation,
    ) -> impl Future<Output = TransportResult<OperationOutput>> + Send + 'static {
        let (completion, done) = oneshot::channel();
        let entry = QueueEntry {
            id: Uuid::new_v4(),
            operation,
            enqueued_at: Instant::now(),
            completion,
        };

        if !self.cancel.is_cancelled() {
            self.pending.fetch_add(1, Ordering::SeqCst);
            if self.queue.send(entry).is_err() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }

        // A dropped completion sender means the entry never ran
        async move { done.await.unwrap_or(Err(TransportError::Cancelled)) }
    }

    /// Queued plus in-flight operations
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the in-flight operation and every queued one
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!(
                "Shutting down operation scheduler for link {} ({} pending)",
                self.link.id,
                self.pending()
            );
            self.cancel.cancel();
        }
    }
}

async fn run_queue(
    link: LinkHandle,
    adapter: Arc<dyn LinkAdapter>,
    mut rx: mpsc::UnboundedReceiver<QueueEntry>,
    cancel: CancellationToken,
    op_timeout: Duration,
    pending: Arc<AtomicUsize>,
) {
    loop {
        let entry = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            entry = rx.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };

        let QueueEntry {
            id,
            operation,
            enqueued_at,
            completion,
        } = entry;
        let kind = operation.kind();

        debug!(
            "Link {} running {} operation {} (queued {:?})",
            link.id,
            kind,
            id,
            enqueued_at.elapsed()
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            outcome = tokio::time::timeout(op_timeout, execute(adapter.as_ref(), &link, operation)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::OperationTimeout {
                        kind,
                        after: op_timeout,
                    }),
                }
            }
        };

        if let Err(e) = &result {
            warn!("Link {} {} operation {} failed: {}", link.id, kind, id, e);
        }

        pending.fetch_sub(1, Ordering::SeqCst);
        // The caller may have stopped waiting
        let _ = completion.send(result);
    }

    rx.close();
    let mut cancelled = 0usize;
    while let Ok(entry) = rx.try_recv() {
        pending.fetch_sub(1, Ordering::SeqCst);
        let _ = entry.completion.send(Err(TransportError::Cancelled));
        cancelled += 1;
    }

    debug!(
        "Operation scheduler for link {} stopped ({} queued operations cancelled)",
        link.id, cancelled
    );
}

async fn execute(
    adapter: &dyn LinkAdapter,
    link: &LinkHandle,
    operation: Operation,
) -> TransportResult<OperationOutput> {
    match operation {
        Operation::Write(frame) => adapter
            .write_frame(link, &frame)
            .await
            .map(|_| OperationOutput::Written),
        Operation::Read => adapter.read(link).await.map(OperationOutput::Data),
        Operation::EnableNotifications => adapter
            .enable_notifications(link)
            .await
            .map(|_| OperationOutput::NotificationsEnabled),
        Operation::NegotiateUnitSize(requested) => adapter
            .negotiate_unit_size(link, requested)
            .await
            .map(OperationOutput::UnitSize),
        Operation::DiscoverCapabilities => adapter
            .discover_capabilities(link)
            .await
            .map(|_| OperationOutput::CapabilitiesDiscovered),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;
    use crate::testing::MockLinkAdapter;

    fn link() -> LinkHandle {
        LinkHandle::new(PeerId::from("AA:BB:CC:DD:EE:01"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_never_overlap() {
        let adapter = Arc::new(MockLinkAdapter::new().with_write_delay(Duration::from_millis(20)));
        let scheduler = OperationScheduler::new(link(), adapter.clone(), Duration::from_secs(5));

        let first = scheduler.enqueue(Operation::Write(vec![1]));
        let second = scheduler.enqueue(Operation::Write(vec![2]));
        let (a, b) = tokio::join!(first, second);

        assert_eq!(a.unwrap(), OperationOutput::Written);
        assert_eq!(b.unwrap(), OperationOutput::Written);
        assert_eq!(adapter.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_completion_order() {
        let adapter = Arc::new(MockLinkAdapter::new().with_write_delay(Duration::from_millis(5)));
        let scheduler = OperationScheduler::new(link(), adapter.clone(), Duration::from_secs(5));

        let futures: Vec<_> = (0..20u8)
            .map(|i| scheduler.enqueue(Operation::Write(vec![i])))
            .collect();
        for pending in futures {
            assert!(pending.await.is_ok());
        }

        let written: Vec<u8> = adapter.written_frames().into_iter().map(|f| f[0]).collect();
        assert_eq!(written, (0..20u8).collect::<Vec<_>>());
        assert_eq!(adapter.max_in_flight(), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_and_next_runs() {
        let adapter = Arc::new(MockLinkAdapter::new().with_write_delay(Duration::from_secs(10)));
        let scheduler = OperationScheduler::new(link(), adapter.clone(), Duration::from_secs(5));

        let slow = scheduler.enqueue(Operation::Write(vec![1]));
        let negotiate = scheduler.enqueue(Operation::NegotiateUnitSize(185));

        let result = slow.await;
        assert!(matches!(
            result,
            Err(TransportError::OperationTimeout { kind: "write", .. })
        ));
        assert_eq!(negotiate.await.unwrap(), OperationOutput::UnitSize(185));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending() {
        let adapter = Arc::new(MockLinkAdapter::new().with_write_delay(Duration::from_secs(1)));
        let scheduler = OperationScheduler::new(link(), adapter.clone(), Duration::from_secs(5));

        let futures: Vec<_> = (0..5u8)
            .map(|i| scheduler.enqueue(Operation::Write(vec![i])))
            .collect();
        tokio::task::yield_now().await;

        scheduler.shutdown();
        scheduler.shutdown();

        for pending in futures {
            assert!(matches!(pending.await, Err(TransportError::Cancelled)));
        }
        assert!(scheduler.is_shut_down());
        assert!(matches!(
            scheduler.enqueue(Operation::Read).await,
            Err(TransportError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_all_operation_kinds() {
        let adapter = Arc::new(MockLinkAdapter::new());
        let scheduler = OperationScheduler::new(link(), adapter, Duration::from_secs(5));

        assert_eq!(
            scheduler.enqueue(Operation::DiscoverCapabilities).await.unwrap(),
            OperationOutput::CapabilitiesDiscovered
        );
        assert_eq!(
            scheduler.enqueue(Operation::EnableNotifications).await.unwrap(),
            OperationOutput::NotificationsEnabled
        );
        assert!(matches!(
            scheduler.enqueue(Operation::Read).await,
            Err(TransportError::OperationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_write_failure_surfaces() {
        let adapter = Arc::new(MockLinkAdapter::new().with_failing_write(1));
        let scheduler = OperationScheduler::new(link(), adapter, Duration::from_secs(5));

        assert!(scheduler.enqueue(Operation::Write(vec![0])).await.is_ok());
        assert!(matches!(
            scheduler.enqueue(Operation::Write(vec![1])).await,
            Err(TransportError::OperationFailed(_))
        ));
        assert!(scheduler.enqueue(Operation::Write(vec![2])).await.is_ok());
    }
}
