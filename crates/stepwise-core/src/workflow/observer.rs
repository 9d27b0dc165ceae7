//! Per-run observer channel.
//!
//! Built on `tokio::sync::broadcast`: every `WorkflowInstance` owns one
//! `RunObserver`, so events never leak across runs. Publishing with no
//! active subscribers is a no-op.

use futures_util::Stream;
use stepwise_types::event::WorkflowRunEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Multi-consumer channel for a single run's events.
///
/// Cloning the observer clones the sender.
#[derive(Clone)]
pub struct RunObserver {
    sender: broadcast::Sender<WorkflowRunEvent>,
}

impl RunObserver {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowRunEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: WorkflowRunEvent) {
        let _ = self.sender.send(event);
    }

    /// Whether anyone is listening; lets callers skip building snapshots.
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl std::fmt::Debug for RunObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunObserver")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Adapt a receiver into a stream that ends after the next `RunSettled`
/// event (or when the channel closes).
///
/// Lagged receivers skip the dropped events and keep going.
pub fn event_stream(
    mut receiver: broadcast::Receiver<WorkflowRunEvent>,
) -> impl Stream<Item = WorkflowRunEvent> + Send + 'static {
    async_stream::stream! {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let settled = matches!(event, WorkflowRunEvent::RunSettled { .. });
                    yield event;
                    if settled {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "run observer lagged; events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::collections::BTreeMap;
    use stepwise_types::workflow::RunResolution;
    use uuid::Uuid;

    fn started(run_id: Uuid) -> WorkflowRunEvent {
        WorkflowRunEvent::RunStarted {
            run_id,
            workflow_name: "wf".into(),
            resumed: false,
        }
    }

    fn settled(run_id: Uuid) -> WorkflowRunEvent {
        WorkflowRunEvent::RunSettled {
            resolution: RunResolution {
                run_id,
                results: BTreeMap::new(),
                active_paths: BTreeMap::new(),
                timestamp: 0,
            },
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let observer = RunObserver::new(4);
        assert!(!observer.has_subscribers());
        observer.publish(started(Uuid::now_v7()));
    }

    #[tokio::test]
    async fn stream_ends_after_settle() {
        let observer = RunObserver::new(8);
        let run_id = Uuid::now_v7();
        let stream = event_stream(observer.subscribe());

        observer.publish(started(run_id));
        observer.publish(settled(run_id));
        observer.publish(started(run_id));

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], WorkflowRunEvent::RunSettled { .. }));
    }

    #[tokio::test]
    async fn stream_ends_when_channel_closes() {
        let observer = RunObserver::new(8);
        let stream = event_stream(observer.subscribe());
        observer.publish(started(Uuid::now_v7()));
        drop(observer);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);
    }
}
