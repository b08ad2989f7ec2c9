//! Per-task progress fan-out
//!
//! Subscribers register a bounded channel for one task id. Delivery is
//! fire-and-forget: a subscriber whose channel is closed or full is dropped
//! from the registry on the next publish. Dropping a [`Subscription`]
//! unsubscribes it.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::events::ProgressEvent;

/// Channel capacity per subscriber
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ProgressEvent>,
}

type Registry = DashMap<Uuid, Vec<Subscriber>>;

/// Registry of subscriber channels keyed by task id
#[derive(Clone, Default)]
pub struct ProgressBroadcaster {
    subscribers: Arc<Registry>,
    next_id: Arc<AtomicU64>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber for `task_id`.
    pub fn subscribe(&self, task_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.entry(task_id).or_default().push(Subscriber { id, tx });
        debug!(%task_id, subscriber = id, "Subscriber registered");
        Subscription {
            task_id,
            id,
            rx,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Remove one subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, task_id: Uuid, subscriber_id: u64) -> bool {
        remove_subscriber(&self.subscribers, task_id, subscriber_id)
    }

    /// Push `event` to every subscriber of its task, pruning dead ones.
    pub fn publish(&self, event: ProgressEvent) {
        let task_id = event.task_id();
        let Some(mut entry) = self.subscribers.get_mut(&task_id) else {
            return;
        };
        let before = entry.len();
        entry.retain(|s| s.tx.try_send(event.clone()).is_ok());
        let delivered = entry.len();
        let empty = entry.is_empty();
        drop(entry);

        if before != delivered {
            debug!(%task_id, pruned = before - delivered, "Pruned unreachable subscribers");
        }
        debug!(
            %task_id,
            "Emitting {} event to {} subscribers",
            event.event_name(),
            delivered
        );
        if empty {
            self.subscribers.remove_if(&task_id, |_, subs| subs.is_empty());
        }
    }

    /// Drop every subscriber of a task so their streams end.
    pub fn close(&self, task_id: Uuid) {
        if let Some((_, subs)) = self.subscribers.remove(&task_id) {
            debug!(%task_id, "Closed {} subscriber channels", subs.len());
        }
    }

    pub fn subscriber_count(&self, task_id: Uuid) -> usize {
        self.subscribers.get(&task_id).map(|s| s.len()).unwrap_or(0)
    }
}

fn remove_subscriber(registry: &Registry, task_id: Uuid, subscriber_id: u64) -> bool {
    let removed = match registry.get_mut(&task_id) {
        Some(mut subs) => {
            let before = subs.len();
            subs.retain(|s| s.id != subscriber_id);
            before != subs.len()
        }
        None => false,
    };
    registry.remove_if(&task_id, |_, subs| subs.is_empty());
    removed
}

/// Receiving side of one subscription. Unsubscribes on drop.
pub struct Subscription {
    task_id: Uuid,
    id: u64,
    rx: mpsc::Receiver<ProgressEvent>,
    registry: std::sync::Weak<Registry>,
}

impl Subscription {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the task's channels are closed.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            remove_subscriber(&registry, self.task_id, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ParserTask, TaskType};

    fn event_for(task: &ParserTask) -> ProgressEvent {
        ProgressEvent::progress(&task.snapshot())
    }

    #[tokio::test]
    async fn publishes_only_to_task_subscribers() {
        let broadcaster = ProgressBroadcaster::new();
        let a = ParserTask::new(TaskType::Parse, vec!["a".into()]);
        let b = ParserTask::new(TaskType::Parse, vec!["b".into()]);
        let mut sub_a = broadcaster.subscribe(a.id());
        let mut sub_b = broadcaster.subscribe(b.id());

        broadcaster.publish(event_for(&a));
        assert_eq!(sub_a.recv().await.unwrap().task_id(), a.id());
        assert!(sub_b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let broadcaster = ProgressBroadcaster::new();
        let task = ParserTask::new(TaskType::Parse, vec!["a".into()]);
        let sub = broadcaster.subscribe(task.id());
        let _other = broadcaster.subscribe(task.id());
        assert_eq!(broadcaster.subscriber_count(task.id()), 2);
        drop(sub);
        assert_eq!(broadcaster.subscriber_count(task.id()), 1);
    }

    #[tokio::test]
    async fn explicit_unsubscribe() {
        let broadcaster = ProgressBroadcaster::new();
        let task = ParserTask::new(TaskType::Parse, vec!["a".into()]);
        let sub = broadcaster.subscribe(task.id());
        assert!(broadcaster.unsubscribe(task.id(), sub.id()));
        assert!(!broadcaster.unsubscribe(task.id(), sub.id()));
        assert_eq!(broadcaster.subscriber_count(task.id()), 0);
    }

    #[tokio::test]
    async fn full_subscriber_is_pruned() {
        let broadcaster = ProgressBroadcaster::new();
        let task = ParserTask::new(TaskType::Parse, vec!["a".into()]);
        let _slow = broadcaster.subscribe(task.id());
        for _ in 0..SUBSCRIBER_CHANNEL_CAPACITY {
            broadcaster.publish(event_for(&task));
        }
        assert_eq!(broadcaster.subscriber_count(task.id()), 1);
        broadcaster.publish(event_for(&task));
        assert_eq!(broadcaster.subscriber_count(task.id()), 0);
    }

    #[tokio::test]
    async fn close_ends_stream() {
        use futures::StreamExt;

        let broadcaster = ProgressBroadcaster::new();
        let task = ParserTask::new(TaskType::Parse, vec!["a".into()]);
        let mut sub = broadcaster.subscribe(task.id());
        broadcaster.publish(event_for(&task));
        broadcaster.close(task.id());
        assert!(sub.next().await.is_some());
        assert!(sub.next().await.is_none());
    }
}
