//! In-process queue with visibility-timeout and dead-letter semantics.
//!
//! Used by tests and by the worker in dev mode. Time is measured with
//! `tokio::time::Instant`, so tests can run under a paused clock.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use super::{JobQueue, MessageId, QueueError, QueueSettings, Receipt, ReceivedMessage};
use crate::lock;

/// A message moved out of the queue after too many deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub body: String,
    pub receive_count: u32,
}

#[derive(Debug)]
struct Entry {
    body: String,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<Receipt>,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<u64, Entry>,
    dead_letters: Vec<DeadLetter>,
    next_id: u64,
    next_receipt: u64,
}

#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    settings: QueueSettings,
    state: Mutex<State>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, settings: QueueSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    /// Messages still owned by the queue (visible or in flight).
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently in flight (delivered, not yet acknowledged, not yet visible again).
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        lock(&self.state)
            .entries
            .values()
            .filter(|e| e.receipt.is_some() && e.visible_at > now)
            .count()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.state).dead_letters.clone()
    }

    /// Deliver whatever is visible now. Returns the deliveries and, when there
    /// are none, the instant the next in-flight message becomes visible again.
    fn take_visible(&self, max: usize) -> (Vec<ReceivedMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let State {
            entries,
            dead_letters,
            next_receipt,
            ..
        } = &mut *state;

        let mut delivered = Vec::new();
        let mut exhausted = Vec::new();
        for (id, entry) in entries.iter_mut().filter(|(_, e)| e.visible_at <= now) {
            if delivered.len() >= max {
                break;
            }
            if entry.receive_count >= self.settings.max_receive_count {
                exhausted.push(*id);
                continue;
            }

            *next_receipt += 1;
            let receipt = Receipt::new(format!("{id}-{next_receipt}"));
            entry.receive_count += 1;
            entry.visible_at = now + self.settings.visibility_timeout;
            entry.receipt = Some(receipt.clone());

            delivered.push(ReceivedMessage {
                message_id: id.to_string(),
                body: entry.body.clone(),
                receipt,
                receive_count: entry.receive_count,
            });
        }

        for id in exhausted {
            if let Some(entry) = entries.remove(&id) {
                warn!(
                    queue = %self.name,
                    message_id = id,
                    receive_count = entry.receive_count,
                    "message moved to dead-letter queue"
                );
                dead_letters.push(DeadLetter {
                    message_id: id.to_string(),
                    body: entry.body,
                    receive_count: entry.receive_count,
                });
            }
        }

        let next_visible = entries.values().map(|e| e.visible_at).min();
        (delivered, next_visible)
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: String) -> Result<MessageId, QueueError> {
        let id = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            let id = state.next_id;
            state.entries.insert(
                id,
                Entry {
                    body,
                    receive_count: 0,
                    visible_at: Instant::now(),
                    receipt: None,
                },
            );
            id
        };
        self.notify.notify_waiters();
        Ok(id.to_string())
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            // Registered before inspecting state so a concurrent send is not missed.
            let notified = self.notify.notified();

            let (delivered, next_visible) = self.take_visible(max.max(1));
            if !delivered.is_empty() || Instant::now() >= deadline {
                return Ok(delivered);
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let mut state = lock(&self.state);
        let id = state
            .entries
            .iter()
            .find(|(_, e)| e.receipt.as_ref() == Some(receipt))
            .map(|(id, _)| *id);

        match id {
            Some(id) => {
                state.entries.remove(&id);
                Ok(())
            }
            None => Err(QueueError::StaleReceipt(receipt.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn settings(visibility_secs: u64, max_receive_count: u32) -> QueueSettings {
        QueueSettings {
            visibility_timeout: Duration::from_secs(visibility_secs),
            max_receive_count,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_message_is_hidden_until_acknowledged() {
        let queue = InMemoryQueue::new("q", settings(30, 3));
        queue.send("a".to_string()).await.unwrap();

        let batch = queue.receive(5, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "a");
        assert_eq!(batch[0].receive_count, 1);
        assert_eq!(queue.in_flight(), 1);

        assert!(queue.receive(5, Duration::ZERO).await.unwrap().is_empty());

        queue.acknowledge(&batch[0].receipt).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_message_is_redelivered_after_visibility_timeout() {
        let queue = InMemoryQueue::new("q", settings(30, 3));
        queue.send("a".to_string()).await.unwrap();

        let first = queue.receive(5, Duration::ZERO).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        let second = queue.receive(5, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(first[0].receipt, second[0].receipt);

        // The first delivery's receipt went stale on redelivery.
        assert!(matches!(
            queue.acknowledge(&first[0].receipt).await,
            Err(QueueError::StaleReceipt(_))
        ));
        queue.acknowledge(&second[0].receipt).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_waits_for_redelivery() {
        let queue = InMemoryQueue::new("q", settings(5, 3));
        queue.send("a".to_string()).await.unwrap();
        queue.receive(1, Duration::ZERO).await.unwrap();

        let batch = queue.receive(1, Duration::from_secs(20)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].receive_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_times_out_empty() {
        let queue = InMemoryQueue::new("q", settings(30, 3));
        let started = Instant::now();
        let batch = queue.receive(5, Duration::from_secs(20)).await.unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test]
    async fn long_poll_wakes_on_send() {
        let queue = Arc::new(InMemoryQueue::new("q", settings(30, 3)));
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(5, Duration::from_secs(20)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.send("late".to_string()).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_capped() {
        let queue = InMemoryQueue::new("q", settings(30, 3));
        for i in 0..7 {
            queue.send(format!("m{i}")).await.unwrap();
        }
        assert_eq!(queue.receive(5, Duration::ZERO).await.unwrap().len(), 5);
        assert_eq!(queue.receive(5, Duration::ZERO).await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_message_is_dead_lettered() {
        let queue = InMemoryQueue::new("q", settings(10, 2));
        queue.send("poison".to_string()).await.unwrap();

        for attempt in 1..=2 {
            let batch = queue.receive(1, Duration::ZERO).await.unwrap();
            assert_eq!(batch[0].receive_count, attempt);
            tokio::time::advance(Duration::from_secs(11)).await;
        }

        assert!(queue.receive(1, Duration::ZERO).await.unwrap().is_empty());
        assert!(queue.is_empty());

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, "poison");
        assert_eq!(dead[0].receive_count, 2);
    }
}
