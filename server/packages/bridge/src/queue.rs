use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::warn;

use coderelay_protocol::PromptMessage;

/// Oldest messages are dropped once the buffer exceeds this.
const MAX_QUEUE_SIZE: usize = 100;

/// Async FIFO feeding user messages into a running turn.
///
/// At most one consumer waits at a time (the agent driver pulling its next
/// prompt). Producers never block: on overflow the oldest buffered message is
/// dropped, and pushes after [`MessageQueue::end`] are discarded.
pub struct MessageQueue {
    state: Mutex<QueueState>,
}

struct QueueState {
    buffer: VecDeque<PromptMessage>,
    waiting: Option<oneshot::Sender<Option<PromptMessage>>>,
    ended: bool,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                buffer: VecDeque::new(),
                waiting: None,
                ended: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueues a message, handing it straight to a parked consumer if one is
    /// waiting.
    pub fn push(&self, message: PromptMessage) {
        let mut state = self.lock();
        if state.ended {
            return;
        }
        if let Some(tx) = state.waiting.take() {
            if let Err(message) = tx.send(Some(message)) {
                // Consumer went away between registering and receiving.
                if let Some(message) = message {
                    state.buffer.push_back(message);
                }
            }
            return;
        }
        state.buffer.push_back(message);
        if state.buffer.len() > MAX_QUEUE_SIZE {
            warn!(limit = MAX_QUEUE_SIZE, "message queue overflow, dropping oldest");
            state.buffer.pop_front();
        }
    }

    /// Marks the queue finished. A parked consumer is released with `None`,
    /// and later `next` calls return `None` once the buffer drains.
    pub fn end(&self) {
        let mut state = self.lock();
        state.ended = true;
        if let Some(tx) = state.waiting.take() {
            let _ = tx.send(None);
        }
    }

    pub fn is_ended(&self) -> bool {
        self.lock().ended
    }

    /// Pulls the next message, waiting if the buffer is empty. Returns `None`
    /// once the queue has ended and drained.
    pub async fn next(&self) -> Option<PromptMessage> {
        let rx = {
            let mut state = self.lock();
            if let Some(message) = state.buffer.pop_front() {
                return Some(message);
            }
            if state.ended {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            if state.waiting.replace(tx).is_some() {
                warn!("message queue consumer replaced while waiting");
            }
            rx
        };
        rx.await.unwrap_or(None)
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn msg(text: &str) -> PromptMessage {
        PromptMessage::from_user_input(text, &[])
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let queue = MessageQueue::new();
        queue.push(msg("a"));
        queue.push(msg("b"));
        queue.push(msg("c"));
        assert_eq!(queue.next().await.unwrap().text(), "a");
        assert_eq!(queue.next().await.unwrap().text(), "b");
        assert_eq!(queue.next().await.unwrap().text(), "c");
    }

    #[tokio::test]
    async fn wakes_parked_consumer() {
        let queue = Arc::new(MessageQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(msg("hello"));
        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got.text(), "hello");
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let queue = MessageQueue::new();
        for i in 0..=MAX_QUEUE_SIZE {
            queue.push(msg(&format!("m{i}")));
        }
        assert_eq!(queue.next().await.unwrap().text(), "m1");
    }

    #[tokio::test]
    async fn end_releases_waiter_and_drains() {
        let queue = Arc::new(MessageQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.end();
        assert!(consumer.await.unwrap().is_none());

        let queue = MessageQueue::new();
        queue.push(msg("last"));
        queue.end();
        queue.push(msg("ignored"));
        assert_eq!(queue.next().await.unwrap().text(), "last");
        assert!(queue.next().await.is_none());
    }
}
