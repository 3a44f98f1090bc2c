//! Bounded drop-oldest message buffer
//!
//! Holds undelivered messages in arrival order plus a separate slot with the
//! most recently received message. Every operation takes the single lock
//! once, does O(1) work and releases it; decoding and I/O never happen here.

use crate::transport::Message;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug)]
struct BufferState {
    queue: VecDeque<Arc<Message>>,
    latest: Option<Arc<Message>>,
    capacity: usize,
}

/// Capacity-limited FIFO queue with a "latest message" slot
///
/// A capacity of zero retains nothing in the queue: pushes only update the
/// latest slot, so streaming reads always find the queue empty.
#[derive(Debug)]
pub struct MessageBuffer {
    state: Mutex<BufferState>,
}

impl MessageBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                queue: VecDeque::with_capacity(capacity),
                latest: None,
                capacity,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        // Every critical section leaves the state consistent, so a panic in
        // another holder cannot have left it half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `message`, evicting the oldest entry first when full.
    /// Returns the evicted message, if any.
    pub fn push(&self, message: Message) -> Option<Arc<Message>> {
        let message = Arc::new(message);
        let mut state = self.state();
        state.latest = Some(Arc::clone(&message));

        if state.capacity == 0 {
            return None;
        }

        let evicted = if state.queue.len() >= state.capacity {
            state.queue.pop_front()
        } else {
            None
        };
        state.queue.push_back(message);
        debug!(
            queue_len = state.queue.len(),
            capacity = state.capacity,
            evicted = evicted.is_some(),
            "Buffered message"
        );
        evicted
    }

    /// Remove and return the oldest queued message.
    pub fn pop(&self) -> Option<Arc<Message>> {
        self.state().queue.pop_front()
    }

    /// Most recently pushed message; unaffected by `pop`.
    pub fn peek_latest(&self) -> Option<Arc<Message>> {
        self.state().latest.clone()
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.state().capacity
    }

    /// Change the capacity, dropping the oldest entries that no longer fit.
    /// Returns how many messages were dropped.
    pub fn set_capacity(&self, capacity: usize) -> usize {
        let mut state = self.state();
        state.capacity = capacity;
        let excess = state.queue.len().saturating_sub(capacity);
        state.queue.drain(..excess);
        excess
    }

    /// Snapshot of the queued messages, oldest first.
    pub fn queued(&self) -> Vec<Arc<Message>> {
        self.state().queue.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;
    use rumqttc::QoS;

    fn msg(n: usize) -> Message {
        Message::new("sensors/temp", Bytes::from(n.to_string()), QoS::AtMostOnce)
    }

    fn payloads(messages: &[Arc<Message>]) -> Vec<String> {
        messages
            .iter()
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect()
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = MessageBuffer::new(3);
        assert!(buffer.is_empty());
        assert!(buffer.pop().is_none());
        assert!(buffer.peek_latest().is_none());
    }

    #[test]
    fn test_push_at_capacity_evicts_exactly_one() {
        let buffer = MessageBuffer::new(2);
        assert!(buffer.push(msg(1)).is_none());
        assert!(buffer.push(msg(2)).is_none());

        let evicted = buffer.push(msg(3)).expect("oldest entry should be evicted");
        assert_eq!(evicted.payload, Bytes::from("1"));
        assert_eq!(buffer.len(), 2);
        assert_eq!(payloads(&buffer.queued()), vec!["2", "3"]);
    }

    #[test]
    fn test_no_duplicate_of_newest_on_eviction() {
        let buffer = MessageBuffer::new(1);
        buffer.push(msg(1));
        buffer.push(msg(2));

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.pop().unwrap().payload, Bytes::from("2"));
        assert!(buffer.pop().is_none());
    }

    #[test]
    fn test_latest_survives_pops() {
        let buffer = MessageBuffer::new(4);
        buffer.push(msg(1));
        buffer.push(msg(2));
        buffer.pop();
        buffer.pop();
        buffer.pop();

        let latest = buffer.peek_latest().unwrap();
        assert_eq!(latest.payload, Bytes::from("2"));
        assert_eq!(buffer.peek_latest().unwrap(), latest);
    }

    #[test]
    fn test_zero_capacity_only_updates_latest() {
        let buffer = MessageBuffer::new(0);
        assert!(buffer.push(msg(7)).is_none());

        assert_eq!(buffer.len(), 0);
        assert!(buffer.pop().is_none());
        assert_eq!(buffer.peek_latest().unwrap().payload, Bytes::from("7"));
    }

    #[test]
    fn test_set_capacity_truncates_oldest() {
        let buffer = MessageBuffer::new(5);
        for n in 1..=5 {
            buffer.push(msg(n));
        }

        assert_eq!(buffer.set_capacity(2), 3);
        assert_eq!(buffer.capacity(), 2);
        assert_eq!(payloads(&buffer.queued()), vec!["4", "5"]);

        assert_eq!(buffer.set_capacity(10), 0);
        buffer.push(msg(6));
        assert_eq!(payloads(&buffer.queued()), vec!["4", "5", "6"]);
    }

    #[test]
    fn test_concurrent_producers_never_exceed_capacity() {
        let buffer = Arc::new(MessageBuffer::new(8));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for n in 0..250 {
                        buffer.push(msg(t * 1000 + n));
                        assert!(buffer.len() <= 8);
                        if n % 3 == 0 {
                            buffer.pop();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(buffer.len() <= 8);
        assert!(buffer.peek_latest().is_some());
    }

    proptest! {
        #[test]
        fn prop_length_and_contents_are_last_c_pushes(capacity in 1usize..16, n in 0usize..64) {
            let buffer = MessageBuffer::new(capacity);
            for i in 0..n {
                buffer.push(msg(i));
            }

            prop_assert_eq!(buffer.len(), n.min(capacity));
            let expected: Vec<String> = (n.saturating_sub(capacity)..n).map(|i| i.to_string()).collect();
            prop_assert_eq!(payloads(&buffer.queued()), expected);
        }

        #[test]
        fn prop_pop_drains_in_fifo_order(capacity in 1usize..16, n in 1usize..64, pops in 0usize..8) {
            let buffer = MessageBuffer::new(capacity);
            for i in 0..n {
                buffer.push(msg(i));
            }
            let latest_before = buffer.peek_latest();

            let len = buffer.len();
            let mut drained = Vec::new();
            for _ in 0..len {
                drained.push(buffer.pop().expect("queue should not run dry early"));
            }
            for _ in 0..pops {
                prop_assert!(buffer.pop().is_none());
            }

            let expected: Vec<String> = (n - len..n).map(|i| i.to_string()).collect();
            prop_assert_eq!(payloads(&drained), expected);
            prop_assert_eq!(buffer.peek_latest(), latest_before);
            prop_assert_eq!(buffer.peek_latest().unwrap().payload.clone(), Bytes::from((n - 1).to_string()));
        }
    }
}
