//! Per-consumer outbound queue with priority shedding.
//!
//! Below the high-water mark everything is accepted. Between high-water and
//! the hard cap only critical messages get in; the rest are silently shed.
//! At the hard cap enqueue fails outright and the gateway drops the socket.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use bc_protocol::SequencedEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    DroppedNonCritical,
    Overflow,
}

/// Why a queue stopped accepting work. The consumer's writer task reads
/// this to pick the WebSocket close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    Shutdown,
    Overflow,
}

pub struct OutboundQueue {
    entries: Mutex<VecDeque<SequencedEvent>>,
    high_water: usize,
    max_size: usize,
    closed: Mutex<Option<ClosedReason>>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(high_water: usize, max_size: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            high_water,
            max_size,
            closed: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Non-blocking; called by the broadcaster on the router's task.
    /// Overflow closes the queue: the gateway disconnects the socket.
    pub fn enqueue(&self, event: SequencedEvent) -> Enqueue {
        let result = {
            let mut entries = self.entries.lock();
            if self.closed.lock().is_some() {
                return Enqueue::Overflow;
            }
            let len = entries.len();
            if len >= self.max_size {
                *self.closed.lock() = Some(ClosedReason::Overflow);
                Enqueue::Overflow
            } else if len >= self.high_water && !event.payload.is_critical() {
                Enqueue::DroppedNonCritical
            } else {
                entries.push_back(event);
                Enqueue::Accepted
            }
        };
        self.notify.notify_one();
        result
    }

    /// Stop accepting messages (session close). Wakes the writer.
    pub fn close(&self, reason: ClosedReason) {
        let mut closed = self.closed.lock();
        if closed.is_none() {
            *closed = Some(reason);
        }
        drop(closed);
        self.notify.notify_one();
    }

    pub fn closed_reason(&self) -> Option<ClosedReason> {
        *self.closed.lock()
    }

    /// Release up to `max` messages for transport, FIFO.
    pub fn drain(&self, max: usize) -> Vec<SequencedEvent> {
        let mut entries = self.entries.lock();
        let n = entries.len().min(max);
        entries.drain(..n).collect()
    }

    /// Wait until at least one message is (or already was) enqueued, or the
    /// queue is closed.
    pub async fn wait(&self) {
        loop {
            if !self.entries.lock().is_empty() || self.closed.lock().is_some() {
                return;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_protocol::ConsumerEvent;

    fn critical(seq: u64) -> SequencedEvent {
        SequencedEvent::new(seq, ConsumerEvent::CliConnected)
    }

    fn droppable(seq: u64) -> SequencedEvent {
        SequencedEvent::new(
            seq,
            ConsumerEvent::StreamEvent {
                event: serde_json::Value::Null,
            },
        )
    }

    #[test]
    fn accepts_below_high_water() {
        let queue = OutboundQueue::new(3, 5);
        assert_eq!(queue.enqueue(droppable(1)), Enqueue::Accepted);
        assert_eq!(queue.enqueue(droppable(2)), Enqueue::Accepted);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn sheds_non_critical_between_bands() {
        let queue = OutboundQueue::new(2, 5);
        queue.enqueue(droppable(1));
        queue.enqueue(droppable(2));

        // At high water: non-critical dropped, queue unchanged.
        assert_eq!(queue.enqueue(droppable(3)), Enqueue::DroppedNonCritical);
        assert_eq!(queue.len(), 2);

        // Critical still gets in.
        assert_eq!(queue.enqueue(critical(4)), Enqueue::Accepted);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn overflows_at_max_even_for_critical() {
        let queue = OutboundQueue::new(1, 3);
        queue.enqueue(critical(1));
        queue.enqueue(critical(2));
        queue.enqueue(critical(3));
        assert_eq!(queue.enqueue(critical(4)), Enqueue::Overflow);
        assert_eq!(queue.len(), 3);
        // Overflow closes the queue for good.
        assert_eq!(queue.closed_reason(), Some(ClosedReason::Overflow));
        assert_eq!(queue.enqueue(critical(5)), Enqueue::Overflow);
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        use std::sync::Arc;
        let queue = Arc::new(OutboundQueue::new(10, 20));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.wait().await;
                queue.closed_reason()
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.close(ClosedReason::Shutdown);
        assert_eq!(waiter.await.unwrap(), Some(ClosedReason::Shutdown));
    }

    #[test]
    fn drain_preserves_fifo() {
        let queue = OutboundQueue::new(10, 20);
        for seq in 1..=5 {
            queue.enqueue(droppable(seq));
        }
        let batch = queue.drain(3);
        let seqs: Vec<u64> = batch.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn wait_wakes_on_enqueue() {
        use std::sync::Arc;
        let queue = Arc::new(OutboundQueue::new(10, 20));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.wait().await;
                queue.drain(10).len()
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.enqueue(critical(1));
        assert_eq!(waiter.await.unwrap(), 1);
    }
}
