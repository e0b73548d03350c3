//! Message sequencing and capped replay history.

use std::collections::VecDeque;

use bc_protocol::{ConsumerEvent, SequencedEvent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sequencer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Strictly monotonic sequence numbers, starting at 1. Reset on session
/// re-initialization.
#[derive(Debug)]
pub struct Sequencer {
    next: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next(&mut self) -> u64 {
        let seq = self.next;
        self.next += 1;
        seq
    }

    /// The last sequence number handed out (0 before the first).
    pub fn current(&self) -> u64 {
        self.next - 1
    }

    pub fn reset(&mut self) {
        self.next = 1;
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// History
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Capped ring of sequenced consumer events; oldest entries drop first.
#[derive(Debug)]
pub struct MessageHistory {
    entries: VecDeque<SequencedEvent>,
    cap: usize,
}

impl MessageHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(64)),
            cap,
        }
    }

    pub fn push(&mut self, event: SequencedEvent) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
    }

    /// Everything with `seq > after`, in order.
    pub fn replay_after(&self, after: u64) -> Vec<SequencedEvent> {
        self.entries
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect()
    }

    /// The trailing `n` entries, in order.
    pub fn tail(&self, n: usize) -> Vec<SequencedEvent> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn last_seq(&self) -> u64 {
        self.entries.back().map(|e| e.seq).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &SequencedEvent> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Rebuild from persisted entries, re-applying the cap.
    pub fn restore(cap: usize, entries: Vec<SequencedEvent>) -> Self {
        let mut history = Self::new(cap);
        for entry in entries {
            history.push(entry);
        }
        history
    }

    pub fn event_for(seq: u64, payload: ConsumerEvent) -> SequencedEvent {
        SequencedEvent::new(seq, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64) -> SequencedEvent {
        SequencedEvent::new(seq, ConsumerEvent::CliConnected)
    }

    #[test]
    fn sequencer_starts_at_one_and_is_monotonic() {
        let mut sequencer = Sequencer::new();
        assert_eq!(sequencer.next(), 1);
        assert_eq!(sequencer.next(), 2);
        assert_eq!(sequencer.current(), 2);
        sequencer.reset();
        assert_eq!(sequencer.next(), 1);
    }

    #[test]
    fn cap_drops_oldest() {
        let mut history = MessageHistory::new(3);
        for seq in 1..=5 {
            history.push(event(seq));
        }
        assert_eq!(history.len(), 3);
        let seqs: Vec<u64> = history.entries().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn replay_after_is_exact_and_ordered() {
        let mut history = MessageHistory::new(100);
        for seq in 1..=50 {
            history.push(event(seq));
        }
        let replayed = history.replay_after(20);
        assert_eq!(replayed.len(), 30);
        assert_eq!(replayed.first().map(|e| e.seq), Some(21));
        assert_eq!(replayed.last().map(|e| e.seq), Some(50));
        assert!(replayed.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn tail_returns_trailing_entries() {
        let mut history = MessageHistory::new(100);
        for seq in 1..=10 {
            history.push(event(seq));
        }
        let tail = history.tail(3);
        let seqs: Vec<u64> = tail.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);

        // Asking for more than exists returns everything.
        assert_eq!(history.tail(99).len(), 10);
    }

    #[test]
    fn sequencer_tracks_history_max() {
        let mut sequencer = Sequencer::new();
        let mut history = MessageHistory::new(10);
        for _ in 0..20 {
            let seq = sequencer.next();
            history.push(event(seq));
        }
        assert!(sequencer.current() >= history.last_seq());
    }
}
