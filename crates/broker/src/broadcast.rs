//! The consumer fan-out plane.
//!
//! Every consumer-bound event is sequenced once (session-global), appended
//! to the replay history, and enqueued on each connected consumer's outbound
//! queue. Enqueue never suspends; overflowed consumers get their queue
//! closed and their writer task disconnects the socket.

use std::sync::Arc;

use bc_protocol::{ConsumerEvent, SequencedEvent};
use bc_sessions::{Enqueue, Session};

/// Sequence and fan out one event to all consumers of the session.
/// Returns the assigned sequence number.
pub fn broadcast(session: &Arc<Session>, event: ConsumerEvent) -> u64 {
    let seq = session.next_seq();
    let sequenced = SequencedEvent::new(seq, event);
    session.push_history(sequenced.clone());

    let mut shed = 0usize;
    for (_, consumer) in session.consumers() {
        match consumer.queue.enqueue(sequenced.clone()) {
            Enqueue::Accepted => {}
            Enqueue::DroppedNonCritical => shed += 1,
            Enqueue::Overflow => {
                // The queue closed itself; the writer task will close the
                // socket. Nothing more to do here.
                tracing::warn!(
                    session_id = session.id(),
                    user_id = %consumer.identity.user_id,
                    "consumer queue overflow, disconnecting"
                );
            }
        }
    }
    if shed > 0 {
        tracing::debug!(
            session_id = session.id(),
            seq,
            shed,
            "shed non-critical message for backpressured consumers"
        );
    }
    seq
}

/// Enqueue an event on a single consumer's queue without sequencing it into
/// the session stream (handshake frames, presence replies, replay). `seq` 0
/// marks the frame as out-of-band.
pub fn direct(
    consumer: &bc_sessions::ConsumerHandle,
    event: ConsumerEvent,
) -> Enqueue {
    consumer.queue.enqueue(SequencedEvent::new(0, event))
}

/// Broadcast the current presence roster.
pub fn presence_update(session: &Arc<Session>) -> u64 {
    broadcast(
        session,
        ConsumerEvent::PresenceUpdate {
            consumers: session.presence(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_sessions::{ConsumerIdentity, SessionLimits};

    fn session() -> Arc<Session> {
        Arc::new(Session::new(
            "123e4567-e89b-42d3-a456-426614174000",
            "claude",
            SessionLimits::default(),
        ))
    }

    #[test]
    fn broadcast_sequences_and_records_history() {
        let session = session();
        let (_, a) = session.add_consumer(ConsumerIdentity::anonymous(1));
        let (_, b) = session.add_consumer(ConsumerIdentity::anonymous(2));

        let seq1 = broadcast(&session, ConsumerEvent::CliConnected);
        let seq2 = broadcast(&session, ConsumerEvent::CliDisconnected);
        assert_eq!((seq1, seq2), (1, 2));

        assert_eq!(a.queue.len(), 2);
        assert_eq!(b.queue.len(), 2);
        assert_eq!(session.replay_after(0).len(), 2);

        // Both consumers see identical ordering.
        let drained_a: Vec<u64> = a.queue.drain(10).iter().map(|e| e.seq).collect();
        let drained_b: Vec<u64> = b.queue.drain(10).iter().map(|e| e.seq).collect();
        assert_eq!(drained_a, vec![1, 2]);
        assert_eq!(drained_b, vec![1, 2]);
    }

    #[test]
    fn direct_frames_are_unsequenced() {
        let session = session();
        let (_, consumer) = session.add_consumer(ConsumerIdentity::anonymous(1));
        direct(
            &consumer,
            ConsumerEvent::PresenceUpdate {
                consumers: session.presence(),
            },
        );
        let frames = consumer.queue.drain(10);
        assert_eq!(frames[0].seq, 0);
        // Direct frames never enter the session history.
        assert_eq!(session.replay_after(0).len(), 0);
    }
}
