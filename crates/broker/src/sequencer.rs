//! Event sequencer (§4.1): the authoritative, strictly-increasing `seq`
//! counter for one session plus a bounded replay buffer and a live
//! broadcast fan-out for subscribers.
//!
//! The replay buffer is a `VecDeque` with a `base_seq` offset, so looking
//! up `seq` is O(1) without ever shifting existing entries — the same
//! trick a bounded run ledger elsewhere in this workspace uses to avoid
//! re-indexing on eviction.

use std::collections::VecDeque;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use sbx_domain::event::Event;
use sbx_domain::error::{BrokerError, Result};

/// Default capacity of the live broadcast channel. Slow subscribers that
/// fall behind this many events see `RecvError::Lagged`.
const BROADCAST_CAPACITY: usize = 256;

pub struct EventSequencer {
    inner: RwLock<Inner>,
    tx: broadcast::Sender<Event>,
    capacity: usize,
}

struct Inner {
    buffer: VecDeque<Event>,
    /// seq of the oldest event still in `buffer`. Requests for a seq below
    /// this have been evicted and must fail with `StreamGap`.
    base_seq: u64,
    /// Next seq to hand out.
    next_seq: u64,
}

impl EventSequencer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                buffer: VecDeque::with_capacity(capacity.min(4096)),
                base_seq: 1,
                next_seq: 1,
            }),
            tx,
            capacity,
        }
    }

    /// Assign the next seq to `body`, append it to the replay buffer
    /// (evicting the oldest entry if full), and publish it to live
    /// subscribers. Returns the stamped event.
    pub fn publish(&self, make: impl FnOnce(u64) -> Event) -> Event {
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let event = make(seq);

        inner.buffer.push_back(event.clone());
        if inner.buffer.len() > self.capacity {
            inner.buffer.pop_front();
            inner.base_seq += 1;
        }

        // A send error just means there are currently no live subscribers;
        // the event is still safely in the replay buffer.
        let _ = self.tx.send(event.clone());
        event
    }

    /// Subscribe for live events published from this point forward.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Every buffered event with `seq >= from_seq`, oldest first.
    ///
    /// Returns `StreamGap` if `from_seq` is older than the buffer's low
    /// water mark — the caller already missed those events and has no way
    /// to recover them.
    pub fn replay_from(&self, from_seq: u64) -> Result<Vec<Event>> {
        let inner = self.inner.read();
        if from_seq < inner.base_seq {
            return Err(BrokerError::StreamGap {
                requested: from_seq,
                low_water: inner.base_seq,
            });
        }
        let skip = (from_seq - inner.base_seq) as usize;
        Ok(inner.buffer.iter().skip(skip).cloned().collect())
    }

    pub fn last_seq(&self) -> u64 {
        let inner = self.inner.read();
        inner.next_seq.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbx_domain::event::EventBody;
    use sbx_domain::ids::SessionId;

    fn heartbeat(session: &SessionId) -> impl Fn(u64) -> Event + '_ {
        move |seq| Event::new(session.clone(), seq, EventBody::Heartbeat {})
    }

    #[test]
    fn seq_is_strictly_increasing() {
        let seq = EventSequencer::new(10);
        let session = SessionId::generate();
        let e1 = seq.publish(heartbeat(&session));
        let e2 = seq.publish(heartbeat(&session));
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
    }

    #[test]
    fn replay_from_one_returns_everything_buffered() {
        let seq = EventSequencer::new(10);
        let session = SessionId::generate();
        for _ in 0..5 {
            seq.publish(heartbeat(&session));
        }
        let replayed = seq.replay_from(1).unwrap();
        assert_eq!(replayed.len(), 5);
        assert_eq!(replayed[0].seq, 1);
        assert_eq!(replayed[4].seq, 5);
    }

    #[test]
    fn eviction_raises_stream_gap_below_low_water_mark() {
        let seq = EventSequencer::new(3);
        let session = SessionId::generate();
        for _ in 0..5 {
            seq.publish(heartbeat(&session));
        }
        // capacity 3 means seqs 1,2 are evicted; low water mark is 3.
        assert!(seq.replay_from(1).is_err());
        assert!(seq.replay_from(2).is_err());
        let replayed = seq.replay_from(3).unwrap();
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].seq, 3);
    }

    #[test]
    fn live_subscriber_receives_events_published_after_subscribe() {
        let seq = EventSequencer::new(10);
        let session = SessionId::generate();
        let mut rx = seq.subscribe();
        seq.publish(heartbeat(&session));
        let received = rx.try_recv().unwrap();
        assert_eq!(received.seq, 1);
    }
}
