//! The ingress queue and the pending-ack deque.
//!
//! The concatenation `pending_ack ++ pending_send` always preserves the
//! producers' insertion order; this is what makes a retried stream replay
//! records transparently. Producers push to [`PendingSend`]; the stream
//! driver moves records to the attempt's [`PendingAck`] right before the
//! wire send, and the ACK callback pops them from the head.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::event::EventRecord;

/// Ordered FIFO of records awaiting their first (or replayed) send.
pub(crate) struct PendingSend {
    queue: Mutex<VecDeque<Arc<EventRecord>>>,
    notify: Notify,
}

impl PendingSend {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Appends a record; producers call this with external ordering already
    /// established by the transport's send critical section.
    pub(crate) fn push(&self, record: Arc<EventRecord>) {
        self.queue.lock().push_back(record);
        self.notify.notify_one();
    }

    /// Puts unacked records back at the head, keeping their original order.
    pub(crate) fn requeue_front(&self, records: Vec<Arc<EventRecord>>) {
        let mut queue = self.queue.lock();
        for record in records.into_iter().rev() {
            queue.push_front(record);
        }
        drop(queue);
        self.notify.notify_one();
    }

    /// Pops the head, waiting up to `wait` for a record to arrive.
    pub(crate) async fn poll(&self, wait: Duration) -> Option<Arc<EventRecord>> {
        // Register interest before the empty-check so a push between the two
        // cannot be missed.
        let notified = self.notify.notified();
        if let Some(record) = self.queue.lock().pop_front() {
            return Some(record);
        }
        let _ = tokio::time::timeout(wait, notified).await;
        self.queue.lock().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Outcome of matching an inbound ACK against the deque head.
pub(crate) enum AckOutcome {
    /// The ACK matched; the head record is returned.
    Matched(Arc<EventRecord>),
    /// The ACK did not carry the head's sequence number.
    Mismatch {
        /// Sequence number at the head, or -1 when the deque was empty.
        expected: i64,
    },
}

/// Records written to the wire but not yet acknowledged.
///
/// Each stream attempt gets a fresh instance so an ACK callback left over
/// from an aborted stream cannot touch the live attempt's deque.
pub(crate) struct PendingAck {
    queue: Mutex<VecDeque<Arc<EventRecord>>>,
}

impl PendingAck {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a record about to be written to the wire.
    pub(crate) fn push(&self, record: Arc<EventRecord>) {
        self.queue.lock().push_back(record);
    }

    /// Matches an ACK against the head and pops it on success. Head check
    /// and pop happen under one lock so a concurrent push cannot interleave.
    pub(crate) fn ack(&self, sequence_number: i64) -> AckOutcome {
        let mut queue = self.queue.lock();
        let expected = queue.front().map_or(-1, |record| record.sequence_number());
        if expected != sequence_number {
            return AckOutcome::Mismatch { expected };
        }
        // Non-empty: an empty deque reports -1, which cannot match a wire
        // sequence number.
        match queue.pop_front() {
            Some(record) => AckOutcome::Matched(record),
            None => AckOutcome::Mismatch { expected },
        }
    }

    /// Removes and returns all surviving records, oldest first.
    pub(crate) fn drain(&self) -> Vec<Arc<EventRecord>> {
        self.queue.lock().drain(..).collect()
    }
}
