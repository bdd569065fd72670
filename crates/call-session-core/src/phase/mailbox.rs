//! Bounded priority mailbox feeding the drain loop

use std::cmp::Reverse;
use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::types::{Phase, PhaseEvent};
use crate::error::CallResult;

/// An event waiting to be applied, plus the channel its caller awaits
#[derive(Debug)]
pub struct PendingEvent {
    pub event: PhaseEvent,
    pub priority: u8,
    pub sequence: u64,
    pub enqueued_at: Instant,
    pub(crate) reply: oneshot::Sender<CallResult<Phase>>,
}

impl PendingEvent {
    pub(crate) fn new(
        event: PhaseEvent,
        sequence: u64,
        reply: oneshot::Sender<CallResult<Phase>>,
    ) -> Self {
        Self {
            priority: event.priority(),
            event,
            sequence,
            enqueued_at: Instant::now(),
            reply,
        }
    }

    /// Resolve the caller's future. The caller may have stopped waiting.
    pub(crate) fn resolve(self, result: CallResult<Phase>) {
        let _ = self.reply.send(result);
    }

    fn key(&self) -> MailboxKey {
        (Reverse(self.priority), self.sequence)
    }
}

/// Highest priority sorts first, ties by arrival
type MailboxKey = (Reverse<u8>, u64);

/// Outcome of pushing into a full mailbox
#[derive(Debug)]
pub(crate) enum Admission {
    Queued,
    /// Queued after evicting the lowest-priority, most recent entry
    Evicted(PendingEvent),
    /// The incoming entry was itself the lowest and was refused
    Refused(PendingEvent),
}

#[derive(Debug)]
pub(crate) struct Mailbox {
    entries: BTreeMap<MailboxKey, PendingEvent>,
    capacity: usize,
}

impl Mailbox {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&mut self, pending: PendingEvent) -> Admission {
        if self.entries.len() < self.capacity {
            self.entries.insert(pending.key(), pending);
            return Admission::Queued;
        }

        let incoming = pending.key();
        match self.entries.last_key_value() {
            Some((lowest, _)) if *lowest > incoming => {
                let evicted = self.entries.pop_last().map(|(_, e)| e);
                self.entries.insert(incoming, pending);
                match evicted {
                    Some(evicted) => Admission::Evicted(evicted),
                    None => Admission::Queued,
                }
            }
            _ => Admission::Refused(pending),
        }
    }

    pub(crate) fn pop(&mut self) -> Option<PendingEvent> {
        self.entries.pop_first().map(|(_, e)| e)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn drain(&mut self) -> Vec<PendingEvent> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::types::ResetReason;
    use crate::session::SessionId;

    fn pending(event: PhaseEvent, seq: u64) -> (PendingEvent, oneshot::Receiver<CallResult<Phase>>) {
        let (tx, rx) = oneshot::channel();
        (PendingEvent::new(event, seq, tx), rx)
    }

    fn accepted(id: &str) -> PhaseEvent {
        PhaseEvent::CallAccepted { session_id: SessionId::from(id) }
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let mut mailbox = Mailbox::new(10);
        mailbox.push(pending(accepted("a"), 1).0);
        mailbox.push(pending(PhaseEvent::CallEnded { session_id: None, reason: None }, 2).0);
        mailbox.push(pending(accepted("b"), 3).0);
        mailbox.push(pending(PhaseEvent::Reset { reason: ResetReason::Explicit }, 4).0);

        let order: Vec<u64> = std::iter::from_fn(|| mailbox.pop()).map(|p| p.sequence).collect();
        assert_eq!(order, vec![4, 2, 1, 3]);
    }

    #[tokio::test]
    async fn test_full_mailbox_evicts_lowest_most_recent() {
        let mut mailbox = Mailbox::new(3);
        mailbox.push(pending(accepted("a"), 1).0);
        mailbox.push(pending(accepted("b"), 2).0);
        mailbox.push(pending(PhaseEvent::EndCall, 3).0);

        match mailbox.push(pending(PhaseEvent::CallEnded { session_id: None, reason: None }, 4).0) {
            Admission::Evicted(evicted) => assert_eq!(evicted.sequence, 2),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(mailbox.len(), 3);
    }

    #[tokio::test]
    async fn test_full_mailbox_refuses_lowest_incoming() {
        let mut mailbox = Mailbox::new(2);
        mailbox.push(pending(PhaseEvent::EndCall, 1).0);
        mailbox.push(pending(accepted("a"), 2).0);

        // Same priority as the current lowest, but newer: refused
        match mailbox.push(pending(accepted("b"), 3).0) {
            Admission::Refused(refused) => assert_eq!(refused.sequence, 3),
            other => panic!("expected refusal, got {:?}", other),
        }
        assert_eq!(mailbox.pop().map(|p| p.sequence), Some(1));
        assert_eq!(mailbox.pop().map(|p| p.sequence), Some(2));
        assert_eq!(mailbox.len(), 0);
    }
}
