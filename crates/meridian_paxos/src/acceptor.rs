//! Acceptor role: votes on `Accept` requests and acknowledges commits.

use crate::types::{Ballot, MemberId, PaxosMessage, PaxosSender, SlotId};

/// Per-slot acceptance state.
#[derive(Debug, Clone, Copy)]
struct AcceptedEntry {
    ballot: Ballot,
    #[allow(dead_code)]
    value: u64,
}

/// The acceptor votes for any `Accept` whose ballot is at least as high as
/// the highest ballot it has voted for on that slot. With a single
/// pre-elected leader per group this always succeeds; the ballot check keeps
/// the engine honest if a misdirected proposal ever shows up.
pub struct Acceptor {
    accepted: std::collections::HashMap<SlotId, AcceptedEntry>,
}

impl Acceptor {
    pub fn new() -> Self {
        Self {
            accepted: std::collections::HashMap::new(),
        }
    }

    /// Handle one incoming message, replying through `sender`.
    pub fn handle_message<S: PaxosSender>(
        &mut self,
        msg: &PaxosMessage,
        from: MemberId,
        sender: &S,
    ) {
        match *msg {
            PaxosMessage::Accept { ballot, slot, value } => {
                let entry = self.accepted.entry(slot).or_insert(AcceptedEntry { ballot, value });
                if ballot >= entry.ballot {
                    entry.ballot = ballot;
                    entry.value = value;
                    sender.send(from, PaxosMessage::Accepted { ballot, slot });
                }
            }
            PaxosMessage::Commit { slot, .. } => {
                // The slot is decided; acceptance state for it is no longer needed.
                self.accepted.remove(&slot);
                sender.send(from, PaxosMessage::CommitAck { slot });
            }
            _ => {}
        }
    }
}

impl Default for Acceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(MemberId, PaxosMessage)>>,
    }

    impl PaxosSender for Arc<RecordingSender> {
        fn send(&self, to: MemberId, msg: PaxosMessage) {
            self.sent.lock().unwrap().push((to, msg));
        }
    }

    #[test]
    fn accept_is_answered_with_accepted() {
        let sender = Arc::new(RecordingSender::default());
        let mut acceptor = Acceptor::new();
        acceptor.handle_message(
            &PaxosMessage::Accept { ballot: 0, slot: 3, value: 12 },
            7,
            &sender,
        );
        assert_eq!(
            sender.sent.lock().unwrap().as_slice(),
            &[(7, PaxosMessage::Accepted { ballot: 0, slot: 3 })]
        );
    }

    #[test]
    fn lower_ballot_accept_is_rejected_silently() {
        let sender = Arc::new(RecordingSender::default());
        let mut acceptor = Acceptor::new();
        acceptor.handle_message(
            &PaxosMessage::Accept { ballot: 2, slot: 0, value: 1 },
            1,
            &sender,
        );
        sender.sent.lock().unwrap().clear();

        acceptor.handle_message(
            &PaxosMessage::Accept { ballot: 1, slot: 0, value: 9 },
            1,
            &sender,
        );
        assert!(sender.sent.lock().unwrap().is_empty());
    }
}
