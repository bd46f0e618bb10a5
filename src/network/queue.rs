use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::consensus::{Identifier, MessageType, Round, SeqNumber, SignedMessage};

/// Bucket a consensus message waits in until an instance asks for it.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum IndexKey {
    Round {
        lambda: Identifier,
        seq_number: SeqNumber,
        round: Round,
    },
    ChangeRound {
        lambda: Identifier,
        seq_number: SeqNumber,
    },
}

impl IndexKey {
    pub fn for_message(msg: &SignedMessage) -> Self {
        let m = &msg.message;
        match m.msg_type {
            MessageType::ChangeRound => IndexKey::ChangeRound {
                lambda: m.lambda.clone(),
                seq_number: m.seq_number,
            },
            _ => IndexKey::Round {
                lambda: m.lambda.clone(),
                seq_number: m.seq_number,
                round: m.round,
            },
        }
    }

    pub fn round(lambda: &Identifier, seq_number: SeqNumber, round: Round) -> Self {
        IndexKey::Round {
            lambda: lambda.clone(),
            seq_number,
            round,
        }
    }

    pub fn change_round(lambda: &Identifier, seq_number: SeqNumber) -> Self {
        IndexKey::ChangeRound {
            lambda: lambda.clone(),
            seq_number,
        }
    }

    pub fn belongs_to(&self, lambda: &Identifier, seq: SeqNumber) -> bool {
        match self {
            IndexKey::Round {
                lambda: l,
                seq_number,
                ..
            }
            | IndexKey::ChangeRound {
                lambda: l,
                seq_number,
            } => l == lambda && *seq_number == seq,
        }
    }

    pub fn seq_number(&self) -> SeqNumber {
        match self {
            IndexKey::Round { seq_number, .. } | IndexKey::ChangeRound { seq_number, .. } => {
                *seq_number
            }
        }
    }
}

/// Inbound consensus messages, indexed so an instance only pulls what its current round needs.
#[derive(Debug, Default)]
pub struct MessageQueue {
    queues: Mutex<HashMap<IndexKey, VecDeque<SignedMessage>>>,
    notify: Notify,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(&self, msg: SignedMessage) {
        let key = IndexKey::for_message(&msg);
        self.queues.lock().entry(key).or_default().push_back(msg);
        self.notify.notify_waiters();
    }

    pub fn pop_message(&self, key: &IndexKey) -> Option<SignedMessage> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(key)?;
        let msg = queue.pop_front();
        if queue.is_empty() {
            queues.remove(key);
        }
        msg
    }

    /// Pops from the first key that has a message, in the order given.
    pub fn pop_first(&self, keys: &[IndexKey]) -> Option<SignedMessage> {
        keys.iter().find_map(|key| self.pop_message(key))
    }

    /// Like `pop_first`, but waits up to `poll` for a message to arrive when the keys are
    /// empty.
    pub async fn wait_for(&self, keys: &[IndexKey], poll: Duration) -> Option<SignedMessage> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if let Some(msg) = self.pop_first(keys) {
            return Some(msg);
        }
        let _ = tokio::time::timeout(poll, notified).await;
        self.pop_first(keys)
    }

    pub fn purge_indexed_messages(&self, key: &IndexKey) -> usize {
        self.queues.lock().remove(key).map_or(0, |q| q.len())
    }

    /// Drops every bucket `purge` selects and returns how many messages went with them.
    pub fn purge_where(&self, purge: impl Fn(&IndexKey) -> bool) -> usize {
        let mut queues = self.queues.lock();
        let mut removed = 0;
        queues.retain(|key, queue| {
            if purge(key) {
                removed += queue.len();
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn len(&self, key: &IndexKey) -> usize {
        self.queues.lock().get(key).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }
}
