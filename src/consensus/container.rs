use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use super::message::{MemberId, Round, SignedMessage};
use super::qc::has_quorum;

/// Round-indexed store of one message type.
///
/// Keeps at most one message per (round, signer); the first one wins. A message signed by
/// several members is filed under each of its signers.
#[derive(Debug)]
pub struct MessageContainer {
    committee_size: usize,
    messages: RwLock<HashMap<Round, BTreeMap<MemberId, SignedMessage>>>,
}

impl MessageContainer {
    pub fn new(committee_size: usize) -> Self {
        MessageContainer {
            committee_size,
            messages: RwLock::new(HashMap::new()),
        }
    }

    /// Returns whether any signer of `msg` was new for its round.
    pub fn add_message(&self, msg: &SignedMessage) -> bool {
        let mut messages = self.messages.write();
        let by_signer = messages.entry(msg.message.round).or_default();
        let mut added = false;
        for id in &msg.signer_ids {
            if !by_signer.contains_key(id) {
                by_signer.insert(*id, msg.clone());
                added = true;
            }
        }
        added
    }

    pub fn read_only_messages_by_round(&self, round: Round) -> BTreeMap<MemberId, SignedMessage> {
        self.messages
            .read()
            .get(&round)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the signers of `round` whose message carries `value` form a quorum, with their
    /// count and the committee size.
    pub fn quorum_count(&self, round: Round, value: &[u8]) -> (bool, usize, usize) {
        let matching = self
            .messages
            .read()
            .get(&round)
            .map(|by_signer| {
                by_signer
                    .values()
                    .filter(|msg| msg.message.value == value)
                    .count()
            })
            .unwrap_or(0);
        (
            has_quorum(matching, self.committee_size),
            matching,
            self.committee_size,
        )
    }

    /// Whether the signers of `round` form a quorum regardless of value.
    pub fn round_quorum(&self, round: Round) -> (bool, usize) {
        let count = self.messages.read().get(&round).map_or(0, BTreeMap::len);
        (has_quorum(count, self.committee_size), count)
    }

    /// Distinct messages of `round` carrying `value`, each once even when filed under several
    /// signers.
    pub fn messages_for_value(&self, round: Round, value: &[u8]) -> Vec<SignedMessage> {
        let messages = self.messages.read();
        let mut out: Vec<SignedMessage> = Vec::new();
        if let Some(by_signer) = messages.get(&round) {
            for msg in by_signer.values() {
                if msg.message.value == value && !out.contains(msg) {
                    out.push(msg.clone());
                }
            }
        }
        out
    }

    /// Signers per round for every round strictly above `round`.
    pub fn signers_above(&self, round: Round) -> BTreeMap<Round, Vec<MemberId>> {
        self.messages
            .read()
            .iter()
            .filter(|(r, _)| **r > round)
            .map(|(r, by_signer)| (*r, by_signer.keys().copied().collect()))
            .collect()
    }

    pub fn len(&self, round: Round) -> usize {
        self.messages.read().get(&round).map_or(0, BTreeMap::len)
    }
}
