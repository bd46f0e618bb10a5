use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use super::committee::{Share, ShareProvider};
use super::message::{Identifier, SeqNumber, SignedMessage};
use super::state::State;
use crate::error::StorageError;

/// Durable consensus state, keyed by identifier.
///
/// Implementations must allow concurrent readers and serialize writers per identifier.
pub trait Storage: Send + Sync {
    fn save_current_instance(&self, identifier: &Identifier, state: &State) -> Result<(), StorageError>;

    fn get_current_instance(&self, identifier: &Identifier) -> Result<Option<State>, StorageError>;

    fn get_decided(&self, identifier: &Identifier, seq: SeqNumber) -> Result<Option<SignedMessage>, StorageError>;

    /// Stores or replaces the decided message of its sequence number.
    fn save_decided(&self, msg: &SignedMessage) -> Result<(), StorageError>;

    /// Stores every message and advances the highest decided pointer in one step; either all
    /// of the batch becomes visible or none of it.
    fn save_decided_batch(&self, msgs: &[SignedMessage]) -> Result<(), StorageError>;

    /// Decided messages with `from <= seq <= to`, ascending.
    fn get_decided_range(
        &self,
        identifier: &Identifier,
        from: SeqNumber,
        to: SeqNumber,
    ) -> Result<Vec<SignedMessage>, StorageError>;

    fn get_highest_decided(&self, identifier: &Identifier) -> Result<Option<SignedMessage>, StorageError>;

    /// Moves the pointer to `msg` unless a higher sequence is already stored.
    fn save_highest_decided(&self, msg: &SignedMessage) -> Result<(), StorageError>;

    fn save_last_change_round(&self, msg: &SignedMessage) -> Result<(), StorageError>;

    fn get_last_change_round(&self, identifier: &Identifier) -> Result<Option<SignedMessage>, StorageError>;
}

#[derive(Debug, Default)]
struct IdentifierStore {
    decided: BTreeMap<SeqNumber, SignedMessage>,
    highest: Option<SignedMessage>,
    current: Option<State>,
    last_change_round: Option<SignedMessage>,
}

impl IdentifierStore {
    fn advance_highest(&mut self, msg: &SignedMessage) {
        let higher = self
            .highest
            .as_ref()
            .map_or(true, |h| msg.message.seq_number >= h.message.seq_number);
        if higher {
            self.highest = Some(msg.clone());
        }
    }
}

/// Map backed store, one lock per identifier. Also serves as a `ShareProvider`.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    identifiers: RwLock<HashMap<Identifier, Arc<RwLock<IdentifierStore>>>>,
    shares: RwLock<HashMap<Vec<u8>, Share>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_share(&self, share: Share) {
        self.shares
            .write()
            .insert(share.validator_pubkey.clone(), share);
    }

    fn store(&self, identifier: &Identifier) -> Arc<RwLock<IdentifierStore>> {
        if let Some(store) = self.identifiers.read().get(identifier) {
            return store.clone();
        }
        self.identifiers
            .write()
            .entry(identifier.clone())
            .or_default()
            .clone()
    }
}

impl Storage for InMemoryStorage {
    fn save_current_instance(&self, identifier: &Identifier, state: &State) -> Result<(), StorageError> {
        self.store(identifier).write().current = Some(state.clone());
        Ok(())
    }

    fn get_current_instance(&self, identifier: &Identifier) -> Result<Option<State>, StorageError> {
        Ok(self.store(identifier).read().current.clone())
    }

    fn get_decided(&self, identifier: &Identifier, seq: SeqNumber) -> Result<Option<SignedMessage>, StorageError> {
        Ok(self.store(identifier).read().decided.get(&seq).cloned())
    }

    fn save_decided(&self, msg: &SignedMessage) -> Result<(), StorageError> {
        self.store(&msg.message.lambda)
            .write()
            .decided
            .insert(msg.message.seq_number, msg.clone());
        Ok(())
    }

    fn save_decided_batch(&self, msgs: &[SignedMessage]) -> Result<(), StorageError> {
        let mut by_identifier: HashMap<&Identifier, Vec<&SignedMessage>> = HashMap::new();
        for msg in msgs {
            by_identifier.entry(&msg.message.lambda).or_default().push(msg);
        }
        let stores: Vec<_> = by_identifier
            .into_iter()
            .map(|(identifier, msgs)| (self.store(identifier), msgs))
            .collect();
        for (store, msgs) in stores {
            let mut store = store.write();
            for msg in msgs {
                store.decided.insert(msg.message.seq_number, msg.clone());
                store.advance_highest(msg);
            }
        }
        Ok(())
    }

    fn get_decided_range(
        &self,
        identifier: &Identifier,
        from: SeqNumber,
        to: SeqNumber,
    ) -> Result<Vec<SignedMessage>, StorageError> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .store(identifier)
            .read()
            .decided
            .range(from..=to)
            .map(|(_, msg)| msg.clone())
            .collect())
    }

    fn get_highest_decided(&self, identifier: &Identifier) -> Result<Option<SignedMessage>, StorageError> {
        Ok(self.store(identifier).read().highest.clone())
    }

    fn save_highest_decided(&self, msg: &SignedMessage) -> Result<(), StorageError> {
        self.store(&msg.message.lambda).write().advance_highest(msg);
        Ok(())
    }

    fn save_last_change_round(&self, msg: &SignedMessage) -> Result<(), StorageError> {
        self.store(&msg.message.lambda).write().last_change_round = Some(msg.clone());
        Ok(())
    }

    fn get_last_change_round(&self, identifier: &Identifier) -> Result<Option<SignedMessage>, StorageError> {
        Ok(self.store(identifier).read().last_change_round.clone())
    }
}

impl ShareProvider for InMemoryStorage {
    fn get_share(&self, validator_pubkey: &[u8]) -> Result<Option<Share>, StorageError> {
        Ok(self.shares.read().get(validator_pubkey).cloned())
    }
}
