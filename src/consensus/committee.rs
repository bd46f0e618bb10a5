use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::message::MemberId;
use crate::common::crypto::Pubkey;
use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeMember {
    pub id: MemberId,
    pub pubkey: Pubkey,
}

/// The local node's view of the committee running one validator share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub node_id: MemberId,
    pub validator_pubkey: Vec<u8>,
    pub committee: BTreeMap<MemberId, CommitteeMember>,
}

impl Share {
    pub fn new(node_id: MemberId, validator_pubkey: Vec<u8>, members: Vec<CommitteeMember>) -> Self {
        Share {
            node_id,
            validator_pubkey,
            committee: members.into_iter().map(|m| (m.id, m)).collect(),
        }
    }

    pub fn committee_size(&self) -> usize {
        self.committee.len()
    }

    /// F, the number of faulty members tolerated.
    pub fn fault_tolerance(&self) -> usize {
        self.committee_size().saturating_sub(1) / 3
    }

    /// Smallest signer count that forms a quorum, `ceil(2N / 3)`.
    pub fn threshold_size(&self) -> usize {
        (self.committee_size() * 2 + 2) / 3
    }

    /// F + 1: at least one honest member is among them.
    pub fn partial_threshold(&self) -> usize {
        self.fault_tolerance() + 1
    }

    pub fn member(&self, id: MemberId) -> Option<&CommitteeMember> {
        self.committee.get(&id)
    }

    pub fn pubkey(&self, id: MemberId) -> Option<&Pubkey> {
        self.member(id).map(|m| &m.pubkey)
    }

    pub fn is_member(&self, id: MemberId) -> bool {
        self.committee.contains_key(&id)
    }

    /// Member ids in ascending order.
    pub fn member_ids(&self) -> Vec<MemberId> {
        self.committee.keys().copied().collect()
    }
}

/// Looks up the share of a validator by its public key.
pub trait ShareProvider: Send + Sync {
    fn get_share(&self, validator_pubkey: &[u8]) -> Result<Option<Share>, StorageError>;
}
