//! Committee fixtures shared by unit and integration tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::common::crypto::Keypair;
use crate::consensus::{
    ChangeRoundData, CommitteeMember, Identifier, MemberId, Message, MessageType, Role, Round,
    SeqNumber, Share, SignedMessage,
};

/// A committee with reproducible keys. Members are numbered from 1.
pub struct TestCommittee {
    keys: BTreeMap<MemberId, Arc<Keypair>>,
    validator_pubkey: Vec<u8>,
}

impl TestCommittee {
    pub fn generate(size: u64) -> Self {
        let keys = (1..=size)
            .map(|id| (id, Arc::new(Keypair::from_secret(&[id as u8; 32]))))
            .collect();
        TestCommittee {
            keys,
            validator_pubkey: vec![0xab; 48],
        }
    }

    pub fn size(&self) -> usize {
        self.keys.len()
    }

    pub fn member_ids(&self) -> Vec<MemberId> {
        self.keys.keys().copied().collect()
    }

    pub fn validator_pubkey(&self) -> &[u8] {
        &self.validator_pubkey
    }

    pub fn identifier(&self) -> Identifier {
        Identifier::new(&self.validator_pubkey, Role::Attester)
    }

    pub fn share_for(&self, node_id: MemberId) -> Share {
        let members = self
            .keys
            .iter()
            .map(|(id, key)| CommitteeMember {
                id: *id,
                pubkey: key.pubkey(),
            })
            .collect();
        Share::new(node_id, self.validator_pubkey.clone(), members)
    }

    pub fn keypair(&self, id: MemberId) -> &Keypair {
        &self.keys[&id]
    }

    pub fn signer(&self, id: MemberId) -> Arc<Keypair> {
        self.keys[&id].clone()
    }

    pub fn sign(&self, id: MemberId, message: Message) -> SignedMessage {
        SignedMessage::sign(message, id, self.keypair(id)).expect("in-process signing")
    }

    pub fn multi_sign(&self, ids: &[MemberId], message: Message) -> SignedMessage {
        let mut iter = ids.iter();
        let first = iter.next().expect("at least one signer");
        let mut aggregated = self.sign(*first, message.clone());
        for id in iter {
            aggregated
                .aggregate(&self.sign(*id, message.clone()))
                .expect("distinct signers");
        }
        aggregated
    }

    fn quorum(&self) -> Vec<MemberId> {
        let threshold = self.share_for(1).threshold_size();
        self.member_ids().into_iter().take(threshold).collect()
    }

    /// A round 1 commit for `seq` signed by the smallest quorum of members.
    pub fn decided(&self, seq: SeqNumber, value: &[u8]) -> SignedMessage {
        let commit = Message::new(MessageType::Commit, 1, self.identifier(), seq, value.to_vec());
        self.multi_sign(&self.quorum(), commit)
    }

    /// A change round for sequence 1. `prepared` carries the prepared round and value, justified
    /// by a prepare quorum of the smallest quorum of members.
    pub fn change_round_msg(
        &self,
        signer: MemberId,
        round: Round,
        prepared: Option<(Round, Vec<u8>)>,
    ) -> SignedMessage {
        let data = match prepared {
            Some((prepared_round, value)) => {
                let prepare =
                    Message::new(MessageType::Prepare, prepared_round, self.identifier(), 1, value);
                ChangeRoundData::prepared(self.multi_sign(&self.quorum(), prepare))
            }
            None => ChangeRoundData::not_prepared(),
        };
        self.sign(signer, Message::change_round(round, self.identifier(), 1, data))
    }
}
