use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as ShaDigest, Sha512};

use super::committee::Share;
use crate::common::crypto::{Digest, Signer, SIGNATURE_SIZE};
use crate::error::{CryptoError, MessageError, ValidationError};

/*
    A message is stamped with the instance lambda, the sequence number and the
    sender's current round. Votes (prepare, commit) from different signers over
    the same (type, round, value) carry byte-identical messages, which is what
    lets their signatures be combined into one decided message.
*/

pub type MemberId = u64;
pub type Round = u64;
pub type SeqNumber = u64;

pub trait Hashable {
    fn hash(&self) -> Digest;
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum MessageType {
    PrePrepare,
    Prepare,
    Commit,
    ChangeRound,
}

impl AsRef<[u8]> for MessageType {
    fn as_ref(&self) -> &[u8] {
        match self {
            MessageType::PrePrepare => &[1u8],
            MessageType::Prepare => &[2u8],
            MessageType::Commit => &[3u8],
            MessageType::ChangeRound => &[4u8],
        }
    }
}

/// Duty role a consensus stream runs for.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Role {
    Attester,
    Aggregator,
    Proposer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Attester => "ATTESTER",
            Role::Aggregator => "AGGREGATOR",
            Role::Proposer => "PROPOSER",
        };
        f.write_str(s)
    }
}

/// Lambda of a consensus stream: `<validator pubkey hex>_<ROLE>`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier(Vec<u8>);

impl Identifier {
    pub fn new(validator_pubkey: &[u8], role: Role) -> Self {
        Identifier(format!("{}_{}", hex::encode(validator_pubkey), role).into_bytes())
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Identifier(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self)
    }
}

/// Payload of a change round message: the sender's prepared state when its round timer
/// expired, with the prepare quorum that justifies it.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ChangeRoundData {
    pub prepared_round: Round,
    pub prepared_value: Vec<u8>,
    pub justification_msg: Option<Box<Message>>,
    pub justification_sig: Vec<u8>,
    pub signer_ids: Vec<MemberId>,
}

impl ChangeRoundData {
    pub fn not_prepared() -> Self {
        Self::default()
    }

    pub fn prepared(justification: SignedMessage) -> Self {
        ChangeRoundData {
            prepared_round: justification.message.round,
            prepared_value: justification.message.value.clone(),
            justification_msg: Some(Box::new(justification.message)),
            justification_sig: justification.signature,
            signer_ids: justification.signer_ids,
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared_round > 0
    }

    /// The embedded prepare quorum as a signed message, if any.
    pub fn justification(&self) -> Option<SignedMessage> {
        self.justification_msg.as_ref().map(|msg| SignedMessage {
            message: (**msg).clone(),
            signature: self.justification_sig.clone(),
            signer_ids: self.signer_ids.clone(),
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub round: Round,
    pub lambda: Identifier,
    pub seq_number: SeqNumber,
    pub value: Vec<u8>,
    pub previous_lambda: Option<Identifier>,
    pub change_round: Option<ChangeRoundData>,
}

impl Message {
    pub fn new(
        msg_type: MessageType,
        round: Round,
        lambda: Identifier,
        seq_number: SeqNumber,
        value: Vec<u8>,
    ) -> Self {
        Message {
            msg_type,
            round,
            lambda,
            seq_number,
            value,
            previous_lambda: None,
            change_round: None,
        }
    }

    pub fn change_round(
        round: Round,
        lambda: Identifier,
        seq_number: SeqNumber,
        data: ChangeRoundData,
    ) -> Self {
        Message {
            change_round: Some(data),
            ..Message::new(MessageType::ChangeRound, round, lambda, seq_number, Vec::new())
        }
    }
}

fn hash_bytes(hasher: &mut Sha512, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

impl Hashable for Message {
    fn hash(&self) -> Digest {
        let mut hasher = Sha512::new();
        hasher.update(self.msg_type.as_ref());
        hasher.update(self.round.to_be_bytes());
        hash_bytes(&mut hasher, self.lambda.as_bytes());
        hasher.update(self.seq_number.to_be_bytes());
        hash_bytes(&mut hasher, &self.value);
        match &self.previous_lambda {
            Some(prev) => {
                hasher.update([1u8]);
                hash_bytes(&mut hasher, prev.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        match &self.change_round {
            Some(data) => {
                hasher.update([1u8]);
                hasher.update(data.hash());
            }
            None => hasher.update([0u8]),
        }
        let result = hasher.finalize();
        let mut digest = [0u8; 64];
        digest.copy_from_slice(&result[..]);
        digest
    }
}

impl Hashable for ChangeRoundData {
    fn hash(&self) -> Digest {
        let mut hasher = Sha512::new();
        hasher.update(self.prepared_round.to_be_bytes());
        hash_bytes(&mut hasher, &self.prepared_value);
        match &self.justification_msg {
            Some(msg) => {
                hasher.update([1u8]);
                hasher.update(msg.hash());
            }
            None => hasher.update([0u8]),
        }
        hash_bytes(&mut hasher, &self.justification_sig);
        hasher.update((self.signer_ids.len() as u64).to_be_bytes());
        for id in &self.signer_ids {
            hasher.update(id.to_be_bytes());
        }
        let result = hasher.finalize();
        let mut digest = [0u8; 64];
        digest.copy_from_slice(&result[..]);
        digest
    }
}

/// A message with the signatures of one or more committee members.
///
/// `signature` is the concatenation of one 64-byte signature per entry of `signer_ids`, in the
/// same order; `signer_ids` is kept strictly increasing.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SignedMessage {
    pub message: Message,
    pub signature: Vec<u8>,
    pub signer_ids: Vec<MemberId>,
}

impl SignedMessage {
    pub fn sign(
        message: Message,
        signer_id: MemberId,
        signer: &dyn Signer,
    ) -> Result<Self, CryptoError> {
        let sig = signer.sign_digest(&message.hash())?;
        Ok(SignedMessage {
            message,
            signature: sig.to_vec(),
            signer_ids: vec![signer_id],
        })
    }

    /// Structural checks that need no committee knowledge.
    pub fn validate_basic(&self) -> Result<(), MessageError> {
        if self.signer_ids.is_empty() {
            return Err(MessageError::NoSigners);
        }
        if self.signer_ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MessageError::UnsortedSigners);
        }
        if self.signature.len() != self.signer_ids.len() * SIGNATURE_SIZE {
            return Err(MessageError::SignatureLength {
                signers: self.signer_ids.len(),
                actual: self.signature.len(),
            });
        }
        if self.message.round == 0 {
            return Err(MessageError::ZeroRound);
        }
        if self.message.lambda.is_empty() {
            return Err(MessageError::EmptyLambda);
        }
        match (self.message.msg_type, &self.message.change_round) {
            (MessageType::ChangeRound, None) => Err(MessageError::MissingChangeRoundData),
            (MessageType::ChangeRound, Some(_)) | (_, None) => Ok(()),
            (other, Some(_)) => Err(MessageError::UnexpectedChangeRoundData(other)),
        }
    }

    pub fn signatures(&self) -> impl Iterator<Item = (MemberId, &[u8])> {
        self.signer_ids
            .iter()
            .copied()
            .zip(self.signature.chunks(SIGNATURE_SIZE))
    }

    /// Verifies every signer's signature against the committee's keys.
    pub fn verify(&self, share: &Share) -> Result<(), ValidationError> {
        self.validate_basic()?;
        let digest = self.message.hash();
        for (id, sig) in self.signatures() {
            let member = share
                .member(id)
                .ok_or(ValidationError::UnknownSigner(id))?;
            member
                .pubkey
                .verify(&digest, sig)
                .map_err(|source| ValidationError::Signature { signer: id, source })?;
        }
        Ok(())
    }

    /// Folds `other`'s signatures into this message. Both must sign the same message and
    /// share no signer.
    pub fn aggregate(&mut self, other: &SignedMessage) -> Result<(), MessageError> {
        if self.message != other.message {
            return Err(MessageError::MessageMismatch);
        }
        let mut merged: BTreeMap<MemberId, &[u8]> = self.signatures().collect();
        for (id, sig) in other.signatures() {
            if merged.insert(id, sig).is_some() {
                return Err(MessageError::DuplicateSigner(id));
            }
        }
        let mut signature = Vec::with_capacity(merged.len() * SIGNATURE_SIZE);
        let mut signer_ids = Vec::with_capacity(merged.len());
        for (id, sig) in merged {
            signer_ids.push(id);
            signature.extend_from_slice(sig);
        }
        self.signature = signature;
        self.signer_ids = signer_ids;
        Ok(())
    }

    /// Folds in the signatures of `other` from members that have not signed this message yet.
    /// Returns how many signers were added.
    pub fn merge_new_signers(&mut self, other: &SignedMessage) -> Result<usize, MessageError> {
        if self.message != other.message {
            return Err(MessageError::MessageMismatch);
        }
        let mut added = 0;
        for (id, sig) in other.signatures() {
            if self.has_signer(id) {
                continue;
            }
            let single = SignedMessage {
                message: other.message.clone(),
                signature: sig.to_vec(),
                signer_ids: vec![id],
            };
            self.aggregate(&single)?;
            added += 1;
        }
        Ok(added)
    }

    pub fn has_signer(&self, id: MemberId) -> bool {
        self.signer_ids.binary_search(&id).is_ok()
    }

    /// Whether every signer of `other` already signed this message.
    pub fn covers_signers(&self, other: &SignedMessage) -> bool {
        other.signer_ids.iter().all(|id| self.has_signer(*id))
    }

    pub fn signers_string(&self) -> String {
        self.signer_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}
