use super::committee::Share;
use super::message::{Identifier, MessageType, SignedMessage};
use crate::error::ValidationError;

/*
    A decided message is the quorum certificate of an instance: one commit
    message signed by at least 2F + 1 distinct committee members. It is self
    contained, so any node holding the committee keys can check it without
    having seen the instance run.
*/

/// `matching * 3 >= total * 2`, i.e. at least two thirds of the committee.
pub fn has_quorum(matching: usize, total: usize) -> bool {
    total > 0 && matching * 3 >= total * 2
}

/// At least F + 1 of the committee.
pub fn has_partial_quorum(matching: usize, share: &Share) -> bool {
    matching >= share.partial_threshold()
}

/// Checks that `msg` is a valid decided message for `identifier`: a commit with verified
/// signatures from a quorum of the committee.
pub fn validate_decided(
    share: &Share,
    identifier: &Identifier,
    msg: &SignedMessage,
) -> Result<(), ValidationError> {
    msg.validate_basic()?;
    if msg.message.msg_type != MessageType::Commit {
        return Err(ValidationError::WrongType {
            expected: MessageType::Commit,
            actual: msg.message.msg_type,
        });
    }
    if &msg.message.lambda != identifier {
        return Err(ValidationError::WrongLambda);
    }
    if !has_quorum(msg.signer_ids.len(), share.committee_size()) {
        return Err(ValidationError::NoQuorum {
            signers: msg.signer_ids.len(),
            committee: share.committee_size(),
        });
    }
    msg.verify(share)
}
