use std::sync::Arc;

use super::committee::Share;
use super::leader::LeaderSelector;
use super::message::{Identifier, MessageType, Round, SeqNumber, SignedMessage};
use super::qc::has_quorum;
use crate::error::ValidationError;

/*
    Incoming messages go through a pipeline of small named checks, run in
    order and stopping at the first failure. The fork decides which checks
    apply to which message type; the instance only runs what it is given.
*/

pub trait Pipeline: Send + Sync {
    fn run(&self, msg: &SignedMessage) -> Result<(), ValidationError>;

    fn name(&self) -> String;
}

pub type BoxedPipeline = Arc<dyn Pipeline>;

struct FnPipeline<F> {
    name: &'static str,
    f: F,
}

impl<F> Pipeline for FnPipeline<F>
where
    F: Fn(&SignedMessage) -> Result<(), ValidationError> + Send + Sync,
{
    fn run(&self, msg: &SignedMessage) -> Result<(), ValidationError> {
        (self.f)(msg)
    }

    fn name(&self) -> String {
        self.name.to_string()
    }
}

pub fn wrap_fn<F>(name: &'static str, f: F) -> BoxedPipeline
where
    F: Fn(&SignedMessage) -> Result<(), ValidationError> + Send + Sync + 'static,
{
    Arc::new(FnPipeline { name, f })
}

struct Combination {
    pipelines: Vec<BoxedPipeline>,
}

impl Pipeline for Combination {
    fn run(&self, msg: &SignedMessage) -> Result<(), ValidationError> {
        for pipeline in &self.pipelines {
            pipeline.run(msg)?;
        }
        Ok(())
    }

    fn name(&self) -> String {
        let names: Vec<String> = self.pipelines.iter().map(|p| p.name()).collect();
        format!("combination of: {}", names.join(", "))
    }
}

pub fn combine(pipelines: Vec<BoxedPipeline>) -> BoxedPipeline {
    Arc::new(Combination { pipelines })
}

pub fn basic_msg_validation() -> BoxedPipeline {
    wrap_fn("basic msg validation", |msg| {
        msg.validate_basic()?;
        Ok(())
    })
}

pub fn msg_type_check(expected: MessageType) -> BoxedPipeline {
    wrap_fn("type check", move |msg| {
        if msg.message.msg_type != expected {
            return Err(ValidationError::WrongType {
                expected,
                actual: msg.message.msg_type,
            });
        }
        Ok(())
    })
}

pub fn validate_lambdas(lambda: Identifier) -> BoxedPipeline {
    wrap_fn("lambdas", move |msg| {
        if msg.message.lambda != lambda {
            return Err(ValidationError::WrongLambda);
        }
        Ok(())
    })
}

pub fn validate_round(round: Round) -> BoxedPipeline {
    wrap_fn("round", move |msg| {
        if msg.message.round != round {
            return Err(ValidationError::WrongRound {
                expected: round,
                actual: msg.message.round,
            });
        }
        Ok(())
    })
}

/// Accepts the current round and any later one.
pub fn validate_min_round(round: Round) -> BoxedPipeline {
    wrap_fn("min round", move |msg| {
        if msg.message.round < round {
            return Err(ValidationError::StaleRound {
                current: round,
                actual: msg.message.round,
            });
        }
        Ok(())
    })
}

pub fn validate_sequence_number(seq_number: SeqNumber) -> BoxedPipeline {
    wrap_fn("sequence", move |msg| {
        if msg.message.seq_number != seq_number {
            return Err(ValidationError::WrongSequence {
                expected: seq_number,
                actual: msg.message.seq_number,
            });
        }
        Ok(())
    })
}

/// Every signer is a committee member and every signature verifies.
pub fn authorize_msg(share: Arc<Share>) -> BoxedPipeline {
    wrap_fn("authorize", move |msg| msg.verify(&share))
}

pub fn validate_single_signer() -> BoxedPipeline {
    wrap_fn("single signer", |msg| {
        if msg.signer_ids.len() != 1 {
            return Err(ValidationError::NotSingleSigner(msg.signer_ids.len()));
        }
        Ok(())
    })
}

/// The signer is the leader of the round the message claims.
pub fn validate_pre_prepare_leader(selector: Arc<dyn LeaderSelector>) -> BoxedPipeline {
    wrap_fn("pre-prepare leader", move |msg| {
        let leader = selector.leader_index(msg.message.round);
        match msg.signer_ids.as_slice() {
            [signer] if *signer == leader => Ok(()),
            [signer] => Err(ValidationError::NotLeader {
                leader,
                signer: *signer,
            }),
            signers => Err(ValidationError::NotSingleSigner(signers.len())),
        }
    })
}

/// The message value equals the pre-prepare accepted for its round. With `skip_first_round`,
/// round 1 votes are taken without a proposal since its value comes from the instance input.
pub fn validate_prepare_matches_proposal(
    accepted: Option<Vec<u8>>,
    skip_first_round: bool,
) -> BoxedPipeline {
    wrap_fn("matches proposal", move |msg| {
        if skip_first_round && msg.message.round == 1 {
            return Ok(());
        }
        match &accepted {
            None => Err(ValidationError::NoProposal),
            Some(value) if *value != msg.message.value => Err(ValidationError::ProposalMismatch),
            Some(_) => Ok(()),
        }
    })
}

/// Checks the prepared claim a change round message carries against its embedded prepare
/// quorum.
pub fn validate_change_round_justification(share: Arc<Share>) -> BoxedPipeline {
    wrap_fn("change round justification", move |msg| {
        let data = msg
            .message
            .change_round
            .as_ref()
            .ok_or(ValidationError::InvalidJustification("change round data is missing"))?;
        if !data.is_prepared() {
            if !data.prepared_value.is_empty() || data.justification_msg.is_some() {
                return Err(ValidationError::InvalidJustification(
                    "unprepared change round carries a prepared value",
                ));
            }
            return Ok(());
        }
        let justification = data
            .justification()
            .ok_or(ValidationError::InvalidJustification("justification is missing"))?;
        let j = &justification.message;
        if j.msg_type != MessageType::Prepare {
            return Err(ValidationError::InvalidJustification(
                "justification is not a prepare message",
            ));
        }
        if j.seq_number != msg.message.seq_number {
            return Err(ValidationError::InvalidJustification(
                "justification sequence is wrong",
            ));
        }
        if msg.message.round <= j.round {
            return Err(ValidationError::InvalidJustification(
                "justification round is not below the message round",
            ));
        }
        if data.prepared_round != j.round {
            return Err(ValidationError::InvalidJustification(
                "prepared round differs from justification round",
            ));
        }
        if j.lambda != msg.message.lambda {
            return Err(ValidationError::InvalidJustification(
                "justification lambda differs from message lambda",
            ));
        }
        if j.value != data.prepared_value {
            return Err(ValidationError::InvalidJustification(
                "justification value differs from prepared value",
            ));
        }
        if !has_quorum(justification.signer_ids.len(), share.committee_size()) {
            return Err(ValidationError::InvalidJustification(
                "justification has no quorum",
            ));
        }
        justification.verify(&share)
    })
}

pub fn validate_decided_quorum(share: Arc<Share>) -> BoxedPipeline {
    wrap_fn("decided quorum", move |msg| {
        let committee = share.committee_size();
        if !has_quorum(msg.signer_ids.len(), committee) {
            return Err(ValidationError::NoQuorum {
                signers: msg.signer_ids.len(),
                committee,
            });
        }
        Ok(())
    })
}
