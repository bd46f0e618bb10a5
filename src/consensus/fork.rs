use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::committee::Share;
use super::leader::{DeterministicLeader, LeaderSelector, RoundRobinLeader};
use super::message::{Identifier, MessageType, Round, SeqNumber};
use super::pipeline::{
    authorize_msg, basic_msg_validation, combine, msg_type_check, validate_change_round_justification,
    validate_decided_quorum, validate_lambdas, validate_min_round, validate_pre_prepare_leader,
    validate_prepare_matches_proposal, validate_round, validate_sequence_number,
    validate_single_signer, BoxedPipeline,
};

/// Protocol version of an identifier, fixed when its controller is created.
///
/// `V0` rotates leaders round robin, takes round 1 votes without a proposal and only accepts
/// pre-prepares for the current round. `V1` picks leaders by hash, requires an accepted proposal
/// behind every prepare and commit, and accepts justified pre-prepares for later rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Fork {
    #[default]
    V0,
    V1,
}

/// What the pipelines of one instance check against.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub share: Arc<Share>,
    pub lambda: Identifier,
    pub seq_number: SeqNumber,
    pub round: Round,
}

impl Fork {
    pub fn name(&self) -> &'static str {
        match self {
            Fork::V0 => "v0",
            Fork::V1 => "v1",
        }
    }

    pub fn leader_selector(
        &self,
        share: &Share,
        identifier: &Identifier,
        seq_number: SeqNumber,
    ) -> Arc<dyn LeaderSelector> {
        match self {
            Fork::V0 => Arc::new(RoundRobinLeader::new(share.member_ids(), seq_number)),
            Fork::V1 => Arc::new(DeterministicLeader::new(
                share.member_ids(),
                identifier,
                seq_number,
            )),
        }
    }

    /// Whether a pre-prepare for a round above the current one may be accepted.
    pub fn accepts_future_pre_prepare(&self) -> bool {
        matches!(self, Fork::V1)
    }

    pub fn pre_prepare_pipeline(
        &self,
        ctx: &PipelineContext,
        selector: Arc<dyn LeaderSelector>,
    ) -> BoxedPipeline {
        let round_check = match self {
            Fork::V0 => validate_round(ctx.round),
            Fork::V1 => validate_min_round(ctx.round),
        };
        combine(vec![
            basic_msg_validation(),
            msg_type_check(MessageType::PrePrepare),
            validate_lambdas(ctx.lambda.clone()),
            round_check,
            validate_sequence_number(ctx.seq_number),
            validate_single_signer(),
            authorize_msg(ctx.share.clone()),
            validate_pre_prepare_leader(selector),
        ])
    }

    pub fn prepare_pipeline(&self, ctx: &PipelineContext, accepted: Option<Vec<u8>>) -> BoxedPipeline {
        combine(vec![
            basic_msg_validation(),
            msg_type_check(MessageType::Prepare),
            validate_lambdas(ctx.lambda.clone()),
            validate_round(ctx.round),
            validate_sequence_number(ctx.seq_number),
            validate_prepare_matches_proposal(accepted, matches!(self, Fork::V0)),
            validate_single_signer(),
            authorize_msg(ctx.share.clone()),
        ])
    }

    /// `round` is `None` when commits of any round are wanted, as for late commits.
    pub fn commit_pipeline(
        &self,
        ctx: &PipelineContext,
        round: Option<Round>,
        accepted: Option<Vec<u8>>,
    ) -> BoxedPipeline {
        let mut checks = vec![
            basic_msg_validation(),
            msg_type_check(MessageType::Commit),
            validate_lambdas(ctx.lambda.clone()),
            validate_sequence_number(ctx.seq_number),
        ];
        if let Some(round) = round {
            checks.push(validate_round(round));
            if matches!(self, Fork::V1) {
                checks.push(validate_prepare_matches_proposal(accepted, false));
            }
        }
        checks.push(authorize_msg(ctx.share.clone()));
        combine(checks)
    }

    /// `min_round` drops change rounds below the instance round; `None` keeps every round, as
    /// when serving or fetching them for catch-up.
    pub fn change_round_pipeline(&self, ctx: &PipelineContext, min_round: Option<Round>) -> BoxedPipeline {
        let mut checks = vec![
            basic_msg_validation(),
            msg_type_check(MessageType::ChangeRound),
            validate_lambdas(ctx.lambda.clone()),
            validate_sequence_number(ctx.seq_number),
        ];
        if let Some(round) = min_round {
            checks.push(validate_min_round(round));
        }
        checks.push(validate_single_signer());
        checks.push(authorize_msg(ctx.share.clone()));
        checks.push(validate_change_round_justification(ctx.share.clone()));
        combine(checks)
    }

    /// Decided messages are checked without an instance, so the sequence number is free.
    pub fn decided_pipeline(&self, share: Arc<Share>, lambda: Identifier) -> BoxedPipeline {
        combine(vec![
            basic_msg_validation(),
            msg_type_check(MessageType::Commit),
            validate_lambdas(lambda),
            validate_decided_quorum(share.clone()),
            authorize_msg(share),
        ])
    }
}
