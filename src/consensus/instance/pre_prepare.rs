use tracing::{debug, info};

use super::InstanceCore;
use crate::consensus::message::{MessageType, Round, SignedMessage};
use crate::consensus::state::Stage;
use crate::error::{InstanceError, ValidationError};

impl InstanceCore {
    pub(super) async fn upon_pre_prepare(&mut self, msg: SignedMessage) -> Result<(), InstanceError> {
        let pipeline = self
            .fork
            .pre_prepare_pipeline(&self.ctx(), self.leader.clone());
        pipeline.run(&msg)?;

        let round = msg.message.round;
        if let Some(accepted) = self.accepted_proposals.get(&round) {
            if accepted.message.value != msg.message.value {
                return Err(ValidationError::ConflictingProposal(round).into());
            }
            return Ok(());
        }
        self.justify_pre_prepare(round, &msg.message.value)?;

        info!(
            identifier = %self.state.lambda,
            seq = self.state.seq_number,
            round,
            leader = msg.signer_ids[0],
            "accepted pre-prepare"
        );
        self.pre_prepare_msgs.add_message(&msg);
        self.accepted_proposals.insert(round, msg.clone());

        let jumped = round > self.state.round;
        if jumped {
            self.bump_round(round);
            self.timer.reset(round, self.config.timeout_for_round(round));
        }
        if jumped || matches!(self.state.stage, Stage::PrePrepare | Stage::ChangeRound) {
            self.set_stage(Stage::PrePrepare);
        }

        let prepare = self.new_message(MessageType::Prepare, round, msg.message.value);
        self.broadcast(prepare).await?;
        Ok(())
    }

    /// A proposal past round 1 must carry the highest value prepared by the change round
    /// quorum of its round, or anything when none of them prepared.
    pub(super) fn justify_pre_prepare(&self, round: Round, value: &[u8]) -> Result<(), ValidationError> {
        if round == 1 {
            return Ok(());
        }
        match self.justify_round_change(round)? {
            Some((_, prepared_value)) if prepared_value != value => {
                Err(ValidationError::PreparedValueMismatch)
            }
            _ => Ok(()),
        }
    }

    pub(super) async fn on_propose(&mut self, round: Round) -> Result<(), InstanceError> {
        if round != self.state.round || self.proposed_rounds.contains(&round) {
            debug!(identifier = %self.state.lambda, seq = self.state.seq_number, round, current = self.state.round, "skipping stale proposal");
            return Ok(());
        }
        let value = if round == 1 {
            self.state.input_value.clone()
        } else {
            match self.justify_round_change(round)? {
                Some((_, prepared_value)) => prepared_value,
                None => self.state.input_value.clone(),
            }
        };
        self.propose(round, value).await
    }

    pub(super) async fn propose(&mut self, round: Round, value: Vec<u8>) -> Result<(), InstanceError> {
        if !self.is_leader(round) || !self.proposed_rounds.insert(round) {
            return Ok(());
        }
        info!(identifier = %self.state.lambda, seq = self.state.seq_number, round, "broadcasting pre-prepare");
        let pre_prepare = self.new_message(MessageType::PrePrepare, round, value);
        self.broadcast(pre_prepare).await?;
        Ok(())
    }
}
