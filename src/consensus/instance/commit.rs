use tracing::{debug, info};

use super::prepare::aggregate_all;
use super::InstanceCore;
use crate::consensus::message::{Round, SignedMessage};
use crate::consensus::pipeline::{combine, validate_sequence_number};
use crate::consensus::qc::validate_decided;
use crate::consensus::state::Stage;
use crate::error::InstanceError;

impl InstanceCore {
    pub(super) fn upon_commit(&mut self, msg: SignedMessage) -> Result<(), InstanceError> {
        let round = self.state.round;
        let accepted = self
            .accepted_proposals
            .get(&round)
            .map(|pre_prepare| pre_prepare.message.value.clone());
        self.fork
            .commit_pipeline(&self.ctx(), Some(round), accepted)
            .run(&msg)?;

        if !self.commit_msgs.add_message(&msg) {
            return Ok(());
        }
        let (quorum, signers, committee) = self.commit_msgs.quorum_count(round, &msg.message.value);
        debug!(identifier = %self.state.lambda, seq = self.state.seq_number, round, signers, committee, "commit received");
        if !quorum {
            return Ok(());
        }

        let decided = self.committed_aggregated_msg(round, &msg.message.value)?;
        info!(
            identifier = %self.state.lambda,
            seq = self.state.seq_number,
            round,
            signers = %decided.signers_string(),
            "decided"
        );
        self.decide(decided);
        Ok(())
    }

    /// Aggregation of every commit of `round` carrying `value`. Fails unless the result is a
    /// valid decided message.
    pub(super) fn committed_aggregated_msg(
        &self,
        round: Round,
        value: &[u8],
    ) -> Result<SignedMessage, InstanceError> {
        let aggregated = aggregate_all(self.commit_msgs.messages_for_value(round, value))?
            .ok_or(InstanceError::NoCommitMessages)?;
        validate_decided(&self.share, &self.state.lambda, &aggregated)?;
        Ok(aggregated)
    }

    /// Takes a decision reached without this instance, such as one learned from a peer.
    pub(super) fn force_decide(&mut self, msg: SignedMessage) -> Result<(), InstanceError> {
        combine(vec![
            self.fork
                .decided_pipeline(self.share.clone(), self.state.lambda.clone()),
            validate_sequence_number(self.state.seq_number),
        ])
        .run(&msg)?;

        // Commits this instance already holds for the decision are part of it.
        let mut decided = msg;
        let held = self
            .commit_msgs
            .messages_for_value(decided.message.round, &decided.message.value);
        for commit in &held {
            if commit.message == decided.message {
                decided.merge_new_signers(commit)?;
            }
        }
        info!(identifier = %self.state.lambda, seq = self.state.seq_number, signers = %decided.signers_string(), "forced decision");
        self.decide(decided);
        Ok(())
    }

    fn decide(&mut self, decided: SignedMessage) {
        self.metrics
            .decided_signers(&self.state.lambda, self.state.seq_number, decided.signer_ids.len());
        *self.shared.decided.write() = Some(decided);
        self.timer.stop();
        self.set_stage(Stage::Decided);
    }
}
