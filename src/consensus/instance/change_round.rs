use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::InstanceCore;
use crate::consensus::message::{ChangeRoundData, Message, Round, SignedMessage};
use crate::consensus::pipeline::validate_change_round_justification;
use crate::consensus::qc::has_partial_quorum;
use crate::consensus::state::Stage;
use crate::error::{InstanceError, ValidationError};

impl InstanceCore {
    pub(super) async fn upon_timeout(&mut self, round: Round) -> Result<(), InstanceError> {
        if round != self.state.round {
            debug!(identifier = %self.state.lambda, seq = self.state.seq_number, round, current = self.state.round, "ignoring stale round timeout");
            return Ok(());
        }
        let next = round + 1;
        info!(identifier = %self.state.lambda, seq = self.state.seq_number, round, next, "round timed out");
        self.move_to_round(next).await
    }

    /// Enters `round` through a round change and announces it.
    async fn move_to_round(&mut self, round: Round) -> Result<(), InstanceError> {
        self.bump_round(round);
        self.set_stage(Stage::ChangeRound);
        self.timer.reset(round, self.config.timeout_for_round(round));
        self.broadcast_change_round().await
    }

    async fn broadcast_change_round(&mut self) -> Result<(), InstanceError> {
        let data = match self.prepared_aggregated_msg()? {
            Some(justification) => ChangeRoundData::prepared(justification),
            None => ChangeRoundData::not_prepared(),
        };
        let msg = Message::change_round(
            self.state.round,
            self.state.lambda.clone(),
            self.state.seq_number,
            data,
        );
        let signed = self.broadcast(msg).await?;
        if let Err(err) = self.storage.save_last_change_round(&signed) {
            warn!(identifier = %self.state.lambda, seq = self.state.seq_number, error = %err, "could not save change round message");
        }
        Ok(())
    }

    pub(super) async fn upon_change_round(&mut self, msg: SignedMessage) -> Result<(), InstanceError> {
        self.fork
            .change_round_pipeline(&self.ctx(), Some(self.state.round))
            .run(&msg)?;
        if !self.change_round_msgs.add_message(&msg) {
            return Ok(());
        }
        debug!(
            identifier = %self.state.lambda,
            seq = self.state.seq_number,
            round = msg.message.round,
            signer = msg.signer_ids[0],
            "change round received"
        );

        self.upon_partial_quorum().await?;
        self.try_round_change(msg.message.round).await
    }

    /// F + 1 members asking for later rounds include an honest one, so this node follows to
    /// the lowest of those rounds instead of waiting for its own timer.
    async fn upon_partial_quorum(&mut self) -> Result<(), InstanceError> {
        let above = self.change_round_msgs.signers_above(self.state.round);
        let signers: BTreeSet<_> = above.values().flatten().copied().collect();
        if !has_partial_quorum(signers.len(), &self.share) {
            return Ok(());
        }
        let Some(lowest) = above.keys().next().copied() else {
            return Ok(());
        };
        info!(identifier = %self.state.lambda, seq = self.state.seq_number, from = self.state.round, to = lowest, "partial change round quorum, skipping ahead");
        self.move_to_round(lowest).await?;
        self.try_round_change(lowest).await
    }

    /// Acts on a change round quorum for `round` once: the instance enters it and its leader
    /// proposes.
    async fn try_round_change(&mut self, round: Round) -> Result<(), InstanceError> {
        if round < self.state.round || self.round_change_handled.contains(&round) {
            return Ok(());
        }
        let highest = match self.justify_round_change(round) {
            Ok(highest) => highest,
            Err(ValidationError::NoChangeRoundQuorum) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        self.round_change_handled.insert(round);
        info!(identifier = %self.state.lambda, seq = self.state.seq_number, round, prepared = highest.is_some(), "change round quorum");

        if round > self.state.round {
            self.bump_round(round);
            self.set_stage(Stage::ChangeRound);
            self.timer.reset(round, self.config.timeout_for_round(round));
        }
        if self.is_leader(round) {
            let value = match highest {
                Some((_, prepared_value)) => prepared_value,
                None => self.state.input_value.clone(),
            };
            self.propose(round, value).await?;
        }
        Ok(())
    }

    /// With a change round quorum for `round`, the highest prepared round and value it
    /// reports, if any member prepared.
    pub(super) fn justify_round_change(
        &self,
        round: Round,
    ) -> Result<Option<(Round, Vec<u8>)>, ValidationError> {
        let (quorum, _) = self.change_round_msgs.round_quorum(round);
        if !quorum {
            return Err(ValidationError::NoChangeRoundQuorum);
        }
        let msgs = self.change_round_msgs.read_only_messages_by_round(round);
        let highest = msgs
            .values()
            .filter(|msg| {
                msg.message
                    .change_round
                    .as_ref()
                    .is_some_and(ChangeRoundData::is_prepared)
            })
            .max_by_key(|msg| {
                msg.message
                    .change_round
                    .as_ref()
                    .map_or(0, |data| data.prepared_round)
            });
        let Some(highest) = highest else {
            return Ok(None);
        };
        validate_change_round_justification(self.share.clone())
            .run(highest)
            .map_err(|_| ValidationError::UnjustifiedChangeRound)?;
        Ok(highest
            .message
            .change_round
            .as_ref()
            .map(|data| (data.prepared_round, data.prepared_value.clone())))
    }
}
