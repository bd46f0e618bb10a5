use tracing::{debug, info};

use super::InstanceCore;
use crate::consensus::message::{MessageType, SignedMessage};
use crate::consensus::state::Stage;
use crate::error::{InstanceError, MessageError};

impl InstanceCore {
    pub(super) async fn upon_prepare(&mut self, msg: SignedMessage) -> Result<(), InstanceError> {
        let round = self.state.round;
        let accepted = self
            .accepted_proposals
            .get(&round)
            .map(|pre_prepare| pre_prepare.message.value.clone());
        self.fork
            .prepare_pipeline(&self.ctx(), accepted)
            .run(&msg)?;

        if !self.prepare_msgs.add_message(&msg) {
            return Ok(());
        }
        let value = msg.message.value;
        let (quorum, signers, committee) = self.prepare_msgs.quorum_count(round, &value);
        debug!(identifier = %self.state.lambda, seq = self.state.seq_number, round, signers, committee, "prepare received");
        if !quorum || !self.commit_sent_rounds.insert(round) {
            return Ok(());
        }

        info!(identifier = %self.state.lambda, seq = self.state.seq_number, round, "prepared");
        self.state.prepared_round = round;
        self.state.prepared_value = value.clone();
        self.set_stage(Stage::Prepare);

        let commit = self.new_message(MessageType::Commit, round, value);
        self.broadcast(commit).await?;
        self.set_stage(Stage::Commit);
        Ok(())
    }

    /// The prepare quorum behind the prepared state, folded into one message.
    pub(super) fn prepared_aggregated_msg(&self) -> Result<Option<SignedMessage>, MessageError> {
        if !self.state.is_prepared() {
            return Ok(None);
        }
        aggregate_all(
            self.prepare_msgs
                .messages_for_value(self.state.prepared_round, &self.state.prepared_value),
        )
    }
}

/// Folds messages over the same content into one, keeping every distinct signer. Signers a
/// later message shares with the fold so far are skipped; its other signers are kept.
pub(super) fn aggregate_all(msgs: Vec<SignedMessage>) -> Result<Option<SignedMessage>, MessageError> {
    let mut iter = msgs.into_iter();
    let Some(mut aggregated) = iter.next() else {
        return Ok(None);
    };
    for msg in iter {
        aggregated.merge_new_signers(&msg)?;
    }
    Ok(Some(aggregated))
}
