use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::Controller;
use crate::common::metrics::Metrics;
use crate::consensus::{Fork, Identifier, Share, SignedMessage, Storage};
use crate::error::{ControllerError, MessageError};

/// Single writer of the decided messages of one identifier.
pub(crate) struct DecidedHandler {
    identifier: Identifier,
    share: Arc<Share>,
    fork: Fork,
    storage: Arc<dyn Storage>,
    metrics: Arc<dyn Metrics>,
    write_lock: Mutex<()>,
}

impl DecidedHandler {
    pub(crate) fn new(
        identifier: Identifier,
        share: Arc<Share>,
        fork: Fork,
        storage: Arc<dyn Storage>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        DecidedHandler {
            identifier,
            share,
            fork,
            storage,
            metrics,
            write_lock: Mutex::new(()),
        }
    }

    pub(crate) fn fork(&self) -> Fork {
        self.fork
    }

    /// Stores a freshly decided message and moves the highest decided pointer to it.
    pub(crate) fn save(&self, msg: &SignedMessage) -> Result<(), ControllerError> {
        let _guard = self.write_lock.lock();
        self.storage.save_decided(msg)?;
        self.storage.save_highest_decided(msg)?;
        self.metrics
            .highest_decided(&self.identifier, msg.message.seq_number);
        Ok(())
    }

    /// Folds the signers of `msg` missing from the stored decided message into it. Returns
    /// whether the stored message changed. The decided value never changes.
    pub(crate) fn process_late_commit(&self, msg: &SignedMessage) -> Result<bool, ControllerError> {
        let seq = msg.message.seq_number;
        let _guard = self.write_lock.lock();
        let mut stored = self
            .storage
            .get_decided(&self.identifier, seq)?
            .ok_or(ControllerError::DecidedNotFound(seq))?;
        if stored.message.value != msg.message.value {
            return Err(ControllerError::DecidedValueMismatch);
        }
        if stored.message != msg.message {
            return Err(MessageError::MessageMismatch.into());
        }
        if stored.merge_new_signers(msg)? == 0 {
            return Ok(false);
        }

        self.storage.save_decided(&stored)?;
        let is_highest = self
            .storage
            .get_highest_decided(&self.identifier)?
            .is_some_and(|highest| highest.message.seq_number == seq);
        if is_highest {
            self.storage.save_highest_decided(&stored)?;
        }
        self.metrics
            .late_commit_upgraded(&self.identifier, stored.signer_ids.len());
        Ok(true)
    }

    pub(crate) fn validate_decided(&self, msg: &SignedMessage) -> Result<(), ControllerError> {
        self.fork
            .decided_pipeline(self.share.clone(), self.identifier.clone())
            .run(msg)?;
        Ok(())
    }
}

impl Controller {
    /// Handles a decided message broadcast by a peer.
    ///
    /// A decision for the running instance decides it; one for a sequence already stored is
    /// folded in like a late commit; one beyond the local highest means this node is behind and
    /// triggers a history sync.
    pub async fn process_decided_message(&self, msg: SignedMessage) -> Result<(), ControllerError> {
        self.decided.validate_decided(&msg)?;
        let seq = msg.message.seq_number;

        if let Some(instance) = self.current_instance() {
            if instance.seq_number() == seq {
                debug!(identifier = %self.identifier, seq, "decided message for the running instance");
                instance.force_decide(msg);
                return Ok(());
            }
        }

        if self.storage.get_decided(&self.identifier, seq)?.is_some() {
            if self.decided.process_late_commit(&msg)? {
                debug!(identifier = %self.identifier, seq, signers = %msg.signers_string(), "decided message was updated");
            }
            return Ok(());
        }

        let local_highest = self
            .storage
            .get_highest_decided(&self.identifier)?
            .map(|highest| highest.message.seq_number);
        if local_highest.is_some_and(|highest| highest >= seq) {
            return Ok(());
        }

        info!(identifier = %self.identifier, seq, ?local_highest, "decided message ahead of local history, syncing");
        if let Some(instance) = self.current_instance() {
            if instance.seq_number() < seq {
                instance.stop();
            }
        }
        self.history_sync().start(&self.cancel).await?;
        Ok(())
    }
}
