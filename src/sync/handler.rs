use std::sync::Arc;

use tracing::{debug, warn};

use crate::consensus::{Identifier, SeqNumber, SignedMessage, Storage};
use crate::error::StorageError;
use crate::network::{SyncRequest, SyncResponse};

/// Server side of history sync for one identifier.
pub struct RequestHandler {
    identifier: Identifier,
    storage: Arc<dyn Storage>,
    max_page_size: usize,
}

impl RequestHandler {
    pub fn new(identifier: Identifier, storage: Arc<dyn Storage>, max_page_size: usize) -> Self {
        RequestHandler {
            identifier,
            storage,
            max_page_size: max_page_size.max(1),
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn handle(&self, request: SyncRequest) -> Result<SyncResponse, StorageError> {
        match request {
            SyncRequest::GetHighestDecided => self.handle_get_highest().map(SyncResponse::Highest),
            SyncRequest::GetDecidedRange { from, to } => self
                .handle_get_decided_range(from, to)
                .map(SyncResponse::Decided),
            SyncRequest::GetLastChangeRound { seq_number } => self
                .handle_get_last_change_round(seq_number)
                .map(SyncResponse::ChangeRound),
        }
    }

    /// `None` when nothing was decided yet; that is an answer, not an error.
    pub fn handle_get_highest(&self) -> Result<Option<SignedMessage>, StorageError> {
        self.storage.get_highest_decided(&self.identifier)
    }

    /// Stored decided messages in `[from, to]`, cut to the first `max_page_size` sequence
    /// numbers of the range.
    pub fn handle_get_decided_range(
        &self,
        from: SeqNumber,
        to: SeqNumber,
    ) -> Result<Vec<SignedMessage>, StorageError> {
        if from > to {
            warn!(identifier = %self.identifier, from, to, "invalid decided range request");
            return Ok(Vec::new());
        }
        let page_end = from.saturating_add(self.max_page_size as u64 - 1);
        let to = to.min(page_end);
        let msgs = self.storage.get_decided_range(&self.identifier, from, to)?;
        debug!(identifier = %self.identifier, from, to, count = msgs.len(), "serving decided range");
        Ok(msgs)
    }

    /// This node's latest change round message, if it was sent for `seq_number`.
    pub fn handle_get_last_change_round(
        &self,
        seq_number: SeqNumber,
    ) -> Result<Vec<SignedMessage>, StorageError> {
        Ok(self
            .storage
            .get_last_change_round(&self.identifier)?
            .filter(|msg| msg.message.seq_number == seq_number)
            .into_iter()
            .collect())
    }
}
