use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::config::SyncConfig;
use crate::common::metrics::Metrics;
use crate::consensus::{BoxedPipeline, Fork, Identifier, SeqNumber, Share, SignedMessage, Storage};
use crate::error::{NetworkError, SyncError};
use crate::network::{Network, PeerId};

/// Result of a range sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    pub from: SeqNumber,
    pub to: SeqNumber,
    /// Sequence numbers in `[from, to]`.
    pub requested: usize,
    /// Distinct sequence numbers actually validated and stored.
    pub saved: usize,
}

impl SyncOutcome {
    pub fn is_partial(&self) -> bool {
        self.saved < self.requested
    }
}

/// Client side of history sync for one identifier.
pub struct HistorySync {
    identifier: Identifier,
    share: Arc<Share>,
    fork: Fork,
    network: Arc<dyn Network>,
    storage: Arc<dyn Storage>,
    config: SyncConfig,
    metrics: Arc<dyn Metrics>,
}

impl HistorySync {
    pub fn new(
        identifier: Identifier,
        share: Arc<Share>,
        fork: Fork,
        network: Arc<dyn Network>,
        storage: Arc<dyn Storage>,
        config: SyncConfig,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        HistorySync {
            identifier,
            share,
            fork,
            network,
            storage,
            config,
            metrics,
        }
    }

    fn decided_pipeline(&self) -> BoxedPipeline {
        self.fork
            .decided_pipeline(self.share.clone(), self.identifier.clone())
    }

    /// Brings local storage up to the highest decided message known to peers. Returns `None`
    /// when there was nothing to sync.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<Option<SyncOutcome>, SyncError> {
        let Some((remote_highest, peer)) = self.find_highest_instance(cancel).await? else {
            info!(identifier = %self.identifier, "no peer has decided anything, nothing to sync");
            return Ok(None);
        };
        let remote_seq = remote_highest.message.seq_number;
        let local_seq = self
            .storage
            .get_highest_decided(&self.identifier)?
            .map(|msg| msg.message.seq_number);
        if local_seq.is_some_and(|local| local >= remote_seq) {
            debug!(identifier = %self.identifier, remote_seq, "local history is up to date");
            return Ok(None);
        }

        let from = local_seq.map_or(0, |local| local + 1);
        info!(identifier = %self.identifier, %peer, from, to = remote_seq, "syncing decided history");
        let outcome = self
            .fetch_validate_and_save_instances(&peer, from, remote_seq, cancel)
            .await?;

        self.storage.save_decided(&remote_highest)?;
        self.storage.save_highest_decided(&remote_highest)?;
        self.metrics.highest_decided(&self.identifier, remote_seq);
        Ok(Some(outcome))
    }

    /// Asks up to `max_fan_out` peers for their highest decided message. Returns the valid
    /// response with the greatest sequence number (the first one on ties) and who sent it.
    pub async fn find_highest_instance(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<(SignedMessage, PeerId)>, SyncError> {
        let mut peers = self.network.peers(&self.identifier);
        peers.truncate(self.config.max_fan_out);
        if peers.is_empty() {
            return Err(SyncError::NoPeersResponded);
        }

        let requests = peers.iter().map(|peer| async move {
            let res = tokio::time::timeout(
                self.config.request_timeout(),
                self.network.request_highest_decided(peer, &self.identifier),
            )
            .await
            .unwrap_or_else(|_| Err(NetworkError::Timeout(peer.clone())));
            (peer.clone(), res)
        });
        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            results = join_all(requests) => results,
        };

        let pipeline = self.decided_pipeline();
        let mut responded = false;
        let mut best: Option<(SignedMessage, PeerId)> = None;
        for (peer, res) in results {
            match res {
                Ok(None) => responded = true,
                Ok(Some(msg)) => {
                    if let Err(err) = pipeline.run(&msg) {
                        warn!(identifier = %self.identifier, %peer, error = %err, "invalid highest decided from peer");
                        continue;
                    }
                    responded = true;
                    let higher = best
                        .as_ref()
                        .map_or(true, |(b, _)| msg.message.seq_number > b.message.seq_number);
                    if higher {
                        best = Some((msg, peer));
                    }
                }
                Err(err) => {
                    warn!(identifier = %self.identifier, %peer, error = %err, "could not get highest decided from peer");
                }
            }
        }

        if !responded {
            return Err(SyncError::NoPeersResponded);
        }
        Ok(best)
    }

    /// Fetches `[from, to]` from `peer` page by page. Each page is validated and then stored in
    /// one batch. A page is retried `batch_retries` times before the sync fails.
    pub async fn fetch_validate_and_save_instances(
        &self,
        peer: &PeerId,
        from: SeqNumber,
        to: SeqNumber,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, SyncError> {
        let pipeline = self.decided_pipeline();
        let mut saved: BTreeSet<SeqNumber> = BTreeSet::new();
        let mut next = from;

        while next <= to {
            let batch = self.fetch_page(peer, next, to, cancel).await?;

            let mut valid = Vec::with_capacity(batch.len());
            for msg in batch {
                let seq = msg.message.seq_number;
                if seq < next || seq > to || saved.contains(&seq) {
                    continue;
                }
                if let Err(err) = pipeline.run(&msg) {
                    warn!(identifier = %self.identifier, %peer, seq, error = %err, "dropping invalid decided message");
                    continue;
                }
                saved.insert(seq);
                valid.push(msg);
            }
            let Some(last) = valid.iter().map(|m| m.message.seq_number).max() else {
                debug!(identifier = %self.identifier, %peer, next, to, "peer has no more decided messages");
                break;
            };
            self.storage.save_decided_batch(&valid)?;
            debug!(identifier = %self.identifier, count = valid.len(), last, to, "saved decided batch");
            next = last + 1;
        }

        let outcome = SyncOutcome {
            from,
            to,
            requested: if to >= from { (to - from + 1) as usize } else { 0 },
            saved: saved.len(),
        };
        if outcome.is_partial() {
            warn!(
                identifier = %self.identifier,
                from,
                to,
                requested = outcome.requested,
                saved = outcome.saved,
                "not all messages in range were saved"
            );
            self.metrics
                .sync_partial(&self.identifier, outcome.requested, outcome.saved);
        }
        self.metrics.sync_completed(&self.identifier, outcome.saved);
        Ok(outcome)
    }

    async fn fetch_page(
        &self,
        peer: &PeerId,
        from: SeqNumber,
        to: SeqNumber,
        cancel: &CancellationToken,
    ) -> Result<Vec<SignedMessage>, SyncError> {
        let attempts = self.config.batch_retries + 1;
        for attempt in 1..=attempts {
            let request = tokio::time::timeout(
                self.config.request_timeout(),
                self.network
                    .request_decided_range(peer, &self.identifier, from, to),
            );
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                res = request => res.unwrap_or_else(|_| Err(NetworkError::Timeout(peer.clone()))),
            };
            match res {
                Ok(msgs) => return Ok(msgs),
                Err(err) => {
                    warn!(identifier = %self.identifier, %peer, from, to, attempt, error = %err, "decided range request failed");
                }
            }
        }
        Err(SyncError::SyncFailed {
            peer: peer.clone(),
            from,
            to,
            attempts,
        })
    }
}
