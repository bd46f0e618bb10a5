use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::config::SyncConfig;
use crate::consensus::{Fork, Identifier, PipelineContext, SeqNumber, Share, SignedMessage};
use crate::error::NetworkError;
use crate::network::Network;

/// Pulls peers' latest change round messages for a running sequence number.
pub struct ChangeRoundSpeedup {
    identifier: Identifier,
    seq_number: SeqNumber,
    share: Arc<Share>,
    fork: Fork,
    network: Arc<dyn Network>,
    config: SyncConfig,
}

impl ChangeRoundSpeedup {
    pub fn new(
        identifier: Identifier,
        seq_number: SeqNumber,
        share: Arc<Share>,
        fork: Fork,
        network: Arc<dyn Network>,
        config: SyncConfig,
    ) -> Self {
        ChangeRoundSpeedup {
            identifier,
            seq_number,
            share,
            fork,
            network,
            config,
        }
    }

    /// Valid change round messages from every peer that answered in time. Failures only cost
    /// that peer's messages.
    pub async fn fetch(&self, cancel: &CancellationToken) -> Vec<SignedMessage> {
        let mut peers = self.network.peers(&self.identifier);
        peers.truncate(self.config.max_fan_out);
        if peers.is_empty() {
            return Vec::new();
        }

        let requests = peers.iter().map(|peer| async move {
            let res = tokio::time::timeout(
                self.config.request_timeout(),
                self.network
                    .request_change_round_messages(peer, &self.identifier, self.seq_number),
            )
            .await
            .unwrap_or_else(|_| Err(NetworkError::Timeout(peer.clone())));
            (peer.clone(), res)
        });
        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Vec::new(),
            results = join_all(requests) => results,
        };

        let ctx = PipelineContext {
            share: self.share.clone(),
            lambda: self.identifier.clone(),
            seq_number: self.seq_number,
            round: 1,
        };
        let pipeline = self.fork.change_round_pipeline(&ctx, None);
        let mut out = Vec::new();
        for (peer, res) in results {
            match res {
                Ok(msgs) => {
                    for msg in msgs {
                        match pipeline.run(&msg) {
                            Ok(()) => out.push(msg),
                            Err(err) => {
                                warn!(identifier = %self.identifier, %peer, error = %err, "invalid change round from peer")
                            }
                        }
                    }
                }
                Err(err) => {
                    debug!(identifier = %self.identifier, %peer, error = %err, "could not get change round messages")
                }
            }
        }
        out
    }
}
