mod decided;
mod running_instance;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::config::ControllerConfig;
use crate::common::crypto::Signer;
use crate::common::metrics::Metrics;
use crate::consensus::{
    Fork, Identifier, Instance, SeqNumber, Share, ShareProvider, SignedMessage, Storage,
};
use crate::error::{ControllerError, SyncError};
use crate::network::{Inbound, MessageQueue, Network};
use crate::sync::{HistorySync, RequestHandler};

pub(crate) use decided::DecidedHandler;

/*
    A controller owns one identifier, i.e. one (validator, duty role) pair, and
    runs its instances strictly one after the other. Sequence numbers follow the
    highest decided message in storage, so a node that missed decisions must
    sync history before it can start the next instance.
*/

pub struct ControllerOptions {
    pub identifier: Identifier,
    pub share: Arc<Share>,
    pub signer: Arc<dyn Signer>,
    pub network: Arc<dyn Network>,
    pub storage: Arc<dyn Storage>,
    pub metrics: Arc<dyn Metrics>,
    pub config: ControllerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartInstanceOptions {
    pub seq_number: SeqNumber,
    pub value: Vec<u8>,
    /// Wait until the network reports enough peers for the identifier before starting.
    pub require_min_peers: bool,
}

/// What a finished instance produced. `msg` is the stored decided message when `decided`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceResult {
    pub decided: bool,
    pub msg: Option<SignedMessage>,
}

pub struct Controller {
    identifier: Identifier,
    share: Arc<Share>,
    signer: Arc<dyn Signer>,
    fork: Fork,
    config: ControllerConfig,
    network: Arc<dyn Network>,
    storage: Arc<dyn Storage>,
    metrics: Arc<dyn Metrics>,
    queue: Arc<MessageQueue>,
    decided: Arc<DecidedHandler>,
    current: Mutex<Option<Arc<Instance>>>,
    initialized: AtomicBool,
    cancel: CancellationToken,
}

impl Controller {
    pub fn new(opts: ControllerOptions) -> Self {
        let fork = opts.config.fork;
        let decided = Arc::new(DecidedHandler::new(
            opts.identifier.clone(),
            opts.share.clone(),
            fork,
            opts.storage.clone(),
            opts.metrics.clone(),
        ));
        Controller {
            identifier: opts.identifier,
            share: opts.share,
            signer: opts.signer,
            fork,
            config: opts.config,
            network: opts.network,
            storage: opts.storage,
            metrics: opts.metrics,
            queue: Arc::new(MessageQueue::new()),
            decided,
            current: Mutex::new(None),
            initialized: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Looks up the committee of `validator_pubkey` for this node.
    pub fn load_share(
        provider: &dyn ShareProvider,
        validator_pubkey: &[u8],
    ) -> Result<Arc<Share>, ControllerError> {
        provider
            .get_share(validator_pubkey)?
            .map(Arc::new)
            .ok_or_else(|| ControllerError::ShareNotFound(hex::encode(validator_pubkey)))
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn share(&self) -> &Arc<Share> {
        &self.share
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Serves this node's decided history to peers.
    pub fn request_handler(&self) -> Arc<RequestHandler> {
        Arc::new(RequestHandler::new(
            self.identifier.clone(),
            self.storage.clone(),
            self.config.sync.max_page_size,
        ))
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Syncs decided history from peers. Instances can only start after this succeeded once.
    pub async fn init(&self) -> Result<(), ControllerError> {
        if self.is_initialized() {
            return Ok(());
        }
        self.config.validate()?;
        match self.history_sync().start(&self.cancel).await {
            Ok(Some(outcome)) => {
                info!(identifier = %self.identifier, from = outcome.from, to = outcome.to, saved = outcome.saved, "history synced")
            }
            Ok(None) => debug!(identifier = %self.identifier, "history already up to date"),
            Err(SyncError::NoPeersResponded) => {
                warn!(identifier = %self.identifier, "no peers responded to history sync, starting from local state")
            }
            Err(err) => return Err(err.into()),
        }
        self.initialized.store(true, Ordering::Release);
        info!(identifier = %self.identifier, fork = self.fork.name(), "controller initialized");
        Ok(())
    }

    fn history_sync(&self) -> HistorySync {
        HistorySync::new(
            self.identifier.clone(),
            self.share.clone(),
            self.fork,
            self.network.clone(),
            self.storage.clone(),
            self.config.sync.clone(),
            self.metrics.clone(),
        )
    }

    /// The sequence number the next instance must run: one past the highest decided, or 0.
    pub fn next_seq_number(&self) -> Result<SeqNumber, ControllerError> {
        Ok(self
            .storage
            .get_highest_decided(&self.identifier)?
            .map_or(0, |msg| msg.message.seq_number + 1))
    }

    /// Runs one instance to completion.
    pub async fn start_instance(
        &self,
        opts: StartInstanceOptions,
    ) -> Result<InstanceResult, ControllerError> {
        if !self.is_initialized() {
            return Err(ControllerError::NotInitialized);
        }
        if self.current.lock().is_some() {
            return Err(ControllerError::AlreadyRunning);
        }
        let expected = self.next_seq_number()?;
        if opts.seq_number != expected {
            return Err(ControllerError::SequenceInvalid {
                expected,
                actual: opts.seq_number,
            });
        }
        if opts.require_min_peers {
            self.wait_for_min_peers().await?;
        }
        self.start_instance_with_options(opts.seq_number, opts.value)
            .await
    }

    async fn wait_for_min_peers(&self) -> Result<(), ControllerError> {
        loop {
            let peers = self.network.peers(&self.identifier).len();
            if peers >= self.config.min_peers {
                debug!(identifier = %self.identifier, peers, "found enough peers");
                return Ok(());
            }
            debug!(identifier = %self.identifier, peers, min = self.config.min_peers, "waiting for peers");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ControllerError::NotInitialized),
                _ = tokio::time::sleep(self.config.min_peers_poll()) => {}
            }
        }
    }

    /// The instance currently running, if any.
    pub fn current_instance(&self) -> Option<Arc<Instance>> {
        self.current.lock().clone()
    }

    pub fn stop_current_instance(&self) {
        if let Some(instance) = self.current_instance() {
            instance.stop();
        }
    }

    /// Routes what the network delivers: consensus messages for this identifier go to the
    /// queue, decided messages are processed right away.
    pub fn listen(self: &Arc<Self>, mut inbound: UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = controller.cancel.cancelled() => break,
                    msg = inbound.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                match msg {
                    Inbound::Consensus(msg) if msg.message.lambda == controller.identifier => {
                        controller.queue.add_message(msg);
                    }
                    Inbound::Decided(msg) if msg.message.lambda == controller.identifier => {
                        if let Err(err) = controller.process_decided_message(msg).await {
                            debug!(identifier = %controller.identifier, error = %err, "dropping decided message");
                        }
                    }
                    _ => {}
                }
            }
            debug!(identifier = %controller.identifier, "controller stopped listening");
        })
    }

    /// Stops the running instance and every background task of this controller.
    pub fn shutdown(&self) {
        self.stop_current_instance();
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests;
