use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Controller, DecidedHandler, InstanceResult};
use crate::consensus::{
    Identifier, Instance, InstanceOptions, MessageType, PipelineContext, Round, SeqNumber, Stage,
};
use crate::error::ControllerError;
use crate::network::{IndexKey, MessageQueue};
use crate::sync::ChangeRoundSpeedup;

const LATE_COMMIT_POLL: Duration = Duration::from_millis(100);

impl Controller {
    /// Runs an instance without checking whether it may start.
    pub(super) async fn start_instance_with_options(
        &self,
        seq_number: SeqNumber,
        value: Vec<u8>,
    ) -> Result<InstanceResult, ControllerError> {
        let purged = self
            .queue
            .purge_where(|key| key.seq_number() < seq_number);
        if purged > 0 {
            debug!(identifier = %self.identifier, seq = seq_number, purged, "purged messages of older sequences");
        }

        let instance = Arc::new(Instance::new(InstanceOptions {
            share: self.share.clone(),
            signer: self.signer.clone(),
            lambda: self.identifier.clone(),
            seq_number,
            fork: self.fork,
            config: self.config.instance.clone(),
            network: self.network.clone(),
            storage: self.storage.clone(),
            queue: self.queue.clone(),
            metrics: self.metrics.clone(),
            leader_selector: None,
        }));
        {
            let mut current = self.current.lock();
            if current.is_some() {
                return Err(ControllerError::AlreadyRunning);
            }
            *current = Some(instance.clone());
        }

        let result = self.run_instance(&instance, value).await;
        *self.current.lock() = None;
        debug!(identifier = %self.identifier, seq = seq_number, decided = result.as_ref().is_ok_and(|r| r.decided), "instance loop finished");
        result
    }

    async fn run_instance(
        &self,
        instance: &Arc<Instance>,
        value: Vec<u8>,
    ) -> Result<InstanceResult, ControllerError> {
        instance.init();
        let Some(mut stages) = instance.take_stage_receiver() else {
            return Err(ControllerError::NotInitialized);
        };
        instance.start(value)?;

        let speedup_cancel = self.cancel.child_token();
        self.spawn_change_round_catchup(instance.seq_number(), speedup_cancel.clone());
        let _speedup_guard = speedup_cancel.drop_guard();

        while let Some(stage) = stages.recv().await {
            match stage {
                Stage::Prepare => {
                    if let Err(err) = self
                        .storage
                        .save_current_instance(&self.identifier, &instance.state())
                    {
                        warn!(identifier = %self.identifier, seq = instance.seq_number(), error = %err, "could not save prepared instance state");
                    }
                }
                Stage::Decided => return self.on_decided(instance).await,
                Stage::Stopped => {
                    info!(identifier = %self.identifier, seq = instance.seq_number(), "instance stopped");
                    return Ok(InstanceResult {
                        decided: false,
                        msg: None,
                    });
                }
                _ => {}
            }
        }
        Ok(InstanceResult {
            decided: false,
            msg: None,
        })
    }

    async fn on_decided(&self, instance: &Instance) -> Result<InstanceResult, ControllerError> {
        let seq = instance.seq_number();
        let agg = instance.committed_aggregated_msg()?;
        self.decided.save(&agg)?;

        if let Err(err) = self.network.broadcast_decided(&agg).await {
            warn!(identifier = %self.identifier, seq, error = %err, "could not broadcast decided message");
        }
        info!(identifier = %self.identifier, seq, signers = %agg.signers_string(), "decided current instance");

        self.spawn_late_commit_listener(seq, agg.message.round);

        let stored = self
            .storage
            .get_decided(&self.identifier, seq)?
            .ok_or(ControllerError::DecidedNotFound(seq))?;
        Ok(InstanceResult {
            decided: true,
            msg: Some(stored),
        })
    }

    /// Pulls peers' change round messages into the queue so a node that fell behind does not
    /// have to wait for its own timer.
    fn spawn_change_round_catchup(&self, seq_number: SeqNumber, cancel: CancellationToken) {
        let speedup = ChangeRoundSpeedup::new(
            self.identifier.clone(),
            seq_number,
            self.share.clone(),
            self.fork,
            self.network.clone(),
            self.config.sync.clone(),
        );
        let queue = self.queue.clone();
        let identifier = self.identifier.clone();
        tokio::spawn(async move {
            let msgs = speedup.fetch(&cancel).await;
            let found = msgs.len();
            for msg in msgs {
                queue.add_message(msg);
            }
            debug!(%identifier, seq = seq_number, found, "change round catch-up finished");
        });
    }

    /// Keeps folding commits of the decided round into the stored decided message for a while
    /// after the instance finished.
    fn spawn_late_commit_listener(&self, seq_number: SeqNumber, round: Round) {
        let listener = LateCommitListener {
            identifier: self.identifier.clone(),
            seq_number,
            round,
            queue: self.queue.clone(),
            decided: self.decided.clone(),
            ctx: PipelineContext {
                share: self.share.clone(),
                lambda: self.identifier.clone(),
                seq_number,
                round,
            },
        };
        let duration = self.config.late_commit_listen();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            debug!(identifier = %listener.identifier, seq = seq_number, "listening for late commits");
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(duration) => {}
                _ = listener.run() => {}
            }
            debug!(identifier = %listener.identifier, seq = seq_number, "stopped listening for late commits");
        });
    }
}

struct LateCommitListener {
    identifier: Identifier,
    seq_number: SeqNumber,
    round: Round,
    queue: Arc<MessageQueue>,
    decided: Arc<DecidedHandler>,
    ctx: PipelineContext,
}

impl LateCommitListener {
    async fn run(&self) {
        let keys = [IndexKey::round(&self.identifier, self.seq_number, self.round)];
        let pipeline = self.decided.fork().commit_pipeline(&self.ctx, None, None);
        loop {
            let Some(msg) = self.queue.wait_for(&keys, LATE_COMMIT_POLL).await else {
                continue;
            };
            if msg.message.msg_type != MessageType::Commit {
                continue;
            }
            if let Err(err) = pipeline.run(&msg) {
                warn!(identifier = %self.identifier, seq = self.seq_number, error = %err, "received invalid late commit");
                continue;
            }
            match self.decided.process_late_commit(&msg) {
                Ok(true) => debug!(identifier = %self.identifier, seq = self.seq_number, signer = %msg.signers_string(), "decided message was updated"),
                Ok(false) => {}
                Err(err) => {
                    error!(identifier = %self.identifier, seq = self.seq_number, error = %err, "failed to process late commit")
                }
            }
        }
    }
}
