mod change_round;
mod commit;
mod pre_prepare;
mod prepare;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::committee::Share;
use super::container::MessageContainer;
use super::fork::{Fork, PipelineContext};
use super::leader::LeaderSelector;
use super::message::{Identifier, Message, MessageType, Round, SeqNumber, SignedMessage};
use super::state::{Stage, State};
use super::store::Storage;
use super::timer::RoundTimer;
use crate::common::config::InstanceConfig;
use crate::common::crypto::Signer;
use crate::common::metrics::Metrics;
use crate::error::InstanceError;
use crate::network::{IndexKey, MessageQueue, Network};

/*
    An instance runs one sequence number. Everything that can change its state
    is an event on a single channel: messages pulled from the inbound queue,
    round timer expiries, delayed proposals, forced decisions and stop. One
    task consumes that channel, so the state machine itself needs no locks.
    Other tasks only read the snapshot published after every event.
*/

const PUMP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum InstanceEvent {
    Start(Vec<u8>),
    Message(SignedMessage),
    Timeout(Round),
    Propose(Round),
    ForceDecide(SignedMessage),
    Stop,
}

pub struct InstanceOptions {
    pub share: Arc<Share>,
    pub signer: Arc<dyn Signer>,
    pub lambda: Identifier,
    pub seq_number: SeqNumber,
    pub fork: Fork,
    pub config: InstanceConfig,
    pub network: Arc<dyn Network>,
    pub storage: Arc<dyn Storage>,
    pub queue: Arc<MessageQueue>,
    pub metrics: Arc<dyn Metrics>,
    /// Replaces the fork's leader selector.
    pub leader_selector: Option<Arc<dyn LeaderSelector>>,
}

#[derive(Debug)]
struct SharedState {
    state: RwLock<State>,
    decided: RwLock<Option<SignedMessage>>,
}

/// Handle to a running instance.
pub struct Instance {
    lambda: Identifier,
    seq_number: SeqNumber,
    shared: Arc<SharedState>,
    events: UnboundedSender<InstanceEvent>,
    pending: Mutex<Option<(InstanceCore, UnboundedReceiver<InstanceEvent>)>>,
    stage_rx: Mutex<Option<UnboundedReceiver<Stage>>>,
    queue: Arc<MessageQueue>,
    cancel: CancellationToken,
}

impl Instance {
    pub fn new(opts: InstanceOptions) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stage_tx, stage_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedState {
            state: RwLock::new(State::new(opts.lambda.clone(), opts.seq_number)),
            decided: RwLock::new(None),
        });
        let lambda = opts.lambda.clone();
        let seq_number = opts.seq_number;
        let queue = opts.queue.clone();
        let core = InstanceCore::new(opts, shared.clone(), events_tx.clone(), stage_tx);
        Instance {
            lambda,
            seq_number,
            shared,
            events: events_tx,
            pending: Mutex::new(Some((core, events_rx))),
            stage_rx: Mutex::new(Some(stage_rx)),
            queue,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawns the event loop and the message pump. Calling it again is a no-op.
    pub fn init(&self) {
        let Some((core, events_rx)) = self.pending.lock().take() else {
            return;
        };
        let cancel = self.cancel.clone();
        tokio::spawn(core.run(events_rx, cancel));
        tokio::spawn(pump_messages(
            self.queue.clone(),
            self.shared.clone(),
            self.events.clone(),
            self.cancel.clone(),
        ));
    }

    pub fn is_initialized(&self) -> bool {
        self.pending.lock().is_none()
    }

    pub fn start(&self, input_value: Vec<u8>) -> Result<(), InstanceError> {
        if !self.is_initialized() {
            return Err(InstanceError::NotInitialized);
        }
        if self.lambda.is_empty() {
            return Err(InstanceError::InvalidLambda);
        }
        if input_value.is_empty() {
            return Err(InstanceError::EmptyInput);
        }
        if self.stage() != Stage::NotStarted {
            return Err(InstanceError::AlreadyStarted);
        }
        info!(identifier = %self.lambda, seq = self.seq_number, "starting instance");
        self.send(InstanceEvent::Start(input_value));
        Ok(())
    }

    /// Queued behind every event already received.
    pub fn stop(&self) {
        self.send(InstanceEvent::Stop);
    }

    /// Hands the instance a quorum signed decision for its sequence number.
    pub fn force_decide(&self, msg: SignedMessage) {
        self.send(InstanceEvent::ForceDecide(msg));
    }

    fn send(&self, event: InstanceEvent) {
        if self.events.send(event).is_err() {
            debug!(identifier = %self.lambda, seq = self.seq_number, "instance event loop already finished");
        }
    }

    pub fn state(&self) -> State {
        self.shared.state.read().clone()
    }

    pub fn stage(&self) -> Stage {
        self.shared.state.read().stage
    }

    pub fn seq_number(&self) -> SeqNumber {
        self.seq_number
    }

    pub fn lambda(&self) -> &Identifier {
        &self.lambda
    }

    /// The aggregated commit the instance decided on.
    pub fn committed_aggregated_msg(&self) -> Result<SignedMessage, InstanceError> {
        self.shared
            .decided
            .read()
            .clone()
            .ok_or(InstanceError::NotDecided)
    }

    /// Stream of stage changes. Only the first caller gets it.
    pub fn take_stage_receiver(&self) -> Option<UnboundedReceiver<Stage>> {
        self.stage_rx.lock().take()
    }

    /// Whether the event loop has exited.
    pub fn is_finished(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Moves queued messages for the current round, then change rounds, into the event loop.
async fn pump_messages(
    queue: Arc<MessageQueue>,
    shared: Arc<SharedState>,
    events: UnboundedSender<InstanceEvent>,
    cancel: CancellationToken,
) {
    loop {
        let (lambda, seq, round, stage) = {
            let state = shared.state.read();
            (state.lambda.clone(), state.seq_number, state.round, state.stage)
        };
        if stage.is_terminal() {
            return;
        }
        if stage == Stage::NotStarted {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(PUMP_POLL) => continue,
            }
        }
        let keys = [
            IndexKey::change_round(&lambda, seq),
            IndexKey::round(&lambda, seq, round),
        ];
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = queue.wait_for(&keys, PUMP_POLL) => msg,
        };
        if let Some(msg) = msg {
            if let Err(mpsc::error::SendError(event)) = events.send(InstanceEvent::Message(msg)) {
                // The loop finished after this was popped; commits stay for the late listener.
                if let InstanceEvent::Message(msg) = event {
                    if msg.message.msg_type == MessageType::Commit {
                        queue.add_message(msg);
                    }
                }
                return;
            }
        }
    }
}

pub(crate) struct InstanceCore {
    share: Arc<Share>,
    signer: Arc<dyn Signer>,
    fork: Fork,
    config: InstanceConfig,
    network: Arc<dyn Network>,
    storage: Arc<dyn Storage>,
    queue: Arc<MessageQueue>,
    metrics: Arc<dyn Metrics>,
    leader: Arc<dyn LeaderSelector>,

    shared: Arc<SharedState>,
    state: State,

    pre_prepare_msgs: MessageContainer,
    prepare_msgs: MessageContainer,
    commit_msgs: MessageContainer,
    change_round_msgs: MessageContainer,

    accepted_proposals: HashMap<Round, SignedMessage>,
    proposed_rounds: HashSet<Round>,
    commit_sent_rounds: HashSet<Round>,
    round_change_handled: HashSet<Round>,

    timer: RoundTimer,
    events: UnboundedSender<InstanceEvent>,
    stage_tx: UnboundedSender<Stage>,
    stage_since: Instant,
}

impl InstanceCore {
    fn new(
        opts: InstanceOptions,
        shared: Arc<SharedState>,
        events: UnboundedSender<InstanceEvent>,
        stage_tx: UnboundedSender<Stage>,
    ) -> Self {
        let leader = opts.leader_selector.unwrap_or_else(|| {
            opts.fork
                .leader_selector(&opts.share, &opts.lambda, opts.seq_number)
        });
        let timer_events = events.clone();
        let timer = RoundTimer::new(move |round| {
            let _ = timer_events.send(InstanceEvent::Timeout(round));
        });
        let committee_size = opts.share.committee_size();
        let state = shared.state.read().clone();
        InstanceCore {
            share: opts.share,
            signer: opts.signer,
            fork: opts.fork,
            config: opts.config,
            network: opts.network,
            storage: opts.storage,
            queue: opts.queue,
            metrics: opts.metrics,
            leader,
            shared,
            state,
            pre_prepare_msgs: MessageContainer::new(committee_size),
            prepare_msgs: MessageContainer::new(committee_size),
            commit_msgs: MessageContainer::new(committee_size),
            change_round_msgs: MessageContainer::new(committee_size),
            accepted_proposals: HashMap::new(),
            proposed_rounds: HashSet::new(),
            commit_sent_rounds: HashSet::new(),
            round_change_handled: HashSet::new(),
            timer,
            events,
            stage_tx,
            stage_since: Instant::now(),
        }
    }

    async fn run(mut self, mut events: UnboundedReceiver<InstanceEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Err(err) = self.process_event(event).await {
                if err.is_fatal() {
                    error!(identifier = %self.state.lambda, seq = self.state.seq_number, error = %err, "fatal instance error, stopping");
                    self.set_stage(Stage::Stopped);
                } else {
                    debug!(identifier = %self.state.lambda, seq = self.state.seq_number, round = self.state.round, error = %err, "dropping event");
                }
            }
            if self.state.stage.is_terminal() {
                break;
            }
        }
        self.on_terminal(&mut events);
        cancel.cancel();
    }

    pub(crate) async fn process_event(&mut self, event: InstanceEvent) -> Result<(), InstanceError> {
        if self.state.stage.is_terminal() {
            return Ok(());
        }
        match event {
            InstanceEvent::Start(value) => self.on_start(value),
            InstanceEvent::Message(msg) => self.process_message(msg).await,
            InstanceEvent::Timeout(round) => self.upon_timeout(round).await,
            InstanceEvent::Propose(round) => self.on_propose(round).await,
            InstanceEvent::ForceDecide(msg) => self.force_decide(msg),
            InstanceEvent::Stop => {
                info!(identifier = %self.state.lambda, seq = self.state.seq_number, "stopping instance");
                self.set_stage(Stage::Stopped);
                Ok(())
            }
        }
    }

    async fn process_message(&mut self, msg: SignedMessage) -> Result<(), InstanceError> {
        match msg.message.msg_type {
            MessageType::PrePrepare => self.upon_pre_prepare(msg).await,
            MessageType::Prepare => self.upon_prepare(msg).await,
            MessageType::Commit => self.upon_commit(msg),
            MessageType::ChangeRound => self.upon_change_round(msg).await,
        }
    }

    fn on_start(&mut self, value: Vec<u8>) -> Result<(), InstanceError> {
        if self.state.stage != Stage::NotStarted {
            return Err(InstanceError::AlreadyStarted);
        }
        self.state.input_value = value;
        self.state.round = 1;
        self.leader.bump(1);
        self.set_stage(Stage::PrePrepare);
        self.metrics
            .current_sequence(&self.state.lambda, self.state.seq_number);

        if self.is_leader(1) {
            info!(identifier = %self.state.lambda, seq = self.state.seq_number, "leader for round 1");
            let delay = self.config.leader_pre_prepare_delay();
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(InstanceEvent::Propose(1));
            });
        }
        self.timer.reset(1, self.config.timeout_for_round(1));
        Ok(())
    }

    fn on_terminal(&mut self, events: &mut UnboundedReceiver<InstanceEvent>) {
        self.timer.stop();
        events.close();
        let lambda = self.state.lambda.clone();
        let seq = self.state.seq_number;
        let decided_round = self
            .shared
            .decided
            .read()
            .as_ref()
            .map(|msg| msg.message.round);
        let keep = decided_round.map(|round| IndexKey::round(&lambda, seq, round));
        let purged = self
            .queue
            .purge_where(|key| key.belongs_to(&lambda, seq) && Some(key) != keep.as_ref());

        // Commits that reached the loop but were not processed are still late commits.
        let mut requeued = 0;
        if let Some(round) = decided_round {
            while let Ok(event) = events.try_recv() {
                if let InstanceEvent::Message(msg) = event {
                    if msg.message.msg_type == MessageType::Commit && msg.message.round == round {
                        self.queue.add_message(msg);
                        requeued += 1;
                    }
                }
            }
        }
        debug!(identifier = %lambda, seq, purged, requeued, stage = ?self.state.stage, "instance finished");
    }

    fn ctx(&self) -> PipelineContext {
        PipelineContext {
            share: self.share.clone(),
            lambda: self.state.lambda.clone(),
            seq_number: self.state.seq_number,
            round: self.state.round,
        }
    }

    fn is_leader(&self, round: Round) -> bool {
        self.leader.is_leader(round, self.share.node_id)
    }

    fn set_stage(&mut self, stage: Stage) {
        if self.state.stage == stage {
            return;
        }
        let elapsed = self.stage_since.elapsed();
        self.metrics.stage_duration(self.state.stage, elapsed);
        self.stage_since = Instant::now();

        debug!(identifier = %self.state.lambda, seq = self.state.seq_number, round = self.state.round, from = ?self.state.stage, to = ?stage, "stage changed");
        self.state.stage = stage;
        if stage.is_terminal() {
            self.timer.stop();
        }
        self.publish();
        self.metrics.stage(&self.state.lambda, stage);
        let _ = self.stage_tx.send(stage);
    }

    fn bump_round(&mut self, round: Round) {
        self.state.round = round;
        self.leader.bump(round);
        self.metrics.round(&self.state.lambda, round);
        self.publish();
    }

    fn publish(&self) {
        *self.shared.state.write() = self.state.clone();
    }

    /// Signs and broadcasts a message of this instance. Signing failures are fatal, network
    /// failures only logged.
    async fn broadcast(&self, message: Message) -> Result<SignedMessage, InstanceError> {
        let msg_type = message.msg_type;
        let round = message.round;
        let signed = SignedMessage::sign(message, self.share.node_id, self.signer.as_ref())
            .map_err(InstanceError::Fatal)?;
        if let Err(err) = self.network.broadcast(&signed).await {
            warn!(identifier = %self.state.lambda, seq = self.state.seq_number, round, ?msg_type, error = %err, "could not broadcast message");
        }
        Ok(signed)
    }

    fn new_message(&self, msg_type: MessageType, round: Round, value: Vec<u8>) -> Message {
        Message::new(
            msg_type,
            round,
            self.state.lambda.clone(),
            self.state.seq_number,
            value,
        )
    }
}

#[cfg(test)]
mod tests;
