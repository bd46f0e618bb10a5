use std::sync::Arc;

use tokio::sync::mpsc;

use super::*;
use crate::common::crypto::{Digest, SIGNATURE_SIZE};
use crate::common::metrics::NoopMetrics;
use crate::consensus::leader::ConstantLeader;
use crate::consensus::message::MemberId;
use crate::consensus::qc::validate_decided;
use crate::consensus::store::InMemoryStorage;
use crate::error::{CryptoError, ValidationError};
use crate::network::{Inbound, LocalHub, PeerId};
use crate::testing::TestCommittee;

struct Harness {
    committee: TestCommittee,
    core: InstanceCore,
    storage: Arc<InMemoryStorage>,
    net_rx: UnboundedReceiver<Inbound>,
}

impl Harness {
    fn new(node: MemberId, leader: MemberId, fork: Fork) -> Self {
        let committee = TestCommittee::generate(4);
        let signer = committee.signer(node);
        Self::with_signer(committee, node, leader, fork, signer)
    }

    fn with_signer(
        committee: TestCommittee,
        node: MemberId,
        leader: MemberId,
        fork: Fork,
        signer: Arc<dyn Signer>,
    ) -> Self {
        let hub = LocalHub::new();
        let (network, net_rx) = hub.join(PeerId::from(format!("node-{node}").as_str()));
        let storage = Arc::new(InMemoryStorage::new());
        let opts = InstanceOptions {
            share: Arc::new(committee.share_for(node)),
            signer,
            lambda: committee.identifier(),
            seq_number: 1,
            fork,
            config: InstanceConfig::default(),
            network: Arc::new(network),
            storage: storage.clone(),
            queue: Arc::new(MessageQueue::new()),
            metrics: Arc::new(NoopMetrics),
            leader_selector: Some(Arc::new(ConstantLeader(leader))),
        };
        let shared = Arc::new(SharedState {
            state: RwLock::new(State::new(opts.lambda.clone(), 1)),
            decided: RwLock::new(None),
        });
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (stage_tx, _stage_rx) = mpsc::unbounded_channel();
        let core = InstanceCore::new(opts, shared, events_tx, stage_tx);
        Harness {
            committee,
            core,
            storage,
            net_rx,
        }
    }

    fn msg(&self, signer: MemberId, msg_type: MessageType, round: Round, value: &[u8]) -> InstanceEvent {
        InstanceEvent::Message(self.committee.sign(
            signer,
            Message::new(msg_type, round, self.committee.identifier(), 1, value.to_vec()),
        ))
    }

    async fn feed(&mut self, event: InstanceEvent) -> Result<(), InstanceError> {
        self.core.process_event(event).await
    }

    /// Everything this node broadcast so far.
    fn sent(&mut self) -> Vec<SignedMessage> {
        let mut out = Vec::new();
        while let Ok(inbound) = self.net_rx.try_recv() {
            if let Inbound::Consensus(msg) = inbound {
                out.push(msg);
            }
        }
        out
    }
}

#[tokio::test]
async fn test_happy_path_decides_with_commit_quorum() {
    let mut h = Harness::new(2, 1, Fork::V0);
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();
    assert_eq!(h.core.state.stage, Stage::PrePrepare);

    h.feed(h.msg(1, MessageType::PrePrepare, 1, b"x")).await.unwrap();
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message.msg_type, MessageType::Prepare);

    for id in [1, 3, 4] {
        h.feed(h.msg(id, MessageType::Prepare, 1, b"x")).await.unwrap();
    }
    assert_eq!(h.core.state.stage, Stage::Commit);
    assert_eq!(h.core.state.prepared_round, 1);
    assert_eq!(h.sent()[0].message.msg_type, MessageType::Commit);

    for id in [1, 3, 4] {
        h.feed(h.msg(id, MessageType::Commit, 1, b"x")).await.unwrap();
    }
    assert_eq!(h.core.state.stage, Stage::Decided);
    let decided = h.core.shared.decided.read().clone().unwrap();
    assert_eq!(decided.signer_ids, vec![1, 3, 4]);
    assert_eq!(decided.message.value, b"x".to_vec());
    assert!(decided.verify(&h.committee.share_for(2)).is_ok());

    // Nothing moves a decided instance.
    h.feed(InstanceEvent::Timeout(1)).await.unwrap();
    assert_eq!(h.core.state.round, 1);
}

#[tokio::test]
async fn test_duplicate_commit_is_counted_once() {
    let mut h = Harness::new(2, 1, Fork::V0);
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();

    let commit = h.msg(1, MessageType::Commit, 1, b"x");
    let again = h.msg(1, MessageType::Commit, 1, b"x");
    h.feed(commit).await.unwrap();
    h.feed(again).await.unwrap();
    h.feed(h.msg(3, MessageType::Commit, 1, b"x")).await.unwrap();

    assert_eq!(h.core.commit_msgs.quorum_count(1, b"x"), (false, 2, 4));
    assert_ne!(h.core.state.stage, Stage::Decided);
}

#[tokio::test]
async fn test_conflicting_pre_prepare_is_rejected() {
    let mut h = Harness::new(2, 1, Fork::V0);
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();
    h.feed(h.msg(1, MessageType::PrePrepare, 1, b"x")).await.unwrap();

    let result = h.feed(h.msg(1, MessageType::PrePrepare, 1, b"y")).await;

    assert!(matches!(
        result,
        Err(InstanceError::Validation(ValidationError::ConflictingProposal(1)))
    ));
    assert_eq!(h.core.accepted_proposals[&1].message.value, b"x".to_vec());
}

#[tokio::test]
async fn test_pre_prepare_from_non_leader_is_rejected() {
    let mut h = Harness::new(2, 1, Fork::V0);
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();

    let result = h.feed(h.msg(3, MessageType::PrePrepare, 1, b"x")).await;

    assert!(matches!(
        result,
        Err(InstanceError::Validation(ValidationError::NotLeader { leader: 1, signer: 3 }))
    ));
    assert!(h.sent().is_empty());
}

#[tokio::test]
async fn test_timeout_moves_to_next_round_and_stale_timeout_is_ignored() {
    let mut h = Harness::new(2, 1, Fork::V0);
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();

    h.feed(InstanceEvent::Timeout(1)).await.unwrap();
    assert_eq!(h.core.state.round, 2);
    assert_eq!(h.core.state.stage, Stage::ChangeRound);
    let sent = h.sent();
    assert_eq!(sent[0].message.msg_type, MessageType::ChangeRound);
    assert_eq!(sent[0].message.round, 2);
    let saved = h
        .storage
        .get_last_change_round(&h.committee.identifier())
        .unwrap();
    assert_eq!(saved, Some(sent[0].clone()));

    h.feed(InstanceEvent::Timeout(1)).await.unwrap();
    assert_eq!(h.core.state.round, 2);
    assert!(h.sent().is_empty());
}

#[tokio::test]
async fn test_change_round_carries_prepared_justification() {
    let mut h = Harness::new(2, 1, Fork::V0);
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();
    for id in [1, 3, 4] {
        h.feed(h.msg(id, MessageType::Prepare, 1, b"x")).await.unwrap();
    }
    h.sent();

    h.feed(InstanceEvent::Timeout(1)).await.unwrap();

    let change_round = h.sent().remove(0);
    let data = change_round.message.change_round.unwrap();
    assert_eq!(data.prepared_round, 1);
    assert_eq!(data.prepared_value, b"x".to_vec());
    assert_eq!(data.justification().unwrap().signer_ids, vec![1, 3, 4]);
}

#[tokio::test]
async fn test_partial_change_round_quorum_skips_ahead() {
    let mut h = Harness::new(2, 1, Fork::V0);
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();

    let first = InstanceEvent::Message(h.committee.change_round_msg(3, 3, None));
    h.feed(first).await.unwrap();
    assert_eq!(h.core.state.round, 1);

    let second = InstanceEvent::Message(h.committee.change_round_msg(4, 4, None));
    h.feed(second).await.unwrap();

    assert_eq!(h.core.state.round, 3);
    assert_eq!(h.core.state.stage, Stage::ChangeRound);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message.msg_type, MessageType::ChangeRound);
    assert_eq!(sent[0].message.round, 3);
}

#[tokio::test]
async fn test_new_leader_proposes_highest_prepared_value() {
    let mut h = Harness::new(2, 2, Fork::V0);
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();
    h.feed(InstanceEvent::Timeout(1)).await.unwrap();
    h.sent();

    let msgs = [
        h.committee.change_round_msg(1, 2, Some((1, b"y".to_vec()))),
        h.committee.change_round_msg(3, 2, None),
        h.committee.change_round_msg(4, 2, None),
    ];
    for msg in msgs {
        h.feed(InstanceEvent::Message(msg)).await.unwrap();
    }

    let sent = h.sent();
    let pre_prepare = sent
        .iter()
        .find(|m| m.message.msg_type == MessageType::PrePrepare)
        .unwrap();
    assert_eq!(pre_prepare.message.round, 2);
    assert_eq!(pre_prepare.message.value, b"y".to_vec());
}

#[tokio::test]
async fn test_pre_prepare_must_carry_prepared_value() {
    let mut h = Harness::new(3, 2, Fork::V0);
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();
    h.feed(InstanceEvent::Timeout(1)).await.unwrap();
    let msgs = [
        h.committee.change_round_msg(1, 2, Some((1, b"y".to_vec()))),
        h.committee.change_round_msg(2, 2, None),
        h.committee.change_round_msg(4, 2, None),
    ];
    for msg in msgs {
        h.feed(InstanceEvent::Message(msg)).await.unwrap();
    }

    let result = h.feed(h.msg(2, MessageType::PrePrepare, 2, b"x")).await;
    assert!(matches!(
        result,
        Err(InstanceError::Validation(ValidationError::PreparedValueMismatch))
    ));

    h.feed(h.msg(2, MessageType::PrePrepare, 2, b"y")).await.unwrap();
    assert_eq!(h.core.state.stage, Stage::PrePrepare);
}

#[tokio::test]
async fn test_v1_unprepared_round_change_accepts_any_proposal() {
    let mut h = Harness::new(3, 2, Fork::V1);
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();
    let msgs = [
        h.committee.change_round_msg(1, 2, None),
        h.committee.change_round_msg(2, 2, None),
        h.committee.change_round_msg(4, 2, None),
    ];
    for msg in msgs {
        h.feed(InstanceEvent::Message(msg)).await.unwrap();
    }
    assert_eq!(h.core.state.round, 2);

    h.feed(h.msg(2, MessageType::PrePrepare, 2, b"z")).await.unwrap();

    assert_eq!(h.core.state.stage, Stage::PrePrepare);
    let prepare = h
        .sent()
        .into_iter()
        .find(|m| m.message.msg_type == MessageType::Prepare)
        .unwrap();
    assert_eq!(prepare.message.round, 2);
    assert_eq!(prepare.message.value, b"z".to_vec());
}

#[tokio::test]
async fn test_force_decide_requires_quorum() {
    let mut h = Harness::new(2, 1, Fork::V0);
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();

    let weak = h.committee.sign(
        1,
        Message::new(MessageType::Commit, 1, h.committee.identifier(), 1, b"x".to_vec()),
    );
    assert!(h.feed(InstanceEvent::ForceDecide(weak)).await.is_err());

    let decided = h.committee.decided(1, b"x");
    h.feed(InstanceEvent::ForceDecide(decided.clone())).await.unwrap();
    assert_eq!(h.core.state.stage, Stage::Decided);
    assert_eq!(*h.core.shared.decided.read(), Some(decided));
}

struct FailingSigner;

impl Signer for FailingSigner {
    fn sign_digest(&self, _digest: &Digest) -> Result<[u8; SIGNATURE_SIZE], CryptoError> {
        Err(CryptoError::SigningFailed("key unavailable".to_string()))
    }
}

#[tokio::test]
async fn test_signing_failure_is_fatal() {
    let committee = TestCommittee::generate(4);
    let mut h = Harness::with_signer(committee, 2, 1, Fork::V0, Arc::new(FailingSigner));
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();

    let err = h
        .feed(h.msg(1, MessageType::PrePrepare, 1, b"x"))
        .await
        .unwrap_err();

    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_instance_handle_lifecycle() {
    let committee = TestCommittee::generate(4);
    let hub = LocalHub::new();
    let (network, _net_rx) = hub.join(PeerId::from("node-2"));
    let instance = Instance::new(InstanceOptions {
        share: Arc::new(committee.share_for(2)),
        signer: committee.signer(2),
        lambda: committee.identifier(),
        seq_number: 1,
        fork: Fork::V0,
        config: InstanceConfig::default(),
        network: Arc::new(network),
        storage: Arc::new(InMemoryStorage::new()),
        queue: Arc::new(MessageQueue::new()),
        metrics: Arc::new(NoopMetrics),
        leader_selector: Some(Arc::new(ConstantLeader(1))),
    });
    let mut stages = instance.take_stage_receiver().unwrap();
    assert!(instance.take_stage_receiver().is_none());

    assert_eq!(instance.start(b"x".to_vec()), Err(InstanceError::NotInitialized));
    instance.init();
    assert_eq!(instance.start(Vec::new()), Err(InstanceError::EmptyInput));
    instance.start(b"x".to_vec()).unwrap();
    assert_eq!(stages.recv().await, Some(Stage::PrePrepare));
    assert_eq!(instance.start(b"x".to_vec()), Err(InstanceError::AlreadyStarted));
    assert_eq!(instance.committed_aggregated_msg(), Err(InstanceError::NotDecided));

    instance.stop();
    assert_eq!(stages.recv().await, Some(Stage::Stopped));
    assert_eq!(instance.stage(), Stage::Stopped);
}

#[tokio::test]
async fn test_overlapping_multi_signer_commit_keeps_every_signer() {
    let mut h = Harness::new(2, 1, Fork::V0);
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();

    h.feed(h.msg(1, MessageType::Commit, 1, b"x")).await.unwrap();
    let relayed = h.committee.multi_sign(
        &[1, 3, 4],
        Message::new(MessageType::Commit, 1, h.committee.identifier(), 1, b"x".to_vec()),
    );
    h.feed(InstanceEvent::Message(relayed)).await.unwrap();

    assert_eq!(h.core.state.stage, Stage::Decided);
    let decided = h.core.shared.decided.read().clone().unwrap();
    assert_eq!(decided.signer_ids, vec![1, 3, 4]);
    let share = h.committee.share_for(2);
    assert!(validate_decided(&share, &h.committee.identifier(), &decided).is_ok());
}

#[tokio::test]
async fn test_forced_decision_folds_in_held_commits() {
    let mut h = Harness::new(2, 1, Fork::V0);
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();
    h.feed(h.msg(4, MessageType::Commit, 1, b"x")).await.unwrap();
    // A commit for another value is not part of the decision.
    h.feed(h.msg(2, MessageType::Commit, 1, b"y")).await.unwrap();

    let decided = h.committee.decided(1, b"x");
    assert_eq!(decided.signer_ids, vec![1, 2, 3]);
    h.feed(InstanceEvent::ForceDecide(decided)).await.unwrap();

    assert_eq!(h.core.state.stage, Stage::Decided);
    let stored = h.core.shared.decided.read().clone().unwrap();
    assert_eq!(stored.signer_ids, vec![1, 2, 3, 4]);
    assert_eq!(stored.message.value, b"x".to_vec());
    assert!(stored.verify(&h.committee.share_for(2)).is_ok());
}

#[tokio::test]
async fn test_commits_still_in_flight_are_left_for_late_listener() {
    let mut h = Harness::new(2, 1, Fork::V0);
    h.feed(InstanceEvent::Start(b"x".to_vec())).await.unwrap();
    h.feed(InstanceEvent::ForceDecide(h.committee.decided(1, b"x")))
        .await
        .unwrap();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    events_tx.send(h.msg(4, MessageType::Commit, 1, b"x")).unwrap();
    events_tx.send(h.msg(4, MessageType::Prepare, 1, b"x")).unwrap();
    h.core.on_terminal(&mut events_rx);

    let key = IndexKey::round(&h.committee.identifier(), 1, 1);
    assert_eq!(h.core.queue.len(&key), 1);
    let late = h.core.queue.pop_message(&key).unwrap();
    assert_eq!(late.signer_ids, vec![4]);
    assert_eq!(late.message.msg_type, MessageType::Commit);
    // Nothing reaches the finished loop any more.
    assert!(events_tx.send(InstanceEvent::Stop).is_err());
}

#[tokio::test]
async fn test_stop_purges_queued_messages() {
    let committee = TestCommittee::generate(4);
    let lambda = committee.identifier();
    let hub = LocalHub::new();
    let (network, _net_rx) = hub.join(PeerId::from("node-2"));
    let queue = Arc::new(MessageQueue::new());
    let instance = Instance::new(InstanceOptions {
        share: Arc::new(committee.share_for(2)),
        signer: committee.signer(2),
        lambda: lambda.clone(),
        seq_number: 1,
        fork: Fork::V0,
        config: InstanceConfig::default(),
        network: Arc::new(network),
        storage: Arc::new(InMemoryStorage::new()),
        queue: queue.clone(),
        metrics: Arc::new(NoopMetrics),
        leader_selector: Some(Arc::new(ConstantLeader(1))),
    });
    instance.init();

    let prepare = |round, seq| {
        committee.sign(
            3,
            Message::new(MessageType::Prepare, round, lambda.clone(), seq, b"x".to_vec()),
        )
    };
    queue.add_message(prepare(1, 1));
    queue.add_message(prepare(2, 1));
    queue.add_message(committee.change_round_msg(4, 2, None));
    queue.add_message(prepare(1, 2));

    instance.stop();
    while !instance.is_finished() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(instance.stage(), Stage::Stopped);
    assert_eq!(queue.len(&IndexKey::round(&lambda, 1, 1)), 0);
    assert_eq!(queue.len(&IndexKey::round(&lambda, 1, 2)), 0);
    assert_eq!(queue.len(&IndexKey::change_round(&lambda, 1)), 0);
    // The next sequence number keeps its messages.
    assert_eq!(queue.len(&IndexKey::round(&lambda, 2, 1)), 1);
}
