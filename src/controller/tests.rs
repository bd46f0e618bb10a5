use std::sync::Arc;
use std::time::Duration;

use tracing_test::traced_test;

use super::*;
use crate::common::metrics::NoopMetrics;
use crate::consensus::{InMemoryStorage, MemberId, Message, MessageType};
use crate::network::{LocalHub, LocalNetwork, PeerId};
use crate::testing::TestCommittee;

fn controller(
    committee: &TestCommittee,
    node: MemberId,
    network: LocalNetwork,
    storage: Arc<InMemoryStorage>,
) -> Controller {
    Controller::new(ControllerOptions {
        identifier: committee.identifier(),
        share: Arc::new(committee.share_for(node)),
        signer: committee.signer(node),
        network: Arc::new(network),
        storage,
        metrics: Arc::new(NoopMetrics),
        config: ControllerConfig::default(),
    })
}

fn standalone(committee: &TestCommittee) -> (Controller, Arc<InMemoryStorage>) {
    let hub = LocalHub::new();
    let (network, _rx) = hub.join(PeerId::from("node-1"));
    let storage = Arc::new(InMemoryStorage::new());
    (controller(committee, 1, network, storage.clone()), storage)
}

#[traced_test]
#[tokio::test]
async fn test_start_requires_init_and_next_sequence() {
    let committee = TestCommittee::generate(4);
    let (controller, storage) = standalone(&committee);
    let opts = |seq_number| StartInstanceOptions {
        seq_number,
        value: b"x".to_vec(),
        require_min_peers: false,
    };

    assert_eq!(
        controller.start_instance(opts(0)).await,
        Err(ControllerError::NotInitialized)
    );

    controller.init().await.unwrap();
    assert!(controller.is_initialized());
    assert!(logs_contain("no peers responded to history sync"));
    assert_eq!(controller.next_seq_number().unwrap(), 0);
    assert_eq!(
        controller.start_instance(opts(1)).await,
        Err(ControllerError::SequenceInvalid {
            expected: 0,
            actual: 1
        })
    );

    storage.save_highest_decided(&committee.decided(3, b"v")).unwrap();
    assert_eq!(controller.next_seq_number().unwrap(), 4);
    assert_eq!(
        controller.start_instance(opts(3)).await,
        Err(ControllerError::SequenceInvalid {
            expected: 4,
            actual: 3
        })
    );
}

#[tokio::test]
async fn test_second_instance_is_rejected_while_running() {
    let committee = TestCommittee::generate(4);
    let (controller, _storage) = standalone(&committee);
    let controller = Arc::new(controller);
    controller.init().await.unwrap();

    let running = controller.clone();
    let handle = tokio::spawn(async move {
        running
            .start_instance(StartInstanceOptions {
                seq_number: 0,
                value: b"x".to_vec(),
                require_min_peers: false,
            })
            .await
    });
    while controller.current_instance().is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let second = controller
        .start_instance(StartInstanceOptions {
            seq_number: 0,
            value: b"y".to_vec(),
            require_min_peers: false,
        })
        .await;
    assert_eq!(second, Err(ControllerError::AlreadyRunning));

    controller.stop_current_instance();
    let result = handle.await.unwrap().unwrap();
    assert!(!result.decided);
    assert!(controller.current_instance().is_none());
}

#[tokio::test]
async fn test_late_commit_adds_signers_but_never_changes_value() {
    let committee = TestCommittee::generate(4);
    let (controller, storage) = standalone(&committee);
    let identifier = committee.identifier();
    let decided = committee.decided(1, b"x");
    controller.decided.save(&decided).unwrap();

    let late = committee.sign(
        4,
        Message::new(MessageType::Commit, 1, identifier.clone(), 1, b"x".to_vec()),
    );
    assert_eq!(controller.decided.process_late_commit(&late), Ok(true));
    assert_eq!(controller.decided.process_late_commit(&late), Ok(false));

    let stored = storage.get_decided(&identifier, 1).unwrap().unwrap();
    assert_eq!(stored.signer_ids, vec![1, 2, 3, 4]);
    assert_eq!(stored.message.value, b"x".to_vec());
    assert!(stored.verify(&committee.share_for(1)).is_ok());
    let highest = storage.get_highest_decided(&identifier).unwrap().unwrap();
    assert_eq!(highest.signer_ids, vec![1, 2, 3, 4]);

    let other = committee.sign(
        4,
        Message::new(MessageType::Commit, 1, identifier.clone(), 1, b"y".to_vec()),
    );
    assert_eq!(
        controller.decided.process_late_commit(&other),
        Err(ControllerError::DecidedValueMismatch)
    );
    let missing = committee.sign(
        4,
        Message::new(MessageType::Commit, 1, identifier, 9, b"x".to_vec()),
    );
    assert_eq!(
        controller.decided.process_late_commit(&missing),
        Err(ControllerError::DecidedNotFound(9))
    );
}

#[tokio::test]
async fn test_decided_message_for_stored_sequence_is_folded_in() {
    let committee = TestCommittee::generate(4);
    let (controller, storage) = standalone(&committee);
    controller.decided.save(&committee.decided(1, b"x")).unwrap();

    let commit = Message::new(MessageType::Commit, 1, committee.identifier(), 1, b"x".to_vec());
    controller
        .process_decided_message(committee.multi_sign(&[2, 3, 4], commit))
        .await
        .unwrap();

    let stored = storage.get_decided(&committee.identifier(), 1).unwrap().unwrap();
    assert_eq!(stored.signer_ids, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_decided_message_without_quorum_is_rejected() {
    let committee = TestCommittee::generate(4);
    let (controller, _storage) = standalone(&committee);
    let commit = Message::new(MessageType::Commit, 1, committee.identifier(), 1, b"x".to_vec());

    let result = controller
        .process_decided_message(committee.multi_sign(&[1, 2], commit))
        .await;

    assert!(matches!(result, Err(ControllerError::Validation(_))));
}

#[tokio::test]
async fn test_decided_message_ahead_triggers_history_sync() {
    let committee = TestCommittee::generate(4);
    let identifier = committee.identifier();
    let hub = LocalHub::new();

    let peer_storage = Arc::new(InMemoryStorage::new());
    let history: Vec<_> = (0..=5).map(|seq| committee.decided(seq, b"v")).collect();
    peer_storage.save_decided_batch(&history).unwrap();
    let (_peer_net, _peer_rx) = hub.join(PeerId::from("node-2"));
    hub.register_handler(
        PeerId::from("node-2"),
        Arc::new(RequestHandler::new(identifier.clone(), peer_storage, 25)),
    );

    let (network, _rx) = hub.join(PeerId::from("node-1"));
    let storage = Arc::new(InMemoryStorage::new());
    let controller = controller(&committee, 1, network, storage.clone());

    controller
        .process_decided_message(committee.decided(5, b"v"))
        .await
        .unwrap();

    assert_eq!(controller.next_seq_number().unwrap(), 6);
    assert_eq!(storage.get_decided_range(&identifier, 0, 5).unwrap().len(), 6);
}

#[tokio::test]
async fn test_init_syncs_history_from_peers() {
    let committee = TestCommittee::generate(4);
    let identifier = committee.identifier();
    let hub = LocalHub::new();
    let peer_storage = Arc::new(InMemoryStorage::new());
    let history: Vec<_> = (0..=2).map(|seq| committee.decided(seq, b"v")).collect();
    peer_storage.save_decided_batch(&history).unwrap();
    hub.register_handler(
        PeerId::from("node-2"),
        Arc::new(RequestHandler::new(identifier, peer_storage, 25)),
    );
    let (network, _rx) = hub.join(PeerId::from("node-1"));
    let controller = controller(&committee, 1, network, Arc::new(InMemoryStorage::new()));

    controller.init().await.unwrap();

    assert_eq!(controller.next_seq_number().unwrap(), 3);
}

#[test]
fn test_load_share() {
    let committee = TestCommittee::generate(4);
    let storage = InMemoryStorage::new();
    storage.save_share(committee.share_for(2));

    let share = Controller::load_share(&storage, committee.validator_pubkey()).unwrap();
    assert_eq!(share.node_id, 2);
    assert!(matches!(
        Controller::load_share(&storage, b"unknown"),
        Err(ControllerError::ShareNotFound(_))
    ));
}
