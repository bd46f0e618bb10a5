#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ibft::common::config::ControllerConfig;
use ibft::common::metrics::NoopMetrics;
use ibft::consensus::{InMemoryStorage, MemberId, SignedMessage, Storage};
use ibft::network::{Inbound, LocalHub, LocalNetwork, PeerId};
use ibft::testing::TestCommittee;
use ibft::{Controller, ControllerOptions, SeqNumber};
use tokio::sync::mpsc::UnboundedReceiver;

pub struct Node {
    pub id: MemberId,
    pub peer: PeerId,
    pub controller: Arc<Controller>,
    pub storage: Arc<InMemoryStorage>,
}

pub fn peer(id: MemberId) -> PeerId {
    PeerId(format!("node-{id}"))
}

/// Short timers so rounds move quickly in tests.
pub fn fast_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.instance.leader_pre_prepare_delay_ms = 10;
    config.instance.round_change_duration_ms = 1_000;
    config.late_commit_listen_ms = 5_000;
    config
}

/// Joins a node to the hub, serves its history and routes what it receives. Not initialized.
pub fn spawn_node(
    committee: &TestCommittee,
    hub: &Arc<LocalHub>,
    id: MemberId,
    storage: Arc<InMemoryStorage>,
    config: ControllerConfig,
) -> Node {
    let (network, inbound): (LocalNetwork, UnboundedReceiver<Inbound>) = hub.join(peer(id));
    let controller = Arc::new(Controller::new(ControllerOptions {
        identifier: committee.identifier(),
        share: Arc::new(committee.share_for(id)),
        signer: committee.signer(id),
        network: Arc::new(network),
        storage: storage.clone(),
        metrics: Arc::new(NoopMetrics),
        config,
    }));
    hub.register_handler(peer(id), controller.request_handler());
    controller.listen(inbound);
    Node {
        id,
        peer: peer(id),
        controller,
        storage,
    }
}

/// Nodes `ids` of `committee`, all initialized.
pub async fn cluster(
    committee: &TestCommittee,
    hub: &Arc<LocalHub>,
    ids: &[MemberId],
    config: ControllerConfig,
) -> Vec<Node> {
    let nodes: Vec<Node> = ids
        .iter()
        .map(|id| {
            spawn_node(
                committee,
                hub,
                *id,
                Arc::new(InMemoryStorage::new()),
                config.clone(),
            )
        })
        .collect();
    for node in &nodes {
        node.controller.init().await.unwrap();
    }
    nodes
}

/// Polls `node`'s stored decided message for `seq` until `done` holds or the wait runs out.
pub async fn wait_for_decided(
    node: &Node,
    seq: SeqNumber,
    wait: Duration,
    done: impl Fn(&SignedMessage) -> bool,
) -> Option<SignedMessage> {
    let identifier = node.controller.identifier().clone();
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let stored = node.storage.get_decided(&identifier, seq).unwrap();
        if let Some(msg) = &stored {
            if done(msg) {
                return stored;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return stored;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Polls the stored decided messages of `seq` on every node until they are all present and
/// identical, or the wait runs out. Returns what each node stores, in node order.
pub async fn wait_for_agreement(nodes: &[Node], seq: SeqNumber, wait: Duration) -> Vec<SignedMessage> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let stored: Vec<Option<SignedMessage>> = nodes
            .iter()
            .map(|node| {
                node.storage
                    .get_decided(node.controller.identifier(), seq)
                    .unwrap()
            })
            .collect();
        let agreed = stored.iter().all(|msg| msg.is_some() && msg == &stored[0]);
        if agreed || tokio::time::Instant::now() >= deadline {
            return stored
                .into_iter()
                .map(|msg| msg.expect("node has a decided message"))
                .collect();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
