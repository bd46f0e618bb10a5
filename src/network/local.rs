use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use super::{Inbound, Network, PeerId, SyncRequest, SyncResponse};
use crate::consensus::{Identifier, SeqNumber, SignedMessage};
use crate::error::NetworkError;
use crate::sync::RequestHandler;

/// Returns true when a message from the first peer to the second should be lost.
pub type DropFilter = Arc<dyn Fn(&PeerId, &PeerId, &Inbound) -> bool + Send + Sync>;

#[derive(Default)]
struct HubState {
    nodes: BTreeMap<PeerId, UnboundedSender<Inbound>>,
    handlers: HashMap<(PeerId, Identifier), Arc<RequestHandler>>,
    offline: HashSet<PeerId>,
    drop_filter: Option<DropFilter>,
}

/// In-process transport connecting every node that joined it.
#[derive(Default)]
pub struct LocalHub {
    state: RwLock<HubState>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a node and returns its endpoint with the stream of what it receives.
    pub fn join(self: &Arc<Self>, peer: PeerId) -> (LocalNetwork, UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.write().nodes.insert(peer.clone(), tx);
        (
            LocalNetwork {
                hub: self.clone(),
                me: peer,
            },
            rx,
        )
    }

    /// Serves sync requests for `identifier` addressed to `peer`.
    pub fn register_handler(&self, peer: PeerId, handler: Arc<RequestHandler>) {
        let identifier = handler.identifier().clone();
        self.state.write().handlers.insert((peer, identifier), handler);
    }

    pub fn set_offline(&self, peer: &PeerId, offline: bool) {
        let mut state = self.state.write();
        if offline {
            state.offline.insert(peer.clone());
        } else {
            state.offline.remove(peer);
        }
    }

    pub fn set_drop_filter(&self, filter: Option<DropFilter>) {
        self.state.write().drop_filter = filter;
    }

    fn deliver(&self, from: &PeerId, inbound: Inbound) -> Result<(), NetworkError> {
        let state = self.state.read();
        if state.offline.contains(from) {
            return Err(NetworkError::Unreachable(from.clone()));
        }
        for (to, tx) in &state.nodes {
            if state.offline.contains(to) {
                continue;
            }
            if let Some(filter) = &state.drop_filter {
                if filter(from, to, &inbound) {
                    trace!(%from, %to, "dropping message");
                    continue;
                }
            }
            // A closed receiver means that node shut down; it is not this sender's failure.
            let _ = tx.send(inbound.clone());
        }
        Ok(())
    }

    fn request(
        &self,
        from: &PeerId,
        to: &PeerId,
        identifier: &Identifier,
        request: SyncRequest,
    ) -> Result<SyncResponse, NetworkError> {
        let handler = {
            let state = self.state.read();
            if state.offline.contains(from) || state.offline.contains(to) {
                return Err(NetworkError::Unreachable(to.clone()));
            }
            state
                .handlers
                .get(&(to.clone(), identifier.clone()))
                .cloned()
                .ok_or_else(|| NetworkError::NoHandler(to.clone()))?
        };
        handler.handle(request).map_err(|e| NetworkError::Remote {
            peer: to.clone(),
            reason: e.to_string(),
        })
    }
}

/// One node's endpoint on a `LocalHub`.
#[derive(Clone)]
pub struct LocalNetwork {
    hub: Arc<LocalHub>,
    me: PeerId,
}

impl LocalNetwork {
    pub fn peer_id(&self) -> &PeerId {
        &self.me
    }

    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }
}

fn unexpected(peer: &PeerId) -> NetworkError {
    NetworkError::Remote {
        peer: peer.clone(),
        reason: "unexpected response type".to_string(),
    }
}

#[async_trait]
impl Network for LocalNetwork {
    async fn broadcast(&self, msg: &SignedMessage) -> Result<(), NetworkError> {
        self.hub.deliver(&self.me, Inbound::Consensus(msg.clone()))
    }

    async fn broadcast_decided(&self, msg: &SignedMessage) -> Result<(), NetworkError> {
        self.hub.deliver(&self.me, Inbound::Decided(msg.clone()))
    }

    fn peers(&self, identifier: &Identifier) -> Vec<PeerId> {
        let state = self.hub.state.read();
        state
            .handlers
            .keys()
            .filter(|(peer, id)| id == identifier && *peer != self.me && !state.offline.contains(peer))
            .map(|(peer, _)| peer.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    async fn request_highest_decided(
        &self,
        peer: &PeerId,
        identifier: &Identifier,
    ) -> Result<Option<SignedMessage>, NetworkError> {
        match self
            .hub
            .request(&self.me, peer, identifier, SyncRequest::GetHighestDecided)?
        {
            SyncResponse::Highest(msg) => Ok(msg),
            _ => Err(unexpected(peer)),
        }
    }

    async fn request_decided_range(
        &self,
        peer: &PeerId,
        identifier: &Identifier,
        from: SeqNumber,
        to: SeqNumber,
    ) -> Result<Vec<SignedMessage>, NetworkError> {
        match self.hub.request(
            &self.me,
            peer,
            identifier,
            SyncRequest::GetDecidedRange { from, to },
        )? {
            SyncResponse::Decided(msgs) => Ok(msgs),
            _ => Err(unexpected(peer)),
        }
    }

    async fn request_change_round_messages(
        &self,
        peer: &PeerId,
        identifier: &Identifier,
        seq_number: SeqNumber,
    ) -> Result<Vec<SignedMessage>, NetworkError> {
        match self.hub.request(
            &self.me,
            peer,
            identifier,
            SyncRequest::GetLastChangeRound { seq_number },
        )? {
            SyncResponse::ChangeRound(msgs) => Ok(msgs),
            _ => Err(unexpected(peer)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{InMemoryStorage, Message, MessageType, Storage};
    use crate::testing::TestCommittee;

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_including_self() {
        let committee = TestCommittee::generate(4);
        let hub = LocalHub::new();
        let (a, mut a_rx) = hub.join(PeerId::from("a"));
        let (_b, mut b_rx) = hub.join(PeerId::from("b"));
        let msg = committee.sign(
            1,
            Message::new(MessageType::Prepare, 1, committee.identifier(), 1, b"x".to_vec()),
        );

        a.broadcast(&msg).await.unwrap();

        assert_eq!(a_rx.recv().await, Some(Inbound::Consensus(msg.clone())));
        assert_eq!(b_rx.recv().await, Some(Inbound::Consensus(msg)));
    }

    #[tokio::test]
    async fn test_drop_filter_and_offline() {
        let committee = TestCommittee::generate(4);
        let hub = LocalHub::new();
        let (a, _a_rx) = hub.join(PeerId::from("a"));
        let (_b, mut b_rx) = hub.join(PeerId::from("b"));
        let msg = committee.decided(1, b"x");

        hub.set_drop_filter(Some(Arc::new(|_: &PeerId, to: &PeerId, _: &Inbound| {
            to.0 == "b"
        })));
        a.broadcast_decided(&msg).await.unwrap();
        assert!(b_rx.try_recv().is_err());

        hub.set_drop_filter(None);
        hub.set_offline(&PeerId::from("a"), true);
        assert_eq!(
            a.broadcast_decided(&msg).await,
            Err(NetworkError::Unreachable(PeerId::from("a")))
        );
    }

    #[tokio::test]
    async fn test_requests_are_routed_to_handlers() {
        let committee = TestCommittee::generate(4);
        let identifier = committee.identifier();
        let hub = LocalHub::new();
        let (a, _a_rx) = hub.join(PeerId::from("a"));
        let (_b, _b_rx) = hub.join(PeerId::from("b"));

        let storage = Arc::new(InMemoryStorage::new());
        storage.save_highest_decided(&committee.decided(4, b"x")).unwrap();
        hub.register_handler(
            PeerId::from("b"),
            Arc::new(RequestHandler::new(identifier.clone(), storage, 25)),
        );

        assert_eq!(a.peers(&identifier), vec![PeerId::from("b")]);
        let highest = a
            .request_highest_decided(&PeerId::from("b"), &identifier)
            .await
            .unwrap();
        assert_eq!(highest.map(|m| m.message.seq_number), Some(4));
        assert_eq!(
            a.request_highest_decided(&PeerId::from("c"), &identifier).await,
            Err(NetworkError::NoHandler(PeerId::from("c")))
        );
    }
}
