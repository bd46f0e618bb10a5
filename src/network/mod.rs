pub mod local;
pub mod queue;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::consensus::{Identifier, SeqNumber, SignedMessage};
use crate::error::NetworkError;

pub use local::{LocalHub, LocalNetwork};
pub use queue::{IndexKey, MessageQueue};

/*
    Communication is point to point and authenticated. A broadcast is the
    sender delivering the same message to every committee member, itself
    included. Consensus and decided messages travel by broadcast; history
    sync uses request/response with one chosen peer at a time.
*/

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// What a node receives from the network.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Inbound {
    Consensus(SignedMessage),
    Decided(SignedMessage),
}

/// Request of the history sync protocol.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SyncRequest {
    GetHighestDecided,
    GetDecidedRange { from: SeqNumber, to: SeqNumber },
    GetLastChangeRound { seq_number: SeqNumber },
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SyncResponse {
    /// `None` is the explicit not-found marker.
    Highest(Option<SignedMessage>),
    Decided(Vec<SignedMessage>),
    ChangeRound(Vec<SignedMessage>),
}

#[async_trait]
pub trait Network: Send + Sync {
    async fn broadcast(&self, msg: &SignedMessage) -> Result<(), NetworkError>;

    async fn broadcast_decided(&self, msg: &SignedMessage) -> Result<(), NetworkError>;

    /// Peers currently reachable for `identifier`, excluding this node.
    fn peers(&self, identifier: &Identifier) -> Vec<PeerId>;

    async fn request_highest_decided(
        &self,
        peer: &PeerId,
        identifier: &Identifier,
    ) -> Result<Option<SignedMessage>, NetworkError>;

    async fn request_decided_range(
        &self,
        peer: &PeerId,
        identifier: &Identifier,
        from: SeqNumber,
        to: SeqNumber,
    ) -> Result<Vec<SignedMessage>, NetworkError>;

    async fn request_change_round_messages(
        &self,
        peer: &PeerId,
        identifier: &Identifier,
        seq_number: SeqNumber,
    ) -> Result<Vec<SignedMessage>, NetworkError>;
}
