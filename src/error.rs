//! Error taxonomy.
//!
//! Validation errors are per-message and never stop an instance. Sequencing errors only fail the
//! `start_instance` call that produced them. `InstanceError::Fatal` is the single error that
//! terminates a running instance.

use thiserror::Error;

use crate::consensus::{MemberId, MessageType, Round, SeqNumber, Stage};
use crate::network::PeerId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("malformed signature: expected {expected} bytes, got {actual}")]
    MalformedSignature { expected: usize, actual: usize },
    #[error("signature verification failed")]
    BadSignature,
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("message has no signers")]
    NoSigners,
    #[error("signer ids must be strictly increasing")]
    UnsortedSigners,
    #[error("signature carries {actual} bytes for {signers} signers")]
    SignatureLength { signers: usize, actual: usize },
    #[error("round must be at least 1")]
    ZeroRound,
    #[error("lambda is empty")]
    EmptyLambda,
    #[error("duplicate signer {0}")]
    DuplicateSigner(MemberId),
    #[error("cannot aggregate signatures over different messages")]
    MessageMismatch,
    #[error("change round message without change round data")]
    MissingChangeRoundData,
    #[error("change round data on a {0:?} message")]
    UnexpectedChangeRoundData(MessageType),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid message: {0}")]
    Message(#[from] MessageError),
    #[error("invalid signature from signer {signer}: {source}")]
    Signature {
        signer: MemberId,
        #[source]
        source: CryptoError,
    },
    #[error("message type is wrong: expected {expected:?}, got {actual:?}")]
    WrongType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("message lambda does not equal the instance lambda")]
    WrongLambda,
    #[error("round is wrong: expected {expected}, got {actual}")]
    WrongRound { expected: Round, actual: Round },
    #[error("stale round {actual}, instance is at round {current}")]
    StaleRound { current: Round, actual: Round },
    #[error("sequence number is wrong: expected {expected}, got {actual}")]
    WrongSequence {
        expected: SeqNumber,
        actual: SeqNumber,
    },
    #[error("signer {0} is not a committee member")]
    UnknownSigner(MemberId),
    #[error("message must have exactly one signer, got {0}")]
    NotSingleSigner(usize),
    #[error("pre-prepare from {signer} but round leader is {leader}")]
    NotLeader { leader: MemberId, signer: MemberId },
    #[error("did not receive pre-prepare for this round")]
    NoProposal,
    #[error("proposed value different than message value")]
    ProposalMismatch,
    #[error("a different pre-prepare was already accepted for round {0}")]
    ConflictingProposal(Round),
    #[error("no change round quorum")]
    NoChangeRoundQuorum,
    #[error("unjustified change round for pre-prepare")]
    UnjustifiedChangeRound,
    #[error("preparedValue different than highest prepared")]
    PreparedValueMismatch,
    #[error("change round justification invalid: {0}")]
    InvalidJustification(&'static str),
    #[error("no quorum: {signers} signers out of {committee}")]
    NoQuorum { signers: usize, committee: usize },
    #[error("instance already reached terminal stage {0:?}")]
    Terminal(Stage),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("peer {0} does not serve this identifier")]
    NoHandler(PeerId),
    #[error("peer {peer} failed the request: {reason}")]
    Remote { peer: PeerId, reason: String },
    #[error("request to peer {0} timed out")]
    Timeout(PeerId),
    #[error("network is closed")]
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstanceError {
    #[error("instance not initialized")]
    NotInitialized,
    #[error("can't start instance with invalid lambda")]
    InvalidLambda,
    #[error("input value is empty")]
    EmptyInput,
    #[error("instance was already started")]
    AlreadyStarted,
    #[error("no commit messages for the decided value")]
    NoCommitMessages,
    #[error("missing decided message")]
    NotDecided,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] MessageError),
    #[error("could not sign own message: {0}")]
    Fatal(#[source] CryptoError),
}

impl InstanceError {
    /// Whether the instance can no longer take part in consensus.
    pub fn is_fatal(&self) -> bool {
        matches!(self, InstanceError::Fatal(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("no peers responded")]
    NoPeersResponded,
    #[error("failed to sync range {from}..={to} from {peer} after {attempts} attempts")]
    SyncFailed {
        peer: PeerId,
        from: SeqNumber,
        to: SeqNumber,
        attempts: usize,
    },
    #[error("sync was cancelled")]
    Cancelled,
    #[error("invalid message from peer: {0}")]
    InvalidMessage(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Network(#[from] NetworkError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("controller not initialized")]
    NotInitialized,
    #[error("instance already running")]
    AlreadyRunning,
    #[error("invalid sequence number: expected {expected}, got {actual}")]
    SequenceInvalid {
        expected: SeqNumber,
        actual: SeqNumber,
    },
    #[error("no share for validator {0}")]
    ShareNotFound(String),
    #[error("no decided message stored for sequence {0}")]
    DecidedNotFound(SeqNumber),
    #[error("late commit value differs from the decided value")]
    DecidedValueMismatch,
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] MessageError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}
