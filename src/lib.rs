/*
    IBFT consensus for a committee of N operators jointly running one validator
    share, tolerating F byzantine operators where N >= 3F + 1.

    A single instance agrees on one value for one sequence number. The happy
    path is pre-prepare (leader proposes), prepare (a quorum agrees to the
    proposal) and commit (a quorum commits to the prepared value). When a round
    times out, nodes exchange change round messages carrying their prepared
    state, and the leader of the next round must re-propose the highest
    prepared value, if any.

    The controller drives instances one sequence number at a time for a single
    (validator, role) identifier and keeps the decided history in sync with
    the rest of the committee.
*/

pub mod common;
pub mod consensus;
pub mod controller;
pub mod error;
pub mod network;
pub mod sync;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use consensus::{Identifier, MemberId, Message, MessageType, Round, SeqNumber, SignedMessage};
pub use controller::{Controller, ControllerOptions, InstanceResult, StartInstanceOptions};
