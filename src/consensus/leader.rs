use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest as ShaDigest, Sha512};

use super::message::{Identifier, MemberId, Round, SeqNumber};

/*
    Every honest node must compute the same leader for a round without talking
    to anyone, so a selector is a pure function of the instance it was built
    for and the round it is asked about. Callers always pass the round; the
    selector never tracks the instance round on its own.
*/

pub trait LeaderSelector: Send + Sync {
    /// Committee member id of the leader of `round`.
    fn leader_index(&self, round: Round) -> MemberId;

    /// Records that the instance moved to `round`.
    fn bump(&self, round: Round);

    fn is_leader(&self, round: Round, member: MemberId) -> bool {
        self.leader_index(round) == member
    }
}

/// Always the same leader.
#[derive(Debug, Clone, Copy)]
pub struct ConstantLeader(pub MemberId);

impl LeaderSelector for ConstantLeader {
    fn leader_index(&self, _round: Round) -> MemberId {
        self.0
    }

    fn bump(&self, _round: Round) {}
}

/// Walks the committee in id order, starting one step further for every sequence number.
#[derive(Debug)]
pub struct RoundRobinLeader {
    members: Vec<MemberId>,
    seq_number: SeqNumber,
    last_round: AtomicU64,
}

impl RoundRobinLeader {
    pub fn new(members: Vec<MemberId>, seq_number: SeqNumber) -> Self {
        RoundRobinLeader {
            members,
            seq_number,
            last_round: AtomicU64::new(1),
        }
    }

    pub fn last_round(&self) -> Round {
        self.last_round.load(Ordering::Relaxed)
    }
}

impl LeaderSelector for RoundRobinLeader {
    fn leader_index(&self, round: Round) -> MemberId {
        if self.members.is_empty() {
            return 0;
        }
        let n = self.members.len() as u64;
        let pos = (self.seq_number % n + round.saturating_sub(1) % n) % n;
        self.members[pos as usize]
    }

    fn bump(&self, round: Round) {
        self.last_round.fetch_max(round, Ordering::Relaxed);
    }
}

/// Hashes (identifier, sequence number) into a starting offset, then rotates by round.
#[derive(Debug)]
pub struct DeterministicLeader {
    members: Vec<MemberId>,
    offset: u64,
    last_round: AtomicU64,
}

impl DeterministicLeader {
    pub fn new(members: Vec<MemberId>, identifier: &Identifier, seq_number: SeqNumber) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(identifier.as_bytes());
        hasher.update(seq_number.to_string().as_bytes());
        let result = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&result[..8]);
        DeterministicLeader {
            members,
            offset: u64::from_be_bytes(head),
            last_round: AtomicU64::new(1),
        }
    }

    pub fn last_round(&self) -> Round {
        self.last_round.load(Ordering::Relaxed)
    }
}

impl LeaderSelector for DeterministicLeader {
    fn leader_index(&self, round: Round) -> MemberId {
        if self.members.is_empty() {
            return 0;
        }
        let n = self.members.len() as u64;
        let pos = (self.offset % n + round.saturating_sub(1) % n) % n;
        self.members[pos as usize]
    }

    fn bump(&self, round: Round) {
        self.last_round.fetch_max(round, Ordering::Relaxed);
    }
}
