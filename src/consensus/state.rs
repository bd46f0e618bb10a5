use serde::{Deserialize, Serialize};

use super::message::{Identifier, Round, SeqNumber};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Stage {
    NotStarted,
    PrePrepare,
    Prepare,
    Commit,
    ChangeRound,
    Decided,
    Stopped,
}

impl Stage {
    /// Decided and Stopped never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Decided | Stage::Stopped)
    }

    pub fn code(&self) -> u8 {
        match self {
            Stage::NotStarted => 0,
            Stage::PrePrepare => 1,
            Stage::Prepare => 2,
            Stage::Commit => 3,
            Stage::ChangeRound => 4,
            Stage::Decided => 5,
            Stage::Stopped => 6,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::NotStarted => "not_started",
            Stage::PrePrepare => "pre_prepare",
            Stage::Prepare => "prepare",
            Stage::Commit => "commit",
            Stage::ChangeRound => "change_round",
            Stage::Decided => "decided",
            Stage::Stopped => "stopped",
        }
    }
}

/// Snapshot of an instance. Only the instance event loop writes it.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct State {
    pub lambda: Identifier,
    pub seq_number: SeqNumber,
    pub round: Round,
    pub stage: Stage,
    pub input_value: Vec<u8>,
    pub prepared_round: Round,
    pub prepared_value: Vec<u8>,
}

impl State {
    pub fn new(lambda: Identifier, seq_number: SeqNumber) -> Self {
        State {
            lambda,
            seq_number,
            round: 1,
            stage: Stage::NotStarted,
            input_value: Vec::new(),
            prepared_round: 0,
            prepared_value: Vec::new(),
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared_round > 0
    }
}
