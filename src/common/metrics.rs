use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::consensus::{Identifier, Round, SeqNumber, Stage};

/// Observability hooks of the consensus engine.
///
/// The controller owns one implementation and hands it to everything it creates. Every method
/// has a no-op default so an implementation only overrides what it records.
pub trait Metrics: Send + Sync {
    fn current_sequence(&self, _identifier: &Identifier, _seq: SeqNumber) {}

    fn stage(&self, _identifier: &Identifier, _stage: Stage) {}

    fn round(&self, _identifier: &Identifier, _round: Round) {}

    fn decided_signers(&self, _identifier: &Identifier, _seq: SeqNumber, _signers: usize) {}

    fn highest_decided(&self, _identifier: &Identifier, _seq: SeqNumber) {}

    fn late_commit_upgraded(&self, _identifier: &Identifier, _signers: usize) {}

    fn sync_completed(&self, _identifier: &Identifier, _saved: usize) {}

    /// A range sync saved fewer messages than it asked for.
    fn sync_partial(&self, _identifier: &Identifier, _requested: usize, _saved: usize) {}

    fn stage_duration(&self, _stage: Stage, _elapsed: Duration) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// Forwards every measurement to the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsRecorder;

impl Metrics for MetricsRecorder {
    fn current_sequence(&self, identifier: &Identifier, seq: SeqNumber) {
        gauge!("ibft_instance_sequence", "identifier" => identifier.to_string()).set(seq as f64);
    }

    fn stage(&self, identifier: &Identifier, stage: Stage) {
        gauge!("ibft_instance_stage", "identifier" => identifier.to_string())
            .set(stage.code() as f64);
    }

    fn round(&self, identifier: &Identifier, round: Round) {
        gauge!("ibft_instance_round", "identifier" => identifier.to_string()).set(round as f64);
    }

    fn decided_signers(&self, identifier: &Identifier, seq: SeqNumber, signers: usize) {
        gauge!(
            "ibft_decided_signers",
            "identifier" => identifier.to_string(),
            "seq" => seq.to_string()
        )
        .set(signers as f64);
    }

    fn highest_decided(&self, identifier: &Identifier, seq: SeqNumber) {
        gauge!("ibft_highest_decided", "identifier" => identifier.to_string()).set(seq as f64);
    }

    fn late_commit_upgraded(&self, identifier: &Identifier, signers: usize) {
        counter!("ibft_late_commit_upgrades_total", "identifier" => identifier.to_string())
            .increment(1);
        histogram!("ibft_late_commit_signers").record(signers as f64);
    }

    fn sync_completed(&self, identifier: &Identifier, saved: usize) {
        counter!("ibft_sync_saved_total", "identifier" => identifier.to_string())
            .increment(saved as u64);
    }

    fn sync_partial(&self, identifier: &Identifier, requested: usize, saved: usize) {
        counter!("ibft_sync_partial_total", "identifier" => identifier.to_string()).increment(1);
        histogram!("ibft_sync_missing").record(requested.saturating_sub(saved) as f64);
    }

    fn stage_duration(&self, stage: Stage, elapsed: Duration) {
        histogram!("ibft_stage_duration_seconds", "stage" => stage.name())
            .record(elapsed.as_secs_f64());
    }
}
