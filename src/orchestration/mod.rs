//! Orchestration layer.
//!
//! The declarative pipeline plan, the producer boundary, the graph
//! mutations applied on failure or dispute, run records, and the control
//! loop that ties them together.

mod orchestrator;
mod pipeline;
mod producer;
pub mod recovery;
mod run;

pub use orchestrator::{Orchestrator, RunOutcome, SharedStore, COVERAGE_ARTIFACT, LEDGER_ARTIFACT};
pub use pipeline::{consumer_bundle, declared_categories, expected_outputs, PipelinePlan, PlanStep};
pub use producer::{ProduceRequest, Producer, ProducerOutput};
pub use run::{
    BlockedNode, Escalation, EscalationKind, RunDirectory, RunMetadata, RunReport, RunStatus,
};
