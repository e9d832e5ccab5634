//! Migration orchestration for siteport.
//!
//! This crate holds the capability prober, the mapping engine, the item and
//! page refinement loops, the review gate, the learning writer, and the
//! pipeline state machine that drives them per session.

pub mod events;
pub mod gap;
pub mod learn;
pub mod mapping;
pub mod pipeline;
pub mod probe;
pub mod refinement;
pub mod retry;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use events::EventBus;
pub use gap::{DecisionChange, GapReviewGate};
pub use learn::KnowledgeWriter;
pub use mapping::{MappingEngine, RegionRemapper, StoreRemapper};
pub use pipeline::{PhaseResult, PipelineContext, PipelineController, PublishRecord};
pub use probe::{ProbeController, ProbeSummary};
pub use refinement::{BuildReport, PageOutcome, PageStatus, RefinementController};
pub use retry::RetryPolicy;
pub use service::MigrationService;
