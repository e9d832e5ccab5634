//! Shared types, error model, and configuration for siteport.
//!
//! This crate is the foundation depended on by all other siteport crates.
//! It provides:
//! - [`SiteportError`] and [`CollaboratorError`], the unified error types
//! - Domain types ([`JobSession`], [`SiteBlueprint`], [`CapabilityEnvelope`],
//!   [`MappingManifest`], [`GapReport`], [`KnowledgeEntry`], ...)
//! - Configuration ([`AppConfig`], the runtime configs, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CollaboratorSection, DefaultsConfig, GapSection, LearningSection, MappingConfig,
    MappingSection, PageSimilarityPolicy, PipelineConfig, PipelineSection, ProbeConfig,
    ProbeSection, RefinementConfig, RefinementSection, config_dir, config_file_path, expand_home,
    gateway_token, init_config, load_config, load_config_from,
};
pub use error::{CollaboratorError, Result, SiteportError};
pub use types::{
    AttemptOutcome, CapabilityEnvelope, ComponentDescriptor, Decision, EventStatus, GapReport,
    GapReportItem, HIGH_CONFIDENCE, InstructionAction, JobSession, KnowledgeEntry, LOW_CONFIDENCE,
    MappingItem, MappingManifest, MappingStats, Phase, PhaseFailure, ProbeObservation,
    ProbeVerdict, ProgressEvent, RefinementAttempt, RegionInstruction, SessionId, SessionStatus,
    SessionWarning, SiteBlueprint, SourceElement, clamp_unit,
};
