//! Application configuration for siteport.
//!
//! User config lives at `~/.siteport/siteport.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SiteportError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "siteport.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".siteport";

// ---------------------------------------------------------------------------
// Config structs (matching siteport.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub refinement: RefinementSection,

    #[serde(default)]
    pub gap: GapSection,

    #[serde(default)]
    pub learning: LearningSection,

    #[serde(default)]
    pub probe: ProbeSection,

    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub collaborator: CollaboratorSection,

    /// Kept last: it carries a nested table.
    #[serde(default)]
    pub mapping: MappingSection,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// KnowledgeStore database path. `~` expands to the home directory.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Maximum concurrent placement/scoring calls per session.
    #[serde(default = "default_worker_limit")]
    pub worker_limit: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            worker_limit: default_worker_limit(),
        }
    }
}

fn default_database_path() -> String {
    "~/.siteport/siteport.db".into()
}
fn default_worker_limit() -> u32 {
    4
}

/// How item similarities combine into a page similarity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSimilarityPolicy {
    /// Plain arithmetic mean.
    #[default]
    Mean,
    /// Weighted by each element's blueprint weight.
    Weighted,
}

/// `[refinement]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementSection {
    #[serde(default = "default_micro_threshold")]
    pub micro_threshold: f64,
    #[serde(default = "default_max_micro_iterations")]
    pub max_micro_iterations: u32,
    #[serde(default = "default_meso_threshold")]
    pub meso_threshold: f64,
    #[serde(default = "default_max_meso_iterations")]
    pub max_meso_iterations: u32,
    /// Items below this similarity are remapped by the page loop.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    #[serde(default)]
    pub page_similarity: PageSimilarityPolicy,
}

impl Default for RefinementSection {
    fn default() -> Self {
        Self {
            micro_threshold: default_micro_threshold(),
            max_micro_iterations: default_max_micro_iterations(),
            meso_threshold: default_meso_threshold(),
            max_meso_iterations: default_max_meso_iterations(),
            min_similarity: default_min_similarity(),
            page_similarity: PageSimilarityPolicy::default(),
        }
    }
}

fn default_micro_threshold() -> f64 {
    0.85
}
fn default_max_micro_iterations() -> u32 {
    5
}
fn default_meso_threshold() -> f64 {
    0.80
}
fn default_max_meso_iterations() -> u32 {
    3
}
fn default_min_similarity() -> f64 {
    0.30
}

/// `[mapping]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingSection {
    /// Items with confidence below this are flagged for review at map time.
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,
    #[serde(default = "default_envelope_weight")]
    pub envelope_weight: f64,
    #[serde(default = "default_history_weight")]
    pub history_weight: f64,
    /// Sample count at which history reaches half its weight.
    #[serde(default = "default_history_saturation")]
    pub history_saturation: u32,
    /// Confidence assigned to conservative-default mappings.
    #[serde(default = "default_conservative_confidence")]
    pub default_confidence: f64,
    #[serde(default = "default_fallback_component")]
    pub fallback_component: String,
    /// Semantic type -> component used when nothing better is known.
    #[serde(default = "default_component_table")]
    pub default_components: BTreeMap<String, String>,
}

impl Default for MappingSection {
    fn default() -> Self {
        Self {
            review_threshold: default_review_threshold(),
            envelope_weight: default_envelope_weight(),
            history_weight: default_history_weight(),
            history_saturation: default_history_saturation(),
            default_confidence: default_conservative_confidence(),
            fallback_component: default_fallback_component(),
            default_components: default_component_table(),
        }
    }
}

fn default_review_threshold() -> f64 {
    0.5
}
fn default_envelope_weight() -> f64 {
    0.6
}
fn default_history_weight() -> f64 {
    0.4
}
fn default_history_saturation() -> u32 {
    5
}
fn default_conservative_confidence() -> f64 {
    0.3
}
fn default_fallback_component() -> String {
    "basic_page".into()
}
fn default_component_table() -> BTreeMap<String, String> {
    [
        ("hero", "page"),
        ("navigation", "menu_block"),
        ("features", "article"),
        ("about", "page"),
        ("blog", "article"),
        ("contact", "contact_form"),
        ("footer", "basic_block"),
        ("testimonials", "article"),
        ("team", "article"),
        ("pricing", "page"),
        ("content", "page"),
        ("header", "menu_block"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// `[gap]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapSection {
    /// Items whose final score is below this land in the gap report.
    #[serde(default = "default_acceptability")]
    pub acceptability_threshold: f64,
}

impl Default for GapSection {
    fn default() -> Self {
        Self {
            acceptability_threshold: default_acceptability(),
        }
    }
}

fn default_acceptability() -> f64 {
    0.75
}

/// `[learning]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningSection {
    #[serde(default = "default_min_learn_fidelity")]
    pub min_fidelity: f64,
}

impl Default for LearningSection {
    fn default() -> Self {
        Self {
            min_fidelity: default_min_learn_fidelity(),
        }
    }
}

fn default_min_learn_fidelity() -> f64 {
    0.80
}

/// `[probe]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSection {
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    /// Upper bound on trial submissions per component per sweep.
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_component: u32,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval(),
            max_attempts_per_component: default_max_attempts(),
        }
    }
}

fn default_probe_interval() -> u64 {
    24 * 60 * 60
}
fn default_max_attempts() -> u32 {
    16
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Retries per phase after the first attempt.
    #[serde(default = "default_phase_retries")]
    pub phase_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            phase_retries: default_phase_retries(),
            initial_backoff_ms: default_backoff_ms(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

fn default_phase_retries() -> u32 {
    2
}
fn default_backoff_ms() -> u64 {
    200
}
fn default_call_timeout() -> u64 {
    60
}

/// `[collaborator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorSection {
    /// Base URL of the collaborator gateway.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Name of the env var holding the bearer token (never store the token itself).
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for CollaboratorSection {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            token_env: default_token_env(),
        }
    }
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:8700".into()
}
fn default_token_env() -> String {
    "SITEPORT_GATEWAY_TOKEN".into()
}

// ---------------------------------------------------------------------------
// Runtime configs (derived from AppConfig, validated)
// ---------------------------------------------------------------------------

fn unit(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SiteportError::config(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}

fn nonzero(name: &str, value: u32) -> Result<()> {
    if value == 0 {
        Err(SiteportError::config(format!("{name} must be at least 1")))
    } else {
        Ok(())
    }
}

/// Runtime refinement-loop configuration.
#[derive(Debug, Clone)]
pub struct RefinementConfig {
    pub micro_threshold: f64,
    pub max_micro_iterations: u32,
    pub meso_threshold: f64,
    pub max_meso_iterations: u32,
    pub min_similarity: f64,
    pub page_similarity: PageSimilarityPolicy,
    pub worker_limit: usize,
}

impl RefinementConfig {
    pub fn validate(&self) -> Result<()> {
        unit("refinement.micro_threshold", self.micro_threshold)?;
        unit("refinement.meso_threshold", self.meso_threshold)?;
        unit("refinement.min_similarity", self.min_similarity)?;
        nonzero("refinement.max_micro_iterations", self.max_micro_iterations)?;
        nonzero("refinement.max_meso_iterations", self.max_meso_iterations)?;
        if self.worker_limit == 0 {
            return Err(SiteportError::config("defaults.worker_limit must be at least 1"));
        }
        Ok(())
    }
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for RefinementConfig {
    fn from(config: &AppConfig) -> Self {
        let r = &config.refinement;
        Self {
            micro_threshold: r.micro_threshold,
            max_micro_iterations: r.max_micro_iterations,
            meso_threshold: r.meso_threshold,
            max_meso_iterations: r.max_meso_iterations,
            min_similarity: r.min_similarity,
            page_similarity: r.page_similarity,
            worker_limit: config.defaults.worker_limit as usize,
        }
    }
}

/// Runtime mapping-engine configuration.
#[derive(Debug, Clone)]
pub struct MappingConfig {
    pub review_threshold: f64,
    pub envelope_weight: f64,
    pub history_weight: f64,
    pub history_saturation: u32,
    pub default_confidence: f64,
    pub fallback_component: String,
    pub default_components: BTreeMap<String, String>,
}

impl MappingConfig {
    pub fn validate(&self) -> Result<()> {
        unit("mapping.review_threshold", self.review_threshold)?;
        unit("mapping.envelope_weight", self.envelope_weight)?;
        unit("mapping.history_weight", self.history_weight)?;
        unit("mapping.default_confidence", self.default_confidence)?;
        if self.envelope_weight + self.history_weight > 1.0 + f64::EPSILON {
            return Err(SiteportError::config(
                "mapping.envelope_weight + mapping.history_weight must not exceed 1",
            ));
        }
        if self.fallback_component.trim().is_empty() {
            return Err(SiteportError::config("mapping.fallback_component is empty"));
        }
        Ok(())
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for MappingConfig {
    fn from(config: &AppConfig) -> Self {
        let m = &config.mapping;
        Self {
            review_threshold: m.review_threshold,
            envelope_weight: m.envelope_weight,
            history_weight: m.history_weight,
            history_saturation: m.history_saturation,
            default_confidence: m.default_confidence,
            fallback_component: m.fallback_component.clone(),
            default_components: m.default_components.clone(),
        }
    }
}

/// Runtime probe-controller configuration.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub interval: Duration,
    pub max_attempts_per_component: u32,
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<()> {
        nonzero("probe.max_attempts_per_component", self.max_attempts_per_component)?;
        if self.interval.is_zero() {
            return Err(SiteportError::config("probe.interval_secs must be at least 1"));
        }
        Ok(())
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ProbeConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.probe.interval_secs),
            max_attempts_per_component: config.probe.max_attempts_per_component,
        }
    }
}

/// Runtime pipeline-controller configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub phase_retries: u32,
    pub initial_backoff: Duration,
    pub call_timeout: Duration,
    pub acceptability_threshold: f64,
    pub learn_min_fidelity: f64,
    pub refinement: RefinementConfig,
    pub mapping: MappingConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        unit("gap.acceptability_threshold", self.acceptability_threshold)?;
        unit("learning.min_fidelity", self.learn_min_fidelity)?;
        if self.call_timeout.is_zero() {
            return Err(SiteportError::config(
                "pipeline.call_timeout_secs must be at least 1",
            ));
        }
        self.refinement.validate()?;
        self.mapping.validate()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            phase_retries: config.pipeline.phase_retries,
            initial_backoff: Duration::from_millis(config.pipeline.initial_backoff_ms),
            call_timeout: Duration::from_secs(config.pipeline.call_timeout_secs),
            acceptability_threshold: config.gap.acceptability_threshold,
            learn_min_fidelity: config.learning.min_fidelity,
            refinement: RefinementConfig::from(config),
            mapping: MappingConfig::from(config),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.siteport/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| SiteportError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.siteport/siteport.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| SiteportError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| SiteportError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| SiteportError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| SiteportError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| SiteportError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| SiteportError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the gateway bearer token from the configured env var, if set.
pub fn gateway_token(config: &AppConfig) -> Option<String> {
    std::env::var(&config.collaborator.token_env)
        .ok()
        .filter(|v| !v.is_empty())
}
