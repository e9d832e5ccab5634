//! Core domain types for siteport migration sessions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SiteportError};

/// Clamp a score into `[0, 1]`. NaN collapses to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn check_unit(what: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SiteportError::validation(format!(
            "{what} {value} is outside [0, 1]"
        )))
    }
}

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for migration session identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new time-sortable session identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Probe,
    Analyze,
    Train,
    Map,
    Build,
    Theme,
    Content,
    Verify,
    Qa,
    HumanReview,
    Publish,
    Learn,
}

impl Phase {
    /// All phases in order.
    pub const ALL: [Phase; 12] = [
        Phase::Probe,
        Phase::Analyze,
        Phase::Train,
        Phase::Map,
        Phase::Build,
        Phase::Theme,
        Phase::Content,
        Phase::Verify,
        Phase::Qa,
        Phase::HumanReview,
        Phase::Publish,
        Phase::Learn,
    ];

    /// The phase that follows this one, or `None` after the last phase.
    pub fn next(self) -> Option<Phase> {
        let idx = Self::ALL.iter().position(|p| *p == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// Critical phases fail the session; the rest degrade to a warning.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            Phase::Probe | Phase::Analyze | Phase::Map | Phase::Build | Phase::Publish
        )
    }

    /// Stable snake_case name, used in storage keys and events.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Analyze => "analyze",
            Self::Train => "train",
            Self::Map => "map",
            Self::Build => "build",
            Self::Theme => "theme",
            Self::Content => "content",
            Self::Verify => "verify",
            Self::Qa => "qa",
            Self::HumanReview => "human_review",
            Self::Publish => "publish",
            Self::Learn => "learn",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = SiteportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| SiteportError::validation(format!("unknown phase '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// JobSession
// ---------------------------------------------------------------------------

/// Lifecycle status of a migration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    PausedForReview,
    Done,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::PausedForReview => "paused_for_review",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = SiteportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "paused_for_review" => Ok(Self::PausedForReview),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(SiteportError::validation(format!(
                "unknown session status '{other}'"
            ))),
        }
    }
}

/// A non-fatal problem recorded against a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionWarning {
    pub phase: Phase,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Why a session ended in `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseFailure {
    pub phase: Phase,
    pub message: String,
}

/// One migration run. Owned exclusively by the pipeline controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSession {
    pub id: SessionId,
    /// Source reference (URL or path) handed to the analysis collaborator.
    pub source: String,
    /// Phase that will execute on the next advance (or the phase that
    /// failed / is paused).
    pub phase: Phase,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub warnings: Vec<SessionWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PhaseFailure>,
    /// Retries consumed per phase.
    #[serde(default)]
    pub retries: BTreeMap<Phase, u32>,
}

impl JobSession {
    /// Create a new running session positioned at the first phase.
    pub fn new(source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            source: source.into(),
            phase: Phase::ALL[0],
            status: SessionStatus::Running,
            created_at: now,
            updated_at: now,
            warnings: Vec::new(),
            failure: None,
            retries: BTreeMap::new(),
        }
    }

    /// Record a non-fatal warning.
    pub fn warn(&mut self, phase: Phase, message: impl Into<String>) {
        self.warnings.push(SessionWarning {
            phase,
            message: message.into(),
            at: Utc::now(),
        });
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// User-facing one-line outcome.
    pub fn summary(&self) -> String {
        match self.status {
            SessionStatus::Done => format!("done (with {} warnings)", self.warnings.len()),
            SessionStatus::Failed => format!("failed (at phase {})", self.phase),
            SessionStatus::Cancelled => "cancelled".to_string(),
            SessionStatus::PausedForReview => "paused_for_review".to_string(),
            SessionStatus::Running => format!("running ({})", self.phase),
        }
    }
}

// ---------------------------------------------------------------------------
// SiteBlueprint
// ---------------------------------------------------------------------------

fn default_weight() -> f64 {
    1.0
}

/// One element of the source site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceElement {
    /// Stable identifier, unique within the blueprint.
    pub id: String,
    /// Page (source path) the element belongs to.
    pub page: String,
    /// Semantic type, e.g. `hero`, `navigation`, `features`.
    pub semantic_type: String,
    /// Content payload fields (`heading`, `body`, `image`, ...).
    #[serde(default)]
    pub content: BTreeMap<String, String>,
    /// Style tokens (`color`, `font-family`, classes, ...).
    #[serde(default)]
    pub style_tokens: BTreeMap<String, String>,
    /// Relative prominence on its page, used by weighted page similarity.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl SourceElement {
    /// Parameters a target component must accept to carry this element.
    pub fn required_parameters(&self) -> BTreeSet<String> {
        self.content.keys().cloned().collect()
    }

    /// Key under which learnings about this kind of element are recorded.
    pub fn pattern_key(&self) -> String {
        let fields: Vec<&str> = self.content.keys().map(String::as_str).collect();
        format!("{}:{}", self.semantic_type, fields.join("+"))
    }
}

/// Immutable analysis of the source site, produced once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteBlueprint {
    pub source: String,
    #[serde(default)]
    pub title: String,
    pub elements: Vec<SourceElement>,
    pub analyzed_at: DateTime<Utc>,
}

impl SiteBlueprint {
    /// Distinct pages in first-appearance order.
    pub fn pages(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.elements
            .iter()
            .filter(|e| seen.insert(e.page.as_str()))
            .map(|e| e.page.clone())
            .collect()
    }

    /// Elements on a given page, in blueprint order.
    pub fn elements_on<'a>(&'a self, page: &'a str) -> impl Iterator<Item = &'a SourceElement> {
        self.elements.iter().filter(move |e| e.page == page)
    }

    pub fn element(&self, id: &str) -> Option<&SourceElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    /// Reject blueprints that downstream phases cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.elements.is_empty() {
            return Err(SiteportError::validation("blueprint has no source elements"));
        }
        let mut ids = BTreeSet::new();
        for el in &self.elements {
            if !ids.insert(el.id.as_str()) {
                return Err(SiteportError::validation(format!(
                    "duplicate source element id '{}'",
                    el.id
                )));
            }
            if !(el.weight.is_finite() && el.weight >= 0.0) {
                return Err(SiteportError::validation(format!(
                    "element '{}' has invalid weight {}",
                    el.id, el.weight
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Capability envelopes
// ---------------------------------------------------------------------------

/// Describes a target component the probing collaborator knows about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub id: String,
    /// Parameters every submission must carry.
    #[serde(default)]
    pub required: Vec<String>,
    /// Parameters to try incrementally on top of the required set.
    #[serde(default)]
    pub optional: Vec<String>,
}

/// Classification of a single probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeVerdict {
    Accepted,
    Rejected,
}

/// One trial submission against a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeObservation {
    pub parameters: BTreeSet<String>,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeObservation {
    pub fn verdict(&self) -> ProbeVerdict {
        if self.accepted {
            ProbeVerdict::Accepted
        } else {
            ProbeVerdict::Rejected
        }
    }
}

/// Verified record of what a target component accepts.
///
/// Envelopes are superseded, never mutated: a re-probe writes a new
/// version and swaps the current pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityEnvelope {
    pub component_id: String,
    /// Monotonic per component. `0` marks an unprobed placeholder.
    pub version: u64,
    pub observations: Vec<ProbeObservation>,
    pub probed_at: DateTime<Utc>,
}

impl CapabilityEnvelope {
    /// Low-confidence stand-in for a component nobody has probed yet.
    pub fn placeholder(component_id: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            version: 0,
            observations: Vec::new(),
            probed_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.version == 0
    }

    /// Union of parameters seen in accepted submissions.
    pub fn accepted_parameters(&self) -> BTreeSet<String> {
        self.observations
            .iter()
            .filter(|o| o.accepted)
            .flat_map(|o| o.parameters.iter().cloned())
            .collect()
    }

    /// Fraction of `required` the component is known to accept.
    pub fn coverage(&self, required: &BTreeSet<String>) -> f64 {
        if self.is_placeholder() {
            return 0.0;
        }
        if required.is_empty() {
            return if self.observations.iter().any(|o| o.accepted) {
                1.0
            } else {
                0.0
            };
        }
        let accepted = self.accepted_parameters();
        let covered = required.iter().filter(|p| accepted.contains(*p)).count();
        covered as f64 / required.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Mapping manifest
// ---------------------------------------------------------------------------

/// Confidence at or above this counts as "high" in manifest statistics.
pub const HIGH_CONFIDENCE: f64 = 0.8;
/// Confidence below this counts as "low" in manifest statistics.
pub const LOW_CONFIDENCE: f64 = 0.5;

/// Mapping decision for one source element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingItem {
    pub source_element_id: String,
    pub target_component_id: String,
    pub confidence: f64,
    pub fidelity_estimate: f64,
    #[serde(default)]
    pub compromises: BTreeSet<String>,
    pub requires_review: bool,
    /// Human-readable explanation of why this component was chosen.
    #[serde(default)]
    pub reasoning: String,
}

impl MappingItem {
    pub fn validate(&self) -> Result<()> {
        check_unit("confidence", self.confidence)?;
        check_unit("fidelity_estimate", self.fidelity_estimate)
    }
}

/// Confidence distribution of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingStats {
    pub total: usize,
    pub high_confidence: usize,
    pub medium_confidence: usize,
    pub low_confidence: usize,
    pub review_items: usize,
    pub average_fidelity: f64,
}

/// Ordered mapping decisions for a session's blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingManifest {
    /// Bumped on every partial rewrite.
    pub version: u32,
    pub items: Vec<MappingItem>,
    /// Envelope version used per component when the items were scored.
    #[serde(default)]
    pub envelope_versions: BTreeMap<String, u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MappingManifest {
    pub fn item(&self, element_id: &str) -> Option<&MappingItem> {
        self.items.iter().find(|i| i.source_element_id == element_id)
    }

    pub fn item_mut(&mut self, element_id: &str) -> Option<&mut MappingItem> {
        self.items
            .iter_mut()
            .find(|i| i.source_element_id == element_id)
    }

    /// A manifest is complete when every source element has an item.
    pub fn is_complete(&self, blueprint: &SiteBlueprint) -> bool {
        blueprint
            .elements
            .iter()
            .all(|e| self.item(&e.id).is_some())
    }

    pub fn validate(&self) -> Result<()> {
        self.items.iter().try_for_each(MappingItem::validate)
    }

    pub fn stats(&self) -> MappingStats {
        let total = self.items.len();
        let high = self
            .items
            .iter()
            .filter(|i| i.confidence >= HIGH_CONFIDENCE)
            .count();
        let low = self
            .items
            .iter()
            .filter(|i| i.confidence < LOW_CONFIDENCE)
            .count();
        let average_fidelity = if total == 0 {
            0.0
        } else {
            self.items.iter().map(|i| i.fidelity_estimate).sum::<f64>() / total as f64
        };
        MappingStats {
            total,
            high_confidence: high,
            medium_confidence: total - high - low,
            low_confidence: low,
            review_items: self.items.iter().filter(|i| i.requires_review).count(),
            average_fidelity,
        }
    }
}

// ---------------------------------------------------------------------------
// Refinement
// ---------------------------------------------------------------------------

/// What the scoring collaborator suggests doing next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionAction {
    Accept,
    MinorAdjustment,
    Refine,
    FocusRegion,
    ReviewMapping,
}

/// Structured refinement instruction returned by `score`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionInstruction {
    pub action: InstructionAction,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Result classification of a refinement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Improved,
    NoChange,
    Exhausted,
}

/// One build/score cycle for one item. Append-only per item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementAttempt {
    /// Source element id of the mapping item.
    pub item_id: String,
    /// 1-based within one micro loop run.
    pub iteration_index: u32,
    pub similarity: f64,
    #[serde(default)]
    pub instructions: Vec<RegionInstruction>,
    pub outcome: AttemptOutcome,
    /// Component that was placed.
    pub component_id: String,
    /// Set when `place` rejected the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
    /// Set when `score` could not run.
    #[serde(default)]
    pub scoring_unavailable: bool,
}

// ---------------------------------------------------------------------------
// Gap report
// ---------------------------------------------------------------------------

/// Human decision on a gap report item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Accept,
    Alternative,
    Exclude,
    Manual,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accept => "accept",
            Self::Alternative => "alternative",
            Self::Exclude => "exclude",
            Self::Manual => "manual",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = SiteportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "accept" => Ok(Self::Accept),
            "alternative" => Ok(Self::Alternative),
            "exclude" => Ok(Self::Exclude),
            "manual" => Ok(Self::Manual),
            other => Err(SiteportError::validation(format!(
                "unknown decision '{other}': expected accept, alternative, exclude, or manual"
            ))),
        }
    }
}

/// A mapping compromise awaiting (or carrying) a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapReportItem {
    pub source_element_id: String,
    pub component_used: String,
    pub fidelity_score: f64,
    #[serde(default)]
    pub compromises: BTreeSet<String>,
    pub decision: Decision,
}

/// Itemized compromises requiring a decision before publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapReport {
    pub session_id: SessionId,
    pub items: Vec<GapReportItem>,
    pub acceptability_threshold: f64,
    pub compiled_at: DateTime<Utc>,
}

impl GapReport {
    pub fn item(&self, element_id: &str) -> Option<&GapReportItem> {
        self.items.iter().find(|i| i.source_element_id == element_id)
    }

    pub fn pending_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.decision == Decision::Pending)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Knowledge
// ---------------------------------------------------------------------------

/// A learned, successful mapping pattern. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub pattern_key: String,
    pub successful_component: String,
    #[serde(default)]
    pub context_tags: BTreeSet<String>,
    pub fidelity_observed: f64,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Progress events
// ---------------------------------------------------------------------------

/// Status carried by a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Completed,
    Retrying,
    Warning,
    Skipped,
    Paused,
    Resumed,
    Failed,
    Cancelled,
    Done,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Retrying => "retrying",
            Self::Warning => "warning",
            Self::Skipped => "skipped",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = SiteportError;

    fn from_str(s: &str) -> Result<Self> {
        [
            Self::Started,
            Self::Completed,
            Self::Retrying,
            Self::Warning,
            Self::Skipped,
            Self::Paused,
            Self::Resumed,
            Self::Failed,
            Self::Cancelled,
            Self::Done,
        ]
        .into_iter()
        .find(|st| st.as_str() == s)
        .ok_or_else(|| SiteportError::validation(format!("unknown event status '{s}'")))
    }
}

/// One `{phase, status, detail}` record, ordered by `seq` within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: SessionId,
    pub seq: u64,
    pub phase: Phase,
    pub status: EventStatus,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(id: &str, page: &str, fields: &[&str]) -> SourceElement {
        SourceElement {
            id: id.into(),
            page: page.into(),
            semantic_type: "hero".into(),
            content: fields
                .iter()
                .map(|f| (f.to_string(), "x".to_string()))
                .collect(),
            style_tokens: BTreeMap::new(),
            weight: 1.0,
        }
    }

    #[test]
    fn session_id_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().expect("parse SessionId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn phases_run_forward_and_end_at_learn() {
        assert_eq!(Phase::Probe.next(), Some(Phase::Analyze));
        assert_eq!(Phase::Qa.next(), Some(Phase::HumanReview));
        assert_eq!(Phase::Publish.next(), Some(Phase::Learn));
        assert_eq!(Phase::Learn.next(), None);
        for p in Phase::ALL {
            assert_eq!(p.as_str().parse::<Phase>().unwrap(), p);
        }
    }

    #[test]
    fn criticality_matches_blast_radius_rules() {
        assert!(Phase::Probe.is_critical());
        assert!(Phase::Map.is_critical());
        assert!(Phase::Build.is_critical());
        assert!(!Phase::Theme.is_critical());
        assert!(!Phase::Content.is_critical());
        assert!(!Phase::Learn.is_critical());
    }

    #[test]
    fn session_summary_reports_outcome() {
        let mut s = JobSession::new("https://example.com");
        s.warn(Phase::Theme, "theme collaborator down");
        s.status = SessionStatus::Done;
        assert_eq!(s.summary(), "done (with 1 warnings)");

        s.status = SessionStatus::Failed;
        s.phase = Phase::Map;
        assert_eq!(s.summary(), "failed (at phase map)");
    }

    #[test]
    fn session_json_roundtrip_keeps_retry_map() {
        let mut s = JobSession::new("site");
        s.retries.insert(Phase::Build, 2);
        let json = serde_json::to_string(&s).expect("serialize");
        let back: JobSession = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.retries.get(&Phase::Build), Some(&2));
    }

    #[test]
    fn blueprint_pages_keep_first_appearance_order() {
        let bp = SiteBlueprint {
            source: "s".into(),
            title: String::new(),
            elements: vec![
                element("a", "/about", &["body"]),
                element("b", "/", &["body"]),
                element("c", "/about", &["heading"]),
            ],
            analyzed_at: Utc::now(),
        };
        assert_eq!(bp.pages(), vec!["/about".to_string(), "/".to_string()]);
        assert_eq!(bp.elements_on("/about").count(), 2);
        assert!(bp.validate().is_ok());
    }

    #[test]
    fn blueprint_rejects_duplicate_ids() {
        let bp = SiteBlueprint {
            source: "s".into(),
            title: String::new(),
            elements: vec![element("a", "/", &[]), element("a", "/", &[])],
            analyzed_at: Utc::now(),
        };
        assert!(bp.validate().is_err());
    }

    #[test]
    fn envelope_coverage_counts_accepted_parameters() {
        let env = CapabilityEnvelope {
            component_id: "article".into(),
            version: 2,
            observations: vec![
                ProbeObservation {
                    parameters: ["title".to_string()].into(),
                    accepted: true,
                    error: None,
                },
                ProbeObservation {
                    parameters: ["title".to_string(), "image".to_string()].into(),
                    accepted: false,
                    error: Some("unknown field image".into()),
                },
            ],
            probed_at: Utc::now(),
        };
        let required: BTreeSet<String> = ["title".to_string(), "image".to_string()].into();
        assert_eq!(env.coverage(&required), 0.5);
        assert_eq!(env.observations[1].verdict(), ProbeVerdict::Rejected);
        assert_eq!(CapabilityEnvelope::placeholder("x").coverage(&required), 0.0);
    }

    #[test]
    fn pattern_key_is_type_plus_sorted_fields() {
        let el = element("a", "/", &["image", "heading"]);
        assert_eq!(el.pattern_key(), "hero:heading+image");
    }

    #[test]
    fn decision_parsing() {
        assert_eq!("exclude".parse::<Decision>().unwrap(), Decision::Exclude);
        assert!("maybe".parse::<Decision>().is_err());
        assert!(!Decision::Pending.is_terminal());
        assert!(Decision::Manual.is_terminal());
    }

    #[test]
    fn clamp_unit_handles_nan_and_bounds() {
        assert_eq!(clamp_unit(f64::NAN), 0.0);
        assert_eq!(clamp_unit(1.7), 1.0);
        assert_eq!(clamp_unit(-0.2), 0.0);
        assert_eq!(clamp_unit(0.42), 0.42);
    }
}
