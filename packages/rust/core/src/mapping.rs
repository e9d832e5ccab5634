//! Source-element to target-component mapping.
//!
//! Every candidate component is scored by
//!
//! ```text
//! confidence = w_env * coverage + w_hist * mean_fidelity * n / (n + k)
//! ```
//!
//! where `coverage` is the share of the element's fields the component's
//! envelope accepts, `n` the number of matching knowledge entries and `k`
//! the history saturation constant. When no candidate carries any evidence
//! the semantic-type default (or the fallback component) is used with a
//! conservative confidence.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use siteport_shared::{
    CapabilityEnvelope, KnowledgeEntry, MappingConfig, MappingItem, MappingManifest, Result,
    SiteBlueprint, SiteportError, SourceElement, clamp_unit,
};
use siteport_storage::KnowledgeStore;
use tracing::{debug, instrument};

/// Fidelity assumed when nothing is known about a component.
const UNKNOWN_FIDELITY: f64 = 0.3;
/// Additional structural fidelity at full envelope coverage.
const STRUCTURAL_SPAN: f64 = 0.5;

// ---------------------------------------------------------------------------
// Knowledge index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct History {
    samples: u32,
    mean_fidelity: f64,
    last_used: DateTime<Utc>,
}

/// Knowledge entries aggregated per `(pattern, component)`.
#[derive(Debug, Default)]
struct KnowledgeIndex {
    by_pattern: HashMap<String, BTreeMap<String, History>>,
}

impl KnowledgeIndex {
    fn build(entries: &[KnowledgeEntry]) -> Self {
        let mut by_pattern: HashMap<String, BTreeMap<String, History>> = HashMap::new();
        for entry in entries {
            let slot = by_pattern
                .entry(entry.pattern_key.clone())
                .or_default()
                .entry(entry.successful_component.clone())
                .or_insert(History {
                    samples: 0,
                    mean_fidelity: 0.0,
                    last_used: entry.recorded_at,
                });
            let n = slot.samples as f64;
            slot.mean_fidelity = (slot.mean_fidelity * n + clamp_unit(entry.fidelity_observed)) / (n + 1.0);
            slot.samples += 1;
            slot.last_used = slot.last_used.max(entry.recorded_at);
        }
        Self { by_pattern }
    }

    fn for_pattern(&self, key: &str) -> Option<&BTreeMap<String, History>> {
        self.by_pattern.get(key)
    }
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Candidate {
    component: String,
    confidence: f64,
    fidelity: f64,
    samples: u32,
    last_used: Option<DateTime<Utc>>,
    envelope_version: Option<u64>,
    compromises: BTreeSet<String>,
    reasoning: Vec<String>,
}

impl Candidate {
    /// Higher confidence, then more history samples, then most recently
    /// used, then component id.
    fn rank(a: &Candidate, b: &Candidate) -> Ordering {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.samples.cmp(&a.samples))
            .then_with(|| b.last_used.cmp(&a.last_used))
            .then_with(|| a.component.cmp(&b.component))
    }

    fn into_item(self, element_id: &str, review_threshold: f64) -> MappingItem {
        MappingItem {
            source_element_id: element_id.to_string(),
            target_component_id: self.component,
            confidence: clamp_unit(self.confidence),
            fidelity_estimate: clamp_unit(self.fidelity),
            compromises: self.compromises,
            requires_review: self.confidence < review_threshold,
            reasoning: self.reasoning.join("; "),
        }
    }
}

/// Inputs for re-scoring part of a manifest.
pub struct RemapInputs<'a> {
    pub blueprint: &'a SiteBlueprint,
    pub envelopes: &'a BTreeMap<String, CapabilityEnvelope>,
    pub knowledge: &'a [KnowledgeEntry],
    /// Components already tried per element; never proposed again.
    pub avoid: &'a BTreeMap<String, BTreeSet<String>>,
}

// ---------------------------------------------------------------------------
// MappingEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MappingEngine {
    config: MappingConfig,
}

impl MappingEngine {
    pub fn new(config: MappingConfig) -> Self {
        Self { config }
    }

    /// Map every blueprint element to its best component.
    #[instrument(skip_all, fields(elements = blueprint.elements.len(), envelopes = envelopes.len()))]
    pub fn map(
        &self,
        blueprint: &SiteBlueprint,
        envelopes: &BTreeMap<String, CapabilityEnvelope>,
        knowledge: &[KnowledgeEntry],
    ) -> MappingManifest {
        let index = KnowledgeIndex::build(knowledge);
        let none = BTreeSet::new();
        let now = Utc::now();

        let mut items = Vec::with_capacity(blueprint.elements.len());
        let mut envelope_versions = BTreeMap::new();
        for element in &blueprint.elements {
            let chosen = self.choose(element, envelopes, &index, &none);
            if let Some(v) = chosen.envelope_version {
                envelope_versions.insert(chosen.component.clone(), v);
            }
            items.push(chosen.into_item(&element.id, self.config.review_threshold));
        }

        let manifest = MappingManifest {
            version: 1,
            items,
            envelope_versions,
            created_at: now,
            updated_at: now,
        };
        let stats = manifest.stats();
        debug!(
            high = stats.high_confidence,
            medium = stats.medium_confidence,
            low = stats.low_confidence,
            review = stats.review_items,
            "mapping complete"
        );
        manifest
    }

    /// Re-score only `element_ids`, avoiding components already tried for
    /// them, and bump the manifest version.
    pub fn remap_region(
        &self,
        manifest: &MappingManifest,
        element_ids: &[String],
        inputs: &RemapInputs<'_>,
    ) -> Result<MappingManifest> {
        let index = KnowledgeIndex::build(inputs.knowledge);
        let mut next = manifest.clone();

        for id in element_ids {
            let element = inputs
                .blueprint
                .element(id)
                .ok_or_else(|| SiteportError::UnknownItem(id.clone()))?;
            let previous = next
                .item(id)
                .map(|item| item.target_component_id.clone())
                .ok_or_else(|| SiteportError::UnknownItem(id.clone()))?;

            let mut avoid = inputs.avoid.get(id).cloned().unwrap_or_default();
            avoid.insert(previous.clone());

            if self.candidates(element, inputs.envelopes, &index, &avoid).is_empty() {
                if let Some(current) = next.item_mut(id) {
                    current.requires_review = true;
                    current
                        .compromises
                        .insert("no alternative component left".to_string());
                }
                continue;
            }

            let chosen = self.choose(element, inputs.envelopes, &index, &avoid);
            if let Some(v) = chosen.envelope_version {
                next.envelope_versions.insert(chosen.component.clone(), v);
            }
            let mut item = chosen.into_item(id, self.config.review_threshold);
            item.reasoning = format!("remapped from {previous}; {}", item.reasoning);
            if let Some(current) = next.item_mut(id) {
                *current = item;
            }
        }

        next.version += 1;
        next.updated_at = Utc::now();
        Ok(next)
    }

    fn candidates(
        &self,
        element: &SourceElement,
        envelopes: &BTreeMap<String, CapabilityEnvelope>,
        index: &KnowledgeIndex,
        avoid: &BTreeSet<String>,
    ) -> Vec<Candidate> {
        let history = index.for_pattern(&element.pattern_key());

        let mut ids: BTreeSet<&str> = envelopes
            .values()
            .filter(|e| !e.is_placeholder())
            .map(|e| e.component_id.as_str())
            .collect();
        if let Some(h) = history {
            ids.extend(h.keys().map(String::as_str));
        }
        if let Some(default) = self.config.default_components.get(&element.semantic_type) {
            ids.insert(default.as_str());
        }
        ids.insert(self.config.fallback_component.as_str());

        ids.into_iter()
            .filter(|id| !avoid.contains(*id))
            .map(|id| self.score(element, id, envelopes.get(id), history.and_then(|h| h.get(id))))
            .collect()
    }

    fn score(
        &self,
        element: &SourceElement,
        component: &str,
        envelope: Option<&CapabilityEnvelope>,
        history: Option<&History>,
    ) -> Candidate {
        let required = element.required_parameters();
        let mut compromises = BTreeSet::new();
        let mut reasoning = Vec::new();

        let known = envelope.filter(|e| !e.is_placeholder());
        let coverage = match known {
            Some(env) => {
                let accepted = env.accepted_parameters();
                for missing in required.iter().filter(|p| !accepted.contains(*p)) {
                    compromises.insert(format!("unsupported field: {missing}"));
                }
                let covered = required.len() - required.iter().filter(|p| !accepted.contains(*p)).count();
                reasoning.push(format!(
                    "structural match {covered}/{} fields (envelope v{})",
                    required.len(),
                    env.version
                ));
                env.coverage(&required)
            }
            None => {
                compromises.insert(format!("capability unknown for {component}"));
                reasoning.push("no verified envelope".to_string());
                0.0
            }
        };

        let (samples, mean) = history.map_or((0, 0.0), |h| (h.samples, h.mean_fidelity));
        let k = f64::from(self.config.history_saturation);
        let n = f64::from(samples);
        let sample_factor = if samples == 0 { 0.0 } else { n / (n + k) };
        if samples > 0 {
            reasoning.insert(
                0,
                format!("learned from {samples} prior migrations (mean fidelity {mean:.2})"),
            );
        }

        let confidence = clamp_unit(
            self.config.envelope_weight * coverage + self.config.history_weight * mean * sample_factor,
        );

        let structural = if known.is_some() {
            UNKNOWN_FIDELITY + STRUCTURAL_SPAN * coverage
        } else {
            UNKNOWN_FIDELITY
        };
        let fidelity = if samples > 0 {
            (mean * n + structural * k) / (n + k)
        } else {
            structural
        };

        Candidate {
            component: component.to_string(),
            confidence,
            fidelity: clamp_unit(fidelity),
            samples,
            last_used: history.map(|h| h.last_used),
            envelope_version: known.map(|e| e.version),
            compromises,
            reasoning,
        }
    }

    fn choose(
        &self,
        element: &SourceElement,
        envelopes: &BTreeMap<String, CapabilityEnvelope>,
        index: &KnowledgeIndex,
        avoid: &BTreeSet<String>,
    ) -> Candidate {
        let mut candidates = self.candidates(element, envelopes, index, avoid);
        candidates.sort_by(Candidate::rank);

        let has_evidence = candidates.first().is_some_and(|c| c.confidence > 0.0);
        if has_evidence {
            return candidates.swap_remove(0);
        }

        // Nothing matched: conservative default.
        let preferred = self
            .config
            .default_components
            .get(&element.semantic_type)
            .filter(|c| !avoid.contains(*c))
            .unwrap_or(&self.config.fallback_component);
        let pos = candidates
            .iter()
            .position(|c| &c.component == preferred)
            .unwrap_or(0);

        let mut chosen = if candidates.is_empty() {
            self.score(element, preferred, envelopes.get(preferred), None)
        } else {
            candidates.swap_remove(pos)
        };
        chosen.confidence = self.config.default_confidence;
        chosen.compromises.insert("conservative default mapping".to_string());
        chosen
            .reasoning
            .insert(0, format!("conservative default for '{}'", element.semantic_type));
        chosen
    }
}

// ---------------------------------------------------------------------------
// Remapping seam for the page loop
// ---------------------------------------------------------------------------

/// Re-scores weak regions of a manifest on behalf of the page loop.
#[async_trait]
pub trait RegionRemapper: Send + Sync {
    async fn remap(
        &self,
        manifest: &MappingManifest,
        element_ids: &[String],
        avoid: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<MappingManifest>;
}

/// Remaps against the freshest envelopes and knowledge in the store.
pub struct StoreRemapper {
    engine: MappingEngine,
    store: Arc<KnowledgeStore>,
    blueprint: Arc<SiteBlueprint>,
}

impl StoreRemapper {
    pub fn new(engine: MappingEngine, store: Arc<KnowledgeStore>, blueprint: Arc<SiteBlueprint>) -> Self {
        Self {
            engine,
            store,
            blueprint,
        }
    }
}

#[async_trait]
impl RegionRemapper for StoreRemapper {
    async fn remap(
        &self,
        manifest: &MappingManifest,
        element_ids: &[String],
        avoid: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<MappingManifest> {
        let envelopes = self.store.current_envelopes().await?;
        let knowledge = self.store.knowledge_entries().await?;
        self.engine.remap_region(
            manifest,
            element_ids,
            &RemapInputs {
                blueprint: &self.blueprint,
                envelopes: &envelopes,
                knowledge: &knowledge,
                avoid,
            },
        )
    }
}
