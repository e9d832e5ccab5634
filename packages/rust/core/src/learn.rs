//! Post-publish learning: successful mappings become knowledge entries that
//! later sessions use when scoring candidates.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use siteport_shared::{
    Decision, GapReport, KnowledgeEntry, MappingManifest, RefinementAttempt, Result, SiteBlueprint,
};
use siteport_storage::KnowledgeStore;
use tracing::info;

use crate::refinement::best_similarity;

#[derive(Debug, Clone)]
pub struct KnowledgeWriter {
    min_fidelity: f64,
}

impl KnowledgeWriter {
    pub fn new(min_fidelity: f64) -> Self {
        Self { min_fidelity }
    }

    /// Entries for every item whose measured similarity reached the minimum
    /// fidelity and that the reviewer did not replace or drop.
    pub fn extract(
        &self,
        blueprint: &SiteBlueprint,
        manifest: &MappingManifest,
        report: Option<&GapReport>,
        attempts: &BTreeMap<String, Vec<RefinementAttempt>>,
    ) -> Vec<KnowledgeEntry> {
        let now = Utc::now();
        manifest
            .items
            .iter()
            .filter(|item| {
                let decision = report
                    .and_then(|r| r.item(&item.source_element_id))
                    .map(|i| i.decision);
                !matches!(
                    decision,
                    Some(Decision::Exclude | Decision::Manual | Decision::Alternative)
                )
            })
            .filter_map(|item| {
                let element = blueprint.element(&item.source_element_id)?;
                let log = attempts.get(&item.source_element_id)?;
                let fidelity = best_similarity(log, &item.target_component_id)?;
                (fidelity >= self.min_fidelity).then(|| KnowledgeEntry {
                    pattern_key: element.pattern_key(),
                    successful_component: item.target_component_id.clone(),
                    context_tags: BTreeSet::from([
                        format!("type:{}", element.semantic_type),
                        format!("page:{}", element.page),
                    ]),
                    fidelity_observed: fidelity,
                    recorded_at: now,
                })
            })
            .collect()
    }

    /// Append `entries` to the store.
    pub async fn record(&self, store: &KnowledgeStore, entries: &[KnowledgeEntry]) -> Result<usize> {
        let written = store.append_knowledge(entries).await?;
        info!(written, "knowledge recorded");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use siteport_shared::{AttemptOutcome, GapReportItem, MappingConfig, SessionId};

    use super::*;
    use crate::mapping::MappingEngine;
    use crate::testing::{blueprint, element, test_store};

    fn attempt(id: &str, component: &str, similarity: f64) -> RefinementAttempt {
        RefinementAttempt {
            item_id: id.into(),
            iteration_index: 1,
            similarity,
            instructions: Vec::new(),
            outcome: AttemptOutcome::Improved,
            component_id: component.into(),
            rejection: None,
            scoring_unavailable: false,
        }
    }

    #[tokio::test]
    async fn records_only_successful_undisputed_items() {
        let bp = blueprint(vec![
            element("good", "/", "hero", &["heading"]),
            element("weak", "/", "hero", &["heading"]),
            element("excluded", "/", "footer", &["link"]),
            element("unscored", "/", "blog", &["body"]),
        ]);
        let manifest = MappingEngine::new(MappingConfig::default()).map(&bp, &BTreeMap::new(), &[]);
        let component = |id: &str| manifest.item(id).unwrap().target_component_id.clone();
        let attempts = BTreeMap::from([
            ("good".to_string(), vec![attempt("good", &component("good"), 0.92)]),
            ("weak".to_string(), vec![attempt("weak", &component("weak"), 0.5)]),
            ("excluded".to_string(), vec![attempt("excluded", &component("excluded"), 0.95)]),
        ]);
        let report = GapReport {
            session_id: SessionId::new(),
            items: vec![GapReportItem {
                source_element_id: "excluded".into(),
                component_used: component("excluded"),
                fidelity_score: 0.95,
                compromises: BTreeSet::new(),
                decision: Decision::Exclude,
            }],
            acceptability_threshold: 0.75,
            compiled_at: Utc::now(),
        };

        let writer = KnowledgeWriter::new(0.8);
        let entries = writer.extract(&bp, &manifest, Some(&report), &attempts);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pattern_key, "hero:heading");
        assert_eq!(entries[0].successful_component, "page");
        assert!(entries[0].context_tags.contains("type:hero"));

        let store = test_store().await;
        assert_eq!(writer.record(&store, &entries).await.unwrap(), 1);
        assert_eq!(store.knowledge_for_pattern("hero:heading").await.unwrap().len(), 1);
    }
}
