//! Gap report compilation and the human review gate.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use siteport_shared::{
    Decision, GapReport, GapReportItem, MappingManifest, RefinementAttempt, Result, SessionId,
    SiteportError,
};
use tracing::{debug, info};

use crate::refinement::best_similarity;

/// Whether [`GapReviewGate::record_decision`] changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionChange {
    Applied,
    /// Same decision recorded twice.
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct GapReviewGate {
    acceptability_threshold: f64,
}

impl GapReviewGate {
    pub fn new(acceptability_threshold: f64) -> Self {
        Self {
            acceptability_threshold,
        }
    }

    /// Collect every item that needs a human decision.
    ///
    /// An item is included when its best measured similarity (or, if it was
    /// never scored, its estimated fidelity) is below the acceptability
    /// threshold, when mapping flagged it for review, when its payload was
    /// rejected, or when it could not be scored at all.
    pub fn compile(
        &self,
        session_id: SessionId,
        manifest: &MappingManifest,
        attempts: &BTreeMap<String, Vec<RefinementAttempt>>,
    ) -> GapReport {
        let threshold = self.acceptability_threshold;
        let mut items = Vec::new();

        for item in &manifest.items {
            let log: Vec<RefinementAttempt> = attempts
                .get(&item.source_element_id)
                .map(|log| {
                    log.iter()
                        .filter(|a| a.component_id == item.target_component_id)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            let measured = best_similarity(&log, &item.target_component_id);
            let rejection = log.iter().rev().find_map(|a| a.rejection.clone());
            let unverified = measured.is_none() && log.iter().any(|a| a.scoring_unavailable);

            let score = match (&rejection, measured) {
                (_, Some(s)) => s,
                (Some(_), None) => 0.0,
                (None, None) => item.fidelity_estimate,
            };

            if score >= threshold && !item.requires_review && rejection.is_none() && !unverified {
                continue;
            }

            let mut compromises: BTreeSet<String> = item.compromises.clone();
            if let Some(reason) = &rejection {
                compromises.insert(format!("placement rejected: {reason}"));
            }
            if unverified {
                compromises.insert("scoring unavailable, fidelity is an estimate".to_string());
            }
            if score < threshold {
                compromises.insert(format!(
                    "fidelity {score:.2} below acceptability threshold {threshold:.2}"
                ));
            }

            debug!(element = %item.source_element_id, component = %item.target_component_id, score, "gap item");
            items.push(GapReportItem {
                source_element_id: item.source_element_id.clone(),
                component_used: item.target_component_id.clone(),
                fidelity_score: score,
                compromises,
                decision: Decision::Pending,
            });
        }

        info!(%session_id, items = items.len(), threshold, "gap report compiled");
        GapReport {
            session_id,
            items,
            acceptability_threshold: threshold,
            compiled_at: Utc::now(),
        }
    }

    /// Record a human decision. Decisions move from `pending` to exactly one
    /// terminal value; repeating it is a no-op, changing it is rejected.
    pub fn record_decision(
        &self,
        report: &mut GapReport,
        item_id: &str,
        decision: Decision,
    ) -> Result<DecisionChange> {
        if !decision.is_terminal() {
            return Err(SiteportError::validation("pending is not a decision"));
        }
        let item = report
            .items
            .iter_mut()
            .find(|i| i.source_element_id == item_id)
            .ok_or_else(|| SiteportError::UnknownItem(item_id.to_string()))?;

        match item.decision {
            Decision::Pending => {
                item.decision = decision;
                Ok(DecisionChange::Applied)
            }
            current if current == decision => Ok(DecisionChange::Unchanged),
            current => Err(SiteportError::DecisionRejected {
                item_id: item_id.to_string(),
                current,
                requested: decision,
            }),
        }
    }

    pub fn is_complete(&self, report: &GapReport) -> bool {
        report.pending_count() == 0
    }

    /// Elements the reviewer chose to leave out of the published site.
    pub fn excluded(&self, report: &GapReport) -> BTreeSet<String> {
        report
            .items
            .iter()
            .filter(|i| i.decision == Decision::Exclude)
            .map(|i| i.source_element_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use siteport_shared::{AttemptOutcome, MappingItem};

    use super::*;

    fn item(id: &str, component: &str, fidelity: f64, review: bool) -> MappingItem {
        MappingItem {
            source_element_id: id.into(),
            target_component_id: component.into(),
            confidence: if review { 0.3 } else { 0.9 },
            fidelity_estimate: fidelity,
            compromises: BTreeSet::new(),
            requires_review: review,
            reasoning: String::new(),
        }
    }

    fn manifest(items: Vec<MappingItem>) -> MappingManifest {
        MappingManifest {
            version: 1,
            items,
            envelope_versions: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn scored(id: &str, component: &str, similarity: f64) -> RefinementAttempt {
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

    fn gate() -> GapReviewGate {
        GapReviewGate::new(0.75)
    }

    #[test]
    fn compile_selects_weak_flagged_and_rejected_items() {
        let m = manifest(vec![
            item("good", "page", 0.8, false),
            item("weak", "page", 0.8, false),
            item("flagged", "page", 0.9, true),
            item("rejected", "page", 0.9, false),
            item("unscored", "page", 0.8, false),
        ]);
        let attempts = BTreeMap::from([
            ("good".to_string(), vec![scored("good", "page", 0.9)]),
            ("weak".to_string(), vec![scored("weak", "page", 0.4)]),
            ("flagged".to_string(), vec![scored("flagged", "page", 0.95)]),
            (
                "rejected".to_string(),
                vec![RefinementAttempt {
                    rejection: Some("raw markup".into()),
                    outcome: AttemptOutcome::Exhausted,
                    ..scored("rejected", "page", 0.0)
                }],
            ),
            (
                "unscored".to_string(),
                vec![RefinementAttempt {
                    scoring_unavailable: true,
                    ..scored("unscored", "page", 0.0)
                }],
            ),
        ]);

        let report = gate().compile(SessionId::new(), &m, &attempts);
        let ids: Vec<_> = report.items.iter().map(|i| i.source_element_id.as_str()).collect();
        assert_eq!(ids, vec!["weak", "flagged", "rejected", "unscored"]);
        assert!(report.items.iter().all(|i| i.decision == Decision::Pending));

        let rejected = report.item("rejected").unwrap();
        assert_eq!(rejected.fidelity_score, 0.0);
        assert!(rejected.compromises.contains("placement rejected: raw markup"));

        let unscored = report.item("unscored").unwrap();
        assert_eq!(unscored.fidelity_score, 0.8);
        assert!(unscored.compromises.contains("scoring unavailable, fidelity is an estimate"));
    }

    #[test]
    fn attempts_on_replaced_components_are_ignored() {
        let m = manifest(vec![item("e1", "page", 0.8, false)]);
        let attempts = BTreeMap::from([(
            "e1".to_string(),
            vec![scored("e1", "article", 0.1), scored("e1", "page", 0.9)],
        )]);
        let report = gate().compile(SessionId::new(), &m, &attempts);
        assert!(report.items.is_empty());
        assert!(gate().is_complete(&report));
    }

    #[test]
    fn decisions_are_monotonic_and_idempotent() {
        let m = manifest(vec![item("e1", "page", 0.1, true)]);
        let mut report = gate().compile(SessionId::new(), &m, &BTreeMap::new());

        assert_eq!(gate().record_decision(&mut report, "e1", Decision::Accept).unwrap(), DecisionChange::Applied);
        assert_eq!(gate().record_decision(&mut report, "e1", Decision::Accept).unwrap(), DecisionChange::Unchanged);

        let before = report.clone();
        let err = gate().record_decision(&mut report, "e1", Decision::Exclude).unwrap_err();
        assert!(matches!(
            err,
            SiteportError::DecisionRejected { current: Decision::Accept, requested: Decision::Exclude, .. }
        ));
        assert_eq!(report, before);
    }

    #[test]
    fn invalid_decisions_are_refused() {
        let m = manifest(vec![item("e1", "page", 0.1, true)]);
        let mut report = gate().compile(SessionId::new(), &m, &BTreeMap::new());

        assert!(matches!(
            gate().record_decision(&mut report, "e1", Decision::Pending),
            Err(SiteportError::Validation { .. })
        ));
        assert!(matches!(
            gate().record_decision(&mut report, "ghost", Decision::Accept),
            Err(SiteportError::UnknownItem(_))
        ));
        assert_eq!(report.pending_count(), 1);
    }

    #[test]
    fn excluded_lists_only_excluded_items() {
        let m = manifest(vec![item("a", "page", 0.1, true), item("b", "page", 0.1, true)]);
        let mut report = gate().compile(SessionId::new(), &m, &BTreeMap::new());
        gate().record_decision(&mut report, "a", Decision::Exclude).unwrap();
        gate().record_decision(&mut report, "b", Decision::Manual).unwrap();
        assert_eq!(gate().excluded(&report), BTreeSet::from(["a".to_string()]));
    }

    fn arb_decision() -> impl Strategy<Value = Decision> {
        prop::sample::select(vec![
            Decision::Accept,
            Decision::Alternative,
            Decision::Exclude,
            Decision::Manual,
        ])
    }

    proptest! {
        #[test]
        fn report_completes_only_after_every_item_is_decided(
            n in 1usize..10,
            decisions in prop::collection::vec(arb_decision(), 10),
            order in Just((0..10usize).collect::<Vec<_>>()).prop_shuffle(),
        ) {
            let m = manifest((0..n).map(|i| item(&format!("e{i}"), "page", 0.1, true)).collect());
            let mut report = gate().compile(SessionId::new(), &m, &BTreeMap::new());
            let order: Vec<usize> = order.into_iter().filter(|i| *i < n).collect();

            for (step, idx) in order.iter().enumerate() {
                prop_assert!(!gate().is_complete(&report));
                gate().record_decision(&mut report, &format!("e{idx}"), decisions[*idx]).unwrap();
                prop_assert_eq!(report.pending_count(), n - step - 1);
            }
            prop_assert!(gate().is_complete(&report));
        }
    }
}
