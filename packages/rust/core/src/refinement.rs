//! Micro (per item) and meso (per page) refinement loops.
//!
//! The micro loop repeats place → score until the item reaches the micro
//! threshold or runs out of iterations. The page loop combines the best
//! similarity of each item on a page and, while the page stays below the
//! meso threshold, remaps its weakest items and refines them again. Both
//! loops are bounded and hand unresolved items on to the gap report.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use siteport_collaborators::{PlacementTarget, Placer, Scorer, with_timeout};
use siteport_shared::{
    AttemptOutcome, CollaboratorError, MappingManifest, PageSimilarityPolicy, RefinementAttempt,
    RefinementConfig, Result, SessionId, SiteBlueprint, SiteportError, SourceElement, clamp_unit,
};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::mapping::RegionRemapper;

/// Result of one micro loop run.
#[derive(Debug, Clone, Default)]
pub struct MicroRun {
    pub attempts: Vec<RefinementAttempt>,
    /// Best similarity actually measured, if any attempt was scored.
    pub best: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// Page similarity reached the meso threshold.
    Complete,
    /// Loop bound reached or nothing left to remap; gaps go to review.
    AcceptedAsIs,
    /// No item on the page could be scored.
    Unscored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageOutcome {
    pub page: String,
    pub status: PageStatus,
    pub similarity: Option<f64>,
    pub iterations: u32,
    pub remap_cycles: u32,
    /// Elements whose mapping was rewritten by the page loop.
    pub remapped: BTreeSet<String>,
}

/// Everything the build phase produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub pages: Vec<PageOutcome>,
    /// Append-only attempt log per element id.
    pub attempts: BTreeMap<String, Vec<RefinementAttempt>>,
    /// Manifest after all remaps.
    pub manifest: MappingManifest,
}

/// Per-page result before it is merged into a [`BuildReport`].
#[derive(Debug, Clone)]
pub struct PageRun {
    pub outcome: PageOutcome,
    pub attempts: BTreeMap<String, Vec<RefinementAttempt>>,
}

#[derive(Clone)]
pub struct RefinementController {
    placer: Arc<dyn Placer>,
    scorer: Arc<dyn Scorer>,
    config: RefinementConfig,
    call_timeout: Duration,
    /// Caps concurrent place/score calls across all pages.
    permits: Arc<Semaphore>,
}

impl RefinementController {
    pub fn new(
        placer: Arc<dyn Placer>,
        scorer: Arc<dyn Scorer>,
        config: RefinementConfig,
        call_timeout: Duration,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_limit.max(1)));
        Self {
            placer,
            scorer,
            config,
            call_timeout,
            permits,
        }
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    /// Place and score one item until it converges or the bound is hit.
    ///
    /// A rejected payload or an unavailable scorer ends the loop at once
    /// with a single `exhausted` attempt. Cancellation is checked before
    /// every iteration and after every collaborator call; results that
    /// arrive after cancellation are dropped.
    pub async fn run_micro(
        &self,
        session_id: SessionId,
        element: &SourceElement,
        component_id: &str,
        cancel: &CancellationToken,
    ) -> Result<MicroRun> {
        let max = self.config.max_micro_iterations;
        let mut run = MicroRun::default();
        let mut instructions = Vec::new();

        for iteration in 1..=max {
            if cancel.is_cancelled() {
                return Err(SiteportError::Cancelled);
            }

            let attempt = |similarity: f64, outcome: AttemptOutcome| RefinementAttempt {
                item_id: element.id.clone(),
                iteration_index: iteration,
                similarity,
                instructions: Vec::new(),
                outcome,
                component_id: component_id.to_string(),
                rejection: None,
                scoring_unavailable: false,
            };

            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| SiteportError::Task(e.to_string()))?;

            let target = PlacementTarget {
                session_id,
                element: element.clone(),
                attempt: iteration,
                instructions: std::mem::take(&mut instructions),
            };
            let placement = match with_timeout(
                "place",
                self.call_timeout,
                self.placer.place(component_id, &target),
            )
            .await
            {
                Ok(placement) => placement,
                Err(CollaboratorError::ValidationRejected { reason }) => {
                    warn!(element = %element.id, component = component_id, %reason, "placement rejected");
                    run.attempts.push(RefinementAttempt {
                        rejection: Some(reason),
                        ..attempt(0.0, AttemptOutcome::Exhausted)
                    });
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            if cancel.is_cancelled() {
                return Err(SiteportError::Cancelled);
            }

            let scored = with_timeout("score", self.call_timeout, self.scorer.score(&placement)).await;
            drop(permit);
            let score = match scored {
                Ok(score) => score,
                Err(CollaboratorError::Unavailable(reason)) => {
                    warn!(element = %element.id, %reason, "scoring unavailable, stopping refinement");
                    run.attempts.push(RefinementAttempt {
                        scoring_unavailable: true,
                        ..attempt(0.0, AttemptOutcome::Exhausted)
                    });
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            if cancel.is_cancelled() {
                return Err(SiteportError::Cancelled);
            }

            let similarity = clamp_unit(score.similarity);
            run.best = Some(run.best.map_or(similarity, |b| b.max(similarity)));
            let outcome = if similarity >= self.config.micro_threshold {
                AttemptOutcome::Improved
            } else if iteration >= max {
                AttemptOutcome::Exhausted
            } else {
                AttemptOutcome::NoChange
            };
            debug!(element = %element.id, component = component_id, iteration, similarity, ?outcome, "micro attempt");

            run.attempts.push(RefinementAttempt {
                instructions: score.instructions.clone(),
                ..attempt(similarity, outcome)
            });
            if outcome != AttemptOutcome::NoChange {
                break;
            }
            instructions = score.instructions;
        }

        Ok(run)
    }

    /// Run micro loops for several items concurrently.
    async fn run_items(
        &self,
        session_id: SessionId,
        items: Vec<(SourceElement, String)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, MicroRun)>> {
        let mut handles = Vec::with_capacity(items.len());
        for (element, component) in items {
            let ctl = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let run = ctl.run_micro(session_id, &element, &component, &cancel).await;
                (element.id, run)
            }));
        }

        let mut runs = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok((id, Ok(run))) => runs.push((id, run)),
                Ok((_, Err(e))) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(SiteportError::Task(e.to_string()));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(runs),
        }
    }

    /// Refine every item of `page`, remapping weak items while the page
    /// stays below the meso threshold.
    #[instrument(skip_all, fields(session_id = %session_id, page = %page))]
    pub async fn run_page(
        &self,
        session_id: SessionId,
        page: &str,
        blueprint: &SiteBlueprint,
        manifest: &Mutex<MappingManifest>,
        remapper: &dyn RegionRemapper,
        cancel: &CancellationToken,
    ) -> Result<PageRun> {
        let elements: Vec<&SourceElement> = blueprint.elements_on(page).collect();
        let mut attempts: BTreeMap<String, Vec<RefinementAttempt>> = BTreeMap::new();
        let mut best: BTreeMap<String, f64> = BTreeMap::new();
        let mut avoid: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut remapped = BTreeSet::new();
        let mut remap_cycles = 0;
        let mut iterations = 1;

        let mut pending: Vec<(SourceElement, String)> = {
            let m = manifest.lock().await;
            elements
                .iter()
                .filter_map(|el| {
                    m.item(&el.id)
                        .map(|item| ((*el).clone(), item.target_component_id.clone()))
                })
                .collect()
        };

        let (status, similarity) = loop {
            if cancel.is_cancelled() {
                return Err(SiteportError::Cancelled);
            }

            for (id, run) in self.run_items(session_id, pending, cancel).await? {
                match run.best {
                    Some(b) => {
                        best.insert(id.clone(), b);
                    }
                    None => {
                        best.remove(&id);
                    }
                }
                attempts.entry(id).or_default().extend(run.attempts);
            }

            let Some(similarity) = page_similarity(self.config.page_similarity, &elements, &best) else {
                break (PageStatus::Unscored, None);
            };
            if similarity >= self.config.meso_threshold {
                break (PageStatus::Complete, Some(similarity));
            }
            if remap_cycles >= self.config.max_meso_iterations {
                break (PageStatus::AcceptedAsIs, Some(similarity));
            }

            let weak: Vec<String> = elements
                .iter()
                .filter(|el| best.get(&el.id).is_some_and(|b| *b < self.config.min_similarity))
                .map(|el| el.id.clone())
                .collect();
            if weak.is_empty() {
                break (PageStatus::AcceptedAsIs, Some(similarity));
            }

            // The manifest is shared with the other pages of this build, so
            // the remap happens under the lock.
            let changed: Vec<(SourceElement, String)> = {
                let mut m = manifest.lock().await;
                for id in &weak {
                    if let Some(item) = m.item(id) {
                        avoid
                            .entry(id.clone())
                            .or_default()
                            .insert(item.target_component_id.clone());
                    }
                }
                let next = remapper.remap(&m, &weak, &avoid).await?;
                let changed = weak
                    .iter()
                    .filter_map(|id| {
                        let before = m.item(id)?;
                        let after = next.item(id)?;
                        if before.target_component_id == after.target_component_id {
                            return None;
                        }
                        Some((blueprint.element(id)?.clone(), after.target_component_id.clone()))
                    })
                    .collect();
                *m = next;
                changed
            };
            remap_cycles += 1;
            info!(page, cycle = remap_cycles, weak = weak.len(), changed = changed.len(), similarity, "page below threshold, remapped weak items");

            if changed.is_empty() {
                break (PageStatus::AcceptedAsIs, Some(similarity));
            }
            remapped.extend(changed.iter().map(|(el, _)| el.id.clone()));
            pending = changed;
            iterations += 1;
        };

        info!(page, ?status, similarity, iterations, remap_cycles, "page refinement finished");
        Ok(PageRun {
            outcome: PageOutcome {
                page: page.to_string(),
                status,
                similarity,
                iterations,
                remap_cycles,
                remapped,
            },
            attempts,
        })
    }

    /// Refine every page of `blueprint`; pages run concurrently.
    #[instrument(skip_all, fields(session_id = %session_id, pages = tracing::field::Empty))]
    pub async fn run_build(
        &self,
        session_id: SessionId,
        blueprint: Arc<SiteBlueprint>,
        manifest: MappingManifest,
        remapper: Arc<dyn RegionRemapper>,
        cancel: &CancellationToken,
    ) -> Result<BuildReport> {
        let pages = blueprint.pages();
        tracing::Span::current().record("pages", pages.len());
        let manifest = Arc::new(Mutex::new(manifest));

        let mut handles = Vec::with_capacity(pages.len());
        for page in pages {
            let ctl = self.clone();
            let blueprint = blueprint.clone();
            let manifest = manifest.clone();
            let remapper = remapper.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                ctl.run_page(session_id, &page, &blueprint, &manifest, remapper.as_ref(), &cancel)
                    .await
            }));
        }

        let mut report_pages = Vec::new();
        let mut attempts = BTreeMap::new();
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(run)) => {
                    report_pages.push(run.outcome);
                    attempts.extend(run.attempts);
                }
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(SiteportError::Task(e.to_string()));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let manifest = manifest.lock().await.clone();
        Ok(BuildReport {
            pages: report_pages,
            attempts,
            manifest,
        })
    }
}

/// Best similarity actually measured for `component` in an attempt log.
pub fn best_similarity(attempts: &[RefinementAttempt], component: &str) -> Option<f64> {
    attempts
        .iter()
        .filter(|a| a.component_id == component && a.rejection.is_none() && !a.scoring_unavailable)
        .map(|a| a.similarity)
        .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))))
}

/// Combine the best similarity of each scored item on a page.
///
/// Unscored items do not count. Returns `None` when nothing was scored.
pub fn page_similarity(
    policy: PageSimilarityPolicy,
    elements: &[&SourceElement],
    best: &BTreeMap<String, f64>,
) -> Option<f64> {
    let scored: Vec<(f64, f64)> = elements
        .iter()
        .filter_map(|el| best.get(&el.id).map(|s| (el.weight, *s)))
        .collect();
    if scored.is_empty() {
        return None;
    }

    let mean = scored.iter().map(|(_, s)| s).sum::<f64>() / scored.len() as f64;
    let value = match policy {
        PageSimilarityPolicy::Mean => mean,
        PageSimilarityPolicy::Weighted => {
            let total: f64 = scored.iter().map(|(w, _)| w).sum();
            if total > 0.0 {
                scored.iter().map(|(w, s)| w * s).sum::<f64>() / total
            } else {
                mean
            }
        }
    };
    Some(clamp_unit(value))
}
