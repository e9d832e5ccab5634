//! Scripted in-memory collaborators for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use siteport_collaborators::{
    Analyzer, CollabResult, Collaborators, FinishReport, Finisher, HealthCheck, PlacementRef,
    PlacementTarget, Placer, Prober, Publisher, Score, Scorer, Verifier, VerifyReport,
};
use siteport_shared::{
    CollaboratorError, ComponentDescriptor, InstructionAction, MappingManifest, PipelineConfig,
    ProbeConfig, ProbeObservation, RegionInstruction, SessionId, SiteBlueprint, SourceElement,
};
use siteport_storage::KnowledgeStore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::EventBus;
use crate::pipeline::{PipelineContext, PipelineController};
use crate::probe::ProbeController;
use crate::retry::RetryPolicy;

pub(crate) async fn test_store() -> Arc<KnowledgeStore> {
    let tmp = std::env::temp_dir().join(format!("sp_test_{}.db", Uuid::now_v7()));
    Arc::new(KnowledgeStore::open(&tmp).await.expect("open test db"))
}

/// Pipeline over `store` driven by `scripted`, with millisecond backoff.
pub(crate) fn pipeline_over(store: Arc<KnowledgeStore>, scripted: &Arc<Scripted>) -> PipelineController {
    let collaborators = scripted.collaborators();
    let config = PipelineConfig {
        initial_backoff: Duration::from_millis(1),
        ..PipelineConfig::default()
    };
    let probe = Arc::new(ProbeController::new(
        store.clone(),
        collaborators.prober.clone(),
        ProbeConfig::default(),
        config.call_timeout,
        RetryPolicy::exponential(config.phase_retries, config.initial_backoff),
    ));
    let ctx = PipelineContext::new(store.clone(), collaborators, probe, config).expect("valid config");
    PipelineController::new(ctx, Arc::new(EventBus::new(store)))
}

pub(crate) fn element(id: &str, page: &str, kind: &str, fields: &[&str]) -> SourceElement {
    SourceElement {
        id: id.into(),
        page: page.into(),
        semantic_type: kind.into(),
        content: fields
            .iter()
            .map(|f| (f.to_string(), format!("{f} text")))
            .collect(),
        style_tokens: BTreeMap::new(),
        weight: 1.0,
    }
}

pub(crate) fn blueprint(elements: Vec<SourceElement>) -> SiteBlueprint {
    SiteBlueprint {
        source: "https://example.test".into(),
        title: "Example".into(),
        elements,
        analyzed_at: Utc::now(),
    }
}

/// Behaviour script for [`Scripted`].
#[derive(Default)]
pub(crate) struct Script {
    pub components: Vec<ComponentDescriptor>,
    /// Component -> parameters it accepts. Trials with any other parameter are rejected.
    pub accepts: HashMap<String, BTreeSet<String>>,
    pub blueprint: Option<SiteBlueprint>,
    pub reject_elements: BTreeSet<String>,
    /// Per-element similarity sequence; the last value repeats.
    pub element_scores: HashMap<String, VecDeque<f64>>,
    /// Constant similarity per placed component.
    pub component_scores: HashMap<String, f64>,
    pub default_score: f64,
    pub scoring_unavailable: bool,
    /// Operation -> number of transient failures to return before succeeding.
    pub transient: HashMap<&'static str, u32>,
    /// Operations that always fail with a protocol error.
    pub broken: BTreeSet<&'static str>,
    pub publish_result: Option<bool>,
    /// Fire the token while this operation is in flight; the call still succeeds.
    pub cancel_during: Option<(&'static str, CancellationToken)>,
}

impl Script {
    pub fn component(mut self, id: &str, required: &[&str], optional: &[&str], accepts: &[&str]) -> Self {
        self.components.push(ComponentDescriptor {
            id: id.into(),
            required: required.iter().map(|s| s.to_string()).collect(),
            optional: optional.iter().map(|s| s.to_string()).collect(),
        });
        self.accepts
            .insert(id.into(), accepts.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn blueprint(mut self, bp: SiteBlueprint) -> Self {
        self.blueprint = Some(bp);
        self
    }

    pub fn reject(mut self, element_id: &str) -> Self {
        self.reject_elements.insert(element_id.into());
        self
    }

    pub fn scores(mut self, element_id: &str, seq: &[f64]) -> Self {
        self.element_scores
            .insert(element_id.into(), seq.iter().copied().collect());
        self
    }

    pub fn component_score(mut self, component: &str, score: f64) -> Self {
        self.component_scores.insert(component.into(), score);
        self
    }

    pub fn default_score(mut self, score: f64) -> Self {
        self.default_score = score;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.scoring_unavailable = true;
        self
    }

    pub fn transient(mut self, op: &'static str, times: u32) -> Self {
        self.transient.insert(op, times);
        self
    }

    pub fn broken(mut self, op: &'static str) -> Self {
        self.broken.insert(op);
        self
    }

    pub fn cancel_during(mut self, op: &'static str, token: CancellationToken) -> Self {
        self.cancel_during = Some((op, token));
        self
    }

    pub fn build(self) -> Arc<Scripted> {
        Arc::new(Scripted {
            script: Mutex::new(self),
            calls: Mutex::new(Vec::new()),
            placements: AtomicU32::new(0),
            published: AtomicU32::new(0),
        })
    }
}

/// Collaborator fake driven by a [`Script`].
pub(crate) struct Scripted {
    script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
    placements: AtomicU32,
    pub published: AtomicU32,
}

impl Scripted {
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            analyzer: self.clone(),
            prober: self.clone(),
            placer: self.clone(),
            scorer: self.clone(),
            finisher: self.clone(),
            verifier: self.clone(),
            publisher: self.clone(),
            health: vec![("scripted".into(), self.clone())],
        }
    }

    /// Mutate the script mid-test.
    pub fn edit(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().expect("script lock"));
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|c| c.as_str() == op)
            .count()
    }

    fn enter(&self, op: &'static str) -> CollabResult<()> {
        self.calls.lock().expect("calls lock").push(op.to_string());
        let mut script = self.script.lock().expect("script lock");
        if script.broken.contains(op) {
            return Err(CollaboratorError::Protocol(format!("{op} is broken")));
        }
        if let Some(left) = script.transient.get_mut(op) {
            if *left > 0 {
                *left -= 1;
                return Err(CollaboratorError::transient(op, "scripted outage"));
            }
        }
        if let Some((when, token)) = &script.cancel_during {
            if *when == op {
                token.cancel();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for Scripted {
    async fn health(&self) -> CollabResult<()> {
        self.enter("health")
    }
}

#[async_trait]
impl Analyzer for Scripted {
    async fn analyze(&self, _source: &str) -> CollabResult<SiteBlueprint> {
        self.enter("analyze")?;
        self.script
            .lock()
            .expect("script lock")
            .blueprint
            .clone()
            .ok_or_else(|| CollaboratorError::Protocol("no blueprint scripted".into()))
    }
}

#[async_trait]
impl Prober for Scripted {
    async fn components(&self) -> CollabResult<Vec<ComponentDescriptor>> {
        self.enter("components")?;
        Ok(self.script.lock().expect("script lock").components.clone())
    }

    async fn probe(
        &self,
        component_id: &str,
        parameters: &BTreeSet<String>,
    ) -> CollabResult<ProbeObservation> {
        self.enter("probe")?;
        let script = self.script.lock().expect("script lock");
        let accepted = script
            .accepts
            .get(component_id)
            .is_some_and(|ok| parameters.is_subset(ok));
        Ok(ProbeObservation {
            parameters: parameters.clone(),
            accepted,
            error: (!accepted).then(|| "unsupported parameter".to_string()),
        })
    }
}

#[async_trait]
impl Placer for Scripted {
    async fn place(
        &self,
        component_id: &str,
        target: &PlacementTarget,
    ) -> CollabResult<PlacementRef> {
        self.enter("place")?;
        if self
            .script
            .lock()
            .expect("script lock")
            .reject_elements
            .contains(&target.element.id)
        {
            return Err(CollaboratorError::rejected("raw markup in payload"));
        }
        let n = self.placements.fetch_add(1, Ordering::SeqCst);
        Ok(PlacementRef(format!("{}|{component_id}|{n}", target.element.id)))
    }
}

#[async_trait]
impl Scorer for Scripted {
    async fn score(&self, placement: &PlacementRef) -> CollabResult<Score> {
        self.enter("score")?;
        let mut script = self.script.lock().expect("script lock");
        if script.scoring_unavailable {
            return Err(CollaboratorError::Unavailable("renderer_unavailable".into()));
        }
        let mut parts = placement.0.split('|');
        let element = parts.next().unwrap_or_default().to_string();
        let component = parts.next().unwrap_or_default().to_string();

        let similarity = if let Some(seq) = script.element_scores.get_mut(&element) {
            if seq.len() > 1 {
                seq.pop_front().unwrap_or_default()
            } else {
                seq.front().copied().unwrap_or_default()
            }
        } else if let Some(score) = script.component_scores.get(&component) {
            *score
        } else {
            script.default_score
        };

        Ok(Score {
            similarity,
            instructions: vec![RegionInstruction {
                action: InstructionAction::Refine,
                message: format!("tighten spacing on {element}"),
                region: Some(element),
            }],
        })
    }
}

#[async_trait]
impl Finisher for Scripted {
    async fn apply_theme(&self, _: SessionId, blueprint: &SiteBlueprint) -> CollabResult<FinishReport> {
        self.enter("theme")?;
        Ok(FinishReport {
            applied: blueprint.elements.len() as u32,
            notes: vec!["palette applied".into()],
        })
    }

    async fn migrate_content(&self, _: SessionId, manifest: &MappingManifest) -> CollabResult<FinishReport> {
        self.enter("content")?;
        Ok(FinishReport {
            applied: manifest.items.len() as u32,
            notes: Vec::new(),
        })
    }
}

#[async_trait]
impl Verifier for Scripted {
    async fn verify(&self, _: SessionId, _: &MappingManifest) -> CollabResult<VerifyReport> {
        self.enter("verify")?;
        Ok(VerifyReport {
            overall_score: 0.9,
            fixes_needed: Vec::new(),
        })
    }
}

#[async_trait]
impl Publisher for Scripted {
    async fn publish(
        &self,
        _: SessionId,
        _: &MappingManifest,
        _: &BTreeSet<String>,
    ) -> CollabResult<bool> {
        self.enter("publish")?;
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .script
            .lock()
            .expect("script lock")
            .publish_result
            .unwrap_or(true))
    }
}
