//! Session state machine: probe → analyze → train → map → build → theme →
//! content → verify → qa → human review → publish → learn.
//!
//! Each phase is one handler selected by [`Phase`]; handlers read earlier
//! phase outputs from the session namespace of the store and persist their
//! own before the session moves on. Transient failures are retried with
//! backoff, critical failures end the session, non-critical ones become
//! warnings.
//!
//! Several processes may share one store. A driver holds a lease on the
//! session while it runs, and treats a `cancelled` status written by anyone
//! else as its own cancellation.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use siteport_collaborators::{CollabResult, Collaborators, with_timeout};
use siteport_shared::{
    Decision, EventStatus, GapReport, JobSession, KnowledgeEntry, MappingManifest, Phase, PhaseFailure,
    PipelineConfig, Result, SessionId, SessionStatus, SiteBlueprint, SiteportError,
};
use siteport_storage::KnowledgeStore;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::events::EventBus;
use crate::gap::{DecisionChange, GapReviewGate};
use crate::learn::KnowledgeWriter;
use crate::mapping::{MappingEngine, StoreRemapper};
use crate::probe::ProbeController;
use crate::refinement::{BuildReport, PageStatus, RefinementController};
use crate::retry::RetryPolicy;

/// Keys of phase outputs under `session/{id}/`.
pub mod outputs {
    pub const PROBE: &str = "probe_summary";
    pub const BLUEPRINT: &str = "blueprint";
    pub const KNOWLEDGE: &str = "knowledge_snapshot";
    pub const MANIFEST: &str = "manifest";
    pub const BUILD: &str = "build_report";
    pub const THEME: &str = "theme";
    pub const CONTENT: &str = "content";
    pub const VERIFY: &str = "verify";
    pub const GAP: &str = "gap_report";
    pub const PUBLISH: &str = "publish";
    pub const LEARN: &str = "learn";
}

/// How long a driver's claim on a session survives without renewal.
const LEASE_TTL: Duration = Duration::from_secs(30);

/// How often a driver renews its lease and looks for outside cancellation.
const STATUS_POLL: Duration = Duration::from_millis(250);

/// Attempts at a conditional gap report update before giving up.
const DECISION_ATTEMPTS: u32 = 5;

/// What a phase handler reports back to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseResult {
    Completed(String),
    Skipped(String),
    /// Number of gap items still pending.
    AwaitingReview(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub published: bool,
    pub excluded: BTreeSet<String>,
    pub at: DateTime<Utc>,
}

/// Everything a phase handler may use.
pub struct PipelineContext {
    pub store: Arc<KnowledgeStore>,
    pub collaborators: Collaborators,
    pub probe: Arc<ProbeController>,
    pub mapping: MappingEngine,
    pub refinement: RefinementController,
    pub gate: GapReviewGate,
    pub writer: KnowledgeWriter,
    pub config: PipelineConfig,
}

impl PipelineContext {
    pub fn new(
        store: Arc<KnowledgeStore>,
        collaborators: Collaborators,
        probe: Arc<ProbeController>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let refinement = RefinementController::new(
            collaborators.placer.clone(),
            collaborators.scorer.clone(),
            config.refinement.clone(),
            config.call_timeout,
        );
        Ok(Self {
            mapping: MappingEngine::new(config.mapping.clone()),
            gate: GapReviewGate::new(config.acceptability_threshold),
            writer: KnowledgeWriter::new(config.learn_min_fidelity),
            refinement,
            store,
            collaborators,
            probe,
            config,
        })
    }

    async fn call<T>(&self, operation: &str, call: impl Future<Output = CollabResult<T>>) -> Result<T> {
        Ok(with_timeout(operation, self.config.call_timeout, call).await?)
    }

    async fn output<T: DeserializeOwned>(&self, id: SessionId, key: &str) -> Result<T> {
        self.store
            .session_output(id, key)
            .await?
            .ok_or_else(|| SiteportError::NotFound(format!("session {id} has no {key}")))
    }

    /// Fail with `Cancelled` once the token fires or the stored session
    /// has been cancelled.
    async fn checkpoint(&self, id: SessionId, cancel: &CancellationToken) -> Result<()> {
        checkpoint(cancel)?;
        if self.store.session_status(id).await? == Some(SessionStatus::Cancelled) {
            return Err(SiteportError::Cancelled);
        }
        Ok(())
    }

    /// Persist a phase output unless the session was cancelled meanwhile.
    async fn persist<T: Serialize>(
        &self,
        id: SessionId,
        key: &str,
        value: &T,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.checkpoint(id, cancel).await?;
        self.store.put_session_output(id, key, value).await?;
        Ok(())
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(SiteportError::Cancelled)
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Phase handlers
// ---------------------------------------------------------------------------

/// Run the handler for `phase`.
pub async fn execute(
    phase: Phase,
    session: &JobSession,
    ctx: &PipelineContext,
    cancel: &CancellationToken,
) -> Result<PhaseResult> {
    checkpoint(cancel)?;
    match phase {
        Phase::Probe => probe_envelopes(session, ctx, cancel).await,
        Phase::Analyze => analyze_source(session, ctx, cancel).await,
        Phase::Train => load_knowledge(session, ctx, cancel).await,
        Phase::Map => map_elements(session, ctx, cancel).await,
        Phase::Build => build_and_refine(session, ctx, cancel).await,
        Phase::Theme => apply_theme(session, ctx, cancel).await,
        Phase::Content => migrate_content(session, ctx, cancel).await,
        Phase::Verify => verify_site(session, ctx, cancel).await,
        Phase::Qa => compile_gaps(session, ctx, cancel).await,
        Phase::HumanReview => await_review(session, ctx).await,
        Phase::Publish => publish_site(session, ctx, cancel).await,
        Phase::Learn => record_learnings(session, ctx, cancel).await,
    }
}

async fn probe_envelopes(session: &JobSession, ctx: &PipelineContext, cancel: &CancellationToken) -> Result<PhaseResult> {
    let summary = ctx.probe.probe_all(false).await?;
    ctx.persist(session.id, outputs::PROBE, &summary, cancel).await?;
    Ok(PhaseResult::Completed(summary.describe()))
}

async fn analyze_source(session: &JobSession, ctx: &PipelineContext, cancel: &CancellationToken) -> Result<PhaseResult> {
    let blueprint = ctx
        .call("analyze", ctx.collaborators.analyzer.analyze(&session.source))
        .await?;
    blueprint.validate()?;
    ctx.persist(session.id, outputs::BLUEPRINT, &blueprint, cancel).await?;
    Ok(PhaseResult::Completed(format!(
        "{} elements on {} pages",
        blueprint.elements.len(),
        blueprint.pages().len()
    )))
}

async fn load_knowledge(session: &JobSession, ctx: &PipelineContext, cancel: &CancellationToken) -> Result<PhaseResult> {
    let knowledge = ctx.store.knowledge_entries().await?;
    ctx.persist(session.id, outputs::KNOWLEDGE, &knowledge, cancel).await?;
    Ok(PhaseResult::Completed(format!("{} knowledge entries loaded", knowledge.len())))
}

async fn map_elements(session: &JobSession, ctx: &PipelineContext, cancel: &CancellationToken) -> Result<PhaseResult> {
    let blueprint: SiteBlueprint = ctx.output(session.id, outputs::BLUEPRINT).await?;
    let knowledge: Vec<KnowledgeEntry> = ctx
        .store
        .session_output(session.id, outputs::KNOWLEDGE)
        .await?
        .unwrap_or_default();
    let envelopes = ctx.store.current_envelopes().await?;

    let manifest = ctx.mapping.map(&blueprint, &envelopes, &knowledge);
    manifest.validate()?;
    if !manifest.is_complete(&blueprint) {
        return Err(SiteportError::validation("manifest does not cover every source element"));
    }
    ctx.persist(session.id, outputs::MANIFEST, &manifest, cancel).await?;

    let stats = manifest.stats();
    Ok(PhaseResult::Completed(format!(
        "{} items: {} high, {} medium, {} low confidence, {} flagged for review",
        stats.total, stats.high_confidence, stats.medium_confidence, stats.low_confidence, stats.review_items
    )))
}

async fn build_and_refine(session: &JobSession, ctx: &PipelineContext, cancel: &CancellationToken) -> Result<PhaseResult> {
    let blueprint = Arc::new(ctx.output::<SiteBlueprint>(session.id, outputs::BLUEPRINT).await?);
    let manifest: MappingManifest = ctx.output(session.id, outputs::MANIFEST).await?;
    let initial_version = manifest.version;
    let remapper = Arc::new(StoreRemapper::new(
        ctx.mapping.clone(),
        ctx.store.clone(),
        blueprint.clone(),
    ));

    let report = ctx
        .refinement
        .run_build(session.id, blueprint, manifest, remapper, cancel)
        .await?;

    if report.manifest.version != initial_version {
        ctx.persist(session.id, outputs::MANIFEST, &report.manifest, cancel).await?;
    }
    ctx.persist(session.id, outputs::BUILD, &report, cancel).await?;

    let complete = report
        .pages
        .iter()
        .filter(|p| p.status == PageStatus::Complete)
        .count();
    Ok(PhaseResult::Completed(format!(
        "{complete}/{} pages complete, manifest v{}",
        report.pages.len(),
        report.manifest.version
    )))
}

async fn apply_theme(session: &JobSession, ctx: &PipelineContext, cancel: &CancellationToken) -> Result<PhaseResult> {
    let blueprint: SiteBlueprint = ctx.output(session.id, outputs::BLUEPRINT).await?;
    if blueprint.elements.iter().all(|e| e.style_tokens.is_empty()) {
        return Ok(PhaseResult::Skipped("no style tokens in blueprint".to_string()));
    }
    let report = ctx
        .call("theme", ctx.collaborators.finisher.apply_theme(session.id, &blueprint))
        .await?;
    ctx.persist(session.id, outputs::THEME, &report, cancel).await?;
    Ok(PhaseResult::Completed(format!("theme applied to {} elements", report.applied)))
}

async fn migrate_content(session: &JobSession, ctx: &PipelineContext, cancel: &CancellationToken) -> Result<PhaseResult> {
    let manifest: MappingManifest = ctx.output(session.id, outputs::MANIFEST).await?;
    let report = ctx
        .call("content", ctx.collaborators.finisher.migrate_content(session.id, &manifest))
        .await?;
    ctx.persist(session.id, outputs::CONTENT, &report, cancel).await?;
    Ok(PhaseResult::Completed(format!("{} content items migrated", report.applied)))
}

async fn verify_site(session: &JobSession, ctx: &PipelineContext, cancel: &CancellationToken) -> Result<PhaseResult> {
    let manifest: MappingManifest = ctx.output(session.id, outputs::MANIFEST).await?;
    let report = ctx
        .call("verify", ctx.collaborators.verifier.verify(session.id, &manifest))
        .await?;
    ctx.persist(session.id, outputs::VERIFY, &report, cancel).await?;
    Ok(PhaseResult::Completed(format!(
        "overall score {:.2}, {} fixes needed",
        report.overall_score,
        report.fixes_needed.len()
    )))
}

async fn compile_gaps(session: &JobSession, ctx: &PipelineContext, cancel: &CancellationToken) -> Result<PhaseResult> {
    let build: BuildReport = ctx.output(session.id, outputs::BUILD).await?;
    let report = ctx.gate.compile(session.id, &build.manifest, &build.attempts);
    ctx.persist(session.id, outputs::GAP, &report, cancel).await?;
    Ok(PhaseResult::Completed(format!("{} items need a decision", report.items.len())))
}

async fn await_review(session: &JobSession, ctx: &PipelineContext) -> Result<PhaseResult> {
    let report: GapReport = ctx.output(session.id, outputs::GAP).await?;
    let pending = report.pending_count();
    if pending > 0 {
        return Ok(PhaseResult::AwaitingReview(pending));
    }
    Ok(PhaseResult::Completed(if report.items.is_empty() {
        "nothing to review".to_string()
    } else {
        format!("{} decisions recorded", report.items.len())
    }))
}

#[instrument(skip_all, fields(session_id = %session.id))]
async fn publish_site(session: &JobSession, ctx: &PipelineContext, cancel: &CancellationToken) -> Result<PhaseResult> {
    let report: GapReport = ctx.output(session.id, outputs::GAP).await?;
    if !ctx.gate.is_complete(&report) {
        return Err(SiteportError::InvalidTransition(format!(
            "publish blocked: {} gap items pending",
            report.pending_count()
        )));
    }
    let manifest: MappingManifest = ctx.output(session.id, outputs::MANIFEST).await?;
    let excluded = ctx.gate.excluded(&report);

    ctx.checkpoint(session.id, cancel).await?;
    let published = ctx
        .call(
            "publish",
            ctx.collaborators.publisher.publish(session.id, &manifest, &excluded),
        )
        .await?;

    // The side effect already happened; record it even if cancelled now.
    let record = PublishRecord {
        published,
        excluded,
        at: Utc::now(),
    };
    ctx.store
        .put_session_output(session.id, outputs::PUBLISH, &record)
        .await?;
    if !published {
        return Err(SiteportError::validation("publisher reported the site was not published"));
    }
    info!(excluded = record.excluded.len(), "site published");
    Ok(PhaseResult::Completed(format!(
        "published, {} elements excluded",
        record.excluded.len()
    )))
}

async fn record_learnings(session: &JobSession, ctx: &PipelineContext, cancel: &CancellationToken) -> Result<PhaseResult> {
    let blueprint: SiteBlueprint = ctx.output(session.id, outputs::BLUEPRINT).await?;
    let manifest: MappingManifest = ctx.output(session.id, outputs::MANIFEST).await?;
    let build: BuildReport = ctx.output(session.id, outputs::BUILD).await?;
    let report: Option<GapReport> = ctx.store.session_output(session.id, outputs::GAP).await?;

    let entries = ctx
        .writer
        .extract(&blueprint, &manifest, report.as_ref(), &build.attempts);
    ctx.checkpoint(session.id, cancel).await?;
    let written = ctx.writer.record(&ctx.store, &entries).await?;
    ctx.persist(session.id, outputs::LEARN, &written, cancel).await?;
    Ok(PhaseResult::Completed(format!("{written} learnings recorded")))
}

// ---------------------------------------------------------------------------
// PipelineController
// ---------------------------------------------------------------------------

pub struct PipelineController {
    ctx: PipelineContext,
    events: Arc<EventBus>,
    retry: RetryPolicy,
    /// Lease owner id of this controller.
    owner: String,
    /// Serializes gap report updates within this process.
    decisions: Mutex<()>,
}

impl PipelineController {
    pub fn new(ctx: PipelineContext, events: Arc<EventBus>) -> Self {
        let retry = RetryPolicy::exponential(ctx.config.phase_retries, ctx.config.initial_backoff);
        Self {
            ctx,
            events,
            retry,
            owner: Uuid::now_v7().to_string(),
            decisions: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Check collaborators are reachable and create a running session.
    #[instrument(skip_all, fields(source = %source))]
    pub async fn start(&self, source: &str) -> Result<JobSession> {
        let source = source.trim();
        if source.is_empty() {
            return Err(SiteportError::validation("source must not be empty"));
        }
        self.ctx
            .collaborators
            .check_health(self.ctx.config.call_timeout)
            .await?;

        let session = JobSession::new(source);
        self.ctx.store.save_session(&session).await?;
        info!(session_id = %session.id, "session created");
        Ok(session)
    }

    /// Execute the current phase and transition the session.
    #[instrument(skip_all, fields(session_id = %session.id, phase = %session.phase))]
    pub async fn advance(&self, session: &mut JobSession, cancel: &CancellationToken) -> Result<()> {
        if session.status != SessionStatus::Running {
            return Err(SiteportError::InvalidTransition(format!(
                "cannot advance a session that is {}",
                session.status.as_str()
            )));
        }
        if cancel.is_cancelled() || self.cancelled_elsewhere(session.id).await? {
            return self.mark_cancelled(session).await;
        }

        let phase = session.phase;
        self.events
            .emit(session.id, phase, EventStatus::Started, "")
            .await?;

        let mut retry = 0;
        let result = loop {
            match execute(phase, session, &self.ctx, cancel).await {
                Err(e) if e.is_transient() && retry < self.retry.max_retries => {
                    retry += 1;
                    *session.retries.entry(phase).or_default() += 1;
                    let delay = self.retry.delay_for(retry);
                    warn!(retry, delay_ms = delay.as_millis() as u64, error = %e, "transient phase failure, retrying");
                    self.events
                        .emit(
                            session.id,
                            phase,
                            EventStatus::Retrying,
                            format!("retry {retry}/{}: {e}", self.retry.max_retries),
                        )
                        .await?;
                    tokio::select! {
                        _ = cancel.cancelled() => break Err(SiteportError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => break other,
            }
        };

        match result {
            Ok(PhaseResult::Completed(detail)) => {
                self.events
                    .emit(session.id, phase, EventStatus::Completed, detail)
                    .await?;
                self.step(session).await?;
            }
            Ok(PhaseResult::Skipped(detail)) => {
                self.events
                    .emit(session.id, phase, EventStatus::Skipped, detail)
                    .await?;
                self.step(session).await?;
            }
            Ok(PhaseResult::AwaitingReview(pending)) => {
                session.status = SessionStatus::PausedForReview;
                info!(pending, "paused for review");
                self.events
                    .emit(
                        session.id,
                        phase,
                        EventStatus::Paused,
                        format!("{pending} gap items awaiting a decision"),
                    )
                    .await?;
            }
            Err(SiteportError::Cancelled) => return self.mark_cancelled(session).await,
            Err(e) if phase.is_critical() => {
                error!(error = %e, "critical phase failed");
                session.status = SessionStatus::Failed;
                session.failure = Some(PhaseFailure {
                    phase,
                    message: e.to_string(),
                });
                self.events
                    .emit(session.id, phase, EventStatus::Failed, e.to_string())
                    .await?;
            }
            Err(e) => {
                warn!(error = %e, "non-critical phase failed, continuing");
                session.warn(phase, e.to_string());
                self.events
                    .emit(session.id, phase, EventStatus::Warning, e.to_string())
                    .await?;
                self.step(session).await?;
            }
        }

        session.touch();
        self.ctx.store.save_session(session).await
    }

    /// Move to the next phase, or finish after the last one.
    async fn step(&self, session: &mut JobSession) -> Result<()> {
        match session.phase.next() {
            Some(next) => session.phase = next,
            None => {
                session.status = SessionStatus::Done;
                self.events
                    .emit(session.id, session.phase, EventStatus::Done, session.summary())
                    .await?;
            }
        }
        Ok(())
    }

    async fn cancelled_elsewhere(&self, id: SessionId) -> Result<bool> {
        Ok(self.ctx.store.session_status(id).await? == Some(SessionStatus::Cancelled))
    }

    async fn mark_cancelled(&self, session: &mut JobSession) -> Result<()> {
        if let Some(stored) = self.ctx.store.load_session(session.id).await? {
            if stored.status == SessionStatus::Cancelled {
                *session = stored;
                info!(session_id = %session.id, phase = %session.phase, "session was cancelled elsewhere");
                return Ok(());
            }
        }
        session.status = SessionStatus::Cancelled;
        session.touch();
        self.events
            .emit(session.id, session.phase, EventStatus::Cancelled, "cancelled")
            .await?;
        info!(session_id = %session.id, phase = %session.phase, "session cancelled");
        self.ctx.store.save_session(session).await
    }

    /// Advance until the session pauses or reaches a terminal state.
    ///
    /// Holds the session lease for the whole run; fails with
    /// `InvalidTransition` while another driver holds it.
    pub async fn run(&self, session: &mut JobSession, cancel: &CancellationToken) -> Result<()> {
        let id = session.id;
        if !self.ctx.store.acquire_lease(id, &self.owner, LEASE_TTL).await? {
            return Err(SiteportError::InvalidTransition(format!(
                "session {id} is driven by another process"
            )));
        }

        let token = cancel.child_token();
        let stop = CancellationToken::new();
        let drive = async {
            let result: Result<()> = async {
                while session.status == SessionStatus::Running {
                    self.advance(session, &token).await?;
                }
                Ok(())
            }
            .await;
            stop.cancel();
            result
        };
        let (result, ()) = tokio::join!(drive, self.watch(id, &token, &stop));

        if let Err(e) = self.ctx.store.release_lease(id, &self.owner).await {
            warn!(session_id = %id, error = %e, "failed to release session lease");
        }
        result?;
        info!(session_id = %id, outcome = %session.summary(), "session stopped");
        Ok(())
    }

    /// Renew the lease and fire `token` once the stored session is
    /// cancelled, until `stop` fires.
    async fn watch(&self, id: SessionId, token: &CancellationToken, stop: &CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(STATUS_POLL) => {}
            }
            match self.cancelled_elsewhere(id).await {
                Ok(true) => {
                    info!(session_id = %id, "cancellation observed in store");
                    token.cancel();
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!(session_id = %id, error = %e, "session status check failed"),
            }
            match self.ctx.store.acquire_lease(id, &self.owner, LEASE_TTL).await {
                Ok(true) => {}
                Ok(false) => warn!(session_id = %id, "session lease taken by another driver"),
                Err(e) => warn!(session_id = %id, error = %e, "lease renewal failed"),
            }
        }
    }

    /// Cancel a session that is not being advanced right now.
    pub async fn cancel(&self, session: &mut JobSession) -> Result<()> {
        if session.status.is_terminal() {
            return Err(SiteportError::InvalidTransition(format!(
                "session is already {}",
                session.status.as_str()
            )));
        }
        self.mark_cancelled(session).await
    }

    pub async fn load(&self, id: SessionId) -> Result<JobSession> {
        self.ctx
            .store
            .load_session(id)
            .await?
            .ok_or_else(|| SiteportError::NotFound(format!("session {id}")))
    }

    /// Reload a session so it can be run again.
    ///
    /// A running session (left over from a restart) is returned as is. A
    /// paused session resumes only once every gap item is decided. Calling
    /// this twice is harmless.
    pub async fn resume(&self, id: SessionId) -> Result<JobSession> {
        let mut session = self.load(id).await?;
        match session.status {
            SessionStatus::Running => {
                match self.ctx.store.lease_holder(id).await? {
                    Some(holder) if holder != self.owner => Err(SiteportError::InvalidTransition(
                        format!("session {id} is driven by another process"),
                    )),
                    _ => Ok(session),
                }
            }
            SessionStatus::PausedForReview => {
                let report: GapReport = self.ctx.output(id, outputs::GAP).await?;
                if !self.ctx.gate.is_complete(&report) {
                    return Err(SiteportError::InvalidTransition(format!(
                        "{} gap items still pending",
                        report.pending_count()
                    )));
                }
                session.status = SessionStatus::Running;
                session.touch();
                self.ctx.store.save_session(&session).await?;
                self.events
                    .emit(id, session.phase, EventStatus::Resumed, "all decisions recorded")
                    .await?;
                info!(session_id = %id, "session resumed");
                Ok(session)
            }
            status => Err(SiteportError::InvalidTransition(format!(
                "session is {}",
                status.as_str()
            ))),
        }
    }

    pub async fn gap_report(&self, id: SessionId) -> Result<Option<GapReport>> {
        self.ctx.store.session_output(id, outputs::GAP).await
    }

    /// Record a human decision on one gap item.
    pub async fn record_decision(
        &self,
        id: SessionId,
        item_id: &str,
        decision: Decision,
    ) -> Result<(GapReport, DecisionChange)> {
        let _guard = self.decisions.lock().await;
        let session = self.load(id).await?;
        if session.status.is_terminal() {
            return Err(SiteportError::InvalidTransition(format!(
                "session is {}",
                session.status.as_str()
            )));
        }

        // Another process may update the report between our read and
        // write, so the write is conditional on the version we read.
        let mut attempt = 0;
        loop {
            attempt += 1;
            let stored = self
                .ctx
                .store
                .session_output_versioned::<GapReport>(id, outputs::GAP)
                .await?
                .ok_or_else(|| SiteportError::NotFound(format!("session {id} has no {}", outputs::GAP)))?;
            let mut report = stored.value;
            let change = self.ctx.gate.record_decision(&mut report, item_id, decision)?;
            if change != DecisionChange::Applied {
                return Ok((report, change));
            }

            match self
                .ctx
                .store
                .put_session_output_if(id, outputs::GAP, stored.version, &report)
                .await
            {
                Ok(_) => {
                    info!(session_id = %id, item = item_id, %decision, remaining = report.pending_count(), "decision recorded");
                    return Ok((report, change));
                }
                Err(SiteportError::Conflict(reason)) if attempt < DECISION_ATTEMPTS => {
                    debug!(session_id = %id, attempt, %reason, "gap report changed underneath, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
