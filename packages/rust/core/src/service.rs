//! Job management surface: starts sessions in the background, answers status
//! queries, and forwards review decisions.

use std::collections::HashMap;
use std::sync::Arc;

use siteport_collaborators::Collaborators;
use siteport_shared::{
    AppConfig, Decision, GapReport, JobSession, KnowledgeEntry, PipelineConfig, ProbeConfig,
    ProgressEvent, Result, SessionId, SessionStatus, SiteportError,
};
use siteport_storage::KnowledgeStore;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::EventBus;
use crate::gap::DecisionChange;
use crate::pipeline::{PipelineContext, PipelineController};
use crate::probe::{ProbeController, ProbeSummary};
use crate::retry::RetryPolicy;

struct RunningJob {
    /// Taken by whoever waits on the run.
    handle: Option<JoinHandle<Result<JobSession>>>,
    cancel: CancellationToken,
}

impl RunningJob {
    fn is_active(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| !h.is_finished())
    }
}

pub struct MigrationService {
    pipeline: Arc<PipelineController>,
    running: Mutex<HashMap<SessionId, RunningJob>>,
    shutdown: CancellationToken,
}

impl MigrationService {
    pub fn new(pipeline: PipelineController) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            running: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Wire the full engine from application config.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<KnowledgeStore>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let pipeline_config = PipelineConfig::from(config);
        let probe_config = ProbeConfig::from(config);
        probe_config.validate()?;

        let probe = Arc::new(ProbeController::new(
            store.clone(),
            collaborators.prober.clone(),
            probe_config,
            pipeline_config.call_timeout,
            RetryPolicy::exponential(pipeline_config.phase_retries, pipeline_config.initial_backoff),
        ));
        let events = Arc::new(EventBus::new(store.clone()));
        let ctx = PipelineContext::new(store, collaborators, probe, pipeline_config)?;
        Ok(Self::new(PipelineController::new(ctx, events)))
    }

    pub fn pipeline(&self) -> &Arc<PipelineController> {
        &self.pipeline
    }

    /// Create a session and run it in the background.
    pub async fn start_job(&self, source: &str) -> Result<SessionId> {
        let session = self.pipeline.start(source).await?;
        let id = session.id;
        let mut running = self.running.lock().await;
        self.spawn(&mut running, session);
        Ok(id)
    }

    fn spawn(&self, running: &mut HashMap<SessionId, RunningJob>, mut session: JobSession) {
        let cancel = self.shutdown.child_token();
        let token = cancel.clone();
        let pipeline = self.pipeline.clone();
        let id = session.id;
        let handle = tokio::spawn(async move {
            pipeline.run(&mut session, &token).await?;
            Ok(session)
        });
        running.insert(
            id,
            RunningJob {
                handle: Some(handle),
                cancel,
            },
        );
    }

    /// Wait for the background run of a session to stop (done, paused,
    /// failed or cancelled) and return the session.
    pub async fn wait(&self, id: SessionId) -> Result<JobSession> {
        let handle = self
            .running
            .lock()
            .await
            .get_mut(&id)
            .and_then(|job| job.handle.take());
        let Some(handle) = handle else {
            return self.pipeline.load(id).await;
        };

        let outcome = handle.await;
        let mut running = self.running.lock().await;
        if running.get(&id).is_some_and(|job| job.handle.is_none()) {
            running.remove(&id);
        }
        drop(running);
        outcome.map_err(|e| SiteportError::Task(e.to_string()))?
    }

    pub async fn get_job_status(&self, id: SessionId) -> Result<JobSession> {
        self.pipeline.load(id).await
    }

    pub async fn get_gap_report(&self, id: SessionId) -> Result<GapReport> {
        self.pipeline
            .gap_report(id)
            .await?
            .ok_or_else(|| SiteportError::NotFound(format!("session {id} has no gap report yet")))
    }

    /// Record a decision. The session resumes on its own once the last
    /// pending item is decided.
    pub async fn submit_review_decision(
        &self,
        id: SessionId,
        item_id: &str,
        decision: Decision,
    ) -> Result<DecisionChange> {
        let (report, change) = self.pipeline.record_decision(id, item_id, decision).await?;
        if report.pending_count() == 0 {
            let session = self.pipeline.load(id).await?;
            if session.status == SessionStatus::PausedForReview {
                self.resume_job(id).await?;
            }
        }
        Ok(change)
    }

    /// Resume a paused session, or pick up a running one nobody is driving.
    pub async fn resume_job(&self, id: SessionId) -> Result<JobSession> {
        let mut running = self.running.lock().await;
        if running.get(&id).is_some_and(RunningJob::is_active) {
            return self.pipeline.load(id).await;
        }
        let session = self.pipeline.resume(id).await?;
        self.spawn(&mut running, session.clone());
        Ok(session)
    }

    /// Cancel a session. A background run stops at its next checkpoint and
    /// its in-flight phase output is discarded.
    pub async fn cancel_job(&self, id: SessionId) -> Result<JobSession> {
        let mut running = self.running.lock().await;
        if let Some(job) = running.get_mut(&id) {
            if job.is_active() {
                job.cancel.cancel();
                let handle = job.handle.take();
                running.remove(&id);
                drop(running);
                return match handle {
                    Some(handle) => handle
                        .await
                        .map_err(|e| SiteportError::Task(e.to_string()))?,
                    // Someone is waiting on the run; they observe the outcome.
                    None => self.pipeline.load(id).await,
                };
            }
            running.remove(&id);
        }
        drop(running);

        let mut session = self.pipeline.load(id).await?;
        self.pipeline.cancel(&mut session).await?;
        Ok(session)
    }

    /// Restart every session left running by a previous process. Sessions
    /// another live process is still driving are left alone.
    pub async fn recover(&self) -> Result<Vec<SessionId>> {
        let mut recovered = Vec::new();
        for session in self.pipeline.context().store.list_sessions().await? {
            if session.status != SessionStatus::Running {
                continue;
            }
            match self.resume_job(session.id).await {
                Ok(_) => recovered.push(session.id),
                Err(SiteportError::InvalidTransition(reason)) => {
                    info!(session_id = %session.id, %reason, "skipping session");
                }
                Err(e) => return Err(e),
            }
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered running sessions");
        }
        Ok(recovered)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.pipeline.events().subscribe()
    }

    pub async fn events_since(&self, id: SessionId, seq: u64) -> Result<Vec<ProgressEvent>> {
        self.pipeline.events().events_since(id, seq).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobSession>> {
        self.pipeline.context().store.list_sessions().await
    }

    pub async fn probe_now(&self, force: bool) -> Result<ProbeSummary> {
        self.pipeline.context().probe.probe_all(force).await
    }

    pub async fn knowledge(&self) -> Result<Vec<KnowledgeEntry>> {
        self.pipeline.context().store.knowledge_entries().await
    }

    /// Keep envelopes fresh in the background until shutdown.
    pub fn start_background_probe(&self) -> JoinHandle<()> {
        self.pipeline
            .context()
            .probe
            .clone()
            .spawn_background(self.shutdown.child_token())
    }

    /// Cancel every background run and wait for them to stop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let jobs: Vec<(SessionId, RunningJob)> = self.running.lock().await.drain().collect();
        for (id, job) in jobs {
            let Some(handle) = job.handle else { continue };
            if let Err(e) = handle.await {
                warn!(session_id = %id, error = %e, "job task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::{Script, blueprint, element, pipeline_over, test_store};

    fn site() -> Script {
        Script::default()
            .component("page", &[], &["heading", "body"], &["heading", "body"])
            .blueprint(blueprint(vec![
                element("a", "/", "hero", &["heading"]),
                element("b", "/pricing", "content", &["body"]),
            ]))
            .default_score(0.9)
    }

    #[tokio::test]
    async fn background_job_runs_to_done() {
        let store = test_store().await;
        let scripted = site().build();
        let service = MigrationService::new(pipeline_over(store, &scripted));

        let id = service.start_job("https://example.test").await.unwrap();
        let session = service.wait(id).await.unwrap();

        assert_eq!(session.status, SessionStatus::Done);
        assert_eq!(service.get_job_status(id).await.unwrap(), session);
        assert_eq!(service.list_jobs().await.unwrap().len(), 1);
        assert_eq!(service.knowledge().await.unwrap().len(), 2);
        assert!(service.get_gap_report(id).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn last_decision_resumes_the_job() {
        let store = test_store().await;
        let scripted = site().reject("b").build();
        let service = MigrationService::new(pipeline_over(store, &scripted));

        let id = service.start_job("https://example.test").await.unwrap();
        let paused = service.wait(id).await.unwrap();
        assert_eq!(paused.status, SessionStatus::PausedForReview);

        let change = service
            .submit_review_decision(id, "b", Decision::Manual)
            .await
            .unwrap();
        assert_eq!(change, DecisionChange::Applied);

        let done = service.wait(id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Done);
        assert_eq!(scripted.published.load(Ordering::SeqCst), 1);

        let events = service.events_since(id, 0).await.unwrap();
        assert!(events.iter().any(|e| e.status == siteport_shared::EventStatus::Resumed));
    }

    #[tokio::test]
    async fn cancelling_a_paused_job_ends_it() {
        let store = test_store().await;
        let scripted = site().reject("a").build();
        let service = MigrationService::new(pipeline_over(store, &scripted));

        let id = service.start_job("https://example.test").await.unwrap();
        service.wait(id).await.unwrap();
        let cancelled = service.cancel_job(id).await.unwrap();

        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        assert!(service.cancel_job(id).await.is_err());
        assert!(service.resume_job(id).await.is_err());
        assert_eq!(scripted.published.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recover_restarts_orphaned_sessions() {
        let store = test_store().await;
        let scripted = site().build();
        let first = pipeline_over(store.clone(), &scripted);
        let mut session = first.start("https://example.test").await.unwrap();
        first
            .advance(&mut session, &CancellationToken::new())
            .await
            .unwrap();

        let service = MigrationService::new(pipeline_over(store, &scripted));
        assert_eq!(service.recover().await.unwrap(), vec![session.id]);
        let done = service.wait(session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Done);
    }

    #[tokio::test]
    async fn recover_leaves_sessions_driven_elsewhere() {
        let store = test_store().await;
        let scripted = site().build();
        let first = pipeline_over(store.clone(), &scripted);
        let session = first.start("https://example.test").await.unwrap();
        store
            .acquire_lease(session.id, "other-process", std::time::Duration::from_secs(60))
            .await
            .unwrap();

        let service = MigrationService::new(pipeline_over(store, &scripted));
        assert!(service.recover().await.unwrap().is_empty());
        assert_eq!(scripted.calls("components"), 0);

        let cancelled = service.cancel_job(session.id).await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
    }
}
