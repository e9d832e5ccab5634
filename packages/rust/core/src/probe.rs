//! Capability probing: discovers what each target component accepts.
//!
//! A sweep submits the required-only parameter set first, then adds each
//! optional parameter to the accepted base one at a time. Every sweep
//! supersedes the component's envelope with a new version.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use siteport_collaborators::{Prober, with_timeout};
use siteport_shared::{
    CapabilityEnvelope, CollaboratorError, ComponentDescriptor, ProbeConfig, ProbeObservation,
    Result,
};
use siteport_storage::KnowledgeStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::retry::RetryPolicy;

/// Outcome of one `probe_all` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeSummary {
    /// Set when the last sweep was fresh enough and nothing ran.
    pub skipped: bool,
    /// `(component, new envelope version)` for each component probed.
    pub probed: Vec<(String, u64)>,
    /// `(component, error)` for components whose sweep failed.
    pub failures: Vec<(String, String)>,
}

pub struct ProbeController {
    store: Arc<KnowledgeStore>,
    prober: Arc<dyn Prober>,
    config: ProbeConfig,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl ProbeController {
    pub fn new(
        store: Arc<KnowledgeStore>,
        prober: Arc<dyn Prober>,
        config: ProbeConfig,
        call_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            prober,
            config,
            call_timeout,
            retry,
        }
    }

    /// Probe every known component and supersede its envelope.
    ///
    /// Without `force`, does nothing when the last full sweep is younger
    /// than the configured interval.
    #[instrument(skip_all, fields(force = force))]
    pub async fn probe_all(&self, force: bool) -> Result<ProbeSummary> {
        if !force {
            if let Some(last) = self.store.last_probe().await? {
                let age = Utc::now().signed_duration_since(last);
                if age.to_std().is_ok_and(|age| age < self.config.interval) {
                    info!(last_probe = %last, "capability envelopes are fresh, skipping sweep");
                    return Ok(ProbeSummary {
                        skipped: true,
                        ..ProbeSummary::default()
                    });
                }
            }
        }

        let components = self
            .retry
            .retry_if(
                "components",
                || with_timeout("components", self.call_timeout, self.prober.components()),
                CollaboratorError::is_transient,
            )
            .await?;

        let mut summary = ProbeSummary::default();
        let mut last_error = None;
        for component in &components {
            match self.sweep(component).await {
                Ok(observations) => {
                    let envelope = self
                        .store
                        .put_envelope(CapabilityEnvelope {
                            component_id: component.id.clone(),
                            version: 0,
                            observations,
                            probed_at: Utc::now(),
                        })
                        .await?;
                    info!(
                        component = %component.id,
                        version = envelope.version,
                        accepted = envelope.accepted_parameters().len(),
                        "envelope superseded"
                    );
                    summary.probed.push((component.id.clone(), envelope.version));
                }
                Err(e) => {
                    warn!(component = %component.id, error = %e, "probe sweep failed, keeping previous envelope");
                    summary.failures.push((component.id.clone(), e.to_string()));
                    last_error = Some(e);
                }
            }
        }

        if summary.probed.is_empty() {
            if let Some(e) = last_error {
                return Err(e.into());
            }
        }

        self.store.set_last_probe(Utc::now()).await?;
        Ok(summary)
    }

    /// Minimal-then-incremental parameter sweep for one component.
    async fn sweep(
        &self,
        component: &ComponentDescriptor,
    ) -> std::result::Result<Vec<ProbeObservation>, CollaboratorError> {
        let mut base: BTreeSet<String> = component.required.iter().cloned().collect();
        let mut observations = Vec::new();

        let minimal = self.trial(&component.id, &base).await?;
        let minimal_ok = minimal.accepted;
        observations.push(minimal);
        if !minimal_ok {
            return Ok(observations);
        }

        let budget = self.config.max_attempts_per_component.saturating_sub(1) as usize;
        let untried: Vec<String> = component
            .optional
            .iter()
            .filter(|p| !base.contains(*p))
            .take(budget)
            .cloned()
            .collect();
        for param in &untried {
            let mut candidate = base.clone();
            candidate.insert(param.clone());
            let observation = self.trial(&component.id, &candidate).await?;
            if observation.accepted {
                base = candidate;
            }
            observations.push(observation);
        }
        Ok(observations)
    }

    async fn trial(
        &self,
        component_id: &str,
        parameters: &BTreeSet<String>,
    ) -> std::result::Result<ProbeObservation, CollaboratorError> {
        self.retry
            .retry_if(
                "probe",
                || with_timeout("probe", self.call_timeout, self.prober.probe(component_id, parameters)),
                CollaboratorError::is_transient,
            )
            .await
    }

    /// Current envelope, or a low-confidence placeholder if never probed.
    pub async fn get_envelope(&self, component_id: &str) -> Result<CapabilityEnvelope> {
        Ok(self
            .store
            .current_envelope(component_id)
            .await?
            .unwrap_or_else(|| CapabilityEnvelope::placeholder(component_id)))
    }

    /// Run forced sweeps every interval until `cancel` fires.
    pub fn spawn_background(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.probe_all(true).await {
                    Ok(summary) => info!(
                        probed = summary.probed.len(),
                        failures = summary.failures.len(),
                        "background probe sweep finished"
                    ),
                    Err(e) => warn!(error = %e, "background probe sweep failed"),
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
            info!("background prober stopped");
        })
    }
}

impl ProbeSummary {
    /// One-line description for progress events.
    pub fn describe(&self) -> String {
        if self.skipped {
            "envelopes fresh, sweep skipped".to_string()
        } else {
            format!(
                "{} components probed, {} failed",
                self.probed.len(),
                self.failures.len()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Script, test_store};

    fn controller(store: Arc<KnowledgeStore>, script: Script) -> (ProbeController, Arc<crate::testing::Scripted>) {
        let scripted = script.build();
        let ctl = ProbeController::new(
            store,
            scripted.clone(),
            ProbeConfig::default(),
            Duration::from_secs(5),
            RetryPolicy::exponential(2, Duration::from_millis(1)),
        );
        (ctl, scripted)
    }

    #[tokio::test]
    async fn sweep_is_minimal_then_incremental() {
        let store = test_store().await;
        let script = Script::default().component(
            "article",
            &["title"],
            &["body", "image", "video"],
            &["title", "body", "image"],
        );
        let (ctl, scripted) = controller(store.clone(), script);

        let summary = ctl.probe_all(false).await.unwrap();
        assert_eq!(summary.probed, vec![("article".to_string(), 1)]);
        assert_eq!(scripted.calls("probe"), 4);

        let env = ctl.get_envelope("article").await.unwrap();
        let first = &env.observations[0];
        assert_eq!(first.parameters, BTreeSet::from(["title".to_string()]));
        assert!(first.accepted);
        assert!(!env.observations[3].accepted);
        assert_eq!(
            env.accepted_parameters(),
            BTreeSet::from(["title".to_string(), "body".to_string(), "image".to_string()])
        );
    }

    #[tokio::test]
    async fn sweep_stays_within_attempt_budget() {
        let store = test_store().await;
        let scripted = Script::default()
            .component("card", &["title"], &["title", "a", "b", "c"], &["title", "a", "c"])
            .build();
        let config = ProbeConfig {
            max_attempts_per_component: 3,
            ..ProbeConfig::default()
        };
        let ctl = ProbeController::new(
            store,
            scripted.clone(),
            config,
            Duration::from_secs(5),
            RetryPolicy::exponential(2, Duration::from_millis(1)),
        );

        ctl.probe_all(true).await.unwrap();
        assert_eq!(scripted.calls("probe"), 3);
        let env = ctl.get_envelope("card").await.unwrap();
        let tried: Vec<BTreeSet<String>> = env.observations.iter().map(|o| o.parameters.clone()).collect();
        assert_eq!(
            tried[2],
            BTreeSet::from(["title".to_string(), "a".to_string(), "b".to_string()])
        );
        assert_eq!(
            env.accepted_parameters(),
            BTreeSet::from(["title".to_string(), "a".to_string()])
        );
    }

    #[tokio::test]
    async fn rejected_minimal_set_stops_sweep() {
        let store = test_store().await;
        let script = Script::default().component("widget", &["config"], &["a", "b"], &[]);
        let (ctl, scripted) = controller(store, script);

        ctl.probe_all(true).await.unwrap();
        assert_eq!(scripted.calls("probe"), 1);
        let env = ctl.get_envelope("widget").await.unwrap();
        assert!(env.accepted_parameters().is_empty());
        assert_eq!(env.version, 1);
    }

    #[tokio::test]
    async fn fresh_envelopes_skip_unless_forced() {
        let store = test_store().await;
        let script = Script::default().component("page", &[], &["body"], &["body"]);
        let (ctl, scripted) = controller(store, script);

        ctl.probe_all(false).await.unwrap();
        let skipped = ctl.probe_all(false).await.unwrap();
        assert!(skipped.skipped);
        assert_eq!(scripted.calls("components"), 1);

        let forced = ctl.probe_all(true).await.unwrap();
        assert_eq!(forced.probed, vec![("page".to_string(), 2)]);
    }

    #[tokio::test]
    async fn reprobe_with_changed_capabilities_supersedes_envelope() {
        let store = test_store().await;
        let script = Script::default().component("page", &[], &["body", "image"], &["body"]);
        let (ctl, scripted) = controller(store.clone(), script);

        ctl.probe_all(true).await.unwrap();
        let before = ctl.get_envelope("page").await.unwrap();
        assert!(!before.accepted_parameters().contains("image"));

        scripted.edit(|s| {
            s.accepts
                .insert("page".into(), ["body".to_string(), "image".to_string()].into());
        });
        ctl.probe_all(true).await.unwrap();

        let after = ctl.get_envelope("page").await.unwrap();
        assert_eq!(after.version, before.version + 1);
        assert!(after.accepted_parameters().contains("image"));

        let history = store.envelope_history("page").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], before);
    }

    #[tokio::test]
    async fn unknown_component_yields_placeholder() {
        let store = test_store().await;
        let (ctl, _) = controller(store, Script::default());
        let env = ctl.get_envelope("never_seen").await.unwrap();
        assert!(env.is_placeholder());
        assert_eq!(env.component_id, "never_seen");
    }

    #[tokio::test]
    async fn transient_probe_failures_are_retried() {
        let store = test_store().await;
        let script = Script::default()
            .component("page", &[], &[], &[])
            .transient("probe", 2);
        let (ctl, scripted) = controller(store, script);

        let summary = ctl.probe_all(true).await.unwrap();
        assert_eq!(summary.probed.len(), 1);
        assert_eq!(scripted.calls("probe"), 3);
    }

    #[tokio::test]
    async fn failing_catalogue_is_an_error() {
        let store = test_store().await;
        let (ctl, _) = controller(store, Script::default().broken("components"));
        assert!(ctl.probe_all(true).await.is_err());
    }

    #[tokio::test]
    async fn background_loop_stops_on_cancel() {
        let store = test_store().await;
        let (ctl, scripted) = controller(store, Script::default().component("page", &[], &[], &[]));
        let cancel = CancellationToken::new();
        let handle = Arc::new(ctl).spawn_background(cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop exits")
            .unwrap();
        assert!(scripted.calls("components") >= 1);
    }
}
