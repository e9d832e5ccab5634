//! External collaborator contracts for the migration engine.
//!
//! The orchestration core only ever talks to collaborators through the
//! traits in this crate. Two implementations ship here:
//! - [`HttpGateway`]: a JSON/HTTP client for every contract
//! - [`HtmlAnalyzer`]: a local `analyze` built on `scraper`
//!
//! Every call is a suspension point; callers wrap them in [`with_timeout`]
//! so a hung collaborator becomes a transient failure.

pub mod analyzer;
pub mod http;
pub mod validation;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use siteport_shared::{
    CollaboratorError, ComponentDescriptor, MappingManifest, ProbeObservation, RegionInstruction,
    SessionId, SiteBlueprint, SourceElement,
};

pub use analyzer::HtmlAnalyzer;
pub use http::HttpGateway;
pub use validation::validate_payload;

/// Result alias for collaborator calls.
pub type CollabResult<T> = std::result::Result<T, CollaboratorError>;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Everything the build collaborator needs to place one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementTarget {
    pub session_id: SessionId,
    pub element: SourceElement,
    /// 1-based attempt within the current micro loop.
    pub attempt: u32,
    /// Instructions returned by the previous score, applied to this attempt.
    #[serde(default)]
    pub instructions: Vec<RegionInstruction>,
}

impl PlacementTarget {
    /// Fields submitted to the target component.
    pub fn payload(&self) -> &BTreeMap<String, String> {
        &self.element.content
    }
}

/// Opaque handle to a placed component, consumed by `score`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlacementRef(pub String);

/// Similarity signal returned by the scoring collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub similarity: f64,
    #[serde(default)]
    pub instructions: Vec<RegionInstruction>,
}

/// Result of a theme or content finishing pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinishReport {
    #[serde(default)]
    pub applied: u32,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Result of the post-build verification pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub overall_score: f64,
    #[serde(default)]
    pub fixes_needed: Vec<String>,
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// `analyze(source) -> SiteBlueprint`
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, source: &str) -> CollabResult<SiteBlueprint>;
}

/// Capability probing. The controller drives the parameter sweep; the
/// collaborator answers one trial submission per call.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Components known to the target system.
    async fn components(&self) -> CollabResult<Vec<ComponentDescriptor>>;

    /// Submit one parameter set to a component and report the verdict.
    async fn probe(
        &self,
        component_id: &str,
        parameters: &BTreeSet<String>,
    ) -> CollabResult<ProbeObservation>;
}

/// `place(component, target) -> placement_ref`
#[async_trait]
pub trait Placer: Send + Sync {
    /// Fails with [`CollaboratorError::ValidationRejected`] for structurally
    /// invalid payloads.
    async fn place(&self, component_id: &str, target: &PlacementTarget)
    -> CollabResult<PlacementRef>;
}

/// `score(placement_ref) -> (similarity, instructions)`
#[async_trait]
pub trait Scorer: Send + Sync {
    /// Fails with [`CollaboratorError::Unavailable`] when the renderer cannot run.
    async fn score(&self, placement: &PlacementRef) -> CollabResult<Score>;
}

/// Theme and content finishing passes.
#[async_trait]
pub trait Finisher: Send + Sync {
    async fn apply_theme(
        &self,
        session_id: SessionId,
        blueprint: &SiteBlueprint,
    ) -> CollabResult<FinishReport>;

    async fn migrate_content(
        &self,
        session_id: SessionId,
        manifest: &MappingManifest,
    ) -> CollabResult<FinishReport>;
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(
        &self,
        session_id: SessionId,
        manifest: &MappingManifest,
    ) -> CollabResult<VerifyReport>;
}

/// Final side-effecting action.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// `excluded` lists source elements the reviewer chose to leave out.
    async fn publish(
        &self,
        session_id: SessionId,
        manifest: &MappingManifest,
        excluded: &BTreeSet<String>,
    ) -> CollabResult<bool>;
}

/// Reachability precondition check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health(&self) -> CollabResult<()>;
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// The full set of collaborators a pipeline runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub analyzer: Arc<dyn Analyzer>,
    pub prober: Arc<dyn Prober>,
    pub placer: Arc<dyn Placer>,
    pub scorer: Arc<dyn Scorer>,
    pub finisher: Arc<dyn Finisher>,
    pub verifier: Arc<dyn Verifier>,
    pub publisher: Arc<dyn Publisher>,
    /// Named reachability checks run by `start`.
    pub health: Vec<(String, Arc<dyn HealthCheck>)>,
}

impl Collaborators {
    /// Route every contract through one HTTP gateway.
    pub fn gateway(gateway: Arc<HttpGateway>) -> Self {
        Self {
            analyzer: gateway.clone(),
            prober: gateway.clone(),
            placer: gateway.clone(),
            scorer: gateway.clone(),
            finisher: gateway.clone(),
            verifier: gateway.clone(),
            publisher: gateway.clone(),
            health: vec![("gateway".to_string(), gateway)],
        }
    }

    /// Replace the analysis collaborator.
    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Run every reachability check, failing on the first unreachable one.
    pub async fn check_health(&self, limit: Duration) -> CollabResult<()> {
        for (name, check) in &self.health {
            with_timeout("health", limit, check.health())
                .await
                .map_err(|e| CollaboratorError::Unreachable(format!("{name}: {e}")))?;
        }
        Ok(())
    }
}

/// Bound a collaborator call. Expiry becomes [`CollaboratorError::Transient`].
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, call: F) -> CollabResult<T>
where
    F: Future<Output = CollabResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::transient(
            operation,
            format!("timed out after {}ms", limit.as_millis()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_becomes_transient() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, CollaboratorError>(1)
        };
        let err = with_timeout("score", Duration::from_millis(10), slow)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("score"));
    }

    #[tokio::test]
    async fn fast_calls_pass_through() {
        let fast = async { Ok::<_, CollaboratorError>(7) };
        assert_eq!(with_timeout("place", Duration::from_secs(1), fast).await, Ok(7));

        let rejected = async { Err::<u8, _>(CollaboratorError::rejected("bad")) };
        assert_eq!(
            with_timeout("place", Duration::from_secs(1), rejected).await,
            Err(CollaboratorError::rejected("bad"))
        );
    }
}
