//! JSON/HTTP client for a collaborator gateway.
//!
//! One [`HttpGateway`] implements every collaborator contract against a
//! gateway exposing `/health`, `/analyze`, `/components`, `/probe`, `/place`,
//! `/score`, `/theme`, `/content`, `/verify` and `/publish`.
//!
//! Status mapping: 422 is a validation rejection, 503 with
//! `renderer_unavailable` means scoring is unavailable, 429 / 5xx and
//! transport timeouts are transient, anything else is a protocol error.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use siteport_shared::{
    CollaboratorError, ComponentDescriptor, MappingManifest, ProbeObservation, Result, SessionId,
    SiteBlueprint, SiteportError,
};
use tracing::debug;
use url::Url;

use crate::validation::validate_payload;
use crate::{
    Analyzer, CollabResult, FinishReport, Finisher, HealthCheck, PlacementRef, PlacementTarget,
    Placer, Prober, Publisher, Score, Scorer, Verifier, VerifyReport,
};

/// User-Agent string for gateway requests.
const USER_AGENT: &str = concat!("siteport/", env!("CARGO_PKG_VERSION"));

/// Marker the gateway puts in a 503 body when the renderer is down.
const RENDERER_UNAVAILABLE: &str = "renderer_unavailable";

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    source: &'a str,
}

#[derive(Serialize)]
struct ProbeRequest<'a> {
    component_id: &'a str,
    parameters: &'a BTreeSet<String>,
}

#[derive(Deserialize)]
struct ProbeResponse {
    accepted: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct PlaceRequest<'a> {
    component_id: &'a str,
    target: &'a PlacementTarget,
}

#[derive(Deserialize)]
struct PlaceResponse {
    placement_ref: String,
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    placement_ref: &'a str,
}

#[derive(Serialize)]
struct BlueprintRequest<'a> {
    session_id: SessionId,
    blueprint: &'a SiteBlueprint,
}

#[derive(Serialize)]
struct ManifestRequest<'a> {
    session_id: SessionId,
    manifest: &'a MappingManifest,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    session_id: SessionId,
    manifest: &'a MappingManifest,
    excluded: &'a BTreeSet<String>,
}

#[derive(Deserialize)]
struct PublishResponse {
    published: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(alias = "reason", alias = "message")]
    error: String,
}

/// HTTP client for the collaborator gateway.
pub struct HttpGateway {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpGateway {
    /// Create a client for the gateway at `base_url`.
    ///
    /// `request_timeout` bounds each HTTP exchange; callers still apply
    /// their own per-call deadline on top.
    pub fn new(base_url: &str, token: Option<String>, request_timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| SiteportError::config(format!("invalid gateway url '{base_url}': {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| SiteportError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, operation: &str, path: &str) -> CollabResult<Url> {
        self.base
            .join(path)
            .map_err(|e| CollaboratorError::Protocol(format!("{operation}: bad endpoint: {e}")))
    }

    async fn dispatch(&self, operation: &str, request: RequestBuilder) -> CollabResult<Response> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(operation, &e))?;

        let status = response.status();
        debug!(operation, %status, "gateway response");
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(operation, status, &body))
    }

    async fn post<B, R>(&self, operation: &str, path: &str, body: &B) -> CollabResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint(operation, path)?;
        let response = self
            .dispatch(operation, self.client.post(url).json(body))
            .await?;
        decode(operation, response).await
    }

    async fn get<R: DeserializeOwned>(&self, operation: &str, path: &str) -> CollabResult<R> {
        let url = self.endpoint(operation, path)?;
        let response = self.dispatch(operation, self.client.get(url)).await?;
        decode(operation, response).await
    }
}

async fn decode<R: DeserializeOwned>(operation: &str, response: Response) -> CollabResult<R> {
    response
        .json::<R>()
        .await
        .map_err(|e| CollaboratorError::Protocol(format!("{operation}: malformed response: {e}")))
}

fn transport_error(operation: &str, e: &reqwest::Error) -> CollaboratorError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        CollaboratorError::transient(operation, e.to_string())
    } else {
        CollaboratorError::Protocol(format!("{operation}: {e}"))
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.trim().to_string())
}

/// Map a non-success HTTP status to the collaborator error taxonomy.
pub(crate) fn classify_status(
    operation: &str,
    status: StatusCode,
    body: &str,
) -> CollaboratorError {
    let message = error_message(body);
    match status {
        StatusCode::UNPROCESSABLE_ENTITY => CollaboratorError::rejected(message),
        StatusCode::SERVICE_UNAVAILABLE if body.contains(RENDERER_UNAVAILABLE) => {
            CollaboratorError::Unavailable(message)
        }
        StatusCode::TOO_MANY_REQUESTS => {
            CollaboratorError::transient(operation, format!("rate limited: {message}"))
        }
        s if s.is_server_error() => {
            CollaboratorError::transient(operation, format!("HTTP {s}: {message}"))
        }
        s => CollaboratorError::Protocol(format!("{operation}: HTTP {s}: {message}")),
    }
}

// ---------------------------------------------------------------------------
// Contract implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl HealthCheck for HttpGateway {
    async fn health(&self) -> CollabResult<()> {
        let url = self.endpoint("health", "health")?;
        self.dispatch("health", self.client.get(url)).await?;
        Ok(())
    }
}

#[async_trait]
impl Analyzer for HttpGateway {
    async fn analyze(&self, source: &str) -> CollabResult<SiteBlueprint> {
        self.post("analyze", "analyze", &AnalyzeRequest { source })
            .await
    }
}

#[async_trait]
impl Prober for HttpGateway {
    async fn components(&self) -> CollabResult<Vec<ComponentDescriptor>> {
        self.get("components", "components").await
    }

    async fn probe(
        &self,
        component_id: &str,
        parameters: &BTreeSet<String>,
    ) -> CollabResult<ProbeObservation> {
        let response: ProbeResponse = self
            .post(
                "probe",
                "probe",
                &ProbeRequest {
                    component_id,
                    parameters,
                },
            )
            .await?;
        Ok(ProbeObservation {
            parameters: parameters.clone(),
            accepted: response.accepted,
            error: response.error,
        })
    }
}

#[async_trait]
impl Placer for HttpGateway {
    async fn place(
        &self,
        component_id: &str,
        target: &PlacementTarget,
    ) -> CollabResult<PlacementRef> {
        validate_payload(target.payload())?;
        let response: PlaceResponse = self
            .post(
                "place",
                "place",
                &PlaceRequest {
                    component_id,
                    target,
                },
            )
            .await?;
        Ok(PlacementRef(response.placement_ref))
    }
}

#[async_trait]
impl Scorer for HttpGateway {
    async fn score(&self, placement: &PlacementRef) -> CollabResult<Score> {
        let score: Score = self
            .post(
                "score",
                "score",
                &ScoreRequest {
                    placement_ref: &placement.0,
                },
            )
            .await?;
        if !(0.0..=1.0).contains(&score.similarity) {
            return Err(CollaboratorError::Protocol(format!(
                "score: similarity {} outside [0, 1]",
                score.similarity
            )));
        }
        Ok(score)
    }
}

#[async_trait]
impl Finisher for HttpGateway {
    async fn apply_theme(
        &self,
        session_id: SessionId,
        blueprint: &SiteBlueprint,
    ) -> CollabResult<FinishReport> {
        self.post(
            "theme",
            "theme",
            &BlueprintRequest {
                session_id,
                blueprint,
            },
        )
        .await
    }

    async fn migrate_content(
        &self,
        session_id: SessionId,
        manifest: &MappingManifest,
    ) -> CollabResult<FinishReport> {
        self.post(
            "content",
            "content",
            &ManifestRequest {
                session_id,
                manifest,
            },
        )
        .await
    }
}

#[async_trait]
impl Verifier for HttpGateway {
    async fn verify(
        &self,
        session_id: SessionId,
        manifest: &MappingManifest,
    ) -> CollabResult<VerifyReport> {
        self.post(
            "verify",
            "verify",
            &ManifestRequest {
                session_id,
                manifest,
            },
        )
        .await
    }
}

#[async_trait]
impl Publisher for HttpGateway {
    async fn publish(
        &self,
        session_id: SessionId,
        manifest: &MappingManifest,
        excluded: &BTreeSet<String>,
    ) -> CollabResult<bool> {
        let response: PublishResponse = self
            .post(
                "publish",
                "publish",
                &PublishRequest {
                    session_id,
                    manifest,
                    excluded,
                },
            )
            .await?;
        Ok(response.published)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use siteport_shared::SourceElement;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn gateway(server: &MockServer) -> HttpGateway {
        HttpGateway::new(&server.uri(), None, Duration::from_secs(5)).expect("build gateway")
    }

    fn target(body: &str) -> PlacementTarget {
        PlacementTarget {
            session_id: SessionId::new(),
            element: SourceElement {
                id: "el-1".into(),
                page: "/".into(),
                semantic_type: "hero".into(),
                content: [("body".to_string(), body.to_string())].into(),
                style_tokens: BTreeMap::new(),
                weight: 1.0,
            },
            attempt: 1,
            instructions: Vec::new(),
        }
    }

    #[test]
    fn status_classification() {
        let e = classify_status("place", StatusCode::UNPROCESSABLE_ENTITY, r#"{"error":"raw markup"}"#);
        assert_eq!(e, CollaboratorError::rejected("raw markup"));

        let e = classify_status("score", StatusCode::SERVICE_UNAVAILABLE, r#"{"error":"renderer_unavailable"}"#);
        assert!(matches!(e, CollaboratorError::Unavailable(_)));

        let e = classify_status("score", StatusCode::SERVICE_UNAVAILABLE, "maintenance");
        assert!(e.is_transient());
        assert!(classify_status("probe", StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status("probe", StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(matches!(
            classify_status("probe", StatusCode::NOT_FOUND, "nope"),
            CollaboratorError::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn analyze_decodes_blueprint() {
        let server = MockServer::start().await;
        let blueprint = SiteBlueprint {
            source: "https://example.com".into(),
            title: "Example".into(),
            elements: vec![target("hello").element],
            analyzed_at: Utc::now(),
        };
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .and(body_partial_json(serde_json::json!({"source": "https://example.com"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(&blueprint))
            .expect(1)
            .mount(&server)
            .await;

        let got = gateway(&server).analyze("https://example.com").await.unwrap();
        assert_eq!(got, blueprint);
    }

    #[tokio::test]
    async fn bearer_token_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .and(header("authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let gw = HttpGateway::new(&server.uri(), Some("t0k".into()), Duration::from_secs(5)).unwrap();
        gw.health().await.expect("healthy");
    }

    #[tokio::test]
    async fn probe_echoes_parameters_into_observation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/probe"))
            .and(body_partial_json(serde_json::json!({"component_id": "article"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"accepted": false, "error": "unknown field image"})),
            )
            .mount(&server)
            .await;

        let params: BTreeSet<String> = ["image".to_string()].into();
        let obs = gateway(&server).probe("article", &params).await.unwrap();
        assert!(!obs.accepted);
        assert_eq!(obs.parameters, params);
        assert_eq!(obs.error.as_deref(), Some("unknown field image"));
    }

    #[tokio::test]
    async fn place_rejection_is_not_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/place"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(serde_json::json!({"reason": "unknown component"})),
            )
            .mount(&server)
            .await;

        let err = gateway(&server).place("nope", &target("hi")).await.unwrap_err();
        assert_eq!(err, CollaboratorError::rejected("unknown component"));
    }

    #[tokio::test]
    async fn unsafe_payload_never_reaches_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/place"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = gateway(&server)
            .place("page", &target("<script>x()</script>"))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::ValidationRejected { .. }));
    }

    #[tokio::test]
    async fn score_maps_renderer_outage_to_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/score"))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(serde_json::json!({"error": "renderer_unavailable"})),
            )
            .mount(&server)
            .await;

        let err = gateway(&server)
            .score(&PlacementRef("p-1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable(_)));
    }

    #[tokio::test]
    async fn score_rejects_out_of_range_similarity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/score"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"similarity": 1.4})))
            .mount(&server)
            .await;

        let err = gateway(&server)
            .score(&PlacementRef("p-1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Protocol(_)));
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/components"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = gateway(&server).components().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unreachable_gateway_is_transient() {
        // Port 9 (discard) is almost never bound in test environments.
        let gw = HttpGateway::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        let err = gw.health().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn publish_sends_exclusions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/publish"))
            .and(body_partial_json(serde_json::json!({"excluded": ["el-2"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"published": true})))
            .expect(1)
            .mount(&server)
            .await;

        let manifest = MappingManifest {
            version: 1,
            items: Vec::new(),
            envelope_versions: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let excluded: BTreeSet<String> = ["el-2".to_string()].into();
        let published = gateway(&server)
            .publish(SessionId::new(), &manifest, &excluded)
            .await
            .unwrap();
        assert!(published);
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let gw = HttpGateway::new("http://gw.local/api", None, Duration::from_secs(1)).unwrap();
        assert_eq!(gw.base_url().as_str(), "http://gw.local/api/");
        assert_eq!(
            gw.endpoint("score", "score").unwrap().as_str(),
            "http://gw.local/api/score"
        );
    }
}
