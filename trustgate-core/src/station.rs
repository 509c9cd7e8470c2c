//! The trust station.
//!
//! Registry of agents, owner of the signing key pair, issuer of clearance
//! certificates, sink for gateway behavior reports, and oracle for current
//! reputation. [`Station`] is the HTTP-independent service; [`router`]
//! mounts it as the station's axum surface.
//!
//! Every JSON response uses the `{success, data}` / `{success: false,
//! error}` envelope.

use crate::certificate::{
    AgentProfile, CertificateClaims, CertificateIssuer, CertificateVerifier, IssuedCertificate,
};
use crate::error::{Error, Result};
use crate::keys::{KeyDiscovery, PublicKey, SigningKey};
use crate::report::{ActionOutcome, GatewayReport, ReportSummary};
use crate::reputation::ScoreBreakdown;
use crate::store::{AgentRecord, DeveloperRecord, Store};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use crate::store::AgentStatus;

/// The station service.
#[derive(Debug)]
pub struct Station {
    store: Arc<Store>,
    issuer: CertificateIssuer,
    verifier: CertificateVerifier,
    signing: Arc<SigningKey>,
}

/// Result of the station-side (remote) verification path.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    /// Whether the token is valid right now, revocation included.
    pub valid: bool,
    /// Decoded claims when valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<CertificateClaims>,
    /// Why the token is invalid, when it is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Decision returned by the pre-action check.
#[derive(Debug, Clone, Serialize)]
pub struct PreActionDecision {
    pub allowed: bool,
    pub score: i64,
    pub reason: String,
    #[serde(rename = "actionId")]
    pub action_id: i64,
}

impl Station {
    /// Create a station over a store with a signing key and certificate TTL.
    pub fn new(store: Arc<Store>, signing: Arc<SigningKey>, certificate_ttl: Duration) -> Self {
        let issuer = CertificateIssuer::new(signing.clone(), certificate_ttl);
        let verifier = CertificateVerifier::new(signing.public_key().clone());
        Self {
            store,
            issuer,
            verifier,
            signing,
        }
    }

    /// The station's durable store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The public half of the signing key.
    pub fn public_key(&self) -> &PublicKey {
        self.signing.public_key()
    }

    /// The configured certificate lifetime.
    pub fn certificate_ttl(&self) -> Duration {
        self.issuer.ttl()
    }

    /// Issue a certificate for `(developer_id, external_id)`.
    ///
    /// Recomputes the score, signs, and persists the certificate record.
    /// Fails `NotFound` for an unknown agent and `Forbidden` for a
    /// suspended or banned one.
    pub fn issue_certificate(
        &self,
        developer_id: &str,
        external_id: &str,
        scope: Option<Vec<String>>,
    ) -> Result<IssuedCertificate> {
        let agent = self.store.agent_by_external(developer_id, external_id)?;
        if agent.status != AgentStatus::Active {
            return Err(Error::Forbidden(format!(
                "agent '{}' is {}",
                external_id, agent.status
            )));
        }

        let breakdown = self.store.recompute_score(&agent.id)?;
        let agent = self.store.agent_by_id(&agent.id)?;
        let profile = AgentProfile {
            id: agent.id.clone(),
            external_id: agent.external_id.clone(),
            developer_id: agent.developer_id.clone(),
            score: breakdown.score,
            identity_verified: agent.identity_verified,
            status: agent.status,
            total_actions: agent.total_actions,
            successful_actions: agent.successful_actions,
        };

        let now = Utc::now();
        let issued = self.issuer.issue(&profile, scope, now)?;
        self.store.record_certificate(
            &issued.jti,
            &agent.id,
            issued.score,
            now,
            issued.expires_at,
        )?;
        info!(agent = %agent.external_id, jti = %issued.jti, score = issued.score, "issued certificate");
        Ok(issued)
    }

    /// Remote verification: local checks plus the revocation lookup.
    pub fn verify_remote(&self, token: &str) -> VerifyOutcome {
        let claims = match self.verifier.verify(token) {
            Ok(claims) => claims,
            Err(e) => {
                return VerifyOutcome {
                    valid: false,
                    payload: None,
                    reason: Some(e.to_string()),
                }
            }
        };
        match self.store.certificate(&claims.jti) {
            Ok(Some(record)) if !record.revoked => VerifyOutcome {
                valid: true,
                payload: Some(claims),
                reason: None,
            },
            Ok(Some(_)) => VerifyOutcome {
                valid: false,
                payload: None,
                reason: Some("certificate revoked".to_string()),
            },
            Ok(None) => VerifyOutcome {
                valid: false,
                payload: None,
                reason: Some("certificate record not found".to_string()),
            },
            Err(e) => VerifyOutcome {
                valid: false,
                payload: None,
                reason: Some(e.to_string()),
            },
        }
    }

    /// Pre-action check: is the agent's current score at or above the
    /// caller's threshold? Logs the decision and returns the log id for the
    /// follow-up `/report`.
    pub fn pre_action_verify(
        &self,
        developer_id: &str,
        external_id: &str,
        action_type: &str,
        threshold: Option<i64>,
        context: &Value,
    ) -> Result<PreActionDecision> {
        let agent = self.store.agent_by_external(developer_id, external_id)?;
        let score = self.store.recompute_score(&agent.id)?.score;

        // No threshold means the caller gates on status alone.
        let threshold = threshold.unwrap_or(0);
        let (allowed, reason) = if agent.status != AgentStatus::Active {
            (false, format!("agent is {}", agent.status))
        } else if score < threshold {
            (
                false,
                Error::InsufficientScore {
                    score,
                    required: threshold,
                }
                .to_string(),
            )
        } else {
            (true, format!("score {score} meets threshold {threshold}"))
        };

        let decision = if allowed { "allowed" } else { "denied" };
        let action_id = self
            .store
            .log_action(&agent.id, action_type, decision, &reason, context)?;
        Ok(PreActionDecision {
            allowed,
            score,
            reason,
            action_id,
        })
    }

    /// Post-action outcome for a pre-action check. Returns the new score.
    pub fn report_outcome(&self, action_id: i64, outcome: ActionOutcome) -> Result<i64> {
        let (agent_id, _action_type) = self.store.action_log_entry(action_id)?;
        self.store
            .apply_outcome(&agent_id, outcome == ActionOutcome::Success)
    }

    /// Ingest a gateway batch report (§ report ingestion contract).
    ///
    /// Validates that the agent exists, belongs to the authenticated
    /// developer, and that the certificate record matches; then applies
    /// each action in order and recomputes the score once more at the end.
    pub fn ingest_report(
        &self,
        developer: &DeveloperRecord,
        report: &GatewayReport,
    ) -> Result<ReportSummary> {
        let agent = self.store.agent_by_id(&report.agent_id)?;
        if agent.developer_id != developer.id {
            return Err(Error::Forbidden(
                "agent does not belong to the authenticated developer".to_string(),
            ));
        }
        let record = self
            .store
            .certificate(&report.certificate_jti)?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "certificate '{}' not found",
                    report.certificate_jti
                ))
            })?;
        if record.agent_id != agent.id {
            return Err(Error::BadRequest(
                "certificate does not belong to the reported agent".to_string(),
            ));
        }

        let reason = format!("reported by gateway {}", report.gateway_id);
        let mut success_count = 0usize;
        let mut failure_count = 0usize;
        for action in &report.actions {
            self.store
                .log_action(&agent.id, &action.action_type, "allowed", &reason, &action.metadata)?;
            let success = action.outcome == ActionOutcome::Success;
            if success {
                success_count += 1;
            } else {
                failure_count += 1;
            }
            self.store.apply_outcome(&agent.id, success)?;
        }

        self.store.insert_gateway_report(
            &agent.id,
            &report.gateway_id,
            &report.certificate_jti,
            report.actions.len(),
        )?;
        let new_reputation_score = self.store.recompute_score(&agent.id)?.score;

        Ok(ReportSummary {
            agent_id: agent.id,
            actions_processed: report.actions.len(),
            success_count,
            failure_count,
            new_reputation_score,
        })
    }

    /// Current factor breakdown for an agent.
    pub fn reputation_breakdown(
        &self,
        developer_id: &str,
        external_id: &str,
    ) -> Result<(AgentRecord, ScoreBreakdown)> {
        let agent = self.store.agent_by_external(developer_id, external_id)?;
        let breakdown = self.store.recompute_score(&agent.id)?;
        let agent = self.store.agent_by_id(&agent.id)?;
        Ok((agent, breakdown))
    }
}

// ============================================================================
// HTTP surface
// ============================================================================

/// Error wrapper turning the taxonomy into enveloped HTTP responses.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        // Unexpected kinds get a generic message; no internals on the wire.
        let message = match &self.0 {
            Error::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

/// Wrap a payload in the success envelope.
pub fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Extract the bearer credential from `Authorization`.
fn bearer_token(headers: &HeaderMap) -> Result<String> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Unauthenticated("missing Authorization header".to_string()))?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.to_string())
        .ok_or_else(|| Error::Unauthenticated("expected bearer authorization".to_string()))
}

fn authenticate(station: &Station, headers: &HeaderMap) -> Result<DeveloperRecord> {
    let token = bearer_token(headers)?;
    station.store().developer_by_api_key(&token)
}

#[derive(Debug, Deserialize)]
struct RegisterDeveloperBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RegisterAgentBody {
    #[serde(rename = "externalId")]
    external_id: String,
    #[serde(rename = "identityVerified", default)]
    identity_verified: bool,
    #[serde(rename = "stakeAmount", default)]
    stake_amount: f64,
}

#[derive(Debug, Deserialize)]
struct RequestCertificateBody {
    #[serde(rename = "agentId")]
    agent_id: String,
    #[serde(default)]
    scope: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct PreActionBody {
    #[serde(rename = "agentId")]
    agent_id: String,
    #[serde(rename = "actionType")]
    action_type: String,
    #[serde(default)]
    threshold: Option<i64>,
    #[serde(default)]
    context: Value,
}

#[derive(Debug, Deserialize)]
struct ReportOutcomeBody {
    #[serde(rename = "actionId")]
    action_id: i64,
    outcome: ActionOutcome,
}

/// Build the station router.
pub fn router(station: Arc<Station>) -> Router {
    Router::new()
        .route("/.well-known/station-keys", get(station_keys))
        .route("/.well-known/station-info", get(station_info))
        .route("/developers/register", post(register_developer))
        .route("/developers/agents", post(register_agent))
        .route("/certificates/request", post(request_certificate))
        .route("/certificates/verify", get(verify_certificate))
        .route("/verify", post(pre_action_verify))
        .route("/report", post(report_outcome))
        .route("/reports", post(ingest_reports))
        .route("/agents/{external_id}/reputation", get(agent_reputation))
        .with_state(station)
}

async fn station_keys(State(station): State<Arc<Station>>) -> Json<Value> {
    envelope(KeyDiscovery::for_key(station.public_key()))
}

async fn station_info(State(station): State<Arc<Station>>) -> Json<Value> {
    envelope(json!({
        "service": "trustgate-station",
        "version": env!("CARGO_PKG_VERSION"),
        "issuer": crate::ISSUER,
        "certificateExpirySeconds": station.certificate_ttl().as_secs(),
    }))
}

async fn register_developer(
    State(station): State<Arc<Station>>,
    Json(body): Json<RegisterDeveloperBody>,
) -> std::result::Result<Json<Value>, ApiError> {
    if body.name.trim().is_empty() {
        return Err(Error::BadRequest("developer name must not be empty".to_string()).into());
    }
    let (developer, api_key) = station.store().register_developer(body.name.trim())?;
    // The API key appears in this response and nowhere else.
    Ok(envelope(json!({
        "developerId": developer.id,
        "name": developer.name,
        "apiKey": api_key,
        "createdAt": developer.created_at,
    })))
}

async fn register_agent(
    State(station): State<Arc<Station>>,
    headers: HeaderMap,
    Json(body): Json<RegisterAgentBody>,
) -> std::result::Result<Json<Value>, ApiError> {
    let developer = authenticate(&station, &headers)?;
    if body.external_id.trim().is_empty() {
        return Err(Error::BadRequest("externalId must not be empty".to_string()).into());
    }
    let agent = station.store().register_agent(
        &developer.id,
        body.external_id.trim(),
        body.identity_verified,
        body.stake_amount,
    )?;
    Ok(envelope(agent))
}

async fn request_certificate(
    State(station): State<Arc<Station>>,
    headers: HeaderMap,
    Json(body): Json<RequestCertificateBody>,
) -> std::result::Result<Json<Value>, ApiError> {
    let developer = authenticate(&station, &headers)?;
    let issued = station.issue_certificate(&developer.id, &body.agent_id, body.scope)?;
    Ok(envelope(issued))
}

async fn verify_certificate(
    State(station): State<Arc<Station>>,
    Query(query): Query<HashMap<String, String>>,
) -> std::result::Result<Json<Value>, ApiError> {
    let token = query
        .get("token")
        .ok_or_else(|| Error::BadRequest("missing 'token' query parameter".to_string()))?;
    Ok(envelope(station.verify_remote(token)))
}

async fn pre_action_verify(
    State(station): State<Arc<Station>>,
    headers: HeaderMap,
    Json(body): Json<PreActionBody>,
) -> std::result::Result<Json<Value>, ApiError> {
    let developer = authenticate(&station, &headers)?;
    let decision = station.pre_action_verify(
        &developer.id,
        &body.agent_id,
        &body.action_type,
        body.threshold,
        &body.context,
    )?;
    Ok(envelope(decision))
}

async fn report_outcome(
    State(station): State<Arc<Station>>,
    headers: HeaderMap,
    Json(body): Json<ReportOutcomeBody>,
) -> std::result::Result<Json<Value>, ApiError> {
    authenticate(&station, &headers)?;
    let new_score = station.report_outcome(body.action_id, body.outcome)?;
    Ok(envelope(json!({ "newReputationScore": new_score })))
}

async fn ingest_reports(
    State(station): State<Arc<Station>>,
    headers: HeaderMap,
    Json(report): Json<GatewayReport>,
) -> std::result::Result<Json<Value>, ApiError> {
    let developer = authenticate(&station, &headers)?;
    let summary = station.ingest_report(&developer, &report)?;
    Ok(envelope(summary))
}

async fn agent_reputation(
    State(station): State<Arc<Station>>,
    headers: HeaderMap,
    Path(external_id): Path<String>,
) -> std::result::Result<Json<Value>, ApiError> {
    let developer = authenticate(&station, &headers)?;
    let (agent, breakdown) = station.reputation_breakdown(&developer.id, &external_id)?;
    Ok(envelope(json!({
        "agent": agent,
        "factors": breakdown,
    })))
}

/// 404 fallback in the shared envelope, mounted by the station daemon.
pub async fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "error": "unknown route" })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::test_signing_key;
    use crate::report::ReportedAction;

    fn station() -> (Station, DeveloperRecord, AgentRecord) {
        let store = Arc::new(Store::in_memory().unwrap());
        let signing = Arc::new(SigningKey::from_pem(&test_signing_key().to_pem()).unwrap());
        let station = Station::new(store.clone(), signing, Duration::from_secs(300));
        let (developer, _key) = store.register_developer("acme").unwrap();
        let agent = store
            .register_agent(&developer.id, "crawler-7", false, 0.0)
            .unwrap();
        (station, developer, agent)
    }

    #[test]
    fn test_issue_unknown_agent_is_not_found() {
        let (station, developer, _agent) = station();
        assert!(matches!(
            station.issue_certificate(&developer.id, "ghost", None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_issue_banned_agent_is_forbidden() {
        let (station, developer, agent) = station();
        station
            .store()
            .set_status(&agent.id, AgentStatus::Banned)
            .unwrap();
        assert!(matches!(
            station.issue_certificate(&developer.id, "crawler-7", None),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn test_issue_persists_certificate_record() {
        let (station, developer, agent) = station();
        let issued = station
            .issue_certificate(&developer.id, "crawler-7", None)
            .unwrap();
        assert_eq!(issued.score, 50);

        let record = station.store().certificate(&issued.jti).unwrap().unwrap();
        assert_eq!(record.agent_id, agent.id);
        assert!(!record.revoked);
        assert!(record.issued_at < record.expires_at);
    }

    #[test]
    fn test_remote_verify_honors_revocation() {
        let (station, developer, _agent) = station();
        let issued = station
            .issue_certificate(&developer.id, "crawler-7", None)
            .unwrap();

        let outcome = station.verify_remote(&issued.token);
        assert!(outcome.valid);
        assert_eq!(outcome.payload.unwrap().jti, issued.jti);

        station.store().revoke_certificate(&issued.jti).unwrap();
        let outcome = station.verify_remote(&issued.token);
        assert!(!outcome.valid);
        assert_eq!(outcome.reason.as_deref(), Some("certificate revoked"));
    }

    #[test]
    fn test_remote_verify_requires_persisted_record() {
        let (station, _developer, agent) = station();
        // A token signed with the right key but never persisted: mint one
        // through a second issuer sharing the signing key.
        let signing = Arc::new(SigningKey::from_pem(&test_signing_key().to_pem()).unwrap());
        let rogue = CertificateIssuer::new(signing, Duration::from_secs(300));
        let profile = AgentProfile {
            id: agent.id.clone(),
            external_id: agent.external_id.clone(),
            developer_id: agent.developer_id.clone(),
            score: 50,
            identity_verified: false,
            status: AgentStatus::Active,
            total_actions: 0,
            successful_actions: 0,
        };
        let issued = rogue.issue(&profile, None, Utc::now()).unwrap();
        let outcome = station.verify_remote(&issued.token);
        assert!(!outcome.valid);
        assert_eq!(
            outcome.reason.as_deref(),
            Some("certificate record not found")
        );
    }

    #[test]
    fn test_ingest_report_updates_counters_and_score() {
        let (station, developer, agent) = station();
        let issued = station
            .issue_certificate(&developer.id, "crawler-7", None)
            .unwrap();

        let report = GatewayReport {
            agent_id: agent.id.clone(),
            gateway_id: "gw-1".to_string(),
            certificate_jti: issued.jti.clone(),
            actions: vec![
                ReportedAction {
                    action_type: "search".to_string(),
                    outcome: ActionOutcome::Success,
                    metadata: json!({}),
                    performed_at: Utc::now(),
                },
                ReportedAction {
                    action_type: "order".to_string(),
                    outcome: ActionOutcome::Failure,
                    metadata: json!({}),
                    performed_at: Utc::now(),
                },
            ],
        };

        let summary = station.ingest_report(&developer, &report).unwrap();
        assert_eq!(summary.actions_processed, 2);
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.failure_count, 1);
        // 50 base + round(20 * 1/2) - 5 = 55.
        assert_eq!(summary.new_reputation_score, 55);

        let agent = station.store().agent_by_id(&agent.id).unwrap();
        assert_eq!(agent.total_actions, 2);
        assert_eq!(agent.successful_actions, 1);
        assert_eq!(agent.failed_actions, 1);
    }

    #[test]
    fn test_ingest_report_rejects_mismatched_certificate() {
        let (station, developer, _agent) = station();
        let issued = station
            .issue_certificate(&developer.id, "crawler-7", None)
            .unwrap();
        let other = station
            .store()
            .register_agent(&developer.id, "other-agent", false, 0.0)
            .unwrap();

        let report = GatewayReport {
            agent_id: other.id,
            gateway_id: "gw-1".to_string(),
            certificate_jti: issued.jti,
            actions: Vec::new(),
        };
        assert!(matches!(
            station.ingest_report(&developer, &report),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn test_pre_action_verify_and_report_flow() {
        let (station, developer, _agent) = station();

        let decision = station
            .pre_action_verify(&developer.id, "crawler-7", "order", Some(60), &json!({}))
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.score, 50);
        assert!(decision.reason.contains("Insufficient reputation score: 50 < 60"));

        let decision = station
            .pre_action_verify(&developer.id, "crawler-7", "search", Some(30), &json!({}))
            .unwrap();
        assert!(decision.allowed);

        let new_score = station
            .report_outcome(decision.action_id, ActionOutcome::Success)
            .unwrap();
        assert_eq!(new_score, 70);
    }

    #[test]
    fn test_reputation_breakdown_matches_cached_score() {
        let (station, developer, agent) = station();
        let (record, breakdown) = station
            .reputation_breakdown(&developer.id, "crawler-7")
            .unwrap();
        assert_eq!(record.id, agent.id);
        assert_eq!(breakdown.score, record.reputation_score);
        assert_eq!(breakdown.base, 50);
    }
}
