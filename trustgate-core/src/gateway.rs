//! The gateway: enforcement point embedded in a relying service.
//!
//! Verifies certificates locally against the cached station public key,
//! enforces scope and score thresholds, tracks live session behavior, and
//! forwards observations to the station without ever blocking the request
//! on that delivery.
//!
//! ## Request pipeline
//!
//! 1. Extract the bearer credential.
//! 2. Verify the certificate locally.
//! 3. Deny blocked sessions before any handler runs.
//! 4. Unknown actions get a 404 with the available action list.
//! 5. Enforce the certificate's scope claim.
//! 6. Optional ML threat check (fail-open).
//! 7. Score gate, validation, and execution via the action registry.
//! 8. Record the action with the behavior tracker.
//! 9. Fire-and-forget report to the station.
//! 10. Shape the response, attaching a behavior advisory when warranted.
//!
//! Failure to fetch the station key at startup is fatal (fail-closed);
//! failure during a periodic refresh keeps the cached key in use.

use crate::behavior::{BehaviorConfig, BehaviorOutcome, BehaviorTracker};
use crate::certificate::{CertificateClaims, CertificateVerifier};
use crate::error::{Error, Result};
use crate::keys::{KeyDiscovery, PublicKey};
use crate::registry::{ActionRegistry, AgentContext};
use crate::report::{ActionOutcome, GatewayReport, ReportDispatcher, ReportedAction};
use crate::station::envelope;
use crate::threat::ThreatAnalyzer;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Header carrying the certificate when `Authorization` is taken.
const CERTIFICATE_HEADER: &str = "x-agent-certificate";

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Identifier this gateway reports under.
    pub gateway_id: String,
    /// Base URL of the trust station.
    pub station_url: String,
    /// Developer API key used for report submission.
    pub api_key: SecretString,
    /// How often to refresh the cached station public key.
    pub key_refresh_interval: Duration,
    /// Timeout applied to every outbound call to the station.
    pub request_timeout: Duration,
    /// Capacity of the report channel.
    pub report_buffer: usize,
}

impl GatewayConfig {
    /// Configuration with the stock intervals.
    pub fn new(
        gateway_id: impl Into<String>,
        station_url: impl Into<String>,
        api_key: SecretString,
    ) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            station_url: station_url.into(),
            api_key,
            key_refresh_interval: Duration::from_secs(crate::DEFAULT_KEY_REFRESH_SECS),
            request_timeout: Duration::from_secs(5),
            report_buffer: 256,
        }
    }
}

/// Process-wide cache of the station public key.
///
/// Fetched once at startup and refreshed on a timer. The cached key stays
/// in use when a refresh fails, accepting the bounded inconsistency window
/// that comes with it.
#[derive(Debug)]
pub struct StationKeyCache {
    client: reqwest::Client,
    station_url: String,
    verifier: RwLock<CertificateVerifier>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryEnvelope {
    success: bool,
    #[serde(default)]
    data: Option<KeyDiscovery>,
    #[serde(default)]
    error: Option<String>,
}

impl StationKeyCache {
    /// Fetch the station key. An unreachable station here is fatal.
    pub async fn fetch(client: reqwest::Client, station_url: String) -> Result<Self> {
        let key = Self::fetch_key(&client, &station_url).await?;
        info!(fingerprint = %key.fingerprint(), "cached station public key");
        Ok(Self {
            client,
            station_url,
            verifier: RwLock::new(CertificateVerifier::new(key)),
        })
    }

    /// Build a cache around an already-known key. No refresh possible.
    pub fn from_key(key: PublicKey) -> Self {
        Self {
            client: reqwest::Client::new(),
            station_url: String::new(),
            verifier: RwLock::new(CertificateVerifier::new(key)),
        }
    }

    /// A verifier bound to the currently cached key.
    pub fn verifier(&self) -> CertificateVerifier {
        self.verifier
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-fetch the key and swap it in.
    pub async fn refresh(&self) -> Result<()> {
        let key = Self::fetch_key(&self.client, &self.station_url).await?;
        let mut verifier = self.verifier.write().unwrap_or_else(|e| e.into_inner());
        if verifier.key() != &key {
            info!(fingerprint = %key.fingerprint(), "station public key rotated");
            *verifier = CertificateVerifier::new(key);
        }
        Ok(())
    }

    /// Spawn the periodic refresh task. Refresh failures are logged and
    /// the cached key remains in use.
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it, the startup fetch
            // already populated the cache.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    warn!("station key refresh failed, keeping cached key: {e}");
                }
            }
        })
    }

    async fn fetch_key(client: &reqwest::Client, station_url: &str) -> Result<PublicKey> {
        let url = format!(
            "{}/.well-known/station-keys",
            station_url.trim_end_matches('/')
        );
        let body: DiscoveryEnvelope = client.get(&url).send().await?.json().await?;
        if !body.success {
            return Err(Error::Upstream(
                body.error
                    .unwrap_or_else(|| "station key discovery failed".to_string()),
            ));
        }
        body.data
            .ok_or_else(|| Error::Upstream("station key discovery returned no data".to_string()))?
            .into_key()
    }
}

/// One shaped gateway response: HTTP status plus the JSON body.
#[derive(Debug, Clone)]
pub struct ActionReply {
    pub status: StatusCode,
    pub body: Value,
}

impl ActionReply {
    fn denied(error: &Error) -> Self {
        Self {
            status: error.status_code(),
            body: json!({ "success": false, "error": error.to_string() }),
        }
    }
}

/// The gateway service.
pub struct Gateway {
    config: GatewayConfig,
    keys: Arc<StationKeyCache>,
    registry: ActionRegistry,
    tracker: Arc<BehaviorTracker>,
    analyzer: Option<Arc<dyn ThreatAnalyzer>>,
    reporter: ReportDispatcher,
}

impl Gateway {
    /// Assemble a gateway from already-built parts. Background tasks are
    /// the caller's responsibility; [`Gateway::connect`] wires everything.
    pub fn new(
        config: GatewayConfig,
        keys: Arc<StationKeyCache>,
        registry: ActionRegistry,
        tracker: Arc<BehaviorTracker>,
        analyzer: Option<Arc<dyn ThreatAnalyzer>>,
        reporter: ReportDispatcher,
    ) -> Self {
        Self {
            config,
            keys,
            registry,
            tracker,
            analyzer,
            reporter,
        }
    }

    /// Connect to the station and start the background tasks: key refresh,
    /// session sweeper, and report drain.
    pub async fn connect(
        config: GatewayConfig,
        registry: ActionRegistry,
        behavior: BehaviorConfig,
        analyzer: Option<Arc<dyn ThreatAnalyzer>>,
    ) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        let keys = Arc::new(
            StationKeyCache::fetch(client.clone(), config.station_url.clone()).await?,
        );
        let _refresh = keys.clone().spawn_refresh(config.key_refresh_interval);

        let tracker = Arc::new(BehaviorTracker::new(behavior));
        let _sweeper = tracker.clone().spawn_sweeper();

        let (reporter, _drain) = ReportDispatcher::spawn(
            client,
            config.station_url.clone(),
            config.api_key.clone(),
            config.report_buffer,
        );

        Ok(Arc::new(Self::new(
            config, keys, registry, tracker, analyzer, reporter,
        )))
    }

    /// The behavior tracker, for snapshots and tests.
    pub fn tracker(&self) -> &Arc<BehaviorTracker> {
        &self.tracker
    }

    /// The action registry.
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Run the request pipeline for one inbound action.
    pub async fn execute(
        &self,
        credential: Option<&str>,
        action: &str,
        params: Map<String, Value>,
    ) -> ActionReply {
        // 1-2. Credential extraction and local verification. Certificate
        // failures carry no usable agent identity, so no report goes out.
        let Some(token) = credential else {
            return ActionReply::denied(&Error::MissingCredential);
        };
        let claims = match self.keys.verifier().verify(token) {
            Ok(claims) => claims,
            Err(e) => return ActionReply::denied(&e),
        };

        // 3. Blocked sessions are denied before any handler runs.
        if self.tracker.is_blocked(&claims.sub, Utc::now()) {
            self.report(
                &claims,
                "behavioral_block",
                false,
                json!({ "reason": "session blocked" }),
            );
            return ActionReply::denied(&Error::Forbidden(
                "agent is blocked for the remainder of this session".to_string(),
            ));
        }

        // 4. Unknown actions are a 404 carrying the available list, and a
        // failed behavior entry so probing shows up in the session.
        if !self.registry.contains(action) {
            let outcome =
                self.tracker
                    .record_action(&claims.sub, &claims.agent_external_id, action, &params, false, true);
            self.report(
                &claims,
                action,
                false,
                json!({
                    "error": "unknown action",
                    "behaviorScore": outcome.behavior_score,
                }),
            );
            return ActionReply {
                status: StatusCode::NOT_FOUND,
                body: json!({
                    "success": false,
                    "error": format!("unknown action: {action}"),
                    "availableActions": self.registry.names(),
                }),
            };
        }

        // 5. Scope check.
        if !claims.authorizes(action) {
            let outcome =
                self.tracker
                    .record_action(&claims.sub, &claims.agent_external_id, action, &params, false, false);
            self.report(
                &claims,
                action,
                false,
                json!({
                    "error": "scope_violation",
                    "scope": claims.scope,
                    "behaviorScore": outcome.behavior_score,
                }),
            );
            let error = Error::Forbidden(format!(
                "action '{action}' is outside the certificate scope"
            ));
            let mut reply = ActionReply::denied(&error);
            attach_advisory(&mut reply.body, &outcome);
            return reply;
        }

        // 6. Optional ML threat check. Absent or failing analyzer means
        // the pipeline proceeds as though safe.
        if let Some(analyzer) = &self.analyzer {
            match analyzer.analyze(&params, &claims.sub) {
                Ok(report) if !report.safe => {
                    let outcome = self.tracker.record_action(
                        &claims.sub,
                        &claims.agent_external_id,
                        action,
                        &params,
                        false,
                        true,
                    );
                    self.report(
                        &claims,
                        action,
                        false,
                        json!({
                            "error": "ml_threat_detected",
                            "threats": report.threats,
                            "behaviorScore": outcome.behavior_score,
                        }),
                    );
                    return ActionReply {
                        status: StatusCode::FORBIDDEN,
                        body: json!({
                            "success": false,
                            "error": "request flagged as unsafe",
                            "threats": report.threats,
                        }),
                    };
                }
                Ok(_) => {}
                Err(e) => warn!("threat analyzer failed open: {e}"),
            }
        }

        // 7. Score gate, validation, execution.
        let ctx = AgentContext {
            agent_id: claims.sub.clone(),
            external_id: claims.agent_external_id.clone(),
            developer_id: claims.developer_id.clone(),
            score: claims.score,
        };
        let score_met = self
            .registry
            .min_score(action)
            .map_or(true, |min| claims.score >= min);
        let execution = self.registry.execute(action, &params, &ctx);

        // 8. Behavior record. `score_met` flows in regardless of outcome.
        let outcome = self.tracker.record_action(
            &claims.sub,
            &claims.agent_external_id,
            action,
            &params,
            execution.success,
            score_met,
        );

        // 9. Fire-and-forget report with full metadata.
        self.report(
            &claims,
            action,
            execution.success,
            json!({
                "params": Value::Object(params.clone()),
                "behaviorScore": outcome.behavior_score,
                "flags": outcome.triggered,
                "blocked": outcome.blocked,
            }),
        );

        // 10. Response shaping.
        if outcome.blocked {
            let mut reply = ActionReply {
                status: StatusCode::FORBIDDEN,
                body: json!({
                    "success": false,
                    "error": "agent blocked mid-session due to behavioral violations",
                }),
            };
            attach_advisory(&mut reply.body, &outcome);
            return reply;
        }

        let mut reply = if execution.success {
            ActionReply {
                status: StatusCode::OK,
                body: json!({ "success": true, "data": execution.data }),
            }
        } else {
            ActionReply {
                status: StatusCode::FORBIDDEN,
                body: json!({
                    "success": false,
                    "error": execution.error.unwrap_or_else(|| "execution failed".to_string()),
                }),
            }
        };
        attach_advisory(&mut reply.body, &outcome);
        reply
    }

    fn report(&self, claims: &CertificateClaims, action_type: &str, success: bool, metadata: Value) {
        let outcome = if success {
            ActionOutcome::Success
        } else {
            ActionOutcome::Failure
        };
        self.reporter.dispatch(GatewayReport {
            agent_id: claims.sub.clone(),
            gateway_id: self.config.gateway_id.clone(),
            certificate_jti: claims.jti.clone(),
            actions: vec![ReportedAction {
                action_type: action_type.to_string(),
                outcome,
                metadata,
                performed_at: Utc::now(),
            }],
        });
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("gateway_id", &self.config.gateway_id)
            .field("station_url", &self.config.station_url)
            .finish()
    }
}

/// Attach the behavior advisory block when the session is degraded.
fn attach_advisory(body: &mut Value, outcome: &BehaviorOutcome) {
    if outcome.behavior_score >= 80 && outcome.triggered.is_empty() {
        return;
    }
    let warning = if outcome.behavior_score < 50 {
        "Severe behavioral anomalies detected. Further violations will block this session."
    } else {
        "Behavioral anomalies observed. Moderate this session's request pattern."
    };
    if let Some(map) = body.as_object_mut() {
        map.insert(
            "behavior".to_string(),
            json!({
                "score": outcome.behavior_score,
                "flags": outcome.triggered,
                "warning": warning,
            }),
        );
    }
}

// ============================================================================
// HTTP surface
// ============================================================================

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    #[serde(default)]
    params: Map<String, Value>,
}

/// Build the gateway router, mountable under any prefix.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/.well-known/agent-gateway", get(discovery))
        .route("/actions", get(list_actions))
        .route("/actions/{name}", post(execute_action))
        .route("/behavior/sessions", get(behavior_sessions))
        .with_state(gateway)
}

async fn discovery(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let mut features = vec!["local-verification", "behavior-tracking"];
    if gateway.analyzer.is_some() {
        features.push("threat-analysis");
    }
    envelope(json!({
        "gatewayId": gateway.config.gateway_id,
        "actions": gateway.registry.names(),
        "features": features,
    }))
}

async fn list_actions(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    envelope(gateway.registry.list())
}

async fn behavior_sessions(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    envelope(gateway.tracker.snapshot())
}

async fn execute_action(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ExecuteBody>,
) -> (StatusCode, Json<Value>) {
    let credential = extract_credential(&headers);
    let reply = gateway
        .execute(credential.as_deref(), &name, body.params)
        .await;
    (reply.status, Json(reply.body))
}

/// Pull the certificate from `Authorization: Bearer` or the fallback
/// `X-Agent-Certificate` header.
fn extract_credential(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    headers
        .get(CERTIFICATE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_credential_prefers_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok-1"),
        );
        headers.insert(CERTIFICATE_HEADER, HeaderValue::from_static("tok-2"));
        assert_eq!(extract_credential(&headers).as_deref(), Some("tok-1"));
    }

    #[test]
    fn test_extract_credential_falls_back_to_header() {
        let mut headers = HeaderMap::new();
        headers.insert(CERTIFICATE_HEADER, HeaderValue::from_static("tok-2"));
        assert_eq!(extract_credential(&headers).as_deref(), Some("tok-2"));
        assert_eq!(extract_credential(&HeaderMap::new()), None);
    }

    #[test]
    fn test_advisory_bands() {
        let mut body = json!({ "success": true });
        let healthy = BehaviorOutcome {
            behavior_score: 100,
            triggered: Vec::new(),
            new_flags: Vec::new(),
            blocked: false,
        };
        attach_advisory(&mut body, &healthy);
        assert!(body.get("behavior").is_none());

        let mild = BehaviorOutcome {
            behavior_score: 70,
            triggered: Vec::new(),
            new_flags: Vec::new(),
            blocked: false,
        };
        attach_advisory(&mut body, &mild);
        let advisory = body["behavior"].clone();
        assert_eq!(advisory["score"], 70);
        assert!(advisory["warning"].as_str().unwrap().contains("Moderate"));

        let severe = BehaviorOutcome {
            behavior_score: 40,
            triggered: vec![crate::behavior::BehaviorFlag::RapidFire],
            new_flags: Vec::new(),
            blocked: false,
        };
        attach_advisory(&mut body, &severe);
        assert!(body["behavior"]["warning"]
            .as_str()
            .unwrap()
            .contains("Severe"));
        assert_eq!(body["behavior"]["flags"][0], "rapid_fire");
    }
}
