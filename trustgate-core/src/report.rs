//! Gateway-to-station behavior reports.
//!
//! Report submission is fire-and-forget by design: an agent should not be
//! punished for a flaky gateway-to-station link. Reports flow through a
//! bounded channel drained by a background task; send failures are logged
//! and never propagate into the request that produced them. Duplicate
//! delivery is possible and accepted - the station increments counters
//! non-idempotently.

use crate::error::Result;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outcome of one reported action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionOutcome {
    Success,
    Failure,
}

/// One action observed by a gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedAction {
    /// Action name, or a pseudo-action such as `behavioral_block`.
    #[serde(rename = "actionType")]
    pub action_type: String,
    /// Whether the action succeeded.
    pub outcome: ActionOutcome,
    /// Gateway-side context: params, behavior score, flags, blocked state.
    #[serde(default)]
    pub metadata: Value,
    /// When the gateway observed the action.
    #[serde(rename = "performedAt")]
    pub performed_at: DateTime<Utc>,
}

/// A batch report submitted to the station's `/reports` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayReport {
    /// Internal agent UUID (the certificate's `sub`).
    #[serde(rename = "agentId")]
    pub agent_id: String,
    /// Reporting gateway identifier.
    #[serde(rename = "gatewayId")]
    pub gateway_id: String,
    /// `jti` of the certificate the agent presented.
    #[serde(rename = "certificateJti")]
    pub certificate_jti: String,
    /// Observed actions, in gateway wall-clock order.
    pub actions: Vec<ReportedAction>,
}

/// Summary the station returns after ingesting a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSummary {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "actionsProcessed")]
    pub actions_processed: usize,
    #[serde(rename = "successCount")]
    pub success_count: usize,
    #[serde(rename = "failureCount")]
    pub failure_count: usize,
    #[serde(rename = "newReputationScore")]
    pub new_reputation_score: i64,
}

/// Fire-and-forget report channel. Clone freely; all clones feed the same
/// drain task.
#[derive(Debug, Clone)]
pub struct ReportDispatcher {
    tx: mpsc::Sender<GatewayReport>,
}

impl ReportDispatcher {
    /// Spawn the drain task and return the dispatcher feeding it.
    ///
    /// The drain posts each report to `{station_url}/reports` with the
    /// gateway's API key. Failures of any kind are logged and dropped.
    pub fn spawn(
        client: reqwest::Client,
        station_url: String,
        api_key: SecretString,
        buffer: usize,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<GatewayReport>(buffer);
        let handle = tokio::spawn(async move {
            let endpoint = format!("{}/reports", station_url.trim_end_matches('/'));
            while let Some(report) = rx.recv().await {
                match submit(&client, &endpoint, &api_key, &report).await {
                    Ok(()) => debug!(
                        agent = %report.agent_id,
                        actions = report.actions.len(),
                        "behavior report delivered"
                    ),
                    Err(e) => warn!(
                        agent = %report.agent_id,
                        error = %e,
                        "behavior report dropped"
                    ),
                }
            }
        });
        (Self { tx }, handle)
    }

    /// A dispatcher that drops everything. For tests and standalone mode.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    /// Queue a report. Never blocks and never fails the caller: a full or
    /// closed channel logs a warning and drops the report.
    pub fn dispatch(&self, report: GatewayReport) {
        if let Err(e) = self.tx.try_send(report) {
            warn!("behavior report dropped: {e}");
        }
    }
}

async fn submit(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: &SecretString,
    report: &GatewayReport,
) -> Result<()> {
    let response = client
        .post(endpoint)
        .bearer_auth(api_key.expose_secret())
        .json(report)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(crate::error::Error::Upstream(format!(
            "station rejected report: {}",
            response.status()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serializes_with_wire_names() {
        let report = GatewayReport {
            agent_id: "a1".to_string(),
            gateway_id: "gw-1".to_string(),
            certificate_jti: "jti-1".to_string(),
            actions: vec![ReportedAction {
                action_type: "search".to_string(),
                outcome: ActionOutcome::Success,
                metadata: serde_json::json!({"behaviorScore": 100}),
                performed_at: Utc::now(),
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["agentId"], "a1");
        assert_eq!(json["certificateJti"], "jti-1");
        assert_eq!(json["actions"][0]["actionType"], "search");
        assert_eq!(json["actions"][0]["outcome"], "success");
    }

    #[tokio::test]
    async fn test_disabled_dispatcher_drops_silently() {
        let dispatcher = ReportDispatcher::disabled();
        for _ in 0..10 {
            dispatcher.dispatch(GatewayReport {
                agent_id: "a1".to_string(),
                gateway_id: "gw".to_string(),
                certificate_jti: "jti".to_string(),
                actions: Vec::new(),
            });
        }
    }
}
