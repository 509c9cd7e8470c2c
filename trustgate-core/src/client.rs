//! Agent-side certificate client.
//!
//! Owns the cached current token, its absolute expiry, and the agent's
//! current scope. Tokens are reused while they have more than the refresh
//! buffer of lifetime left and the requested scope matches; everything
//! else triggers a fresh request to the station.
//!
//! On a gateway 401 the client force-refreshes once and retries exactly
//! once; the retry's result is returned verbatim.

use crate::error::{Error, Result};
use crate::TOKEN_REFRESH_BUFFER_SECS;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

/// How `acquire` should treat the current scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeUpdate {
    /// Keep the current scope.
    Unchanged,
    /// Clear to wildcard.
    Clear,
    /// Replace the current scope with this list.
    Replace(Vec<String>),
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
    scope: Option<Vec<String>>,
}

#[derive(Debug, Default)]
struct ClientState {
    cached: Option<CachedToken>,
    scope: Option<Vec<String>>,
}

/// Response to one gateway action call.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionResponse {
    /// HTTP status the gateway answered with.
    #[serde(skip)]
    pub status: u16,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Advisory block attached when the session behavior is degraded.
    #[serde(default)]
    pub behavior: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CertificateData {
    token: String,
    #[serde(rename = "expiresAt")]
    expires_at: DateTime<Utc>,
    #[allow(dead_code)]
    score: i64,
}

#[derive(Debug, Deserialize)]
struct CertificateEnvelope {
    success: bool,
    #[serde(default)]
    data: Option<CertificateData>,
    #[serde(default)]
    error: Option<String>,
}

/// Client an agent embeds to talk to gateways.
#[derive(Debug)]
pub struct AgentClient {
    http: reqwest::Client,
    station_url: String,
    api_key: SecretString,
    external_id: String,
    state: Mutex<ClientState>,
}

impl AgentClient {
    /// Create a client for one agent identity.
    pub fn new(
        station_url: impl Into<String>,
        api_key: SecretString,
        external_id: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            station_url: station_url.into(),
            api_key,
            external_id: external_id.into(),
            state: Mutex::new(ClientState::default()),
        })
    }

    /// Set the scope for subsequent certificates. A change clears the
    /// cached token.
    pub async fn set_scope(&self, scope: Option<Vec<String>>) {
        let mut state = self.state.lock().await;
        if state.scope != scope {
            state.scope = scope;
            state.cached = None;
        }
    }

    /// Get a valid certificate, reusing the cache when possible.
    pub async fn acquire(&self, force_refresh: bool, scope: ScopeUpdate) -> Result<String> {
        let mut state = self.state.lock().await;
        state.scope = apply_scope(state.scope.take(), scope);

        if !force_refresh {
            if let Some(cached) = &state.cached {
                if cache_is_fresh(cached, &state.scope, Utc::now()) {
                    return Ok(cached.token.clone());
                }
            }
        }

        let fresh = self.request_certificate(&state.scope).await?;
        debug!(expires_at = %fresh.expires_at, "acquired certificate");
        let token = fresh.token.clone();
        state.cached = Some(CachedToken {
            token: fresh.token,
            expires_at: fresh.expires_at,
            scope: state.scope.clone(),
        });
        Ok(token)
    }

    /// Execute one action against a gateway.
    ///
    /// Retries exactly once on 401 with a force-refreshed certificate and
    /// returns the retry's result verbatim.
    pub async fn execute_action(
        &self,
        gateway_url: &str,
        name: &str,
        params: Map<String, Value>,
    ) -> Result<ActionResponse> {
        let token = self.acquire(false, ScopeUpdate::Unchanged).await?;
        let response = self.post_action(gateway_url, name, &params, &token).await?;
        if response.status != 401 {
            return Ok(response);
        }

        debug!(action = name, "gateway answered 401; refreshing certificate once");
        let token = self.acquire(true, ScopeUpdate::Unchanged).await?;
        self.post_action(gateway_url, name, &params, &token).await
    }

    /// Execute actions sequentially, halting on the first failure.
    ///
    /// The failing response is included as the last element.
    pub async fn execute_batch(
        &self,
        gateway_url: &str,
        items: &[(String, Map<String, Value>)],
    ) -> Result<Vec<ActionResponse>> {
        let mut results = Vec::with_capacity(items.len());
        for (name, params) in items {
            let response = self
                .execute_action(gateway_url, name, params.clone())
                .await?;
            let failed = !response.success;
            results.push(response);
            if failed {
                break;
            }
        }
        Ok(results)
    }

    async fn request_certificate(&self, scope: &Option<Vec<String>>) -> Result<CertificateData> {
        let url = format!(
            "{}/certificates/request",
            self.station_url.trim_end_matches('/')
        );
        let mut body = json!({ "agentId": self.external_id });
        if let Some(scope) = scope {
            body["scope"] = json!(scope);
        }
        let envelope: CertificateEnvelope = self
            .http
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        if !envelope.success {
            return Err(Error::Upstream(
                envelope
                    .error
                    .unwrap_or_else(|| "certificate request failed".to_string()),
            ));
        }
        envelope
            .data
            .ok_or_else(|| Error::Upstream("certificate response carried no data".to_string()))
    }

    async fn post_action(
        &self,
        gateway_url: &str,
        name: &str,
        params: &Map<String, Value>,
        token: &str,
    ) -> Result<ActionResponse> {
        let url = format!("{}/actions/{name}", gateway_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "params": params }))
            .send()
            .await?;
        let status = response.status().as_u16();
        let mut parsed: ActionResponse = response.json().await?;
        parsed.status = status;
        Ok(parsed)
    }
}

/// Apply a scope update to the current scope.
fn apply_scope(current: Option<Vec<String>>, update: ScopeUpdate) -> Option<Vec<String>> {
    match update {
        ScopeUpdate::Unchanged => current,
        ScopeUpdate::Clear => None,
        ScopeUpdate::Replace(scope) => Some(scope),
    }
}

/// Whether a cached token can be presented instead of fetching fresh.
fn cache_is_fresh(
    cached: &CachedToken,
    requested_scope: &Option<Vec<String>>,
    now: DateTime<Utc>,
) -> bool {
    cached.scope == *requested_scope
        && now + Duration::seconds(TOKEN_REFRESH_BUFFER_SECS) < cached.expires_at
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(expires_in_secs: i64, scope: Option<Vec<String>>) -> CachedToken {
        CachedToken {
            token: "tok".to_string(),
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
            scope,
        }
    }

    #[test]
    fn test_cache_fresh_inside_buffer() {
        let now = Utc::now();
        // 20 s of lifetime left is inside the 30 s buffer: refresh.
        assert!(!cache_is_fresh(&cached(20, None), &None, now));
        // 25 s is still inside the buffer.
        assert!(!cache_is_fresh(&cached(25, None), &None, now));
        // 60 s of lifetime is enough to reuse.
        assert!(cache_is_fresh(&cached(60, None), &None, now));
    }

    #[test]
    fn test_cache_requires_matching_scope() {
        let now = Utc::now();
        let scoped = cached(300, Some(vec!["search".to_string()]));
        assert!(cache_is_fresh(
            &scoped,
            &Some(vec!["search".to_string()]),
            now
        ));
        assert!(!cache_is_fresh(&scoped, &None, now));
        assert!(!cache_is_fresh(
            &scoped,
            &Some(vec!["checkout".to_string()]),
            now
        ));
    }

    #[test]
    fn test_apply_scope_semantics() {
        let current = Some(vec!["search".to_string()]);
        assert_eq!(
            apply_scope(current.clone(), ScopeUpdate::Unchanged),
            current
        );
        assert_eq!(apply_scope(current.clone(), ScopeUpdate::Clear), None);
        assert_eq!(
            apply_scope(current, ScopeUpdate::Replace(vec!["order".to_string()])),
            Some(vec!["order".to_string()])
        );
    }

    #[tokio::test]
    async fn test_set_scope_clears_cache_on_change() {
        let client = AgentClient::new(
            "http://station.invalid",
            SecretString::new("atk_test".to_string()),
            "crawler-7",
        )
        .unwrap();
        {
            let mut state = client.state.lock().await;
            state.cached = Some(cached(300, None));
        }
        // Same scope: cache survives.
        client.set_scope(None).await;
        assert!(client.state.lock().await.cached.is_some());
        // New scope: cache cleared.
        client
            .set_scope(Some(vec!["search".to_string()]))
            .await;
        assert!(client.state.lock().await.cached.is_none());
    }
}
