//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use secrecy::SecretString;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use trustgate_core::store::{AgentRecord, DeveloperRecord};
use trustgate_core::{
    ActionDef, ActionRegistry, BehaviorConfig, BehaviorTracker, Gateway, GatewayConfig, ParamType,
    ReportDispatcher, SigningKey, Station, StationKeyCache, Store, ThreatAnalyzer,
};

/// RSA generation is expensive in debug builds; every suite in this binary
/// shares one key pair.
pub fn shared_signing_pem() -> &'static str {
    static PEM: OnceLock<String> = OnceLock::new();
    PEM.get_or_init(|| SigningKey::generate().unwrap().to_pem())
}

pub fn signing_key() -> SigningKey {
    SigningKey::from_pem(shared_signing_pem()).unwrap()
}

pub struct TestStation {
    pub station: Arc<Station>,
    pub developer: DeveloperRecord,
    pub api_key: String,
    pub agent: AgentRecord,
}

/// An in-memory station with one developer and one registered agent.
pub fn station_with_agent(external_id: &str) -> TestStation {
    let store = Arc::new(Store::in_memory().unwrap());
    let station = Arc::new(Station::new(
        store.clone(),
        Arc::new(signing_key()),
        Duration::from_secs(300),
    ));
    let (developer, api_key) = store.register_developer("acme").unwrap();
    let agent = store
        .register_agent(&developer.id, external_id, false, 0.0)
        .unwrap();
    TestStation {
        station,
        developer,
        api_key,
        agent,
    }
}

/// A gateway wired directly to a station's public key, with reports
/// disabled. Background tasks are not spawned.
pub fn offline_gateway(
    station: &Station,
    registry: ActionRegistry,
    behavior: BehaviorConfig,
    analyzer: Option<Arc<dyn ThreatAnalyzer>>,
) -> Gateway {
    let keys = Arc::new(StationKeyCache::from_key(station.public_key().clone()));
    let config = GatewayConfig::new(
        "test-gateway",
        "http://station.invalid",
        SecretString::new("atk_test".to_string()),
    );
    Gateway::new(
        config,
        keys,
        registry,
        Arc::new(BehaviorTracker::new(behavior)),
        analyzer,
        ReportDispatcher::disabled(),
    )
}

/// The registry used by the pipeline scenarios: `search` at threshold 30
/// and `order` at threshold 60.
pub fn scenario_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry.register(
        "search",
        ActionDef::new("Search the index", 30, |params, _ctx| {
            let query = params
                .get("query")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| "query must be a string".to_string())?;
            Ok(serde_json::json!([query]))
        })
        .with_param("query", ParamType::String, true, "Search query"),
    );
    registry.register(
        "order",
        ActionDef::new("Place an order", 60, |_params, _ctx| {
            Ok(serde_json::json!({ "status": "confirmed" }))
        })
        .with_param("sku", ParamType::String, true, "Item SKU"),
    );
    registry
}

pub fn params(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    value.as_object().cloned().unwrap()
}
