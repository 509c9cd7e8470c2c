//! Certificate issuance and verification round-trips.

mod common;

use chrono::Utc;
use common::{signing_key, station_with_agent};
use std::sync::Arc;
use std::time::Duration;
use trustgate_core::{
    AgentProfile, AgentStatus, CertificateIssuer, CertificateVerifier, Error,
};

#[test]
fn issued_certificate_verifies_with_same_claims() {
    let fixture = station_with_agent("crawler-7");
    let issued = fixture
        .station
        .issue_certificate(&fixture.developer.id, "crawler-7", Some(vec!["search".into()]))
        .unwrap();

    assert_eq!(issued.score, 50);
    assert!(issued.expires_at > Utc::now());

    let verifier = CertificateVerifier::new(fixture.station.public_key().clone());
    let claims = verifier.verify(&issued.token).unwrap();
    assert_eq!(claims.sub, fixture.agent.id);
    assert_eq!(claims.agent_external_id, "crawler-7");
    assert_eq!(claims.developer_id, fixture.developer.id);
    assert_eq!(claims.score, 50);
    assert_eq!(claims.jti, issued.jti);
    assert_eq!(claims.scope.as_deref(), Some(&["search".to_string()][..]));
    assert_eq!(claims.exp - claims.iat, 300);
}

#[test]
fn fresh_agent_has_null_success_rate_on_the_wire() {
    let fixture = station_with_agent("crawler-7");
    let issued = fixture
        .station
        .issue_certificate(&fixture.developer.id, "crawler-7", None)
        .unwrap();

    // Decode the payload segment without verification to inspect raw JSON.
    let payload_b64 = issued.token.split('.').nth(1).unwrap();
    use base64::Engine;
    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .unwrap();
    let raw: serde_json::Value = serde_json::from_slice(&payload).unwrap();

    assert!(raw.get("successRate").is_some());
    assert!(raw["successRate"].is_null());
    assert!(raw.get("scope").is_none());
    assert_eq!(raw["iss"], "agent-trust-station");
}

#[test]
fn expired_certificate_maps_to_cert_expired() {
    let fixture = station_with_agent("crawler-7");
    let issuer = CertificateIssuer::new(Arc::new(signing_key()), Duration::from_secs(300));
    let profile = AgentProfile {
        id: fixture.agent.id.clone(),
        external_id: "crawler-7".to_string(),
        developer_id: fixture.developer.id.clone(),
        score: 50,
        identity_verified: false,
        status: AgentStatus::Active,
        total_actions: 0,
        successful_actions: 0,
    };
    let stale = issuer
        .issue(&profile, None, Utc::now() - chrono::Duration::seconds(600))
        .unwrap();

    let verifier = CertificateVerifier::new(fixture.station.public_key().clone());
    assert!(matches!(verifier.verify(&stale.token), Err(Error::CertExpired)));
}

#[test]
fn foreign_key_maps_to_cert_invalid() {
    let fixture = station_with_agent("crawler-7");
    let issued = fixture
        .station
        .issue_certificate(&fixture.developer.id, "crawler-7", None)
        .unwrap();

    let stranger = trustgate_core::SigningKey::generate().unwrap();
    let verifier = CertificateVerifier::new(stranger.public_key().clone());
    assert!(matches!(
        verifier.verify(&issued.token),
        Err(Error::CertInvalid(_))
    ));
}

#[test]
fn remote_path_rejects_revoked_and_unknown_records() {
    let fixture = station_with_agent("crawler-7");
    let issued = fixture
        .station
        .issue_certificate(&fixture.developer.id, "crawler-7", None)
        .unwrap();

    assert!(fixture.station.verify_remote(&issued.token).valid);

    fixture
        .station
        .store()
        .revoke_certificate(&issued.jti)
        .unwrap();
    let outcome = fixture.station.verify_remote(&issued.token);
    assert!(!outcome.valid);
    assert_eq!(outcome.reason.as_deref(), Some("certificate revoked"));
}

#[test]
fn suspended_agent_cannot_obtain_certificates() {
    let fixture = station_with_agent("crawler-7");
    fixture
        .station
        .store()
        .set_status(&fixture.agent.id, AgentStatus::Suspended)
        .unwrap();
    assert!(matches!(
        fixture
            .station
            .issue_certificate(&fixture.developer.id, "crawler-7", None),
        Err(Error::Forbidden(_))
    ));
}
