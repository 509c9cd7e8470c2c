//! Clearance certificates.
//!
//! A certificate is an RS256 compact JWS vouching for an agent's identity,
//! status, and reputation at issuance. The station signs; any holder of the
//! station public key verifies locally without calling home.
//!
//! ## Claims
//!
//! `iss, sub, jti, iat, exp, agentExternalId, developerId, score,
//! identityVerified, status, totalActions, successRate, scope?`
//!
//! `successRate` is `null` until the agent has reported at least one action.
//! `scope` is an allow-list of action names; absence means wildcard.
//!
//! ## Revocation
//!
//! Setting `revoked` on the persisted certificate record invalidates the
//! token at the station's remote verification path only. Gateways keep
//! accepting it until `exp` - the accepted limitation of short-expiry
//! bearer tokens.

use crate::error::{Error, Result};
use crate::keys::{PublicKey, SigningKey};
use crate::store::AgentStatus;
use crate::ISSUER;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// The decoded payload of a clearance certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateClaims {
    /// Issuer. Always [`ISSUER`].
    pub iss: String,
    /// Internal agent UUID.
    pub sub: String,
    /// Unique certificate id, the revocation key.
    pub jti: String,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Developer-scoped agent identifier.
    #[serde(rename = "agentExternalId")]
    pub agent_external_id: String,
    /// Owning developer UUID.
    #[serde(rename = "developerId")]
    pub developer_id: String,
    /// Reputation score captured at issuance.
    pub score: i64,
    /// Whether the owning developer completed identity verification.
    #[serde(rename = "identityVerified")]
    pub identity_verified: bool,
    /// Agent status at issuance.
    pub status: AgentStatus,
    /// Lifetime action count at issuance.
    #[serde(rename = "totalActions")]
    pub total_actions: u64,
    /// successful/total rounded to two decimals; `null` when no actions yet.
    #[serde(rename = "successRate")]
    pub success_rate: Option<f64>,
    /// Authorized action names. Absent means wildcard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Vec<String>>,
}

impl CertificateClaims {
    /// Whether this certificate authorizes the named action.
    ///
    /// An absent or empty scope is a wildcard.
    pub fn authorizes(&self, action: &str) -> bool {
        match &self.scope {
            Some(scope) if !scope.is_empty() => scope.iter().any(|s| s == action),
            _ => true,
        }
    }

    /// Absolute expiry time.
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_default()
    }
}

/// Snapshot of the agent row a certificate is minted from.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    /// Internal agent UUID.
    pub id: String,
    /// Developer-scoped external id.
    pub external_id: String,
    /// Owning developer UUID.
    pub developer_id: String,
    /// Freshly recomputed reputation score.
    pub score: i64,
    /// Identity verification state.
    pub identity_verified: bool,
    /// Agent status.
    pub status: AgentStatus,
    /// Lifetime action count.
    pub total_actions: u64,
    /// Lifetime successful action count.
    pub successful_actions: u64,
}

/// Result of issuing a certificate.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedCertificate {
    /// The compact JWS string.
    pub token: String,
    /// Absolute expiry time.
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    /// Score captured at issuance.
    pub score: i64,
    /// Certificate id, persisted for revocation.
    #[serde(skip)]
    pub jti: String,
}

/// Signs clearance certificates with the station key.
///
/// TTL is fixed at construction: configurable process-wide, immutable per
/// run.
#[derive(Debug, Clone)]
pub struct CertificateIssuer {
    signing: Arc<SigningKey>,
    ttl: Duration,
}

impl CertificateIssuer {
    /// Create an issuer with the given certificate lifetime.
    pub fn new(signing: Arc<SigningKey>, ttl: Duration) -> Self {
        Self { signing, ttl }
    }

    /// The configured certificate lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint and sign a certificate for an agent.
    ///
    /// The caller is responsible for the status gate and for persisting the
    /// returned `jti`.
    pub fn issue(
        &self,
        agent: &AgentProfile,
        scope: Option<Vec<String>>,
        now: DateTime<Utc>,
    ) -> Result<IssuedCertificate> {
        let jti = Uuid::new_v4().to_string();
        let iat = now.timestamp();
        let exp = iat + self.ttl.as_secs() as i64;

        let success_rate = if agent.total_actions > 0 {
            let ratio = agent.successful_actions as f64 / agent.total_actions as f64;
            Some((ratio * 100.0).round() / 100.0)
        } else {
            None
        };

        // Empty scope means wildcard; only a non-empty list is copied into
        // the claim.
        let scope = scope.filter(|s| !s.is_empty());

        let claims = CertificateClaims {
            iss: ISSUER.to_string(),
            sub: agent.id.clone(),
            jti: jti.clone(),
            iat,
            exp,
            agent_external_id: agent.external_id.clone(),
            developer_id: agent.developer_id.clone(),
            score: agent.score,
            identity_verified: agent.identity_verified,
            status: agent.status,
            total_actions: agent.total_actions,
            success_rate,
            scope,
        };

        let token = encode(
            &Header::new(Algorithm::RS256),
            &claims,
            self.signing.encoding_key(),
        )
        .map_err(|e| Error::Internal(format!("certificate signing failed: {e}")))?;

        Ok(IssuedCertificate {
            token,
            expires_at: Utc.timestamp_opt(exp, 0).single().unwrap_or_default(),
            score: agent.score,
            jti,
        })
    }
}

/// Verifies certificates against the station public key.
///
/// This is the local path: signature, issuer, and expiry checks only. The
/// station's remote path layers a revocation lookup on top.
#[derive(Debug, Clone)]
pub struct CertificateVerifier {
    key: PublicKey,
}

impl CertificateVerifier {
    /// Create a verifier for the given station public key.
    pub fn new(key: PublicKey) -> Self {
        Self { key }
    }

    /// The key this verifier trusts.
    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    /// Verify a compact JWS and return its decoded claims.
    ///
    /// Failure taxonomy: [`Error::CertExpired`] when the signature is good
    /// but the token is past `exp`; [`Error::CertInvalid`] for signature,
    /// issuer, or shape failures; [`Error::AgentDisabled`] when the status
    /// claim marks the agent suspended or banned.
    pub fn verify(&self, token: &str) -> Result<CertificateClaims> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[ISSUER]);
        validation.leeway = 0;

        let data = decode::<CertificateClaims>(token, self.key.decoding_key(), &validation)
            .map_err(map_jwt_error)?;
        let claims = data.claims;

        if claims.status != AgentStatus::Active {
            return Err(Error::AgentDisabled {
                status: claims.status.to_string(),
            });
        }

        Ok(claims)
    }
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> Error {
    use jsonwebtoken::errors::ErrorKind;
    match e.kind() {
        ErrorKind::ExpiredSignature => Error::CertExpired,
        ErrorKind::InvalidIssuer => Error::CertInvalid("wrong issuer".to_string()),
        _ => Error::CertInvalid(e.to_string()),
    }
}
