//! # Trustgate Core
//!
//! Trust-verification core for an agent-authorization system.
//!
//! A central **trust station** issues short-lived signed clearance
//! certificates to autonomous software agents based on a durable reputation
//! score. Distributed **gateways**, embedded in relying services, verify
//! those certificates locally, enforce per-action score thresholds, watch
//! live session behavior, and feed observations back to the station.
//!
//! ## Key Concepts
//!
//! - **Certificate**: an RS256 compact JWS vouching for an agent's identity,
//!   status, and reputation at issuance. Possession = authority within scope
//!   and expiry.
//! - **Reputation score**: a 0-100 integer derived by a fixed multi-factor
//!   formula from an agent's persisted history.
//! - **Behavior score**: a 0-100 per-session integer degraded by live
//!   detectors on a gateway; crossing the block threshold denies the agent
//!   mid-session.
//!
//! ## Example
//!
//! ```rust,ignore
//! use trustgate_core::{Station, Gateway, ActionRegistry, ParamType};
//!
//! // Station side: issue a scoped certificate.
//! let issued = station.issue_certificate(&developer_id, "crawler-7", Some(vec!["search".into()]))?;
//!
//! // Gateway side: verify locally and run the pipeline.
//! let response = gateway.execute(Some(&issued.token), "search", params).await;
//! ```

pub mod audit;
pub mod behavior;
pub mod certificate;
pub mod client;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod registry;
pub mod report;
pub mod reputation;
pub mod station;
pub mod store;
pub mod threat;

pub use audit::{BehaviorListener, NoOpListener, StdoutListener};
pub use behavior::{
    params_fingerprint, BehaviorConfig, BehaviorEvent, BehaviorFlag, BehaviorOutcome,
    BehaviorTracker, SessionSnapshot,
};
pub use certificate::{
    AgentProfile, CertificateClaims, CertificateIssuer, CertificateVerifier, IssuedCertificate,
};
pub use client::{ActionResponse, AgentClient, ScopeUpdate};
pub use error::{Error, Result};
pub use gateway::{Gateway, GatewayConfig, StationKeyCache};
pub use keys::{KeyDiscovery, PublicKey, SigningKey};
pub use registry::{
    ActionDef, ActionRegistry, ActionView, AgentContext, ExecutionResult, ParamSpec, ParamType,
};
pub use report::{
    ActionOutcome, GatewayReport, ReportDispatcher, ReportSummary, ReportedAction,
};
pub use reputation::{compute_score, ReputationInputs, ScoreBreakdown};
pub use station::{AgentStatus, PreActionDecision, Station, VerifyOutcome};
pub use store::Store;
pub use threat::{PatternAnalyzer, Threat, ThreatAnalyzer, ThreatReport, ThreatType};

/// Issuer claim carried by every certificate and enforced by every verifier.
pub const ISSUER: &str = "agent-trust-station";

/// Default certificate lifetime in seconds.
///
/// Short by design: revocation is only visible to the station-side verifier,
/// so expiry is the effective recall mechanism for gateways. Configurable
/// process-wide via `CERTIFICATE_EXPIRY_SECONDS`, immutable per run.
pub const DEFAULT_CERTIFICATE_TTL_SECS: u64 = 300;

/// Default interval between gateway refreshes of the station public key.
pub const DEFAULT_KEY_REFRESH_SECS: u64 = 3600;

/// Remaining-lifetime buffer below which the agent client refreshes its
/// cached certificate instead of presenting it.
pub const TOKEN_REFRESH_BUFFER_SECS: i64 = 30;

/// Minimum cached score an agent needs before its vouches carry weight.
pub const VOUCHER_MIN_SCORE: i64 = 60;
