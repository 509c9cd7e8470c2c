//! Station persistence.
//!
//! A SQLite store behind a connection mutex. The single connection
//! serializes every read-modify-write in the process, which is what keeps
//! the agent counters monotone: a counter bump and the score recompute it
//! triggers always run inside one critical section.
//!
//! `DATABASE_URL` names the SQLite path; `:memory:` is accepted for tests.
//!
//! API keys are never stored in the clear. The store keeps a SHA-256 hex
//! digest under a unique index, so authenticating a request is one indexed
//! lookup rather than a scan over all developers.

use crate::error::{Error, Result};
use crate::reputation::{compute_score, ReputationInputs, ScoreBreakdown};
use crate::VOUCHER_MIN_SCORE;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Mutex;
use uuid::Uuid;

/// Prefix of every developer API key.
const API_KEY_PREFIX: &str = "atk_";

/// Lifecycle status of an agent. The core reads it; status changes happen
/// through operator tooling outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Suspended,
    Banned,
}

impl AgentStatus {
    /// Storage/wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Suspended => "suspended",
            AgentStatus::Banned => "banned",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(AgentStatus::Active),
            "suspended" => Ok(AgentStatus::Suspended),
            "banned" => Ok(AgentStatus::Banned),
            other => Err(Error::Internal(format!("unknown agent status '{other}'"))),
        }
    }
}

/// Types of reputation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationEventType {
    Success,
    Failure,
    VouchReceived,
    StakeAdded,
    AbuseReported,
}

impl ReputationEventType {
    fn as_str(&self) -> &'static str {
        match self {
            ReputationEventType::Success => "success",
            ReputationEventType::Failure => "failure",
            ReputationEventType::VouchReceived => "vouch_received",
            ReputationEventType::StakeAdded => "stake_added",
            ReputationEventType::AbuseReported => "abuse_reported",
        }
    }
}

/// A registered developer.
#[derive(Debug, Clone, Serialize)]
pub struct DeveloperRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// One agent row.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub id: String,
    #[serde(rename = "developerId")]
    pub developer_id: String,
    #[serde(rename = "externalId")]
    pub external_id: String,
    #[serde(rename = "identityVerified")]
    pub identity_verified: bool,
    #[serde(rename = "stakeAmount")]
    pub stake_amount: f64,
    #[serde(rename = "totalActions")]
    pub total_actions: u64,
    #[serde(rename = "successfulActions")]
    pub successful_actions: u64,
    #[serde(rename = "failedActions")]
    pub failed_actions: u64,
    pub status: AgentStatus,
    #[serde(rename = "reputationScore")]
    pub reputation_score: i64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// One persisted certificate record, keyed by `jti`.
#[derive(Debug, Clone)]
pub struct CertificateRecord {
    pub jti: String,
    pub agent_id: String,
    pub score: i64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

/// The station's durable store.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (and initialize) the store at `database_url`.
    pub fn open(database_url: &str) -> Result<Self> {
        let path = database_url
            .strip_prefix("sqlite://")
            .unwrap_or(database_url);
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and demos.
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    // ========================================================================
    // Developers
    // ========================================================================

    /// Create a developer. The returned API key is shown exactly once; only
    /// its digest is persisted.
    pub fn register_developer(&self, name: &str) -> Result<(DeveloperRecord, String)> {
        let id = Uuid::new_v4().to_string();
        let api_key = generate_api_key();
        let created_at = Utc::now();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO developers (id, name, api_key_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, hash_api_key(&api_key), created_at.to_rfc3339()],
        )?;
        Ok((
            DeveloperRecord {
                id,
                name: name.to_string(),
                created_at,
            },
            api_key,
        ))
    }

    /// Authenticate an API key. O(1) via the digest index.
    pub fn developer_by_api_key(&self, api_key: &str) -> Result<DeveloperRecord> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, name, created_at FROM developers WHERE api_key_hash = ?1",
            params![hash_api_key(api_key)],
            |row| {
                Ok(DeveloperRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: parse_ts(row.get::<_, String>(2)?),
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::Unauthenticated("unknown API key".to_string()))
    }

    // ========================================================================
    // Agents
    // ========================================================================

    /// Register an agent under a developer.
    pub fn register_agent(
        &self,
        developer_id: &str,
        external_id: &str,
        identity_verified: bool,
        stake_amount: f64,
    ) -> Result<AgentRecord> {
        if stake_amount < 0.0 {
            return Err(Error::BadRequest("stakeAmount must be non-negative".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let score = compute_score(
            &ReputationInputs {
                identity_verified,
                stake_amount,
                vouches_received: 0,
                total_actions: 0,
                successful_actions: 0,
                failed_actions: 0,
                created_at,
            },
            created_at,
        )
        .score;

        let conn = self.lock();
        conn.execute(
            "INSERT INTO agents (id, developer_id, external_id, identity_verified, stake_amount,
                                 total_actions, successful_actions, failed_actions, status,
                                 reputation_score, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, 0, 'active', ?6, ?7)",
            params![
                id,
                developer_id,
                external_id,
                identity_verified,
                stake_amount,
                score,
                created_at.to_rfc3339()
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Conflict(format!(
                    "agent '{external_id}' already registered for this developer"
                ))
            } else {
                e.into()
            }
        })?;
        drop(conn);
        self.agent_by_id(&id)
    }

    /// Look up an agent by its developer-scoped external id.
    pub fn agent_by_external(&self, developer_id: &str, external_id: &str) -> Result<AgentRecord> {
        let conn = self.lock();
        query_agent(
            &conn,
            "SELECT * FROM agents WHERE developer_id = ?1 AND external_id = ?2",
            params![developer_id, external_id],
        )?
        .ok_or_else(|| Error::NotFound(format!("agent '{external_id}' not found")))
    }

    /// Look up an agent by internal UUID.
    pub fn agent_by_id(&self, id: &str) -> Result<AgentRecord> {
        let conn = self.lock();
        query_agent(&conn, "SELECT * FROM agents WHERE id = ?1", params![id])?
            .ok_or_else(|| Error::NotFound(format!("agent '{id}' not found")))
    }

    /// Set an agent's status. Operator-facing.
    pub fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE agents SET status = ?1 WHERE id = ?2",
            params![status.as_str(), agent_id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("agent '{agent_id}' not found")));
        }
        Ok(())
    }

    /// Add stake to an agent and recompute its score.
    pub fn add_stake(&self, agent_id: &str, amount: f64) -> Result<i64> {
        if amount <= 0.0 {
            return Err(Error::BadRequest("stake amount must be positive".to_string()));
        }
        {
            let conn = self.lock();
            let updated = conn.execute(
                "UPDATE agents SET stake_amount = stake_amount + ?1 WHERE id = ?2",
                params![amount, agent_id],
            )?;
            if updated == 0 {
                return Err(Error::NotFound(format!("agent '{agent_id}' not found")));
            }
            append_event(&conn, agent_id, ReputationEventType::StakeAdded, 0)?;
        }
        Ok(self.recompute_score(agent_id)?.score)
    }

    /// Mark an agent's identity as verified and recompute its score.
    pub fn set_identity_verified(&self, agent_id: &str, verified: bool) -> Result<i64> {
        {
            let conn = self.lock();
            let updated = conn.execute(
                "UPDATE agents SET identity_verified = ?1 WHERE id = ?2",
                params![verified, agent_id],
            )?;
            if updated == 0 {
                return Err(Error::NotFound(format!("agent '{agent_id}' not found")));
            }
        }
        Ok(self.recompute_score(agent_id)?.score)
    }

    // ========================================================================
    // Vouches
    // ========================================================================

    /// Create a vouch edge. The voucher requirement is checked against the
    /// cached score, not a live recompute, to avoid recursive evaluation.
    pub fn add_vouch(&self, voucher_id: &str, vouched_id: &str, weight: u8) -> Result<i64> {
        if !(1..=5).contains(&weight) {
            return Err(Error::BadRequest("vouch weight must be in [1, 5]".to_string()));
        }
        if voucher_id == vouched_id {
            return Err(Error::BadRequest("agents cannot vouch for themselves".to_string()));
        }
        let voucher = self.agent_by_id(voucher_id)?;
        if voucher.reputation_score < VOUCHER_MIN_SCORE {
            return Err(Error::Forbidden(format!(
                "voucher score {} is below the required {VOUCHER_MIN_SCORE}",
                voucher.reputation_score
            )));
        }
        self.agent_by_id(vouched_id)?;

        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO vouches (voucher_id, vouched_id, weight, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![voucher_id, vouched_id, weight, Utc::now().to_rfc3339()],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Conflict("vouch already exists for this pair".to_string())
                } else {
                    e.into()
                }
            })?;
            append_event(&conn, vouched_id, ReputationEventType::VouchReceived, 2)?;
        }
        // Recomputation after a vouch touches only the vouched agent's row.
        Ok(self.recompute_score(vouched_id)?.score)
    }

    /// Remove a vouch edge and recompute the vouched agent's score.
    pub fn remove_vouch(&self, voucher_id: &str, vouched_id: &str) -> Result<i64> {
        {
            let conn = self.lock();
            let deleted = conn.execute(
                "DELETE FROM vouches WHERE voucher_id = ?1 AND vouched_id = ?2",
                params![voucher_id, vouched_id],
            )?;
            if deleted == 0 {
                return Err(Error::NotFound("vouch not found".to_string()));
            }
        }
        Ok(self.recompute_score(vouched_id)?.score)
    }

    fn vouch_count(conn: &Connection, agent_id: &str) -> Result<u32> {
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM vouches WHERE vouched_id = ?1",
            params![agent_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ========================================================================
    // Certificates
    // ========================================================================

    /// Persist a freshly issued certificate record.
    pub fn record_certificate(
        &self,
        jti: &str,
        agent_id: &str,
        score: i64,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO certificates (jti, agent_id, score, issued_at, expires_at, revoked)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                jti,
                agent_id,
                score,
                issued_at.to_rfc3339(),
                expires_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Fetch a certificate record by `jti`.
    pub fn certificate(&self, jti: &str) -> Result<Option<CertificateRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT jti, agent_id, score, issued_at, expires_at, revoked
                 FROM certificates WHERE jti = ?1",
                params![jti],
                |row| {
                    Ok(CertificateRecord {
                        jti: row.get(0)?,
                        agent_id: row.get(1)?,
                        score: row.get(2)?,
                        issued_at: parse_ts(row.get::<_, String>(3)?),
                        expires_at: parse_ts(row.get::<_, String>(4)?),
                        revoked: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Revoke a certificate. One-way: revoked records never revert.
    pub fn revoke_certificate(&self, jti: &str) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE certificates SET revoked = 1 WHERE jti = ?1",
            params![jti],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("certificate '{jti}' not found")));
        }
        Ok(())
    }

    // ========================================================================
    // Action log & reputation events
    // ========================================================================

    /// Append an immutable action-log entry. Returns the entry id.
    pub fn log_action(
        &self,
        agent_id: &str,
        action_type: &str,
        decision: &str,
        reason: &str,
        metadata: &Value,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO action_log (agent_id, action_type, decision, reason, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                agent_id,
                action_type,
                decision,
                reason,
                metadata.to_string(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fetch the agent and action type behind an action-log entry.
    pub fn action_log_entry(&self, action_id: i64) -> Result<(String, String)> {
        let conn = self.lock();
        conn.query_row(
            "SELECT agent_id, action_type FROM action_log WHERE id = ?1",
            params![action_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("action {action_id} not found")))
    }

    /// Apply one reported action outcome: bump the counters, append a
    /// reputation event, and recompute the cached score atomically with
    /// respect to other writers.
    pub fn apply_outcome(&self, agent_id: &str, success: bool) -> Result<i64> {
        let now = Utc::now();
        let conn = self.lock();
        let column = if success {
            "successful_actions"
        } else {
            "failed_actions"
        };
        let updated = conn.execute(
            &format!(
                "UPDATE agents SET total_actions = total_actions + 1, {column} = {column} + 1
                 WHERE id = ?1"
            ),
            params![agent_id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("agent '{agent_id}' not found")));
        }
        let (event, delta) = if success {
            (ReputationEventType::Success, 0)
        } else {
            (ReputationEventType::Failure, -5)
        };
        append_event(&conn, agent_id, event, delta)?;
        recompute_locked(&conn, agent_id, now).map(|b| b.score)
    }

    /// Append a gateway-report row.
    pub fn insert_gateway_report(
        &self,
        agent_id: &str,
        gateway_id: &str,
        certificate_jti: &str,
        action_count: usize,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO gateway_reports (agent_id, gateway_id, certificate_jti, action_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                agent_id,
                gateway_id,
                certificate_jti,
                action_count as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // Scoring
    // ========================================================================

    /// Recompute an agent's score from its durable state and write the
    /// cached value back.
    pub fn recompute_score(&self, agent_id: &str) -> Result<ScoreBreakdown> {
        let conn = self.lock();
        recompute_locked(&conn, agent_id, Utc::now())
    }

    /// The scoring inputs for an agent, as currently persisted.
    pub fn reputation_inputs(&self, agent_id: &str) -> Result<ReputationInputs> {
        let conn = self.lock();
        let agent = query_agent(&conn, "SELECT * FROM agents WHERE id = ?1", params![agent_id])?
            .ok_or_else(|| Error::NotFound(format!("agent '{agent_id}' not found")))?;
        let vouches = Self::vouch_count(&conn, agent_id)?;
        Ok(inputs_for(&agent, vouches))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn inputs_for(agent: &AgentRecord, vouches_received: u32) -> ReputationInputs {
    ReputationInputs {
        identity_verified: agent.identity_verified,
        stake_amount: agent.stake_amount,
        vouches_received,
        total_actions: agent.total_actions,
        successful_actions: agent.successful_actions,
        failed_actions: agent.failed_actions,
        created_at: agent.created_at,
    }
}

fn recompute_locked(
    conn: &Connection,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<ScoreBreakdown> {
    let agent = query_agent(conn, "SELECT * FROM agents WHERE id = ?1", params![agent_id])?
        .ok_or_else(|| Error::NotFound(format!("agent '{agent_id}' not found")))?;
    let vouches = Store::vouch_count(conn, agent_id)?;
    let breakdown = compute_score(&inputs_for(&agent, vouches), now);
    conn.execute(
        "UPDATE agents SET reputation_score = ?1 WHERE id = ?2",
        params![breakdown.score, agent_id],
    )?;
    Ok(breakdown)
}

fn append_event(
    conn: &Connection,
    agent_id: &str,
    event: ReputationEventType,
    score_change: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO reputation_events (agent_id, event_type, score_change, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![agent_id, event.as_str(), score_change, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn query_agent(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Option<AgentRecord>> {
    let record = conn
        .query_row(sql, args, |row| {
            Ok(AgentRecord {
                id: row.get("id")?,
                developer_id: row.get("developer_id")?,
                external_id: row.get("external_id")?,
                identity_verified: row.get("identity_verified")?,
                stake_amount: row.get("stake_amount")?,
                total_actions: row.get::<_, i64>("total_actions")? as u64,
                successful_actions: row.get::<_, i64>("successful_actions")? as u64,
                failed_actions: row.get::<_, i64>("failed_actions")? as u64,
                status: row
                    .get::<_, String>("status")?
                    .parse()
                    .unwrap_or(AgentStatus::Suspended),
                reputation_score: row.get("reputation_score")?,
                created_at: parse_ts(row.get::<_, String>("created_at")?),
            })
        })
        .optional()?;
    Ok(record)
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("{API_KEY_PREFIX}{}", hex::encode(bytes))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS developers (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    api_key_hash  TEXT NOT NULL UNIQUE,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
    id                  TEXT PRIMARY KEY,
    developer_id        TEXT NOT NULL REFERENCES developers(id),
    external_id         TEXT NOT NULL,
    identity_verified   INTEGER NOT NULL DEFAULT 0,
    stake_amount        REAL NOT NULL DEFAULT 0,
    total_actions       INTEGER NOT NULL DEFAULT 0,
    successful_actions  INTEGER NOT NULL DEFAULT 0,
    failed_actions      INTEGER NOT NULL DEFAULT 0,
    status              TEXT NOT NULL DEFAULT 'active',
    reputation_score    INTEGER NOT NULL DEFAULT 50,
    created_at          TEXT NOT NULL,
    UNIQUE (developer_id, external_id)
);

CREATE TABLE IF NOT EXISTS vouches (
    voucher_id  TEXT NOT NULL REFERENCES agents(id),
    vouched_id  TEXT NOT NULL REFERENCES agents(id),
    weight      INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    UNIQUE (voucher_id, vouched_id)
);

CREATE TABLE IF NOT EXISTS certificates (
    jti         TEXT PRIMARY KEY,
    agent_id    TEXT NOT NULL REFERENCES agents(id),
    score       INTEGER NOT NULL,
    issued_at   TEXT NOT NULL,
    expires_at  TEXT NOT NULL,
    revoked     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS action_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id    TEXT NOT NULL,
    action_type TEXT NOT NULL,
    decision    TEXT NOT NULL,
    reason      TEXT NOT NULL,
    metadata    TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reputation_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id     TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    score_change INTEGER NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS gateway_reports (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id        TEXT NOT NULL,
    gateway_id      TEXT NOT NULL,
    certificate_jti TEXT NOT NULL,
    action_count    INTEGER NOT NULL,
    created_at      TEXT NOT NULL
);
";

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::in_memory().unwrap()
    }

    fn seed_agent(store: &Store) -> (DeveloperRecord, AgentRecord) {
        let (dev, _key) = store.register_developer("acme").unwrap();
        let agent = store.register_agent(&dev.id, "crawler-7", false, 0.0).unwrap();
        (dev, agent)
    }

    #[test]
    fn test_developer_api_key_round_trip() {
        let store = store();
        let (dev, key) = store.register_developer("acme").unwrap();
        assert!(key.starts_with(API_KEY_PREFIX));

        let found = store.developer_by_api_key(&key).unwrap();
        assert_eq!(found.id, dev.id);

        assert!(matches!(
            store.developer_by_api_key("atk_bogus"),
            Err(Error::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_agent_registration_and_duplicate_conflict() {
        let store = store();
        let (dev, agent) = seed_agent(&store);
        assert_eq!(agent.reputation_score, 50);
        assert_eq!(agent.status, AgentStatus::Active);

        assert!(matches!(
            store.register_agent(&dev.id, "crawler-7", false, 0.0),
            Err(Error::Conflict(_))
        ));

        let found = store.agent_by_external(&dev.id, "crawler-7").unwrap();
        assert_eq!(found.id, agent.id);
        assert!(matches!(
            store.agent_by_external(&dev.id, "nope"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_counters_and_score_cascade() {
        let store = store();
        let (_dev, agent) = seed_agent(&store);

        let score = store.apply_outcome(&agent.id, true).unwrap();
        // 50 base + 20 success-rate bonus at 1/1.
        assert_eq!(score, 70);

        let score = store.apply_outcome(&agent.id, false).unwrap();
        // 1/2 success: 50 + 10 - 5 = 55.
        assert_eq!(score, 55);

        let agent = store.agent_by_id(&agent.id).unwrap();
        assert_eq!(agent.total_actions, 2);
        assert_eq!(agent.successful_actions, 1);
        assert_eq!(agent.failed_actions, 1);
        assert!(agent.successful_actions + agent.failed_actions <= agent.total_actions);
    }

    #[test]
    fn test_vouch_rules() {
        let store = store();
        let (dev, low) = seed_agent(&store);
        let high = store
            .register_agent(&dev.id, "veteran", true, 1000.0)
            .unwrap();
        // 50 + 10 identity + 15 stake = 75, enough to vouch.
        assert_eq!(high.reputation_score, 75);

        // A 50-score agent cannot vouch.
        assert!(matches!(
            store.add_vouch(&low.id, &high.id, 3),
            Err(Error::Forbidden(_))
        ));

        let score = store.add_vouch(&high.id, &low.id, 3).unwrap();
        assert_eq!(score, 52);

        assert!(matches!(
            store.add_vouch(&high.id, &low.id, 2),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            store.add_vouch(&high.id, &low.id, 9),
            Err(Error::BadRequest(_))
        ));

        let score = store.remove_vouch(&high.id, &low.id).unwrap();
        assert_eq!(score, 50);
    }

    #[test]
    fn test_certificate_revocation_is_one_way() {
        let store = store();
        let (_dev, agent) = seed_agent(&store);
        let now = Utc::now();
        store
            .record_certificate("jti-1", &agent.id, 50, now, now + chrono::Duration::seconds(300))
            .unwrap();

        let record = store.certificate("jti-1").unwrap().unwrap();
        assert!(!record.revoked);

        store.revoke_certificate("jti-1").unwrap();
        let record = store.certificate("jti-1").unwrap().unwrap();
        assert!(record.revoked);

        // Revoking again is a no-op, never a revert.
        store.revoke_certificate("jti-1").unwrap();
        assert!(store.certificate("jti-1").unwrap().unwrap().revoked);

        assert!(store.certificate("jti-missing").unwrap().is_none());
    }

    #[test]
    fn test_action_log_entries_are_retrievable() {
        let store = store();
        let (_dev, agent) = seed_agent(&store);
        let id = store
            .log_action(&agent.id, "search", "allowed", "gateway gw-1", &serde_json::json!({}))
            .unwrap();
        let (agent_id, action_type) = store.action_log_entry(id).unwrap();
        assert_eq!(agent_id, agent.id);
        assert_eq!(action_type, "search");
    }

    #[test]
    fn test_stake_and_identity_mutations_recompute() {
        let store = store();
        let (_dev, agent) = seed_agent(&store);
        assert_eq!(store.add_stake(&agent.id, 250.0).unwrap(), 57);
        assert_eq!(store.set_identity_verified(&agent.id, true).unwrap(), 67);
    }
}
