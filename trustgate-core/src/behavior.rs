//! Live behavioral analysis.
//!
//! Each gateway keeps an in-memory session per active agent and runs a set
//! of detectors over the session's action history after every request. Each
//! detector that fires degrades the session's behavior score; crossing the
//! block threshold denies the agent for the remainder of the session.
//!
//! Sessions are gateway-local and never shared: a blocked agent is only
//! blocked on the gateway that observed the abuse. The station learns about
//! it through the report stream.
//!
//! ## State machine
//!
//! ```text
//!  absent ──record_action──▶ active ──score ≤ threshold──▶ blocked
//!    ▲                         │                              │
//!    └───────idle timeout──────┴──────────idle timeout────────┘
//! ```
//!
//! `blocked` is absorbing: the only way out is session expiry. Blocked
//! sessions do not refresh their activity clock, so they always age out.

use crate::audit::{BehaviorListener, NoOpListener};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Length of the trailing window the rate detectors look at.
const DETECTOR_WINDOW_MS: i64 = 60_000;

/// Burst detector: minimum recorded actions before it can fire.
const BURST_MIN_ACTIONS: usize = 6;
/// Burst detector: quiet gap preceding the burst, milliseconds.
const BURST_GAP_MS: i64 = 30_000;
/// Burst detector: maximum span of the last five actions, milliseconds.
const BURST_SPAN_MS: i64 = 5_000;

/// Tunables for the behavior tracker. All defaults match the deployment
/// guide; every knob is per-gateway.
#[derive(Debug, Clone)]
pub struct BehaviorConfig {
    /// Idle time after which a session expires.
    pub session_timeout: std::time::Duration,
    /// Rapid-fire threshold: actions per trailing minute.
    pub max_actions_per_minute: usize,
    /// Failure count over the whole session before flagging.
    pub max_failures_before_flag: usize,
    /// Enumeration threshold: distinct action names per trailing minute.
    pub max_unique_actions_per_minute: usize,
    /// Repetition threshold: identical calls per trailing minute.
    pub max_repeated_actions_per_minute: usize,
    /// Score decrement per newly raised flag.
    pub violation_penalty: i64,
    /// Score at or below which the session blocks.
    pub block_threshold: i64,
    /// Cadence of the idle-session sweeper.
    pub sweep_interval: std::time::Duration,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            session_timeout: std::time::Duration::from_millis(300_000),
            max_actions_per_minute: 30,
            max_failures_before_flag: 5,
            max_unique_actions_per_minute: 10,
            max_repeated_actions_per_minute: 10,
            violation_penalty: 10,
            block_threshold: 20,
            sweep_interval: std::time::Duration::from_secs(60),
        }
    }
}

/// Abuse patterns the tracker recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorFlag {
    /// Too many actions in the trailing minute.
    RapidFire,
    /// Too many failures across the session.
    HighFailureRate,
    /// Too many distinct action names in the trailing minute.
    ActionEnumeration,
    /// One identical call repeated too often in the trailing minute.
    RepeatedAction,
    /// The caller reported the action outside the agent's authority.
    ScopeViolation,
    /// A burst of activity after a long quiet gap.
    BurstDetected,
}

impl BehaviorFlag {
    /// Wire name of the flag.
    pub fn as_str(&self) -> &'static str {
        match self {
            BehaviorFlag::RapidFire => "rapid_fire",
            BehaviorFlag::HighFailureRate => "high_failure_rate",
            BehaviorFlag::ActionEnumeration => "action_enumeration",
            BehaviorFlag::RepeatedAction => "repeated_action",
            BehaviorFlag::ScopeViolation => "scope_violation",
            BehaviorFlag::BurstDetected => "burst_detected",
        }
    }
}

impl std::fmt::Display for BehaviorFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded action inside a session.
#[derive(Debug, Clone)]
struct SessionAction {
    action: String,
    fingerprint: String,
    success: bool,
    at: DateTime<Utc>,
}

/// Per-agent live session state.
#[derive(Debug)]
struct Session {
    agent_id: String,
    external_id: String,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    behavior_score: i64,
    actions: Vec<SessionAction>,
    flags: BTreeSet<BehaviorFlag>,
    blocked: bool,
}

impl Session {
    fn new(agent_id: &str, external_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            external_id: external_id.to_string(),
            started_at: now,
            last_activity_at: now,
            behavior_score: 100,
            actions: Vec::new(),
            flags: BTreeSet::new(),
            blocked: false,
        }
    }

    fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_activity_at > timeout
    }
}

/// What `record_action` tells the gateway pipeline.
#[derive(Debug, Clone)]
pub struct BehaviorOutcome {
    /// Session behavior score after this action.
    pub behavior_score: i64,
    /// Detectors that fired on this action, new or recurring.
    pub triggered: Vec<BehaviorFlag>,
    /// Subset of `triggered` seen for the first time this session.
    pub new_flags: Vec<BehaviorFlag>,
    /// Whether the session is blocked after this action.
    pub blocked: bool,
}

/// A penalty applied by the tracker, delivered to the configured listener.
#[derive(Debug, Clone, Serialize)]
pub struct BehaviorEvent {
    /// Internal agent UUID.
    #[serde(rename = "agentId")]
    pub agent_id: String,
    /// Developer-scoped external id.
    #[serde(rename = "externalId")]
    pub external_id: String,
    /// The flag that fired.
    pub flag: BehaviorFlag,
    /// Points deducted.
    pub penalty: i64,
    /// Score after the deduction.
    #[serde(rename = "behaviorScore")]
    pub behavior_score: i64,
    /// Whether the session is blocked at this point.
    pub blocked: bool,
    /// When the triggering action was recorded.
    pub at: DateTime<Utc>,
}

/// Public snapshot of one session, served by `/behavior/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "externalId")]
    pub external_id: String,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "lastActivityAt")]
    pub last_activity_at: DateTime<Utc>,
    #[serde(rename = "behaviorScore")]
    pub behavior_score: i64,
    #[serde(rename = "actionCount")]
    pub action_count: usize,
    pub flags: Vec<BehaviorFlag>,
    pub blocked: bool,
}

/// Stable short fingerprint of an `(action, params)` pair.
///
/// Canonical serialization sorts object keys recursively, so identical
/// content produces identical fingerprints regardless of key order. The
/// digest is truncated to 48 bits - enough to separate repetition from
/// coincidence inside one session window.
pub fn params_fingerprint(action: &str, params: &Map<String, Value>) -> String {
    let mut canonical = String::new();
    write_canonical(&Value::Object(params.clone()), &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(action.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..6])
}

// Deterministic JSON writer: object keys sorted at every level. Kept
// independent of serde_json's map ordering so the fingerprint survives a
// `preserve_order` feature unification.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string()))
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_else(|_| "\"\"".to_string()));
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// Per-gateway singleton tracking live agent sessions.
///
/// Lock order: the session map read/write lock is never held while waiting
/// on a session mutex inside `record_action`, and the sweeper acquires
/// session mutexes only under the map write lock. The two paths cannot
/// deadlock.
#[derive(Debug)]
pub struct BehaviorTracker {
    config: BehaviorConfig,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    listener: Arc<dyn BehaviorListener>,
}

impl BehaviorTracker {
    /// Create a tracker that discards behavior events.
    pub fn new(config: BehaviorConfig) -> Self {
        Self::with_listener(config, Arc::new(NoOpListener))
    }

    /// Create a tracker delivering events to a listener.
    pub fn with_listener(config: BehaviorConfig, listener: Arc<dyn BehaviorListener>) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            listener,
        }
    }

    /// The tracker's configuration.
    pub fn config(&self) -> &BehaviorConfig {
        &self.config
    }

    /// Record one action for an agent at the current time.
    pub fn record_action(
        &self,
        agent_id: &str,
        external_id: &str,
        action: &str,
        params: &Map<String, Value>,
        success: bool,
        score_met: bool,
    ) -> BehaviorOutcome {
        self.record_action_at(agent_id, external_id, action, params, success, score_met, Utc::now())
    }

    /// Record one action with an explicit timestamp.
    ///
    /// Timestamps must be non-decreasing per agent; the gateway observes
    /// wall-clock order within a session.
    #[allow(clippy::too_many_arguments)]
    pub fn record_action_at(
        &self,
        agent_id: &str,
        external_id: &str,
        action: &str,
        params: &Map<String, Value>,
        success: bool,
        score_met: bool,
        now: DateTime<Utc>,
    ) -> BehaviorOutcome {
        let session = self.session_handle(agent_id, external_id, now);
        let mut session = session.lock().unwrap_or_else(|e| e.into_inner());

        let timeout = Duration::from_std(self.config.session_timeout).unwrap_or(Duration::zero());
        if session.is_stale(now, timeout) {
            // Stale active session: treat as absent and recreate in place.
            *session = Session::new(agent_id, external_id, now);
        }

        if session.blocked {
            return BehaviorOutcome {
                behavior_score: session.behavior_score,
                triggered: Vec::new(),
                new_flags: Vec::new(),
                blocked: true,
            };
        }

        session.last_activity_at = now;
        session.actions.push(SessionAction {
            action: action.to_string(),
            fingerprint: params_fingerprint(action, params),
            success,
            at: now,
        });

        let triggered = self.run_detectors(&session, score_met, now);

        let mut new_flags = Vec::new();
        let mut events = Vec::new();
        for flag in &triggered {
            let first_time = session.flags.insert(*flag);
            if first_time {
                new_flags.push(*flag);
            }
            // Full penalty on first appearance; repeats cost half, except
            // scope violations which always cost full.
            let penalty = if first_time || *flag == BehaviorFlag::ScopeViolation {
                self.config.violation_penalty
            } else {
                self.config.violation_penalty / 2
            };
            session.behavior_score = (session.behavior_score - penalty).max(0);
            events.push(BehaviorEvent {
                agent_id: session.agent_id.clone(),
                external_id: session.external_id.clone(),
                flag: *flag,
                penalty,
                behavior_score: session.behavior_score,
                blocked: session.behavior_score <= self.config.block_threshold,
                at: now,
            });
        }

        if session.behavior_score <= self.config.block_threshold {
            session.blocked = true;
        }

        let outcome = BehaviorOutcome {
            behavior_score: session.behavior_score,
            triggered,
            new_flags,
            blocked: session.blocked,
        };
        drop(session);

        // Deliver events outside the session lock.
        for event in &events {
            self.listener.on_event(event);
        }

        outcome
    }

    /// Whether the agent's live session is currently blocked.
    pub fn is_blocked(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        let handle = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions.get(agent_id).cloned()
        };
        let Some(handle) = handle else {
            return false;
        };
        let session = handle.lock().unwrap_or_else(|e| e.into_inner());
        let timeout = Duration::from_std(self.config.session_timeout).unwrap_or(Duration::zero());
        !session.is_stale(now, timeout) && session.blocked
    }

    /// Snapshot of all live sessions.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<SessionSnapshot> = sessions
            .values()
            .map(|handle| {
                let s = handle.lock().unwrap_or_else(|e| e.into_inner());
                SessionSnapshot {
                    agent_id: s.agent_id.clone(),
                    external_id: s.external_id.clone(),
                    started_at: s.started_at,
                    last_activity_at: s.last_activity_at,
                    behavior_score: s.behavior_score,
                    action_count: s.actions.len(),
                    flags: s.flags.iter().copied().collect(),
                    blocked: s.blocked,
                }
            })
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// Evict idle sessions. Returns the number evicted.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let timeout = Duration::from_std(self.config.session_timeout).unwrap_or(Duration::zero());
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, handle| {
            let session = handle.lock().unwrap_or_else(|e| e.into_inner());
            !session.is_stale(now, timeout)
        });
        before - sessions.len()
    }

    /// Spawn the periodic idle-session sweeper.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = self.sweep(Utc::now());
                if evicted > 0 {
                    debug!(evicted, "evicted idle behavior sessions");
                }
            }
        })
    }

    fn session_handle(
        &self,
        agent_id: &str,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> Arc<Mutex<Session>> {
        {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = sessions.get(agent_id) {
                return handle.clone();
            }
        }
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(agent_id, external_id, now))))
            .clone()
    }

    fn run_detectors(
        &self,
        session: &Session,
        score_met: bool,
        now: DateTime<Utc>,
    ) -> Vec<BehaviorFlag> {
        let mut fired = Vec::new();
        let window_start = now - Duration::milliseconds(DETECTOR_WINDOW_MS);
        let window: Vec<&SessionAction> = session
            .actions
            .iter()
            .filter(|a| a.at > window_start)
            .collect();

        if window.len() > self.config.max_actions_per_minute {
            fired.push(BehaviorFlag::RapidFire);
        }

        let failures = session.actions.iter().filter(|a| !a.success).count();
        if failures >= self.config.max_failures_before_flag {
            fired.push(BehaviorFlag::HighFailureRate);
        }

        let unique: BTreeSet<&str> = window.iter().map(|a| a.action.as_str()).collect();
        if unique.len() > self.config.max_unique_actions_per_minute {
            fired.push(BehaviorFlag::ActionEnumeration);
        }

        let mut per_fingerprint: HashMap<&str, usize> = HashMap::new();
        for action in &window {
            *per_fingerprint.entry(action.fingerprint.as_str()).or_insert(0) += 1;
        }
        if per_fingerprint
            .values()
            .any(|&count| count > self.config.max_repeated_actions_per_minute)
        {
            fired.push(BehaviorFlag::RepeatedAction);
        }

        if !score_met {
            fired.push(BehaviorFlag::ScopeViolation);
        }

        let n = session.actions.len();
        if n >= BURST_MIN_ACTIONS {
            let gap = session.actions[n - 5].at - session.actions[n - 6].at;
            let span = session.actions[n - 1].at - session.actions[n - 5].at;
            if gap > Duration::milliseconds(BURST_GAP_MS)
                && span < Duration::milliseconds(BURST_SPAN_MS)
            {
                fired.push(BehaviorFlag::BurstDetected);
            }
        }

        fired
    }
}
