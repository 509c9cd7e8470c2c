//! Reputation scoring.
//!
//! A deterministic multi-factor function mapping an agent's durable history
//! to a 0-100 score. The station consumes it at certificate issuance and at
//! its verification endpoint; the cached `reputation_score` on the agent row
//! is always the output of this function for the row's current state.
//!
//! The calculation takes `now` as a parameter and touches no ambient state,
//! so re-evaluating the same inputs always yields the same output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Seconds in one scoring month (30 days).
const MONTH_SECS: i64 = 30 * 24 * 3600;

/// Everything the score depends on, read from one agent's persisted state.
#[derive(Debug, Clone, PartialEq)]
pub struct ReputationInputs {
    /// Whether the owning developer completed identity verification.
    pub identity_verified: bool,
    /// Staked amount. Non-negative.
    pub stake_amount: f64,
    /// Number of vouches received from other agents.
    pub vouches_received: u32,
    /// Total actions ever reported for this agent.
    pub total_actions: u64,
    /// Actions reported as successful.
    pub successful_actions: u64,
    /// Actions reported as failed.
    pub failed_actions: u64,
    /// When the agent was registered.
    pub created_at: DateTime<Utc>,
}

/// Per-factor breakdown of a computed score.
///
/// Served verbatim by the station's reputation endpoint, so the factor
/// names here are wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Starting value every agent gets.
    pub base: i64,
    /// Identity-verification bonus.
    pub identity: i64,
    /// Stake bonus, saturating at 15.
    pub stake: i64,
    /// Vouch bonus, saturating at 20.
    pub vouches: i64,
    /// Success-rate bonus, up to 20.
    #[serde(rename = "successRate")]
    pub success_rate: i64,
    /// Account-age bonus, one point per month up to 10.
    pub age: i64,
    /// Failure penalty (positive number, subtracted from the sum).
    #[serde(rename = "failurePenalty")]
    pub failure_penalty: i64,
    /// Final score, clamped to [0, 100].
    pub score: i64,
}

/// Compute the reputation score and its factor breakdown.
pub fn compute_score(inputs: &ReputationInputs, now: DateTime<Utc>) -> ScoreBreakdown {
    let base = 50;

    let identity = if inputs.identity_verified { 10 } else { 0 };

    let stake = if inputs.stake_amount == 0.0 {
        0
    } else {
        (5 + (inputs.stake_amount / 100.0).floor() as i64).min(15)
    };

    let vouches = (2 * i64::from(inputs.vouches_received)).min(20);

    let success_rate = if inputs.total_actions > 0 {
        let ratio = inputs.successful_actions as f64 / inputs.total_actions as f64;
        (20.0 * ratio).round() as i64
    } else {
        0
    };

    let age_secs = (now - inputs.created_at).num_seconds().max(0);
    let age = (age_secs / MONTH_SECS).min(10);

    let failure_penalty = 5 * inputs.failed_actions as i64;

    let sum = base + identity + stake + vouches + success_rate + age - failure_penalty;
    let score = sum.clamp(0, 100);

    ScoreBreakdown {
        base,
        identity,
        stake,
        vouches,
        success_rate,
        age,
        failure_penalty,
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fresh_agent() -> ReputationInputs {
        ReputationInputs {
            identity_verified: false,
            stake_amount: 0.0,
            vouches_received: 0,
            total_actions: 0,
            successful_actions: 0,
            failed_actions: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_fresh_agent_scores_base() {
        let inputs = fresh_agent();
        let breakdown = compute_score(&inputs, inputs.created_at);
        assert_eq!(breakdown.score, 50);
        assert_eq!(breakdown.success_rate, 0);
    }

    #[test]
    fn test_stake_boundaries() {
        let now = Utc::now();
        let mut inputs = fresh_agent();

        for (amount, expected) in [(0.0, 0), (1.0, 5), (100.0, 6), (999.0, 14), (1000.0, 15), (50_000.0, 15)]
        {
            inputs.stake_amount = amount;
            assert_eq!(
                compute_score(&inputs, now).stake,
                expected,
                "stake {amount}"
            );
        }
    }

    #[test]
    fn test_vouch_bonus_saturates() {
        let now = Utc::now();
        let mut inputs = fresh_agent();

        inputs.vouches_received = 10;
        assert_eq!(compute_score(&inputs, now).vouches, 20);
        inputs.vouches_received = 11;
        assert_eq!(compute_score(&inputs, now).vouches, 20);
    }

    #[test]
    fn test_success_rate_rounds() {
        let now = Utc::now();
        let mut inputs = fresh_agent();
        inputs.total_actions = 3;
        inputs.successful_actions = 1;
        // 20 * 1/3 = 6.67 -> 7
        assert_eq!(compute_score(&inputs, now).success_rate, 7);
    }

    #[test]
    fn test_age_bonus_caps_at_ten_months() {
        let mut inputs = fresh_agent();
        inputs.created_at = Utc::now() - Duration::days(30 * 14);
        assert_eq!(compute_score(&inputs, Utc::now()).age, 10);

        inputs.created_at = Utc::now() - Duration::days(65);
        assert_eq!(compute_score(&inputs, Utc::now()).age, 2);
    }

    #[test]
    fn test_single_failure_drops_fresh_agent_to_45() {
        let now = Utc::now();
        let mut inputs = fresh_agent();
        inputs.total_actions = 1;
        inputs.failed_actions = 1;
        assert_eq!(compute_score(&inputs, now).score, 45);
    }

    #[test]
    fn test_failure_penalty_clamps_at_zero() {
        let now = Utc::now();
        let mut inputs = fresh_agent();
        inputs.total_actions = 30;
        inputs.failed_actions = 30;
        // 50 + 0 - 150 would be far below zero.
        let breakdown = compute_score(&inputs, now);
        assert_eq!(breakdown.failure_penalty, 150);
        assert_eq!(breakdown.score, 0);
    }

    #[test]
    fn test_score_clamps_at_one_hundred() {
        let mut inputs = fresh_agent();
        inputs.identity_verified = true;
        inputs.stake_amount = 5000.0;
        inputs.vouches_received = 20;
        inputs.total_actions = 100;
        inputs.successful_actions = 100;
        inputs.created_at = Utc::now() - Duration::days(400);
        // 50 + 10 + 15 + 20 + 20 + 10 = 125
        assert_eq!(compute_score(&inputs, Utc::now()).score, 100);
    }

    #[test]
    fn test_deterministic_for_fixed_now() {
        let now = Utc::now();
        let mut inputs = fresh_agent();
        inputs.total_actions = 7;
        inputs.successful_actions = 5;
        inputs.failed_actions = 2;
        let a = compute_score(&inputs, now);
        let b = compute_score(&inputs, now);
        assert_eq!(a, b);
    }
}
