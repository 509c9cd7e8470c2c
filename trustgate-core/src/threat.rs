//! Optional ML threat adapter.
//!
//! The gateway treats the analyzer as an opaque, pluggable interface with
//! fail-open semantics: if no analyzer is configured, or the configured one
//! errors, the request pipeline proceeds as though the params were safe.
//! The contract is the interface, not a model.
//!
//! [`PatternAnalyzer`] is the reference implementation: a recursive walk
//! over every string leaf of the params (nested objects and array elements
//! included), scored against prompt-injection and malicious-URL pattern
//! sets.

use crate::error::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Instant;

/// Maximum length of a reported leaf value. Longer leaves are truncated so
/// threat descriptors never echo whole payloads back to the caller.
const MAX_REPORTED_VALUE_LEN: usize = 120;

/// Threat categories the contract recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    PromptInjection,
    MaliciousUrl,
}

/// One suspicious leaf found during analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threat {
    /// Threat category.
    #[serde(rename = "type")]
    pub threat_type: ThreatType,
    /// Dotted path of the offending field, e.g. `query` or `docs[2].body`.
    pub field: String,
    /// Analyzer confidence in [0, 1].
    pub confidence: f64,
    /// The offending value, truncated.
    pub value: String,
}

/// Result of one analysis pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatReport {
    /// Whether the params passed every configured threshold.
    pub safe: bool,
    /// Leaves above threshold, if any.
    pub threats: Vec<Threat>,
    /// Wall-clock analysis time.
    #[serde(rename = "analysisTimeMs")]
    pub analysis_time_ms: u64,
}

/// Pluggable threat analyzer.
pub trait ThreatAnalyzer: Send + Sync + std::fmt::Debug {
    /// Analyze action params for an agent. Errors are treated as "safe" by
    /// the gateway (fail-open).
    fn analyze(&self, params: &Map<String, Value>, agent_id: &str) -> Result<ThreatReport>;
}

/// Regex-based analyzer covering the two contract threat types.
#[derive(Debug)]
pub struct PatternAnalyzer {
    injection: Vec<(Regex, f64)>,
    url: Vec<(Regex, f64)>,
    confidence_threshold: f64,
}

impl PatternAnalyzer {
    /// Build the analyzer with the default pattern sets and a reporting
    /// threshold of 0.7.
    pub fn new() -> Self {
        Self::with_threshold(0.7)
    }

    /// Build the analyzer with a custom reporting threshold.
    pub fn with_threshold(confidence_threshold: f64) -> Self {
        let injection = [
            (r"(?i)ignore\s+(all\s+|any\s+)?(previous|prior)\s+(instructions|prompts)", 0.95),
            (r"(?i)disregard\s+(the\s+)?(system|previous)\s+(prompt|instructions)", 0.9),
            (r"(?i)reveal\s+(your\s+)?(system\s+prompt|instructions)", 0.85),
            (r"(?i)you\s+are\s+now\s+(in\s+)?(developer|dan)\s+mode", 0.85),
            (r"(?i)pretend\s+(you\s+are|to\s+be)\s+an?\s+unrestricted", 0.8),
        ];
        let url = [
            (r"(?i)\b(javascript|data|vbscript):", 0.9),
            (r"(?i)https?://\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}", 0.75),
            (r"(?i)https?://[^\s/]+\.(zip|mov|tk|gq)(/|\b)", 0.7),
            (r"(?i)https?://(bit\.ly|tinyurl\.com|t\.co)/", 0.7),
        ];
        Self {
            injection: compile(&injection),
            url: compile(&url),
            confidence_threshold,
        }
    }

    fn score_leaf(&self, field: &str, leaf: &str, out: &mut Vec<Threat>) {
        let mut push = |threat_type: ThreatType, confidence: f64| {
            if confidence >= self.confidence_threshold {
                out.push(Threat {
                    threat_type,
                    field: field.to_string(),
                    confidence,
                    value: truncate(leaf),
                });
            }
        };

        if let Some(confidence) = best_match(&self.injection, leaf) {
            push(ThreatType::PromptInjection, confidence);
        }
        if let Some(confidence) = best_match(&self.url, leaf) {
            push(ThreatType::MaliciousUrl, confidence);
        }
    }
}

impl Default for PatternAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreatAnalyzer for PatternAnalyzer {
    fn analyze(&self, params: &Map<String, Value>, _agent_id: &str) -> Result<ThreatReport> {
        let start = Instant::now();
        let mut threats = Vec::new();
        for (key, value) in params {
            visit_leaves(key, value, &mut |field, leaf| {
                self.score_leaf(field, leaf, &mut threats)
            });
        }
        Ok(ThreatReport {
            safe: threats.is_empty(),
            threats,
            analysis_time_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn compile(patterns: &[(&str, f64)]) -> Vec<(Regex, f64)> {
    patterns
        .iter()
        .filter_map(|(pattern, confidence)| {
            Regex::new(pattern).ok().map(|re| (re, *confidence))
        })
        .collect()
}

fn best_match(patterns: &[(Regex, f64)], leaf: &str) -> Option<f64> {
    patterns
        .iter()
        .filter(|(re, _)| re.is_match(leaf))
        .map(|(_, confidence)| *confidence)
        .fold(None, |best, c| Some(best.map_or(c, |b: f64| b.max(c))))
}

fn truncate(leaf: &str) -> String {
    if leaf.len() <= MAX_REPORTED_VALUE_LEN {
        leaf.to_string()
    } else {
        let mut end = MAX_REPORTED_VALUE_LEN;
        while !leaf.is_char_boundary(end) {
            end -= 1;
        }
        leaf[..end].to_string()
    }
}

/// Visit every string leaf under `value`, building dotted/indexed paths.
fn visit_leaves(path: &str, value: &Value, visit: &mut impl FnMut(&str, &str)) {
    match value {
        Value::String(s) => visit(path, s),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                visit_leaves(&format!("{path}[{i}]"), item, visit);
            }
        }
        Value::Object(map) => {
            for (key, nested) in map {
                visit_leaves(&format!("{path}.{key}"), nested, visit);
            }
        }
        _ => {}
    }
}
