use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::ParseError;

/// `rule_tags` marker for the auto-accept fast path.
pub const AUTO_ACCEPT_TAG: &str = "AUTO_ACCEPT";

/// Terminal decision on a candidate. Absence of a decision means PENDING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Accepted,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accepted => "ACCEPTED",
            Decision::Rejected => "REJECTED",
        }
    }
}

impl FromStr for Decision {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPTED" => Ok(Decision::Accepted),
            "REJECTED" => Ok(Decision::Rejected),
            other => Err(ParseError::new("decision", other)),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured sub-scores explaining one pairing candidate. Persisted as a
/// JSON column so the review UI can surface "why this pair".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingReasons {
    pub amount_score: f64,
    pub date_score: f64,
    pub desc_score: f64,
    pub account_relation: f64,
    pub keyword_bonus: f64,
    pub rule_bonus: f64,
    pub amt_diff_cents: i64,
    pub days: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
}

/// A proposed debit/credit transfer pair awaiting a user decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingCandidate {
    pub id: Option<i64>,
    /// Debit (money out) staging row.
    pub left_id: i64,
    /// Credit (money in) staging row.
    pub right_id: i64,
    pub score: f64,
    pub reasons: PairingReasons,
    pub preselected: bool,
    pub decision: Option<Decision>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// A past committed transaction similar to the row under categorization,
/// surfaced as weak evidence by the similarity collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarTransaction {
    pub id: i64,
    pub description: String,
    pub amount_cents: i64,
    pub date: chrono::NaiveDate,
    pub subcategory_id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorizationReasons {
    /// Which pipeline stage produced the candidate: "AUTO_ACCEPT", "RULES"
    /// or "SIMILARITY".
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_names: Vec<String>,
    /// Number of rules merged into this candidate (same target subcategory).
    #[serde(default)]
    pub merged_from: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub similar_transactions_list: Vec<SimilarTransaction>,
    /// Auto-accept fast path only: the merchant keyword that matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant: Option<String>,
    #[serde(default)]
    pub tie_breaker_winner: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tie_breaker_reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_direction: Option<String>,
}

/// A proposed subcategory for one staging row, ranked by confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorizationCandidate {
    pub id: Option<i64>,
    pub staging_tx_id: i64,
    pub subcategory_id: i64,
    pub score: f64,
    pub confidence: f64,
    pub reasons: CategorizationReasons,
    /// Comma-joined rule names, or `AUTO_ACCEPT_TAG` for the fast path.
    pub rule_tags: String,
    pub preselected: bool,
    pub decision: Option<Decision>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_round_trip_as_json() {
        let reasons = PairingReasons {
            amount_score: 1.0,
            date_score: 0.75,
            desc_score: 0.5,
            account_relation: 1.0,
            keyword_bonus: 0.1,
            rule_bonus: 0.0,
            amt_diff_cents: 0,
            days: 1,
            rule_id: None,
            rule_name: None,
        };
        let json = serde_json::to_string(&reasons).unwrap();
        let back: PairingReasons = serde_json::from_str(&json).unwrap();
        assert_eq!(back.days, 1);
        assert_eq!(back.amount_score, 1.0);
        // Unset optional rule fields stay out of the payload entirely.
        assert!(!json.contains("ruleId"));
    }

    #[test]
    fn categorization_reasons_defaults_tolerate_sparse_json() {
        let back: CategorizationReasons = serde_json::from_str(r#"{"source":"RULES"}"#).unwrap();
        assert_eq!(back.source, "RULES");
        assert!(back.rule_names.is_empty());
        assert_eq!(back.merged_from, 0);
        assert!(!back.tie_breaker_winner);
    }

    #[test]
    fn decision_parse() {
        assert_eq!("ACCEPTED".parse::<Decision>().unwrap(), Decision::Accepted);
        // PENDING is the absence of a decision, never a stored token.
        let err = "PENDING".parse::<Decision>().unwrap_err();
        assert_eq!(err.to_string(), "unknown decision: 'PENDING'");
    }
}
