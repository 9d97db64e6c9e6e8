use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::ParseError;

/// Review lifecycle of an imported bank line. `Imported` is terminal: the row
/// has been promoted to a ledger transaction and may no longer be mutated or
/// referenced by new candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StagingStatus {
    Pending,
    Reviewed,
    Approved,
    Rejected,
    Imported,
}

impl StagingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingStatus::Pending => "PENDING",
            StagingStatus::Reviewed => "REVIEWED",
            StagingStatus::Approved => "APPROVED",
            StagingStatus::Rejected => "REJECTED",
            StagingStatus::Imported => "IMPORTED",
        }
    }
}

impl FromStr for StagingStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StagingStatus::Pending),
            "REVIEWED" => Ok(StagingStatus::Reviewed),
            "APPROVED" => Ok(StagingStatus::Approved),
            "REJECTED" => Ok(StagingStatus::Rejected),
            "IMPORTED" => Ok(StagingStatus::Imported),
            other => Err(ParseError::new("staging status", other)),
        }
    }
}

impl fmt::Display for StagingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An imported, not-yet-committed bank statement line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingRow {
    pub id: i64,
    pub external_id: Option<String>,
    pub description: String,
    /// Signed minor units. Negative = debit (money out), positive = credit.
    pub amount_cents: i64,
    pub transaction_date: NaiveDate,
    pub posted_date: Option<NaiveDate>,
    pub account_number: String,
    pub status: StagingStatus,
    pub linked_staging_id: Option<i64>,
    pub transfer_group_id: Option<String>,
    pub categorized: bool,
    pub mapped_subcategory_id: Option<i64>,
    pub mapped_account_id: Option<i64>,
    pub imported_transaction_id: Option<i64>,
    pub imported_at: Option<DateTime<Utc>>,
}

impl StagingRow {
    pub fn is_debit(&self) -> bool {
        self.amount_cents < 0
    }

    pub fn is_credit(&self) -> bool {
        self.amount_cents > 0
    }

    /// Eligible for pairing: not yet linked into a transfer and not terminal.
    pub fn is_unpaired(&self) -> bool {
        self.linked_staging_id.is_none() && self.status != StagingStatus::Imported
    }

    /// Eligible for commit: categorized, not yet promoted to the ledger.
    pub fn is_committable(&self) -> bool {
        self.categorized
            && self.imported_transaction_id.is_none()
            && self.status != StagingStatus::Imported
    }
}
