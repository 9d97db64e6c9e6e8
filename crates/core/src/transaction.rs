use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::account::AccountId;
use super::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Income,
    Expense,
    Transfer,
}

impl TransactionType {
    /// Classifies a committed staging amount. Transfer legs are decided by the
    /// presence of a transfer group, not by sign.
    pub fn classify(amount_cents: i64, is_transfer: bool) -> Self {
        if is_transfer {
            TransactionType::Transfer
        } else if amount_cents >= 0 {
            TransactionType::Income
        } else {
            TransactionType::Expense
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Income => "INCOME",
            TransactionType::Expense => "EXPENSE",
            TransactionType::Transfer => "TRANSFER",
        }
    }
}

impl FromStr for TransactionType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INCOME" => Ok(TransactionType::Income),
            "EXPENSE" => Ok(TransactionType::Expense),
            "TRANSFER" => Ok(TransactionType::Transfer),
            other => Err(ParseError::new("transaction type", other)),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed ledger row. Transfers are two linked rows with opposite signs
/// sharing one `transfer_group_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Option<i64>,
    pub account_id: AccountId,
    pub amount_cents: i64,
    pub tx_type: TransactionType,
    pub subcategory_id: Option<i64>,
    pub date: NaiveDate,
    pub description: String,
    pub linked_transaction_id: Option<i64>,
    pub transfer_group_id: Option<String>,
    pub is_reconciled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_sign() {
        assert_eq!(
            TransactionType::classify(500, false),
            TransactionType::Income
        );
        assert_eq!(
            TransactionType::classify(-500, false),
            TransactionType::Expense
        );
    }

    #[test]
    fn transfer_group_overrides_sign() {
        assert_eq!(
            TransactionType::classify(-500, true),
            TransactionType::Transfer
        );
        assert_eq!(
            TransactionType::classify(500, true),
            TransactionType::Transfer
        );
    }
}
