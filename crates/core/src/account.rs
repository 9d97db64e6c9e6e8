use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub i64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A ledger account. `balance_cents` is a cached derivation; the invariant
/// `balance == initial_balance + Σ committed transaction amounts` is restored
/// by `recalculate_balance` and maintained incrementally on commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Option<AccountId>,
    pub name: String,
    pub account_number: String,
    /// Owner tag used for the pairing account-relation score: two accounts
    /// with the same owner are treated as an internal-transfer pair.
    pub owner: Option<String>,
    pub initial_balance_cents: i64,
    pub balance_cents: i64,
    pub open_at: NaiveDate,
    pub closed_at: Option<NaiveDate>,
}

impl Account {
    pub fn new(name: &str, account_number: &str, open_at: NaiveDate) -> Self {
        Account {
            id: None,
            name: name.to_string(),
            account_number: account_number.to_string(),
            owner: None,
            initial_balance_cents: 0,
            balance_cents: 0,
            open_at,
            closed_at: None,
        }
    }

    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}
