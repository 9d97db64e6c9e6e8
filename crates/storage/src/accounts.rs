use centime_core::{Account, AccountId, Money};
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::FromRow;
use std::collections::HashMap;
use tracing::info;

use crate::db::DbPool;
use crate::error::StorageError;

#[derive(Debug, FromRow)]
struct AccountRecord {
    id: i64,
    name: String,
    account_number: String,
    owner: Option<String>,
    initial_balance_cents: i64,
    balance_cents: i64,
    open_at: String,
    closed_at: Option<String>,
}

impl TryFrom<AccountRecord> for Account {
    type Error = StorageError;

    fn try_from(r: AccountRecord) -> Result<Self, StorageError> {
        Ok(Account {
            id: Some(AccountId(r.id)),
            name: r.name,
            account_number: r.account_number,
            owner: r.owner,
            initial_balance_cents: r.initial_balance_cents,
            balance_cents: r.balance_cents,
            open_at: parse_date(&r.open_at)?,
            closed_at: r.closed_at.as_deref().map(parse_date).transpose()?,
        })
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, StorageError> {
    s.parse()
        .map_err(|_| StorageError::Corrupt(format!("bad date {s:?}")))
}

const SELECT_COLS: &str = "id, name, account_number, owner, initial_balance_cents, \
     balance_cents, open_at, closed_at";

pub async fn create_account(pool: &DbPool, account: &Account) -> Result<AccountId, StorageError> {
    let result = sqlx::query(
        "INSERT INTO accounts \
         (name, account_number, owner, initial_balance_cents, balance_cents, open_at, closed_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&account.name)
    .bind(&account.account_number)
    .bind(&account.owner)
    .bind(account.initial_balance_cents)
    .bind(account.initial_balance_cents)
    .bind(account.open_at.to_string())
    .bind(account.closed_at.map(|d| d.to_string()))
    .execute(pool)
    .await?;
    Ok(AccountId(result.last_insert_rowid()))
}

pub async fn fetch_account(pool: &DbPool, id: AccountId) -> Result<Account, StorageError> {
    let record = sqlx::query_as::<_, AccountRecord>(&format!(
        "SELECT {SELECT_COLS} FROM accounts WHERE id = ?"
    ))
    .bind(id.0)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StorageError::not_found("account", id.0))?;
    record.try_into()
}

pub async fn fetch_by_number(pool: &DbPool, number: &str) -> Result<Option<Account>, StorageError> {
    let record = sqlx::query_as::<_, AccountRecord>(&format!(
        "SELECT {SELECT_COLS} FROM accounts WHERE account_number = ?"
    ))
    .bind(number)
    .fetch_optional(pool)
    .await?;
    record.map(TryInto::try_into).transpose()
}

pub async fn list_accounts(pool: &DbPool) -> Result<Vec<Account>, StorageError> {
    let records = sqlx::query_as::<_, AccountRecord>(&format!(
        "SELECT {SELECT_COLS} FROM accounts ORDER BY name"
    ))
    .fetch_all(pool)
    .await?;
    records.into_iter().map(TryInto::try_into).collect()
}

/// account_number -> owner map consumed by the pairing account-relation score.
pub async fn owner_map(pool: &DbPool) -> Result<HashMap<String, String>, StorageError> {
    let rows = sqlx::query_as::<_, (String, Option<String>)>(
        "SELECT account_number, owner FROM accounts",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .filter_map(|(number, owner)| owner.map(|o| (number, o)))
        .collect())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecalculateReport {
    pub account_id: i64,
    pub previous_balance_cents: i64,
    pub balance_cents: i64,
    /// Decimal rendition of `balance_cents` for reports.
    pub balance: Money,
    pub transaction_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceAtDate {
    pub account_id: i64,
    pub date: NaiveDate,
    pub balance_cents: i64,
    pub balance: Money,
    pub transaction_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub account_id: i64,
    pub target_date: NaiveDate,
    pub target_balance_cents: i64,
    pub previous_initial_cents: i64,
    pub new_initial_cents: i64,
    pub new_balance_cents: i64,
    pub new_balance: Money,
}

/// Rebuilds the cached balance from first principles:
/// initial + sum of all committed transactions.
pub async fn recalculate_balance(
    pool: &DbPool,
    id: AccountId,
) -> Result<RecalculateReport, StorageError> {
    let account = fetch_account(pool, id).await?;
    let (sum, count) = sqlx::query_as::<_, (i64, i64)>(
        "SELECT COALESCE(SUM(amount_cents), 0), COUNT(*) FROM transactions WHERE account_id = ?",
    )
    .bind(id.0)
    .fetch_one(pool)
    .await?;
    let balance = account.initial_balance_cents + sum;
    sqlx::query("UPDATE accounts SET balance_cents = ? WHERE id = ?")
        .bind(balance)
        .bind(id.0)
        .execute(pool)
        .await?;
    Ok(RecalculateReport {
        account_id: id.0,
        previous_balance_cents: account.balance_cents,
        balance_cents: balance,
        balance: Money::from_cents(balance),
        transaction_count: count,
    })
}

pub async fn recalculate_all(pool: &DbPool) -> Result<Vec<RecalculateReport>, StorageError> {
    let mut reports = Vec::new();
    for account in list_accounts(pool).await? {
        if let Some(id) = account.id {
            reports.push(recalculate_balance(pool, id).await?);
        }
    }
    Ok(reports)
}

/// Balance as of end-of-day `date`: initial plus every transaction dated on
/// or before it.
pub async fn balance_at_date(
    pool: &DbPool,
    id: AccountId,
    date: NaiveDate,
) -> Result<BalanceAtDate, StorageError> {
    let account = fetch_account(pool, id).await?;
    let (sum, count) = sqlx::query_as::<_, (i64, i64)>(
        "SELECT COALESCE(SUM(amount_cents), 0), COUNT(*) \
         FROM transactions WHERE account_id = ? AND date <= ?",
    )
    .bind(id.0)
    .bind(date.to_string())
    .fetch_one(pool)
    .await?;
    let balance_cents = account.initial_balance_cents + sum;
    Ok(BalanceAtDate {
        account_id: id.0,
        date,
        balance_cents,
        balance: Money::from_cents(balance_cents),
        transaction_count: count,
    })
}

/// Reconciles against a known-good statement balance at `target_date`:
/// adjusts the initial balance so that the computed balance at that date
/// equals the target, then recomputes the current balance from the new
/// initial. Transactions are never altered.
pub async fn reconcile_balance(
    pool: &DbPool,
    id: AccountId,
    target_date: NaiveDate,
    target_balance_cents: i64,
) -> Result<ReconcileReport, StorageError> {
    let account = fetch_account(pool, id).await?;

    let (sum_through, _) = sqlx::query_as::<_, (i64, i64)>(
        "SELECT COALESCE(SUM(amount_cents), 0), COUNT(*) \
         FROM transactions WHERE account_id = ? AND date <= ?",
    )
    .bind(id.0)
    .bind(target_date.to_string())
    .fetch_one(pool)
    .await?;
    let (sum_all, _) = sqlx::query_as::<_, (i64, i64)>(
        "SELECT COALESCE(SUM(amount_cents), 0), COUNT(*) FROM transactions WHERE account_id = ?",
    )
    .bind(id.0)
    .fetch_one(pool)
    .await?;

    let new_initial = target_balance_cents - sum_through;
    let new_balance = new_initial + sum_all;

    sqlx::query("UPDATE accounts SET initial_balance_cents = ?, balance_cents = ? WHERE id = ?")
        .bind(new_initial)
        .bind(new_balance)
        .bind(id.0)
        .execute(pool)
        .await?;

    info!(
        account_id = id.0,
        %target_date,
        target_balance_cents,
        new_initial_cents = new_initial,
        "reconciled account balance"
    );

    Ok(ReconcileReport {
        account_id: id.0,
        target_date,
        target_balance_cents,
        previous_initial_cents: account.initial_balance_cents,
        new_initial_cents: new_initial,
        new_balance_cents: new_balance,
        new_balance: Money::from_cents(new_balance),
    })
}
