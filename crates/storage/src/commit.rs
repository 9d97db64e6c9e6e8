use centime_core::{AccountId, Money, StagingRow, TransactionType};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::accounts::fetch_by_number;
use crate::db::DbPool;
use crate::error::StorageError;
use crate::staging::fetch_committable;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedRow {
    pub staging_id: i64,
    pub transaction_id: i64,
    pub account_id: i64,
    pub amount_cents: i64,
    /// Decimal rendition of `amount_cents` for reports.
    pub amount: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_group_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub total: usize,
    pub committed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub entries: Vec<CommittedRow>,
}

/// Promotes every committable staging row into the ledger. Transfer pairs
/// commit atomically as two mutually linked transactions; standalone rows
/// commit one by one. A failing row is recorded and does not abort the run.
/// Already-imported rows are skipped, so re-running is safe.
pub async fn commit_all(pool: &DbPool) -> Result<CommitReport, StorageError> {
    let rows = fetch_committable(pool).await?;
    let mut report = CommitReport {
        total: rows.len(),
        ..Default::default()
    };

    let mut by_group: HashMap<String, Vec<StagingRow>> = HashMap::new();
    let mut singles = Vec::new();
    for row in rows {
        match row.transfer_group_id.clone() {
            Some(group) => by_group.entry(group).or_default().push(row),
            None => singles.push(row),
        }
    }

    let mut groups: Vec<_> = by_group.into_iter().collect();
    groups.sort_by(|a, b| a.0.cmp(&b.0));
    for (group, mut legs) in groups {
        if legs.len() != 2 {
            // The counterpart leg is not committable yet. Wait for it.
            report.skipped += legs.len();
            warn!(group = %group, legs = legs.len(), "transfer group incomplete, deferring");
            continue;
        }
        legs.sort_by_key(|r| r.amount_cents);
        let (debit, credit) = (legs.remove(0), legs.remove(0));
        match commit_transfer_pair(pool, &debit, &credit, &group).await {
            Ok(pair) => {
                report.committed += 2;
                report.entries.extend(pair);
            }
            Err(e) => {
                report.failed += 2;
                report
                    .errors
                    .push(format!("transfer group {group}: {e}"));
            }
        }
    }

    for row in singles {
        match commit_single(pool, &row).await {
            Ok(entry) => {
                report.committed += 1;
                report.entries.push(entry);
            }
            Err(e) => {
                report.failed += 1;
                report.errors.push(format!("staging {}: {e}", row.id));
            }
        }
    }

    info!(
        total = report.total,
        committed = report.committed,
        skipped = report.skipped,
        failed = report.failed,
        "commit run finished"
    );
    Ok(report)
}

async fn resolve_account(pool: &DbPool, row: &StagingRow) -> Result<AccountId, StorageError> {
    if let Some(id) = row.mapped_account_id {
        return Ok(AccountId(id));
    }
    fetch_by_number(pool, &row.account_number)
        .await?
        .and_then(|a| a.id)
        .ok_or_else(|| {
            StorageError::Conflict(format!(
                "no account with number {:?} for staging {}",
                row.account_number, row.id
            ))
        })
}

async fn commit_single(pool: &DbPool, row: &StagingRow) -> Result<CommittedRow, StorageError> {
    let account_id = resolve_account(pool, row).await?;
    let tx_type = TransactionType::classify(row.amount_cents, false);

    let mut tx = pool.begin().await?;
    let transaction_id = insert_transaction(
        &mut tx,
        account_id,
        row,
        tx_type,
        row.mapped_subcategory_id,
        None,
        None,
    )
    .await?;
    mark_imported(&mut tx, row.id, transaction_id).await?;
    bump_balance(&mut tx, account_id, row.amount_cents).await?;
    tx.commit().await?;

    Ok(CommittedRow {
        staging_id: row.id,
        transaction_id,
        account_id: account_id.0,
        amount_cents: row.amount_cents,
        amount: Money::from_cents(row.amount_cents),
        transfer_group_id: None,
    })
}

async fn commit_transfer_pair(
    pool: &DbPool,
    debit: &StagingRow,
    credit: &StagingRow,
    group: &str,
) -> Result<[CommittedRow; 2], StorageError> {
    let debit_account = resolve_account(pool, debit).await?;
    let credit_account = resolve_account(pool, credit).await?;

    let mut tx = pool.begin().await?;
    let debit_id = insert_transaction(
        &mut tx,
        debit_account,
        debit,
        TransactionType::Transfer,
        None,
        None,
        Some(group),
    )
    .await?;
    let credit_id = insert_transaction(
        &mut tx,
        credit_account,
        credit,
        TransactionType::Transfer,
        None,
        Some(debit_id),
        Some(group),
    )
    .await?;
    sqlx::query("UPDATE transactions SET linked_transaction_id = ? WHERE id = ?")
        .bind(credit_id)
        .bind(debit_id)
        .execute(&mut *tx)
        .await?;
    mark_imported(&mut tx, debit.id, debit_id).await?;
    mark_imported(&mut tx, credit.id, credit_id).await?;
    bump_balance(&mut tx, debit_account, debit.amount_cents).await?;
    bump_balance(&mut tx, credit_account, credit.amount_cents).await?;
    tx.commit().await?;

    Ok([
        CommittedRow {
            staging_id: debit.id,
            transaction_id: debit_id,
            account_id: debit_account.0,
            amount_cents: debit.amount_cents,
            amount: Money::from_cents(debit.amount_cents),
            transfer_group_id: Some(group.to_string()),
        },
        CommittedRow {
            staging_id: credit.id,
            transaction_id: credit_id,
            account_id: credit_account.0,
            amount_cents: credit.amount_cents,
            amount: Money::from_cents(credit.amount_cents),
            transfer_group_id: Some(group.to_string()),
        },
    ])
}

async fn insert_transaction(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    account_id: AccountId,
    row: &StagingRow,
    tx_type: TransactionType,
    subcategory_id: Option<i64>,
    linked_transaction_id: Option<i64>,
    transfer_group_id: Option<&str>,
) -> Result<i64, StorageError> {
    let result = sqlx::query(
        "INSERT INTO transactions \
         (account_id, amount_cents, tx_type, subcategory_id, date, description, \
          linked_transaction_id, transfer_group_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(account_id.0)
    .bind(row.amount_cents)
    .bind(tx_type.as_str())
    .bind(subcategory_id)
    .bind(row.transaction_date.to_string())
    .bind(&row.description)
    .bind(linked_transaction_id)
    .bind(transfer_group_id)
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn mark_imported(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    staging_id: i64,
    transaction_id: i64,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "UPDATE staging_transactions \
         SET status = 'IMPORTED', imported_transaction_id = ?, \
             imported_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now'), \
             updated_at = datetime('now') \
         WHERE id = ? AND imported_transaction_id IS NULL",
    )
    .bind(transaction_id)
    .bind(staging_id)
    .execute(&mut **tx)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::Conflict(format!(
            "staging transaction {staging_id} was already imported"
        )));
    }
    Ok(())
}

async fn bump_balance(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    account_id: AccountId,
    amount_cents: i64,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE accounts SET balance_cents = balance_cents + ? WHERE id = ?")
        .bind(amount_cents)
        .bind(account_id.0)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{create_account, fetch_account};
    use crate::db::{create_db, insert_subcategory};
    use crate::staging::{fetch_staging, insert_staging, set_manual_category, NewStagingRow};
    use centime_core::{Account, StagingStatus};
    use chrono::NaiveDate;

    async fn test_pool() -> (tempfile::TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_db(&dir.path().join("test.db")).await.unwrap();
        (dir, pool)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn seed_account(pool: &DbPool, name: &str, number: &str, initial: i64) -> AccountId {
        let mut account = Account::new(name, number, date(2024, 1, 1)).with_owner("sam");
        account.initial_balance_cents = initial;
        create_account(pool, &account).await.unwrap()
    }

    async fn seed_row(pool: &DbPool, desc: &str, cents: i64, account: &str) -> i64 {
        insert_staging(
            pool,
            &NewStagingRow {
                external_id: None,
                description: desc.to_string(),
                amount_cents: cents,
                transaction_date: date(2024, 6, 1),
                posted_date: None,
                account_number: account.to_string(),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn commits_categorized_row_and_updates_balance() {
        let (_dir, pool) = test_pool().await;
        let account = seed_account(&pool, "Everyday", "111", 10_000).await;
        let sub = insert_subcategory(&pool, "Groceries").await.unwrap();
        let row = seed_row(&pool, "WOOLWORTHS", -4_200, "111").await;
        set_manual_category(&pool, row, sub).await.unwrap();

        let report = commit_all(&pool).await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.entries[0].account_id, account.0);
        assert_eq!(report.entries[0].amount.to_string(), "-42.00");

        let staged = fetch_staging(&pool, row).await.unwrap();
        assert_eq!(staged.status, StagingStatus::Imported);
        assert!(staged.imported_transaction_id.is_some());
        assert_eq!(fetch_account(&pool, account).await.unwrap().balance_cents, 5_800);
    }

    #[tokio::test]
    async fn transfer_pair_commits_as_linked_transactions() {
        let (_dir, pool) = test_pool().await;
        let everyday = seed_account(&pool, "Everyday", "111", 50_000).await;
        let savings = seed_account(&pool, "Savings", "222", 0).await;
        let debit = seed_row(&pool, "TFR TO SAVINGS", -20_000, "111").await;
        let credit = seed_row(&pool, "TFR FROM EVERYDAY", 20_000, "222").await;

        let ids = crate::candidates::replace_pending_pairing(
            &pool,
            &[centime_core::PairingCandidate {
                id: None,
                left_id: debit,
                right_id: credit,
                score: 0.95,
                reasons: Default::default(),
                preselected: true,
                decision: None,
                decided_at: None,
            }],
        )
        .await
        .unwrap();
        crate::candidates::confirm_pairing(&pool, ids[0]).await.unwrap();

        let report = commit_all(&pool).await.unwrap();
        assert_eq!(report.committed, 2);
        assert_eq!(report.failed, 0);

        let (linked, group): (Option<i64>, Option<String>) = sqlx::query_as(
            "SELECT linked_transaction_id, transfer_group_id FROM transactions \
             WHERE account_id = ?",
        )
        .bind(everyday.0)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(linked.is_some());
        assert!(group.is_some());

        assert_eq!(
            fetch_account(&pool, everyday).await.unwrap().balance_cents,
            30_000
        );
        assert_eq!(
            fetch_account(&pool, savings).await.unwrap().balance_cents,
            20_000
        );
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let (_dir, pool) = test_pool().await;
        let account = seed_account(&pool, "Everyday", "111", 0).await;
        let sub = insert_subcategory(&pool, "Fuel").await.unwrap();
        let row = seed_row(&pool, "BP", -8_000, "111").await;
        set_manual_category(&pool, row, sub).await.unwrap();

        let first = commit_all(&pool).await.unwrap();
        assert_eq!(first.committed, 1);
        let second = commit_all(&pool).await.unwrap();
        assert_eq!(second.total, 0);
        assert_eq!(second.committed, 0);
        assert_eq!(fetch_account(&pool, account).await.unwrap().balance_cents, -8_000);
    }

    #[tokio::test]
    async fn unknown_account_fails_that_row_only() {
        let (_dir, pool) = test_pool().await;
        seed_account(&pool, "Everyday", "111", 0).await;
        let sub = insert_subcategory(&pool, "Misc").await.unwrap();
        let good = seed_row(&pool, "OK", -100, "111").await;
        let bad = seed_row(&pool, "ORPHAN", -200, "404").await;
        set_manual_category(&pool, good, sub).await.unwrap();
        set_manual_category(&pool, bad, sub).await.unwrap();

        let report = commit_all(&pool).await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("404"));
    }
}
