use centime_core::{StagingRow, StagingStatus};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;

use crate::db::DbPool;
use crate::error::StorageError;

/// Incoming staging row, before it has an id or any matching state.
#[derive(Debug, Clone)]
pub struct NewStagingRow {
    pub external_id: Option<String>,
    pub description: String,
    pub amount_cents: i64,
    pub transaction_date: NaiveDate,
    pub posted_date: Option<NaiveDate>,
    pub account_number: String,
}

#[derive(Debug, FromRow)]
struct StagingRecord {
    id: i64,
    external_id: Option<String>,
    description: String,
    amount_cents: i64,
    transaction_date: String,
    posted_date: Option<String>,
    account_number: String,
    status: String,
    linked_staging_id: Option<i64>,
    transfer_group_id: Option<String>,
    categorized: i64,
    mapped_subcategory_id: Option<i64>,
    mapped_account_id: Option<i64>,
    imported_transaction_id: Option<i64>,
    imported_at: Option<String>,
}

impl TryFrom<StagingRecord> for StagingRow {
    type Error = StorageError;

    fn try_from(r: StagingRecord) -> Result<Self, StorageError> {
        let transaction_date = parse_date(&r.transaction_date)?;
        let posted_date = r.posted_date.as_deref().map(parse_date).transpose()?;
        let status: StagingStatus = r
            .status
            .parse()
            .map_err(|_| StorageError::Corrupt(format!("unknown staging status {:?}", r.status)))?;
        let imported_at = r
            .imported_at
            .as_deref()
            .map(parse_datetime)
            .transpose()?;
        Ok(StagingRow {
            id: r.id,
            external_id: r.external_id,
            description: r.description,
            amount_cents: r.amount_cents,
            transaction_date,
            posted_date,
            account_number: r.account_number,
            status,
            linked_staging_id: r.linked_staging_id,
            transfer_group_id: r.transfer_group_id,
            categorized: r.categorized != 0,
            mapped_subcategory_id: r.mapped_subcategory_id,
            mapped_account_id: r.mapped_account_id,
            imported_transaction_id: r.imported_transaction_id,
            imported_at,
        })
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, StorageError> {
    s.parse()
        .map_err(|_| StorageError::Corrupt(format!("bad date {s:?}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| StorageError::Corrupt(format!("bad timestamp {s:?}")))
}

const SELECT_COLS: &str = "id, external_id, description, amount_cents, transaction_date, \
     posted_date, account_number, status, linked_staging_id, transfer_group_id, categorized, \
     mapped_subcategory_id, mapped_account_id, imported_transaction_id, imported_at";

pub async fn insert_staging(pool: &DbPool, row: &NewStagingRow) -> Result<i64, StorageError> {
    let result = sqlx::query(
        "INSERT INTO staging_transactions \
         (external_id, description, amount_cents, transaction_date, posted_date, account_number) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&row.external_id)
    .bind(&row.description)
    .bind(row.amount_cents)
    .bind(row.transaction_date.to_string())
    .bind(row.posted_date.map(|d| d.to_string()))
    .bind(&row.account_number)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn fetch_staging(pool: &DbPool, id: i64) -> Result<StagingRow, StorageError> {
    let record = sqlx::query_as::<_, StagingRecord>(&format!(
        "SELECT {SELECT_COLS} FROM staging_transactions WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StorageError::not_found("staging transaction", id))?;
    record.try_into()
}

pub async fn fetch_all_staging(pool: &DbPool) -> Result<Vec<StagingRow>, StorageError> {
    let records = sqlx::query_as::<_, StagingRecord>(&format!(
        "SELECT {SELECT_COLS} FROM staging_transactions ORDER BY transaction_date, id"
    ))
    .fetch_all(pool)
    .await?;
    records.into_iter().map(TryInto::try_into).collect()
}

/// Rows still eligible for transfer pairing: not rejected, not imported,
/// not already linked to a counterpart.
pub async fn fetch_unpaired(pool: &DbPool) -> Result<Vec<StagingRow>, StorageError> {
    let records = sqlx::query_as::<_, StagingRecord>(&format!(
        "SELECT {SELECT_COLS} FROM staging_transactions \
         WHERE linked_staging_id IS NULL AND status NOT IN ('REJECTED', 'IMPORTED') \
         ORDER BY transaction_date, id"
    ))
    .fetch_all(pool)
    .await?;
    records.into_iter().map(TryInto::try_into).collect()
}

pub async fn fetch_uncategorized(pool: &DbPool) -> Result<Vec<StagingRow>, StorageError> {
    let records = sqlx::query_as::<_, StagingRecord>(&format!(
        "SELECT {SELECT_COLS} FROM staging_transactions \
         WHERE categorized = 0 AND status NOT IN ('REJECTED', 'IMPORTED') \
         ORDER BY transaction_date, id"
    ))
    .fetch_all(pool)
    .await?;
    records.into_iter().map(TryInto::try_into).collect()
}

/// Rows ready to become ledger transactions: approved, categorized or part
/// of a transfer, and not yet imported.
pub async fn fetch_committable(pool: &DbPool) -> Result<Vec<StagingRow>, StorageError> {
    let records = sqlx::query_as::<_, StagingRecord>(&format!(
        "SELECT {SELECT_COLS} FROM staging_transactions \
         WHERE status = 'APPROVED' AND imported_transaction_id IS NULL \
           AND (categorized = 1 OR transfer_group_id IS NOT NULL) \
         ORDER BY transaction_date, id"
    ))
    .fetch_all(pool)
    .await?;
    records.into_iter().map(TryInto::try_into).collect()
}

pub async fn set_status(
    pool: &DbPool,
    id: i64,
    status: StagingStatus,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "UPDATE staging_transactions \
         SET status = ?, updated_at = datetime('now') \
         WHERE id = ? AND imported_transaction_id IS NULL",
    )
    .bind(status.as_str())
    .bind(id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::Conflict(format!(
            "staging transaction {id} is missing or already imported"
        )));
    }
    Ok(())
}

/// Manual categorization bypasses the candidate pipeline entirely.
pub async fn set_manual_category(
    pool: &DbPool,
    id: i64,
    subcategory_id: i64,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "UPDATE staging_transactions \
         SET categorized = 1, mapped_subcategory_id = ?, status = 'APPROVED', \
             updated_at = datetime('now') \
         WHERE id = ? AND imported_transaction_id IS NULL",
    )
    .bind(subcategory_id)
    .bind(id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::Conflict(format!(
            "staging transaction {id} is missing or already imported"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_db;

    async fn test_pool() -> (tempfile::TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_db(&dir.path().join("test.db")).await.unwrap();
        (dir, pool)
    }

    fn sample(desc: &str, cents: i64, account: &str) -> NewStagingRow {
        NewStagingRow {
            external_id: None,
            description: desc.to_string(),
            amount_cents: cents,
            transaction_date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            posted_date: None,
            account_number: account.to_string(),
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_round_trip() {
        let (_dir, pool) = test_pool().await;
        let id = insert_staging(&pool, &sample("COFFEE", -450, "111"))
            .await
            .unwrap();
        let row = fetch_staging(&pool, id).await.unwrap();
        assert_eq!(row.description, "COFFEE");
        assert_eq!(row.amount_cents, -450);
        assert_eq!(row.status, StagingStatus::Pending);
        assert!(!row.categorized);
        assert!(row.is_unpaired());
    }

    #[tokio::test]
    async fn fetch_missing_row_is_not_found() {
        let (_dir, pool) = test_pool().await;
        let err = fetch_staging(&pool, 99).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn manual_category_marks_approved() {
        let (_dir, pool) = test_pool().await;
        let sub = crate::db::insert_subcategory(&pool, "Dining").await.unwrap();
        let id = insert_staging(&pool, &sample("LUNCH", -1200, "111"))
            .await
            .unwrap();
        set_manual_category(&pool, id, sub).await.unwrap();
        let row = fetch_staging(&pool, id).await.unwrap();
        assert!(row.categorized);
        assert_eq!(row.mapped_subcategory_id, Some(sub));
        assert_eq!(row.status, StagingStatus::Approved);
        assert!(fetch_uncategorized(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn committable_requires_approval_and_category() {
        let (_dir, pool) = test_pool().await;
        let sub = crate::db::insert_subcategory(&pool, "Rent").await.unwrap();
        let a = insert_staging(&pool, &sample("RENT", -150000, "111"))
            .await
            .unwrap();
        let _b = insert_staging(&pool, &sample("MISC", -500, "111"))
            .await
            .unwrap();
        assert!(fetch_committable(&pool).await.unwrap().is_empty());
        set_manual_category(&pool, a, sub).await.unwrap();
        let committable = fetch_committable(&pool).await.unwrap();
        assert_eq!(committable.len(), 1);
        assert_eq!(committable[0].id, a);
    }
}
