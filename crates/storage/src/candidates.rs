use centime_core::{
    CategorizationCandidate, CategorizationReasons, Decision, PairingCandidate, PairingReasons,
};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::StorageError;

#[derive(Debug, FromRow)]
struct PairingRecord {
    id: i64,
    left_id: i64,
    right_id: i64,
    score: f64,
    reasons: String,
    preselected: i64,
    decision: Option<String>,
    decided_at: Option<String>,
}

impl TryFrom<PairingRecord> for PairingCandidate {
    type Error = StorageError;

    fn try_from(r: PairingRecord) -> Result<Self, StorageError> {
        let reasons: PairingReasons = serde_json::from_str(&r.reasons)
            .map_err(|e| StorageError::Corrupt(format!("pairing reasons: {e}")))?;
        Ok(PairingCandidate {
            id: Some(r.id),
            left_id: r.left_id,
            right_id: r.right_id,
            score: r.score,
            reasons,
            preselected: r.preselected != 0,
            decision: parse_decision(r.decision.as_deref())?,
            decided_at: parse_timestamp(r.decided_at.as_deref())?,
        })
    }
}

#[derive(Debug, FromRow)]
struct CategorizationRecord {
    id: i64,
    staging_tx_id: i64,
    subcategory_id: i64,
    score: f64,
    confidence: f64,
    reasons: String,
    rule_tags: String,
    preselected: i64,
    decision: Option<String>,
    decided_at: Option<String>,
}

impl TryFrom<CategorizationRecord> for CategorizationCandidate {
    type Error = StorageError;

    fn try_from(r: CategorizationRecord) -> Result<Self, StorageError> {
        let reasons: CategorizationReasons = serde_json::from_str(&r.reasons)
            .map_err(|e| StorageError::Corrupt(format!("categorization reasons: {e}")))?;
        Ok(CategorizationCandidate {
            id: Some(r.id),
            staging_tx_id: r.staging_tx_id,
            subcategory_id: r.subcategory_id,
            score: r.score,
            confidence: r.confidence,
            reasons,
            rule_tags: r.rule_tags,
            preselected: r.preselected != 0,
            decision: parse_decision(r.decision.as_deref())?,
            decided_at: parse_timestamp(r.decided_at.as_deref())?,
        })
    }
}

fn parse_decision(s: Option<&str>) -> Result<Option<Decision>, StorageError> {
    s.map(|v| {
        v.parse()
            .map_err(|_| StorageError::Corrupt(format!("unknown decision {v:?}")))
    })
    .transpose()
}

fn parse_timestamp(s: Option<&str>) -> Result<Option<DateTime<Utc>>, StorageError> {
    s.map(|v| {
        DateTime::parse_from_rfc3339(v)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|_| StorageError::Corrupt(format!("bad timestamp {v:?}")))
    })
    .transpose()
}

fn reasons_json<T: serde::Serialize>(reasons: &T) -> Result<String, StorageError> {
    serde_json::to_string(reasons).map_err(|e| StorageError::Corrupt(format!("reasons: {e}")))
}

/// Replaces every PENDING pairing candidate with a fresh suggestion set.
/// Decided candidates are history and stay untouched.
pub async fn replace_pending_pairing(
    pool: &DbPool,
    candidates: &[PairingCandidate],
) -> Result<Vec<i64>, StorageError> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM pairing_candidates WHERE decision IS NULL")
        .execute(&mut *tx)
        .await?;
    let mut ids = Vec::with_capacity(candidates.len());
    for c in candidates {
        let result = sqlx::query(
            "INSERT INTO pairing_candidates (left_id, right_id, score, reasons, preselected) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(c.left_id)
        .bind(c.right_id)
        .bind(c.score)
        .bind(reasons_json(&c.reasons)?)
        .bind(c.preselected)
        .execute(&mut *tx)
        .await?;
        ids.push(result.last_insert_rowid());
    }
    tx.commit().await?;
    Ok(ids)
}

pub async fn fetch_pending_pairings(pool: &DbPool) -> Result<Vec<PairingCandidate>, StorageError> {
    let records = sqlx::query_as::<_, PairingRecord>(
        "SELECT id, left_id, right_id, score, reasons, preselected, decision, decided_at \
         FROM pairing_candidates WHERE decision IS NULL ORDER BY score DESC, id",
    )
    .fetch_all(pool)
    .await?;
    records.into_iter().map(TryInto::try_into).collect()
}

pub async fn fetch_pairing(pool: &DbPool, id: i64) -> Result<PairingCandidate, StorageError> {
    let record = sqlx::query_as::<_, PairingRecord>(
        "SELECT id, left_id, right_id, score, reasons, preselected, decision, decided_at \
         FROM pairing_candidates WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StorageError::not_found("pairing candidate", id))?;
    record.try_into()
}

/// The pending candidate proposing `left_id`/`right_id` as a pair, if any.
pub async fn fetch_pending_pairing_by_legs(
    pool: &DbPool,
    left_id: i64,
    right_id: i64,
) -> Result<Option<PairingCandidate>, StorageError> {
    let record = sqlx::query_as::<_, PairingRecord>(
        "SELECT id, left_id, right_id, score, reasons, preselected, decision, decided_at \
         FROM pairing_candidates WHERE left_id = ? AND right_id = ? AND decision IS NULL",
    )
    .bind(left_id)
    .bind(right_id)
    .fetch_optional(pool)
    .await?;
    record.map(TryInto::try_into).transpose()
}

/// Accepts a pairing candidate: links both staging rows symmetrically under
/// a fresh transfer group, marks them categorized (transfers carry no
/// subcategory) and rejects every other pending candidate that touches
/// either row. All or nothing.
pub async fn confirm_pairing(pool: &DbPool, candidate_id: i64) -> Result<String, StorageError> {
    let mut tx = pool.begin().await?;

    let accepted = sqlx::query(
        "UPDATE pairing_candidates \
         SET decision = 'ACCEPTED', decided_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') \
         WHERE id = ? AND decision IS NULL",
    )
    .bind(candidate_id)
    .execute(&mut *tx)
    .await?;
    if accepted.rows_affected() == 0 {
        return Err(StorageError::AlreadyDecided { candidate_id });
    }

    let (left_id, right_id) = sqlx::query_as::<_, (i64, i64)>(
        "SELECT left_id, right_id FROM pairing_candidates WHERE id = ?",
    )
    .bind(candidate_id)
    .fetch_one(&mut *tx)
    .await?;

    let group_id = Uuid::new_v4().to_string();
    for (own, other) in [(left_id, right_id), (right_id, left_id)] {
        let updated = sqlx::query(
            "UPDATE staging_transactions \
             SET linked_staging_id = ?, transfer_group_id = ?, status = 'APPROVED', \
                 categorized = 1, updated_at = datetime('now') \
             WHERE id = ? AND linked_staging_id IS NULL AND imported_transaction_id IS NULL",
        )
        .bind(other)
        .bind(&group_id)
        .bind(own)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "staging transaction {own} is already linked or imported"
            )));
        }
    }

    sqlx::query(
        "UPDATE pairing_candidates \
         SET decision = 'REJECTED', decided_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') \
         WHERE decision IS NULL AND (left_id IN (?, ?) OR right_id IN (?, ?))",
    )
    .bind(left_id)
    .bind(right_id)
    .bind(left_id)
    .bind(right_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(group_id)
}

pub async fn reject_pairing(pool: &DbPool, candidate_id: i64) -> Result<(), StorageError> {
    let result = sqlx::query(
        "UPDATE pairing_candidates \
         SET decision = 'REJECTED', decided_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') \
         WHERE id = ? AND decision IS NULL",
    )
    .bind(candidate_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::AlreadyDecided { candidate_id });
    }
    Ok(())
}

/// Replaces the PENDING categorization candidates for one staging row.
pub async fn replace_categorization_for_row(
    pool: &DbPool,
    staging_tx_id: i64,
    candidates: &[CategorizationCandidate],
) -> Result<Vec<i64>, StorageError> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM categorization_candidates WHERE staging_tx_id = ? AND decision IS NULL",
    )
    .bind(staging_tx_id)
    .execute(&mut *tx)
    .await?;
    let mut ids = Vec::with_capacity(candidates.len());
    for c in candidates {
        let result = sqlx::query(
            "INSERT INTO categorization_candidates \
             (staging_tx_id, subcategory_id, score, confidence, reasons, rule_tags, preselected) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(staging_tx_id)
        .bind(c.subcategory_id)
        .bind(c.score)
        .bind(c.confidence)
        .bind(reasons_json(&c.reasons)?)
        .bind(&c.rule_tags)
        .bind(c.preselected)
        .execute(&mut *tx)
        .await?;
        ids.push(result.last_insert_rowid());
    }
    tx.commit().await?;
    Ok(ids)
}

pub async fn fetch_categorizations_for_row(
    pool: &DbPool,
    staging_tx_id: i64,
) -> Result<Vec<CategorizationCandidate>, StorageError> {
    let records = sqlx::query_as::<_, CategorizationRecord>(
        "SELECT id, staging_tx_id, subcategory_id, score, confidence, reasons, rule_tags, \
                preselected, decision, decided_at \
         FROM categorization_candidates WHERE staging_tx_id = ? \
         ORDER BY confidence DESC, id",
    )
    .bind(staging_tx_id)
    .fetch_all(pool)
    .await?;
    records.into_iter().map(TryInto::try_into).collect()
}

pub async fn fetch_categorization(
    pool: &DbPool,
    id: i64,
) -> Result<CategorizationCandidate, StorageError> {
    let record = sqlx::query_as::<_, CategorizationRecord>(
        "SELECT id, staging_tx_id, subcategory_id, score, confidence, reasons, rule_tags, \
                preselected, decision, decided_at \
         FROM categorization_candidates WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StorageError::not_found("categorization candidate", id))?;
    record.try_into()
}

/// Accepts one categorization candidate, rejects its pending siblings and
/// marks the staging row categorized, all in one transaction. The winning
/// candidate is returned so callers can inspect how it was produced.
pub async fn confirm_categorization(
    pool: &DbPool,
    candidate_id: i64,
) -> Result<CategorizationCandidate, StorageError> {
    let mut tx = pool.begin().await?;

    let accepted = sqlx::query(
        "UPDATE categorization_candidates \
         SET decision = 'ACCEPTED', decided_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') \
         WHERE id = ? AND decision IS NULL",
    )
    .bind(candidate_id)
    .execute(&mut *tx)
    .await?;
    if accepted.rows_affected() == 0 {
        return Err(StorageError::AlreadyDecided { candidate_id });
    }

    let record = sqlx::query_as::<_, CategorizationRecord>(
        "SELECT id, staging_tx_id, subcategory_id, score, confidence, reasons, rule_tags, \
                preselected, decision, decided_at \
         FROM categorization_candidates WHERE id = ?",
    )
    .bind(candidate_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE categorization_candidates \
         SET decision = 'REJECTED', decided_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') \
         WHERE staging_tx_id = ? AND decision IS NULL",
    )
    .bind(record.staging_tx_id)
    .execute(&mut *tx)
    .await?;

    let updated = sqlx::query(
        "UPDATE staging_transactions \
         SET categorized = 1, mapped_subcategory_id = ?, status = 'APPROVED', \
             updated_at = datetime('now') \
         WHERE id = ? AND imported_transaction_id IS NULL",
    )
    .bind(record.subcategory_id)
    .bind(record.staging_tx_id)
    .execute(&mut *tx)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(StorageError::Conflict(format!(
            "staging transaction {} is already imported",
            record.staging_tx_id
        )));
    }

    tx.commit().await?;
    record.try_into()
}

pub async fn reject_categorization(pool: &DbPool, candidate_id: i64) -> Result<(), StorageError> {
    let result = sqlx::query(
        "UPDATE categorization_candidates \
         SET decision = 'REJECTED', decided_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') \
         WHERE id = ? AND decision IS NULL",
    )
    .bind(candidate_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::AlreadyDecided { candidate_id });
    }
    Ok(())
}

/// Drops every pending suggestion for a row, e.g. after a manual override.
pub async fn reject_pending_for_row(pool: &DbPool, staging_tx_id: i64) -> Result<u64, StorageError> {
    let result = sqlx::query(
        "UPDATE categorization_candidates \
         SET decision = 'REJECTED', decided_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') \
         WHERE staging_tx_id = ? AND decision IS NULL",
    )
    .bind(staging_tx_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_db;
    use crate::staging::{fetch_staging, insert_staging, NewStagingRow};
    use centime_core::{StagingStatus, AUTO_ACCEPT_TAG};
    use chrono::NaiveDate;

    async fn test_pool() -> (tempfile::TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_db(&dir.path().join("test.db")).await.unwrap();
        (dir, pool)
    }

    async fn seed_row(pool: &DbPool, desc: &str, cents: i64, account: &str) -> i64 {
        insert_staging(
            pool,
            &NewStagingRow {
                external_id: None,
                description: desc.to_string(),
                amount_cents: cents,
                transaction_date: NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
                posted_date: None,
                account_number: account.to_string(),
            },
        )
        .await
        .unwrap()
    }

    fn pairing(left: i64, right: i64, score: f64) -> PairingCandidate {
        PairingCandidate {
            id: None,
            left_id: left,
            right_id: right,
            score,
            reasons: PairingReasons::default(),
            preselected: false,
            decision: None,
            decided_at: None,
        }
    }

    fn categorization(row: i64, sub: i64, confidence: f64) -> CategorizationCandidate {
        CategorizationCandidate {
            id: None,
            staging_tx_id: row,
            subcategory_id: sub,
            score: confidence,
            confidence,
            reasons: CategorizationReasons {
                source: "RULES".to_string(),
                ..Default::default()
            },
            rule_tags: String::new(),
            preselected: false,
            decision: None,
            decided_at: None,
        }
    }

    #[tokio::test]
    async fn confirm_pairing_links_both_legs_and_rejects_siblings() {
        let (_dir, pool) = test_pool().await;
        let debit = seed_row(&pool, "TRANSFER OUT", -5000, "111").await;
        let credit = seed_row(&pool, "TRANSFER IN", 5000, "222").await;
        let other_credit = seed_row(&pool, "TRANSFER IN", 5000, "333").await;

        let ids = replace_pending_pairing(
            &pool,
            &[
                pairing(debit, credit, 0.95),
                pairing(debit, other_credit, 0.70),
            ],
        )
        .await
        .unwrap();

        let group = confirm_pairing(&pool, ids[0]).await.unwrap();

        let left = fetch_staging(&pool, debit).await.unwrap();
        let right = fetch_staging(&pool, credit).await.unwrap();
        assert_eq!(left.linked_staging_id, Some(credit));
        assert_eq!(right.linked_staging_id, Some(debit));
        assert_eq!(left.transfer_group_id.as_deref(), Some(group.as_str()));
        assert_eq!(left.transfer_group_id, right.transfer_group_id);
        assert_eq!(left.status, StagingStatus::Approved);
        assert!(left.categorized && right.categorized);

        // The competing candidate for the same debit leg was auto-rejected.
        let sibling = fetch_pairing(&pool, ids[1]).await.unwrap();
        assert_eq!(sibling.decision, Some(Decision::Rejected));
        assert!(fetch_pending_pairings(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookup_by_legs_finds_only_pending_candidates() {
        let (_dir, pool) = test_pool().await;
        let debit = seed_row(&pool, "OUT", -100, "111").await;
        let credit = seed_row(&pool, "IN", 100, "222").await;
        let ids = replace_pending_pairing(&pool, &[pairing(debit, credit, 0.9)])
            .await
            .unwrap();

        let found = fetch_pending_pairing_by_legs(&pool, debit, credit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, Some(ids[0]));
        assert!(fetch_pending_pairing_by_legs(&pool, credit, debit)
            .await
            .unwrap()
            .is_none());

        // Once decided the candidate no longer resolves by legs.
        confirm_pairing(&pool, ids[0]).await.unwrap();
        assert!(fetch_pending_pairing_by_legs(&pool, debit, credit)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn second_decision_on_same_candidate_is_rejected() {
        let (_dir, pool) = test_pool().await;
        let debit = seed_row(&pool, "OUT", -100, "111").await;
        let credit = seed_row(&pool, "IN", 100, "222").await;
        let ids = replace_pending_pairing(&pool, &[pairing(debit, credit, 0.9)])
            .await
            .unwrap();

        confirm_pairing(&pool, ids[0]).await.unwrap();
        let err = reject_pairing(&pool, ids[0]).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::AlreadyDecided { candidate_id } if candidate_id == ids[0]
        ));
    }

    #[tokio::test]
    async fn confirm_categorization_updates_row_and_siblings() {
        let (_dir, pool) = test_pool().await;
        let groceries = crate::db::insert_subcategory(&pool, "Groceries")
            .await
            .unwrap();
        let dining = crate::db::insert_subcategory(&pool, "Dining").await.unwrap();
        let row = seed_row(&pool, "WOOLWORTHS 123", -4200, "111").await;

        let ids = replace_categorization_for_row(
            &pool,
            row,
            &[
                categorization(row, groceries, 0.9),
                categorization(row, dining, 0.4),
            ],
        )
        .await
        .unwrap();

        let winner = confirm_categorization(&pool, ids[0]).await.unwrap();
        assert_eq!(winner.subcategory_id, groceries);
        assert_eq!(winner.decision, Some(Decision::Accepted));

        let loser = fetch_categorization(&pool, ids[1]).await.unwrap();
        assert_eq!(loser.decision, Some(Decision::Rejected));

        let staged = fetch_staging(&pool, row).await.unwrap();
        assert!(staged.categorized);
        assert_eq!(staged.mapped_subcategory_id, Some(groceries));
        assert_eq!(staged.status, StagingStatus::Approved);
    }

    #[tokio::test]
    async fn replace_keeps_decided_candidates() {
        let (_dir, pool) = test_pool().await;
        let sub = crate::db::insert_subcategory(&pool, "Fuel").await.unwrap();
        let row = seed_row(&pool, "BP SERVICE", -8000, "111").await;

        let ids = replace_categorization_for_row(&pool, row, &[categorization(row, sub, 0.8)])
            .await
            .unwrap();
        confirm_categorization(&pool, ids[0]).await.unwrap();

        // A re-run replaces only pending rows; the accepted one survives.
        replace_categorization_for_row(&pool, row, &[categorization(row, sub, 0.5)])
            .await
            .unwrap();
        let all = fetch_categorizations_for_row(&pool, row).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|c| c.decision == Some(Decision::Accepted)));
    }

    #[tokio::test]
    async fn reasons_survive_storage() {
        let (_dir, pool) = test_pool().await;
        let sub = crate::db::insert_subcategory(&pool, "Coffee").await.unwrap();
        let row = seed_row(&pool, "STARBUCKS", -600, "111").await;
        let mut c = categorization(row, sub, 1.0);
        c.rule_tags = AUTO_ACCEPT_TAG.to_string();
        c.reasons.source = "AUTO_ACCEPT".to_string();
        c.reasons.merchant = Some("starbucks".to_string());

        let ids = replace_categorization_for_row(&pool, row, &[c]).await.unwrap();
        let back = fetch_categorization(&pool, ids[0]).await.unwrap();
        assert_eq!(back.rule_tags, AUTO_ACCEPT_TAG);
        assert_eq!(back.reasons.merchant.as_deref(), Some("starbucks"));
    }
}
