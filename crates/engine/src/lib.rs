pub mod collab;
pub mod config;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use centime_core::{
    AccountId, CategorizationCandidate, PairingCandidate, StagingRow, AUTO_ACCEPT_TAG,
};
use centime_match::auto_accept::{AutoAcceptMap, AutoAcceptStore};
use centime_match::{
    apply_tie_winner, tied_leaders, Categorizer, NoScripts, PairingMatcher, RuleError, RuleSet,
    ScriptPredicate,
};
use centime_storage::db::{get_setting, set_setting, subcategory_exists};
use centime_storage::{accounts, candidates, commit, staging};
use centime_storage::{
    BalanceAtDate, CommitReport, DbPool, RecalculateReport, ReconcileReport, StorageError,
};

pub use collab::{
    CollabError, NoSimilarity, NoTieBreaker, SimilarityProvider, TieBreakPick, TieBreaker,
    TiedCandidate,
};
pub use config::{ConfigError, EngineConfig};

const RULES_KEY: &str = "rules";
const PAIRING_RULES_KEY: &str = "pairing_rules";
const AUTO_ACCEPT_KEY: &str = "auto_accept_map";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Progress events emitted while a batch categorization run streams.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CategorizationProgress {
    Started {
        total: usize,
    },
    Row {
        index: usize,
        staging_tx_id: i64,
        candidates: usize,
    },
    RowFailed {
        index: usize,
        staging_tx_id: i64,
        error: String,
    },
    Finished {
        processed: usize,
        failed: usize,
        cancelled: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub processed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// The reconciliation engine. One instance per database; cheap to share
/// behind an `Arc`. Rule sets and the auto-accept map reload atomically, so
/// in-flight evaluations keep the snapshot they started with.
pub struct Engine<S = NoSimilarity, T = NoTieBreaker> {
    pool: DbPool,
    config: EngineConfig,
    rules: RwLock<Arc<RuleSet>>,
    pairing_rules: RwLock<Option<Arc<RuleSet>>>,
    auto_accept: AutoAcceptStore,
    scripts: Box<dyn ScriptPredicate>,
    similarity: S,
    tie_breaker: T,
}

impl Engine<NoSimilarity, NoTieBreaker> {
    pub fn new(pool: DbPool, config: EngineConfig) -> Self {
        Engine::with_collaborators(pool, config, NoSimilarity, NoTieBreaker)
    }
}

impl<S: SimilarityProvider, T: TieBreaker> Engine<S, T> {
    pub fn with_collaborators(pool: DbPool, config: EngineConfig, similarity: S, tie_breaker: T) -> Self {
        Engine {
            pool,
            config,
            rules: RwLock::new(Arc::new(RuleSet::empty())),
            pairing_rules: RwLock::new(None),
            auto_accept: AutoAcceptStore::default(),
            scripts: Box::new(NoScripts),
            similarity,
            tie_breaker,
        }
    }

    pub fn with_scripts(mut self, scripts: Box<dyn ScriptPredicate>) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn rules_snapshot(&self) -> Arc<RuleSet> {
        self.rules.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn pairing_rules_snapshot(&self) -> Option<Arc<RuleSet>> {
        self.pairing_rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Restores persisted rule sets and the auto-accept map. Call once after
    /// construction; missing settings are simply absent, not errors.
    pub async fn restore(&self) -> Result<(), EngineError> {
        if let Some(doc) = get_setting(&self.pool, RULES_KEY).await.map_err(StorageError::from)? {
            let set = RuleSet::from_json(&doc)?;
            info!(rules = set.len(), "restored categorization rules");
            *self.rules.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(set);
        }
        if let Some(doc) = get_setting(&self.pool, PAIRING_RULES_KEY)
            .await
            .map_err(StorageError::from)?
        {
            let set = RuleSet::from_json(&doc)?;
            *self.pairing_rules.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(set));
        }
        if let Some(doc) = get_setting(&self.pool, AUTO_ACCEPT_KEY)
            .await
            .map_err(StorageError::from)?
        {
            self.auto_accept.replace(AutoAcceptMap::from_json(&doc)?);
        }
        Ok(())
    }

    /// Validates, persists and hot-swaps the categorization rule set. Every
    /// referenced subcategory must exist. Returns the number of rules loaded.
    pub async fn reload_rules(&self, doc: &str) -> Result<usize, EngineError> {
        let set = RuleSet::from_json(doc)?;
        for rule in set.iter() {
            if !subcategory_exists(&self.pool, rule.subcategory_id)
                .await
                .map_err(StorageError::from)?
            {
                return Err(EngineError::Validation(format!(
                    "rule {:?} references unknown subcategory {}",
                    rule.id, rule.subcategory_id
                )));
            }
        }
        set_setting(&self.pool, RULES_KEY, doc)
            .await
            .map_err(StorageError::from)?;
        let count = set.len();
        *self.rules.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(set);
        info!(rules = count, "categorization rules reloaded");
        Ok(count)
    }

    /// Pairing rules only contribute a score bonus; their subcategory ids
    /// are not resolved, so none are validated against the database.
    pub async fn reload_pairing_rules(&self, doc: &str) -> Result<usize, EngineError> {
        let set = RuleSet::from_json(doc)?;
        set_setting(&self.pool, PAIRING_RULES_KEY, doc)
            .await
            .map_err(StorageError::from)?;
        let count = set.len();
        *self.pairing_rules.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(set));
        Ok(count)
    }

    pub async fn reload_auto_accept(&self, doc: &str) -> Result<usize, EngineError> {
        let map = AutoAcceptMap::from_json(doc)?;
        set_setting(&self.pool, AUTO_ACCEPT_KEY, doc)
            .await
            .map_err(StorageError::from)?;
        let count = map.entries.len();
        self.auto_accept.replace(map);
        Ok(count)
    }

    async fn persist_auto_accept(&self) -> Result<(), EngineError> {
        let doc = self.auto_accept.snapshot().to_json()?;
        set_setting(&self.pool, AUTO_ACCEPT_KEY, &doc)
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }

    /// Recomputes transfer pairing suggestions across all unpaired staging
    /// rows, replacing the previous pending set.
    pub async fn suggest_pairings(&self) -> Result<Vec<PairingCandidate>, EngineError> {
        let rows = staging::fetch_unpaired(&self.pool).await?;
        let owners = accounts::owner_map(&self.pool).await?;
        let config = self.config.pairing.to_pairing_config();
        let rules = self.pairing_rules_snapshot();
        let matcher = PairingMatcher::new(
            &config,
            &owners,
            rules.as_deref(),
            self.scripts.as_ref(),
        );
        let mut suggestions = matcher.suggest(&rows);
        let ids = candidates::replace_pending_pairing(&self.pool, &suggestions).await?;
        for (candidate, id) in suggestions.iter_mut().zip(ids) {
            candidate.id = Some(id);
        }
        info!(candidates = suggestions.len(), rows = rows.len(), "pairing suggestions refreshed");
        Ok(suggestions)
    }

    /// Accepts a pairing candidate. Returns the transfer group id now shared
    /// by both staging rows.
    pub async fn confirm_pairing(&self, candidate_id: i64) -> Result<String, EngineError> {
        Ok(candidates::confirm_pairing(&self.pool, candidate_id).await?)
    }

    /// Accepts the pending candidate pairing `left_id` with `right_id` —
    /// the operation shape review clients use, resolved to the candidate
    /// before the usual confirm path.
    pub async fn confirm_pairing_by_legs(
        &self,
        left_id: i64,
        right_id: i64,
    ) -> Result<String, EngineError> {
        let candidate = candidates::fetch_pending_pairing_by_legs(&self.pool, left_id, right_id)
            .await?
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "no pending pairing candidate for rows {left_id} and {right_id}"
                ))
            })?;
        let candidate_id = candidate.id.ok_or_else(|| {
            EngineError::Validation("pairing candidate has no id".to_string())
        })?;
        self.confirm_pairing(candidate_id).await
    }

    pub async fn reject_pairing(&self, candidate_id: i64) -> Result<(), EngineError> {
        Ok(candidates::reject_pairing(&self.pool, candidate_id).await?)
    }

    pub async fn pending_pairings(&self) -> Result<Vec<PairingCandidate>, EngineError> {
        Ok(candidates::fetch_pending_pairings(&self.pool).await?)
    }

    /// Runs the categorization pipeline for one staging row and persists the
    /// resulting pending candidates.
    pub async fn categorize_row(
        &self,
        staging_tx_id: i64,
    ) -> Result<Vec<CategorizationCandidate>, EngineError> {
        let row = staging::fetch_staging(&self.pool, staging_tx_id).await?;
        let mut suggestions = self.suggest_for_row(&row).await?;
        let ids =
            candidates::replace_categorization_for_row(&self.pool, row.id, &suggestions).await?;
        for (candidate, id) in suggestions.iter_mut().zip(ids) {
            candidate.id = Some(id);
        }
        Ok(suggestions)
    }

    async fn suggest_for_row(
        &self,
        row: &StagingRow,
    ) -> Result<Vec<CategorizationCandidate>, EngineError> {
        let linked = match row.linked_staging_id {
            Some(id) => Some(staging::fetch_staging(&self.pool, id).await?),
            None => None,
        };

        let budget = Duration::from_millis(self.config.collaborators.timeout_ms);
        let similar = match timeout(budget, self.similarity.similar(row)).await {
            Ok(Ok(similar)) => similar,
            Ok(Err(e)) => {
                warn!(staging_tx_id = row.id, error = %e, "similarity provider failed");
                Vec::new()
            }
            Err(_) => {
                warn!(staging_tx_id = row.id, "similarity provider timed out");
                Vec::new()
            }
        };

        let rules = self.rules_snapshot();
        let map = self.auto_accept.snapshot();
        let config = self.config.categorization.to_categorize_config();
        let categorizer = Categorizer::new(&rules, &map, self.scripts.as_ref(), &config);
        let mut out = categorizer.suggest(row, linked.as_ref(), &similar);

        let tied = tied_leaders(&out, config.tie_epsilon);
        if tied > 1 {
            let group: Vec<TiedCandidate> = out[..tied]
                .iter()
                .map(|c| TiedCandidate {
                    subcategory_id: c.subcategory_id,
                    confidence: c.confidence,
                    rule_tags: c.rule_tags.clone(),
                })
                .collect();
            match timeout(budget, self.tie_breaker.pick(row, &group)).await {
                Ok(Ok(pick)) => {
                    if !apply_tie_winner(&mut out, pick.subcategory_id, &pick.reasoning) {
                        warn!(
                            staging_tx_id = row.id,
                            subcategory_id = pick.subcategory_id,
                            "tie-breaker picked a non-candidate, keeping order"
                        );
                    }
                }
                Ok(Err(e)) => {
                    warn!(staging_tx_id = row.id, error = %e, "tie-breaker failed, keeping order");
                }
                Err(_) => {
                    warn!(staging_tx_id = row.id, "tie-breaker timed out, keeping order");
                }
            }
        }
        Ok(out)
    }

    /// Batch categorization over every uncategorized row, no progress
    /// reporting. A failing row is logged and the batch continues.
    pub async fn categorize_all(&self) -> Result<BatchSummary, EngineError> {
        let rows = staging::fetch_uncategorized(&self.pool).await?;
        let mut summary = BatchSummary::default();
        for row in &rows {
            match self.categorize_one(row).await {
                Ok(_) => summary.processed += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(staging_tx_id = row.id, error = %e, "categorization failed for row");
                }
            }
        }
        Ok(summary)
    }

    /// Batch categorization over every uncategorized row, streaming progress
    /// through `sender`. A closed receiver cancels the run between rows; a
    /// failing row is reported and the batch continues.
    pub async fn categorize_all_stream(
        &self,
        sender: &mpsc::Sender<CategorizationProgress>,
    ) -> Result<BatchSummary, EngineError> {
        let rows = staging::fetch_uncategorized(&self.pool).await?;
        let mut summary = BatchSummary::default();
        let _ = sender
            .send(CategorizationProgress::Started { total: rows.len() })
            .await;

        for (index, row) in rows.iter().enumerate() {
            if sender.is_closed() {
                summary.cancelled = true;
                break;
            }
            let event = match self.categorize_one(row).await {
                Ok(count) => {
                    summary.processed += 1;
                    CategorizationProgress::Row {
                        index,
                        staging_tx_id: row.id,
                        candidates: count,
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(staging_tx_id = row.id, error = %e, "categorization failed for row");
                    CategorizationProgress::RowFailed {
                        index,
                        staging_tx_id: row.id,
                        error: e.to_string(),
                    }
                }
            };
            if sender.send(event).await.is_err() {
                summary.cancelled = true;
                break;
            }
        }

        let _ = sender
            .send(CategorizationProgress::Finished {
                processed: summary.processed,
                failed: summary.failed,
                cancelled: summary.cancelled,
            })
            .await;
        info!(
            processed = summary.processed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "batch categorization finished"
        );
        Ok(summary)
    }

    async fn categorize_one(&self, row: &StagingRow) -> Result<usize, EngineError> {
        let suggestions = self.suggest_for_row(row).await?;
        candidates::replace_categorization_for_row(&self.pool, row.id, &suggestions).await?;
        Ok(suggestions.len())
    }

    /// Accepts a categorization candidate. An accepted auto-accept candidate
    /// bumps the merchant's usage statistics and persists the map.
    pub async fn confirm_categorization(
        &self,
        candidate_id: i64,
    ) -> Result<CategorizationCandidate, EngineError> {
        let winner = candidates::confirm_categorization(&self.pool, candidate_id).await?;
        if winner.rule_tags == AUTO_ACCEPT_TAG {
            if let Some(merchant) = winner.reasons.merchant.as_deref() {
                if self.auto_accept.record_match(merchant, Utc::now()) {
                    self.persist_auto_accept().await?;
                }
            }
        }
        Ok(winner)
    }

    pub async fn reject_categorization(&self, candidate_id: i64) -> Result<(), EngineError> {
        Ok(candidates::reject_categorization(&self.pool, candidate_id).await?)
    }

    pub async fn candidates_for_row(
        &self,
        staging_tx_id: i64,
    ) -> Result<Vec<CategorizationCandidate>, EngineError> {
        Ok(candidates::fetch_categorizations_for_row(&self.pool, staging_tx_id).await?)
    }

    /// Manual override: assigns the subcategory directly and drops any
    /// pending suggestions for the row.
    pub async fn manual_categorize(
        &self,
        staging_tx_id: i64,
        subcategory_id: i64,
    ) -> Result<(), EngineError> {
        if !subcategory_exists(&self.pool, subcategory_id)
            .await
            .map_err(StorageError::from)?
        {
            return Err(EngineError::Validation(format!(
                "unknown subcategory {subcategory_id}"
            )));
        }
        staging::set_manual_category(&self.pool, staging_tx_id, subcategory_id).await?;
        candidates::reject_pending_for_row(&self.pool, staging_tx_id).await?;
        Ok(())
    }

    pub async fn commit_all(&self) -> Result<CommitReport, EngineError> {
        Ok(commit::commit_all(&self.pool).await?)
    }

    pub async fn reconcile_balance(
        &self,
        account_id: AccountId,
        target_date: NaiveDate,
        target_balance_cents: i64,
    ) -> Result<ReconcileReport, EngineError> {
        Ok(accounts::reconcile_balance(&self.pool, account_id, target_date, target_balance_cents)
            .await?)
    }

    pub async fn recalculate_balance(
        &self,
        account_id: AccountId,
    ) -> Result<RecalculateReport, EngineError> {
        Ok(accounts::recalculate_balance(&self.pool, account_id).await?)
    }

    pub async fn recalculate_all_balances(&self) -> Result<Vec<RecalculateReport>, EngineError> {
        Ok(accounts::recalculate_all(&self.pool).await?)
    }

    pub async fn balance_at_date(
        &self,
        account_id: AccountId,
        date: NaiveDate,
    ) -> Result<BalanceAtDate, EngineError> {
        Ok(accounts::balance_at_date(&self.pool, account_id, date).await?)
    }
}
