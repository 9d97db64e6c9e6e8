use centime_core::{SimilarTransaction, StagingRow};
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("collaborator call failed: {0}")]
    Failed(String),
}

/// One of the near-equal leading candidates handed to the tie-breaker.
#[derive(Debug, Clone)]
pub struct TiedCandidate {
    pub subcategory_id: i64,
    pub confidence: f64,
    pub rule_tags: String,
}

/// Tie-breaker verdict: which subcategory wins and why.
#[derive(Debug, Clone)]
pub struct TieBreakPick {
    pub subcategory_id: i64,
    pub reasoning: String,
}

/// Supplies similar past transactions as weak categorization evidence.
/// Failures and timeouts degrade to "no evidence", never to an error.
pub trait SimilarityProvider: Send + Sync {
    fn similar(
        &self,
        row: &StagingRow,
    ) -> impl Future<Output = Result<Vec<SimilarTransaction>, CollabError>> + Send;
}

/// Picks a winner among near-equal candidates. Failures and timeouts leave
/// the deterministic order untouched.
pub trait TieBreaker: Send + Sync {
    fn pick(
        &self,
        row: &StagingRow,
        tied: &[TiedCandidate],
    ) -> impl Future<Output = Result<TieBreakPick, CollabError>> + Send;
}

/// Null collaborator: no similarity evidence.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSimilarity;

impl SimilarityProvider for NoSimilarity {
    async fn similar(&self, _row: &StagingRow) -> Result<Vec<SimilarTransaction>, CollabError> {
        Ok(Vec::new())
    }
}

/// Null collaborator: ties keep the deterministic order.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTieBreaker;

impl TieBreaker for NoTieBreaker {
    async fn pick(
        &self,
        _row: &StagingRow,
        _tied: &[TiedCandidate],
    ) -> Result<TieBreakPick, CollabError> {
        Err(CollabError::Failed("no tie-breaker configured".to_string()))
    }
}
