use std::collections::HashMap;

use centime_core::{
    CategorizationCandidate, CategorizationReasons, SimilarTransaction, StagingRow,
    AUTO_ACCEPT_TAG,
};

use crate::auto_accept::AutoAcceptMap;
use crate::rules::{RuleSet, ScriptPredicate, TxView};

#[derive(Debug, Clone)]
pub struct CategorizeConfig {
    /// Candidates kept per staging row.
    pub top_k: usize,
    pub min_confidence: f64,
    /// Leading candidates within this margin of the best are a tie.
    pub tie_epsilon: f64,
}

impl Default for CategorizeConfig {
    fn default() -> Self {
        CategorizeConfig {
            top_k: 3,
            min_confidence: 0.3,
            tie_epsilon: 0.05,
        }
    }
}

/// Weak-evidence confidence cap for candidates built purely from similar
/// past transactions.
const SIMILARITY_CONFIDENCE_CAP: f64 = 0.6;

/// Rule accumulation per target subcategory before candidates are built.
struct MergedMatch {
    confidence: f64,
    priority: i32,
    rule_names: Vec<String>,
}

/// Suggests subcategories for one staging row. Pipeline order: auto-accept
/// fast path, rule evaluation with per-subcategory merge, similarity
/// fallback. Tie-breaking between near-equal leaders happens in the caller
/// (it needs the external collaborator); `tied_leaders` reports the group.
pub struct Categorizer<'a> {
    rules: &'a RuleSet,
    auto_accept: &'a AutoAcceptMap,
    scripts: &'a dyn ScriptPredicate,
    config: &'a CategorizeConfig,
}

impl<'a> Categorizer<'a> {
    pub fn new(
        rules: &'a RuleSet,
        auto_accept: &'a AutoAcceptMap,
        scripts: &'a dyn ScriptPredicate,
        config: &'a CategorizeConfig,
    ) -> Self {
        Categorizer {
            rules,
            auto_accept,
            scripts,
            config,
        }
    }

    /// An empty result is the signal for "needs manual categorization",
    /// never an error.
    pub fn suggest(
        &self,
        row: &StagingRow,
        linked: Option<&StagingRow>,
        similar: &[SimilarTransaction],
    ) -> Vec<CategorizationCandidate> {
        if let Some(entry) = self.auto_accept.lookup(&row.description) {
            // Fast path bypasses rules entirely: one candidate, full
            // confidence. Stats are bumped on confirmation, not here.
            return vec![CategorizationCandidate {
                id: None,
                staging_tx_id: row.id,
                subcategory_id: entry.subcategory_id,
                score: 1.0,
                confidence: 1.0,
                reasons: CategorizationReasons {
                    source: AUTO_ACCEPT_TAG.to_string(),
                    merchant: Some(entry.merchant.clone()),
                    flow_direction: Some(flow_direction(row)),
                    ..CategorizationReasons::default()
                },
                rule_tags: AUTO_ACCEPT_TAG.to_string(),
                preselected: true,
                decision: None,
                decided_at: None,
            }];
        }

        let tx = TxView::from(row);
        let linked_view = linked.map(TxView::from);
        let hits = self
            .rules
            .matches(&tx, linked_view.as_ref(), self.scripts);

        // Rules targeting the same subcategory merge into one candidate:
        // max confidence, union of names.
        let mut merged: HashMap<i64, MergedMatch> = HashMap::new();
        for hit in &hits {
            let rule = hit.rule;
            let entry = merged.entry(rule.subcategory_id).or_insert(MergedMatch {
                confidence: rule.confidence,
                priority: rule.priority,
                rule_names: Vec::new(),
            });
            entry.confidence = entry.confidence.max(rule.confidence);
            entry.priority = entry.priority.max(rule.priority);
            entry.rule_names.push(rule.name.clone());
        }

        let mut candidates: Vec<(i32, CategorizationCandidate)> = merged
            .into_iter()
            .map(|(subcategory_id, m)| {
                let candidate = CategorizationCandidate {
                    id: None,
                    staging_tx_id: row.id,
                    subcategory_id,
                    score: m.confidence,
                    confidence: m.confidence,
                    reasons: CategorizationReasons {
                        source: "RULES".to_string(),
                        merged_from: m.rule_names.len() as u32,
                        rule_names: m.rule_names.clone(),
                        similar_transactions_list: similar.to_vec(),
                        flow_direction: Some(flow_direction(row)),
                        ..CategorizationReasons::default()
                    },
                    rule_tags: m.rule_names.join(","),
                    preselected: false,
                    decision: None,
                    decided_at: None,
                };
                (m.priority, candidate)
            })
            .collect();

        // Similarity evidence only drives the outcome when no rule matched.
        if candidates.is_empty() {
            if let Some(candidate) = self.similarity_candidate(row, similar) {
                candidates.push((0, candidate));
            }
        }

        // Deterministic order: confidence, then rule priority, then
        // subcategory id. This is also the tie-breaker fallback order.
        candidates.sort_by(|(pa, a), (pb, b)| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(pb.cmp(pa))
                .then(a.subcategory_id.cmp(&b.subcategory_id))
        });

        let mut out: Vec<CategorizationCandidate> = candidates
            .into_iter()
            .map(|(_, c)| c)
            .filter(|c| c.confidence >= self.config.min_confidence)
            .take(self.config.top_k)
            .collect();
        if let Some(best) = out.first_mut() {
            best.preselected = true;
        }
        out
    }

    fn similarity_candidate(
        &self,
        row: &StagingRow,
        similar: &[SimilarTransaction],
    ) -> Option<CategorizationCandidate> {
        if similar.is_empty() {
            return None;
        }
        let mut votes: HashMap<i64, usize> = HashMap::new();
        for s in similar {
            *votes.entry(s.subcategory_id).or_default() += 1;
        }
        let (subcategory_id, count) = votes
            .into_iter()
            .max_by_key(|(id, count)| (*count, std::cmp::Reverse(*id)))?;
        let confidence = SIMILARITY_CONFIDENCE_CAP * count as f64 / similar.len() as f64;

        Some(CategorizationCandidate {
            id: None,
            staging_tx_id: row.id,
            subcategory_id,
            score: confidence,
            confidence,
            reasons: CategorizationReasons {
                source: "SIMILARITY".to_string(),
                similar_transactions_list: similar.to_vec(),
                flow_direction: Some(flow_direction(row)),
                ..CategorizationReasons::default()
            },
            rule_tags: String::new(),
            preselected: false,
            decision: None,
            decided_at: None,
        })
    }
}

fn flow_direction(row: &StagingRow) -> String {
    if row.is_debit() { "OUT" } else { "IN" }.to_string()
}

/// Number of leading candidates whose confidence sits within `epsilon` of
/// the best. A return greater than 1 calls for the tie-breaker collaborator.
pub fn tied_leaders(candidates: &[CategorizationCandidate], epsilon: f64) -> usize {
    let Some(best) = candidates.first() else {
        return 0;
    };
    candidates
        .iter()
        .take_while(|c| (best.confidence - c.confidence) <= epsilon)
        .count()
}

/// Applies an external tie-break pick: the winner moves to the front, keeps
/// `preselected`, and carries the collaborator's reasoning.
pub fn apply_tie_winner(
    candidates: &mut [CategorizationCandidate],
    winner_subcategory_id: i64,
    reasoning: &str,
) -> bool {
    let Some(pos) = candidates
        .iter()
        .position(|c| c.subcategory_id == winner_subcategory_id)
    else {
        return false;
    };
    candidates[pos].reasons.tie_breaker_winner = true;
    candidates[pos].reasons.tie_breaker_reasoning = Some(reasoning.to_string());
    candidates[..=pos].rotate_right(1);
    for (i, c) in candidates.iter_mut().enumerate() {
        c.preselected = i == 0;
    }
    true
}
