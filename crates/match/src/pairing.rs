use std::collections::HashMap;

use centime_core::{PairingCandidate, PairingReasons, StagingRow};

use crate::rules::{RuleSet, ScriptPredicate, TxView};
use crate::score::{
    self, ScoreWeights, DEFAULT_KEYWORD_BONUS, DEFAULT_RULE_BONUS,
};

#[derive(Debug, Clone)]
pub struct PairingConfig {
    pub date_window_days: i64,
    pub amount_tolerance_cents: i64,
    pub min_score: f64,
    /// Candidates kept per debit row.
    pub top_k: usize,
    /// Keywords that, present on both legs, earn `keyword_bonus`.
    pub transfer_keywords: Vec<String>,
    pub weights: ScoreWeights,
    pub keyword_bonus: f64,
    pub rule_bonus: f64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        PairingConfig {
            date_window_days: 3,
            amount_tolerance_cents: 200,
            min_score: 0.55,
            top_k: 5,
            transfer_keywords: vec!["transfer".to_string(), "tfr".to_string()],
            weights: ScoreWeights::default(),
            keyword_bonus: DEFAULT_KEYWORD_BONUS,
            rule_bonus: DEFAULT_RULE_BONUS,
        }
    }
}

/// Generates ranked transfer candidates between unpaired debit and credit
/// staging rows. Pure: reads rows, emits candidates, mutates nothing.
pub struct PairingMatcher<'a> {
    config: &'a PairingConfig,
    /// account number → owner, for the account-relation score.
    owners: &'a HashMap<String, String>,
    /// Optional pairing rules; a rule matching the debit leg with the credit
    /// leg linked earns `rule_bonus` and is surfaced in the reasons.
    transfer_rules: Option<&'a RuleSet>,
    scripts: &'a dyn ScriptPredicate,
}

impl<'a> PairingMatcher<'a> {
    pub fn new(
        config: &'a PairingConfig,
        owners: &'a HashMap<String, String>,
        transfer_rules: Option<&'a RuleSet>,
        scripts: &'a dyn ScriptPredicate,
    ) -> Self {
        PairingMatcher {
            config,
            owners,
            transfer_rules,
            scripts,
        }
    }

    /// For every unpaired debit row, at most `top_k` candidates with
    /// `score >= min_score`, best first, the best marked preselected.
    pub fn suggest(&self, rows: &[StagingRow]) -> Vec<PairingCandidate> {
        let debits: Vec<&StagingRow> = rows
            .iter()
            .filter(|r| r.is_unpaired() && r.is_debit())
            .collect();
        let credits: Vec<&StagingRow> = rows
            .iter()
            .filter(|r| r.is_unpaired() && r.is_credit())
            .collect();

        let mut out = Vec::new();
        for debit in &debits {
            let mut ranked: Vec<PairingCandidate> = credits
                .iter()
                .filter(|credit| self.prefilter(debit, credit))
                .filter_map(|credit| self.score_pair(debit, credit))
                .filter(|c| c.score >= self.config.min_score)
                .collect();

            ranked.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.right_id.cmp(&b.right_id))
            });
            ranked.truncate(self.config.top_k);
            if let Some(best) = ranked.first_mut() {
                best.preselected = true;
            }
            out.extend(ranked);
        }
        out
    }

    /// Cheap bounds applied before any scoring: opposite legs of a transfer
    /// sit on different accounts, within the date window and amount tolerance.
    fn prefilter(&self, debit: &StagingRow, credit: &StagingRow) -> bool {
        if debit.account_number == credit.account_number {
            return false;
        }
        let days = (credit.transaction_date - debit.transaction_date)
            .num_days()
            .abs();
        if days > self.config.date_window_days {
            return false;
        }
        let diff = (debit.amount_cents.abs() - credit.amount_cents).abs();
        diff <= self.config.amount_tolerance_cents
    }

    fn score_pair(&self, debit: &StagingRow, credit: &StagingRow) -> Option<PairingCandidate> {
        let amt_diff_cents = (debit.amount_cents.abs() - credit.amount_cents).abs();
        let days = (credit.transaction_date - debit.transaction_date)
            .num_days()
            .abs();

        let amount_score = score::amount_score(amt_diff_cents, self.config.amount_tolerance_cents);
        let date_score = score::date_score(days, self.config.date_window_days);
        let desc_score = score::description_similarity(&debit.description, &credit.description);
        let account_relation = score::account_relation_score(
            &debit.account_number,
            &credit.account_number,
            self.owners,
        );

        let keyword_bonus = if self.keyword_on_both_legs(debit, credit) {
            self.config.keyword_bonus
        } else {
            0.0
        };

        let mut rule_bonus = 0.0;
        let mut rule_id = None;
        let mut rule_name = None;
        if let Some(rules) = self.transfer_rules {
            let left = TxView::from(debit);
            let right = TxView::from(credit);
            if let Some(hit) = rules.matches(&left, Some(&right), self.scripts).first() {
                rule_bonus = self.config.rule_bonus;
                rule_id = Some(hit.rule.id.clone());
                rule_name = Some(hit.rule.name.clone());
            }
        }

        let score = score::composite(
            &self.config.weights,
            amount_score,
            date_score,
            desc_score,
            account_relation,
            keyword_bonus + rule_bonus,
        );

        Some(PairingCandidate {
            id: None,
            left_id: debit.id,
            right_id: credit.id,
            score,
            reasons: PairingReasons {
                amount_score,
                date_score,
                desc_score,
                account_relation,
                keyword_bonus,
                rule_bonus,
                amt_diff_cents,
                days,
                rule_id,
                rule_name,
            },
            preselected: false,
            decision: None,
            decided_at: None,
        })
    }

    fn keyword_on_both_legs(&self, debit: &StagingRow, credit: &StagingRow) -> bool {
        let left = debit.description.to_lowercase();
        let right = credit.description.to_lowercase();
        self.config
            .transfer_keywords
            .iter()
            .any(|k| left.contains(k.as_str()) && right.contains(k.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::NoScripts;
    use centime_core::{StagingRow, StagingStatus};
    use chrono::NaiveDate;

    fn row(id: i64, amount: i64, date: (i32, u32, u32), desc: &str, account: &str) -> StagingRow {
        StagingRow {
            id,
            external_id: None,
            description: desc.to_string(),
            amount_cents: amount,
            transaction_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            posted_date: None,
            account_number: account.to_string(),
            status: StagingStatus::Pending,
            linked_staging_id: None,
            transfer_group_id: None,
            categorized: false,
            mapped_subcategory_id: None,
            mapped_account_id: None,
            imported_transaction_id: None,
            imported_at: None,
        }
    }

    fn owners() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("111".to_string(), "kim".to_string());
        m.insert("222".to_string(), "kim".to_string());
        m
    }

    #[test]
    fn same_owner_transfer_scores_high_and_preselects() {
        let config = PairingConfig::default();
        let owners = owners();
        let matcher = PairingMatcher::new(&config, &owners, None, &NoScripts);

        let rows = vec![
            row(1, -10_000, (2024, 1, 5), "INTERNET TRANSFER 771", "111"),
            row(2, 10_000, (2024, 1, 6), "INTERNET TRANSFER 771", "222"),
        ];
        let candidates = matcher.suggest(&rows);
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!((c.left_id, c.right_id), (1, 2));
        assert!(c.score >= 0.9, "score was {}", c.score);
        assert!(c.preselected);
        assert_eq!(c.reasons.days, 1);
        assert_eq!(c.reasons.amt_diff_cents, 0);
    }

    #[test]
    fn outside_date_window_is_not_scored() {
        let config = PairingConfig::default();
        let owners = owners();
        let matcher = PairingMatcher::new(&config, &owners, None, &NoScripts);
        let rows = vec![
            row(1, -10_000, (2024, 1, 5), "TRANSFER", "111"),
            row(2, 10_000, (2024, 1, 10), "TRANSFER", "222"),
        ];
        assert!(matcher.suggest(&rows).is_empty());
    }

    #[test]
    fn outside_amount_tolerance_is_not_scored() {
        let config = PairingConfig::default();
        let owners = owners();
        let matcher = PairingMatcher::new(&config, &owners, None, &NoScripts);
        let rows = vec![
            row(1, -10_000, (2024, 1, 5), "TRANSFER", "111"),
            row(2, 10_500, (2024, 1, 5), "TRANSFER", "222"),
        ];
        assert!(matcher.suggest(&rows).is_empty());
    }

    #[test]
    fn same_account_rows_never_pair() {
        let config = PairingConfig::default();
        let owners = owners();
        let matcher = PairingMatcher::new(&config, &owners, None, &NoScripts);
        let rows = vec![
            row(1, -10_000, (2024, 1, 5), "TRANSFER", "111"),
            row(2, 10_000, (2024, 1, 5), "TRANSFER", "111"),
        ];
        assert!(matcher.suggest(&rows).is_empty());
    }

    #[test]
    fn top_k_limits_candidates_per_debit() {
        let mut config = PairingConfig::default();
        config.top_k = 2;
        config.min_score = 0.0;
        let owners = owners();
        let matcher = PairingMatcher::new(&config, &owners, None, &NoScripts);

        let rows = vec![
            row(1, -10_000, (2024, 1, 5), "TRANSFER OUT", "111"),
            row(2, 10_000, (2024, 1, 5), "TRANSFER IN", "222"),
            row(3, 10_000, (2024, 1, 6), "TRANSFER IN", "222"),
            row(4, 10_050, (2024, 1, 7), "PAYMENT", "222"),
        ];
        let candidates = matcher.suggest(&rows);
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].score >= candidates[1].score);
        assert!(candidates[0].preselected);
        assert!(!candidates[1].preselected);
    }

    #[test]
    fn paired_and_imported_rows_are_excluded() {
        let config = PairingConfig::default();
        let owners = owners();
        let matcher = PairingMatcher::new(&config, &owners, None, &NoScripts);

        let mut linked = row(1, -10_000, (2024, 1, 5), "TRANSFER", "111");
        linked.linked_staging_id = Some(9);
        let mut imported = row(2, 10_000, (2024, 1, 5), "TRANSFER", "222");
        imported.status = StagingStatus::Imported;
        assert!(matcher.suggest(&[linked, imported]).is_empty());
    }

    #[test]
    fn pairing_rule_match_is_surfaced_not_folded() {
        let doc = r#"[{
            "id": "transfer-rule",
            "name": "Internal transfer",
            "subcategoryId": 99,
            "priority": 1,
            "confidence": 0.95,
            "conditions": {
                "operator": "AND",
                "criteria": [
                    { "type": "keywords", "mode": "ANY", "values": ["transfer"] },
                    { "type": "linked", "required": true, "group": {
                        "operator": "AND",
                        "criteria": [ { "type": "flow", "direction": "IN" } ]
                    } }
                ]
            }
        }]"#;
        let rules = RuleSet::from_json(doc).unwrap();
        let config = PairingConfig::default();
        let owners = owners();
        let matcher = PairingMatcher::new(&config, &owners, Some(&rules), &NoScripts);

        let rows = vec![
            row(1, -10_000, (2024, 1, 5), "TRANSFER TO SAVINGS", "111"),
            row(2, 10_000, (2024, 1, 5), "TRANSFER FROM CHEQUE", "222"),
        ];
        let candidates = matcher.suggest(&rows);
        assert_eq!(candidates.len(), 1);
        let r = &candidates[0].reasons;
        assert_eq!(r.rule_bonus, DEFAULT_RULE_BONUS);
        assert_eq!(r.rule_id.as_deref(), Some("transfer-rule"));
        assert_eq!(r.rule_name.as_deref(), Some("Internal transfer"));
    }
}
