use std::collections::HashMap;

/// Relative weight of each sub-score in the composite pairing score.
/// The weights sum to 1.0 so bonuses are the only way past a sub-score
/// ceiling; the composite is clamped to [0, 1] regardless.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub amount: f64,
    pub date: f64,
    pub desc: f64,
    pub account: f64,
}

pub const DEFAULT_WEIGHTS: ScoreWeights = ScoreWeights {
    amount: 0.4,
    date: 0.2,
    desc: 0.2,
    account: 0.2,
};

impl Default for ScoreWeights {
    fn default() -> Self {
        DEFAULT_WEIGHTS
    }
}

/// Additive bonus when a configured transfer keyword appears on both legs.
pub const DEFAULT_KEYWORD_BONUS: f64 = 0.10;
/// Additive bonus when a pairing rule matches the pair.
pub const DEFAULT_RULE_BONUS: f64 = 0.15;

/// Token similarity floor above which two description tokens are considered
/// the same word (absorbs store numbers and truncations).
const TOKEN_MATCH_THRESHOLD: f64 = 0.8;

/// `1 - min(1, |diff| / tolerance)`. Differences beyond the tolerance score
/// exactly zero; a zero tolerance demands an exact amount.
pub fn amount_score(diff_cents: i64, tolerance_cents: i64) -> f64 {
    let diff = diff_cents.abs();
    if tolerance_cents <= 0 {
        return if diff == 0 { 1.0 } else { 0.0 };
    }
    (1.0 - (diff as f64 / tolerance_cents as f64)).max(0.0)
}

/// Monotonically decreasing in day distance, zero beyond the window.
pub fn date_score(days_apart: i64, window_days: i64) -> f64 {
    let days = days_apart.abs();
    if days > window_days {
        return 0.0;
    }
    1.0 - (days as f64 / (window_days + 1) as f64)
}

/// Fuzzy token overlap (Dice coefficient over near-matching tokens):
/// identical descriptions score 1.0, token-disjoint descriptions score 0.0,
/// and the score grows with shared tokens.
pub fn description_similarity(a: &str, b: &str) -> f64 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    let matched_a = ta.iter().filter(|t| has_close_token(t, &tb)).count();
    let matched_b = tb.iter().filter(|t| has_close_token(t, &ta)).count();
    (matched_a + matched_b) as f64 / (ta.len() + tb.len()) as f64
}

/// 1.0 when both accounts map to the same owner, else 0.0.
pub fn account_relation_score(
    left_account: &str,
    right_account: &str,
    owners: &HashMap<String, String>,
) -> f64 {
    match (owners.get(left_account), owners.get(right_account)) {
        (Some(a), Some(b)) if a == b => 1.0,
        _ => 0.0,
    }
}

/// Weighted sum of the sub-scores plus bonuses, clamped to [0, 1].
pub fn composite(
    weights: &ScoreWeights,
    amount: f64,
    date: f64,
    desc: f64,
    account: f64,
    bonus: f64,
) -> f64 {
    let weighted = weights.amount * amount
        + weights.date * date
        + weights.desc * desc
        + weights.account * account;
    (weighted + bonus).clamp(0.0, 1.0)
}

fn tokenize(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn has_close_token(token: &str, others: &[String]) -> bool {
    others
        .iter()
        .any(|o| token_similarity(token, o) >= TOKEN_MATCH_THRESHOLD)
}

fn token_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

/// Two-row Levenshtein distance, shorter string on the inner loop.
fn levenshtein(s1: &str, s2: &str) -> usize {
    let a = s1.as_bytes();
    let b = s2.as_bytes();
    let (a, b) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let (m, n) = (a.len(), b.len());

    if m == 0 {
        return n;
    }

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_score_zero_beyond_tolerance() {
        // Property: for all tolerances t, |diff| > t scores exactly 0.
        for t in [1i64, 50, 200, 1000] {
            assert_eq!(amount_score(t + 1, t), 0.0, "tolerance {t}");
            assert_eq!(amount_score(-(t + 1), t), 0.0, "tolerance {t} negative");
            assert!(amount_score(t - 1, t) > 0.0);
        }
        assert_eq!(amount_score(0, 200), 1.0);
    }

    #[test]
    fn amount_score_zero_tolerance_demands_exact() {
        assert_eq!(amount_score(0, 0), 1.0);
        assert_eq!(amount_score(1, 0), 0.0);
    }

    #[test]
    fn date_score_zero_beyond_window_and_monotone_within() {
        assert_eq!(date_score(4, 3), 0.0);
        assert_eq!(date_score(-4, 3), 0.0);
        assert_eq!(date_score(0, 3), 1.0);
        assert!(date_score(1, 3) > date_score(2, 3));
        assert!(date_score(3, 3) > 0.0);
    }

    #[test]
    fn description_similarity_bounds() {
        assert_eq!(description_similarity("AMAZON AU", "AMAZON AU"), 1.0);
        assert_eq!(description_similarity("amazon au", "AMAZON  AU"), 1.0);
        assert_eq!(description_similarity("AMAZON", "STARBUCKS"), 0.0);
        assert_eq!(description_similarity("", ""), 1.0);
        assert_eq!(description_similarity("AMAZON", ""), 0.0);
    }

    #[test]
    fn description_similarity_grows_with_shared_tokens() {
        let one = description_similarity("TRANSFER TO SAVINGS", "TRANSFER FROM CHEQUE");
        let two = description_similarity("TRANSFER TO SAVINGS", "TRANSFER TO CHEQUE");
        assert!(two > one, "{two} vs {one}");
    }

    #[test]
    fn description_similarity_absorbs_store_numbers() {
        let s = description_similarity("WOOLWORTHS 1234", "WOOLWORTHS 9876");
        assert!(s >= 0.5, "{s}");
    }

    #[test]
    fn account_relation_same_owner_only() {
        let mut owners = HashMap::new();
        owners.insert("111".to_string(), "kim".to_string());
        owners.insert("222".to_string(), "kim".to_string());
        owners.insert("333".to_string(), "sam".to_string());
        assert_eq!(account_relation_score("111", "222", &owners), 1.0);
        assert_eq!(account_relation_score("111", "333", &owners), 0.0);
        assert_eq!(account_relation_score("111", "999", &owners), 0.0);
    }

    #[test]
    fn composite_is_clamped() {
        let w = DEFAULT_WEIGHTS;
        assert_eq!(composite(&w, 1.0, 1.0, 1.0, 1.0, 0.5), 1.0);
        assert_eq!(composite(&w, 0.0, 0.0, 0.0, 0.0, 0.0), 0.0);
        let mid = composite(&w, 1.0, 0.5, 0.5, 0.0, 0.0);
        assert!(mid > 0.0 && mid < 1.0);
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("cat", "cat"), 0);
        assert_eq!(levenshtein("cat", "bat"), 1);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("amzn", "amazon"), levenshtein("amazon", "amzn"));
    }
}
