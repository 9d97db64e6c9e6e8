use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use centime_core::StagingRow;

/// Maximum nesting of condition groups through `linked` criteria. Rules
/// deeper than this are rejected at load time.
pub const MAX_GROUP_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule '{rule}': {reason}")]
    Invalid { rule: String, reason: String },
    #[error("rule '{rule}': condition groups nested deeper than {MAX_GROUP_DEPTH} levels")]
    TooDeep { rule: String },
    #[error("failed to parse rule document: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script evaluation timed out")]
    Timeout,
    #[error("script evaluation failed: {0}")]
    Failed(String),
}

/// Sandboxed predicate collaborator for the `script` escape hatch.
/// Implementations own their execution bounds; the evaluator treats any
/// `Err` as a non-match.
pub trait ScriptPredicate: Send + Sync {
    fn eval(
        &self,
        source: &str,
        tx: &TxView<'_>,
        linked: Option<&TxView<'_>>,
    ) -> Result<bool, ScriptError>;
}

/// Default host with no script runtime: every script criterion is a non-match.
pub struct NoScripts;

impl ScriptPredicate for NoScripts {
    fn eval(&self, _: &str, _: &TxView<'_>, _: Option<&TxView<'_>>) -> Result<bool, ScriptError> {
        Ok(false)
    }
}

/// The evaluator's read-only view of a transaction.
#[derive(Debug, Clone, Copy)]
pub struct TxView<'a> {
    pub description: &'a str,
    pub amount_cents: i64,
    pub date: NaiveDate,
    pub account_number: &'a str,
}

impl<'a> From<&'a StagingRow> for TxView<'a> {
    fn from(row: &'a StagingRow) -> Self {
        TxView {
            description: &row.description,
            amount_cents: row.amount_cents,
            date: row.transaction_date,
            account_number: &row.account_number,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupOperator {
    #[default]
    And,
    Or,
}

/// A boolean combination of criteria. An empty `criteria` list is vacuously
/// true under AND and false under OR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub operator: GroupOperator,
    pub criteria: Vec<Criterion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeywordMode {
    Any,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Between,
    In,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmountCondition {
    pub op: CompareOp,
    #[serde(default)]
    pub value: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value2: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DateField {
    Date,
    DayOfMonth,
    Month,
    Quarter,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DateOperand {
    Number(i64),
    Date(NaiveDate),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateCondition {
    pub field: DateField,
    pub op: CompareOp,
    pub value: DateOperand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value2: Option<DateOperand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountMatchMode {
    Exact,
    Pattern,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlowDirection {
    In,
    Out,
    Both,
}

fn default_true() -> bool {
    true
}

/// Closed variant set of matchable conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Criterion {
    Keywords {
        mode: KeywordMode,
        values: Vec<String>,
        #[serde(default = "default_true")]
        case_insensitive: bool,
    },
    /// Conditions over `|amount|` in minor units, combined by `operator`.
    Amount {
        #[serde(default)]
        operator: GroupOperator,
        conditions: Vec<AmountCondition>,
    },
    Account {
        mode: AccountMatchMode,
        values: Vec<String>,
    },
    Flow {
        direction: FlowDirection,
    },
    Date {
        #[serde(default)]
        operator: GroupOperator,
        conditions: Vec<DateCondition>,
    },
    /// Nested group evaluated against the paired transaction.
    Linked {
        #[serde(default)]
        required: bool,
        group: ConditionGroup,
    },
    /// Opaque predicate delegated to the sandbox collaborator.
    Script {
        source: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub subcategory_id: i64,
    /// Tie-break between matching rules: higher evaluates first.
    #[serde(default)]
    pub priority: i32,
    /// Static confidence assigned to matches of this rule, in [0, 1].
    pub confidence: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub conditions: ConditionGroup,
}

#[derive(Debug, Clone)]
pub struct RuleMatch<'a> {
    pub rule: &'a Rule,
}

/// A validated rule collection, ordered by descending priority, with account
/// PATTERN regexes compiled once at construction.
pub struct RuleSet {
    rules: Vec<Rule>,
    patterns: HashMap<String, Regex>,
}

impl RuleSet {
    pub fn new(mut rules: Vec<Rule>) -> Result<Self, RuleError> {
        let mut patterns = HashMap::new();
        for rule in &rules {
            validate_rule(rule, &mut patterns)?;
        }
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(RuleSet { rules, patterns })
    }

    pub fn from_json(doc: &str) -> Result<Self, RuleError> {
        let rules: Vec<Rule> = serde_json::from_str(doc)?;
        Self::new(rules)
    }

    pub fn empty() -> Self {
        RuleSet {
            rules: Vec::new(),
            patterns: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// All enabled rules matching the transaction, in descending priority
    /// order.
    pub fn matches<'a>(
        &'a self,
        tx: &TxView<'_>,
        linked: Option<&TxView<'_>>,
        scripts: &dyn ScriptPredicate,
    ) -> Vec<RuleMatch<'a>> {
        self.rules
            .iter()
            .filter(|r| r.enabled)
            .filter(|r| self.eval_group(&r.conditions, tx, linked, scripts, 0))
            .map(|rule| RuleMatch { rule })
            .collect()
    }

    pub fn evaluate(
        &self,
        rule: &Rule,
        tx: &TxView<'_>,
        linked: Option<&TxView<'_>>,
        scripts: &dyn ScriptPredicate,
    ) -> bool {
        rule.enabled && self.eval_group(&rule.conditions, tx, linked, scripts, 0)
    }

    fn eval_group(
        &self,
        group: &ConditionGroup,
        tx: &TxView<'_>,
        linked: Option<&TxView<'_>>,
        scripts: &dyn ScriptPredicate,
        depth: usize,
    ) -> bool {
        if depth > MAX_GROUP_DEPTH {
            return false;
        }
        match group.operator {
            GroupOperator::And => group
                .criteria
                .iter()
                .all(|c| self.eval_criterion(c, tx, linked, scripts, depth)),
            GroupOperator::Or => group
                .criteria
                .iter()
                .any(|c| self.eval_criterion(c, tx, linked, scripts, depth)),
        }
    }

    fn eval_criterion(
        &self,
        criterion: &Criterion,
        tx: &TxView<'_>,
        linked: Option<&TxView<'_>>,
        scripts: &dyn ScriptPredicate,
        depth: usize,
    ) -> bool {
        match criterion {
            Criterion::Keywords {
                mode,
                values,
                case_insensitive,
            } => {
                let haystack = if *case_insensitive {
                    tx.description.to_lowercase()
                } else {
                    tx.description.to_string()
                };
                let hit = |v: &String| {
                    if *case_insensitive {
                        haystack.contains(&v.to_lowercase())
                    } else {
                        haystack.contains(v.as_str())
                    }
                };
                match mode {
                    KeywordMode::Any => values.iter().any(hit),
                    KeywordMode::All => values.iter().all(hit),
                }
            }
            Criterion::Amount {
                operator,
                conditions,
            } => {
                let magnitude = tx.amount_cents.abs();
                let check = |c: &AmountCondition| amount_condition_holds(c, magnitude);
                match operator {
                    GroupOperator::And => conditions.iter().all(check),
                    GroupOperator::Or => conditions.iter().any(check),
                }
            }
            Criterion::Account { mode, values } => match mode {
                AccountMatchMode::Exact | AccountMatchMode::In => {
                    values.iter().any(|v| v == tx.account_number)
                }
                AccountMatchMode::Pattern => values.iter().any(|p| {
                    self.patterns
                        .get(p)
                        .is_some_and(|re| re.is_match(tx.account_number))
                }),
            },
            Criterion::Flow { direction } => match direction {
                FlowDirection::In => tx.amount_cents > 0,
                FlowDirection::Out => tx.amount_cents < 0,
                FlowDirection::Both => true,
            },
            Criterion::Date {
                operator,
                conditions,
            } => {
                let check = |c: &DateCondition| date_condition_holds(c, tx.date);
                match operator {
                    GroupOperator::And => conditions.iter().all(check),
                    GroupOperator::Or => conditions.iter().any(check),
                }
            }
            Criterion::Linked { required, group } => match linked {
                // The nested group sees the paired row; its own `linked`
                // criteria refer back to this row.
                Some(other) => self.eval_group(group, other, Some(tx), scripts, depth + 1),
                None => !required,
            },
            Criterion::Script { source } => match scripts.eval(source, tx, linked) {
                Ok(hit) => hit,
                Err(e) => {
                    tracing::warn!("script predicate degraded to non-match: {e}");
                    false
                }
            },
        }
    }
}

fn amount_condition_holds(c: &AmountCondition, magnitude: i64) -> bool {
    match c.op {
        CompareOp::Eq => magnitude == c.value,
        CompareOp::Ne => magnitude != c.value,
        CompareOp::Lt => magnitude < c.value,
        CompareOp::Gt => magnitude > c.value,
        CompareOp::Le => magnitude <= c.value,
        CompareOp::Ge => magnitude >= c.value,
        CompareOp::Between => {
            let hi = c.value2.unwrap_or(c.value);
            magnitude >= c.value && magnitude <= hi
        }
        CompareOp::In => c.values.contains(&magnitude),
    }
}

fn date_condition_holds(c: &DateCondition, date: NaiveDate) -> bool {
    match c.field {
        DateField::Date => {
            let DateOperand::Date(value) = c.value else {
                return false;
            };
            let value2 = match c.value2 {
                Some(DateOperand::Date(d)) => Some(d),
                _ => None,
            };
            compare(date, value, value2, c.op)
        }
        DateField::DayOfMonth => derived_holds(c, i64::from(date.day())),
        DateField::Month => derived_holds(c, i64::from(date.month())),
        DateField::Quarter => derived_holds(c, i64::from((date.month() - 1) / 3 + 1)),
    }
}

fn derived_holds(c: &DateCondition, actual: i64) -> bool {
    let DateOperand::Number(value) = c.value else {
        return false;
    };
    let value2 = match c.value2 {
        Some(DateOperand::Number(n)) => Some(n),
        _ => None,
    };
    compare(actual, value, value2, c.op)
}

fn compare<T: PartialOrd + Copy>(actual: T, value: T, value2: Option<T>, op: CompareOp) -> bool {
    match op {
        CompareOp::Eq => actual == value,
        CompareOp::Ne => actual != value,
        CompareOp::Lt => actual < value,
        CompareOp::Gt => actual > value,
        CompareOp::Le => actual <= value,
        CompareOp::Ge => actual >= value,
        CompareOp::Between => {
            let hi = value2.unwrap_or(value);
            actual >= value && actual <= hi
        }
        // IN over dates is rejected at validation.
        CompareOp::In => false,
    }
}

fn validate_rule(rule: &Rule, patterns: &mut HashMap<String, Regex>) -> Result<(), RuleError> {
    let invalid = |reason: String| RuleError::Invalid {
        rule: rule.name.clone(),
        reason,
    };

    if !(0.0..=1.0).contains(&rule.confidence) {
        return Err(invalid(format!(
            "confidence {} outside [0, 1]",
            rule.confidence
        )));
    }

    validate_group(rule, &rule.conditions, patterns, 0)
}

fn validate_group(
    rule: &Rule,
    group: &ConditionGroup,
    patterns: &mut HashMap<String, Regex>,
    depth: usize,
) -> Result<(), RuleError> {
    if depth > MAX_GROUP_DEPTH {
        return Err(RuleError::TooDeep {
            rule: rule.name.clone(),
        });
    }

    let invalid = |reason: String| RuleError::Invalid {
        rule: rule.name.clone(),
        reason,
    };

    for criterion in &group.criteria {
        match criterion {
            Criterion::Keywords { values, .. } => {
                if values.is_empty() || values.iter().any(|v| v.trim().is_empty()) {
                    return Err(invalid("keywords criterion with empty values".to_string()));
                }
            }
            Criterion::Amount { conditions, .. } => {
                if conditions.is_empty() {
                    return Err(invalid("amount criterion without conditions".to_string()));
                }
                for c in conditions {
                    if c.op == CompareOp::Between && c.value2.is_none() {
                        return Err(invalid("amount BETWEEN requires value2".to_string()));
                    }
                    if c.op == CompareOp::In && c.values.is_empty() {
                        return Err(invalid("amount IN requires a value list".to_string()));
                    }
                }
            }
            Criterion::Account { mode, values } => {
                if values.is_empty() {
                    return Err(invalid("account criterion without values".to_string()));
                }
                if *mode == AccountMatchMode::Pattern {
                    for p in values {
                        if !patterns.contains_key(p) {
                            let re = Regex::new(p).map_err(|e| {
                                invalid(format!("invalid account pattern '{p}': {e}"))
                            })?;
                            patterns.insert(p.clone(), re);
                        }
                    }
                }
            }
            Criterion::Flow { .. } => {}
            Criterion::Date { conditions, .. } => {
                if conditions.is_empty() {
                    return Err(invalid("date criterion without conditions".to_string()));
                }
                for c in conditions {
                    if c.op == CompareOp::In {
                        return Err(invalid("IN is not supported for date criteria".to_string()));
                    }
                    if c.op == CompareOp::Between && c.value2.is_none() {
                        return Err(invalid("date BETWEEN requires value2".to_string()));
                    }
                    let operand_fits = match c.field {
                        DateField::Date => matches!(c.value, DateOperand::Date(_)),
                        _ => matches!(c.value, DateOperand::Number(_)),
                    };
                    if !operand_fits {
                        return Err(invalid(format!(
                            "date operand does not fit field {:?}",
                            c.field
                        )));
                    }
                }
            }
            Criterion::Linked { group, .. } => {
                validate_group(rule, group, patterns, depth + 1)?;
            }
            Criterion::Script { source } => {
                if source.trim().is_empty() {
                    return Err(invalid("script criterion with empty source".to_string()));
                }
            }
        }
    }

    Ok(())
}
