pub mod auto_accept;
pub mod categorize;
pub mod pairing;
pub mod rules;
pub mod score;

pub use auto_accept::{AutoAcceptEntry, AutoAcceptMap, AutoAcceptStore};
pub use categorize::{apply_tie_winner, tied_leaders, CategorizeConfig, Categorizer};
pub use pairing::{PairingConfig, PairingMatcher};
pub use rules::{
    ConditionGroup, Criterion, GroupOperator, NoScripts, Rule, RuleError, RuleSet, ScriptError,
    ScriptPredicate, TxView,
};
pub use score::ScoreWeights;
