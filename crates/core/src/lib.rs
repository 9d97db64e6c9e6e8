pub mod account;
pub mod candidate;
pub mod error;
pub mod money;
pub mod staging;
pub mod transaction;

pub use account::{Account, AccountId};
pub use candidate::{
    CategorizationCandidate, CategorizationReasons, Decision, PairingCandidate, PairingReasons,
    SimilarTransaction, AUTO_ACCEPT_TAG,
};
pub use error::ParseError;
pub use money::Money;
pub use staging::{StagingRow, StagingStatus};
pub use transaction::{LedgerTransaction, TransactionType};
