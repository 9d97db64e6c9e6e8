pub mod accounts;
pub mod candidates;
pub mod commit;
pub mod db;
pub mod error;
pub mod staging;

pub use accounts::{BalanceAtDate, ReconcileReport, RecalculateReport};
pub use commit::{CommitReport, CommittedRow};
pub use db::{create_db, DbPool};
pub use error::StorageError;
pub use staging::NewStagingRow;
