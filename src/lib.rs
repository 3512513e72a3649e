//! # minibank-ledger
//!
//! The ledger engine of a core banking system: per-account balances plus an
//! immutable log of every deposit, withdrawal and transfer that changed them.
//!
//! Every mutation is expressed as an [`ExecutionPlan`] and handed to a
//! [`LedgerAdapter`], which locks the touched accounts in ascending id order,
//! re-reads their balances, applies the plan and writes balances and the
//! transaction record in one atomic unit. Money is never created or
//! destroyed: a transfer moves exactly what it debits, and no balance ever
//! goes negative.
//!
//! ```rust
//! use std::sync::Arc;
//! use minibank_ledger::{Currency, Ledger, NewAccount, adapters::MemoryAdapter, dispatch::SideEffectDispatcher};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ledger = Ledger::new(Arc::new(MemoryAdapter::new()), SideEffectDispatcher::logging());
//!     let acc = ledger.open_account(NewAccount::new("user-1", Currency::new("ZAR")?)).await?;
//!     ledger.deposit(&acc.account_number, "500.00".parse::<Decimal>()?, "salary").await?;
//!     assert_eq!(ledger.get_balance(&acc.account_number).await?.to_string(), "500.00");
//!     ledger.dispatcher().close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature flags
//!
//! | Flag       | Default | Description                 |
//! |------------|---------|-----------------------------|
//! | `postgres` | ✓       | PostgreSQL adapter via sqlx |

pub mod account;
pub mod account_number;
pub mod adapters;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod ledger;
pub mod money;
pub mod plan;
pub mod telemetry;
pub mod transaction;

pub use account::{Account, AccountType, NewAccount};
pub use account_number::AccountNumberGenerator;
pub use config::LedgerConfig;
pub use error::{AccountRole, ErrorCategory, LedgerError, LedgerResult};
pub use history::History;
pub use ledger::Ledger;
pub use money::{Amount, Currency};
pub use plan::{ExecutionPlan, PlanOutcome, Posting};
pub use transaction::{DateRange, HistoryCursor, Transaction, TransactionKind, TransactionStatus};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use std::time::Duration;
use uuid::Uuid;

pub(crate) fn hash_idempotency_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// Current time at the precision Postgres stores (microseconds), so records
/// compare equal before and after a round trip.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Persistence of account records.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert a new account. Fails with `DuplicateAccountNumber` if the
    /// number is taken, re-verifying uniqueness at the storage layer.
    async fn insert_account(&self, account: &Account) -> Result<(), LedgerError>;

    async fn account_by_number(&self, account_number: &str) -> Result<Option<Account>, LedgerError>;
    async fn account_by_id(&self, id: Uuid) -> Result<Option<Account>, LedgerError>;
    async fn account_number_exists(&self, account_number: &str) -> Result<bool, LedgerError>;

    /// Newest first.
    async fn accounts_for_owner(&self, owner_id: &str) -> Result<Vec<Account>, LedgerError>;

    async fn set_account_active(
        &self,
        account_number: &str,
        active: bool,
    ) -> Result<Account, LedgerError>;
}

/// Append-only transaction records.
#[async_trait]
pub trait TransactionLog: Send + Sync {
    async fn transaction(&self, id: Uuid) -> Result<Transaction, LedgerError>;

    async fn transaction_by_idempotency_key(
        &self,
        hashed_key: &str,
    ) -> Result<Option<Transaction>, LedgerError>;

    /// One page of an account's transactions, newest first, strictly after `after`.
    async fn transactions_for_account(
        &self,
        account: Uuid,
        range: Option<&DateRange>,
        after: Option<&HistoryCursor>,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError>;

    /// Compare-and-set on status. The only mutation a recorded transaction allows.
    async fn update_transaction_status(
        &self,
        id: Uuid,
        expected: TransactionStatus,
        next: TransactionStatus,
    ) -> Result<Transaction, LedgerError>;
}

/// Storage backend of the ledger.
#[async_trait]
pub trait LedgerAdapter: AccountStore + TransactionLog {
    /// Execute the plan atomically.
    /// Implementors MUST:
    /// 1. BEGIN a unit of work
    /// 2. Lock every account in `plan.lock_order()`, in that order, giving up
    ///    with `Contention` once `lock_timeout` has elapsed
    /// 3. Return `Replayed` if the plan's idempotency key is already recorded
    /// 4. Re-read the locked accounts and run `plan.apply_to`
    /// 5. Write the balances and insert `plan.transaction()`
    /// 6. COMMIT on success, ROLLBACK on any error
    async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        lock_timeout: Duration,
    ) -> Result<PlanOutcome, LedgerError>;
}
