use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapters::MemoryAdapter;
use crate::dispatch::{SideEffect, SideEffectDispatcher};
use crate::{
    Account, AccountNumberGenerator, AccountRole, Amount, Currency, DateRange, ExecutionPlan,
    History, LedgerAdapter, LedgerConfig, LedgerError, NewAccount, PlanOutcome, Transaction,
    TransactionKind, TransactionStatus, hash_idempotency_key,
};

/// The ledger engine.
///
/// Validates requests, turns them into [`ExecutionPlan`]s and hands those to
/// the adapter, which enforces balance rules under account locks. Checks made
/// here before the adapter call only exist to fail fast; they are repeated
/// under lock.
pub struct Ledger {
    adapter: Arc<dyn LedgerAdapter>,
    dispatcher: SideEffectDispatcher,
    numbers: AccountNumberGenerator,
    lock_timeout: Duration,
    history_page_size: usize,
    default_currency: Currency,
}

impl Ledger {
    pub fn new(adapter: Arc<dyn LedgerAdapter>, dispatcher: SideEffectDispatcher) -> Self {
        Self::with_config(adapter, dispatcher, &LedgerConfig::default())
    }

    pub fn with_config(
        adapter: Arc<dyn LedgerAdapter>,
        dispatcher: SideEffectDispatcher,
        config: &LedgerConfig,
    ) -> Self {
        Self {
            adapter,
            dispatcher,
            numbers: AccountNumberGenerator::from_config(config),
            lock_timeout: config.lock_timeout,
            history_page_size: config.history_page_size,
            default_currency: config.default_currency.clone(),
        }
    }

    /// Build a ledger on the store `config` points at: Postgres when
    /// `database_url` is set, the memory adapter otherwise.
    pub async fn connect(
        config: &LedgerConfig,
        dispatcher: SideEffectDispatcher,
    ) -> Result<Self, LedgerError> {
        let adapter: Arc<dyn LedgerAdapter> = match &config.database_url {
            None => Arc::new(MemoryAdapter::new()),
            #[cfg(feature = "postgres")]
            Some(_) => {
                let adapter = crate::adapters::PostgresAdapter::connect(config).await?;
                adapter.init_schema().await?;
                Arc::new(adapter)
            }
            #[cfg(not(feature = "postgres"))]
            Some(_) => {
                return Err(LedgerError::Unavailable(
                    "DATABASE_URL is set but postgres support is not compiled in".to_string(),
                ));
            }
        };
        Ok(Self::with_config(adapter, dispatcher, config))
    }

    pub fn adapter(&self) -> &Arc<dyn LedgerAdapter> {
        &self.adapter
    }

    pub fn dispatcher(&self) -> &SideEffectDispatcher {
        &self.dispatcher
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    // ---- accounts ----

    /// Open an account with a freshly generated number, zero balance, active.
    #[instrument(skip(self, request), fields(owner_id = %request.owner_id))]
    pub async fn open_account(&self, request: NewAccount) -> Result<Account, LedgerError> {
        for attempt in 1..=self.numbers.max_attempts() {
            let number = self.numbers.generate(self.adapter.as_ref()).await?;
            let account = Account::open(number, request.clone());

            match self.adapter.insert_account(&account).await {
                Ok(()) => {
                    info!(
                        account_number = %account.account_number,
                        currency = %account.currency,
                        account_type = %account.account_type,
                        "account opened"
                    );
                    return Ok(account);
                }
                Err(LedgerError::DuplicateAccountNumber(number)) => {
                    warn!(%number, attempt, "account number taken at insert, regenerating");
                }
                Err(e) => return Err(e),
            }
        }

        Err(LedgerError::DuplicateAccountNumber(format!(
            "gave up after {} attempts",
            self.numbers.max_attempts()
        )))
    }

    /// [`Ledger::open_account`] in the configured default currency.
    pub async fn open_default_account(
        &self,
        owner_id: impl Into<String>,
    ) -> Result<Account, LedgerError> {
        self.open_account(NewAccount::new(owner_id, self.default_currency.clone()))
            .await
    }

    pub async fn account(&self, account_number: &str) -> Result<Account, LedgerError> {
        self.resolve(AccountRole::Account, account_number).await
    }

    pub async fn accounts_for_owner(&self, owner_id: &str) -> Result<Vec<Account>, LedgerError> {
        self.adapter.accounts_for_owner(owner_id).await
    }

    #[instrument(skip(self))]
    pub async fn deactivate_account(&self, account_number: &str) -> Result<Account, LedgerError> {
        let account = self.adapter.set_account_active(account_number, false).await?;
        info!("account deactivated");
        Ok(account)
    }

    #[instrument(skip(self))]
    pub async fn reactivate_account(&self, account_number: &str) -> Result<Account, LedgerError> {
        let account = self.adapter.set_account_active(account_number, true).await?;
        info!("account reactivated");
        Ok(account)
    }

    // ---- money movement ----

    pub async fn deposit(
        &self,
        account_number: &str,
        amount: Decimal,
        description: &str,
    ) -> Result<Transaction, LedgerError> {
        self.deposit_with_key(account_number, amount, description, None)
            .await
    }

    /// Deposit at most once per `idempotency_key`. A retry with a key that
    /// already committed returns the original transaction unchanged.
    pub async fn deposit_idempotent(
        &self,
        account_number: &str,
        amount: Decimal,
        description: &str,
        idempotency_key: &str,
    ) -> Result<Transaction, LedgerError> {
        self.deposit_with_key(account_number, amount, description, Some(idempotency_key))
            .await
    }

    pub async fn withdraw(
        &self,
        account_number: &str,
        amount: Decimal,
        description: &str,
    ) -> Result<Transaction, LedgerError> {
        self.withdraw_with_key(account_number, amount, description, None)
            .await
    }

    pub async fn withdraw_idempotent(
        &self,
        account_number: &str,
        amount: Decimal,
        description: &str,
        idempotency_key: &str,
    ) -> Result<Transaction, LedgerError> {
        self.withdraw_with_key(account_number, amount, description, Some(idempotency_key))
            .await
    }

    pub async fn transfer(
        &self,
        from_account_number: &str,
        to_account_number: &str,
        amount: Decimal,
        description: &str,
    ) -> Result<Transaction, LedgerError> {
        self.transfer_with_key(from_account_number, to_account_number, amount, description, None)
            .await
    }

    pub async fn transfer_idempotent(
        &self,
        from_account_number: &str,
        to_account_number: &str,
        amount: Decimal,
        description: &str,
        idempotency_key: &str,
    ) -> Result<Transaction, LedgerError> {
        self.transfer_with_key(
            from_account_number,
            to_account_number,
            amount,
            description,
            Some(idempotency_key),
        )
        .await
    }

    #[instrument(skip(self, description, idempotency_key), fields(kind = "deposit"))]
    async fn deposit_with_key(
        &self,
        account_number: &str,
        amount: Decimal,
        description: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        let amount = Amount::new(amount)?;
        if let Some(existing) = self.replay(idempotency_key).await? {
            return Ok(existing);
        }

        let account = self.resolve(AccountRole::Account, account_number).await?;
        ensure_active(&account)?;

        let tx = Transaction::new(TransactionKind::Deposit, amount, account.id, account.id, description);
        let plan = ExecutionPlan::new(tx)
            .credit(account.id, amount)
            .idempotent(idempotency_key);
        self.execute(plan).await
    }

    #[instrument(skip(self, description, idempotency_key), fields(kind = "withdrawal"))]
    async fn withdraw_with_key(
        &self,
        account_number: &str,
        amount: Decimal,
        description: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        let amount = Amount::new(amount)?;
        if let Some(existing) = self.replay(idempotency_key).await? {
            return Ok(existing);
        }

        let account = self.resolve(AccountRole::Account, account_number).await?;
        ensure_active(&account)?;

        let tx = Transaction::new(
            TransactionKind::Withdrawal,
            amount,
            account.id,
            account.id,
            description,
        );
        let plan = ExecutionPlan::new(tx)
            .debit(account.id, amount)
            .idempotent(idempotency_key);
        self.execute(plan).await
    }

    #[instrument(skip(self, description, idempotency_key), fields(kind = "transfer"))]
    async fn transfer_with_key(
        &self,
        from_account_number: &str,
        to_account_number: &str,
        amount: Decimal,
        description: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        let amount = Amount::new(amount)?;
        if let Some(existing) = self.replay(idempotency_key).await? {
            return Ok(existing);
        }

        let source = self.resolve(AccountRole::Source, from_account_number).await?;
        let destination = self
            .resolve(AccountRole::Destination, to_account_number)
            .await?;
        if source.id == destination.id {
            return Err(LedgerError::SameAccountTransfer);
        }
        ensure_active(&source)?;
        ensure_active(&destination)?;
        if source.currency != destination.currency {
            return Err(LedgerError::CurrencyMismatch {
                source_currency: source.currency.to_string(),
                destination_currency: destination.currency.to_string(),
            });
        }

        let tx = Transaction::new(
            TransactionKind::Transfer,
            amount,
            source.id,
            destination.id,
            description,
        );
        let plan = ExecutionPlan::new(tx)
            .debit(source.id, amount)
            .credit(destination.id, amount)
            .idempotent(idempotency_key);
        self.execute(plan).await
    }

    // ---- queries ----

    pub async fn get_balance(&self, account_number: &str) -> Result<Decimal, LedgerError> {
        Ok(self
            .resolve(AccountRole::Account, account_number)
            .await?
            .balance)
    }

    /// Lazy newest-first view of an account's transactions, optionally
    /// limited to an inclusive date range.
    pub async fn history(
        &self,
        account_number: &str,
        range: Option<DateRange>,
    ) -> Result<History, LedgerError> {
        let account = self.resolve(AccountRole::Account, account_number).await?;
        Ok(History::new(
            Arc::clone(&self.adapter),
            account.id,
            range,
            self.history_page_size,
        ))
    }

    pub async fn transaction(&self, id: Uuid) -> Result<Transaction, LedgerError> {
        self.adapter.transaction(id).await
    }

    /// Move a pending transaction to its final status. Balances are untouched.
    #[instrument(skip(self))]
    pub async fn settle_transaction(
        &self,
        id: Uuid,
        next: TransactionStatus,
    ) -> Result<Transaction, LedgerError> {
        let current = self.adapter.transaction(id).await?;
        if !current.status.can_transition_to(next) {
            warn!(from = %current.status, to = %next, "status transition rejected");
            return Err(LedgerError::InvalidStatusTransition {
                from: current.status,
                to: next,
            });
        }

        let settled = self
            .adapter
            .update_transaction_status(id, current.status, next)
            .await?;
        info!(status = %settled.status, "transaction settled");
        Ok(settled)
    }

    // ---- internals ----

    async fn resolve(&self, role: AccountRole, account_number: &str) -> Result<Account, LedgerError> {
        self.adapter
            .account_by_number(account_number)
            .await?
            .ok_or_else(|| LedgerError::not_found(role, account_number))
    }

    /// Early exit for a retried idempotent call. The adapter repeats the
    /// check inside the atomic unit.
    async fn replay(&self, idempotency_key: Option<&str>) -> Result<Option<Transaction>, LedgerError> {
        let Some(key) = idempotency_key else {
            return Ok(None);
        };
        let existing = self
            .adapter
            .transaction_by_idempotency_key(&hash_idempotency_key(key))
            .await?;
        if let Some(tx) = &existing {
            info!(transaction = %tx.id, "idempotent replay");
            counter!("ledger.transactions.total",
                "kind" => tx.kind.as_str(),
                "status" => "replayed"
            )
            .increment(1);
        }
        Ok(existing)
    }

    async fn execute(&self, plan: ExecutionPlan) -> Result<Transaction, LedgerError> {
        let tx = plan.transaction();
        let kind = tx.kind.as_str();

        let result = self.adapter.execute_plan(&plan, self.lock_timeout).await;

        let status = match &result {
            Ok(PlanOutcome::Committed { .. }) => "committed",
            Ok(PlanOutcome::Replayed(_)) => "replayed",
            Err(_) => "failed",
        };
        counter!("ledger.transactions.total", "kind" => kind, "status" => status).increment(1);

        match result {
            Ok(PlanOutcome::Committed { accounts }) => {
                histogram!("ledger.transaction.amount", "kind" => kind)
                    .record(tx.amount.value().to_f64().unwrap_or_default());
                info!(
                    transaction = %tx.id,
                    kind,
                    amount = %tx.amount,
                    "transaction committed"
                );
                self.dispatcher
                    .dispatch_all(SideEffect::for_transaction(tx, &accounts));
                Ok(tx.clone())
            }
            Ok(PlanOutcome::Replayed(existing)) => {
                info!(transaction = %existing.id, "idempotent replay");
                Ok(existing)
            }
            Err(e) => {
                warn!(kind, error = %e, retriable = e.is_retriable(), "transaction rejected");
                Err(e)
            }
        }
    }
}

fn ensure_active(account: &Account) -> Result<(), LedgerError> {
    if account.is_active {
        Ok(())
    } else {
        Err(LedgerError::AccountInactive(account.account_number.clone()))
    }
}
