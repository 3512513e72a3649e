use crate::{
    Account, AccountStore, DateRange, ExecutionPlan, HistoryCursor, LedgerAdapter, LedgerError,
    PlanOutcome, Transaction, TransactionLog, TransactionStatus,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

#[derive(Default)]
struct MemoryStore {
    accounts: HashMap<Uuid, Account>,
    numbers: HashMap<String, Uuid>,
    transactions: Vec<Transaction>,
    transaction_index: HashMap<Uuid, usize>,
    idempotency_keys: HashMap<String, Uuid>,
}

impl MemoryStore {
    fn record(&mut self, transaction: Transaction) {
        if let Some(key) = &transaction.idempotency_key {
            self.idempotency_keys.insert(key.clone(), transaction.id);
        }
        self.transaction_index
            .insert(transaction.id, self.transactions.len());
        self.transactions.push(transaction);
    }

    fn transaction(&self, id: Uuid) -> Option<&Transaction> {
        self.transaction_index
            .get(&id)
            .and_then(|idx| self.transactions.get(*idx))
    }
}

/// In-process ledger store.
///
/// Balance state sits behind one `RwLock` that is only held for short,
/// synchronous reads and writes. Read-check-write exclusivity comes from the
/// per-account lock table, so operations on unrelated accounts never wait on
/// each other.
pub struct MemoryAdapter {
    store: RwLock<MemoryStore>,
    account_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(MemoryStore::default()),
            account_locks: Mutex::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStore>, LedgerError> {
        self.store
            .read()
            .map_err(|_| LedgerError::Unavailable("memory store poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStore>, LedgerError> {
        self.store
            .write()
            .map_err(|_| LedgerError::Unavailable("memory store poisoned".to_string()))
    }

    fn account_lock(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .account_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(id).or_default())
    }

    /// Lock `ids` in the order given, all within one `timeout` budget.
    pub(crate) async fn lock_accounts(
        &self,
        ids: &[Uuid],
        timeout: Duration,
    ) -> Result<Vec<OwnedMutexGuard<()>>, LedgerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut guards = Vec::with_capacity(ids.len());

        for id in ids {
            let lock = self.account_lock(*id);
            match tokio::time::timeout_at(deadline, lock.lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    tracing::debug!(account = %id, ?timeout, "account lock timed out");
                    return Err(LedgerError::Contention(format!(
                        "timed out after {timeout:?} waiting for account {id}"
                    )));
                }
            }
        }

        Ok(guards)
    }
}

#[async_trait]
impl AccountStore for MemoryAdapter {
    async fn insert_account(&self, account: &Account) -> Result<(), LedgerError> {
        let mut store = self.write()?;
        if store.numbers.contains_key(&account.account_number) {
            return Err(LedgerError::DuplicateAccountNumber(
                account.account_number.clone(),
            ));
        }
        store
            .numbers
            .insert(account.account_number.clone(), account.id);
        store.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn account_by_number(&self, account_number: &str) -> Result<Option<Account>, LedgerError> {
        let store = self.read()?;
        Ok(store
            .numbers
            .get(account_number)
            .and_then(|id| store.accounts.get(id))
            .cloned())
    }

    async fn account_by_id(&self, id: Uuid) -> Result<Option<Account>, LedgerError> {
        Ok(self.read()?.accounts.get(&id).cloned())
    }

    async fn account_number_exists(&self, account_number: &str) -> Result<bool, LedgerError> {
        Ok(self.read()?.numbers.contains_key(account_number))
    }

    async fn accounts_for_owner(&self, owner_id: &str) -> Result<Vec<Account>, LedgerError> {
        let store = self.read()?;
        let mut accounts: Vec<Account> = store
            .accounts
            .values()
            .filter(|a| a.owner_id == owner_id)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(accounts)
    }

    async fn set_account_active(
        &self,
        account_number: &str,
        active: bool,
    ) -> Result<Account, LedgerError> {
        let id = *self.read()?.numbers.get(account_number).ok_or_else(|| {
            LedgerError::not_found(crate::AccountRole::Account, account_number)
        })?;

        // Serialized with plans on the same account; account numbers never move.
        let _guard = self.account_lock(id).lock_owned().await;

        let mut store = self.write()?;
        let account = store
            .accounts
            .get_mut(&id)
            .ok_or_else(|| LedgerError::storage(format!("dangling account number {account_number}")))?;
        account.is_active = active;
        account.updated_at = crate::now();
        Ok(account.clone())
    }
}

#[async_trait]
impl TransactionLog for MemoryAdapter {
    async fn transaction(&self, id: Uuid) -> Result<Transaction, LedgerError> {
        self.read()?
            .transaction(id)
            .cloned()
            .ok_or(LedgerError::TransactionNotFound(id))
    }

    async fn transaction_by_idempotency_key(
        &self,
        hashed_key: &str,
    ) -> Result<Option<Transaction>, LedgerError> {
        let store = self.read()?;
        Ok(store
            .idempotency_keys
            .get(hashed_key)
            .and_then(|id| store.transaction(*id))
            .cloned())
    }

    async fn transactions_for_account(
        &self,
        account: Uuid,
        range: Option<&DateRange>,
        after: Option<&HistoryCursor>,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let store = self.read()?;
        let mut page: Vec<Transaction> = store
            .transactions
            .iter()
            .filter(|tx| tx.involves(account))
            .filter(|tx| range.is_none_or(|r| r.contains(tx.occurred_at)))
            .filter(|tx| after.is_none_or(|c| c.precedes(tx)))
            .cloned()
            .collect();
        page.sort_by(|a, b| (b.occurred_at, b.id).cmp(&(a.occurred_at, a.id)));
        page.truncate(limit);
        Ok(page)
    }

    async fn update_transaction_status(
        &self,
        id: Uuid,
        expected: TransactionStatus,
        next: TransactionStatus,
    ) -> Result<Transaction, LedgerError> {
        let mut store = self.write()?;
        let idx = *store
            .transaction_index
            .get(&id)
            .ok_or(LedgerError::TransactionNotFound(id))?;
        let tx = &mut store.transactions[idx];
        if tx.status != expected {
            return Err(LedgerError::InvalidStatusTransition {
                from: tx.status,
                to: next,
            });
        }
        tx.status = next;
        tx.updated_at = crate::now();
        Ok(tx.clone())
    }
}

#[async_trait]
impl LedgerAdapter for MemoryAdapter {
    async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        lock_timeout: Duration,
    ) -> Result<PlanOutcome, LedgerError> {
        let lock_order = plan.lock_order();

        // Step 1: Acquire the per-account mutexes in ascending id order
        let _guards = self.lock_accounts(&lock_order, lock_timeout).await?;

        // Step 2: Idempotency check and re-read under lock
        let mut accounts = {
            let store = self.read()?;
            if let Some(existing) = plan
                .idempotency_key()
                .and_then(|key| store.idempotency_keys.get(key))
                .and_then(|id| store.transaction(*id))
            {
                return Ok(PlanOutcome::Replayed(existing.clone()));
            }

            lock_order
                .iter()
                .map(|id| {
                    store
                        .accounts
                        .get(id)
                        .cloned()
                        .ok_or_else(|| LedgerError::storage(format!("account {id} vanished")))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        // Step 3: Validate and compute new balances
        plan.apply_to(&mut accounts, crate::now())?;

        // Step 4: Commit balances and the record together
        let mut store = self.write()?;
        if let Some(key) = plan.idempotency_key() {
            // Another plan touching different accounts may have claimed the key meanwhile.
            if let Some(existing) = store
                .idempotency_keys
                .get(key)
                .and_then(|id| store.transaction(*id))
            {
                return Ok(PlanOutcome::Replayed(existing.clone()));
            }
        }
        // Only the posted fields are written; the rest of the record stays as stored.
        for account in &mut accounts {
            let stored = store
                .accounts
                .get_mut(&account.id)
                .ok_or_else(|| LedgerError::storage(format!("account {} vanished", account.id)))?;
            stored.balance = account.balance;
            stored.updated_at = account.updated_at;
            *account = stored.clone();
        }
        store.record(plan.transaction().clone());

        Ok(PlanOutcome::Committed { accounts })
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}
