use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::money::{Amount, MAX_VALUE, to_ledger_scale};
use crate::transaction::Transaction;
use crate::{Account, hash_idempotency_key};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Posting {
    Credit { account: Uuid, amount: Amount },
    Debit { account: Uuid, amount: Amount },
}

impl Posting {
    pub fn account(&self) -> Uuid {
        match self {
            Self::Credit { account, .. } | Self::Debit { account, .. } => *account,
        }
    }

    fn signed_amount(&self) -> Decimal {
        match self {
            Self::Credit { amount, .. } => amount.value(),
            Self::Debit { amount, .. } => -amount.value(),
        }
    }
}

/// Everything one ledger operation writes, committed as a single unit.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    postings: Vec<Posting>,
    transaction: Transaction,
}

/// What an adapter did with a plan.
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    /// Balances and the transaction record were written. Accounts are the
    /// post-commit snapshots, in lock order.
    Committed { accounts: Vec<Account> },
    /// A transaction with the same idempotency key already exists; nothing was written.
    Replayed(Transaction),
}

impl ExecutionPlan {
    pub(crate) fn new(transaction: Transaction) -> Self {
        Self {
            postings: Vec::new(),
            transaction,
        }
    }

    pub(crate) fn credit(mut self, account: Uuid, amount: Amount) -> Self {
        self.postings.push(Posting::Credit { account, amount });
        self
    }

    pub(crate) fn debit(mut self, account: Uuid, amount: Amount) -> Self {
        self.postings.push(Posting::Debit { account, amount });
        self
    }

    pub(crate) fn idempotent(mut self, key: Option<&str>) -> Self {
        if let Some(key) = key {
            self.transaction = self
                .transaction
                .with_idempotency_key(hash_idempotency_key(key));
        }
        self
    }

    #[cfg(test)]
    pub(crate) fn with_status(mut self, status: crate::TransactionStatus) -> Self {
        self.transaction.status = status;
        self
    }

    pub fn postings(&self) -> &[Posting] {
        &self.postings
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.transaction.idempotency_key.as_deref()
    }

    /// Distinct accounts touched by the plan, ascending. Every adapter locks in this order.
    pub fn lock_order(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.postings.iter().map(Posting::account).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn net_change(&self, account: Uuid) -> Decimal {
        self.postings
            .iter()
            .filter(|p| p.account() == account)
            .map(Posting::signed_amount)
            .sum()
    }

    /// Apply the postings to account snapshots read under lock.
    ///
    /// Checks every account before touching any of them, so on error the
    /// snapshots are unchanged.
    pub fn apply_to(&self, accounts: &mut [Account], now: DateTime<Utc>) -> Result<(), LedgerError> {
        let mut next = Vec::with_capacity(accounts.len());

        for account in accounts.iter() {
            if !account.is_active {
                return Err(LedgerError::AccountInactive(account.account_number.clone()));
            }
            let balance = account
                .balance
                .checked_add(self.net_change(account.id))
                .filter(|balance| *balance <= MAX_VALUE)
                .ok_or_else(|| {
                    LedgerError::invalid_amount(format!(
                        "balance of account {} would exceed {MAX_VALUE}",
                        account.account_number
                    ))
                })?;
            if balance < Decimal::ZERO {
                return Err(LedgerError::InsufficientFunds(account.account_number.clone()));
            }
            next.push(to_ledger_scale(balance));
        }

        for (account, balance) in accounts.iter_mut().zip(next) {
            account.balance = balance;
            account.updated_at = now;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::NewAccount;
    use crate::money::Currency;
    use crate::transaction::TransactionKind;

    fn account(balance: &str) -> Account {
        let mut account = Account::open(
            format!("ACC-{}", Uuid::now_v7()),
            NewAccount::new("owner", Currency::new("ZAR").unwrap()),
        );
        account.balance = balance.parse().unwrap();
        account
    }

    fn transfer_plan(from: &Account, to: &Account, amount: &str) -> ExecutionPlan {
        let amount: Amount = amount.parse().unwrap();
        let tx = Transaction::new(TransactionKind::Transfer, amount, from.id, to.id, "");
        ExecutionPlan::new(tx)
            .debit(from.id, amount)
            .credit(to.id, amount)
    }

    #[test]
    fn test_lock_order_is_ascending_regardless_of_posting_order() {
        let a = account("0");
        let b = account("0");
        let (low, high) = if a.id < b.id { (&a, &b) } else { (&b, &a) };

        let plan = transfer_plan(high, low, "1");
        assert_eq!(plan.lock_order(), vec![low.id, high.id]);

        let plan = transfer_plan(low, high, "1");
        assert_eq!(plan.lock_order(), vec![low.id, high.id]);
    }

    #[test]
    fn test_self_referencing_plan_locks_once() {
        let a = account("10");
        let amount: Amount = "5".parse().unwrap();
        let tx = Transaction::new(TransactionKind::Deposit, amount, a.id, a.id, "");
        let plan = ExecutionPlan::new(tx).credit(a.id, amount);
        assert_eq!(plan.lock_order(), vec![a.id]);
    }

    #[test]
    fn test_apply_transfer_preserves_total() {
        let from = account("1000.00");
        let to = account("200.00");
        let plan = transfer_plan(&from, &to, "300.00");

        let mut locked = vec![from.clone(), to.clone()];
        plan.apply_to(&mut locked, Utc::now()).unwrap();

        assert_eq!(locked[0].balance.to_string(), "700.00");
        assert_eq!(locked[1].balance.to_string(), "500.00");
        assert_eq!(
            locked[0].balance + locked[1].balance,
            from.balance + to.balance
        );
    }

    #[test]
    fn test_apply_rejects_overdraft_without_touching_snapshots() {
        let from = account("100.00");
        let to = account("0");
        let plan = transfer_plan(&from, &to, "100.01");

        let mut locked = vec![to.clone(), from.clone()];
        let err = plan.apply_to(&mut locked, Utc::now()).unwrap_err();

        assert_eq!(err, LedgerError::InsufficientFunds(from.account_number.clone()));
        assert_eq!(locked, vec![to, from]);
    }

    #[test]
    fn test_apply_rejects_balance_past_maximum() {
        let full = account("99999999999999999.99");
        let amount: Amount = "0.01".parse().unwrap();
        let tx = Transaction::new(TransactionKind::Deposit, amount, full.id, full.id, "");
        let plan = ExecutionPlan::new(tx).credit(full.id, amount);

        let mut locked = vec![full.clone()];
        assert!(matches!(
            plan.apply_to(&mut locked, Utc::now()),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert_eq!(locked, vec![full]);
    }

    #[test]
    fn test_apply_rejects_inactive_account() {
        let from = account("100.00");
        let mut to = account("0");
        to.is_active = false;
        let plan = transfer_plan(&from, &to, "1");

        let mut locked = vec![from, to.clone()];
        assert_eq!(
            plan.apply_to(&mut locked, Utc::now()),
            Err(LedgerError::AccountInactive(to.account_number))
        );
    }

    #[test]
    fn test_idempotency_key_is_hashed() {
        let a = account("0");
        let amount: Amount = "1".parse().unwrap();
        let tx = Transaction::new(TransactionKind::Deposit, amount, a.id, a.id, "");
        let plan = ExecutionPlan::new(tx)
            .credit(a.id, amount)
            .idempotent(Some("req-42"));

        let key = plan.idempotency_key().unwrap();
        assert_ne!(key, "req-42");
        assert_eq!(key, hash_idempotency_key("req-42"));
    }
}
