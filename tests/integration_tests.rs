use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use minibank_ledger::dispatch::{
    DispatchError, EmailSender, LedgerEvent, Notifier, SideEffectDispatcher,
};
use minibank_ledger::{
    Account, AccountRole, AccountStore, Currency, DateRange, Ledger, LedgerAdapter, LedgerConfig,
    LedgerError, NewAccount, TransactionKind, TransactionStatus, adapters::MemoryAdapter,
};
use rust_decimal::Decimal;

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn zar() -> Currency {
    Currency::new("ZAR").unwrap()
}

fn setup() -> (Arc<MemoryAdapter>, Ledger) {
    let adapter = Arc::new(MemoryAdapter::new());
    let ledger = Ledger::new(adapter.clone(), SideEffectDispatcher::disabled());
    (adapter, ledger)
}

/// Insert an account under a fixed number and fund it through the ledger.
async fn seed(adapter: &MemoryAdapter, ledger: &Ledger, number: &str, balance: &str) -> Account {
    let account = Account::open(number, NewAccount::new(format!("owner-{number}"), zar()));
    adapter.insert_account(&account).await.unwrap();
    if dec(balance) > Decimal::ZERO {
        ledger.deposit(number, dec(balance), "opening balance").await.unwrap();
    }
    ledger.account(number).await.unwrap()
}

#[tokio::test]
async fn test_end_to_end_scenario() {
    let (adapter, ledger) = setup();
    seed(&adapter, &ledger, "ACC-1", "1000.00").await;
    seed(&adapter, &ledger, "ACC-2", "200.00").await;

    let deposit = ledger.deposit("ACC-1", dec("500.00"), "").await.unwrap();
    assert_eq!(deposit.kind, TransactionKind::Deposit);
    assert_eq!(deposit.amount.to_string(), "500.00");
    assert_eq!(ledger.get_balance("ACC-1").await.unwrap(), dec("1500.00"));

    let err = ledger.withdraw("ACC-1", dec("2000.00"), "").await.unwrap_err();
    assert_eq!(err, LedgerError::InsufficientFunds("ACC-1".to_string()));
    assert_eq!(ledger.get_balance("ACC-1").await.unwrap(), dec("1500.00"));

    let transfer = ledger
        .transfer("ACC-1", "ACC-2", dec("300.00"), "rent")
        .await
        .unwrap();
    assert_eq!(ledger.get_balance("ACC-1").await.unwrap(), dec("1200.00"));
    assert_eq!(ledger.get_balance("ACC-2").await.unwrap(), dec("500.00"));

    let acc1 = ledger.account("ACC-1").await.unwrap();
    let acc2 = ledger.account("ACC-2").await.unwrap();
    assert_eq!(transfer.kind, TransactionKind::Transfer);
    assert_eq!(transfer.amount.to_string(), "300.00");
    assert_eq!(transfer.source_account, acc1.id);
    assert_eq!(transfer.destination_account, acc2.id);
    assert_eq!(transfer.status, TransactionStatus::Completed);
}

#[tokio::test]
async fn test_deposit_records_one_transaction() {
    let (adapter, ledger) = setup();
    let account = seed(&adapter, &ledger, "ACC-1", "0").await;

    let tx = ledger.deposit("ACC-1", dec("42.10"), "cash").await.unwrap();
    assert_eq!(tx.source_account, account.id);
    assert_eq!(tx.destination_account, account.id);
    assert_eq!(tx.description, "cash");

    let history = ledger.history("ACC-1", None).await.unwrap().collect().await.unwrap();
    assert_eq!(history, vec![tx]);

    let stored = ledger.account("ACC-1").await.unwrap();
    assert_eq!(stored.balance, dec("42.10"));
    assert!(stored.updated_at >= account.updated_at);
}

#[tokio::test]
async fn test_invalid_amounts_rejected() {
    let (adapter, ledger) = setup();
    seed(&adapter, &ledger, "ACC-1", "10").await;

    for amount in ["0", "-5", "0.001"] {
        assert!(matches!(
            ledger.deposit("ACC-1", dec(amount), "").await,
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.withdraw("ACC-1", dec(amount), "").await,
            Err(LedgerError::InvalidAmount(_))
        ));
    }
    assert_eq!(ledger.get_balance("ACC-1").await.unwrap(), dec("10"));
}

#[tokio::test]
async fn test_withdraw_entire_balance() {
    let (adapter, ledger) = setup();
    seed(&adapter, &ledger, "ACC-1", "75.25").await;

    ledger.withdraw("ACC-1", dec("75.25"), "").await.unwrap();
    assert_eq!(ledger.get_balance("ACC-1").await.unwrap(), Decimal::ZERO);

    assert!(matches!(
        ledger.withdraw("ACC-1", dec("0.01"), "").await,
        Err(LedgerError::InsufficientFunds(_))
    ));
}

#[tokio::test]
async fn test_unknown_accounts_report_role() {
    let (adapter, ledger) = setup();
    seed(&adapter, &ledger, "ACC-1", "10").await;

    assert_eq!(
        ledger.deposit("ACC-404", dec("1"), "").await,
        Err(LedgerError::not_found(AccountRole::Account, "ACC-404"))
    );
    assert_eq!(
        ledger.transfer("ACC-404", "ACC-1", dec("1"), "").await,
        Err(LedgerError::not_found(AccountRole::Source, "ACC-404"))
    );
    assert_eq!(
        ledger.transfer("ACC-1", "ACC-404", dec("1"), "").await,
        Err(LedgerError::not_found(AccountRole::Destination, "ACC-404"))
    );
    assert!(matches!(
        ledger.history("ACC-404", None).await,
        Err(LedgerError::AccountNotFound { .. })
    ));
}

#[tokio::test]
async fn test_transfer_to_self_always_fails() {
    let (adapter, ledger) = setup();
    seed(&adapter, &ledger, "ACC-1", "100").await;

    for amount in ["1", "100", "5000"] {
        assert_eq!(
            ledger.transfer("ACC-1", "ACC-1", dec(amount), "").await,
            Err(LedgerError::SameAccountTransfer)
        );
    }
    assert_eq!(ledger.get_balance("ACC-1").await.unwrap(), dec("100"));
}

#[tokio::test]
async fn test_transfer_rejects_currency_mismatch() {
    let (adapter, ledger) = setup();
    seed(&adapter, &ledger, "ACC-1", "100").await;
    let usd = Account::open("ACC-USD", NewAccount::new("owner", Currency::new("USD").unwrap()));
    adapter.insert_account(&usd).await.unwrap();

    assert!(matches!(
        ledger.transfer("ACC-1", "ACC-USD", dec("10"), "").await,
        Err(LedgerError::CurrencyMismatch { .. })
    ));
    assert_eq!(ledger.get_balance("ACC-1").await.unwrap(), dec("100"));
}

#[tokio::test]
async fn test_inactive_accounts_cannot_move_money() {
    let (adapter, ledger) = setup();
    seed(&adapter, &ledger, "ACC-1", "100").await;
    seed(&adapter, &ledger, "ACC-2", "0").await;

    let closed = ledger.deactivate_account("ACC-2").await.unwrap();
    assert!(!closed.is_active);

    assert_eq!(
        ledger.transfer("ACC-1", "ACC-2", dec("10"), "").await,
        Err(LedgerError::AccountInactive("ACC-2".to_string()))
    );
    assert_eq!(
        ledger.deposit("ACC-2", dec("10"), "").await,
        Err(LedgerError::AccountInactive("ACC-2".to_string()))
    );

    ledger.reactivate_account("ACC-2").await.unwrap();
    ledger.transfer("ACC-1", "ACC-2", dec("10"), "").await.unwrap();
    assert_eq!(ledger.get_balance("ACC-2").await.unwrap(), dec("10"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deactivation_survives_concurrent_deposits() {
    for round in 0..50 {
        let (adapter, ledger) = setup();
        seed(&adapter, &ledger, "ACC-1", "0").await;
        let ledger = Arc::new(ledger);

        let depositors: Vec<_> = (0..6)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move {
                    let mut committed = 0u32;
                    for _ in 0..20 {
                        match ledger.deposit("ACC-1", dec("1"), "").await {
                            Ok(_) => committed += 1,
                            Err(LedgerError::AccountInactive(_)) => {}
                            Err(other) => panic!("unexpected error {other:?}"),
                        }
                    }
                    committed
                })
            })
            .collect();

        let deactivated = ledger.deactivate_account("ACC-1").await.unwrap();
        assert!(!deactivated.is_active);

        let mut committed = 0;
        for handle in depositors {
            committed += handle.await.unwrap();
        }

        let account = ledger.account("ACC-1").await.unwrap();
        assert!(!account.is_active, "deactivation lost in round {round}");
        assert_eq!(account.balance, Decimal::from(committed));
        assert_eq!(
            ledger.deposit("ACC-1", dec("1"), "").await,
            Err(LedgerError::AccountInactive("ACC-1".to_string()))
        );
    }
}

#[tokio::test]
async fn test_balance_cannot_pass_largest_amount() {
    let (adapter, ledger) = setup();
    seed(&adapter, &ledger, "ACC-1", "0").await;

    let largest = dec("99999999999999999.99");
    let tx = ledger.deposit("ACC-1", largest, "").await.unwrap();
    assert_eq!(tx.amount.value(), largest);

    assert!(matches!(
        ledger.deposit("ACC-1", dec("0.01"), "").await,
        Err(LedgerError::InvalidAmount(_))
    ));
    assert!(matches!(
        ledger.deposit("ACC-1", Decimal::MAX, "").await,
        Err(LedgerError::InvalidAmount(_))
    ));
    assert_eq!(ledger.get_balance("ACC-1").await.unwrap(), largest);
}

#[tokio::test]
async fn test_get_balance_is_repeatable() {
    let (adapter, ledger) = setup();
    seed(&adapter, &ledger, "ACC-1", "12.34").await;

    let first = ledger.get_balance("ACC-1").await.unwrap();
    let second = ledger.get_balance("ACC-1").await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_withdrawals_never_overdraw() {
    let (adapter, ledger) = setup();
    seed(&adapter, &ledger, "ACC-1", "100.00").await;
    let ledger = Arc::new(ledger);

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.withdraw("ACC-1", dec("15.00"), "").await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(LedgerError::InsufficientFunds(_)) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    // 6 x 15.00 fits in 100.00, a 7th would not.
    assert_eq!(succeeded, 6);
    assert_eq!(ledger.get_balance("ACC-1").await.unwrap(), dec("10.00"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposing_transfers_preserve_total() {
    let (adapter, ledger) = setup();
    seed(&adapter, &ledger, "ACC-1", "500").await;
    seed(&adapter, &ledger, "ACC-2", "500").await;
    let ledger = Arc::new(ledger);

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            let (from, to) = if i % 2 == 0 { ("ACC-1", "ACC-2") } else { ("ACC-2", "ACC-1") };
            tokio::spawn(async move { ledger.transfer(from, to, dec("7.50"), "").await })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let total = ledger.get_balance("ACC-1").await.unwrap() + ledger.get_balance("ACC-2").await.unwrap();
    assert_eq!(total, dec("1000"));
    assert_eq!(ledger.get_balance("ACC-1").await.unwrap(), dec("500"));
}

#[tokio::test]
async fn test_history_is_newest_first_and_filterable() {
    let (adapter, ledger) = setup();
    seed(&adapter, &ledger, "ACC-1", "0").await;
    seed(&adapter, &ledger, "ACC-2", "0").await;

    ledger.deposit("ACC-1", dec("100"), "").await.unwrap();
    ledger.transfer("ACC-1", "ACC-2", dec("40"), "").await.unwrap();
    ledger.withdraw("ACC-1", dec("10"), "").await.unwrap();

    let all = ledger.history("ACC-1", None).await.unwrap().collect().await.unwrap();
    let kinds: Vec<_> = all.iter().map(|tx| tx.kind).collect();
    assert_eq!(
        kinds,
        vec![TransactionKind::Withdrawal, TransactionKind::Transfer, TransactionKind::Deposit]
    );
    assert!(all.windows(2).all(|w| w[0].occurred_at >= w[1].occurred_at));

    // The destination sees the transfer too.
    let acc2 = ledger.history("ACC-2", None).await.unwrap().collect().await.unwrap();
    assert_eq!(acc2.len(), 1);

    // A window that ends before anything happened is empty.
    let long_ago = Utc::now() - ChronoDuration::days(30);
    let range = DateRange::new(long_ago, long_ago + ChronoDuration::days(1)).unwrap();
    let empty = ledger.history("ACC-1", Some(range)).await.unwrap().collect().await.unwrap();
    assert!(empty.is_empty());

    // Inclusive bounds: a range pinned to one transaction's timestamp returns it.
    let pinned = DateRange::new(all[1].occurred_at, all[1].occurred_at).unwrap();
    let only = ledger.history("ACC-1", Some(pinned)).await.unwrap().collect().await.unwrap();
    assert!(only.contains(&all[1]));
    assert!(only.iter().all(|tx| tx.occurred_at == all[1].occurred_at));

    assert!(matches!(
        DateRange::new(Utc::now(), long_ago),
        Err(LedgerError::InvalidDateRange(_))
    ));
}

#[tokio::test]
async fn test_history_is_restartable() {
    let config = LedgerConfig {
        history_page_size: 2,
        ..LedgerConfig::default()
    };
    let adapter = Arc::new(MemoryAdapter::new());
    let ledger = Ledger::with_config(adapter.clone(), SideEffectDispatcher::disabled(), &config);
    seed(&adapter, &ledger, "ACC-1", "0").await;
    for _ in 0..5 {
        ledger.deposit("ACC-1", dec("1"), "").await.unwrap();
    }

    let mut history = ledger.history("ACC-1", None).await.unwrap();
    let first_page = history.next_page().await.unwrap().unwrap();
    assert_eq!(first_page.len(), 2);

    history.restart();
    let everything = history.collect().await.unwrap();
    assert_eq!(everything.len(), 5);
    assert_eq!(&everything[..2], &first_page[..]);
}

#[tokio::test]
async fn test_idempotent_replay_applies_once() {
    let (adapter, ledger) = setup();
    seed(&adapter, &ledger, "ACC-1", "100").await;
    seed(&adapter, &ledger, "ACC-2", "0").await;

    let first = ledger
        .transfer_idempotent("ACC-1", "ACC-2", dec("25"), "invoice 7", "req-7")
        .await
        .unwrap();
    let retry = ledger
        .transfer_idempotent("ACC-1", "ACC-2", dec("25"), "invoice 7", "req-7")
        .await
        .unwrap();

    assert_eq!(first.id, retry.id);
    assert_eq!(ledger.get_balance("ACC-1").await.unwrap(), dec("75"));
    assert_eq!(ledger.get_balance("ACC-2").await.unwrap(), dec("25"));

    let deposit = ledger.deposit_idempotent("ACC-2", dec("5"), "", "req-8").await.unwrap();
    let again = ledger.deposit_idempotent("ACC-2", dec("5"), "", "req-8").await.unwrap();
    assert_eq!(deposit, again);

    let withdrawal = ledger.withdraw_idempotent("ACC-2", dec("5"), "", "req-9").await.unwrap();
    let again = ledger.withdraw_idempotent("ACC-2", dec("5"), "", "req-9").await.unwrap();
    assert_eq!(withdrawal.id, again.id);
    assert_eq!(ledger.get_balance("ACC-2").await.unwrap(), dec("25"));
}

#[tokio::test]
async fn test_open_account_and_lookup_by_owner() {
    let (_, ledger) = setup();

    let checking = ledger.open_account(NewAccount::new("user-1", zar())).await.unwrap();
    let savings = ledger
        .open_account(
            NewAccount::new("user-1", zar()).with_type(minibank_ledger::AccountType::Savings),
        )
        .await
        .unwrap();
    ledger.open_account(NewAccount::new("user-2", zar())).await.unwrap();

    assert_ne!(checking.account_number, savings.account_number);
    assert!(checking.account_number.starts_with("ACC-"));

    let owned = ledger.accounts_for_owner("user-1").await.unwrap();
    assert_eq!(owned.len(), 2);
    assert_eq!(owned[0].id, savings.id);

    ledger.deposit(&savings.account_number, dec("9.99"), "").await.unwrap();
    assert_eq!(ledger.get_balance(&savings.account_number).await.unwrap(), dec("9.99"));
}

#[tokio::test]
async fn test_settle_rejects_completed_transactions() {
    let (adapter, ledger) = setup();
    seed(&adapter, &ledger, "ACC-1", "0").await;
    let tx = ledger.deposit("ACC-1", dec("1"), "").await.unwrap();

    assert_eq!(
        ledger.settle_transaction(tx.id, TransactionStatus::Failed).await,
        Err(LedgerError::InvalidStatusTransition {
            from: TransactionStatus::Completed,
            to: TransactionStatus::Failed,
        })
    );
    assert_eq!(ledger.transaction(tx.id).await.unwrap().status, TransactionStatus::Completed);

    let missing = uuid::Uuid::now_v7();
    assert_eq!(
        ledger.transaction(missing).await,
        Err(LedgerError::TransactionNotFound(missing))
    );
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(String, LedgerEvent)>>,
    emails: Mutex<Vec<(String, String, Decimal)>>,
}

#[async_trait]
impl Notifier for Recorder {
    async fn notify(&self, account_number: &str, event: &LedgerEvent) -> Result<(), DispatchError> {
        self.events
            .lock()
            .unwrap()
            .push((account_number.to_string(), event.clone()));
        Ok(())
    }
}

#[async_trait]
impl EmailSender for Recorder {
    async fn send_transaction_alert(
        &self,
        recipient: &str,
        kind: &str,
        amount: Decimal,
        _account_number: &str,
    ) -> Result<(), DispatchError> {
        self.emails
            .lock()
            .unwrap()
            .push((recipient.to_string(), kind.to_string(), amount));
        Ok(())
    }
}

struct BrokenMailer;

#[async_trait]
impl EmailSender for BrokenMailer {
    async fn send_transaction_alert(
        &self,
        _: &str,
        _: &str,
        _: Decimal,
        _: &str,
    ) -> Result<(), DispatchError> {
        Err(DispatchError::Email("smtp down".to_string()))
    }
}

#[tokio::test]
async fn test_side_effects_follow_commit() {
    let recorder = Arc::new(Recorder::default());
    let adapter = Arc::new(MemoryAdapter::new());
    let ledger = Ledger::new(
        adapter.clone(),
        SideEffectDispatcher::spawn(recorder.clone(), recorder.clone()),
    );
    seed(&adapter, &ledger, "ACC-1", "100").await;
    seed(&adapter, &ledger, "ACC-2", "0").await;

    ledger.transfer("ACC-1", "ACC-2", dec("30"), "").await.unwrap();
    // Rejected operations produce nothing.
    ledger.withdraw("ACC-2", dec("31"), "").await.unwrap_err();
    ledger.dispatcher().close().await;

    let emails = recorder.emails.lock().unwrap().clone();
    assert_eq!(
        emails.last().map(|(_, kind, _)| kind.as_str()),
        Some("Transfer Received")
    );
    assert!(emails.contains(&("owner-ACC-1".to_string(), "Transfer Sent".to_string(), dec("30"))));
    // One seed deposit plus both sides of the transfer.
    assert_eq!(emails.len(), 3);

    let events = recorder.events.lock().unwrap();
    assert!(events.iter().any(|(number, event)| {
        number == "ACC-2"
            && matches!(event, LedgerEvent::BalanceUpdated { balance, .. } if *balance == dec("30"))
    }));
}

#[tokio::test]
async fn test_side_effect_failure_does_not_affect_result() {
    let adapter = Arc::new(MemoryAdapter::new());
    let ledger = Ledger::new(
        adapter.clone(),
        SideEffectDispatcher::spawn(Arc::new(Recorder::default()), Arc::new(BrokenMailer)),
    );
    seed(&adapter, &ledger, "ACC-1", "0").await;

    let tx = ledger.deposit("ACC-1", dec("50"), "").await.unwrap();
    ledger.dispatcher().close().await;

    assert_eq!(ledger.transaction(tx.id).await.unwrap(), tx);
    assert_eq!(ledger.get_balance("ACC-1").await.unwrap(), dec("50"));
}

#[tokio::test]
async fn test_adapter_is_usable_through_the_trait_object() {
    let adapter: Arc<dyn LedgerAdapter> = Arc::new(MemoryAdapter::new());
    let ledger = Ledger::new(adapter.clone(), SideEffectDispatcher::disabled());
    let account = ledger.open_default_account("user-9").await.unwrap();

    assert!(
        adapter
            .account_number_exists(&account.account_number)
            .await
            .unwrap()
    );
}
