use minibank_ledger::{Account, AccountStore, Currency, Ledger, NewAccount};
use rust_decimal::Decimal;

pub mod test_postgres;

pub(crate) fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

/// Insert an account under a fixed number and fund it through the ledger.
pub(crate) async fn seed(
    store: &dyn AccountStore,
    ledger: &Ledger,
    number: &str,
    balance: &str,
) -> Account {
    let account = Account::open(
        number,
        NewAccount::new(format!("owner-{number}"), Currency::new("ZAR").unwrap()),
    );
    store.insert_account(&account).await.unwrap();
    if dec(balance) > Decimal::ZERO {
        ledger
            .deposit(number, dec(balance), "opening balance")
            .await
            .unwrap();
    }
    ledger.account(number).await.unwrap()
}
