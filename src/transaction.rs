use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::money::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    Transfer,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::Transfer => "transfer",
        }
    }

    /// Description used when the caller leaves it blank.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Deposit => "Deposit",
            Self::Withdrawal => "Withdrawal",
            Self::Transfer => "Transfer",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "withdrawal" => Ok(Self::Withdrawal),
            "transfer" => Ok(Self::Transfer),
            other => Err(LedgerError::storage(format!(
                "unknown transaction kind: {other}"
            ))),
        }
    }
}

/// Settlement status. Synchronous ledger paths only ever produce `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Pending settles exactly once; completed and failed are terminal.
    pub fn can_transition_to(&self, target: TransactionStatus) -> bool {
        matches!(
            (self, target),
            (Self::Pending, Self::Completed) | (Self::Pending, Self::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(LedgerError::storage(format!(
                "unknown transaction status: {other}"
            ))),
        }
    }
}

/// An immutable record of one balanced source -> destination movement.
///
/// Deposits and withdrawals reference the same account on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub amount: Amount,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub source_account: Uuid,
    pub destination_account: Uuid,
    pub description: String,
    /// blake3 digest of the caller's idempotency key, if one was supplied.
    pub idempotency_key: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        kind: TransactionKind,
        amount: Amount,
        source_account: Uuid,
        destination_account: Uuid,
        description: &str,
    ) -> Self {
        let now = crate::now();
        let description = match description.trim() {
            "" => kind.label().to_string(),
            text => text.to_string(),
        };
        Self {
            id: Uuid::now_v7(),
            amount,
            kind,
            status: TransactionStatus::Completed,
            source_account,
            destination_account,
            description,
            idempotency_key: None,
            occurred_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn with_idempotency_key(mut self, hashed_key: String) -> Self {
        self.idempotency_key = Some(hashed_key);
        self
    }

    pub fn involves(&self, account: Uuid) -> bool {
        self.source_account == account || self.destination_account == account
    }

    pub fn cursor(&self) -> HistoryCursor {
        HistoryCursor {
            occurred_at: self.occurred_at,
            id: self.id,
        }
    }
}

/// Inclusive `[start, end]` window over `occurred_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, LedgerError> {
        if start > end {
            return Err(LedgerError::InvalidDateRange(format!(
                "start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

/// Position after the last row read, in `(occurred_at DESC, id DESC)` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryCursor {
    pub occurred_at: DateTime<Utc>,
    pub id: Uuid,
}

impl HistoryCursor {
    /// True if `tx` sorts strictly after this cursor in newest-first order.
    pub fn precedes(&self, tx: &Transaction) -> bool {
        (tx.occurred_at, tx.id) < (self.occurred_at, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn amount() -> Amount {
        "10".parse().unwrap()
    }

    #[test]
    fn test_blank_description_falls_back_to_label() {
        let account = Uuid::now_v7();
        let tx = Transaction::new(TransactionKind::Withdrawal, amount(), account, account, "  ");
        assert_eq!(tx.description, "Withdrawal");
        assert_eq!(tx.status, TransactionStatus::Completed);

        let tx = Transaction::new(TransactionKind::Deposit, amount(), account, account, "salary");
        assert_eq!(tx.description, "salary");
    }

    #[test]
    fn test_status_transitions() {
        use TransactionStatus::*;
        assert!(Pending.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(Completed.is_terminal());
    }

    #[test]
    fn test_kind_and_status_parse_their_own_text() {
        for kind in [
            TransactionKind::Deposit,
            TransactionKind::Withdrawal,
            TransactionKind::Transfer,
        ] {
            assert_eq!(kind.as_str().parse::<TransactionKind>().unwrap(), kind);
        }
        assert!("refund".parse::<TransactionKind>().is_err());
        assert!("settled".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn test_date_range_is_inclusive_and_ordered() {
        let now = Utc::now();
        let range = DateRange::new(now - Duration::days(1), now).unwrap();
        assert!(range.contains(now));
        assert!(range.contains(now - Duration::days(1)));
        assert!(!range.contains(now + Duration::seconds(1)));

        assert!(matches!(
            DateRange::new(now, now - Duration::days(1)),
            Err(LedgerError::InvalidDateRange(_))
        ));
    }

    #[test]
    fn test_cursor_orders_newest_first() {
        let account = Uuid::now_v7();
        let older = Transaction::new(TransactionKind::Deposit, amount(), account, account, "");
        let newer = Transaction::new(TransactionKind::Deposit, amount(), account, account, "");

        assert!(newer.cursor().precedes(&older));
        assert!(!older.cursor().precedes(&newer));
        assert!(!newer.cursor().precedes(&newer));
    }
}
