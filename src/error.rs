use thiserror::Error;
use uuid::Uuid;

use crate::transaction::TransactionStatus;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Which side of an operation an account reference came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountRole {
    Account,
    Source,
    Destination,
}

impl std::fmt::Display for AccountRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Account => write!(f, "account"),
            Self::Source => write!(f, "source account"),
            Self::Destination => write!(f, "destination account"),
        }
    }
}

/// Coarse classification used by callers to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed input. Fatal to the call.
    Validation,
    /// Business-rule violation. Surfaced verbatim, never retried.
    DomainRule,
    /// Infrastructure hiccup. Nothing was committed; retry with backoff.
    Transient,
    /// Unexpected storage behaviour.
    Internal,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("cannot transfer to the same account")]
    SameAccountTransfer,

    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("invalid date range: {0}")]
    InvalidDateRange(String),

    #[error("insufficient funds in account {0}")]
    InsufficientFunds(String),

    #[error("account {0} is inactive")]
    AccountInactive(String),

    #[error("{role} not found: {account_number}")]
    AccountNotFound {
        role: AccountRole,
        account_number: String,
    },

    #[error("duplicate account number: {0}")]
    DuplicateAccountNumber(String),

    #[error("currency mismatch: {source_currency} vs {destination_currency}")]
    CurrencyMismatch {
        source_currency: String,
        destination_currency: String,
    },

    #[error("transaction not found: {0}")]
    TransactionNotFound(Uuid),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidStatusTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("lock contention: {0}")]
    Contention(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn invalid_amount(msg: impl Into<String>) -> Self {
        Self::InvalidAmount(msg.into())
    }

    pub fn not_found(role: AccountRole, account_number: impl Into<String>) -> Self {
        Self::AccountNotFound {
            role,
            account_number: account_number.into(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidAmount(_)
            | Self::SameAccountTransfer
            | Self::InvalidCurrency(_)
            | Self::InvalidDateRange(_) => ErrorCategory::Validation,
            Self::InsufficientFunds(_)
            | Self::AccountInactive(_)
            | Self::AccountNotFound { .. }
            | Self::DuplicateAccountNumber(_)
            | Self::CurrencyMismatch { .. }
            | Self::TransactionNotFound(_)
            | Self::InvalidStatusTransition { .. } => ErrorCategory::DomainRule,
            Self::Contention(_) | Self::Unavailable(_) => ErrorCategory::Transient,
            Self::Storage(_) => ErrorCategory::Internal,
        }
    }

    /// Only transient infrastructure failures may be retried, and only by the caller.
    pub fn is_retriable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}
