use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::money::{Currency, to_ledger_scale};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountType {
    #[default]
    Checking,
    Savings,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::Savings => "savings",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "checking" => Ok(Self::Checking),
            "savings" => Ok(Self::Savings),
            other => Err(LedgerError::storage(format!("unknown account type: {other}"))),
        }
    }
}

/// A ledger account. Balance is only ever changed through an execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub account_number: String,
    pub balance: Decimal,
    pub currency: Currency,
    pub account_type: AccountType,
    pub owner_id: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A freshly opened account: zero balance, active.
    pub fn open(account_number: impl Into<String>, request: NewAccount) -> Self {
        let now = crate::now();
        Self {
            id: Uuid::now_v7(),
            account_number: account_number.into(),
            balance: to_ledger_scale(Decimal::ZERO),
            currency: request.currency,
            account_type: request.account_type,
            owner_id: request.owner_id,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What account provisioning supplies when opening an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub owner_id: String,
    pub currency: Currency,
    pub account_type: AccountType,
}

impl NewAccount {
    pub fn new(owner_id: impl Into<String>, currency: Currency) -> Self {
        Self {
            owner_id: owner_id.into(),
            currency,
            account_type: AccountType::default(),
        }
    }

    pub fn with_type(mut self, account_type: AccountType) -> Self {
        self.account_type = account_type;
        self
    }
}
