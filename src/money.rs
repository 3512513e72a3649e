use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Number of decimal places every ledger amount carries.
pub const SCALE: u32 = 2;

/// Largest amount or balance the ledger holds: the range of a `NUMERIC(19, 2)`
/// column, 99_999_999_999_999_999.99.
pub const MAX_VALUE: Decimal = Decimal::from_parts(0x89E7_FFFF, 0x8AC7_2304, 0, false, SCALE);

/// Rescale a decimal to the ledger's two-decimal representation.
pub fn to_ledger_scale(value: Decimal) -> Decimal {
    let mut scaled = value;
    scaled.rescale(SCALE);
    scaled
}

/// A strictly positive monetary amount with at most two decimal places.
///
/// `Amount` is what moves between accounts. Balances are plain `Decimal`s
/// because zero is a valid balance while it is never a valid movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, LedgerError> {
        if value <= Decimal::ZERO {
            return Err(LedgerError::invalid_amount(format!(
                "{value} must be greater than zero"
            )));
        }
        if value.normalize().scale() > SCALE {
            return Err(LedgerError::invalid_amount(format!(
                "{value} has more than {SCALE} decimal places"
            )));
        }
        if value > MAX_VALUE {
            return Err(LedgerError::invalid_amount(format!(
                "{value} exceeds the maximum of {MAX_VALUE}"
            )));
        }
        Ok(Self(to_ledger_scale(value)))
    }

    /// Build an amount from minor units (cents).
    pub fn from_minor(minor: i64) -> Result<Self, LedgerError> {
        Self::new(Decimal::new(minor, SCALE))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl FromStr for Amount {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim())
            .map_err(|e| LedgerError::invalid_amount(format!("{s}: {e}")))?;
        Self::new(value)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// ISO-like currency code: exactly three upper-case ASCII letters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self, LedgerError> {
        let code = code.trim();
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(code.to_string()))
        } else {
            Err(LedgerError::InvalidCurrency(code.to_string()))
        }
    }

    /// For codes known valid at compile time.
    pub(crate) fn from_static(code: &'static str) -> Self {
        Self(code.to_string())
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Currency {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl FromStr for Currency {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
