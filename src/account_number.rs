use chrono::{NaiveDate, Utc};
use rand::Rng;

use crate::{AccountStore, LedgerConfig, LedgerError};

/// Produces human-facing account numbers of the form `ACC-20260102-1234`.
///
/// Uniqueness is checked against the store before a number is handed out,
/// but the store's unique constraint is the real guard: account creation
/// still has to be prepared for `DuplicateAccountNumber`.
#[derive(Debug, Clone)]
pub struct AccountNumberGenerator {
    prefix: String,
    max_attempts: u32,
}

impl AccountNumberGenerator {
    pub fn new(prefix: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            prefix: prefix.into(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new(
            config.account_number_prefix.clone(),
            config.account_number_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// A candidate number for `date`, without any uniqueness check.
    pub fn candidate<R: Rng + ?Sized>(&self, date: NaiveDate, rng: &mut R) -> String {
        let suffix: u16 = rng.random_range(1000..=9999);
        format!("{}-{}-{suffix}", self.prefix, date.format("%Y%m%d"))
    }

    /// Draw candidates for today until one is not in `store`.
    pub async fn generate<S>(&self, store: &S) -> Result<String, LedgerError>
    where
        S: AccountStore + ?Sized,
    {
        let today = Utc::now().date_naive();

        for attempt in 1..=self.max_attempts {
            // ThreadRng is !Send; keep it out of scope across the await.
            let candidate = self.candidate(today, &mut rand::rng());
            if !store.account_number_exists(&candidate).await? {
                return Ok(candidate);
            }
            tracing::debug!(%candidate, attempt, "account number already taken");
        }

        Err(LedgerError::DuplicateAccountNumber(format!(
            "no free {} number after {} attempts",
            self.prefix, self.max_attempts
        )))
    }
}

impl Default for AccountNumberGenerator {
    fn default() -> Self {
        Self::from_config(&LedgerConfig::default())
    }
}
