use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use crate::{
    Account, AccountRole, AccountStore, Amount, Currency, DateRange, ExecutionPlan, HistoryCursor,
    LedgerAdapter, LedgerConfig, LedgerError, PlanOutcome, Transaction, TransactionLog,
    TransactionStatus,
};

const ACCOUNT_NUMBER_CONSTRAINT: &str = "ledger_accounts_account_number_key";

/// PostgreSQL ledger store.
///
/// Schema:
/// ```sql
/// CREATE TABLE ledger_accounts (
///     id UUID PRIMARY KEY,
///     account_number TEXT NOT NULL UNIQUE,
///     balance NUMERIC(19, 2) NOT NULL CHECK (balance >= 0),
///     currency TEXT NOT NULL,
///     account_type TEXT NOT NULL,
///     owner_id TEXT NOT NULL,
///     is_active BOOLEAN NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL
/// );
///
/// CREATE TABLE ledger_transactions (
///     id UUID PRIMARY KEY,
///     amount NUMERIC(19, 2) NOT NULL CHECK (amount > 0),
///     kind TEXT NOT NULL,
///     status TEXT NOT NULL,
///     source_account UUID NOT NULL REFERENCES ledger_accounts(id),
///     destination_account UUID NOT NULL REFERENCES ledger_accounts(id),
///     description TEXT NOT NULL,
///     idempotency_key TEXT UNIQUE,
///     occurred_at TIMESTAMPTZ NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL
/// );
///
/// CREATE INDEX idx_ledger_transactions_source ON ledger_transactions(source_account, occurred_at DESC);
/// CREATE INDEX idx_ledger_transactions_destination ON ledger_transactions(destination_account, occurred_at DESC);
/// ```
pub struct PostgresAdapter {
    pub(crate) pool: PgPool,
}

impl PostgresAdapter {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| LedgerError::Unavailable("DATABASE_URL is not set".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(url)
            .await
            .map_err(storage_error)?;

        Ok(Self::from_pool(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn init_schema(&self) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_accounts (
                id UUID PRIMARY KEY,
                account_number TEXT NOT NULL,
                balance NUMERIC(19, 2) NOT NULL DEFAULT 0 CHECK (balance >= 0),
                currency TEXT NOT NULL,
                account_type TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                CONSTRAINT ledger_accounts_account_number_key UNIQUE (account_number)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_accounts_owner
            ON ledger_accounts(owner_id, created_at DESC)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_transactions (
                id UUID PRIMARY KEY,
                amount NUMERIC(19, 2) NOT NULL CHECK (amount > 0),
                kind TEXT NOT NULL CHECK (kind IN ('deposit', 'withdrawal', 'transfer')),
                status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'failed')),
                source_account UUID NOT NULL REFERENCES ledger_accounts(id),
                destination_account UUID NOT NULL REFERENCES ledger_accounts(id),
                description TEXT NOT NULL,
                idempotency_key TEXT,
                occurred_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                CONSTRAINT ledger_transactions_idempotency_key_key UNIQUE (idempotency_key)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_transactions_source
            ON ledger_transactions(source_account, occurred_at DESC)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_transactions_destination
            ON ledger_transactions(destination_account, occurred_at DESC)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        tx.commit().await.map_err(storage_error)?;
        Ok(())
    }

    async fn transaction_by_key_in(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        hashed_key: &str,
    ) -> Result<Option<Transaction>, LedgerError> {
        sqlx::query(
            r#"
            SELECT id, amount, kind, status, source_account, destination_account,
                   description, idempotency_key, occurred_at, created_at, updated_at
            FROM ledger_transactions
            WHERE idempotency_key = $1
            "#,
        )
        .bind(hashed_key)
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage_error)?
        .map(|row| transaction_from_row(&row))
        .transpose()
    }

    async fn run_plan(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        plan: &ExecutionPlan,
        lock_timeout: Duration,
    ) -> Result<PlanOutcome, LedgerError> {
        // lock_timeout = 0 means "wait forever" to Postgres.
        let millis = lock_timeout.as_millis().max(1);
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{millis}ms"))
            .execute(&mut **tx)
            .await
            .map_err(storage_error)?;

        // ── Phase 1: Lock in ascending id order ──────────────────────────────
        let lock_order = plan.lock_order();
        let mut accounts = Vec::with_capacity(lock_order.len());
        for id in &lock_order {
            let row = sqlx::query(
                r#"
                SELECT id, account_number, balance, currency, account_type, owner_id,
                       is_active, created_at, updated_at
                FROM ledger_accounts
                WHERE id = $1
                FOR UPDATE
                "#,
            )
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| LedgerError::storage(format!("account {id} vanished")))?;

            debug!(account = %id, "account locked");
            accounts.push(account_from_row(&row)?);
        }

        // ── Phase 2: Idempotency ─────────────────────────────────────────────
        if let Some(key) = plan.idempotency_key() {
            if let Some(existing) = self.transaction_by_key_in(tx, key).await? {
                return Ok(PlanOutcome::Replayed(existing));
            }
        }

        // ── Phase 3: Apply (checked INSIDE the lock) ─────────────────────────
        plan.apply_to(&mut accounts, crate::now())?;

        // ── Phase 4: Write ───────────────────────────────────────────────────
        for account in &accounts {
            sqlx::query("UPDATE ledger_accounts SET balance = $2, updated_at = $3 WHERE id = $1")
                .bind(account.id)
                .bind(account.balance)
                .bind(account.updated_at)
                .execute(&mut **tx)
                .await
                .map_err(storage_error)?;
        }

        let record = plan.transaction();
        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger_transactions (
                id, amount, kind, status, source_account, destination_account,
                description, idempotency_key, occurred_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.amount.value())
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(record.source_account)
        .bind(record.destination_account)
        .bind(&record.description)
        .bind(record.idempotency_key.as_deref())
        .bind(record.occurred_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(storage_error)?;

        if inserted.rows_affected() == 0 {
            // A plan with the same key on other accounts committed while we held our locks.
            let key = record.idempotency_key.as_deref().unwrap_or_default();
            return match self.transaction_by_key_in(tx, key).await? {
                Some(existing) => Ok(PlanOutcome::Replayed(existing)),
                None => Err(LedgerError::Contention(format!(
                    "idempotency key of transaction {} is held by another writer",
                    record.id
                ))),
            };
        }

        Ok(PlanOutcome::Committed { accounts })
    }
}

#[async_trait]
impl AccountStore for PostgresAdapter {
    async fn insert_account(&self, account: &Account) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_accounts (
                id, account_number, balance, currency, account_type, owner_id,
                is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(account.id)
        .bind(&account.account_number)
        .bind(account.balance)
        .bind(account.currency.code())
        .bind(account.account_type.as_str())
        .bind(&account.owner_id)
        .bind(account.is_active)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if violates(&e, ACCOUNT_NUMBER_CONSTRAINT) {
                LedgerError::DuplicateAccountNumber(account.account_number.clone())
            } else {
                storage_error(e)
            }
        })?;

        Ok(())
    }

    async fn account_by_number(&self, account_number: &str) -> Result<Option<Account>, LedgerError> {
        sqlx::query(
            r#"
            SELECT id, account_number, balance, currency, account_type, owner_id,
                   is_active, created_at, updated_at
            FROM ledger_accounts
            WHERE account_number = $1
            "#,
        )
        .bind(account_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?
        .map(|row| account_from_row(&row))
        .transpose()
    }

    async fn account_by_id(&self, id: Uuid) -> Result<Option<Account>, LedgerError> {
        sqlx::query(
            r#"
            SELECT id, account_number, balance, currency, account_type, owner_id,
                   is_active, created_at, updated_at
            FROM ledger_accounts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?
        .map(|row| account_from_row(&row))
        .transpose()
    }

    async fn account_number_exists(&self, account_number: &str) -> Result<bool, LedgerError> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM ledger_accounts WHERE account_number = $1)")
            .bind(account_number)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)
    }

    async fn accounts_for_owner(&self, owner_id: &str) -> Result<Vec<Account>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_number, balance, currency, account_type, owner_id,
                   is_active, created_at, updated_at
            FROM ledger_accounts
            WHERE owner_id = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(account_from_row).collect()
    }

    async fn set_account_active(
        &self,
        account_number: &str,
        active: bool,
    ) -> Result<Account, LedgerError> {
        let row = sqlx::query(
            r#"
            UPDATE ledger_accounts
            SET is_active = $2, updated_at = $3
            WHERE account_number = $1
            RETURNING id, account_number, balance, currency, account_type, owner_id,
                      is_active, created_at, updated_at
            "#,
        )
        .bind(account_number)
        .bind(active)
        .bind(crate::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| LedgerError::not_found(AccountRole::Account, account_number))?;

        account_from_row(&row)
    }
}

#[async_trait]
impl TransactionLog for PostgresAdapter {
    async fn transaction(&self, id: Uuid) -> Result<Transaction, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, amount, kind, status, source_account, destination_account,
                   description, idempotency_key, occurred_at, created_at, updated_at
            FROM ledger_transactions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?
        .ok_or(LedgerError::TransactionNotFound(id))?;

        transaction_from_row(&row)
    }

    async fn transaction_by_idempotency_key(
        &self,
        hashed_key: &str,
    ) -> Result<Option<Transaction>, LedgerError> {
        sqlx::query(
            r#"
            SELECT id, amount, kind, status, source_account, destination_account,
                   description, idempotency_key, occurred_at, created_at, updated_at
            FROM ledger_transactions
            WHERE idempotency_key = $1
            "#,
        )
        .bind(hashed_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?
        .map(|row| transaction_from_row(&row))
        .transpose()
    }

    async fn transactions_for_account(
        &self,
        account: Uuid,
        range: Option<&DateRange>,
        after: Option<&HistoryCursor>,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, amount, kind, status, source_account, destination_account,
                   description, idempotency_key, occurred_at, created_at, updated_at
            FROM ledger_transactions
            WHERE (source_account = $1 OR destination_account = $1)
              AND ($2::timestamptz IS NULL OR occurred_at >= $2)
              AND ($3::timestamptz IS NULL OR occurred_at <= $3)
              AND ($4::timestamptz IS NULL OR (occurred_at, id) < ($4, $5::uuid))
            ORDER BY occurred_at DESC, id DESC
            LIMIT $6
            "#,
        )
        .bind(account)
        .bind(range.map(DateRange::start))
        .bind(range.map(DateRange::end))
        .bind(after.map(|c| c.occurred_at))
        .bind(after.map(|c| c.id))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(transaction_from_row).collect()
    }

    async fn update_transaction_status(
        &self,
        id: Uuid,
        expected: TransactionStatus,
        next: TransactionStatus,
    ) -> Result<Transaction, LedgerError> {
        let row = sqlx::query(
            r#"
            UPDATE ledger_transactions
            SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            RETURNING id, amount, kind, status, source_account, destination_account,
                      description, idempotency_key, occurred_at, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(crate::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        match row {
            Some(row) => transaction_from_row(&row),
            // Lost the race or never matched: report what is actually stored.
            None => {
                let current = self.transaction(id).await?;
                Err(LedgerError::InvalidStatusTransition {
                    from: current.status,
                    to: next,
                })
            }
        }
    }
}

#[async_trait]
impl LedgerAdapter for PostgresAdapter {
    async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        lock_timeout: Duration,
    ) -> Result<PlanOutcome, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        match self.run_plan(&mut tx, plan, lock_timeout).await {
            Ok(PlanOutcome::Committed { accounts }) => {
                tx.commit().await.map_err(storage_error)?;
                Ok(PlanOutcome::Committed { accounts })
            }
            Ok(replayed) => {
                tx.rollback().await.ok();
                Ok(replayed)
            }
            Err(e) => {
                tx.rollback().await.ok();
                Err(e)
            }
        }
    }
}

fn violates(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation() && db.constraint() == Some(constraint),
        _ => false,
    }
}

fn storage_error(err: sqlx::Error) -> LedgerError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            LedgerError::Unavailable(err.to_string())
        }
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // lock_not_available, serialization_failure, deadlock_detected
            Some("55P03" | "40001" | "40P01") => LedgerError::Contention(db.message().to_string()),
            _ => LedgerError::Storage(err.to_string()),
        },
        _ => LedgerError::Storage(err.to_string()),
    }
}

fn decode<'r, T>(row: &'r PgRow, column: &str) -> Result<T, LedgerError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| LedgerError::storage(format!("{column}: {e}")))
}

fn account_from_row(row: &PgRow) -> Result<Account, LedgerError> {
    let currency: String = decode(row, "currency")?;
    let account_type: String = decode(row, "account_type")?;
    let balance: Decimal = decode(row, "balance")?;

    Ok(Account {
        id: decode(row, "id")?,
        account_number: decode(row, "account_number")?,
        balance: crate::money::to_ledger_scale(balance),
        currency: Currency::new(&currency)
            .map_err(|e| LedgerError::storage(format!("currency: {e}")))?,
        account_type: account_type.parse()?,
        owner_id: decode(row, "owner_id")?,
        is_active: decode(row, "is_active")?,
        created_at: decode::<DateTime<Utc>>(row, "created_at")?,
        updated_at: decode::<DateTime<Utc>>(row, "updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, LedgerError> {
    let amount: Decimal = decode(row, "amount")?;
    let kind: String = decode(row, "kind")?;
    let status: String = decode(row, "status")?;

    Ok(Transaction {
        id: decode(row, "id")?,
        amount: Amount::new(amount).map_err(|e| LedgerError::storage(format!("amount: {e}")))?,
        kind: kind.parse()?,
        status: status.parse()?,
        source_account: decode(row, "source_account")?,
        destination_account: decode(row, "destination_account")?,
        description: decode(row, "description")?,
        idempotency_key: decode(row, "idempotency_key")?,
        occurred_at: decode(row, "occurred_at")?,
        created_at: decode(row, "created_at")?,
        updated_at: decode(row, "updated_at")?,
    })
}
