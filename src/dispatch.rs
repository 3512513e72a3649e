//! Post-commit side effects: account notifications and alert emails.
//!
//! The ledger enqueues effects after a successful commit and never waits for
//! them. A background task delivers them one at a time. Failures are logged
//! and counted, then forgotten: the committed transaction stands regardless.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Account, Amount, Transaction, TransactionKind, TransactionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("notification failed: {0}")]
    Notification(String),

    #[error("email delivery failed: {0}")]
    Email(String),
}

/// Transaction as seen by notification consumers: account numbers, not ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionSummary {
    pub id: Uuid,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub amount: Amount,
    pub source_account_number: String,
    pub destination_account_number: String,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    TransactionCreated(TransactionSummary),
    BalanceUpdated {
        account_number: String,
        #[serde(with = "rust_decimal::serde::str")]
        balance: Decimal,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    Notify {
        account_number: String,
        event: LedgerEvent,
    },
    Email {
        recipient: String,
        kind: String,
        amount: Decimal,
        account_number: String,
    },
}

impl SideEffect {
    fn channel(&self) -> &'static str {
        match self {
            Self::Notify { .. } => "notification",
            Self::Email { .. } => "email",
        }
    }

    /// Effects owed for a committed transaction.
    ///
    /// `accounts` are the post-commit snapshots of every account the
    /// transaction touched. Per account: a `TransactionCreated` and a
    /// `BalanceUpdated` notification, then an alert email to its owner.
    pub fn for_transaction(tx: &Transaction, accounts: &[Account]) -> Vec<SideEffect> {
        let find = |id: Uuid| accounts.iter().find(|a| a.id == id);
        let (Some(source), Some(destination)) =
            (find(tx.source_account), find(tx.destination_account))
        else {
            warn!(transaction = %tx.id, "committed accounts missing, no side effects");
            return Vec::new();
        };

        let summary = TransactionSummary {
            id: tx.id,
            kind: tx.kind,
            status: tx.status,
            amount: tx.amount,
            source_account_number: source.account_number.clone(),
            destination_account_number: destination.account_number.clone(),
            description: tx.description.clone(),
            occurred_at: tx.occurred_at,
        };

        let affected: Vec<(&Account, &str)> = match tx.kind {
            TransactionKind::Transfer => vec![
                (source, "Transfer Sent"),
                (destination, "Transfer Received"),
            ],
            kind => vec![(source, kind.label())],
        };

        let mut effects = Vec::with_capacity(affected.len() * 3);
        for (account, label) in affected {
            effects.push(SideEffect::Notify {
                account_number: account.account_number.clone(),
                event: LedgerEvent::TransactionCreated(summary.clone()),
            });
            effects.push(SideEffect::Notify {
                account_number: account.account_number.clone(),
                event: LedgerEvent::BalanceUpdated {
                    account_number: account.account_number.clone(),
                    balance: account.balance,
                },
            });
            effects.push(SideEffect::Email {
                recipient: account.owner_id.clone(),
                kind: label.to_string(),
                amount: tx.amount.value(),
                account_number: account.account_number.clone(),
            });
        }
        effects
    }
}

/// Pushes ledger events to whoever is watching an account.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, account_number: &str, event: &LedgerEvent) -> Result<(), DispatchError>;
}

/// Sends transaction alert emails to account owners.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_transaction_alert(
        &self,
        recipient: &str,
        kind: &str,
        amount: Decimal,
        account_number: &str,
    ) -> Result<(), DispatchError>;
}

/// Writes notifications to the log as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, account_number: &str, event: &LedgerEvent) -> Result<(), DispatchError> {
        let payload =
            serde_json::to_string(event).map_err(|e| DispatchError::Notification(e.to_string()))?;
        info!(account_number, %payload, "ledger notification");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_transaction_alert(
        &self,
        recipient: &str,
        kind: &str,
        amount: Decimal,
        account_number: &str,
    ) -> Result<(), DispatchError> {
        info!(recipient, kind, %amount, account_number, "transaction alert email");
        Ok(())
    }
}

/// Fire-and-forget queue in front of a [`Notifier`] and an [`EmailSender`].
pub struct SideEffectDispatcher {
    sender: Mutex<Option<UnboundedSender<SideEffect>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SideEffectDispatcher {
    /// Start the delivery task. Must be called inside a Tokio runtime.
    pub fn spawn(notifier: Arc<dyn Notifier>, email: Arc<dyn EmailSender>) -> Self {
        let (sender, receiver) = unbounded_channel();
        let worker = tokio::spawn(deliver_all(receiver, notifier, email));
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn logging() -> Self {
        Self::spawn(Arc::new(LogNotifier), Arc::new(LogEmailSender))
    }

    /// A dispatcher that drops every effect.
    pub fn disabled() -> Self {
        Self {
            sender: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Enqueue without waiting. Never fails.
    pub fn dispatch(&self, effect: SideEffect) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(effect).is_err() {
                    warn!("side effect worker is gone, effect dropped");
                }
            }
            None => debug!(channel = effect.channel(), "dispatcher disabled, effect dropped"),
        }
    }

    pub fn dispatch_all(&self, effects: impl IntoIterator<Item = SideEffect>) {
        for effect in effects {
            self.dispatch(effect);
        }
    }

    /// Stop accepting effects and wait until everything queued was attempted.
    pub async fn close(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(sender);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "side effect worker ended abnormally");
            }
        }
    }
}

async fn deliver_all(
    mut receiver: UnboundedReceiver<SideEffect>,
    notifier: Arc<dyn Notifier>,
    email: Arc<dyn EmailSender>,
) {
    while let Some(effect) = receiver.recv().await {
        let channel = effect.channel();
        let result = match &effect {
            SideEffect::Notify {
                account_number,
                event,
            } => notifier.notify(account_number, event).await,
            SideEffect::Email {
                recipient,
                kind,
                amount,
                account_number,
            } => {
                email
                    .send_transaction_alert(recipient, kind, *amount, account_number)
                    .await
            }
        };

        if let Err(e) = result {
            warn!(channel, error = %e, "side effect failed");
            counter!("ledger.side_effects.failed", "channel" => channel).increment(1);
        }
    }
    debug!("side effect queue drained");
}
