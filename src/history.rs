use std::sync::Arc;

use uuid::Uuid;

use crate::{DateRange, HistoryCursor, LedgerAdapter, LedgerError, Transaction};

/// Lazy, restartable view over one account's transactions, newest first.
///
/// Pages are fetched on demand with keyset pagination on
/// `(occurred_at, id)`, so rows committed while iterating never shift a page
/// boundary. Every pass is finite.
pub struct History {
    adapter: Arc<dyn LedgerAdapter>,
    account: Uuid,
    range: Option<DateRange>,
    page_size: usize,
    cursor: Option<HistoryCursor>,
    exhausted: bool,
}

impl History {
    pub(crate) fn new(
        adapter: Arc<dyn LedgerAdapter>,
        account: Uuid,
        range: Option<DateRange>,
        page_size: usize,
    ) -> Self {
        Self {
            adapter,
            account,
            range,
            page_size: page_size.max(1),
            cursor: None,
            exhausted: false,
        }
    }

    pub fn account(&self) -> Uuid {
        self.account
    }

    pub fn range(&self) -> Option<&DateRange> {
        self.range.as_ref()
    }

    /// The next page, or `None` once the sequence is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Transaction>>, LedgerError> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self
            .adapter
            .transactions_for_account(
                self.account,
                self.range.as_ref(),
                self.cursor.as_ref(),
                self.page_size,
            )
            .await?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                self.cursor = Some(last.cursor());
                Ok(Some(page))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Drain the remaining pages.
    pub async fn collect(&mut self) -> Result<Vec<Transaction>, LedgerError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }

    /// Start again from the newest transaction.
    pub fn restart(&mut self) {
        self.cursor = None;
        self.exhausted = false;
    }
}
