use anyhow::anyhow;
use skillswap_core::{
    Changeset, CreditAccount, CreditTransaction, LedgerPosting, MarketConfig, MarketError,
    MarketResult, SharedStore, UserId,
};
use tracing::info;
use uuid::Uuid;

/// Per-user credit balances backed by an append-only transaction history.
#[derive(Clone)]
pub struct CreditLedger {
    store: SharedStore,
    starting_credits: i64,
}

impl CreditLedger {
    pub fn new(store: SharedStore, config: &MarketConfig) -> Self {
        Self {
            store,
            starting_credits: config.starting_credits,
        }
    }

    /// Opens the account with the starting grant on first access.
    pub async fn account(&self, user_id: UserId) -> MarketResult<CreditAccount> {
        if let Some(account) = self.store.find_account(user_id).await? {
            return Ok(account);
        }
        let account = self
            .store
            .open_account(user_id, self.starting_credits)
            .await?;
        info!(%user_id, balance = account.balance, "opened credit account");
        Ok(account)
    }

    pub async fn get_balance(&self, user_id: UserId) -> MarketResult<i64> {
        Ok(self.account(user_id).await?.balance)
    }

    pub async fn has_enough_credits(&self, user_id: UserId, amount: i64) -> MarketResult<bool> {
        Ok(self.get_balance(user_id).await? >= amount)
    }

    pub async fn credit(
        &self,
        user_id: UserId,
        amount: i64,
        description: &str,
        related_id: Option<Uuid>,
    ) -> MarketResult<CreditTransaction> {
        let posting = earn_posting(user_id, amount, description, related_id)?;
        self.post(posting).await
    }

    /// Compare-and-decrement: fails with `InsufficientCredits` without
    /// writing anything when the balance cannot cover `amount`.
    pub async fn debit(
        &self,
        user_id: UserId,
        amount: i64,
        description: &str,
        related_id: Option<Uuid>,
    ) -> MarketResult<CreditTransaction> {
        let posting = spend_posting(user_id, amount, description, related_id)?;
        self.post(posting).await
    }

    pub async fn history(&self, user_id: UserId) -> MarketResult<Vec<CreditTransaction>> {
        self.account(user_id).await?;
        self.store.transactions(user_id).await
    }

    /// Replays the history and checks it against the stored balance.
    pub async fn verify(&self, user_id: UserId) -> MarketResult<i64> {
        let account = self.account(user_id).await?;
        let transactions = self.store.transactions(user_id).await?;
        replay(user_id, &transactions, account.balance)
    }

    async fn post(&self, posting: LedgerPosting) -> MarketResult<CreditTransaction> {
        self.account(posting.user_id).await?;
        let user_id = posting.user_id;
        let amount = posting.amount;

        let mut changeset = Changeset::default();
        changeset.post(posting);
        let receipt = self.store.commit(changeset).await?;
        let transaction = receipt
            .transactions
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("commit returned no transaction for user {user_id}"))?;

        info!(
            %user_id,
            amount,
            balance_after = transaction.balance_after,
            "posted credit transaction"
        );
        Ok(transaction)
    }
}

pub fn earn_posting(
    user_id: UserId,
    amount: i64,
    description: &str,
    related_id: Option<Uuid>,
) -> MarketResult<LedgerPosting> {
    ensure_positive(amount)?;
    Ok(LedgerPosting {
        user_id,
        amount,
        description: description.to_string(),
        related_id,
    })
}

pub fn spend_posting(
    user_id: UserId,
    amount: i64,
    description: &str,
    related_id: Option<Uuid>,
) -> MarketResult<LedgerPosting> {
    ensure_positive(amount)?;
    Ok(LedgerPosting {
        user_id,
        amount: -amount,
        description: description.to_string(),
        related_id,
    })
}

fn ensure_positive(amount: i64) -> MarketResult<()> {
    if amount <= 0 {
        return Err(MarketError::validation("credit amount must be positive"));
    }
    Ok(())
}

/// Walks transactions in creation order, checking every `balance_after` link
/// and that the chain ends at `balance`.
pub fn replay(
    user_id: UserId,
    transactions: &[CreditTransaction],
    balance: i64,
) -> MarketResult<i64> {
    let mut running = 0_i64;
    for transaction in transactions {
        running = running.checked_add(transaction.amount).ok_or_else(|| {
            MarketError::LedgerMismatch {
                user_id,
                detail: format!("balance overflowed at transaction {}", transaction.id),
            }
        })?;
        if running < 0 {
            return Err(MarketError::LedgerMismatch {
                user_id,
                detail: format!("balance went negative at transaction {}", transaction.id),
            });
        }
        if running != transaction.balance_after {
            return Err(MarketError::LedgerMismatch {
                user_id,
                detail: format!(
                    "transaction {} records balance_after {} but replay gives {running}",
                    transaction.id, transaction.balance_after
                ),
            });
        }
    }

    if running != balance {
        return Err(MarketError::LedgerMismatch {
            user_id,
            detail: format!("account balance {balance} but replay gives {running}"),
        });
    }
    Ok(running)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use skillswap_store::InMemoryMarketStore;

    use super::*;

    fn ledger() -> CreditLedger {
        CreditLedger::new(Arc::new(InMemoryMarketStore::new()), &MarketConfig::default())
    }

    #[tokio::test]
    async fn first_access_opens_account_with_starting_credits() {
        let ledger = ledger();
        let user = Uuid::new_v4();

        assert_eq!(ledger.get_balance(user).await.expect("balance"), 5);
        let history = ledger.history(user).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].amount, 5);
        assert_eq!(history[0].balance_after, 5);
    }

    #[tokio::test]
    async fn debit_beyond_balance_fails_without_writing() {
        let ledger = ledger();
        let user = Uuid::new_v4();

        let result = ledger.debit(user, 6, "Learning", None).await;
        assert!(matches!(
            result,
            Err(MarketError::InsufficientCredits {
                balance: 5,
                required: 6
            })
        ));
        assert_eq!(ledger.get_balance(user).await.expect("balance"), 5);
        assert_eq!(ledger.history(user).await.expect("history").len(), 1);
    }

    #[tokio::test]
    async fn replay_reproduces_balance_after_mixed_postings() {
        let ledger = ledger();
        let user = Uuid::new_v4();

        ledger.credit(user, 7, "Taught guitar", None).await.expect("credit");
        let spent = ledger.debit(user, 10, "Learned Spanish", None).await.expect("debit");
        assert_eq!(spent.amount, -10);
        assert_eq!(spent.balance_after, 2);
        ledger.debit(user, 2, "Learned chess", None).await.expect("debit");

        assert!(!ledger.has_enough_credits(user, 1).await.expect("check"));
        assert_eq!(ledger.verify(user).await.expect("replay"), 0);
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let ledger = ledger();
        let user = Uuid::new_v4();
        assert!(matches!(
            ledger.credit(user, 0, "Nothing", None).await,
            Err(MarketError::Validation(_))
        ));
        assert!(matches!(
            ledger.debit(user, -3, "Sneaky", None).await,
            Err(MarketError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn overflowing_credit_is_refused_without_writing() {
        let ledger = ledger();
        let user = Uuid::new_v4();

        let result = ledger.credit(user, i64::MAX, "Jackpot", None).await;
        assert!(matches!(result, Err(MarketError::Validation(_))));
        assert_eq!(ledger.get_balance(user).await.expect("balance"), 5);
        assert_eq!(ledger.history(user).await.expect("history").len(), 1);
        assert_eq!(ledger.verify(user).await.expect("replay"), 5);
    }

    #[test]
    fn replay_flags_broken_links() {
        let user = Uuid::new_v4();
        let transaction = CreditTransaction {
            id: Uuid::new_v4(),
            user_id: user,
            amount: 5,
            description: "Welcome credits".to_string(),
            related_id: None,
            balance_after: 4,
            sequence: 1,
            created_at: Utc::now(),
        };
        assert!(matches!(
            replay(user, &[transaction], 4),
            Err(MarketError::LedgerMismatch { .. })
        ));
    }
}
