use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use skillswap_core::{
    Changeset, CommitReceipt, CreditAccount, CreditTransaction, Exchange, MarketError,
    MarketResult, MarketStore, Message, Notification, OfferingFilter, RequestFilter,
    SkillCategory, SkillOffering, SkillRequest, Swap, UserId,
};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MarketState {
    categories: HashMap<Uuid, SkillCategory>,
    offerings: HashMap<Uuid, SkillOffering>,
    requests: HashMap<Uuid, SkillRequest>,
    accounts: HashMap<UserId, CreditAccount>,
    transactions: Vec<CreditTransaction>,
    swaps: HashMap<Uuid, Swap>,
    exchanges: HashMap<Uuid, Exchange>,
    notifications: Vec<Notification>,
    messages: Vec<Message>,
    sequence: i64,
}

impl MarketState {
    fn next_sequence(&mut self) -> i64 {
        self.sequence += 1;
        self.sequence
    }

    fn has_active_swap_referencing(&self, entity_id: Uuid) -> bool {
        self.swaps
            .values()
            .any(|swap| swap.status.is_active() && swap.references(entity_id))
    }

    fn post_opening(&mut self, user_id: UserId, opening_balance: i64) -> CreditAccount {
        let now = Utc::now();
        let sequence = self.next_sequence();
        self.transactions.push(CreditTransaction {
            id: Uuid::new_v4(),
            user_id,
            amount: opening_balance,
            description: "Welcome credits".to_string(),
            related_id: None,
            balance_after: opening_balance,
            sequence,
            created_at: now,
        });
        let account = CreditAccount {
            user_id,
            balance: opening_balance,
            updated_at: now,
        };
        self.accounts.insert(user_id, account.clone());
        account
    }

    /// Applies every change or returns the first failure; the caller discards
    /// the state on error.
    fn apply(&mut self, changeset: Changeset) -> MarketResult<CommitReceipt> {
        let now = Utc::now();
        let mut receipt = CommitReceipt::default();

        for swap in changeset.new_swaps {
            if self.swaps.contains_key(&swap.id) {
                return Err(anyhow!("swap {} already exists", swap.id).into());
            }
            if let Some(key) = swap.proposal_key() {
                let existing = self.swaps.values().find(|candidate| {
                    candidate.status.is_active() && candidate.proposal_key() == Some(key)
                });
                if let Some(existing) = existing {
                    return Err(MarketError::DuplicateProposal {
                        existing_swap_id: existing.id,
                    });
                }
            }
            self.swaps.insert(swap.id, swap);
        }

        for update in changeset.swap_updates {
            let current = self
                .swaps
                .get_mut(&update.row.id)
                .ok_or_else(|| MarketError::not_found("swap", update.row.id))?;
            if current.status != update.expected {
                return Err(MarketError::InvalidTransition {
                    from: current.status,
                    to: update.row.status,
                });
            }
            if update.revision.is_some_and(|revision| revision != current.updated_at) {
                return Err(MarketError::Conflict {
                    entity: "swap",
                    id: current.id,
                });
            }
            *current = update.row;
        }

        if let Some(exchange) = changeset.new_exchange {
            for swap_id in exchange.swap_ids() {
                if !self.swaps.contains_key(&swap_id) {
                    return Err(MarketError::not_found("swap", swap_id));
                }
            }
            self.exchanges.insert(exchange.id, exchange);
        }

        if let Some(update) = changeset.exchange_update {
            let current = self
                .exchanges
                .get_mut(&update.row.id)
                .ok_or_else(|| MarketError::not_found("exchange", update.row.id))?;
            if current.status != update.expected {
                return Err(MarketError::InvalidTransition {
                    from: current.status,
                    to: update.row.status,
                });
            }
            *current = update.row;
        }

        for posting in changeset.postings {
            let balance = self
                .accounts
                .get(&posting.user_id)
                .ok_or_else(|| MarketError::not_found("credit account", posting.user_id))?
                .balance;
            let balance_after = posting.apply_to(balance)?;
            let sequence = self.next_sequence();
            self.transactions.push(CreditTransaction {
                id: Uuid::new_v4(),
                user_id: posting.user_id,
                amount: posting.amount,
                description: posting.description,
                related_id: posting.related_id,
                balance_after,
                sequence,
                created_at: now,
            });
            if let Some(account) = self.accounts.get_mut(&posting.user_id) {
                account.balance = balance_after;
                account.updated_at = now;
            }
            if let Some(transaction) = self.transactions.last() {
                receipt.transactions.push(transaction.clone());
            }
        }

        self.notifications.extend(changeset.notifications);

        for draft in changeset.messages {
            let sequence = self.next_sequence();
            let message = Message {
                id: draft.id,
                exchange_id: draft.exchange_id,
                sender_id: draft.sender_id,
                content: draft.content,
                sequence,
                created_at: draft.created_at,
            };
            self.messages.push(message.clone());
            receipt.messages.push(message);
        }

        Ok(receipt)
    }
}

/// Process-local store. Every commit runs against a copy of the state that
/// only replaces the live state once all changes have applied.
#[derive(Debug, Default)]
pub struct InMemoryMarketStore {
    state: RwLock<MarketState>,
}

impl InMemoryMarketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_category(&self, name: &str) -> SkillCategory {
        let category = SkillCategory {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        self.state
            .write()
            .await
            .categories
            .insert(category.id, category.clone());
        category
    }

    pub async fn swap_count(&self) -> usize {
        self.state.read().await.swaps.len()
    }

    pub async fn exchange_count(&self) -> usize {
        self.state.read().await.exchanges.len()
    }
}

#[async_trait]
impl MarketStore for InMemoryMarketStore {
    async fn list_categories(&self) -> MarketResult<Vec<SkillCategory>> {
        let state = self.state.read().await;
        let mut categories: Vec<_> = state.categories.values().cloned().collect();
        categories.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(categories)
    }

    async fn find_category(&self, id: Uuid) -> MarketResult<Option<SkillCategory>> {
        Ok(self.state.read().await.categories.get(&id).cloned())
    }

    async fn save_offering(&self, offering: &SkillOffering) -> MarketResult<()> {
        self.state
            .write()
            .await
            .offerings
            .insert(offering.id, offering.clone());
        Ok(())
    }

    async fn find_offering(&self, id: Uuid) -> MarketResult<Option<SkillOffering>> {
        Ok(self.state.read().await.offerings.get(&id).cloned())
    }

    async fn delete_offering(&self, id: Uuid) -> MarketResult<()> {
        let mut state = self.state.write().await;
        if !state.offerings.contains_key(&id) {
            return Err(MarketError::not_found("offering", id));
        }
        if state.has_active_swap_referencing(id) {
            return Err(MarketError::HasActiveExchanges {
                entity: "offering",
                id,
            });
        }
        state.offerings.remove(&id);
        Ok(())
    }

    async fn list_offerings(&self, filter: &OfferingFilter) -> MarketResult<Vec<SkillOffering>> {
        let state = self.state.read().await;
        let mut offerings: Vec<_> = state
            .offerings
            .values()
            .filter(|offering| filter.matches(offering))
            .cloned()
            .collect();
        offerings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(offerings)
    }

    async fn save_request(&self, request: &SkillRequest) -> MarketResult<()> {
        self.state
            .write()
            .await
            .requests
            .insert(request.id, request.clone());
        Ok(())
    }

    async fn find_request(&self, id: Uuid) -> MarketResult<Option<SkillRequest>> {
        Ok(self.state.read().await.requests.get(&id).cloned())
    }

    async fn delete_request(&self, id: Uuid) -> MarketResult<()> {
        let mut state = self.state.write().await;
        if !state.requests.contains_key(&id) {
            return Err(MarketError::not_found("request", id));
        }
        if state.has_active_swap_referencing(id) {
            return Err(MarketError::HasActiveExchanges {
                entity: "request",
                id,
            });
        }
        state.requests.remove(&id);
        Ok(())
    }

    async fn list_requests(&self, filter: &RequestFilter) -> MarketResult<Vec<SkillRequest>> {
        let state = self.state.read().await;
        let mut requests: Vec<_> = state
            .requests
            .values()
            .filter(|request| filter.matches(request))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(requests)
    }

    async fn open_account(
        &self,
        user_id: UserId,
        opening_balance: i64,
    ) -> MarketResult<CreditAccount> {
        let mut state = self.state.write().await;
        if let Some(account) = state.accounts.get(&user_id) {
            return Ok(account.clone());
        }
        Ok(state.post_opening(user_id, opening_balance))
    }

    async fn find_account(&self, user_id: UserId) -> MarketResult<Option<CreditAccount>> {
        Ok(self.state.read().await.accounts.get(&user_id).cloned())
    }

    async fn transactions(&self, user_id: UserId) -> MarketResult<Vec<CreditTransaction>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .filter(|transaction| transaction.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_swap(&self, id: Uuid) -> MarketResult<Option<Swap>> {
        Ok(self.state.read().await.swaps.get(&id).cloned())
    }

    async fn swaps_for_user(&self, user_id: UserId) -> MarketResult<Vec<Swap>> {
        let state = self.state.read().await;
        let mut swaps: Vec<_> = state
            .swaps
            .values()
            .filter(|swap| swap.role_of(user_id).is_some())
            .cloned()
            .collect();
        swaps.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(swaps)
    }

    async fn find_exchange(&self, id: Uuid) -> MarketResult<Option<Exchange>> {
        Ok(self.state.read().await.exchanges.get(&id).cloned())
    }

    async fn exchange_for_swap(&self, swap_id: Uuid) -> MarketResult<Option<Exchange>> {
        let state = self.state.read().await;
        Ok(state
            .exchanges
            .values()
            .find(|exchange| exchange.swap_ids().any(|id| id == swap_id))
            .cloned())
    }

    async fn exchanges_for_user(&self, user_id: UserId) -> MarketResult<Vec<Exchange>> {
        let state = self.state.read().await;
        let mut exchanges: Vec<_> = state
            .exchanges
            .values()
            .filter(|exchange| exchange.is_participant(user_id))
            .cloned()
            .collect();
        exchanges.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(exchanges)
    }

    async fn commit(&self, changeset: Changeset) -> MarketResult<CommitReceipt> {
        let mut state = self.state.write().await;
        let mut draft = state.clone();
        let receipt = draft.apply(changeset)?;
        *state = draft;
        Ok(receipt)
    }

    async fn notifications_for(
        &self,
        user_id: UserId,
        unread_only: bool,
    ) -> MarketResult<Vec<Notification>> {
        let state = self.state.read().await;
        Ok(state
            .notifications
            .iter()
            .rev()
            .filter(|notification| notification.user_id == user_id)
            .filter(|notification| !unread_only || !notification.is_read)
            .cloned()
            .collect())
    }

    async fn mark_notification_read(&self, user_id: UserId, id: Uuid) -> MarketResult<()> {
        let mut state = self.state.write().await;
        let notification = state
            .notifications
            .iter_mut()
            .find(|notification| notification.id == id && notification.user_id == user_id)
            .ok_or_else(|| MarketError::not_found("notification", id))?;
        notification.is_read = true;
        Ok(())
    }

    async fn mark_all_notifications_read(&self, user_id: UserId) -> MarketResult<u64> {
        let mut state = self.state.write().await;
        let mut updated = 0;
        for notification in state
            .notifications
            .iter_mut()
            .filter(|notification| notification.user_id == user_id && !notification.is_read)
        {
            notification.is_read = true;
            updated += 1;
        }
        Ok(updated)
    }

    async fn messages(&self, exchange_id: Uuid) -> MarketResult<Vec<Message>> {
        let state = self.state.read().await;
        let mut messages: Vec<_> = state
            .messages
            .iter()
            .filter(|message| message.exchange_id == exchange_id)
            .cloned()
            .collect();
        messages.sort_by_key(|message| message.sequence);
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use skillswap_core::{LedgerPosting, Status};

    use super::*;

    fn swap_for(offering_id: Uuid, request_id: Option<Uuid>) -> Swap {
        Swap::propose(
            Uuid::new_v4(),
            Uuid::new_v4(),
            offering_id,
            request_id,
            false,
            Utc::now(),
        )
        .expect("valid swap")
    }

    #[tokio::test]
    async fn failed_commit_leaves_no_trace() {
        let store = InMemoryMarketStore::new();
        let learner = Uuid::new_v4();
        store.open_account(learner, 3).await.expect("account");

        let mut changeset = Changeset::default();
        changeset.insert_swap(swap_for(Uuid::new_v4(), None));
        changeset.post(LedgerPosting {
            user_id: learner,
            amount: -5,
            description: "Learning".to_string(),
            related_id: None,
        });

        let result = store.commit(changeset).await;
        assert!(matches!(
            result,
            Err(MarketError::InsufficientCredits {
                balance: 3,
                required: 5
            })
        ));
        assert_eq!(store.swap_count().await, 0);
        let account = store.find_account(learner).await.expect("read").expect("account");
        assert_eq!(account.balance, 3);
        assert_eq!(store.transactions(learner).await.expect("read").len(), 1);
    }

    #[tokio::test]
    async fn active_proposal_key_is_unique() {
        let store = InMemoryMarketStore::new();
        let offering_id = Uuid::new_v4();
        let request_id = Uuid::new_v4();
        let first = swap_for(offering_id, Some(request_id));
        let first_id = first.id;

        let mut changeset = Changeset::default();
        changeset.insert_swap(first);
        store.commit(changeset).await.expect("first proposal");

        let mut changeset = Changeset::default();
        changeset.insert_swap(swap_for(offering_id, Some(request_id)));
        let result = store.commit(changeset).await;
        assert!(matches!(
            result,
            Err(MarketError::DuplicateProposal { existing_swap_id }) if existing_swap_id == first_id
        ));
        assert_eq!(store.swap_count().await, 1);
    }

    #[tokio::test]
    async fn terminal_swaps_release_the_proposal_key() {
        let store = InMemoryMarketStore::new();
        let offering_id = Uuid::new_v4();
        let request_id = Uuid::new_v4();
        let mut first = swap_for(offering_id, Some(request_id));

        let mut changeset = Changeset::default();
        changeset.insert_swap(first.clone());
        store.commit(changeset).await.expect("first proposal");

        first.advance(Status::Rejected, Utc::now()).expect("reject");
        let mut changeset = Changeset::default();
        changeset.update_swap(first, Status::Pending);
        store.commit(changeset).await.expect("reject commit");

        let mut changeset = Changeset::default();
        changeset.insert_swap(swap_for(offering_id, Some(request_id)));
        store.commit(changeset).await.expect("second proposal");
        assert_eq!(store.swap_count().await, 2);
    }

    #[tokio::test]
    async fn stale_guarded_update_is_rejected() {
        let store = InMemoryMarketStore::new();
        let mut swap = swap_for(Uuid::new_v4(), None);
        let mut changeset = Changeset::default();
        changeset.insert_swap(swap.clone());
        store.commit(changeset).await.expect("insert");

        swap.advance(Status::Accepted, Utc::now()).expect("accept");
        let mut changeset = Changeset::default();
        changeset.update_swap(swap.clone(), Status::InProgress);
        let result = store.commit(changeset).await;
        assert!(matches!(
            result,
            Err(MarketError::InvalidTransition {
                from: Status::Pending,
                to: Status::Accepted
            })
        ));
    }

    #[tokio::test]
    async fn revision_guard_rejects_lost_updates() {
        let store = InMemoryMarketStore::new();
        let swap = swap_for(Uuid::new_v4(), None);
        let mut changeset = Changeset::default();
        changeset.insert_swap(swap.clone());
        store.commit(changeset).await.expect("insert");
        let read_at = swap.updated_at;

        let mut first = swap.clone();
        first.scheduled_times.push(Utc::now());
        first.updated_at = read_at + chrono::Duration::milliseconds(1);
        let mut changeset = Changeset::default();
        changeset.revise_swap(first.clone(), Status::Pending, read_at);
        store.commit(changeset).await.expect("first edit");

        let mut second = swap;
        second.scheduled_times.push(Utc::now());
        second.updated_at = read_at + chrono::Duration::milliseconds(2);
        let mut changeset = Changeset::default();
        changeset.revise_swap(second, Status::Pending, read_at);
        let result = store.commit(changeset).await;
        assert!(matches!(result, Err(MarketError::Conflict { entity: "swap", .. })));

        let stored = store.find_swap(first.id).await.expect("read").expect("swap");
        assert_eq!(stored.scheduled_times, first.scheduled_times);
    }

    #[tokio::test]
    async fn messages_receive_increasing_sequence() {
        let store = InMemoryMarketStore::new();
        let exchange_id = Uuid::new_v4();
        let sender_id = Uuid::new_v4();

        for content in ["hello", "when works for you?"] {
            let mut changeset = Changeset::default();
            changeset.append_message(skillswap_core::MessageDraft {
                id: Uuid::new_v4(),
                exchange_id,
                sender_id,
                content: content.to_string(),
                created_at: Utc::now(),
            });
            store.commit(changeset).await.expect("append");
        }

        let messages = store.messages(exchange_id).await.expect("read");
        assert_eq!(messages.len(), 2);
        assert!(messages[0].sequence < messages[1].sequence);
        assert_eq!(messages[0].content, "hello");
    }
}
