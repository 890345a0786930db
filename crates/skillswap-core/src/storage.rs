use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{MarketError, MarketResult},
    models::{
        CreditAccount, CreditTransaction, Exchange, Message, Notification, SkillCategory,
        SkillLevel, SkillOffering, SkillRequest, Status, Swap, TeachingMethod, UserId,
    },
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferingOrder {
    #[default]
    Newest,
    Rating,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfferingFilter {
    pub owner_id: Option<UserId>,
    pub exclude_owner: Option<UserId>,
    #[serde(default)]
    pub categories: Vec<Uuid>,
    pub experience_level: Option<SkillLevel>,
    pub teaching_method: Option<TeachingMethod>,
    pub location: Option<String>,
    pub text_query: Option<String>,
    pub min_rating: Option<Decimal>,
    #[serde(default)]
    pub include_inactive: bool,
    #[serde(default)]
    pub order: OfferingOrder,
}

impl OfferingFilter {
    /// Row-level predicate. `min_rating` and `order` need rating data and are
    /// applied by the catalog.
    pub fn matches(&self, offering: &SkillOffering) -> bool {
        (self.include_inactive || offering.is_active)
            && self.owner_id.is_none_or(|owner| offering.owner_id == owner)
            && self.exclude_owner != Some(offering.owner_id)
            && (self.categories.is_empty() || self.categories.contains(&offering.category_id))
            && self
                .experience_level
                .is_none_or(|level| offering.experience_level == level)
            && self
                .teaching_method
                .is_none_or(|method| offering.teaching_method == method)
            && self.location.as_deref().is_none_or(|location| {
                offering
                    .location
                    .as_deref()
                    .is_some_and(|value| contains_ignore_case(value, location))
            })
            && self.text_query.as_deref().is_none_or(|query| {
                contains_ignore_case(&offering.title, query)
                    || contains_ignore_case(&offering.description, query)
            })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestFilter {
    pub owner_id: Option<UserId>,
    pub exclude_owner: Option<UserId>,
    #[serde(default)]
    pub categories: Vec<Uuid>,
    pub text_query: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
}

impl RequestFilter {
    pub fn matches(&self, request: &SkillRequest) -> bool {
        (self.include_inactive || request.is_active)
            && self.owner_id.is_none_or(|owner| request.owner_id == owner)
            && self.exclude_owner != Some(request.owner_id)
            && (self.categories.is_empty() || self.categories.contains(&request.category_id))
            && self.text_query.as_deref().is_none_or(|query| {
                contains_ignore_case(&request.title, query)
                    || contains_ignore_case(&request.description, query)
            })
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    let needle = needle.trim();
    needle.is_empty() || haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPosting {
    pub user_id: UserId,
    pub amount: i64,
    pub description: String,
    pub related_id: Option<Uuid>,
}

impl LedgerPosting {
    /// Balance after applying this posting, refusing to go below zero.
    pub fn apply_to(&self, balance: i64) -> MarketResult<i64> {
        let next = balance.checked_add(self.amount).ok_or_else(|| {
            MarketError::validation(format!(
                "posting of {} would overflow a balance of {balance}",
                self.amount
            ))
        })?;
        if next < 0 {
            return Err(MarketError::InsufficientCredits {
                balance,
                required: self.amount.saturating_neg(),
            });
        }
        Ok(next)
    }
}

/// A row write that only lands while the stored row still has `expected`
/// status and, when `revision` is set, the same `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedUpdate<T> {
    pub row: T,
    pub expected: Status,
    pub revision: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub id: Uuid,
    pub exchange_id: Uuid,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Row changes applied by [`MarketStore::commit`] as one unit.
///
/// New swaps are checked against the active-proposal uniqueness rule, updates
/// only apply while the stored row still has the expected status, and ledger
/// postings never take a balance below zero. Any failure leaves the store
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    pub new_swaps: Vec<Swap>,
    pub swap_updates: Vec<GuardedUpdate<Swap>>,
    pub new_exchange: Option<Exchange>,
    pub exchange_update: Option<GuardedUpdate<Exchange>>,
    pub postings: Vec<LedgerPosting>,
    pub notifications: Vec<Notification>,
    pub messages: Vec<MessageDraft>,
}

impl Changeset {
    pub fn insert_swap(&mut self, swap: Swap) -> &mut Self {
        self.new_swaps.push(swap);
        self
    }

    pub fn update_swap(&mut self, swap: Swap, expected: Status) -> &mut Self {
        self.swap_updates.push(GuardedUpdate {
            row: swap,
            expected,
            revision: None,
        });
        self
    }

    /// Like [`Changeset::update_swap`], but also fails with `Conflict` when
    /// the swap was written after `revision` (its `updated_at` when read).
    pub fn revise_swap(
        &mut self,
        swap: Swap,
        expected: Status,
        revision: DateTime<Utc>,
    ) -> &mut Self {
        self.swap_updates.push(GuardedUpdate {
            row: swap,
            expected,
            revision: Some(revision),
        });
        self
    }

    pub fn insert_exchange(&mut self, exchange: Exchange) -> &mut Self {
        self.new_exchange = Some(exchange);
        self
    }

    pub fn update_exchange(&mut self, exchange: Exchange, expected: Status) -> &mut Self {
        self.exchange_update = Some(GuardedUpdate {
            row: exchange,
            expected,
            revision: None,
        });
        self
    }

    pub fn post(&mut self, posting: LedgerPosting) -> &mut Self {
        self.postings.push(posting);
        self
    }

    pub fn notify(&mut self, notification: Notification) -> &mut Self {
        self.notifications.push(notification);
        self
    }

    pub fn append_message(&mut self, message: MessageDraft) -> &mut Self {
        self.messages.push(message);
        self
    }
}

/// Rows created by a commit that the store had to fill in.
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    pub transactions: Vec<CreditTransaction>,
    pub messages: Vec<Message>,
}

#[async_trait]
pub trait MarketStore: Send + Sync {
    async fn list_categories(&self) -> MarketResult<Vec<SkillCategory>>;
    async fn find_category(&self, id: Uuid) -> MarketResult<Option<SkillCategory>>;

    async fn save_offering(&self, offering: &SkillOffering) -> MarketResult<()>;
    async fn find_offering(&self, id: Uuid) -> MarketResult<Option<SkillOffering>>;
    /// Fails with `HasActiveExchanges` while an active swap references it.
    async fn delete_offering(&self, id: Uuid) -> MarketResult<()>;
    /// Newest first.
    async fn list_offerings(&self, filter: &OfferingFilter) -> MarketResult<Vec<SkillOffering>>;

    async fn save_request(&self, request: &SkillRequest) -> MarketResult<()>;
    async fn find_request(&self, id: Uuid) -> MarketResult<Option<SkillRequest>>;
    /// Fails with `HasActiveExchanges` while an active swap references it.
    async fn delete_request(&self, id: Uuid) -> MarketResult<()>;
    /// Newest first.
    async fn list_requests(&self, filter: &RequestFilter) -> MarketResult<Vec<SkillRequest>>;

    /// Opens the account with an opening transaction unless it already exists.
    async fn open_account(&self, user_id: UserId, opening_balance: i64)
    -> MarketResult<CreditAccount>;
    async fn find_account(&self, user_id: UserId) -> MarketResult<Option<CreditAccount>>;
    /// Creation order.
    async fn transactions(&self, user_id: UserId) -> MarketResult<Vec<CreditTransaction>>;

    async fn find_swap(&self, id: Uuid) -> MarketResult<Option<Swap>>;
    /// Newest first.
    async fn swaps_for_user(&self, user_id: UserId) -> MarketResult<Vec<Swap>>;
    async fn find_exchange(&self, id: Uuid) -> MarketResult<Option<Exchange>>;
    async fn exchange_for_swap(&self, swap_id: Uuid) -> MarketResult<Option<Exchange>>;
    /// Newest first.
    async fn exchanges_for_user(&self, user_id: UserId) -> MarketResult<Vec<Exchange>>;

    async fn commit(&self, changeset: Changeset) -> MarketResult<CommitReceipt>;

    /// Newest first.
    async fn notifications_for(
        &self,
        user_id: UserId,
        unread_only: bool,
    ) -> MarketResult<Vec<Notification>>;
    async fn mark_notification_read(&self, user_id: UserId, id: Uuid) -> MarketResult<()>;
    async fn mark_all_notifications_read(&self, user_id: UserId) -> MarketResult<u64>;

    /// Server order: ascending sequence.
    async fn messages(&self, exchange_id: Uuid) -> MarketResult<Vec<Message>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offering(title: &str, description: &str) -> SkillOffering {
        let now = Utc::now();
        SkillOffering {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            category_id: Uuid::new_v4(),
            title: title.to_string(),
            description: description.to_string(),
            experience_level: SkillLevel::Advanced,
            teaching_method: TeachingMethod::Online,
            location: Some("Lisbon, Portugal".to_string()),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn text_query_matches_title_or_description_ignoring_case() {
        let item = offering("Sourdough Baking", "Crusty loaves at home");
        let by_title = OfferingFilter {
            text_query: Some("sourDOUGH".to_string()),
            ..Default::default()
        };
        let by_description = OfferingFilter {
            text_query: Some("LOAVES".to_string()),
            ..Default::default()
        };
        let miss = OfferingFilter {
            text_query: Some("pottery".to_string()),
            ..Default::default()
        };

        assert!(by_title.matches(&item));
        assert!(by_description.matches(&item));
        assert!(!miss.matches(&item));
    }

    #[test]
    fn inactive_and_excluded_owner_are_filtered() {
        let mut item = offering("Guitar", "Chords");
        let exclude = OfferingFilter {
            exclude_owner: Some(item.owner_id),
            ..Default::default()
        };
        assert!(!exclude.matches(&item));

        item.is_active = false;
        assert!(!OfferingFilter::default().matches(&item));
        let with_inactive = OfferingFilter {
            include_inactive: true,
            ..Default::default()
        };
        assert!(with_inactive.matches(&item));
    }

    #[test]
    fn location_filter_requires_a_location() {
        let mut item = offering("Chess", "Openings");
        let filter = OfferingFilter {
            location: Some("lisbon".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&item));
        item.location = None;
        assert!(!filter.matches(&item));
    }

    #[test]
    fn posting_refuses_negative_balance() {
        let posting = LedgerPosting {
            user_id: Uuid::new_v4(),
            amount: -5,
            description: "Learning".to_string(),
            related_id: None,
        };
        assert_eq!(posting.apply_to(5).ok(), Some(0));
        assert!(matches!(
            posting.apply_to(3),
            Err(MarketError::InsufficientCredits {
                balance: 3,
                required: 5
            })
        ));
    }

    #[test]
    fn posting_refuses_overflowing_balance() {
        let windfall = LedgerPosting {
            user_id: Uuid::new_v4(),
            amount: i64::MAX,
            description: "Windfall".to_string(),
            related_id: None,
        };
        assert!(matches!(windfall.apply_to(5), Err(MarketError::Validation(_))));
        assert_eq!(windfall.apply_to(0).ok(), Some(i64::MAX));
    }
}
