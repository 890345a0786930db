use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use rust_decimal::Decimal;
use skillswap_core::{
    AnalyticsAggregator, EngagementAnalytics, LearningAnalytics, MarketResult, OfferingFilter,
    RequestFilter, SharedStore, StatusBreakdown, Swap, TeachingAnalytics, UserId, UserRating,
};
use uuid::Uuid;

/// Aggregates computed directly from store reads.
#[derive(Clone)]
pub struct StoreAnalytics {
    store: SharedStore,
}

impl StoreAnalytics {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    async fn rating_of(&self, user_id: UserId) -> MarketResult<UserRating> {
        let swaps = self.store.swaps_for_user(user_id).await?;
        let received: Vec<u8> = swaps
            .iter()
            .filter(|swap| swap.teacher_id == user_id)
            .filter_map(|swap| swap.learner_rating)
            .collect();
        Ok(UserRating {
            user_id,
            average_rating: average(&received),
            rating_count: count(received.len()),
        })
    }

    /// Credits moved through credit-funded exchanges, split into
    /// (earned as teacher, net spent as learner).
    async fn exchange_credit_flows(&self, user_id: UserId) -> MarketResult<(i64, i64)> {
        let exchanges: HashMap<Uuid, UserId> = self
            .store
            .exchanges_for_user(user_id)
            .await?
            .into_iter()
            .filter(|exchange| exchange.is_credit_based)
            .map(|exchange| (exchange.id, exchange.user1_id))
            .collect();

        let mut earned = 0;
        let mut spent = 0;
        for transaction in self.store.transactions(user_id).await? {
            let Some(teacher_id) = transaction
                .related_id
                .and_then(|related_id| exchanges.get(&related_id))
            else {
                continue;
            };
            if *teacher_id == user_id {
                earned += transaction.amount;
            } else {
                spent -= transaction.amount;
            }
        }
        Ok((earned, spent))
    }
}

#[async_trait]
impl AnalyticsAggregator for StoreAnalytics {
    async fn average_ratings(&self, user_ids: &[UserId]) -> MarketResult<Vec<UserRating>> {
        let mut ratings = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            ratings.push(self.rating_of(*user_id).await?);
        }
        Ok(ratings)
    }

    async fn teaching(&self, user_id: UserId) -> MarketResult<TeachingAnalytics> {
        let taught: Vec<Swap> = self
            .store
            .swaps_for_user(user_id)
            .await?
            .into_iter()
            .filter(|swap| swap.teacher_id == user_id)
            .collect();
        let rating = self.rating_of(user_id).await?;
        let (credits_earned, _) = self.exchange_credit_flows(user_id).await?;

        Ok(TeachingAnalytics {
            user_id,
            swaps: breakdown(&taught),
            distinct_learners: count(
                taught
                    .iter()
                    .map(|swap| swap.learner_id)
                    .collect::<HashSet<_>>()
                    .len(),
            ),
            sessions_scheduled: count(taught.iter().map(|swap| swap.scheduled_times.len()).sum()),
            average_rating: rating.average_rating,
            rating_count: rating.rating_count,
            credits_earned,
        })
    }

    async fn learning(&self, user_id: UserId) -> MarketResult<LearningAnalytics> {
        let learned: Vec<Swap> = self
            .store
            .swaps_for_user(user_id)
            .await?
            .into_iter()
            .filter(|swap| swap.learner_id == user_id)
            .collect();
        let (_, credits_spent) = self.exchange_credit_flows(user_id).await?;

        Ok(LearningAnalytics {
            user_id,
            swaps: breakdown(&learned),
            distinct_teachers: count(
                learned
                    .iter()
                    .map(|swap| swap.teacher_id)
                    .collect::<HashSet<_>>()
                    .len(),
            ),
            ratings_given: count(
                learned
                    .iter()
                    .filter(|swap| swap.learner_rating.is_some())
                    .count(),
            ),
            credits_spent,
        })
    }

    async fn engagement(&self, user_id: UserId) -> MarketResult<EngagementAnalytics> {
        let active_offerings = self
            .store
            .list_offerings(&OfferingFilter {
                owner_id: Some(user_id),
                ..Default::default()
            })
            .await?
            .len();
        let active_requests = self
            .store
            .list_requests(&RequestFilter {
                owner_id: Some(user_id),
                ..Default::default()
            })
            .await?
            .len();

        let exchanges = self.store.exchanges_for_user(user_id).await?;
        let open_exchanges = exchanges
            .iter()
            .filter(|exchange| exchange.status.is_active())
            .count();
        let completed_exchanges = exchanges
            .iter()
            .filter(|exchange| exchange.status == skillswap_core::Status::Completed)
            .count();

        let mut messages_sent = 0;
        for exchange in &exchanges {
            messages_sent += self
                .store
                .messages(exchange.id)
                .await?
                .iter()
                .filter(|message| message.sender_id == user_id)
                .count();
        }

        let unread_notifications = self.store.notifications_for(user_id, true).await?.len();

        Ok(EngagementAnalytics {
            user_id,
            active_offerings: count(active_offerings),
            active_requests: count(active_requests),
            open_exchanges: count(open_exchanges),
            completed_exchanges: count(completed_exchanges),
            unread_notifications: count(unread_notifications),
            messages_sent: count(messages_sent),
        })
    }
}

fn breakdown(swaps: &[Swap]) -> StatusBreakdown {
    let mut breakdown = StatusBreakdown::default();
    for swap in swaps {
        breakdown.record(swap.status);
    }
    breakdown
}

/// Mean rounded to two decimals, `None` when nothing was rated.
fn average(ratings: &[u8]) -> Option<Decimal> {
    if ratings.is_empty() {
        return None;
    }
    let total: u32 = ratings.iter().map(|rating| u32::from(*rating)).sum();
    let mean = Decimal::from(total) / Decimal::from(ratings.len() as u64);
    Some(mean.round_dp(2))
}

fn count(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use skillswap_core::{Changeset, MarketStore, Status};
    use skillswap_store::InMemoryMarketStore;

    use super::*;

    async fn completed_swap(
        store: &InMemoryMarketStore,
        teacher_id: UserId,
        learner_rating: Option<u8>,
    ) -> Swap {
        let now = Utc::now();
        let mut swap = Swap::propose(teacher_id, Uuid::new_v4(), Uuid::new_v4(), None, false, now)
            .expect("valid swap");
        swap.advance(Status::Accepted, now).expect("accept");
        swap.advance(Status::Completed, now).expect("complete");
        swap.learner_rating = learner_rating;
        swap.scheduled_times.push(now);

        let mut changeset = Changeset::default();
        changeset.insert_swap(swap.clone());
        store.commit(changeset).await.expect("insert");
        swap
    }

    #[test]
    fn average_rounds_to_two_places() {
        assert_eq!(average(&[]), None);
        assert_eq!(average(&[5, 4, 4]), Some(Decimal::new(433, 2)));
    }

    #[tokio::test]
    async fn average_rating_only_counts_ratings_received_as_teacher() {
        let store = Arc::new(InMemoryMarketStore::new());
        let analytics = StoreAnalytics::new(store.clone());
        let teacher = Uuid::new_v4();
        completed_swap(&store, teacher, Some(5)).await;
        completed_swap(&store, teacher, Some(4)).await;
        completed_swap(&store, teacher, None).await;

        let ratings = analytics
            .average_ratings(&[teacher, Uuid::new_v4()])
            .await
            .expect("ratings");
        assert_eq!(ratings[0].average_rating, Some(Decimal::new(45, 1)));
        assert_eq!(ratings[0].rating_count, 2);
        assert_eq!(ratings[1].average_rating, None);
    }

    #[tokio::test]
    async fn teaching_summary_counts_learners_and_sessions() {
        let store = Arc::new(InMemoryMarketStore::new());
        let analytics = StoreAnalytics::new(store.clone());
        let teacher = Uuid::new_v4();
        completed_swap(&store, teacher, Some(5)).await;
        completed_swap(&store, teacher, None).await;

        let summary = analytics.teaching(teacher).await.expect("teaching");
        assert_eq!(summary.swaps.completed, 2);
        assert_eq!(summary.swaps.total(), 2);
        assert_eq!(summary.distinct_learners, 2);
        assert_eq!(summary.sessions_scheduled, 2);
        assert_eq!(summary.credits_earned, 0);
    }

    #[tokio::test]
    async fn engagement_of_new_user_is_empty() {
        let store = Arc::new(InMemoryMarketStore::new());
        let analytics = StoreAnalytics::new(store);
        let summary = analytics.engagement(Uuid::new_v4()).await.expect("engagement");
        assert_eq!(summary.open_exchanges, 0);
        assert_eq!(summary.messages_sent, 0);
    }
}
