use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    error::MarketResult,
    models::{SkillOffering, SkillRequest, Status, UserId},
};

/// One offering weighed against one request in the same category.
#[derive(Debug, Clone, Copy)]
pub struct ScoringInput<'a> {
    pub offering: &'a SkillOffering,
    pub request: &'a SkillRequest,
    pub teacher_rating: Option<Decimal>,
    pub now: DateTime<Utc>,
}

pub trait MatchScorer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deterministic score in `0..=100`.
    fn score(&self, input: &ScoringInput<'_>) -> u8;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRating {
    pub user_id: UserId,
    pub average_rating: Option<Decimal>,
    pub rating_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBreakdown {
    pub pending: u32,
    pub accepted: u32,
    pub in_progress: u32,
    pub completed: u32,
    pub rejected: u32,
    pub cancelled: u32,
}

impl StatusBreakdown {
    pub fn record(&mut self, status: Status) {
        let slot = match status {
            Status::Pending => &mut self.pending,
            Status::Accepted => &mut self.accepted,
            Status::InProgress => &mut self.in_progress,
            Status::Completed => &mut self.completed,
            Status::Rejected => &mut self.rejected,
            Status::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }

    pub fn total(&self) -> u32 {
        self.pending
            + self.accepted
            + self.in_progress
            + self.completed
            + self.rejected
            + self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeachingAnalytics {
    pub user_id: UserId,
    pub swaps: StatusBreakdown,
    pub distinct_learners: u32,
    pub sessions_scheduled: u32,
    pub average_rating: Option<Decimal>,
    pub rating_count: u32,
    pub credits_earned: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningAnalytics {
    pub user_id: UserId,
    pub swaps: StatusBreakdown,
    pub distinct_teachers: u32,
    pub ratings_given: u32,
    pub credits_spent: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementAnalytics {
    pub user_id: UserId,
    pub active_offerings: u32,
    pub active_requests: u32,
    pub open_exchanges: u32,
    pub completed_exchanges: u32,
    pub unread_notifications: u32,
    pub messages_sent: u32,
}

#[async_trait]
pub trait AnalyticsAggregator: Send + Sync {
    async fn average_ratings(&self, user_ids: &[UserId]) -> MarketResult<Vec<UserRating>>;
    async fn teaching(&self, user_id: UserId) -> MarketResult<TeachingAnalytics>;
    async fn learning(&self, user_id: UserId) -> MarketResult<LearningAnalytics>;
    async fn engagement(&self, user_id: UserId) -> MarketResult<EngagementAnalytics>;
}
