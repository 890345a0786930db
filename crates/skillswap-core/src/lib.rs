pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod scoring;
pub mod storage;

pub use config::MarketConfig;
pub use error::{MarketError, MarketResult};
pub use events::{ChangeEvent, ChangeTopic, EventSink, NoopEventSink};
pub use models::{
    CreditAccount, CreditTransaction, Exchange, Feedback, Message, Notification,
    NotificationKind, OfferingDraft, ProposalKey, RelatedType, RequestDraft, Role, SkillCategory,
    SkillLevel, SkillOffering, SkillRequest, Status, Swap, TeachingMethod, UserId,
};
pub use scoring::{
    AnalyticsAggregator, EngagementAnalytics, LearningAnalytics, MatchScorer, ScoringInput,
    StatusBreakdown, TeachingAnalytics, UserRating,
};
pub use storage::{
    Changeset, CommitReceipt, GuardedUpdate, LedgerPosting, MarketStore, MessageDraft,
    OfferingFilter, OfferingOrder, RequestFilter,
};

use std::sync::Arc;

pub type SharedStore = Arc<dyn MarketStore>;
pub type SharedSink = Arc<dyn EventSink>;
