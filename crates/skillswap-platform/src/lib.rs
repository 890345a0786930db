pub mod config;
pub mod contracts;
pub mod db;
pub mod pg_store;
pub mod redis_bus;

pub use config::ServiceConfig;
pub use contracts::{
    BalanceResponse, MarkAllReadResponse, MatchesQuery, NotificationsQuery, OfferingsQuery,
    RatingsRequest, RequestsQuery, ScheduleSessionRequest, SendMessageRequest,
    UpdateExchangeStatusRequest,
};
pub use db::{apply_schema, connect_database};
pub use pg_store::PgMarketStore;
pub use redis_bus::{CHANGE_CHANNELS, MESSAGES_CHANNEL, NOTIFICATIONS_CHANNEL, RedisBus};
