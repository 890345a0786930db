use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Notification, UserId};

/// What a live subscriber is watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum ChangeTopic {
    Notifications { user_id: UserId },
    Messages { exchange_id: Uuid },
}

/// A newly inserted row pushed to subscribers after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "row", rename_all = "snake_case")]
pub enum ChangeEvent {
    NotificationCreated(Notification),
    MessageCreated(Message),
}

impl ChangeEvent {
    pub fn topic(&self) -> ChangeTopic {
        match self {
            Self::NotificationCreated(notification) => ChangeTopic::Notifications {
                user_id: notification.user_id,
            },
            Self::MessageCreated(message) => ChangeTopic::Messages {
                exchange_id: message.exchange_id,
            },
        }
    }

    pub fn matches(&self, topic: &ChangeTopic) -> bool {
        self.topic() == *topic
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: ChangeEvent) -> anyhow::Result<()>;
}

/// Sink for callers that have no live subscribers.
#[derive(Debug, Default, Clone)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn publish(&self, _event: ChangeEvent) -> anyhow::Result<()> {
        Ok(())
    }
}
