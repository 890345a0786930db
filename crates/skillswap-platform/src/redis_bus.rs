use anyhow::Result;
use async_trait::async_trait;
use redis::{AsyncCommands, Client};
use serde::Serialize;
use skillswap_core::{ChangeEvent, EventSink};

pub const NOTIFICATIONS_CHANNEL: &str = "notifications.created";
pub const MESSAGES_CHANNEL: &str = "messages.created";

/// Channels a gateway subscribes to in order to feed its live streams.
pub const CHANGE_CHANNELS: [&str; 2] = [NOTIFICATIONS_CHANNEL, MESSAGES_CHANNEL];

#[derive(Clone)]
pub struct RedisBus {
    client: Client,
}

impl RedisBus {
    pub fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn publish_json<T: Serialize>(&self, channel: &str, payload: &T) -> Result<()> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(payload)?;
        let _: i64 = connection.publish(channel, serialized).await?;
        Ok(())
    }
}

pub fn channel_for(event: &ChangeEvent) -> &'static str {
    match event {
        ChangeEvent::NotificationCreated(_) => NOTIFICATIONS_CHANNEL,
        ChangeEvent::MessageCreated(_) => MESSAGES_CHANNEL,
    }
}

#[async_trait]
impl EventSink for RedisBus {
    async fn publish(&self, event: ChangeEvent) -> Result<()> {
        self.publish_json(channel_for(&event), &event).await
    }
}
