use async_trait::async_trait;
use skillswap_core::{ChangeEvent, ChangeTopic, EventSink};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out of committed rows to live subscribers.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Returns how many subscribers were listening.
    pub fn broadcast(&self, event: ChangeEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self, topic: ChangeTopic) -> Subscription {
        Subscription {
            topic,
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventSink for ChangeFeed {
    async fn publish(&self, event: ChangeEvent) -> anyhow::Result<()> {
        self.broadcast(event);
        Ok(())
    }
}

/// Scoped subscription; dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    topic: ChangeTopic,
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn topic(&self) -> ChangeTopic {
        self.topic
    }

    /// Next event on this topic, or `None` once the feed is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.matches(&self.topic) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(topic = ?self.topic, skipped, "subscriber lagged behind change feed");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use skillswap_core::{Message, Notification, NotificationKind};
    use uuid::Uuid;

    use super::*;

    fn message(exchange_id: Uuid) -> Message {
        Message {
            id: Uuid::new_v4(),
            exchange_id,
            sender_id: Uuid::new_v4(),
            content: "hi".to_string(),
            sequence: 1,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_only_sees_its_topic() {
        let feed = ChangeFeed::default();
        let exchange_id = Uuid::new_v4();
        let mut subscription = feed.subscribe(ChangeTopic::Messages { exchange_id });

        feed.broadcast(ChangeEvent::MessageCreated(message(Uuid::new_v4())));
        feed.broadcast(ChangeEvent::NotificationCreated(Notification::new(
            Uuid::new_v4(),
            NotificationKind::MessageReceived,
            "New message",
            "hi",
            None,
        )));
        let wanted = message(exchange_id);
        feed.broadcast(ChangeEvent::MessageCreated(wanted.clone()));

        assert_eq!(
            subscription.next().await,
            Some(ChangeEvent::MessageCreated(wanted))
        );
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let feed = ChangeFeed::default();
        let subscription = feed.subscribe(ChangeTopic::Notifications {
            user_id: Uuid::new_v4(),
        });
        assert_eq!(feed.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(feed.subscriber_count(), 0);
    }
}
