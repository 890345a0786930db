use anyhow::anyhow;
use chrono::Utc;
use skillswap_core::{
    ChangeEvent, Changeset, MarketError, MarketResult, Message, MessageDraft, Notification,
    NotificationKind, RelatedType, SharedStore, UserId,
};
use tracing::debug;
use uuid::Uuid;

use crate::notify::Notifier;

pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Chat between the two parties of an exchange.
#[derive(Clone)]
pub struct MessageService {
    store: SharedStore,
    notifier: Notifier,
}

impl MessageService {
    pub fn new(store: SharedStore, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    pub async fn send(
        &self,
        actor_id: UserId,
        exchange_id: Uuid,
        content: &str,
    ) -> MarketResult<Message> {
        let exchange = self
            .store
            .find_exchange(exchange_id)
            .await?
            .ok_or_else(|| MarketError::not_found("exchange", exchange_id))?;
        let recipient = exchange
            .counterpart(actor_id)
            .ok_or_else(|| MarketError::not_found("exchange", exchange_id))?;

        let content = content.trim();
        if content.is_empty() {
            return Err(MarketError::validation("message must not be empty"));
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(MarketError::validation(format!(
                "message exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }

        let draft = MessageDraft {
            id: Uuid::new_v4(),
            exchange_id,
            sender_id: actor_id,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let notice = Notification::new(
            recipient,
            NotificationKind::MessageReceived,
            "New message",
            preview(content),
            Some((exchange_id, RelatedType::Exchange)),
        );

        let mut changeset = Changeset::default();
        changeset.append_message(draft).notify(notice.clone());
        let receipt = self.store.commit(changeset).await?;
        let message = receipt
            .messages
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("commit returned no message for exchange {exchange_id}"))?;

        self.notifier
            .publish(ChangeEvent::MessageCreated(message.clone()))
            .await;
        self.notifier.announce(vec![notice]).await;

        debug!(%exchange_id, message_id = %message.id, "message sent");
        Ok(message)
    }

    /// In store `sequence` order. Outsiders get `NotFound`.
    pub async fn list(&self, actor_id: UserId, exchange_id: Uuid) -> MarketResult<Vec<Message>> {
        let exchange = self
            .store
            .find_exchange(exchange_id)
            .await?
            .ok_or_else(|| MarketError::not_found("exchange", exchange_id))?;
        if !exchange.is_participant(actor_id) {
            return Err(MarketError::not_found("exchange", exchange_id));
        }
        let history = self.store.messages(exchange_id).await?;
        Ok(Transcript::from_history(history).into_messages())
    }
}

fn preview(content: &str) -> String {
    const LEN: usize = 80;
    if content.chars().count() <= LEN {
        return content.to_string();
    }
    let mut cut: String = content.chars().take(LEN).collect();
    cut.push_str("...");
    cut
}

/// Client-side view of a conversation that tolerates live events arriving
/// before, after or alongside the initial history fetch. Ordered by the
/// store-assigned `sequence`; `created_at` is only the sender's clock.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn from_history(history: Vec<Message>) -> Self {
        let mut transcript = Self::default();
        for message in history {
            transcript.insert(message);
        }
        transcript
    }

    /// Returns false when the message was already present.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.messages.iter().any(|known| known.id == message.id) {
            return false;
        }
        let position = self
            .messages
            .partition_point(|known| known.sequence <= message.sequence);
        self.messages.insert(position, message);
        true
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
