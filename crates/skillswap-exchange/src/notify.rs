use skillswap_core::{
    ChangeEvent, Changeset, Exchange, MarketResult, Notification, NotificationKind, RelatedType,
    SharedSink, SharedStore, Status, Swap, UserId,
};
use tracing::error;
use uuid::Uuid;

/// Writes notifications and pushes them to live subscribers.
#[derive(Clone)]
pub struct Notifier {
    store: SharedStore,
    sink: SharedSink,
}

impl Notifier {
    pub fn new(store: SharedStore, sink: SharedSink) -> Self {
        Self { store, sink }
    }

    pub async fn notify(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        title: &str,
        message: &str,
        related: Option<(Uuid, RelatedType)>,
    ) -> MarketResult<Notification> {
        let notification = Notification::new(user_id, kind, title, message, related);
        let mut changeset = Changeset::default();
        changeset.notify(notification.clone());
        self.store.commit(changeset).await?;
        self.publish(ChangeEvent::NotificationCreated(notification.clone()))
            .await;
        Ok(notification)
    }

    pub async fn list(
        &self,
        user_id: UserId,
        unread_only: bool,
    ) -> MarketResult<Vec<Notification>> {
        self.store.notifications_for(user_id, unread_only).await
    }

    pub async fn mark_read(&self, user_id: UserId, notification_id: Uuid) -> MarketResult<()> {
        self.store
            .mark_notification_read(user_id, notification_id)
            .await
    }

    pub async fn mark_all_read(&self, user_id: UserId) -> MarketResult<u64> {
        self.store.mark_all_notifications_read(user_id).await
    }

    /// Pushes committed notifications. The rows are already durable, so a
    /// failed push is logged rather than returned.
    pub async fn announce(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.publish(ChangeEvent::NotificationCreated(notification))
                .await;
        }
    }

    pub async fn publish(&self, event: ChangeEvent) {
        if let Err(err) = self.sink.publish(event).await {
            error!("failed to publish change event: {err:#}");
        }
    }
}

pub(crate) fn swap_notice(swap: &Swap, recipient: UserId, kind: NotificationKind) -> Notification {
    let (title, message) = match kind {
        NotificationKind::SwapRequested => (
            "New swap request",
            "Someone wants to swap skills with you.",
        ),
        NotificationKind::SwapAccepted => ("Swap accepted", "Your swap request was accepted."),
        NotificationKind::SwapRejected => ("Swap declined", "Your swap request was declined."),
        NotificationKind::SwapStarted => ("Swap started", "Your swap is now in progress."),
        NotificationKind::SwapCompleted => ("Swap completed", "Your swap was marked as completed."),
        NotificationKind::SwapCancelled => (
            "Swap cancelled",
            "A swap you are part of was cancelled.",
        ),
        NotificationKind::SessionScheduled => (
            "Session scheduled",
            "A new session was added to your swap.",
        ),
        NotificationKind::SessionRemoved => (
            "Session removed",
            "A session was removed from your swap.",
        ),
        _ => ("Swap updated", "A swap you are part of changed."),
    };
    Notification::new(recipient, kind, title, message, Some((swap.id, RelatedType::Swap)))
}

pub(crate) fn exchange_notice(
    exchange: &Exchange,
    recipient: UserId,
    status: Status,
) -> Notification {
    let (kind, title) = match status {
        Status::Pending => (
            NotificationKind::ExchangeProposed,
            "New exchange proposal".to_string(),
        ),
        other => (
            NotificationKind::ExchangeStatusChanged,
            format!("Exchange {}", other.as_str().replace('_', " ")),
        ),
    };
    let message = if exchange.is_credit_based {
        format!(
            "A credit-funded exchange ({} credits) is now {status}.",
            exchange.credit_amount.unwrap_or_default()
        )
    } else {
        format!("A skill exchange is now {status}.")
    };
    Notification::new(
        recipient,
        kind,
        title,
        message,
        Some((exchange.id, RelatedType::Exchange)),
    )
}
