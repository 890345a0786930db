use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skillswap_core::{
    Changeset, Feedback, MarketError, MarketResult, NotificationKind, SharedStore, Status,
    Swap, UserId,
};
use tracing::info;
use uuid::Uuid;

use crate::notify::{Notifier, swap_notice};

/// Arguments for a stand-alone swap proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapProposal {
    pub teacher_id: UserId,
    pub learner_id: UserId,
    pub offering_id: Uuid,
    pub request_id: Option<Uuid>,
    #[serde(default)]
    pub is_credit_based: bool,
}

/// Single teacher/learner arrangements and their lifecycle.
#[derive(Clone)]
pub struct SwapService {
    store: SharedStore,
    notifier: Notifier,
}

impl SwapService {
    pub fn new(store: SharedStore, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Visible to its teacher and learner only.
    pub async fn swap(&self, actor_id: UserId, swap_id: Uuid) -> MarketResult<Swap> {
        let swap = self.load(swap_id).await?;
        if swap.role_of(actor_id).is_none() {
            return Err(MarketError::not_found("swap", swap_id));
        }
        Ok(swap)
    }

    pub async fn swaps_for(&self, user_id: UserId) -> MarketResult<Vec<Swap>> {
        self.store.swaps_for_user(user_id).await
    }

    /// Rejects a second active proposal for the same pairing with
    /// `DuplicateProposal` naming the swap already in flight.
    pub async fn create(&self, actor_id: UserId, proposal: SwapProposal) -> MarketResult<Swap> {
        if actor_id != proposal.teacher_id && actor_id != proposal.learner_id {
            return Err(MarketError::unauthorized(
                "a swap can only be proposed by its teacher or learner",
            ));
        }

        let offering = self
            .store
            .find_offering(proposal.offering_id)
            .await?
            .ok_or_else(|| MarketError::not_found("offering", proposal.offering_id))?;
        if offering.owner_id != proposal.teacher_id {
            return Err(MarketError::validation("the teacher must own the offering"));
        }
        if !offering.is_active {
            return Err(MarketError::validation("the offering is not active"));
        }

        if let Some(request_id) = proposal.request_id {
            let request = self
                .store
                .find_request(request_id)
                .await?
                .ok_or_else(|| MarketError::not_found("request", request_id))?;
            if request.owner_id != proposal.learner_id {
                return Err(MarketError::validation("the learner must own the request"));
            }
            if request.category_id != offering.category_id {
                return Err(MarketError::validation(
                    "the offering and request are in different categories",
                ));
            }
        }

        let swap = Swap::propose(
            proposal.teacher_id,
            proposal.learner_id,
            proposal.offering_id,
            proposal.request_id,
            proposal.is_credit_based,
            Utc::now(),
        )?;
        let recipient = swap
            .counterpart(actor_id)
            .ok_or_else(|| MarketError::unauthorized("not a party to this swap"))?;
        let notice = swap_notice(&swap, recipient, NotificationKind::SwapRequested);

        let mut changeset = Changeset::default();
        changeset.insert_swap(swap.clone()).notify(notice.clone());
        self.store.commit(changeset).await?;
        self.notifier.announce(vec![notice]).await;

        info!(
            swap_id = %swap.id,
            teacher_id = %swap.teacher_id,
            learner_id = %swap.learner_id,
            "swap proposed"
        );
        Ok(swap)
    }

    pub async fn accept(&self, actor_id: UserId, swap_id: Uuid) -> MarketResult<Swap> {
        self.teacher_decision(actor_id, swap_id, Status::Accepted, NotificationKind::SwapAccepted)
            .await
    }

    pub async fn reject(&self, actor_id: UserId, swap_id: Uuid) -> MarketResult<Swap> {
        self.teacher_decision(actor_id, swap_id, Status::Rejected, NotificationKind::SwapRejected)
            .await
    }

    pub async fn start(&self, actor_id: UserId, swap_id: Uuid) -> MarketResult<Swap> {
        let swap = self.swap(actor_id, swap_id).await?;
        self.advance(actor_id, swap, Status::InProgress, NotificationKind::SwapStarted, None)
            .await
    }

    /// Records the acting party's feedback alongside completion.
    pub async fn complete(
        &self,
        actor_id: UserId,
        swap_id: Uuid,
        feedback: Feedback,
    ) -> MarketResult<Swap> {
        feedback.validate()?;
        let swap = self.swap(actor_id, swap_id).await?;
        self.advance(
            actor_id,
            swap,
            Status::Completed,
            NotificationKind::SwapCompleted,
            Some(feedback),
        )
        .await
    }

    /// Lets the other party rate a swap that is already completed.
    pub async fn leave_feedback(
        &self,
        actor_id: UserId,
        swap_id: Uuid,
        feedback: Feedback,
    ) -> MarketResult<Swap> {
        feedback.validate()?;
        let mut swap = self.swap(actor_id, swap_id).await?;
        if swap.status != Status::Completed {
            return Err(MarketError::validation(
                "feedback can only be left on completed swaps",
            ));
        }
        let role = swap
            .role_of(actor_id)
            .ok_or_else(|| MarketError::not_found("swap", swap_id))?;
        let revision = swap.updated_at;
        swap.record_feedback(role, feedback);
        swap.updated_at = Utc::now();

        let mut changeset = Changeset::default();
        changeset.revise_swap(swap.clone(), Status::Completed, revision);
        self.store.commit(changeset).await?;
        Ok(swap)
    }

    pub async fn cancel(&self, actor_id: UserId, swap_id: Uuid) -> MarketResult<Swap> {
        let swap = self.swap(actor_id, swap_id).await?;
        self.advance(actor_id, swap, Status::Cancelled, NotificationKind::SwapCancelled, None)
            .await
    }

    pub async fn add_scheduled_session(
        &self,
        actor_id: UserId,
        swap_id: Uuid,
        at: DateTime<Utc>,
    ) -> MarketResult<Swap> {
        let mut swap = self.swap(actor_id, swap_id).await?;
        if swap.status.is_terminal() {
            return Err(MarketError::validation(format!(
                "cannot schedule sessions on a {} swap",
                swap.status
            )));
        }
        swap.scheduled_times.push(at);
        self.save_schedule(actor_id, swap, NotificationKind::SessionScheduled)
            .await
    }

    pub async fn remove_scheduled_session(
        &self,
        actor_id: UserId,
        swap_id: Uuid,
        index: usize,
    ) -> MarketResult<Swap> {
        let mut swap = self.swap(actor_id, swap_id).await?;
        let len = swap.scheduled_times.len();
        if index >= len {
            return Err(MarketError::IndexOutOfRange { index, len });
        }
        swap.scheduled_times.remove(index);
        self.save_schedule(actor_id, swap, NotificationKind::SessionRemoved)
            .await
    }

    async fn load(&self, swap_id: Uuid) -> MarketResult<Swap> {
        self.store
            .find_swap(swap_id)
            .await?
            .ok_or_else(|| MarketError::not_found("swap", swap_id))
    }

    async fn teacher_decision(
        &self,
        actor_id: UserId,
        swap_id: Uuid,
        next: Status,
        kind: NotificationKind,
    ) -> MarketResult<Swap> {
        let swap = self.swap(actor_id, swap_id).await?;
        if swap.teacher_id != actor_id {
            return Err(MarketError::unauthorized(
                "only the teacher can accept or decline a swap",
            ));
        }
        self.advance(actor_id, swap, next, kind, None).await
    }

    async fn advance(
        &self,
        actor_id: UserId,
        mut swap: Swap,
        next: Status,
        kind: NotificationKind,
        feedback: Option<Feedback>,
    ) -> MarketResult<Swap> {
        let previous = swap.status;
        let revision = swap.updated_at;
        swap.advance(next, Utc::now())?;
        if let (Some(feedback), Some(role)) = (feedback, swap.role_of(actor_id)) {
            swap.record_feedback(role, feedback);
        }
        let recipient = swap
            .counterpart(actor_id)
            .ok_or_else(|| MarketError::not_found("swap", swap.id))?;
        let notice = swap_notice(&swap, recipient, kind);

        let mut changeset = Changeset::default();
        changeset
            .revise_swap(swap.clone(), previous, revision)
            .notify(notice.clone());
        self.store.commit(changeset).await?;
        self.notifier.announce(vec![notice]).await;

        info!(swap_id = %swap.id, from = %previous, to = %next, "swap status changed");
        Ok(swap)
    }

    /// `swap` carries the edited schedule but still the `updated_at` it was
    /// read with, which guards the write.
    async fn save_schedule(
        &self,
        actor_id: UserId,
        mut swap: Swap,
        kind: NotificationKind,
    ) -> MarketResult<Swap> {
        let revision = swap.updated_at;
        swap.updated_at = Utc::now();
        let recipient = swap
            .counterpart(actor_id)
            .ok_or_else(|| MarketError::not_found("swap", swap.id))?;
        let notice = swap_notice(&swap, recipient, kind);

        let mut changeset = Changeset::default();
        changeset
            .revise_swap(swap.clone(), swap.status, revision)
            .notify(notice.clone());
        self.store.commit(changeset).await?;
        self.notifier.announce(vec![notice]).await;
        Ok(swap)
    }
}
