use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MarketError, MarketResult};

pub type UserId = Uuid;

/// Declares a `snake_case` string enum with the text form used in storage.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = MarketError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(MarketError::validation(format!(
                        "unknown {}: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

string_enum! {
    #[derive(PartialOrd, Ord)]
    SkillLevel {
        Beginner => "beginner",
        Intermediate => "intermediate",
        Advanced => "advanced",
        Expert => "expert",
    }
}

string_enum! {
    TeachingMethod {
        Online => "online",
        InPerson => "in_person",
        Hybrid => "hybrid",
    }
}

string_enum! {
    /// Lifecycle shared by swaps and exchanges.
    Status {
        Pending => "pending",
        Accepted => "accepted",
        InProgress => "in_progress",
        Completed => "completed",
        Rejected => "rejected",
        Cancelled => "cancelled",
    }
}

string_enum! {
    NotificationKind {
        SwapRequested => "swap_requested",
        SwapAccepted => "swap_accepted",
        SwapRejected => "swap_rejected",
        SwapStarted => "swap_started",
        SwapCompleted => "swap_completed",
        SwapCancelled => "swap_cancelled",
        SessionScheduled => "session_scheduled",
        SessionRemoved => "session_removed",
        ExchangeProposed => "exchange_proposed",
        ExchangeStatusChanged => "exchange_status_changed",
        MessageReceived => "message_received",
    }
}

string_enum! {
    RelatedType {
        Swap => "swap",
        Exchange => "exchange",
        Message => "message",
    }
}

impl Status {
    /// Statuses that still hold a claim on their offering and request.
    pub const ACTIVE: [Status; 3] = [Status::Pending, Status::Accepted, Status::InProgress];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Accepted)
                | (Self::Pending, Self::Rejected)
                | (Self::Accepted, Self::InProgress)
                | (Self::Accepted, Self::Completed)
                | (Self::InProgress, Self::Completed)
                | (Self::Pending | Self::Accepted | Self::InProgress, Self::Cancelled)
        )
    }

    pub fn transition(self, next: Status) -> MarketResult<Status> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(MarketError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillCategory {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillOffering {
    pub id: Uuid,
    pub owner_id: UserId,
    pub category_id: Uuid,
    pub title: String,
    pub description: String,
    pub experience_level: SkillLevel,
    pub teaching_method: TeachingMethod,
    pub location: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillRequest {
    pub id: Uuid,
    pub owner_id: UserId,
    pub category_id: Uuid,
    pub title: String,
    pub description: String,
    pub current_level: SkillLevel,
    pub desired_level: SkillLevel,
    pub preferred_method: TeachingMethod,
    pub availability: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Editable fields of an offering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferingDraft {
    pub category_id: Uuid,
    pub title: String,
    pub description: String,
    pub experience_level: SkillLevel,
    pub teaching_method: TeachingMethod,
    pub location: Option<String>,
}

/// Editable fields of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDraft {
    pub category_id: Uuid,
    pub title: String,
    pub description: String,
    pub current_level: SkillLevel,
    pub desired_level: SkillLevel,
    pub preferred_method: TeachingMethod,
    pub availability: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreditAccount {
    pub user_id: UserId,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: UserId,
    pub amount: i64,
    pub description: String,
    pub related_id: Option<Uuid>,
    pub balance_after: i64,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Teacher,
    Learner,
}

/// Rating and comment a party leaves when completing a swap.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feedback {
    pub rating: Option<u8>,
    pub comment: Option<String>,
}

impl Feedback {
    pub fn validate(&self) -> MarketResult<()> {
        match self.rating {
            Some(rating) if !(1..=5).contains(&rating) => Err(MarketError::validation(
                "rating must be between 1 and 5",
            )),
            _ => Ok(()),
        }
    }
}

/// Identity of a proposal for duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProposalKey {
    ForRequest { offering_id: Uuid, request_id: Uuid },
    Direct { offering_id: Uuid, learner_id: UserId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Swap {
    pub id: Uuid,
    pub teacher_id: UserId,
    pub learner_id: UserId,
    pub offering_id: Option<Uuid>,
    pub request_id: Option<Uuid>,
    pub status: Status,
    pub scheduled_times: Vec<DateTime<Utc>>,
    pub teacher_rating: Option<u8>,
    pub learner_rating: Option<u8>,
    pub teacher_feedback: Option<String>,
    pub learner_feedback: Option<String>,
    pub is_credit_based: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Swap {
    pub fn propose(
        teacher_id: UserId,
        learner_id: UserId,
        offering_id: Uuid,
        request_id: Option<Uuid>,
        is_credit_based: bool,
        now: DateTime<Utc>,
    ) -> MarketResult<Self> {
        if teacher_id == learner_id {
            return Err(MarketError::validation(
                "teacher and learner must be different users",
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            teacher_id,
            learner_id,
            offering_id: Some(offering_id),
            request_id,
            status: Status::Pending,
            scheduled_times: Vec::new(),
            teacher_rating: None,
            learner_rating: None,
            teacher_feedback: None,
            learner_feedback: None,
            is_credit_based,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    pub fn role_of(&self, user_id: UserId) -> Option<Role> {
        if user_id == self.teacher_id {
            Some(Role::Teacher)
        } else if user_id == self.learner_id {
            Some(Role::Learner)
        } else {
            None
        }
    }

    pub fn counterpart(&self, user_id: UserId) -> Option<UserId> {
        match self.role_of(user_id)? {
            Role::Teacher => Some(self.learner_id),
            Role::Learner => Some(self.teacher_id),
        }
    }

    pub fn proposal_key(&self) -> Option<ProposalKey> {
        let offering_id = self.offering_id?;
        Some(match self.request_id {
            Some(request_id) => ProposalKey::ForRequest {
                offering_id,
                request_id,
            },
            None => ProposalKey::Direct {
                offering_id,
                learner_id: self.learner_id,
            },
        })
    }

    pub fn references(&self, entity_id: Uuid) -> bool {
        self.offering_id == Some(entity_id) || self.request_id == Some(entity_id)
    }

    /// Moves to `next`, stamping the completion time when it applies.
    pub fn advance(&mut self, next: Status, now: DateTime<Utc>) -> MarketResult<()> {
        self.status = self.status.transition(next)?;
        self.updated_at = now;
        if next == Status::Completed {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub fn record_feedback(&mut self, role: Role, feedback: Feedback) {
        match role {
            Role::Teacher => {
                self.teacher_rating = feedback.rating;
                self.teacher_feedback = feedback.comment;
            }
            Role::Learner => {
                self.learner_rating = feedback.rating;
                self.learner_feedback = feedback.comment;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Exchange {
    pub id: Uuid,
    pub user1_id: UserId,
    pub user2_id: UserId,
    pub swap1_id: Uuid,
    pub swap2_id: Option<Uuid>,
    pub status: Status,
    pub created_by: UserId,
    pub is_credit_based: bool,
    pub credit_amount: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Exchange {
    pub fn swap_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        std::iter::once(self.swap1_id).chain(self.swap2_id)
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        user_id == self.user1_id || user_id == self.user2_id
    }

    pub fn counterpart(&self, user_id: UserId) -> Option<UserId> {
        if user_id == self.user1_id {
            Some(self.user2_id)
        } else if user_id == self.user2_id {
            Some(self.user1_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub related_id: Option<Uuid>,
    pub related_type: Option<RelatedType>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        user_id: UserId,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        related: Option<(Uuid, RelatedType)>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            title: title.into(),
            message: message.into(),
            related_id: related.map(|(id, _)| id),
            related_type: related.map(|(_, related_type)| related_type),
            is_read: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub exchange_id: Uuid,
    pub sender_id: UserId,
    pub content: String,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Status::Pending, Status::Accepted, true)]
    #[case(Status::Pending, Status::Rejected, true)]
    #[case(Status::Pending, Status::Cancelled, true)]
    #[case(Status::Pending, Status::InProgress, false)]
    #[case(Status::Pending, Status::Completed, false)]
    #[case(Status::Accepted, Status::InProgress, true)]
    #[case(Status::Accepted, Status::Completed, true)]
    #[case(Status::Accepted, Status::Rejected, false)]
    #[case(Status::InProgress, Status::Completed, true)]
    #[case(Status::InProgress, Status::Cancelled, true)]
    #[case(Status::Completed, Status::Cancelled, false)]
    #[case(Status::Rejected, Status::Completed, false)]
    #[case(Status::Cancelled, Status::Pending, false)]
    fn transition_table(#[case] from: Status, #[case] to: Status, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
        assert_eq!(from.transition(to).is_ok(), allowed);
    }

    #[test]
    fn status_round_trips_through_storage_text() {
        for status in [
            Status::Pending,
            Status::Accepted,
            Status::InProgress,
            Status::Completed,
            Status::Rejected,
            Status::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<Status>().ok(), Some(status));
        }
        assert!("archived".parse::<Status>().is_err());
    }

    #[test]
    fn self_pairing_is_rejected() {
        let user = Uuid::new_v4();
        let result = Swap::propose(user, user, Uuid::new_v4(), None, false, Utc::now());
        assert!(matches!(result, Err(MarketError::Validation(_))));
    }

    #[test]
    fn proposal_key_prefers_request_pairing() {
        let offering_id = Uuid::new_v4();
        let request_id = Uuid::new_v4();
        let learner_id = Uuid::new_v4();
        let mut swap = Swap::propose(
            Uuid::new_v4(),
            learner_id,
            offering_id,
            Some(request_id),
            false,
            Utc::now(),
        )
        .expect("valid swap");

        assert_eq!(
            swap.proposal_key(),
            Some(ProposalKey::ForRequest {
                offering_id,
                request_id
            })
        );

        swap.request_id = None;
        assert_eq!(
            swap.proposal_key(),
            Some(ProposalKey::Direct {
                offering_id,
                learner_id
            })
        );
    }

    #[test]
    fn completing_stamps_completion_time() {
        let now = Utc::now();
        let mut swap =
            Swap::propose(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), None, false, now)
                .expect("valid swap");

        swap.advance(Status::Accepted, now).expect("accept");
        assert!(swap.completed_at.is_none());
        swap.advance(Status::Completed, now).expect("complete");
        assert_eq!(swap.completed_at, Some(now));
        assert!(swap.advance(Status::Cancelled, now).is_err());
    }

    #[test]
    fn feedback_rating_must_be_in_range() {
        assert!(Feedback { rating: Some(0), comment: None }.validate().is_err());
        assert!(Feedback { rating: Some(6), comment: None }.validate().is_err());
        assert!(Feedback { rating: Some(5), comment: None }.validate().is_ok());
        assert!(Feedback::default().validate().is_ok());
    }
}
