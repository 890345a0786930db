use chrono::Utc;
use serde::{Deserialize, Serialize};
use skillswap_core::{
    Changeset, Exchange, LedgerPosting, MarketConfig, MarketError, MarketResult, SharedStore,
    SkillOffering, Status, Swap, UserId,
};
use skillswap_ledger::{CreditLedger, earn_posting, spend_posting};
use tracing::info;
use uuid::Uuid;

use crate::notify::{Notifier, exchange_notice};

/// The two ways to open an exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExchangeProposal {
    /// Each side teaches one of their own offerings to the other.
    Reciprocal {
        partner_id: UserId,
        my_offering_id: Uuid,
        their_offering_id: Uuid,
    },
    /// The proposer pays credits to learn from the offering's owner.
    CreditFunded { offering_id: Uuid, credit_cost: i64 },
}

/// An exchange with its constituent swaps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExchangeDetail {
    pub exchange: Exchange,
    pub swaps: Vec<Swap>,
}

#[derive(Clone)]
pub struct ExchangeService {
    store: SharedStore,
    ledger: CreditLedger,
    notifier: Notifier,
    reward_teachers: bool,
}

impl ExchangeService {
    pub fn new(
        store: SharedStore,
        ledger: CreditLedger,
        notifier: Notifier,
        config: &MarketConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            notifier,
            reward_teachers: config.reward_teachers,
        }
    }

    pub async fn propose(
        &self,
        actor_id: UserId,
        proposal: ExchangeProposal,
    ) -> MarketResult<Exchange> {
        match proposal {
            ExchangeProposal::Reciprocal {
                partner_id,
                my_offering_id,
                their_offering_id,
            } => {
                self.create_reciprocal(actor_id, partner_id, my_offering_id, their_offering_id)
                    .await
            }
            ExchangeProposal::CreditFunded {
                offering_id,
                credit_cost,
            } => {
                let offering = self.active_offering(offering_id).await?;
                self.create_credit_funded(actor_id, offering.owner_id, offering_id, credit_cost)
                    .await
            }
        }
    }

    /// swap1: user1 teaches user2 with offering1; swap2: user2 teaches user1
    /// with offering2. Both swaps and the exchange land in one commit.
    pub async fn create_reciprocal(
        &self,
        user1_id: UserId,
        user2_id: UserId,
        offering1_id: Uuid,
        offering2_id: Uuid,
    ) -> MarketResult<Exchange> {
        let offering1 = self.active_offering(offering1_id).await?;
        let offering2 = self.active_offering(offering2_id).await?;
        ensure_owner(&offering1, user1_id)?;
        ensure_owner(&offering2, user2_id)?;

        let now = Utc::now();
        let swap1 = Swap::propose(user1_id, user2_id, offering1_id, None, false, now)?;
        let swap2 = Swap::propose(user2_id, user1_id, offering2_id, None, false, now)?;
        let exchange = Exchange {
            id: Uuid::new_v4(),
            user1_id,
            user2_id,
            swap1_id: swap1.id,
            swap2_id: Some(swap2.id),
            status: Status::Pending,
            created_by: user1_id,
            is_credit_based: false,
            credit_amount: None,
            created_at: now,
            updated_at: now,
        };
        let notice = exchange_notice(&exchange, user2_id, Status::Pending);

        let mut changeset = Changeset::default();
        changeset
            .insert_swap(swap1)
            .insert_swap(swap2)
            .insert_exchange(exchange.clone())
            .notify(notice.clone());
        self.store.commit(changeset).await?;
        self.notifier.announce(vec![notice]).await;

        info!(exchange_id = %exchange.id, %user1_id, %user2_id, "reciprocal exchange proposed");
        Ok(exchange)
    }

    /// The learner's debit commits together with the swap and exchange, so
    /// credits are never spent without an exchange and vice versa.
    pub async fn create_credit_funded(
        &self,
        learner_id: UserId,
        teacher_id: UserId,
        offering_id: Uuid,
        credit_cost: i64,
    ) -> MarketResult<Exchange> {
        let offering = self.active_offering(offering_id).await?;
        ensure_owner(&offering, teacher_id)?;

        let balance = self.ledger.get_balance(learner_id).await?;
        if balance < credit_cost {
            return Err(MarketError::InsufficientCredits {
                balance,
                required: credit_cost,
            });
        }

        let now = Utc::now();
        let swap = Swap::propose(teacher_id, learner_id, offering_id, None, true, now)?;
        let exchange = Exchange {
            id: Uuid::new_v4(),
            user1_id: teacher_id,
            user2_id: learner_id,
            swap1_id: swap.id,
            swap2_id: None,
            status: Status::Pending,
            created_by: learner_id,
            is_credit_based: true,
            credit_amount: Some(credit_cost),
            created_at: now,
            updated_at: now,
        };
        let debit = spend_posting(
            learner_id,
            credit_cost,
            &format!("Learning: {}", offering.title),
            Some(exchange.id),
        )?;
        let notice = exchange_notice(&exchange, teacher_id, Status::Pending);

        let mut changeset = Changeset::default();
        changeset
            .insert_swap(swap)
            .insert_exchange(exchange.clone())
            .post(debit)
            .notify(notice.clone());
        self.store.commit(changeset).await?;
        self.notifier.announce(vec![notice]).await;

        info!(
            exchange_id = %exchange.id,
            %learner_id,
            %teacher_id,
            credit_cost,
            "credit-funded exchange proposed"
        );
        Ok(exchange)
    }

    /// Participants only; others get `NotFound`.
    pub async fn exchange(
        &self,
        actor_id: UserId,
        exchange_id: Uuid,
    ) -> MarketResult<ExchangeDetail> {
        let exchange = self.load(exchange_id).await?;
        if !exchange.is_participant(actor_id) {
            return Err(MarketError::not_found("exchange", exchange_id));
        }
        let swaps = self.constituent_swaps(&exchange).await?;
        Ok(ExchangeDetail { exchange, swaps })
    }

    pub async fn exchanges_for(&self, user_id: UserId) -> MarketResult<Vec<Exchange>> {
        self.store.exchanges_for_user(user_id).await
    }

    /// Moves the exchange and, where the rules call for it, its swaps and
    /// credits in one commit, then notifies the counterpart.
    ///
    /// * accept / reject: the recipient of a pending exchange; pending swaps
    ///   follow.
    /// * cancel: the creator while pending, either party afterwards; active
    ///   swaps follow and a credit-funded learner is refunded.
    /// * reject and cancel are refused once any swap has been completed.
    /// * in progress: either party once accepted.
    /// * complete: either party once every swap has been accepted; swaps are
    ///   completed individually by their own parties.
    pub async fn update_status(
        &self,
        actor_id: UserId,
        exchange_id: Uuid,
        next: Status,
    ) -> MarketResult<Exchange> {
        let mut exchange = self.load(exchange_id).await?;
        let counterpart = exchange
            .counterpart(actor_id)
            .ok_or_else(|| MarketError::unauthorized("not a party to this exchange"))?;
        let previous = exchange.status;
        previous.transition(next)?;

        match next {
            Status::Accepted | Status::Rejected if exchange.created_by == actor_id => {
                return Err(MarketError::unauthorized(
                    "only the recipient can accept or decline an exchange",
                ));
            }
            Status::Cancelled if previous == Status::Pending && exchange.created_by != actor_id => {
                return Err(MarketError::unauthorized(
                    "only the creator can withdraw a pending exchange; decline it instead",
                ));
            }
            _ => {}
        }

        let swaps = self.constituent_swaps(&exchange).await?;
        let now = Utc::now();
        let mut changeset = Changeset::default();

        match next {
            Status::Completed => {
                if let Some(unready) = swaps.iter().find(|swap| {
                    !matches!(
                        swap.status,
                        Status::Accepted | Status::InProgress | Status::Completed
                    )
                }) {
                    return Err(MarketError::InvalidTransition {
                        from: unready.status,
                        to: Status::Completed,
                    });
                }
            }
            Status::Accepted | Status::Rejected | Status::Cancelled => {
                if next != Status::Accepted
                    && swaps.iter().any(|swap| swap.status == Status::Completed)
                {
                    return Err(MarketError::InvalidTransition {
                        from: Status::Completed,
                        to: next,
                    });
                }
                for mut swap in swaps {
                    let follows = match next {
                        Status::Cancelled => swap.status.is_active(),
                        _ => swap.status == Status::Pending,
                    };
                    if follows {
                        let expected = swap.status;
                        let revision = swap.updated_at;
                        swap.advance(next, now)?;
                        changeset.revise_swap(swap, expected, revision);
                    }
                }
            }
            _ => {}
        }

        if let Some(posting) = self.settlement(&exchange, next).await? {
            changeset.post(posting);
        }

        exchange.status = next;
        exchange.updated_at = now;
        let notice = exchange_notice(&exchange, counterpart, next);
        changeset
            .update_exchange(exchange.clone(), previous)
            .notify(notice.clone());
        self.store.commit(changeset).await?;
        self.notifier.announce(vec![notice]).await;

        info!(%exchange_id, from = %previous, to = %next, %actor_id, "exchange status changed");
        Ok(exchange)
    }

    /// Credit movement for a credit-funded exchange reaching `next`.
    async fn settlement(
        &self,
        exchange: &Exchange,
        next: Status,
    ) -> MarketResult<Option<LedgerPosting>> {
        let Some(amount) = exchange.credit_amount.filter(|_| exchange.is_credit_based) else {
            return Ok(None);
        };
        if amount <= 0 {
            return Ok(None);
        }

        let (user_id, description) = match next {
            Status::Completed if self.reward_teachers => {
                (exchange.user1_id, "Taught a credit-funded exchange")
            }
            Status::Rejected | Status::Cancelled => {
                (exchange.user2_id, "Refund for unfinished exchange")
            }
            _ => return Ok(None),
        };
        self.ledger.account(user_id).await?;
        earn_posting(user_id, amount, description, Some(exchange.id)).map(Some)
    }

    async fn load(&self, exchange_id: Uuid) -> MarketResult<Exchange> {
        self.store
            .find_exchange(exchange_id)
            .await?
            .ok_or_else(|| MarketError::not_found("exchange", exchange_id))
    }

    async fn constituent_swaps(&self, exchange: &Exchange) -> MarketResult<Vec<Swap>> {
        let mut swaps = Vec::with_capacity(2);
        for swap_id in exchange.swap_ids() {
            let swap = self
                .store
                .find_swap(swap_id)
                .await?
                .ok_or_else(|| MarketError::not_found("swap", swap_id))?;
            swaps.push(swap);
        }
        Ok(swaps)
    }

    async fn active_offering(&self, offering_id: Uuid) -> MarketResult<SkillOffering> {
        let offering = self
            .store
            .find_offering(offering_id)
            .await?
            .ok_or_else(|| MarketError::not_found("offering", offering_id))?;
        if !offering.is_active {
            return Err(MarketError::validation(format!(
                "offering {offering_id} is not active"
            )));
        }
        Ok(offering)
    }
}

fn ensure_owner(offering: &SkillOffering, user_id: UserId) -> MarketResult<()> {
    if offering.owner_id != user_id {
        return Err(MarketError::validation(format!(
            "offering {} does not belong to user {user_id}",
            offering.id
        )));
    }
    Ok(())
}
