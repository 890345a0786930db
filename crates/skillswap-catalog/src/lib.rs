use std::{cmp::Reverse, collections::HashMap, sync::Arc};

use chrono::Utc;
use rust_decimal::Decimal;
use skillswap_core::{
    AnalyticsAggregator, MarketError, MarketResult, OfferingDraft, OfferingFilter, OfferingOrder,
    RequestDraft, RequestFilter, SharedStore, SkillCategory, SkillOffering, SkillRequest, UserId,
};
use tracing::info;
use uuid::Uuid;

const MAX_TITLE_LEN: usize = 120;

/// Offerings and requests owned by users.
#[derive(Clone)]
pub struct Catalog {
    store: SharedStore,
    ratings: Arc<dyn AnalyticsAggregator>,
}

impl Catalog {
    pub fn new(store: SharedStore, ratings: Arc<dyn AnalyticsAggregator>) -> Self {
        Self { store, ratings }
    }

    pub async fn categories(&self) -> MarketResult<Vec<SkillCategory>> {
        self.store.list_categories().await
    }

    pub async fn offering(&self, id: Uuid) -> MarketResult<SkillOffering> {
        self.store
            .find_offering(id)
            .await?
            .ok_or_else(|| MarketError::not_found("offering", id))
    }

    pub async fn create_offering(
        &self,
        owner_id: UserId,
        draft: OfferingDraft,
    ) -> MarketResult<SkillOffering> {
        self.validate_offering(&draft).await?;
        let now = Utc::now();
        let offering = SkillOffering {
            id: Uuid::new_v4(),
            owner_id,
            category_id: draft.category_id,
            title: draft.title.trim().to_string(),
            description: draft.description.trim().to_string(),
            experience_level: draft.experience_level,
            teaching_method: draft.teaching_method,
            location: normalize_optional(draft.location),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.store.save_offering(&offering).await?;
        info!(offering_id = %offering.id, %owner_id, "offering created");
        Ok(offering)
    }

    pub async fn update_offering(
        &self,
        actor_id: UserId,
        id: Uuid,
        draft: OfferingDraft,
    ) -> MarketResult<SkillOffering> {
        let mut offering = self.owned_offering(actor_id, id).await?;
        self.validate_offering(&draft).await?;
        offering.category_id = draft.category_id;
        offering.title = draft.title.trim().to_string();
        offering.description = draft.description.trim().to_string();
        offering.experience_level = draft.experience_level;
        offering.teaching_method = draft.teaching_method;
        offering.location = normalize_optional(draft.location);
        offering.updated_at = Utc::now();
        self.store.save_offering(&offering).await?;
        Ok(offering)
    }

    pub async fn set_offering_active(
        &self,
        actor_id: UserId,
        id: Uuid,
        is_active: bool,
    ) -> MarketResult<SkillOffering> {
        let mut offering = self.owned_offering(actor_id, id).await?;
        if offering.is_active != is_active {
            offering.is_active = is_active;
            offering.updated_at = Utc::now();
            self.store.save_offering(&offering).await?;
        }
        Ok(offering)
    }

    pub async fn deactivate_offering(
        &self,
        actor_id: UserId,
        id: Uuid,
    ) -> MarketResult<SkillOffering> {
        self.set_offering_active(actor_id, id, false).await
    }

    /// Blocked with `HasActiveExchanges` while a pending, accepted or
    /// in-progress swap uses the offering.
    pub async fn delete_offering(&self, actor_id: UserId, id: Uuid) -> MarketResult<()> {
        self.owned_offering(actor_id, id).await?;
        self.store.delete_offering(id).await?;
        info!(offering_id = %id, "offering deleted");
        Ok(())
    }

    pub async fn list_active_offerings(
        &self,
        filter: &OfferingFilter,
    ) -> MarketResult<Vec<SkillOffering>> {
        let active_only = OfferingFilter {
            include_inactive: false,
            ..filter.clone()
        };
        let offerings = self.store.list_offerings(&active_only).await?;
        if filter.min_rating.is_none() && filter.order == OfferingOrder::Newest {
            return Ok(offerings);
        }

        let owners = distinct_owners(&offerings);
        let ratings: HashMap<UserId, Option<Decimal>> = self
            .ratings
            .average_ratings(&owners)
            .await?
            .into_iter()
            .map(|rating| (rating.user_id, rating.average_rating))
            .collect();
        let rating_of =
            |offering: &SkillOffering| ratings.get(&offering.owner_id).copied().flatten();

        let mut offerings: Vec<_> = offerings
            .into_iter()
            .filter(|offering| {
                filter.min_rating.is_none_or(|minimum| {
                    rating_of(offering).is_some_and(|rating| rating >= minimum)
                })
            })
            .collect();

        if filter.order == OfferingOrder::Rating {
            // Stable sort keeps newest-first among equal ratings.
            offerings.sort_by_key(|offering| Reverse(rating_of(offering)));
        }
        Ok(offerings)
    }

    /// All offerings of one owner, including inactive ones.
    pub async fn offerings_of(&self, owner_id: UserId) -> MarketResult<Vec<SkillOffering>> {
        self.store
            .list_offerings(&OfferingFilter {
                owner_id: Some(owner_id),
                include_inactive: true,
                ..Default::default()
            })
            .await
    }

    pub async fn request(&self, id: Uuid) -> MarketResult<SkillRequest> {
        self.store
            .find_request(id)
            .await?
            .ok_or_else(|| MarketError::not_found("request", id))
    }

    pub async fn create_request(
        &self,
        owner_id: UserId,
        draft: RequestDraft,
    ) -> MarketResult<SkillRequest> {
        self.validate_request(&draft).await?;
        let now = Utc::now();
        let request = SkillRequest {
            id: Uuid::new_v4(),
            owner_id,
            category_id: draft.category_id,
            title: draft.title.trim().to_string(),
            description: draft.description.trim().to_string(),
            current_level: draft.current_level,
            desired_level: draft.desired_level,
            preferred_method: draft.preferred_method,
            availability: normalize_optional(draft.availability),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.store.save_request(&request).await?;
        info!(request_id = %request.id, %owner_id, "request created");
        Ok(request)
    }

    pub async fn update_request(
        &self,
        actor_id: UserId,
        id: Uuid,
        draft: RequestDraft,
    ) -> MarketResult<SkillRequest> {
        let mut request = self.owned_request(actor_id, id).await?;
        self.validate_request(&draft).await?;
        request.category_id = draft.category_id;
        request.title = draft.title.trim().to_string();
        request.description = draft.description.trim().to_string();
        request.current_level = draft.current_level;
        request.desired_level = draft.desired_level;
        request.preferred_method = draft.preferred_method;
        request.availability = normalize_optional(draft.availability);
        request.updated_at = Utc::now();
        self.store.save_request(&request).await?;
        Ok(request)
    }

    pub async fn set_request_active(
        &self,
        actor_id: UserId,
        id: Uuid,
        is_active: bool,
    ) -> MarketResult<SkillRequest> {
        let mut request = self.owned_request(actor_id, id).await?;
        if request.is_active != is_active {
            request.is_active = is_active;
            request.updated_at = Utc::now();
            self.store.save_request(&request).await?;
        }
        Ok(request)
    }

    pub async fn deactivate_request(
        &self,
        actor_id: UserId,
        id: Uuid,
    ) -> MarketResult<SkillRequest> {
        self.set_request_active(actor_id, id, false).await
    }

    pub async fn delete_request(&self, actor_id: UserId, id: Uuid) -> MarketResult<()> {
        self.owned_request(actor_id, id).await?;
        self.store.delete_request(id).await?;
        info!(request_id = %id, "request deleted");
        Ok(())
    }

    pub async fn list_requests(&self, filter: &RequestFilter) -> MarketResult<Vec<SkillRequest>> {
        self.store.list_requests(filter).await
    }

    async fn owned_offering(&self, actor_id: UserId, id: Uuid) -> MarketResult<SkillOffering> {
        let offering = self.offering(id).await?;
        if offering.owner_id != actor_id {
            return Err(MarketError::unauthorized("only the owner can change an offering"));
        }
        Ok(offering)
    }

    async fn owned_request(&self, actor_id: UserId, id: Uuid) -> MarketResult<SkillRequest> {
        let request = self.request(id).await?;
        if request.owner_id != actor_id {
            return Err(MarketError::unauthorized("only the owner can change a request"));
        }
        Ok(request)
    }

    async fn validate_offering(&self, draft: &OfferingDraft) -> MarketResult<()> {
        validate_title(&draft.title)?;
        self.ensure_category(draft.category_id).await
    }

    async fn validate_request(&self, draft: &RequestDraft) -> MarketResult<()> {
        validate_title(&draft.title)?;
        if draft.desired_level < draft.current_level {
            return Err(MarketError::validation(
                "desired_level cannot be below current_level",
            ));
        }
        self.ensure_category(draft.category_id).await
    }

    async fn ensure_category(&self, category_id: Uuid) -> MarketResult<()> {
        if self.store.find_category(category_id).await?.is_none() {
            return Err(MarketError::not_found("category", category_id));
        }
        Ok(())
    }
}

fn validate_title(title: &str) -> MarketResult<()> {
    let title = title.trim();
    if title.is_empty() {
        return Err(MarketError::validation("title is required"));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(MarketError::validation(format!(
            "title must be at most {MAX_TITLE_LEN} characters"
        )));
    }
    Ok(())
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn distinct_owners(offerings: &[SkillOffering]) -> Vec<UserId> {
    let mut owners: Vec<_> = offerings.iter().map(|offering| offering.owner_id).collect();
    owners.sort();
    owners.dedup();
    owners
}

#[cfg(test)]
mod tests;
