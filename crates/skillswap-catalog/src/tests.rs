use std::collections::HashMap;

use async_trait::async_trait;
use skillswap_core::{
    Changeset, EngagementAnalytics, LearningAnalytics, MarketStore, SkillLevel, Status, Swap,
    TeachingAnalytics, TeachingMethod, UserRating,
};
use skillswap_store::InMemoryMarketStore;

use super::*;

/// Ratings fixed up front; the other aggregates are not used by the catalog.
#[derive(Default)]
struct FixedRatings(HashMap<UserId, Decimal>);

#[async_trait]
impl AnalyticsAggregator for FixedRatings {
    async fn average_ratings(&self, user_ids: &[UserId]) -> MarketResult<Vec<UserRating>> {
        Ok(user_ids
            .iter()
            .map(|user_id| UserRating {
                user_id: *user_id,
                average_rating: self.0.get(user_id).copied(),
                rating_count: u32::from(self.0.contains_key(user_id)),
            })
            .collect())
    }

    async fn teaching(&self, _user_id: UserId) -> MarketResult<TeachingAnalytics> {
        Err(MarketError::validation("unused"))
    }

    async fn learning(&self, _user_id: UserId) -> MarketResult<LearningAnalytics> {
        Err(MarketError::validation("unused"))
    }

    async fn engagement(&self, _user_id: UserId) -> MarketResult<EngagementAnalytics> {
        Err(MarketError::validation("unused"))
    }
}

struct Fixture {
    store: Arc<InMemoryMarketStore>,
    catalog: Catalog,
    category: SkillCategory,
}

async fn fixture(ratings: FixedRatings) -> Fixture {
    let store = Arc::new(InMemoryMarketStore::new());
    let category = store.insert_category("Music").await;
    let catalog = Catalog::new(store.clone(), Arc::new(ratings));
    Fixture {
        store,
        catalog,
        category,
    }
}

fn offering_draft(category_id: Uuid, title: &str) -> OfferingDraft {
    OfferingDraft {
        category_id,
        title: title.to_string(),
        description: "Weekly lessons for adults".to_string(),
        experience_level: SkillLevel::Advanced,
        teaching_method: TeachingMethod::Online,
        location: Some("  ".to_string()),
    }
}

fn request_draft(category_id: Uuid) -> RequestDraft {
    RequestDraft {
        category_id,
        title: "Learn piano".to_string(),
        description: "Total beginner".to_string(),
        current_level: SkillLevel::Beginner,
        desired_level: SkillLevel::Intermediate,
        preferred_method: TeachingMethod::Online,
        availability: Some("weekends".to_string()),
    }
}

async fn attach_active_swap(store: &InMemoryMarketStore, offering: &SkillOffering) -> Swap {
    let swap = Swap::propose(
        offering.owner_id,
        Uuid::new_v4(),
        offering.id,
        None,
        false,
        Utc::now(),
    )
    .expect("valid swap");
    let mut changeset = Changeset::default();
    changeset.insert_swap(swap.clone());
    store.commit(changeset).await.expect("insert swap");
    swap
}

#[tokio::test]
async fn create_offering_trims_and_blanks_location() {
    let fx = fixture(FixedRatings::default()).await;
    let owner = Uuid::new_v4();

    let offering = fx
        .catalog
        .create_offering(owner, offering_draft(fx.category.id, "  Guitar  "))
        .await
        .expect("create");

    assert_eq!(offering.title, "Guitar");
    assert_eq!(offering.location, None);
    assert!(offering.is_active);
}

#[tokio::test]
async fn unknown_category_is_not_found() {
    let fx = fixture(FixedRatings::default()).await;
    let result = fx
        .catalog
        .create_offering(Uuid::new_v4(), offering_draft(Uuid::new_v4(), "Guitar"))
        .await;
    assert!(matches!(result, Err(MarketError::NotFound { entity: "category", .. })));
}

#[tokio::test]
async fn only_owner_may_update() {
    let fx = fixture(FixedRatings::default()).await;
    let owner = Uuid::new_v4();
    let offering = fx
        .catalog
        .create_offering(owner, offering_draft(fx.category.id, "Guitar"))
        .await
        .expect("create");

    let result = fx
        .catalog
        .update_offering(Uuid::new_v4(), offering.id, offering_draft(fx.category.id, "Bass"))
        .await;
    assert!(matches!(result, Err(MarketError::Unauthorized(_))));

    let updated = fx
        .catalog
        .update_offering(owner, offering.id, offering_draft(fx.category.id, "Bass"))
        .await
        .expect("update");
    assert_eq!(updated.title, "Bass");
}

#[tokio::test]
async fn delete_is_blocked_by_active_swap() {
    let fx = fixture(FixedRatings::default()).await;
    let owner = Uuid::new_v4();
    let offering = fx
        .catalog
        .create_offering(owner, offering_draft(fx.category.id, "Guitar"))
        .await
        .expect("create");
    let mut swap = attach_active_swap(&fx.store, &offering).await;

    let result = fx.catalog.delete_offering(owner, offering.id).await;
    assert!(matches!(result, Err(MarketError::HasActiveExchanges { .. })));
    assert!(fx.catalog.offering(offering.id).await.is_ok());

    swap.advance(Status::Cancelled, Utc::now()).expect("cancel");
    let mut changeset = Changeset::default();
    changeset.update_swap(swap, Status::Pending);
    fx.store.commit(changeset).await.expect("cancel swap");

    fx.catalog
        .delete_offering(owner, offering.id)
        .await
        .expect("delete after cancel");
    assert!(matches!(
        fx.catalog.offering(offering.id).await,
        Err(MarketError::NotFound { .. })
    ));
}

#[tokio::test]
async fn deactivated_offerings_leave_discovery() {
    let fx = fixture(FixedRatings::default()).await;
    let owner = Uuid::new_v4();
    let offering = fx
        .catalog
        .create_offering(owner, offering_draft(fx.category.id, "Guitar"))
        .await
        .expect("create");

    fx.catalog
        .deactivate_offering(owner, offering.id)
        .await
        .expect("deactivate");

    let listed = fx
        .catalog
        .list_active_offerings(&OfferingFilter {
            include_inactive: true,
            ..Default::default()
        })
        .await
        .expect("list");
    assert!(listed.is_empty());
    assert_eq!(fx.catalog.offerings_of(owner).await.expect("mine").len(), 1);
}

#[tokio::test]
async fn discovery_excludes_caller_and_filters_by_text() {
    let fx = fixture(FixedRatings::default()).await;
    let me = Uuid::new_v4();
    let other = Uuid::new_v4();
    fx.catalog
        .create_offering(me, offering_draft(fx.category.id, "Jazz guitar"))
        .await
        .expect("mine");
    let theirs = fx
        .catalog
        .create_offering(other, offering_draft(fx.category.id, "Jazz piano"))
        .await
        .expect("theirs");
    fx.catalog
        .create_offering(other, offering_draft(fx.category.id, "Violin"))
        .await
        .expect("theirs too");

    let listed = fx
        .catalog
        .list_active_offerings(&OfferingFilter {
            exclude_owner: Some(me),
            text_query: Some("JAZZ".to_string()),
            ..Default::default()
        })
        .await
        .expect("list");
    assert_eq!(listed, vec![theirs]);
}

#[tokio::test]
async fn min_rating_and_rating_order_use_owner_averages() {
    let strong = Uuid::new_v4();
    let weak = Uuid::new_v4();
    let unrated = Uuid::new_v4();
    let ratings = FixedRatings(HashMap::from([
        (strong, Decimal::new(48, 1)),
        (weak, Decimal::new(31, 1)),
    ]));
    let fx = fixture(ratings).await;

    let strong_offering = fx
        .catalog
        .create_offering(strong, offering_draft(fx.category.id, "Cello"))
        .await
        .expect("strong");
    let weak_offering = fx
        .catalog
        .create_offering(weak, offering_draft(fx.category.id, "Drums"))
        .await
        .expect("weak");
    fx.catalog
        .create_offering(unrated, offering_draft(fx.category.id, "Flute"))
        .await
        .expect("unrated");

    let minimum = fx
        .catalog
        .list_active_offerings(&OfferingFilter {
            min_rating: Some(Decimal::new(4, 0)),
            ..Default::default()
        })
        .await
        .expect("list");
    assert_eq!(minimum, vec![strong_offering.clone()]);

    let ordered = fx
        .catalog
        .list_active_offerings(&OfferingFilter {
            order: OfferingOrder::Rating,
            ..Default::default()
        })
        .await
        .expect("list");
    assert_eq!(ordered.len(), 3);
    assert_eq!(ordered[0], strong_offering);
    assert_eq!(ordered[1], weak_offering);
    assert_eq!(ordered[2].owner_id, unrated);
}

#[tokio::test]
async fn request_levels_must_not_go_backwards() {
    let fx = fixture(FixedRatings::default()).await;
    let mut draft = request_draft(fx.category.id);
    draft.current_level = SkillLevel::Advanced;
    draft.desired_level = SkillLevel::Beginner;

    let result = fx.catalog.create_request(Uuid::new_v4(), draft).await;
    assert!(matches!(result, Err(MarketError::Validation(_))));
}

#[tokio::test]
async fn request_lifecycle_mirrors_offerings() {
    let fx = fixture(FixedRatings::default()).await;
    let owner = Uuid::new_v4();
    let request = fx
        .catalog
        .create_request(owner, request_draft(fx.category.id))
        .await
        .expect("create");

    let deactivated = fx
        .catalog
        .deactivate_request(owner, request.id)
        .await
        .expect("deactivate");
    assert!(!deactivated.is_active);

    let listed = fx
        .catalog
        .list_requests(&RequestFilter {
            owner_id: Some(owner),
            ..Default::default()
        })
        .await
        .expect("list");
    assert!(listed.is_empty());

    assert!(matches!(
        fx.catalog.delete_request(Uuid::new_v4(), request.id).await,
        Err(MarketError::Unauthorized(_))
    ));
    fx.catalog
        .delete_request(owner, request.id)
        .await
        .expect("delete");
}
