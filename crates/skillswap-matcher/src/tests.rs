use chrono::Duration;
use skillswap_analytics::StoreAnalytics;
use skillswap_core::{MarketStore, SkillLevel, TeachingMethod};
use skillswap_store::InMemoryMarketStore;

use super::*;

struct Fixture {
    store: Arc<InMemoryMarketStore>,
    matcher: Matcher,
    cooking: Uuid,
    spanish: Uuid,
    guitar: Uuid,
}

async fn fixture() -> Fixture {
    let store = Arc::new(InMemoryMarketStore::new());
    let cooking = store.insert_category("Cooking").await.id;
    let spanish = store.insert_category("Spanish").await.id;
    let guitar = store.insert_category("Guitar").await.id;
    let matcher = Matcher::new(
        store.clone(),
        Arc::new(DefaultMatchScorer),
        Arc::new(StoreAnalytics::new(store.clone())),
    );
    Fixture {
        store,
        matcher,
        cooking,
        spanish,
        guitar,
    }
}

impl Fixture {
    async fn offer(
        &self,
        owner_id: UserId,
        category_id: Uuid,
        level: SkillLevel,
        age_days: i64,
    ) -> SkillOffering {
        let created_at = Utc::now() - Duration::days(age_days);
        let offering = SkillOffering {
            id: Uuid::new_v4(),
            owner_id,
            category_id,
            title: "Lessons".to_string(),
            description: "One hour sessions".to_string(),
            experience_level: level,
            teaching_method: TeachingMethod::Online,
            location: None,
            is_active: true,
            created_at,
            updated_at: created_at,
        };
        self.store.save_offering(&offering).await.expect("save offering");
        offering
    }

    async fn want(&self, owner_id: UserId, category_id: Uuid) -> SkillRequest {
        let now = Utc::now();
        let request = SkillRequest {
            id: Uuid::new_v4(),
            owner_id,
            category_id,
            title: "Want to learn".to_string(),
            description: "Evenings".to_string(),
            current_level: SkillLevel::Beginner,
            desired_level: SkillLevel::Intermediate,
            preferred_method: TeachingMethod::Online,
            availability: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.store.save_request(&request).await.expect("save request");
        request
    }
}

#[tokio::test]
async fn reciprocal_match_requires_both_directions() {
    let fx = fixture().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let carol = Uuid::new_v4();

    let alice_cooking = fx.offer(alice, fx.cooking, SkillLevel::Expert, 1).await;
    let alice_wants = fx.want(alice, fx.spanish).await;
    let bob_spanish = fx.offer(bob, fx.spanish, SkillLevel::Expert, 1).await;
    let bob_wants = fx.want(bob, fx.cooking).await;
    // Carol teaches Spanish but wants nothing Alice offers.
    fx.offer(carol, fx.spanish, SkillLevel::Expert, 1).await;
    fx.want(carol, fx.guitar).await;

    let matches = fx
        .matcher
        .find_reciprocal_matches(alice, None)
        .await
        .expect("matches");

    assert_eq!(matches.len(), 1);
    let found = &matches[0];
    assert_eq!(found.partner_id, bob);
    assert_eq!(found.their_offering, bob_spanish);
    assert_eq!(found.my_offering, alice_cooking);
    assert_eq!(found.my_request_id, alice_wants.id);
    assert_eq!(found.their_request_id, bob_wants.id);
    assert!(found.match_score <= 100);
}

#[tokio::test]
async fn inactive_listings_do_not_match() {
    let fx = fixture().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    fx.offer(alice, fx.cooking, SkillLevel::Expert, 1).await;
    fx.want(alice, fx.spanish).await;
    let mut bob_spanish = fx.offer(bob, fx.spanish, SkillLevel::Expert, 1).await;
    fx.want(bob, fx.cooking).await;

    bob_spanish.is_active = false;
    fx.store.save_offering(&bob_spanish).await.expect("deactivate");

    let matches = fx
        .matcher
        .find_reciprocal_matches(alice, None)
        .await
        .expect("matches");
    assert!(matches.is_empty());
}

#[tokio::test]
async fn reciprocal_results_are_ranked_and_capped() {
    let fx = fixture().await;
    let alice = Uuid::new_v4();
    fx.offer(alice, fx.cooking, SkillLevel::Expert, 1).await;
    fx.want(alice, fx.spanish).await;

    let strong = Uuid::new_v4();
    let weak = Uuid::new_v4();
    fx.offer(strong, fx.spanish, SkillLevel::Expert, 1).await;
    fx.want(strong, fx.cooking).await;
    fx.offer(weak, fx.spanish, SkillLevel::Beginner, 200).await;
    fx.want(weak, fx.cooking).await;

    let all = fx
        .matcher
        .find_reciprocal_matches(alice, None)
        .await
        .expect("matches");
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].partner_id, strong);
    assert!(all[0].match_score > all[1].match_score);

    let capped = fx
        .matcher
        .find_reciprocal_matches(alice, Some(1))
        .await
        .expect("matches");
    assert_eq!(capped.len(), 1);
    assert_eq!(capped[0].partner_id, strong);
}

#[tokio::test]
async fn request_matches_exclude_own_offerings_and_other_categories() {
    let fx = fixture().await;
    let learner = Uuid::new_v4();
    let request = fx.want(learner, fx.guitar).await;
    fx.offer(learner, fx.guitar, SkillLevel::Expert, 1).await;
    fx.offer(Uuid::new_v4(), fx.cooking, SkillLevel::Expert, 1).await;
    let older = fx.offer(Uuid::new_v4(), fx.guitar, SkillLevel::Expert, 5).await;
    let newer = fx.offer(Uuid::new_v4(), fx.guitar, SkillLevel::Expert, 2).await;

    let matches = fx
        .matcher
        .find_potential_matches_for_request(request.id)
        .await
        .expect("matches");

    let ids: Vec<Uuid> = matches.iter().map(|found| found.offering.id).collect();
    assert_eq!(ids, vec![newer.id, older.id]);
    assert!(matches.iter().all(|found| found.request_id == request.id));
    assert_eq!(matches[0].match_score, matches[1].match_score);
}

#[tokio::test]
async fn unknown_request_is_not_found() {
    let fx = fixture().await;
    let result = fx
        .matcher
        .find_potential_matches_for_request(Uuid::new_v4())
        .await;
    assert!(matches!(result, Err(MarketError::NotFound { entity: "request", .. })));
}
