use chrono::Duration;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use skillswap_core::{MatchScorer, ScoringInput, TeachingMethod};

const CATEGORY_POINTS: u32 = 40;
const UNRATED_POINTS: u32 = 10;
const MAX_RATING_POINTS: u32 = 20;

/// Category match, then level fit, method fit, teacher rating and recency.
///
/// | part      | points                                                 |
/// |-----------|--------------------------------------------------------|
/// | category  | 40                                                     |
/// | level     | 20 if offered level ≥ desired, 10 if ≥ current         |
/// | method    | 10 if methods agree or either side is hybrid           |
/// | rating    | rating × 4 (max 20), 10 when unrated                   |
/// | recency   | 10 within 30 days, 5 within 90 days                    |
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMatchScorer;

impl MatchScorer for DefaultMatchScorer {
    fn name(&self) -> &'static str {
        "category-level-method-rating-recency"
    }

    fn score(&self, input: &ScoringInput<'_>) -> u8 {
        let ScoringInput {
            offering,
            request,
            teacher_rating,
            now,
        } = *input;

        let level = if offering.experience_level >= request.desired_level {
            20
        } else if offering.experience_level >= request.current_level {
            10
        } else {
            0
        };

        let method = if offering.teaching_method == request.preferred_method
            || offering.teaching_method == TeachingMethod::Hybrid
            || request.preferred_method == TeachingMethod::Hybrid
        {
            10
        } else {
            0
        };

        let rating = teacher_rating.map_or(UNRATED_POINTS, |rating| {
            (rating * Decimal::from(4))
                .round()
                .to_u32()
                .unwrap_or(0)
                .min(MAX_RATING_POINTS)
        });

        let age = now - offering.created_at;
        let recency = if age <= Duration::days(30) {
            10
        } else if age <= Duration::days(90) {
            5
        } else {
            0
        };

        let total = CATEGORY_POINTS + level + method + rating + recency;
        u8::try_from(total.min(100)).unwrap_or(100)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rstest::rstest;
    use skillswap_core::{SkillLevel, SkillOffering, SkillRequest};
    use uuid::Uuid;

    use super::*;

    fn pair(
        offered: SkillLevel,
        offered_method: TeachingMethod,
        age_days: i64,
    ) -> (SkillOffering, SkillRequest) {
        let now = Utc::now();
        let category_id = Uuid::new_v4();
        let offering = SkillOffering {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            category_id,
            title: "Spanish".to_string(),
            description: "Conversation practice".to_string(),
            experience_level: offered,
            teaching_method: offered_method,
            location: None,
            is_active: true,
            created_at: now - Duration::days(age_days),
            updated_at: now,
        };
        let request = SkillRequest {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            category_id,
            title: "Learn Spanish".to_string(),
            description: "For travel".to_string(),
            current_level: SkillLevel::Beginner,
            desired_level: SkillLevel::Intermediate,
            preferred_method: TeachingMethod::Online,
            availability: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        (offering, request)
    }

    fn score(offering: &SkillOffering, request: &SkillRequest, rating: Option<Decimal>) -> u8 {
        DefaultMatchScorer.score(&ScoringInput {
            offering,
            request,
            teacher_rating: rating,
            now: Utc::now(),
        })
    }

    #[rstest]
    #[case(SkillLevel::Expert, TeachingMethod::Online, 1, Some(Decimal::new(5, 0)), 100)]
    #[case(SkillLevel::Intermediate, TeachingMethod::Hybrid, 1, None, 90)]
    #[case(SkillLevel::Beginner, TeachingMethod::InPerson, 60, None, 65)]
    #[case(SkillLevel::Beginner, TeachingMethod::InPerson, 365, Some(Decimal::new(2, 0)), 58)]
    fn documented_points_add_up(
        #[case] offered: SkillLevel,
        #[case] method: TeachingMethod,
        #[case] age_days: i64,
        #[case] rating: Option<Decimal>,
        #[case] expected: u8,
    ) {
        let (offering, request) = pair(offered, method, age_days);
        assert_eq!(score(&offering, &request, rating), expected);
    }

    #[test]
    fn higher_rating_never_scores_lower() {
        let (offering, request) = pair(SkillLevel::Advanced, TeachingMethod::Online, 10);
        let mut previous = 0;
        for tenths in 10..=50 {
            let current = score(&offering, &request, Some(Decimal::new(tenths, 1)));
            assert!(current >= previous);
            previous = current;
        }
    }
}
