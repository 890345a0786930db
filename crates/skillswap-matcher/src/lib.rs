pub mod scoring;

use std::{cmp::Reverse, collections::HashMap, sync::Arc};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use skillswap_core::{
    AnalyticsAggregator, MarketError, MarketResult, MatchScorer, OfferingFilter, RequestFilter,
    ScoringInput, SharedStore, SkillOffering, SkillRequest, UserId,
};
use tracing::debug;
use uuid::Uuid;

pub use scoring::DefaultMatchScorer;

/// An offering from another user that covers one of our requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferingMatch {
    pub offering: SkillOffering,
    pub request_id: Uuid,
    pub teacher_rating: Option<Decimal>,
    pub match_score: u8,
}

/// A partner who can teach something we want and wants something we teach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReciprocalMatch {
    pub partner_id: UserId,
    pub their_offering: SkillOffering,
    pub my_request_id: Uuid,
    pub my_offering: SkillOffering,
    pub their_request_id: Uuid,
    pub match_score: u8,
}

#[derive(Clone)]
pub struct Matcher {
    store: SharedStore,
    scorer: Arc<dyn MatchScorer>,
    ratings: Arc<dyn AnalyticsAggregator>,
}

impl Matcher {
    pub fn new(
        store: SharedStore,
        scorer: Arc<dyn MatchScorer>,
        ratings: Arc<dyn AnalyticsAggregator>,
    ) -> Self {
        Self {
            store,
            scorer,
            ratings,
        }
    }

    /// Partners for two-way exchanges, best score first. `limit` caps the
    /// result for dashboard widgets.
    pub async fn find_reciprocal_matches(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> MarketResult<Vec<ReciprocalMatch>> {
        let my_offerings = self
            .store
            .list_offerings(&OfferingFilter {
                owner_id: Some(user_id),
                ..Default::default()
            })
            .await?;
        let my_requests = self
            .store
            .list_requests(&RequestFilter {
                owner_id: Some(user_id),
                ..Default::default()
            })
            .await?;
        if my_offerings.is_empty() || my_requests.is_empty() {
            return Ok(Vec::new());
        }

        let their_offerings = self
            .store
            .list_offerings(&OfferingFilter {
                exclude_owner: Some(user_id),
                categories: my_requests.iter().map(|request| request.category_id).collect(),
                ..Default::default()
            })
            .await?;
        let their_requests = self
            .store
            .list_requests(&RequestFilter {
                exclude_owner: Some(user_id),
                categories: my_offerings.iter().map(|offering| offering.category_id).collect(),
                ..Default::default()
            })
            .await?;

        let mut requests_by_partner: HashMap<UserId, Vec<&SkillRequest>> = HashMap::new();
        for request in &their_requests {
            requests_by_partner
                .entry(request.owner_id)
                .or_default()
                .push(request);
        }
        let mut offerings_by_partner: HashMap<UserId, Vec<&SkillOffering>> = HashMap::new();
        for offering in &their_offerings {
            if requests_by_partner.contains_key(&offering.owner_id) {
                offerings_by_partner
                    .entry(offering.owner_id)
                    .or_default()
                    .push(offering);
            }
        }

        let mut rated: Vec<UserId> = offerings_by_partner.keys().copied().collect();
        rated.push(user_id);
        let ratings = self.rating_map(&rated).await?;
        let my_rating = ratings.get(&user_id).copied().flatten();
        let now = Utc::now();

        let mut matches = Vec::new();
        for (partner_id, partner_offerings) in &offerings_by_partner {
            let partner_rating = ratings.get(partner_id).copied().flatten();
            let partner_requests = &requests_by_partner[partner_id];
            let mut best: Option<ReciprocalMatch> = None;

            for their_offering in partner_offerings {
                for my_request in my_requests
                    .iter()
                    .filter(|request| request.category_id == their_offering.category_id)
                {
                    let inbound = self.scorer.score(&ScoringInput {
                        offering: their_offering,
                        request: my_request,
                        teacher_rating: partner_rating,
                        now,
                    });
                    for my_offering in &my_offerings {
                        for their_request in partner_requests
                            .iter()
                            .filter(|request| request.category_id == my_offering.category_id)
                        {
                            let outbound = self.scorer.score(&ScoringInput {
                                offering: my_offering,
                                request: their_request,
                                teacher_rating: my_rating,
                                now,
                            });
                            let match_score =
                                u8::try_from((u16::from(inbound) + u16::from(outbound)) / 2)
                                    .unwrap_or(u8::MAX);
                            let candidate = ReciprocalMatch {
                                partner_id: *partner_id,
                                their_offering: (*their_offering).clone(),
                                my_request_id: my_request.id,
                                my_offering: my_offering.clone(),
                                their_request_id: their_request.id,
                                match_score,
                            };
                            if best.as_ref().is_none_or(|current| {
                                ranks_before(
                                    (candidate.match_score, &candidate.their_offering),
                                    (current.match_score, &current.their_offering),
                                )
                            }) {
                                best = Some(candidate);
                            }
                        }
                    }
                }
            }
            matches.extend(best);
        }

        matches.sort_by_key(|found| {
            (
                Reverse(found.match_score),
                Reverse(found.their_offering.created_at),
                found.their_offering.id,
            )
        });
        if let Some(limit) = limit {
            matches.truncate(limit);
        }
        debug!(%user_id, found = matches.len(), scorer = self.scorer.name(), "reciprocal matches");
        Ok(matches)
    }

    /// Active offerings from other users in the request's category.
    pub async fn find_potential_matches_for_request(
        &self,
        request_id: Uuid,
    ) -> MarketResult<Vec<OfferingMatch>> {
        let request = self
            .store
            .find_request(request_id)
            .await?
            .ok_or_else(|| MarketError::not_found("request", request_id))?;
        let offerings = self
            .store
            .list_offerings(&OfferingFilter {
                exclude_owner: Some(request.owner_id),
                categories: vec![request.category_id],
                ..Default::default()
            })
            .await?;

        let owners: Vec<UserId> = offerings.iter().map(|offering| offering.owner_id).collect();
        let ratings = self.rating_map(&owners).await?;
        let now = Utc::now();

        let mut matches: Vec<OfferingMatch> = offerings
            .into_iter()
            .map(|offering| {
                let teacher_rating = ratings.get(&offering.owner_id).copied().flatten();
                let match_score = self.scorer.score(&ScoringInput {
                    offering: &offering,
                    request: &request,
                    teacher_rating,
                    now,
                });
                OfferingMatch {
                    offering,
                    request_id,
                    teacher_rating,
                    match_score,
                }
            })
            .collect();

        matches.sort_by_key(|found| {
            (
                Reverse(found.match_score),
                Reverse(found.offering.created_at),
                found.offering.id,
            )
        });
        Ok(matches)
    }

    async fn rating_map(
        &self,
        user_ids: &[UserId],
    ) -> MarketResult<HashMap<UserId, Option<Decimal>>> {
        let mut unique = user_ids.to_vec();
        unique.sort();
        unique.dedup();
        Ok(self
            .ratings
            .average_ratings(&unique)
            .await?
            .into_iter()
            .map(|rating| (rating.user_id, rating.average_rating))
            .collect())
    }
}

/// Higher score first, then the newer offering.
fn ranks_before(candidate: (u8, &SkillOffering), current: (u8, &SkillOffering)) -> bool {
    (candidate.0, candidate.1.created_at) > (current.0, current.1.created_at)
}

#[cfg(test)]
mod tests;
