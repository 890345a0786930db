use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use skillswap_core::{
    OfferingFilter, OfferingOrder, RequestFilter, SkillLevel, Status, TeachingMethod, UserId,
};
use uuid::Uuid;

/// Discovery query string for `GET /offerings`. `category` takes a
/// comma-separated list of ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfferingsQuery {
    pub category: Option<String>,
    pub level: Option<SkillLevel>,
    pub method: Option<TeachingMethod>,
    pub location: Option<String>,
    pub q: Option<String>,
    pub min_rating: Option<Decimal>,
    pub order: Option<OfferingOrder>,
    #[serde(default)]
    pub mine: bool,
}

impl OfferingsQuery {
    /// Browsing hides the viewer's own listings; `mine` shows only those.
    pub fn into_filter(self, viewer_id: UserId) -> Result<OfferingFilter> {
        Ok(OfferingFilter {
            owner_id: self.mine.then_some(viewer_id),
            exclude_owner: (!self.mine).then_some(viewer_id),
            categories: parse_ids(self.category.as_deref())?,
            experience_level: self.level,
            teaching_method: self.method,
            location: self.location,
            text_query: self.q,
            min_rating: self.min_rating,
            include_inactive: self.mine,
            order: self.order.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestsQuery {
    pub category: Option<String>,
    pub q: Option<String>,
    #[serde(default)]
    pub mine: bool,
}

impl RequestsQuery {
    pub fn into_filter(self, viewer_id: UserId) -> Result<RequestFilter> {
        Ok(RequestFilter {
            owner_id: self.mine.then_some(viewer_id),
            exclude_owner: (!self.mine).then_some(viewer_id),
            categories: parse_ids(self.category.as_deref())?,
            text_query: self.q,
            include_inactive: self.mine,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchesQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user_id: UserId,
    pub balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSessionRequest {
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateExchangeStatusRequest {
    pub status: Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsQuery {
    #[serde(default)]
    pub unread_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkAllReadResponse {
    pub updated: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingsRequest {
    pub user_ids: Vec<UserId>,
}

fn parse_ids(raw: Option<&str>) -> Result<Vec<Uuid>> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            Uuid::parse_str(part).with_context(|| format!("invalid category id: {part}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browsing_excludes_viewer_and_parses_categories() {
        let viewer = Uuid::new_v4();
        let music = Uuid::new_v4();
        let cooking = Uuid::new_v4();
        let query = OfferingsQuery {
            category: Some(format!("{music}, {cooking},")),
            q: Some("jazz".to_string()),
            ..Default::default()
        };

        let filter = query.into_filter(viewer).expect("filter");
        assert_eq!(filter.exclude_owner, Some(viewer));
        assert_eq!(filter.owner_id, None);
        assert_eq!(filter.categories, vec![music, cooking]);
        assert!(!filter.include_inactive);
        assert_eq!(filter.order, OfferingOrder::Newest);
    }

    #[test]
    fn own_listings_include_inactive() {
        let viewer = Uuid::new_v4();
        let filter = RequestsQuery {
            mine: true,
            ..Default::default()
        }
        .into_filter(viewer)
        .expect("filter");
        assert_eq!(filter.owner_id, Some(viewer));
        assert_eq!(filter.exclude_owner, None);
        assert!(filter.include_inactive);
    }

    #[test]
    fn malformed_category_is_rejected() {
        let query = OfferingsQuery {
            category: Some("not-a-uuid".to_string()),
            ..Default::default()
        };
        assert!(query.into_filter(Uuid::new_v4()).is_err());
    }
}
