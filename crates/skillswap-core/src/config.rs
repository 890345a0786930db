use serde::{Deserialize, Serialize};

pub const DEFAULT_STARTING_CREDITS: i64 = 5;
pub const DEFAULT_DASHBOARD_MATCH_LIMIT: usize = 3;

/// Marketplace rules that vary per deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketConfig {
    pub starting_credits: i64,
    pub reward_teachers: bool,
    pub dashboard_match_limit: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            starting_credits: DEFAULT_STARTING_CREDITS,
            reward_teachers: true,
            dashboard_match_limit: DEFAULT_DASHBOARD_MATCH_LIMIT,
        }
    }
}
