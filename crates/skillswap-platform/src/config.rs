use std::str::FromStr;

use anyhow::{Context, Result};
use skillswap_core::MarketConfig;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub redis_url: String,
    pub http_addr: String,
    pub market: MarketConfig,
}

impl ServiceConfig {
    pub fn from_env(default_http_addr: &str) -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is required")?;
        let http_addr =
            std::env::var("HTTP_ADDR").unwrap_or_else(|_| default_http_addr.to_string());

        Ok(Self {
            database_url,
            redis_url,
            http_addr,
            market: market_from_env()?,
        })
    }
}

fn market_from_env() -> Result<MarketConfig> {
    let defaults = MarketConfig::default();
    let starting_credits = optional_var("STARTING_CREDITS")?.unwrap_or(defaults.starting_credits);
    if starting_credits < 0 {
        anyhow::bail!("STARTING_CREDITS must not be negative");
    }

    Ok(MarketConfig {
        starting_credits,
        reward_teachers: optional_var("REWARD_TEACHERS")?.unwrap_or(defaults.reward_teachers),
        dashboard_match_limit: optional_var("DASHBOARD_MATCH_LIMIT")?
            .unwrap_or(defaults.dashboard_match_limit),
    })
}

fn optional_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name} has an invalid value: {raw}")),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("{name} could not be read")),
    }
}
