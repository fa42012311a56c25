use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use coachpay_core::{EntitlementUnit, MAX_OFFER_VALIDITY_HOURS};

#[derive(Clone, Debug)]
pub struct CheckoutConfig {
    pub api_base: String,
    pub api_key: String,
    pub currency: String,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub http_addr: String,
    pub webhook_secret: String,
    pub checkout: CheckoutConfig,
    pub offer_ttl_hours: i64,
    pub entitlement_unit: EntitlementUnit,
    pub sync_poll_attempts: u32,
    pub sync_poll_interval: Duration,
    pub sweep_interval: Duration,
    pub sweep_batch_size: i64,
    /// Re-drives an incomplete offer may use before the ops worker parks it.
    pub redrive_max_attempts: u32,
}

impl ServiceConfig {
    pub fn from_env(default_http_addr: &str) -> Result<Self> {
        let mut config = Self::worker_from_env()?;
        config.http_addr =
            std::env::var("HTTP_ADDR").unwrap_or_else(|_| default_http_addr.to_string());
        config.webhook_secret = std::env::var("PAYMENT_WEBHOOK_SECRET")
            .context("PAYMENT_WEBHOOK_SECRET is required")?;
        if config.webhook_secret.trim().is_empty() {
            return Err(anyhow!("PAYMENT_WEBHOOK_SECRET must not be empty"));
        }
        Ok(config)
    }

    pub fn worker_from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = std::env::var("REDIS_URL")
            .ok()
            .filter(|value| !value.trim().is_empty());

        let checkout = CheckoutConfig {
            api_base: std::env::var("CHECKOUT_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
            api_key: std::env::var("CHECKOUT_API_KEY").unwrap_or_default(),
            currency: std::env::var("CHECKOUT_CURRENCY")
                .unwrap_or_else(|_| "usd".to_string())
                .to_ascii_lowercase(),
            timeout: Duration::from_millis(env_or("CHECKOUT_TIMEOUT_MS", 15_000)?),
        };

        let entitlement_unit = match std::env::var("ENTITLEMENT_UNIT") {
            Ok(raw) => EntitlementUnit::from_str(&raw).map_err(|err| anyhow!(err))?,
            Err(_) => EntitlementUnit::default(),
        };

        let offer_ttl_hours = env_or("OFFER_TTL_HOURS", 48)?;
        if !(1..=MAX_OFFER_VALIDITY_HOURS).contains(&offer_ttl_hours) {
            return Err(anyhow!(
                "OFFER_TTL_HOURS must be between 1 and {MAX_OFFER_VALIDITY_HOURS}"
            ));
        }

        Ok(Self {
            database_url,
            redis_url,
            http_addr: String::new(),
            webhook_secret: String::new(),
            checkout,
            offer_ttl_hours,
            entitlement_unit,
            sync_poll_attempts: env_or("SYNC_POLL_ATTEMPTS", 10)?,
            sync_poll_interval: Duration::from_millis(env_or("SYNC_POLL_INTERVAL_MS", 2_000)?),
            sweep_interval: Duration::from_secs(env_or("SWEEP_INTERVAL_SECS", 60)?),
            sweep_batch_size: env_or("SWEEP_BATCH_SIZE", 100)?,
            redrive_max_attempts: env_or("REDRIVE_MAX_ATTEMPTS", 10)?,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow!("{key} is invalid: {err}")),
        Err(_) => Ok(default),
    }
}
