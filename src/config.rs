use std::{env, path::PathBuf, str::FromStr, time::Duration};

use tracing::info;

use crate::types::MAX_EXPIRES_IN_HOURS;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable must be set")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub jwt_secret: String,
    pub frontend_url: String,
    pub link_ttl: chrono::Duration,
    pub max_downloads: i32,
    pub storage_root: PathBuf,
    pub notifier_url: Option<String>,
    pub notifier_api_key: Option<String>,
    pub payment_webhook_secret: Option<String>,
    pub reaper_interval: Option<Duration>,
    pub link_retention: chrono::Duration,
    pub sentry_dsn: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let link_expiry = try_load("DOWNLOAD_LINK_EXPIRY", "48h")?;
        let link_ttl = parse_link_ttl(&link_expiry).map_err(|reason| ConfigError::Invalid {
            key: "DOWNLOAD_LINK_EXPIRY",
            reason,
        })?;

        let max_downloads: i32 = parse("MAX_DOWNLOADS", "3")?;
        if max_downloads <= 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_DOWNLOADS",
                reason: "must be positive".to_string(),
            });
        }

        let reaper_interval = optional("REAPER_INTERVAL_SECS")
            .map(|secs| {
                parse_reaper_interval(&secs).map_err(|reason| ConfigError::Invalid {
                    key: "REAPER_INTERVAL_SECS",
                    reason,
                })
            })
            .transpose()?;

        let link_retention = parse_retention_days(parse("LINK_RETENTION_DAYS", "30")?)
            .map_err(|reason| ConfigError::Invalid {
                key: "LINK_RETENTION_DAYS",
                reason,
            })?;

        Ok(Self {
            database_url: try_load("DATABASE_URL", "downloads.db")?,
            port: parse("PORT", "3000")?,
            jwt_secret: optional("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?,
            frontend_url: try_load("FRONTEND_URL", "http://localhost:5173")?,
            link_ttl,
            max_downloads,
            storage_root: PathBuf::from(try_load("EBOOK_STORAGE_ROOT", ".")?),
            notifier_url: optional("NOTIFIER_URL"),
            notifier_api_key: optional("NOTIFIER_API_KEY"),
            payment_webhook_secret: optional("PAYMENT_WEBHOOK_SECRET"),
            reaper_interval,
            link_retention,
            sentry_dsn: optional("SENTRY_DSN"),
        })
    }

    /// Externally reachable URL the frontend serves the download page on.
    pub fn download_url(&self, token: &str) -> String {
        format!(
            "{}/download/{}",
            self.frontend_url.trim_end_matches('/'),
            token
        )
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn try_load(key: &'static str, default: &str) -> Result<String, ConfigError> {
    Ok(optional(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    }))
}

fn parse<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    try_load(key, default)?
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        })
}

/// Parses `48h`, `2d` or a bare hour count.
pub fn parse_link_ttl(value: &str) -> Result<chrono::Duration, String> {
    let value = value.trim();
    let (amount, unit) = match value.char_indices().last() {
        Some((idx, 'h')) | Some((idx, 'H')) => (&value[..idx], 'h'),
        Some((idx, 'd')) | Some((idx, 'D')) => (&value[..idx], 'd'),
        _ => (value, 'h'),
    };

    let amount: i64 = amount
        .trim()
        .parse()
        .map_err(|_| format!("expected `<n>h` or `<n>d`, got `{value}`"))?;
    if amount <= 0 {
        return Err("duration must be positive".to_string());
    }

    let ttl = match unit {
        'd' => chrono::Duration::try_days(amount),
        _ => chrono::Duration::try_hours(amount),
    }
    .filter(|ttl| ttl.num_hours() <= MAX_EXPIRES_IN_HOURS)
    .ok_or_else(|| format!("`{value}` is longer than {MAX_EXPIRES_IN_HOURS} hours"))?;
    Ok(ttl)
}

/// Seconds between reaper runs; must be non-zero.
pub fn parse_reaper_interval(value: &str) -> Result<Duration, String> {
    let secs: u64 = value.trim().parse().map_err(|e| format!("{e}"))?;
    if secs == 0 {
        return Err("must be at least 1 second".to_string());
    }
    Ok(Duration::from_secs(secs))
}

/// A negative retention would put the purge cutoff in the future and
/// delete links that are still redeemable.
pub fn parse_retention_days(days: i64) -> Result<chrono::Duration, String> {
    if days < 0 {
        return Err("must not be negative".to_string());
    }
    chrono::Duration::try_days(days).ok_or_else(|| format!("{days} days is too long"))
}
