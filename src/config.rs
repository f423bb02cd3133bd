use clap::Args;

use crate::burndown::BurndownConfig;
use crate::error::{MetricsError, MetricsResult};

/// Runtime settings, read from flags or the environment.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Postgres connection string
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, global = true, env = "POLE_METRICS_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    /// Poles one resource completes per day
    #[arg(long, global = true, env = "POLE_METRICS_DAILY_CAPACITY", default_value_t = 30.0)]
    pub daily_capacity: f64,

    /// Window used for the trailing completion rate
    #[arg(long, global = true, env = "POLE_METRICS_TRAILING_DAYS", default_value_t = 30)]
    pub trailing_days: i64,

    #[arg(long, global = true, env = "POLE_METRICS_RATE_EPSILON", default_value_t = 0.001)]
    pub rate_epsilon: f64,

    /// Snapshot retention horizon for `prune`
    #[arg(long, global = true, env = "POLE_METRICS_RETENTION_DAYS", default_value_t = 365)]
    pub retention_days: i64,
}

impl Settings {
    pub fn database_url(&self) -> MetricsResult<&str> {
        self.database_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| MetricsError::InvalidInput("DATABASE_URL must be set".to_string()))
    }

    pub fn burndown(&self) -> MetricsResult<BurndownConfig> {
        if !(self.daily_capacity.is_finite() && self.daily_capacity > 0.0) {
            return Err(MetricsError::InvalidInput(format!(
                "daily capacity must be positive (got {})",
                self.daily_capacity
            )));
        }
        if self.trailing_days < 1 {
            return Err(MetricsError::InvalidInput(format!(
                "trailing window must be at least one day (got {})",
                self.trailing_days
            )));
        }
        if !(self.rate_epsilon.is_finite() && self.rate_epsilon > 0.0) {
            return Err(MetricsError::InvalidInput(format!(
                "rate epsilon must be positive (got {})",
                self.rate_epsilon
            )));
        }
        Ok(BurndownConfig {
            daily_capacity: self.daily_capacity,
            trailing_days: self.trailing_days,
            rate_epsilon: self.rate_epsilon,
        })
    }

    pub fn max_connections(&self) -> MetricsResult<u32> {
        if self.max_connections == 0 {
            return Err(MetricsError::InvalidInput("max connections must be at least 1".to_string()));
        }
        Ok(self.max_connections)
    }
}
