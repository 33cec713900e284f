use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Tick handler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between ticks of each handler.
    pub tick_interval: Duration,
    /// Maximum items a handler picks up per tick.
    pub item_batch_limit: usize,
    /// Age after which a price is reported as stale during winner calculation (ms).
    pub price_stale_threshold_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            item_batch_limit: 100,
            price_stale_threshold_ms: 15 * 60 * 1000, // 15 minutes
        }
    }
}

/// Reward payout batching and retry.
#[derive(Debug, Clone)]
pub struct DistributionConfig {
    /// Maximum winners per ledger payout call.
    pub batch_size: usize,
    /// Pause between consecutive payout batches of the same game.
    pub batch_delay: Duration,
    /// Attempts per payout batch before the invocation is abandoned.
    pub max_attempts: u32,
    /// First retry delay; doubles on each attempt.
    pub retry_base_delay: Duration,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay: Duration::from_secs(5),
            max_attempts: 5,
            retry_base_delay: Duration::from_secs(2),
        }
    }
}

/// Pending-entry reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Retries before an unconfirmed entry is failed.
    pub max_retries: u32,
    /// Minimum spacing between attempts on the same portfolio.
    pub retry_interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_interval: Duration::from_secs(120),
        }
    }
}

/// System-opponent portfolio generation.
#[derive(Debug, Clone)]
pub struct ApeConfig {
    /// Number of assets in the opponent's portfolio.
    pub asset_count: usize,
    /// Total value allocated across the opponent's assets.
    pub initial_value: f64,
    /// Assets the fallback recommender picks from.
    pub asset_universe: Vec<String>,
}

impl Default for ApeConfig {
    fn default() -> Self {
        Self {
            asset_count: 5,
            initial_value: 100_000.0,
            asset_universe: ["btc", "eth", "sol", "bnb", "xrp", "ada", "doge", "avax"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// SQLite database path.
    pub database_path: String,
    /// Run with the in-process paper ledger and simulated prices.
    pub paper_mode: bool,
    pub scheduler: SchedulerConfig,
    pub distribution: DistributionConfig,
    pub reconcile: ReconcileConfig,
    pub ape: ApeConfig,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

/// Parse a comma-separated asset list, lowercased, empties dropped.
fn parse_asset_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let scheduler_defaults = SchedulerConfig::default();
        let distribution_defaults = DistributionConfig::default();
        let reconcile_defaults = ReconcileConfig::default();
        let ape_defaults = ApeConfig::default();

        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 3002),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "data/ape_arena.db".to_string()),
            paper_mode: env_flag("PAPER_MODE", true),
            scheduler: SchedulerConfig {
                tick_interval: Duration::from_secs(env_or(
                    "TICK_INTERVAL_SECS",
                    scheduler_defaults.tick_interval.as_secs(),
                )),
                item_batch_limit: env_or("ITEM_BATCH_LIMIT", scheduler_defaults.item_batch_limit),
                price_stale_threshold_ms: env_or(
                    "PRICE_STALE_THRESHOLD_MS",
                    scheduler_defaults.price_stale_threshold_ms,
                ),
            },
            distribution: DistributionConfig {
                batch_size: env_or("DISTRIBUTION_BATCH_SIZE", distribution_defaults.batch_size),
                batch_delay: Duration::from_millis(env_or(
                    "DISTRIBUTION_BATCH_DELAY_MS",
                    distribution_defaults.batch_delay.as_millis() as u64,
                )),
                max_attempts: env_or(
                    "DISTRIBUTION_MAX_ATTEMPTS",
                    distribution_defaults.max_attempts,
                ),
                retry_base_delay: Duration::from_millis(env_or(
                    "DISTRIBUTION_RETRY_BASE_MS",
                    distribution_defaults.retry_base_delay.as_millis() as u64,
                )),
            },
            reconcile: ReconcileConfig {
                max_retries: env_or("RECONCILE_MAX_RETRIES", reconcile_defaults.max_retries),
                retry_interval: Duration::from_secs(env_or(
                    "RECONCILE_RETRY_INTERVAL_SECS",
                    reconcile_defaults.retry_interval.as_secs(),
                )),
            },
            ape: ApeConfig {
                asset_count: env_or("APE_ASSET_COUNT", ape_defaults.asset_count),
                initial_value: env_or("APE_INITIAL_VALUE", ape_defaults.initial_value),
                asset_universe: env::var("APE_ASSET_UNIVERSE")
                    .ok()
                    .map(|v| parse_asset_list(&v))
                    .filter(|list| !list.is_empty())
                    .unwrap_or(ape_defaults.asset_universe),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3002,
            database_path: "data/ape_arena.db".to_string(),
            paper_mode: true,
            scheduler: SchedulerConfig::default(),
            distribution: DistributionConfig::default(),
            reconcile: ReconcileConfig::default(),
            ape: ApeConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Defaults
    // =========================================================================

    #[test]
    fn test_scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.price_stale_threshold_ms, 900_000);
    }

    #[test]
    fn test_distribution_defaults() {
        let config = DistributionConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn test_reconcile_defaults() {
        let config = ReconcileConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_ape_defaults() {
        let config = ApeConfig::default();
        assert_eq!(config.asset_count, 5);
        assert!(config.asset_universe.len() >= config.asset_count);
    }

    // =========================================================================
    // Parsing
    // =========================================================================

    #[test]
    fn test_parse_asset_list() {
        assert_eq!(
            parse_asset_list(" BTC, eth ,,sol "),
            vec!["btc".to_string(), "eth".to_string(), "sol".to_string()]
        );
        assert!(parse_asset_list(" , ").is_empty());
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        assert_eq!(env_or("APE_ARENA_TEST_UNSET_KEY", 42usize), 42);
    }
}
