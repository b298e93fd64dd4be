use crate::index::IndexWeighting;
use rayon::ThreadPoolBuilder;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

/// Annual trading days, used to scale annualized drift/volatility to a step.
pub const TRADING_DAYS: f64 = 252.0;
/// Five-minute bars in a 6.5h session.
pub const INTRADAY_BARS_PER_DAY: f64 = 78.0;
/// Wall-clock length of one trading session, in seconds.
pub const SESSION_SECONDS: f64 = 6.5 * 60.0 * 60.0;
/// Maximum samples kept in an instrument's rolling price history.
pub const HISTORY_CAP: usize = 500;
/// Samples kept after `reset_to_baseline`.
pub const RESET_RETAINED_HISTORY: usize = 10;
/// Prices never fall below this value.
pub const PRICE_FLOOR: f64 = 0.01;
/// Composite index value when every constituent sits at its base price.
pub const INDEX_BASE: f64 = 1000.0;
/// Upper bound on the per-step candle wick, as a fraction of price.
pub const MAX_WICK_FRACTION: f64 = 0.25;
/// Backfill volume is drawn uniformly from this range (per bar).
pub const VOLUME_RANGE: (f64, f64) = (1_000.0, 50_000.0);
/// 2024-01-01T00:00:00Z
pub const DEFAULT_CANDLE_EPOCH: i64 = 1_704_067_200;

/// Default per-sector index weights, applied when weighting mode is `sector`.
pub const DEFAULT_SECTOR_WEIGHTS: &[(&str, f64)] = &[
    ("Commercial Bank", 0.35),
    ("Development Bank", 0.10),
    ("Hydropower", 0.20),
    ("Life Insurance", 0.10),
    ("Non-Life Insurance", 0.05),
    ("Manufacturing", 0.10),
    ("Hotels & Tourism", 0.05),
    ("Telecom", 0.05),
];

/// Runtime configuration. Every field has a default; `from_env` lets
/// `PAPERMARKET_*` variables override them.
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub tick_interval_ms: u64,
    pub seed: u64,
    /// Length of one tick cycle, in trading days.
    pub cycle_step_days: f64,
    /// Cycles per trading session; 0 disables session rollover.
    pub cycles_per_session: u64,
    /// Multiplier on the beta × index feedback term inside the tick cycle.
    pub beta_coupling: f64,
    /// Annualized volatility of the synthetic market factor used in backfill.
    pub market_volatility: f64,
    pub index_weighting: IndexWeighting,
    pub history_cap: usize,
    /// Price tick: every quoted price is a whole multiple of it.
    pub granularity: f64,
    pub max_budget_levels: usize,
    /// Largest budget-levels × candidates table the optimizer will allocate.
    pub max_dp_cells: usize,
    pub optimizer_timeout_ms: u64,
    pub data_dir: PathBuf,
    pub candle_epoch: i64,
    /// Number of history samples the momentum scorer projects forward.
    pub score_horizon: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            seed: 42,
            cycle_step_days: 1.0 / INTRADAY_BARS_PER_DAY,
            cycles_per_session: INTRADAY_BARS_PER_DAY as u64,
            beta_coupling: 0.5,
            market_volatility: 0.15,
            index_weighting: IndexWeighting::Equal,
            history_cap: HISTORY_CAP,
            granularity: 0.1,
            max_budget_levels: 2_000_000,
            max_dp_cells: 16_000_000,
            optimizer_timeout_ms: 2_000,
            data_dir: PathBuf::from("data"),
            candle_epoch: DEFAULT_CANDLE_EPOCH,
            score_horizon: INTRADAY_BARS_PER_DAY as usize,
        }
    }
}

impl SimConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let index_weighting = match env_string("PAPERMARKET_INDEX_WEIGHTING")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("equal") => IndexWeighting::Equal,
            Some("sector") => IndexWeighting::Sector(default_sector_weights()),
            Some(other) => {
                warn!(
                    "Unknown PAPERMARKET_INDEX_WEIGHTING={} ; defaulting to equal. Allowed values: equal | sector",
                    other
                );
                IndexWeighting::Equal
            }
        };

        Self {
            tick_interval_ms: env_parse("PAPERMARKET_TICK_INTERVAL_MS")
                .map(|v: u64| v.clamp(10, 60_000))
                .unwrap_or(defaults.tick_interval_ms),
            seed: env_parse("PAPERMARKET_SEED").unwrap_or(defaults.seed),
            cycle_step_days: env_parse("PAPERMARKET_CYCLE_STEP_DAYS")
                .filter(|v: &f64| *v > 0.0 && v.is_finite())
                .unwrap_or(defaults.cycle_step_days),
            cycles_per_session: env_parse("PAPERMARKET_CYCLES_PER_SESSION")
                .unwrap_or(defaults.cycles_per_session),
            beta_coupling: env_parse("PAPERMARKET_BETA_COUPLING")
                .map(|v: f64| v.clamp(0.0, 1.0))
                .unwrap_or(defaults.beta_coupling),
            market_volatility: env_parse("PAPERMARKET_MARKET_VOLATILITY")
                .map(|v: f64| v.clamp(0.0, 2.0))
                .unwrap_or(defaults.market_volatility),
            index_weighting,
            history_cap: env_parse("PAPERMARKET_HISTORY_CAP")
                .map(|v: usize| v.max(RESET_RETAINED_HISTORY))
                .unwrap_or(defaults.history_cap),
            granularity: env_parse("PAPERMARKET_GRANULARITY")
                .filter(|v: &f64| *v > 0.0 && v.is_finite())
                .unwrap_or(defaults.granularity),
            max_budget_levels: env_parse("PAPERMARKET_MAX_BUDGET_LEVELS")
                .map(|v: usize| v.max(1))
                .unwrap_or(defaults.max_budget_levels),
            max_dp_cells: env_parse("PAPERMARKET_MAX_DP_CELLS")
                .map(|v: usize| v.max(1))
                .unwrap_or(defaults.max_dp_cells),
            optimizer_timeout_ms: env_parse("PAPERMARKET_OPTIMIZER_TIMEOUT_MS")
                .map(|v: u64| v.max(1))
                .unwrap_or(defaults.optimizer_timeout_ms),
            data_dir: env_string("PAPERMARKET_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            candle_epoch: env_parse("PAPERMARKET_CANDLE_EPOCH").unwrap_or(defaults.candle_epoch),
            score_horizon: env_parse("PAPERMARKET_SCORE_HORIZON")
                .map(|v: usize| v.max(1))
                .unwrap_or(defaults.score_horizon),
        }
    }

    /// Step length of one tick cycle, in years.
    pub fn cycle_dt(&self) -> f64 {
        self.cycle_step_days / TRADING_DAYS
    }
}

pub fn default_sector_weights() -> HashMap<String, f64> {
    DEFAULT_SECTOR_WEIGHTS
        .iter()
        .map(|(sector, weight)| (sector.to_string(), *weight))
        .collect()
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparsable {}={}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cycle_dt_is_five_minutes() {
        let config = SimConfig::default();
        let expected = 1.0 / (TRADING_DAYS * INTRADAY_BARS_PER_DAY);
        assert!((config.cycle_dt() - expected).abs() < 1e-15);
        assert_eq!(config.cycles_per_session, 78);
    }

    #[test]
    fn test_sector_weights_cover_defaults() {
        let weights = default_sector_weights();
        assert_eq!(weights.len(), DEFAULT_SECTOR_WEIGHTS.len());
        assert!(weights.values().all(|w| *w > 0.0));
    }
}
