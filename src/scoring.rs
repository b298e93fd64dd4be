use crate::data::simple_returns;
use crate::market::MarketSnapshot;
use crate::portfolio::AllocationCandidate;
use std::collections::HashMap;

/// Supplies the predicted-return score the allocation optimizer maximizes.
/// The optimizer never computes scores itself.
pub trait ReturnScorer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Predicted return per unit for `symbol`, given its recent prices
    /// (oldest first). `<= 0` means "do not buy".
    fn return_score(&self, symbol: &str, recent_history: &[f64]) -> f64;
}

/// Fixed symbol → score table; unknown symbols score 0.
#[derive(Clone, Debug, Default)]
pub struct StaticScorer {
    scores: HashMap<String, f64>,
}

impl StaticScorer {
    pub fn new(scores: HashMap<String, f64>) -> Self {
        Self {
            scores: scores
                .into_iter()
                .map(|(symbol, score)| (symbol.trim().to_uppercase(), score))
                .collect(),
        }
    }
}

impl ReturnScorer for StaticScorer {
    fn name(&self) -> &'static str {
        "static"
    }

    fn return_score(&self, symbol: &str, _recent_history: &[f64]) -> f64 {
        self.scores
            .get(&symbol.trim().to_uppercase())
            .copied()
            .unwrap_or(0.0)
    }
}

/// Expected currency gain per share over `horizon` steps, extrapolated from
/// the mean simple return of the recent history.
#[derive(Clone, Copy, Debug)]
pub struct MomentumScorer {
    pub horizon: usize,
}

impl MomentumScorer {
    pub fn new(horizon: usize) -> Self {
        Self { horizon: horizon.max(1) }
    }
}

impl ReturnScorer for MomentumScorer {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn return_score(&self, _symbol: &str, recent_history: &[f64]) -> f64 {
        let Some(&last) = recent_history.last() else {
            return 0.0;
        };
        let returns = simple_returns(recent_history);
        if returns.is_empty() {
            return 0.0;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let score = last * mean * self.horizon as f64;
        if score.is_finite() { score } else { 0.0 }
    }
}

/// Rounds a simulated price to the nearest whole tick, never below one tick.
pub fn quote_price(price: f64, tick: f64) -> f64 {
    (price / tick).round().max(1.0) * tick
}

/// Builds one candidate per instrument in the snapshot, quoted at its
/// current price on the `tick` grid and scored from its stored history.
pub fn candidates_from_snapshot(
    snapshot: &MarketSnapshot,
    scorer: &dyn ReturnScorer,
    tick: f64,
) -> Vec<AllocationCandidate> {
    snapshot
        .states
        .iter()
        .map(|state| {
            let history = state.recent_prices();
            let score = scorer.return_score(&state.symbol, &history);
            AllocationCandidate::new(&state.symbol, quote_price(state.current_price, tick), score)
        })
        .collect()
}
