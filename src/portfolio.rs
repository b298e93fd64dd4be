use crate::error::{MarketError, MarketResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

// ──────────────────────────────────────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────────────────────────────────────

/// DP cells swept between two cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 4096;

/// Relative slack when snapping a float price onto the tick grid.
const TICK_TOLERANCE: f64 = 1e-9;

/// Tick counts above 2^53 no longer map to distinct f64 values.
const MAX_EXACT_TICKS: f64 = 9_007_199_254_740_992.0;

#[derive(Clone, Copy, Debug)]
pub struct OptimizerSettings {
    /// Price tick. Candidate prices must be whole multiples of it; the budget
    /// is floored to it.
    pub granularity: f64,
    /// Largest discretized budget axis accepted before failing on resolution.
    pub max_budget_levels: usize,
    /// Largest budget levels × candidates decision table accepted before
    /// failing on resolution.
    pub max_dp_cells: usize,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            granularity: 0.1,
            max_budget_levels: 2_000_000,
            max_dp_cells: 16_000_000,
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocationCandidate {
    pub symbol: String,
    pub unit_price: f64,
    /// Predicted return per unit; `<= 0` means "do not buy".
    pub return_score: f64,
}

impl AllocationCandidate {
    pub fn new(symbol: &str, unit_price: f64, return_score: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            unit_price,
            return_score,
        }
    }
}

/// Why an allocation came back empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyReason {
    NoCandidates,
    ZeroBudget,
    ZeroUnitCap,
    NoPositiveScores,
    BudgetBelowMinPrice,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocationResult {
    /// Units per candidate symbol; unselected candidates map to 0.
    pub quantities: BTreeMap<String, u64>,
    pub total_cost: f64,
    pub achieved_score: f64,
    pub budget: f64,
    pub budget_utilization: f64,
    pub note: Option<EmptyReason>,
}

impl AllocationResult {
    fn empty(budget: f64, candidates: &[AllocationCandidate], reason: EmptyReason) -> Self {
        Self {
            quantities: candidates.iter().map(|c| (c.symbol.clone(), 0)).collect(),
            total_cost: 0.0,
            achieved_score: 0.0,
            budget,
            budget_utilization: 0.0,
            note: Some(reason),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.quantities.values().all(|q| *q == 0)
    }

    pub fn distinct_holdings(&self) -> usize {
        self.quantities.values().filter(|q| **q > 0).count()
    }
}

/// One candidate that survived filtering, on the reduced budget axis.
#[derive(Clone, Debug)]
struct Item {
    symbol: String,
    price: f64,
    score: f64,
    weight: usize,
}

/// Best (score, distinct holdings) per exact cost level. Unreachable levels
/// hold `f64::NEG_INFINITY`.
struct Levels {
    score: Vec<f64>,
    distinct: Vec<u32>,
}

impl Levels {
    fn unreachable(len: usize) -> Self {
        Self {
            score: vec![f64::NEG_INFINITY; len],
            distinct: vec![0; len],
        }
    }

    fn reset(&mut self) {
        self.score.fill(f64::NEG_INFINITY);
        self.distinct.fill(0);
    }
}

/// A monotone-window entry for the capped sweep.
#[derive(Clone, Copy, Debug)]
struct Source {
    step: u64,
    key: f64,
    distinct: u32,
}

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

/// At equal cost: higher score wins, then fewer distinct holdings.
fn preferable(score: f64, distinct: u32, than_score: f64, than_distinct: u32) -> bool {
    if score == f64::NEG_INFINITY {
        return false;
    }
    if than_score == f64::NEG_INFINITY {
        return true;
    }
    if !approx_eq(score, than_score) {
        return score > than_score;
    }
    distinct < than_distinct
}

/// Polls the cancellation flag once every `CANCEL_CHECK_INTERVAL` cells.
struct CancelTicker<'a> {
    flag: Option<&'a AtomicBool>,
    cells: usize,
}

impl<'a> CancelTicker<'a> {
    fn new(flag: Option<&'a AtomicBool>) -> Self {
        Self { flag, cells: 0 }
    }

    fn tick(&mut self) -> MarketResult<()> {
        if self.cells % CANCEL_CHECK_INTERVAL == 0 {
            if let Some(flag) = self.flag {
                if flag.load(Ordering::Relaxed) {
                    return Err(MarketError::Cancelled);
                }
            }
        }
        self.cells += 1;
        Ok(())
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Whole ticks that fit in `budget`, tolerating float noise around a tick
/// boundary. `None` when the count is not exactly representable.
fn budget_ticks(budget: f64, tick: f64) -> Option<u64> {
    let raw = budget / tick;
    if !raw.is_finite() || raw > MAX_EXACT_TICKS {
        return None;
    }
    let whole = raw.round();
    let ticks = if (raw - whole).abs() <= TICK_TOLERANCE * whole.max(1.0) {
        whole
    } else {
        raw.floor()
    };
    Some(ticks as u64)
}

/// Whole ticks in `price`, or `None` when the price is off the tick grid.
fn price_ticks(price: f64, tick: f64) -> Option<u64> {
    let raw = price / tick;
    let whole = raw.round();
    let on_grid = (1.0..=MAX_EXACT_TICKS).contains(&whole) && (raw - whole).abs() <= TICK_TOLERANCE * whole;
    on_grid.then_some(whole as u64)
}

// ──────────────────────────────────────────────────────────────────────────────
// Optimizer: integer knapsack over a discretized budget axis
// ──────────────────────────────────────────────────────────────────────────────

/// Chooses non-negative integer quantities maximizing Σ qᵢ·scoreᵢ subject to
/// Σ qᵢ·priceᵢ ≤ budget (and qᵢ ≤ `unit_cap` when given).
///
/// Prices are mapped exactly onto the tick grid and the budget axis is
/// stepped by the GCD of the affordable prices, so no price is rounded.
/// A price off the grid, or an axis too large for the configured limits,
/// fails with `OptimizerInfeasible { reason: "resolution" }`.
///
/// Candidates with a non-positive score are never bought. Ties on score are
/// broken by lower total cost, then by fewer distinct instruments.
pub fn optimize_with(
    budget: f64,
    candidates: &[AllocationCandidate],
    unit_cap: Option<u64>,
    settings: &OptimizerSettings,
    cancel: Option<&AtomicBool>,
) -> MarketResult<AllocationResult> {
    if !budget.is_finite() || budget < 0.0 {
        return Err(MarketError::InvalidBudget(budget));
    }
    let tick = settings.granularity;
    if !tick.is_finite() || tick <= 0.0 {
        return Err(MarketError::invalid_parameter(
            "granularity",
            format!("must be > 0, got {}", tick),
        ));
    }
    for c in candidates {
        if !c.unit_price.is_finite() || c.unit_price <= 0.0 {
            return Err(MarketError::invalid_parameter(
                &c.symbol,
                format!("unit_price must be > 0, got {}", c.unit_price),
            ));
        }
    }

    if candidates.is_empty() {
        return Ok(AllocationResult::empty(budget, candidates, EmptyReason::NoCandidates));
    }
    if budget == 0.0 {
        return Ok(AllocationResult::empty(budget, candidates, EmptyReason::ZeroBudget));
    }
    if unit_cap == Some(0) {
        return Ok(AllocationResult::empty(budget, candidates, EmptyReason::ZeroUnitCap));
    }

    let mut seen = HashSet::new();
    let positive: Vec<&AllocationCandidate> = candidates
        .iter()
        .filter(|c| c.return_score.is_finite() && c.return_score > 0.0)
        .filter(|c| seen.insert(c.symbol.clone()))
        .collect();
    if positive.is_empty() {
        return Ok(AllocationResult::empty(budget, candidates, EmptyReason::NoPositiveScores));
    }

    let budget_in_ticks = budget_ticks(budget, tick).ok_or_else(MarketError::resolution)?;
    let mut affordable = Vec::with_capacity(positive.len());
    for c in positive {
        if c.unit_price / tick > budget_in_ticks as f64 + 0.5 {
            continue;
        }
        let Some(ticks) = price_ticks(c.unit_price, tick) else {
            debug!("{} price {} is off the {} tick grid", c.symbol, c.unit_price, tick);
            return Err(MarketError::resolution());
        };
        if ticks <= budget_in_ticks {
            affordable.push((c, ticks));
        }
    }
    if affordable.is_empty() {
        return Ok(AllocationResult::empty(budget, candidates, EmptyReason::BudgetBelowMinPrice));
    }

    let step = affordable.iter().fold(0, |g, (_, ticks)| gcd(g, *ticks));
    let capacity = budget_in_ticks / step;
    let cells = (capacity + 1).checked_mul(affordable.len() as u64);
    if capacity > settings.max_budget_levels as u64
        || capacity >= u64::from(u32::MAX)
        || cells.is_none_or(|cells| cells > settings.max_dp_cells as u64)
    {
        debug!(
            "Knapsack axis too large: {} levels × {} items",
            capacity + 1,
            affordable.len()
        );
        return Err(MarketError::resolution());
    }
    let capacity = capacity as usize;

    let items: Vec<Item> = affordable
        .iter()
        .map(|(c, ticks)| Item {
            symbol: c.symbol.clone(),
            price: c.unit_price,
            score: c.return_score,
            weight: (ticks / step) as usize,
        })
        .collect();

    debug!(
        "Knapsack: {} items, {} budget levels of {} ticks, unit cap {:?}",
        items.len(),
        capacity,
        step,
        unit_cap
    );

    let units = solve(&items, capacity, unit_cap, cancel)?;

    let mut quantities: BTreeMap<String, u64> =
        candidates.iter().map(|c| (c.symbol.clone(), 0)).collect();
    let mut total_cost = 0.0;
    let mut achieved_score = 0.0;
    for (item, &q) in items.iter().zip(units.iter()) {
        if q == 0 {
            continue;
        }
        quantities.insert(item.symbol.clone(), q);
        total_cost += q as f64 * item.price;
        achieved_score += q as f64 * item.score;
    }

    let result = AllocationResult {
        quantities,
        total_cost,
        achieved_score,
        budget,
        budget_utilization: total_cost / budget,
        note: None,
    };
    info!(
        "Allocation: score={:.4}, cost={:.2}/{:.2} ({:.1}%), {} holdings",
        result.achieved_score,
        result.total_cost,
        result.budget,
        result.budget_utilization * 100.0,
        result.distinct_holdings()
    );
    Ok(result)
}

/// Item-major DP over exact cost levels, O(W × N) with or without a cap.
///
/// `best[b]` is the preferred allocation of the items seen so far costing
/// exactly `b` levels. Each item first fills `with_item[b]`, the preferred
/// allocation holding at least one unit of it, which is where the distinct
/// count grows by one; the two tables are then merged. `decisions` records
/// the units of each item behind every merged level for reconstruction.
fn solve(
    items: &[Item],
    capacity: usize,
    unit_cap: Option<u64>,
    cancel: Option<&AtomicBool>,
) -> MarketResult<Vec<u64>> {
    let levels = capacity + 1;
    let mut best = Levels::unreachable(levels);
    best.score[0] = 0.0;
    let mut with_item = Levels::unreachable(levels);
    let mut run_units = vec![0_u32; levels];
    let mut decisions = vec![0_u32; items.len() * levels];
    let mut ticker = CancelTicker::new(cancel);

    for (i, item) in items.iter().enumerate() {
        with_item.reset();
        match unit_cap {
            None => extend_unbounded(item, &best, &mut with_item, &mut run_units, &mut ticker)?,
            Some(cap) => extend_bounded(item, cap, &best, &mut with_item, &mut run_units, &mut ticker)?,
        }

        let row = &mut decisions[i * levels..(i + 1) * levels];
        for b in 0..levels {
            if preferable(with_item.score[b], with_item.distinct[b], best.score[b], best.distinct[b]) {
                best.score[b] = with_item.score[b];
                best.distinct[b] = with_item.distinct[b];
                row[b] = run_units[b];
            }
        }
    }

    // highest score, then the cheapest level reaching it
    let mut target = 0;
    for b in 1..levels {
        let score = best.score[b];
        if score > best.score[target] && !approx_eq(score, best.score[target]) {
            target = b;
        }
    }

    let mut units = vec![0_u64; items.len()];
    let mut b = target;
    for (i, item) in items.iter().enumerate().rev() {
        let q = decisions[i * levels + b];
        units[i] = u64::from(q);
        b -= q as usize * item.weight;
    }
    Ok(units)
}

/// with_item[b] = best of (best[b−w] + first unit, with_item[b−w] + one more).
fn extend_unbounded(
    item: &Item,
    best: &Levels,
    with_item: &mut Levels,
    run_units: &mut [u32],
    ticker: &mut CancelTicker<'_>,
) -> MarketResult<()> {
    let w = item.weight;
    for b in w..best.score.len() {
        ticker.tick()?;
        let prev = b - w;
        let mut score = best.score[prev] + item.score;
        let mut distinct = best.distinct[prev] + 1;
        let mut units = 1;

        let carried = with_item.score[prev] + item.score;
        if preferable(carried, with_item.distinct[prev], score, distinct) {
            score = carried;
            distinct = with_item.distinct[prev];
            units = run_units[prev] + 1;
        }

        with_item.score[b] = score;
        with_item.distinct[b] = distinct;
        run_units[b] = units;
    }
    Ok(())
}

/// with_item[b] = max over 1 ≤ q ≤ cap of best[b − q·w] + q units.
///
/// Levels are walked per residue class mod w. On level `r + m·w`, a source
/// at step `k` contributes `best.score[r + k·w] − k·s + m·s`, so ranking
/// sources by `best.score − k·s` (then distinct) is independent of `m`, and a
/// monotone window over the last `cap` steps yields each level in O(1).
fn extend_bounded(
    item: &Item,
    cap: u64,
    best: &Levels,
    with_item: &mut Levels,
    run_units: &mut [u32],
    ticker: &mut CancelTicker<'_>,
) -> MarketResult<()> {
    let w = item.weight;
    let levels = best.score.len();
    let mut window: VecDeque<Source> = VecDeque::new();

    for residue in 0..w.min(levels) {
        window.clear();
        let mut step = 0_u64;
        let mut b = residue;
        while b < levels {
            ticker.tick()?;
            if step > 0 {
                let from = b - w;
                if best.score[from] > f64::NEG_INFINITY {
                    let source = Source {
                        step: step - 1,
                        key: best.score[from] - (step - 1) as f64 * item.score,
                        distinct: best.distinct[from],
                    };
                    while window
                        .back()
                        .is_some_and(|back| !preferable(back.key, back.distinct, source.key, source.distinct))
                    {
                        window.pop_back();
                    }
                    window.push_back(source);
                }
            }
            while window.front().is_some_and(|front| step - front.step > cap) {
                window.pop_front();
            }

            if let Some(front) = window.front() {
                let q = step - front.step;
                let from = b - q as usize * w;
                with_item.score[b] = best.score[from] + q as f64 * item.score;
                with_item.distinct[b] = front.distinct + 1;
                run_units[b] = q as u32;
            }

            step += 1;
            b += w;
        }
    }
    Ok(())
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn optimize(
        budget: f64,
        candidates: &[AllocationCandidate],
        unit_cap: Option<u64>,
    ) -> MarketResult<AllocationResult> {
        optimize_with(budget, candidates, unit_cap, &OptimizerSettings::default(), None)
    }

    /// (score, cost, distinct holdings) of an allocation.
    type Outcome = (f64, f64, usize);

    fn outcome(result: &AllocationResult) -> Outcome {
        (result.achieved_score, result.total_cost, result.distinct_holdings())
    }

    fn ranks_above(a: Outcome, b: Outcome) -> bool {
        if (a.0 - b.0).abs() > 1e-9 {
            return a.0 > b.0;
        }
        if (a.1 - b.1).abs() > 1e-9 {
            return a.1 < b.1;
        }
        a.2 < b.2
    }

    /// Exhaustive search over every integer allocation within budget.
    fn brute_force(budget: f64, candidates: &[AllocationCandidate], cap: Option<u64>) -> Outcome {
        fn go(
            idx: usize,
            remaining: f64,
            acc: Outcome,
            cs: &[AllocationCandidate],
            cap: Option<u64>,
            best: &mut Outcome,
        ) {
            if idx == cs.len() {
                if ranks_above(acc, *best) {
                    *best = acc;
                }
                return;
            }
            let c = &cs[idx];
            let mut max_q = ((remaining + 1e-9) / c.unit_price).floor() as u64;
            if let Some(cap) = cap {
                max_q = max_q.min(cap);
            }
            if c.return_score <= 0.0 {
                max_q = 0;
            }
            for q in 0..=max_q {
                let next = (
                    acc.0 + q as f64 * c.return_score,
                    acc.1 + q as f64 * c.unit_price,
                    acc.2 + usize::from(q > 0),
                );
                go(idx + 1, remaining - q as f64 * c.unit_price, next, cs, cap, best);
            }
        }
        let mut best = (0.0, 0.0, 0);
        go(0, budget, (0.0, 0.0, 0), candidates, cap, &mut best);
        best
    }

    fn assert_same_outcome(got: Outcome, expected: Outcome, context: &str) {
        assert!((got.0 - expected.0).abs() < 1e-6, "{context}: score {} vs {}", got.0, expected.0);
        assert!((got.1 - expected.1).abs() < 1e-6, "{context}: cost {} vs {}", got.1, expected.1);
        assert_eq!(got.2, expected.2, "{context}: distinct holdings");
    }

    #[test]
    fn test_two_item_scenario_matches_brute_force() {
        let candidates = vec![
            AllocationCandidate::new("NABIL", 850.0, 5.0),
            AllocationCandidate::new("SCB", 380.0, 3.0),
        ];
        let result = optimize(100_000.0, &candidates, None).unwrap();

        let mut best = 0.0_f64;
        for a in 0..=(100_000 / 850) {
            let b = (100_000 - a * 850) / 380;
            best = best.max(a as f64 * 5.0 + b as f64 * 3.0);
        }

        assert!(result.total_cost <= 100_000.0);
        assert!((result.achieved_score - best).abs() < 1e-9);
        assert!(result.note.is_none());
        let recomputed = result.quantities["NABIL"] as f64 * 850.0 + result.quantities["SCB"] as f64 * 380.0;
        assert!((recomputed - result.total_cost).abs() < 1e-9);
    }

    #[test]
    fn test_fractional_prices_are_not_rounded_up() {
        let result = optimize(1_000.0, &[AllocationCandidate::new("SCB", 333.3, 1.0)], None).unwrap();
        assert_eq!(result.quantities["SCB"], 3);
        assert!((result.total_cost - 999.9).abs() < 1e-9);

        let result = optimize(10.0, &[AllocationCandidate::new("AAA", 2.5, 1.0)], None).unwrap();
        assert_eq!(result.quantities["AAA"], 4);
        assert!((result.budget_utilization - 1.0).abs() < 1e-12);

        let capped = optimize(999.9, &[AllocationCandidate::new("SCB", 333.3, 1.0)], Some(5)).unwrap();
        assert_eq!(capped.quantities["SCB"], 3);
    }

    #[test]
    fn test_price_off_tick_grid_is_a_resolution_error() {
        let candidates = vec![AllocationCandidate::new("AAA", 12.34, 1.0)];
        let err = optimize(100.0, &candidates, None).unwrap_err();
        assert!(matches!(err, MarketError::OptimizerInfeasible { ref reason } if reason == "resolution"));

        let fine = OptimizerSettings {
            granularity: 0.01,
            ..OptimizerSettings::default()
        };
        let result = optimize_with(100.0, &candidates, None, &fine, None).unwrap();
        assert_eq!(result.quantities["AAA"], 8);
    }

    #[test]
    fn test_budget_below_cheapest_price_is_empty() {
        let candidates = vec![AllocationCandidate::new("SCB", 380.0, 3.0)];
        let result = optimize(100.0, &candidates, None).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.total_cost, 0.0);
        assert_eq!(result.budget_utilization, 0.0);
        assert_eq!(result.quantities["SCB"], 0);
        assert_eq!(result.note, Some(EmptyReason::BudgetBelowMinPrice));
    }

    #[test]
    fn test_degenerate_inputs() {
        let candidates = vec![
            AllocationCandidate::new("AAA", 10.0, -1.0),
            AllocationCandidate::new("BBB", 20.0, 0.0),
        ];

        let zero = optimize(0.0, &candidates, None).unwrap();
        assert!(zero.is_empty());
        assert_eq!(zero.total_cost, 0.0);
        assert_eq!(zero.note, Some(EmptyReason::ZeroBudget));

        let non_positive = optimize(1_000.0, &candidates, None).unwrap();
        assert!(non_positive.is_empty());
        assert_eq!(non_positive.total_cost, 0.0);
        assert_eq!(non_positive.note, Some(EmptyReason::NoPositiveScores));

        let none = optimize(1_000.0, &[], None).unwrap();
        assert!(none.quantities.is_empty());
        assert_eq!(none.note, Some(EmptyReason::NoCandidates));
    }

    #[test]
    fn test_rejects_bad_budget_and_prices() {
        let candidates = vec![AllocationCandidate::new("AAA", 10.0, 1.0)];
        assert!(matches!(optimize(-5.0, &candidates, None), Err(MarketError::InvalidBudget(_))));
        assert!(matches!(optimize(f64::NAN, &candidates, None), Err(MarketError::InvalidBudget(_))));

        let bad_price = vec![AllocationCandidate::new("AAA", 0.0, 1.0)];
        assert!(matches!(
            optimize(100.0, &bad_price, None),
            Err(MarketError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_resolution_limit() {
        let candidates = vec![AllocationCandidate::new("AAA", 10.0, 1.0)];
        let settings = OptimizerSettings {
            granularity: 1.0,
            max_budget_levels: 1_000,
            ..OptimizerSettings::default()
        };
        let err = optimize_with(1_000_000.0, &candidates, None, &settings, None).unwrap_err();
        match err {
            MarketError::OptimizerInfeasible { reason } => assert_eq!(reason, "resolution"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_decision_table_is_bounded_by_cell_limit() {
        // 100 co-prime prices over a million-level axis: 100M cells
        let candidates: Vec<AllocationCandidate> = (0..100)
            .map(|i| AllocationCandidate::new(&format!("S{i}"), 1.0 + i as f64, 1.0))
            .collect();
        let settings = OptimizerSettings {
            granularity: 1.0,
            max_budget_levels: 2_000_000,
            max_dp_cells: 16_000_000,
        };
        for cap in [None, Some(1_000_000)] {
            let err = optimize_with(1_000_000.0, &candidates, cap, &settings, None).unwrap_err();
            assert!(matches!(err, MarketError::OptimizerInfeasible { .. }));
        }
    }

    #[test]
    fn test_tie_prefers_lower_cost() {
        let candidates = vec![
            AllocationCandidate::new("PRICEY", 15.0, 1.0),
            AllocationCandidate::new("CHEAP", 10.0, 1.0),
        ];
        let result = optimize(15.0, &candidates, None).unwrap();
        assert_eq!(result.quantities["CHEAP"], 1);
        assert_eq!(result.quantities["PRICEY"], 0);
        assert_eq!(result.total_cost, 10.0);
    }

    #[test]
    fn test_tie_prefers_fewer_instruments() {
        let candidates = vec![
            AllocationCandidate::new("AAA", 10.0, 1.0),
            AllocationCandidate::new("BBB", 10.0, 1.0),
        ];
        let result = optimize(20.0, &candidates, None).unwrap();
        assert_eq!(result.achieved_score, 2.0);
        assert_eq!(result.total_cost, 20.0);
        assert_eq!(result.distinct_holdings(), 1);
    }

    #[test]
    fn test_single_instrument_beats_equal_score_mix() {
        // 3×4 + 3×1 and 15×1 both score 15 at cost 15
        let candidates = vec![
            AllocationCandidate::new("A", 7.0, 3.0),
            AllocationCandidate::new("B", 4.0, 4.0),
            AllocationCandidate::new("C", 8.0, 3.0),
            AllocationCandidate::new("D", 1.0, 1.0),
        ];
        let result = optimize(15.0, &candidates, None).unwrap();
        assert_eq!(outcome(&result), (15.0, 15.0, 1));
        assert_eq!(result.quantities["D"], 15);

        let capped = optimize(15.0, &candidates, Some(15)).unwrap();
        assert_eq!(outcome(&capped), (15.0, 15.0, 1));
    }

    #[test]
    fn test_unit_cap_limits_concentration() {
        let candidates = vec![
            AllocationCandidate::new("AAA", 10.0, 5.0),
            AllocationCandidate::new("BBB", 10.0, 1.0),
        ];
        let uncapped = optimize(100.0, &candidates, None).unwrap();
        assert_eq!(uncapped.quantities["AAA"], 10);

        let capped = optimize(100.0, &candidates, Some(3)).unwrap();
        assert_eq!(capped.quantities["AAA"], 3);
        assert_eq!(capped.quantities["BBB"], 3);
        assert_eq!(capped.achieved_score, 18.0);
        assert_eq!(capped.total_cost, 60.0);

        let zero_cap = optimize(100.0, &candidates, Some(0)).unwrap();
        assert_eq!(zero_cap.note, Some(EmptyReason::ZeroUnitCap));
    }

    #[test]
    fn test_random_instances_match_exhaustive_search() {
        let mut rng = StdRng::seed_from_u64(2024);
        for round in 0..400 {
            let n = rng.gen_range(1..=4);
            let candidates: Vec<AllocationCandidate> = (0..n)
                .map(|i| {
                    // prices on the 0.1 tick, small integer scores so ties are common
                    AllocationCandidate::new(
                        &format!("S{i}"),
                        rng.gen_range(10..=60) as f64 * 0.1,
                        rng.gen_range(-1..=4) as f64,
                    )
                })
                .collect();
            let budget = rng.gen_range(0.0..15.0);
            let cap = if round % 2 == 0 { None } else { Some(rng.gen_range(1..=5)) };

            let result = optimize(budget, &candidates, cap).unwrap();
            let expected = brute_force(budget, &candidates, cap);
            let context = format!("round {round} budget {budget} cap {cap:?} {candidates:?}");

            assert!(result.total_cost <= budget + 1e-9, "{context}: over budget");
            assert_same_outcome(outcome(&result), expected, &context);
            if let Some(cap) = cap {
                assert!(result.quantities.values().all(|q| *q <= cap));
            }
            for c in &candidates {
                if c.return_score <= 0.0 {
                    assert_eq!(result.quantities[&c.symbol], 0);
                }
            }
        }
    }

    #[test]
    fn test_capped_matches_uncapped_when_cap_is_loose() {
        let mut rng = StdRng::seed_from_u64(77);
        for _ in 0..100 {
            let candidates: Vec<AllocationCandidate> = (0..5)
                .map(|i| {
                    AllocationCandidate::new(
                        &format!("S{i}"),
                        rng.gen_range(5..=200) as f64 * 0.1,
                        rng.gen_range(0.5..6.0),
                    )
                })
                .collect();
            let budget = rng.gen_range(10.0..500.0);
            let uncapped = optimize(budget, &candidates, None).unwrap();
            let capped = optimize(budget, &candidates, Some(10_000)).unwrap();
            assert_same_outcome(outcome(&capped), outcome(&uncapped), "loose cap");
        }
    }

    #[test]
    fn test_cancel_flag_aborts() {
        let candidates = vec![AllocationCandidate::new("AAA", 10.0, 1.0)];
        let flag = AtomicBool::new(true);
        for cap in [None, Some(3)] {
            let result = optimize_with(100.0, &candidates, cap, &OptimizerSettings::default(), Some(&flag));
            assert!(matches!(result, Err(MarketError::Cancelled)));
        }
    }

    #[test]
    fn test_fractional_granularity() {
        let candidates = vec![AllocationCandidate::new("AAA", 2.5, 1.0)];
        let settings = OptimizerSettings {
            granularity: 0.5,
            max_budget_levels: 10_000,
            ..OptimizerSettings::default()
        };
        let result = optimize_with(10.0, &candidates, None, &settings, None).unwrap();
        assert_eq!(result.quantities["AAA"], 4);
        assert_eq!(result.budget_utilization, 1.0);
    }
}
