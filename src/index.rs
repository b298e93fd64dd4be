use crate::config::INDEX_BASE;
use crate::registry::Instrument;
use crate::simulator::InstrumentState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How constituents are weighted in the composite index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "weights", rename_all = "lowercase")]
pub enum IndexWeighting {
    #[default]
    Equal,
    /// Weight per sector, split equally between that sector's members.
    /// Sectors missing from the map count as 1.0.
    Sector(HashMap<String, f64>),
    /// Explicit per-symbol weights; missing symbols count as 0.
    Custom(HashMap<String, f64>),
}

impl IndexWeighting {
    /// Raw (unnormalized) weight for every instrument, in registry order.
    pub fn weights(&self, instruments: &[Instrument]) -> Vec<f64> {
        match self {
            IndexWeighting::Equal => vec![1.0; instruments.len()],
            IndexWeighting::Sector(by_sector) => {
                let mut members: HashMap<&str, usize> = HashMap::new();
                for inst in instruments {
                    *members.entry(inst.sector.as_str()).or_default() += 1;
                }
                instruments
                    .iter()
                    .map(|inst| {
                        let sector_weight = by_sector.get(&inst.sector).copied().unwrap_or(1.0);
                        let count = members.get(inst.sector.as_str()).copied().unwrap_or(1);
                        sector_weight.max(0.0) / count as f64
                    })
                    .collect()
            }
            IndexWeighting::Custom(by_symbol) => instruments
                .iter()
                .map(|inst| by_symbol.get(&inst.symbol).copied().unwrap_or(0.0).max(0.0))
                .collect(),
        }
    }
}

/// Read-only view of one index constituent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Constituent {
    pub symbol: String,
    /// Normalized weight (weights sum to 1 when any weight is positive).
    pub weight: f64,
    pub price: f64,
    pub change_percent: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketIndex {
    pub value: f64,
    /// Weighted average of constituent change percents vs previous close.
    pub change_percent: f64,
    /// Weighted average of constituent last-step returns; fed back as the
    /// next cycle's index return.
    pub cycle_return: f64,
    pub constituents: Vec<Constituent>,
}

impl MarketIndex {
    pub fn flat() -> Self {
        Self {
            value: INDEX_BASE,
            change_percent: 0.0,
            cycle_return: 0.0,
            constituents: Vec::new(),
        }
    }
}

/// Recomputes the composite index from a fully advanced set of states.
/// `instruments` and `states` are parallel slices in registry order.
pub fn recompute(
    instruments: &[Instrument],
    states: &[InstrumentState],
    weighting: &IndexWeighting,
) -> MarketIndex {
    let raw = weighting.weights(instruments);
    let total: f64 = raw.iter().sum();

    let normalized: Vec<f64> = if total > 0.0 && total.is_finite() {
        raw.iter().map(|w| w / total).collect()
    } else {
        vec![0.0; raw.len()]
    };

    let mut relative_level = 0.0;
    let mut change_percent = 0.0;
    let mut cycle_return = 0.0;
    let mut constituents = Vec::with_capacity(states.len());

    for ((inst, state), &weight) in instruments.iter().zip(states.iter()).zip(normalized.iter()) {
        relative_level += weight * (state.current_price / inst.base_price);
        change_percent += weight * state.change_percent;
        cycle_return += weight * state.step_return;
        constituents.push(Constituent {
            symbol: state.symbol.clone(),
            weight,
            price: state.current_price,
            change_percent: state.change_percent,
        });
    }

    if normalized.iter().all(|w| *w == 0.0) {
        return MarketIndex {
            constituents,
            ..MarketIndex::flat()
        };
    }

    MarketIndex {
        value: INDEX_BASE * relative_level,
        change_percent,
        cycle_return,
        constituents,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(symbol: &str, sector: &str, base: f64) -> Instrument {
        Instrument::new(symbol, symbol, sector, base, 0.0, 0.2, 1.0).unwrap()
    }

    fn moved(instrument: &Instrument, price: f64) -> InstrumentState {
        let mut state = InstrumentState::baseline(instrument);
        state.step_return = price / state.current_price - 1.0;
        state.current_price = price;
        state.change = price - state.previous_close;
        state.change_percent = state.change / state.previous_close * 100.0;
        state
    }

    #[test]
    fn test_equal_weight_index() {
        let a = inst("AAA", "Bank", 100.0);
        let b = inst("BBB", "Hydro", 50.0);
        let states = vec![moved(&a, 110.0), moved(&b, 45.0)];
        let index = recompute(&[a, b], &states, &IndexWeighting::Equal);

        // (+10% + -10%) / 2
        assert!(index.change_percent.abs() < 1e-9);
        assert!((index.value - 1000.0).abs() < 1e-9);
        assert_eq!(index.constituents.len(), 2);
        assert!((index.constituents[0].weight - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_sector_weighting_splits_within_sector() {
        let a = inst("AAA", "Bank", 100.0);
        let b = inst("BBB", "Bank", 100.0);
        let c = inst("CCC", "Hydro", 100.0);
        let mut sectors = HashMap::new();
        sectors.insert("Bank".to_string(), 0.8);
        sectors.insert("Hydro".to_string(), 0.2);

        let weights = IndexWeighting::Sector(sectors).weights(&[a.clone(), b.clone(), c.clone()]);
        assert_eq!(weights, vec![0.4, 0.4, 0.2]);

        let states = vec![moved(&a, 100.0), moved(&b, 100.0), moved(&c, 120.0)];
        let index = recompute(
            &[a, b, c],
            &states,
            &IndexWeighting::Sector(HashMap::from([
                ("Bank".to_string(), 0.8),
                ("Hydro".to_string(), 0.2),
            ])),
        );
        assert!((index.change_percent - 4.0).abs() < 1e-9);
        assert!((index.cycle_return - 0.04).abs() < 1e-12);
    }

    #[test]
    fn test_zero_weights_give_flat_index() {
        let a = inst("AAA", "Bank", 100.0);
        let states = vec![moved(&a, 130.0)];
        let index = recompute(&[a], &states, &IndexWeighting::Custom(HashMap::new()));
        assert_eq!(index.value, INDEX_BASE);
        assert_eq!(index.change_percent, 0.0);
        assert_eq!(index.cycle_return, 0.0);
    }
}
