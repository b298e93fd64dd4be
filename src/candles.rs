use crate::data::{Candle, PricePoint, Timeframe};
use crate::error::MarketResult;
use crate::registry::InstrumentRegistry;
use crate::simulator::{PriceSimulator, derive_seed};
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Builds synthetic OHLCV history by replaying the price simulator.
///
/// The builder only picks step length and point count per timeframe; every
/// candle comes from `PriceSimulator::replay_candle`. Output is a pure
/// function of (symbol, timeframe, point count, seed).
pub struct CandleHistoryBuilder<'a> {
    registry: &'a InstrumentRegistry,
    market_volatility: f64,
    epoch: i64,
}

impl<'a> CandleHistoryBuilder<'a> {
    pub fn new(registry: &'a InstrumentRegistry, market_volatility: f64, epoch: i64) -> Self {
        Self {
            registry,
            market_volatility,
            epoch,
        }
    }

    pub fn build_series(
        &self,
        symbol: &str,
        timeframe: &str,
        point_count: usize,
        seed: u64,
    ) -> MarketResult<Vec<Candle>> {
        let timeframe: Timeframe = timeframe.parse()?;
        let instrument = self.registry.get(symbol)?;
        let simulator = PriceSimulator::new(timeframe.dt(), 1, 1.0)?;

        let mut rng = StdRng::seed_from_u64(seed);
        let spacing = timeframe.spacing_secs();
        let mut candles = Vec::with_capacity(point_count);
        let mut open = instrument.base_price;

        for i in 0..point_count {
            let time = self.epoch + i as i64 * spacing;
            let candle = simulator.replay_candle(instrument, open, self.market_volatility, &mut rng, time);
            open = candle.close;
            candles.push(candle);
        }

        Ok(candles)
    }

    /// Chart series with the timeframe's default point count and a seed
    /// derived from `base_seed`, the symbol and the timeframe.
    pub fn chart_series(&self, symbol: &str, timeframe: &str, base_seed: u64) -> MarketResult<Vec<Candle>> {
        let tf: Timeframe = timeframe.parse()?;
        let seed = series_seed(base_seed, symbol, tf);
        self.build_series(symbol, tf.as_str(), tf.point_count(), seed)
    }
}

pub fn series_seed(base_seed: u64, symbol: &str, timeframe: Timeframe) -> u64 {
    // FNV-1a over the normalized symbol
    let symbol_hash = symbol
        .trim()
        .to_uppercase()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
    let tf_index = Timeframe::ALL.iter().position(|t| *t == timeframe).unwrap_or(0) as u64;
    derive_seed(base_seed, symbol_hash, tf_index)
}

/// Buckets stored tick samples into candles of `bucket_secs` width.
/// Volume is the number of ticks that landed in the bucket.
pub fn bucket_ticks(points: &[PricePoint], bucket_secs: i64) -> Vec<Candle> {
    let bucket_secs = bucket_secs.max(1);
    let mut candles: Vec<Candle> = Vec::new();

    for point in points {
        let bucket_start = point.time.div_euclid(bucket_secs) * bucket_secs;
        match candles.last_mut() {
            Some(last) if last.time == bucket_start => {
                last.high = last.high.max(point.price);
                last.low = last.low.min(point.price);
                last.close = point.price;
                last.volume += 1.0;
            }
            Some(last) if last.time > bucket_start => {
                // out-of-order sample; history is append-only so this is skipped
                continue;
            }
            _ => candles.push(Candle {
                time: bucket_start,
                open: point.price,
                high: point.price,
                low: point.price,
                close: point.price,
                volume: 1.0,
            }),
        }
    }

    candles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CANDLE_EPOCH;
    use crate::error::MarketError;
    use crate::registry::Instrument;

    fn nabil_registry() -> InstrumentRegistry {
        let nabil = Instrument::new("NABIL", "Nabil Bank", "Commercial Bank", 850.0, 0.10, 0.22, 1.1).unwrap();
        InstrumentRegistry::new(vec![nabil]).unwrap()
    }

    #[test]
    fn test_one_day_series_for_nabil() {
        let registry = nabil_registry();
        let builder = CandleHistoryBuilder::new(&registry, 0.15, DEFAULT_CANDLE_EPOCH);
        let candles = builder.build_series("NABIL", "1D", 78, 42).unwrap();

        assert_eq!(candles.len(), 78);
        assert_eq!(candles[0].open, 850.0);
        for candle in &candles {
            assert!(candle.low <= candle.open && candle.open <= candle.high);
            assert!(candle.low <= candle.close && candle.close <= candle.high);
            assert!(candle.volume >= 0.0);
        }
        for pair in candles.windows(2) {
            assert!(pair[0].time < pair[1].time);
            assert_eq!(pair[1].open, pair[0].close);
        }
    }

    #[test]
    fn test_series_is_deterministic() {
        let registry = InstrumentRegistry::default_catalog().unwrap();
        let builder = CandleHistoryBuilder::new(&registry, 0.15, DEFAULT_CANDLE_EPOCH);
        for tf in Timeframe::ALL {
            let a = builder.chart_series("UPPER", tf.as_str(), 7).unwrap();
            let b = builder.chart_series("UPPER", tf.as_str(), 7).unwrap();
            assert_eq!(a.len(), tf.point_count());
            assert_eq!(
                serde_json::to_string(&a).unwrap(),
                serde_json::to_string(&b).unwrap()
            );
        }
        let other = builder.chart_series("UPPER", "1D", 8).unwrap();
        let base = builder.chart_series("UPPER", "1D", 7).unwrap();
        assert_ne!(other, base);
    }

    #[test]
    fn test_unknown_inputs_are_rejected() {
        let registry = nabil_registry();
        let builder = CandleHistoryBuilder::new(&registry, 0.15, DEFAULT_CANDLE_EPOCH);
        assert!(matches!(
            builder.build_series("NABIL", "2H", 10, 1),
            Err(MarketError::UnknownTimeframe(_))
        ));
        assert!(matches!(
            builder.build_series("SCB", "1D", 10, 1),
            Err(MarketError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn test_bucket_ticks() {
        let points = vec![
            PricePoint { time: 0, price: 10.0 },
            PricePoint { time: 20, price: 12.0 },
            PricePoint { time: 40, price: 9.0 },
            PricePoint { time: 61, price: 11.0 },
            PricePoint { time: 130, price: 13.0 },
        ];
        let candles = bucket_ticks(&points, 60);
        assert_eq!(candles.len(), 3);

        let first = &candles[0];
        assert_eq!((first.open, first.high, first.low, first.close), (10.0, 12.0, 9.0, 9.0));
        assert_eq!(first.volume, 3.0);
        assert_eq!(candles[1].time, 60);
        assert_eq!(candles[2].time, 120);
        assert!(candles.iter().all(Candle::is_well_formed));
        assert!(bucket_ticks(&[], 60).is_empty());
    }
}
