use crate::config::{MAX_WICK_FRACTION, PRICE_FLOOR, RESET_RETAINED_HISTORY, TRADING_DAYS, VOLUME_RANGE};
use crate::data::{Candle, PricePoint};
use crate::error::{MarketError, MarketResult};
use crate::registry::Instrument;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Live per-instrument market state, owned by the tick-cycle scheduler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstrumentState {
    pub symbol: String,
    pub current_price: f64,
    /// Price at the start of the current session.
    pub open: f64,
    pub previous_close: f64,
    pub day_high: f64,
    pub day_low: f64,
    pub change: f64,
    pub change_percent: f64,
    /// Simple return of the most recent step.
    pub step_return: f64,
    pub history: VecDeque<PricePoint>,
}

impl InstrumentState {
    pub fn baseline(instrument: &Instrument) -> Self {
        let base = instrument.base_price;
        Self {
            symbol: instrument.symbol.clone(),
            current_price: base,
            open: base,
            previous_close: base,
            day_high: base,
            day_low: base,
            change: 0.0,
            change_percent: 0.0,
            step_return: 0.0,
            history: VecDeque::new(),
        }
    }

    /// Applies a freshly simulated price and maintains the derived fields.
    fn record(&mut self, next: f64, time: i64, history_cap: usize) {
        self.step_return = if self.current_price > 0.0 {
            next / self.current_price - 1.0
        } else {
            0.0
        };
        self.current_price = next;
        self.day_high = self.day_high.max(next);
        self.day_low = self.day_low.min(next);
        self.change = next - self.previous_close;
        self.change_percent = if self.previous_close > 0.0 {
            self.change / self.previous_close * 100.0
        } else {
            0.0
        };

        self.history.push_back(PricePoint { time, price: next });
        while self.history.len() > history_cap {
            self.history.pop_front();
        }
    }

    /// Restores the seeded baseline, keeping only a short history tail.
    pub fn reset_to_baseline(&mut self, instrument: &Instrument) {
        let base = instrument.base_price;
        self.current_price = base;
        self.open = base;
        self.previous_close = base;
        self.day_high = base;
        self.day_low = base;
        self.change = 0.0;
        self.change_percent = 0.0;
        self.step_return = 0.0;
        while self.history.len() > RESET_RETAINED_HISTORY {
            self.history.pop_front();
        }
    }

    /// Closes the current session: today's last price becomes the reference close.
    pub fn roll_session(&mut self) {
        let price = self.current_price;
        self.previous_close = price;
        self.open = price;
        self.day_high = price;
        self.day_low = price;
        self.change = 0.0;
        self.change_percent = 0.0;
    }

    pub fn recent_prices(&self) -> Vec<f64> {
        self.history.iter().map(|p| p.price).collect()
    }
}

/// One discretized geometric step, floored so the result is always a
/// strictly positive, finite price.
pub fn step_price(current: f64, drift_step: f64, market_term: f64, vol_step: f64, z: f64) -> f64 {
    let next = current * (1.0 + drift_step + market_term + vol_step * z);
    if !next.is_finite() {
        return current.max(PRICE_FLOOR);
    }
    next.max(PRICE_FLOOR)
}

/// Mixes a base seed with a cycle and instrument index (splitmix64), so each
/// instrument's draw is independent of evaluation order.
pub fn derive_seed(base: u64, cycle: u64, index: u64) -> u64 {
    let mut z = base
        ^ cycle.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ index.wrapping_mul(0xD1B5_4A32_D192_ED03);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Advances instrument prices with a discretized geometric random walk.
#[derive(Clone, Debug)]
pub struct PriceSimulator {
    dt: f64,
    history_cap: usize,
    beta_coupling: f64,
}

impl PriceSimulator {
    /// `dt` is the step length in years.
    pub fn new(dt: f64, history_cap: usize, beta_coupling: f64) -> MarketResult<Self> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(MarketError::invalid_parameter("*", format!("step length must be > 0, got {}", dt)));
        }
        if !beta_coupling.is_finite() {
            return Err(MarketError::invalid_parameter("*", "beta coupling must be finite"));
        }
        Ok(Self {
            dt,
            history_cap: history_cap.max(1),
            beta_coupling,
        })
    }

    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    pub fn next_price(&self, instrument: &Instrument, current: f64, index_return: f64, z: f64) -> f64 {
        let drift_step = instrument.annual_drift * self.dt;
        let vol_step = instrument.annual_volatility * self.dt.sqrt();
        let market_term = instrument.beta * self.beta_coupling * index_return;
        step_price(current, drift_step, market_term, vol_step, z)
    }

    /// Advances `state` in place by one step, drawing noise from `rng`.
    pub fn advance<R: Rng + ?Sized>(
        &self,
        instrument: &Instrument,
        state: &mut InstrumentState,
        index_return: f64,
        rng: &mut R,
        time: i64,
    ) {
        let z: f64 = rng.sample(StandardNormal);
        let next = self.next_price(instrument, state.current_price, index_return, z);
        state.record(next, time, self.history_cap);
    }

    /// Replays one backfill step from `open`, returning a synthetic candle.
    /// A market factor with `market_volatility` is drawn first so beta still
    /// shapes historical paths.
    pub fn replay_candle<R: Rng + ?Sized>(
        &self,
        instrument: &Instrument,
        open: f64,
        market_volatility: f64,
        rng: &mut R,
        time: i64,
    ) -> Candle {
        let sqrt_dt = self.dt.sqrt();
        let market_z: f64 = rng.sample(StandardNormal);
        let index_return = market_volatility * sqrt_dt * market_z;
        let z: f64 = rng.sample(StandardNormal);

        let drift_step = instrument.annual_drift * self.dt;
        let vol_step = instrument.annual_volatility * sqrt_dt;
        let close = step_price(open, drift_step, instrument.beta * index_return, vol_step, z);

        let wick = vol_step.min(MAX_WICK_FRACTION);
        let high = open.max(close) * (1.0 + draw_fraction(rng, wick));
        let low = open.min(close) * (1.0 - draw_fraction(rng, wick));

        let step_days = self.dt * TRADING_DAYS;
        let volume = (rng.gen_range(VOLUME_RANGE.0..VOLUME_RANGE.1) * step_days.sqrt()).round();

        Candle {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

fn draw_fraction<R: Rng + ?Sized>(rng: &mut R, max: f64) -> f64 {
    if max > 0.0 {
        rng.gen_range(0.0..max)
    } else {
        0.0
    }
}
