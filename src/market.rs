use crate::config::{SESSION_SECONDS, SimConfig};
use crate::error::{MarketError, MarketResult};
use crate::index::{self, IndexWeighting, MarketIndex};
use crate::persistence::SnapshotStore;
use crate::registry::{Instrument, InstrumentRegistry};
use crate::simulator::{InstrumentState, PriceSimulator, derive_seed};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Immutable view of the market after one complete tick cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub cycle: u64,
    pub generated_at: DateTime<Utc>,
    pub instruments: Vec<Instrument>,
    pub states: Vec<InstrumentState>,
    pub index: MarketIndex,
    /// Set when this cycle could not be persisted.
    pub degraded: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstrumentQuote {
    pub symbol: String,
    pub name: String,
    pub sector: String,
    pub current_price: f64,
    pub previous_close: f64,
    pub day_high: f64,
    pub day_low: f64,
    pub annual_volatility: f64,
    pub change: f64,
    pub change_percent: f64,
}

impl MarketSnapshot {
    pub fn list_instruments(&self) -> Vec<InstrumentQuote> {
        self.instruments
            .iter()
            .zip(self.states.iter())
            .map(|(inst, state)| InstrumentQuote {
                symbol: inst.symbol.clone(),
                name: inst.name.clone(),
                sector: inst.sector.clone(),
                current_price: state.current_price,
                previous_close: state.previous_close,
                day_high: state.day_high,
                day_low: state.day_low,
                annual_volatility: inst.annual_volatility,
                change: state.change,
                change_percent: state.change_percent,
            })
            .collect()
    }

    pub fn state(&self, symbol: &str) -> MarketResult<&InstrumentState> {
        let wanted = symbol.trim().to_uppercase();
        self.states
            .iter()
            .find(|s| s.symbol.to_uppercase() == wanted)
            .ok_or_else(|| MarketError::UnknownSymbol(symbol.to_string()))
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Engine: synchronous tick-cycle core
// ──────────────────────────────────────────────────────────────────────────────

/// Owns every `InstrumentState`. Only `advance_cycle`, `reset_to_baseline`
/// and `restore` mutate them, each as one complete step.
pub struct MarketEngine {
    registry: Arc<InstrumentRegistry>,
    simulator: PriceSimulator,
    states: Vec<InstrumentState>,
    index: MarketIndex,
    weighting: IndexWeighting,
    seed: u64,
    cycle: u64,
    cycles_per_session: u64,
    clock_origin: i64,
    step_secs: i64,
}

impl MarketEngine {
    pub fn new(registry: InstrumentRegistry, config: SimConfig) -> MarketResult<Self> {
        if registry.is_empty() {
            warn!("Market engine created with an empty registry");
        }
        let simulator = PriceSimulator::new(config.cycle_dt(), config.history_cap, config.beta_coupling)?;
        let states: Vec<InstrumentState> = registry.instruments().iter().map(InstrumentState::baseline).collect();
        let index = index::recompute(registry.instruments(), &states, &config.index_weighting);
        let step_secs = ((config.cycle_step_days * SESSION_SECONDS).round() as i64).max(1);

        info!(
            "Market engine ready: {} instruments, seed {}, step {}s",
            registry.len(),
            config.seed,
            step_secs
        );

        Ok(Self {
            registry: Arc::new(registry),
            simulator,
            states,
            index,
            weighting: config.index_weighting,
            seed: config.seed,
            cycle: 0,
            cycles_per_session: config.cycles_per_session,
            clock_origin: config.candle_epoch,
            step_secs,
        })
    }

    pub fn registry(&self) -> Arc<InstrumentRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn index(&self) -> &MarketIndex {
        &self.index
    }

    /// Simulated timestamp of the given cycle.
    fn sim_time(&self, cycle: u64) -> i64 {
        self.clock_origin + cycle as i64 * self.step_secs
    }

    /// Ticks every instrument exactly once against the previous cycle's index
    /// return, then recomputes the index from the fully advanced states.
    pub fn advance_cycle(&mut self) -> MarketSnapshot {
        if self.cycles_per_session > 0 && self.cycle > 0 && self.cycle % self.cycles_per_session == 0 {
            for state in &mut self.states {
                state.roll_session();
            }
            debug!("Session rolled over at cycle {}", self.cycle);
        }

        let cycle = self.cycle + 1;
        let time = self.sim_time(cycle);
        let index_return = self.index.cycle_return;
        let seed = self.seed;
        let simulator = &self.simulator;
        let instruments = self.registry.instruments();

        self.states.par_iter_mut().enumerate().for_each(|(i, state)| {
            let mut rng = StdRng::seed_from_u64(derive_seed(seed, cycle, i as u64));
            simulator.advance(&instruments[i], state, index_return, &mut rng, time);
        });

        self.index = index::recompute(instruments, &self.states, &self.weighting);
        self.cycle = cycle;

        debug!(
            "Cycle {}: index {:.2} ({:+.3}%)",
            cycle, self.index.value, self.index.change_percent
        );
        self.snapshot()
    }

    /// Restores every instrument to its seeded baseline as one
    /// cycle-equivalent update.
    pub fn reset_to_baseline(&mut self) -> MarketSnapshot {
        for (inst, state) in self.registry.instruments().iter().zip(self.states.iter_mut()) {
            state.reset_to_baseline(inst);
        }
        self.index = index::recompute(self.registry.instruments(), &self.states, &self.weighting);
        self.cycle += 1;
        info!("Market reset to baseline at cycle {}", self.cycle);
        self.snapshot()
    }

    /// Adopts the states of a persisted snapshot. Symbols no longer in the
    /// registry are ignored. Returns the number of instruments restored.
    pub fn restore(&mut self, snapshot: &MarketSnapshot) -> usize {
        let mut restored = 0;
        for saved in &snapshot.states {
            match self.registry.position(&saved.symbol) {
                Some(pos) => {
                    let mut state = saved.clone();
                    state.symbol = self.registry.instruments()[pos].symbol.clone();
                    while state.history.len() > self.simulator.history_cap() {
                        state.history.pop_front();
                    }
                    self.states[pos] = state;
                    restored += 1;
                }
                None => warn!("Dropping persisted state for unknown symbol {}", saved.symbol),
            }
        }
        self.cycle = snapshot.cycle;
        self.index = index::recompute(self.registry.instruments(), &self.states, &self.weighting);
        info!("Restored {} instruments from cycle {}", restored, snapshot.cycle);
        restored
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        MarketSnapshot {
            cycle: self.cycle,
            generated_at: Utc::now(),
            instruments: self.registry.instruments().to_vec(),
            states: self.states.clone(),
            index: self.index.clone(),
            degraded: false,
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Scheduler: async driver, publication, commands
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    Snapshot { snapshot: Arc<MarketSnapshot> },
    Paused { cycle: u64 },
    Resumed { cycle: u64 },
}

#[derive(Debug)]
pub enum MarketCommand {
    Pause,
    Resume,
    Reset {
        reply: Option<oneshot::Sender<Arc<MarketSnapshot>>>,
    },
    Stop,
}

pub struct MarketPublisher {
    snapshot_tx: watch::Sender<Arc<MarketSnapshot>>,
    event_tx: broadcast::Sender<MarketEvent>,
}

impl MarketPublisher {
    fn publish(&self, snapshot: MarketSnapshot) -> Arc<MarketSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.snapshot_tx.send_replace(Arc::clone(&snapshot));
        // no subscribers is fine
        let _ = self.event_tx.send(MarketEvent::Snapshot {
            snapshot: Arc::clone(&snapshot),
        });
        snapshot
    }

    fn notify(&self, event: MarketEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Cloneable access to a running market loop.
#[derive(Clone)]
pub struct MarketHandle {
    command_tx: mpsc::Sender<MarketCommand>,
    snapshot_rx: watch::Receiver<Arc<MarketSnapshot>>,
    event_tx: broadcast::Sender<MarketEvent>,
}

impl MarketHandle {
    /// Latest complete snapshot; never waits on an in-progress cycle.
    pub fn latest(&self) -> Arc<MarketSnapshot> {
        Arc::clone(&self.snapshot_rx.borrow())
    }

    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.event_tx.subscribe()
    }

    async fn send(&self, command: MarketCommand) -> MarketResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| MarketError::ServiceUnavailable("market loop is not running".to_string()))
    }

    pub async fn pause(&self) -> MarketResult<()> {
        self.send(MarketCommand::Pause).await
    }

    pub async fn resume(&self) -> MarketResult<()> {
        self.send(MarketCommand::Resume).await
    }

    pub async fn stop(&self) -> MarketResult<()> {
        self.send(MarketCommand::Stop).await
    }

    /// Resets the market and waits for the resulting snapshot.
    pub async fn reset(&self) -> MarketResult<Arc<MarketSnapshot>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(MarketCommand::Reset { reply: Some(reply_tx) }).await?;
        reply_rx
            .await
            .map_err(|_| MarketError::ServiceUnavailable("market loop stopped during reset".to_string()))
    }
}

/// Creates the channels and spawns `run_market` on the current runtime.
pub fn spawn_market(
    engine: MarketEngine,
    tick_interval: Duration,
    store: Arc<dyn SnapshotStore>,
) -> (MarketHandle, JoinHandle<Result<()>>) {
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(engine.snapshot()));
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

    let publisher = MarketPublisher {
        snapshot_tx,
        event_tx: event_tx.clone(),
    };
    let handle = MarketHandle {
        command_tx,
        snapshot_rx,
        event_tx,
    };
    let task = tokio::spawn(run_market(engine, tick_interval, store, publisher, command_rx));
    (handle, task)
}

pub async fn run_market(
    mut engine: MarketEngine,
    tick_interval: Duration,
    store: Arc<dyn SnapshotStore>,
    publisher: MarketPublisher,
    mut command_rx: mpsc::Receiver<MarketCommand>,
) -> Result<()> {
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick completes immediately
    interval.tick().await;
    let mut paused = false;

    info!("Market loop started (tick every {:?})", tick_interval);

    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(MarketCommand::Pause) => {
                    paused = true;
                    info!("Market paused at cycle {}", engine.cycle());
                    publisher.notify(MarketEvent::Paused { cycle: engine.cycle() });
                }
                Some(MarketCommand::Resume) => {
                    paused = false;
                    info!("Market resumed at cycle {}", engine.cycle());
                    publisher.notify(MarketEvent::Resumed { cycle: engine.cycle() });
                }
                Some(MarketCommand::Reset { reply }) => {
                    let (returned, snapshot) =
                        run_cycle(engine, Arc::clone(&store), MarketEngine::reset_to_baseline).await?;
                    engine = returned;
                    let snapshot = publisher.publish(snapshot);
                    if let Some(reply) = reply {
                        let _ = reply.send(snapshot);
                    }
                }
                Some(MarketCommand::Stop) | None => {
                    info!("Market loop stopped at cycle {}", engine.cycle());
                    return Ok(());
                }
            },
            _ = interval.tick() => {
                if !paused {
                    let (returned, snapshot) =
                        run_cycle(engine, Arc::clone(&store), MarketEngine::advance_cycle).await?;
                    engine = returned;
                    publisher.publish(snapshot);
                }
            }
        }
    }
}

/// Runs one engine step plus persistence off the async executor. A failed
/// write marks the snapshot degraded; the loop keeps its in-memory state.
async fn run_cycle(
    mut engine: MarketEngine,
    store: Arc<dyn SnapshotStore>,
    step: fn(&mut MarketEngine) -> MarketSnapshot,
) -> Result<(MarketEngine, MarketSnapshot)> {
    tokio::task::spawn_blocking(move || {
        let mut snapshot = step(&mut engine);
        if let Err(e) = store.persist(&snapshot) {
            error!(
                "Persisting cycle {} failed, continuing in-memory: {}",
                snapshot.cycle, e
            );
            snapshot.degraded = true;
        }
        (engine, snapshot)
    })
    .await
    .map_err(|e| anyhow!("Market cycle task failed: {}", e))
}
