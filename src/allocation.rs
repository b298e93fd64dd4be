use crate::config::SimConfig;
use crate::error::{MarketError, MarketResult};
use crate::portfolio::{self, AllocationCandidate, AllocationResult, OptimizerSettings};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tracing::{debug, warn};

/// Runs allocation requests off the tick path, with at most one in-flight
/// computation per caller and a bounded compute budget per request.
pub struct AllocationService {
    settings: OptimizerSettings,
    timeout: Duration,
    in_flight: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl AllocationService {
    pub fn new(settings: OptimizerSettings, timeout: Duration) -> Self {
        Self {
            settings,
            timeout,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SimConfig) -> Self {
        Self::new(
            OptimizerSettings {
                granularity: config.granularity,
                max_budget_levels: config.max_budget_levels,
                max_dp_cells: config.max_dp_cells,
            },
            Duration::from_millis(config.optimizer_timeout_ms),
        )
    }

    /// Requests currently registered as in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Optimizes on a blocking worker. A newer request from the same caller
    /// cancels this one (`Superseded`); exceeding the timeout cancels it and
    /// yields `Timeout` with no partial allocation.
    pub async fn optimize(
        &self,
        caller: &str,
        budget: f64,
        candidates: Vec<AllocationCandidate>,
        unit_cap: Option<u64>,
    ) -> MarketResult<AllocationResult> {
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = in_flight.insert(caller.to_string(), Arc::clone(&cancel)) {
                previous.store(true, Ordering::Relaxed);
                debug!("Superseding in-flight allocation for {}", caller);
            }
        }

        let settings = self.settings;
        let worker_cancel = Arc::clone(&cancel);
        let job = tokio::task::spawn_blocking(move || {
            portfolio::optimize_with(budget, &candidates, unit_cap, &settings, Some(&worker_cancel))
        });

        let mut timed_out = false;
        let outcome = match tokio::time::timeout(self.timeout, job).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(MarketError::ServiceUnavailable(format!(
                "optimizer worker failed: {}",
                join_err
            ))),
            Err(_) => {
                timed_out = true;
                cancel.store(true, Ordering::Relaxed);
                warn!(
                    "Allocation for {} exceeded {} ms; cancelled",
                    caller,
                    self.timeout.as_millis()
                );
                Err(MarketError::Timeout(self.timeout.as_millis() as u64))
            }
        };

        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if in_flight.get(caller).is_some_and(|current| Arc::ptr_eq(current, &cancel)) {
                in_flight.remove(caller);
            }
        }

        if !timed_out && cancel.load(Ordering::Relaxed) {
            return Err(MarketError::Superseded);
        }
        outcome
    }
}
