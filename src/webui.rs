use crate::allocation::AllocationService;
use crate::candles::{self, CandleHistoryBuilder};
use crate::config::SimConfig;
use crate::data::{Candle, Timeframe};
use crate::error::MarketError;
use crate::index::MarketIndex;
use crate::market::{InstrumentQuote, MarketEvent, MarketHandle, MarketSnapshot};
use crate::portfolio::{AllocationCandidate, AllocationResult};
use crate::registry::InstrumentRegistry;
use crate::scoring::{self, ReturnScorer, StaticScorer};
use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

const MAX_CANDLE_POINTS: usize = 5_000;
const DEFAULT_BUCKET_SECS: i64 = 60;
const ANONYMOUS_CALLER: &str = "anonymous";

#[derive(Clone)]
pub struct WebState {
    market: MarketHandle,
    registry: Arc<InstrumentRegistry>,
    allocator: Arc<AllocationService>,
    scorer: Arc<dyn ReturnScorer>,
    config: Arc<SimConfig>,
}

impl WebState {
    pub fn new(
        market: MarketHandle,
        registry: Arc<InstrumentRegistry>,
        allocator: Arc<AllocationService>,
        scorer: Arc<dyn ReturnScorer>,
        config: SimConfig,
    ) -> Self {
        Self {
            market,
            registry,
            allocator,
            scorer,
            config: Arc::new(config),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
struct ApiError {
    error: String,
    code: String,
}

#[derive(Debug, Deserialize)]
struct CandleQuery {
    timeframe: Option<String>,
    seed: Option<u64>,
    points: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct LiveCandleQuery {
    bucket_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OptimizeRequest {
    budget: f64,
    /// Explicit candidates; when absent every instrument in the latest
    /// snapshot becomes a candidate.
    candidates: Option<Vec<AllocationCandidate>>,
    /// Caller-supplied symbol scores for snapshot candidates; overrides the
    /// configured scorer.
    scores: Option<HashMap<String, f64>>,
    caller: Option<String>,
    unit_cap: Option<u64>,
}

#[derive(Debug, Serialize)]
struct OptimizeResponse {
    cycle: u64,
    scorer: Option<&'static str>,
    #[serde(flatten)]
    result: AllocationResult,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/instruments", get(instruments))
        .route("/api/candles/:symbol", get(candle_history))
        .route("/api/candles/:symbol/live", get(live_candles))
        .route("/api/index", get(market_index))
        .route("/api/snapshot", get(snapshot))
        .route("/api/optimize", post(optimize))
        .route("/api/admin/reset", post(reset))
        .route("/api/market/pause", post(pause))
        .route("/api/market/resume", post(resume))
        .route("/api/stream", get(stream))
        .with_state(state)
}

pub async fn run_webui_server(port: u16, state: WebState) -> Result<()> {
    let app = router(state);
    let addr = format!("0.0.0.0:{}", port);
    info!("Market API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<WebState>) -> Json<serde_json::Value> {
    let latest = state.market.latest();
    Json(serde_json::json!({
        "ok": true,
        "cycle": latest.cycle,
        "degraded": latest.degraded,
        "optimizations_in_flight": state.allocator.in_flight(),
    }))
}

async fn instruments(State(state): State<WebState>) -> Json<Vec<InstrumentQuote>> {
    Json(state.market.latest().list_instruments())
}

async fn candle_history(
    State(state): State<WebState>,
    Path(symbol): Path<String>,
    Query(query): Query<CandleQuery>,
) -> ApiResult<Vec<Candle>> {
    let timeframe: Timeframe = query
        .timeframe
        .as_deref()
        .unwrap_or(Timeframe::OneDay.as_str())
        .parse()
        .map_err(market_err)?;
    let builder = CandleHistoryBuilder::new(&state.registry, state.config.market_volatility, state.config.candle_epoch);
    let base_seed = query.seed.unwrap_or(state.config.seed);

    let series = match query.points {
        Some(points) if points == 0 || points > MAX_CANDLE_POINTS => {
            return Err(api_err(
                StatusCode::BAD_REQUEST,
                "INVALID_PARAMETER",
                &format!("points must be between 1 and {}", MAX_CANDLE_POINTS),
            ));
        }
        Some(points) => builder.build_series(
            &symbol,
            timeframe.as_str(),
            points,
            candles::series_seed(base_seed, &symbol, timeframe),
        ),
        None => builder.chart_series(&symbol, timeframe.as_str(), base_seed),
    };
    series.map(Json).map_err(market_err)
}

async fn live_candles(
    State(state): State<WebState>,
    Path(symbol): Path<String>,
    Query(query): Query<LiveCandleQuery>,
) -> ApiResult<Vec<Candle>> {
    let bucket_secs = query.bucket_secs.unwrap_or(DEFAULT_BUCKET_SECS);
    if bucket_secs <= 0 {
        return Err(api_err(StatusCode::BAD_REQUEST, "INVALID_PARAMETER", "bucket_secs must be > 0"));
    }
    let latest = state.market.latest();
    let instrument_state = latest.state(&symbol).map_err(market_err)?;
    let points: Vec<_> = instrument_state.history.iter().copied().collect();
    Ok(Json(candles::bucket_ticks(&points, bucket_secs)))
}

async fn market_index(State(state): State<WebState>) -> Json<MarketIndex> {
    Json(state.market.latest().index.clone())
}

async fn snapshot(State(state): State<WebState>) -> Json<Arc<MarketSnapshot>> {
    Json(state.market.latest())
}

async fn optimize(State(state): State<WebState>, Json(req): Json<OptimizeRequest>) -> ApiResult<OptimizeResponse> {
    let latest = state.market.latest();
    let tick = state.config.granularity;
    let (candidates, scorer) = match (req.candidates, req.scores) {
        (Some(candidates), _) => (candidates, None),
        (None, Some(scores)) => {
            let table = StaticScorer::new(scores);
            (scoring::candidates_from_snapshot(&latest, &table, tick), Some(table.name()))
        }
        (None, None) => (
            scoring::candidates_from_snapshot(&latest, state.scorer.as_ref(), tick),
            Some(state.scorer.name()),
        ),
    };
    let caller = req
        .caller
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(ANONYMOUS_CALLER)
        .to_string();

    let result = state
        .allocator
        .optimize(&caller, req.budget, candidates, req.unit_cap)
        .await
        .map_err(market_err)?;

    Ok(Json(OptimizeResponse {
        cycle: latest.cycle,
        scorer,
        result,
    }))
}

async fn reset(State(state): State<WebState>) -> ApiResult<Arc<MarketSnapshot>> {
    let snapshot = state.market.reset().await.map_err(market_err)?;
    Ok(Json(snapshot))
}

async fn pause(State(state): State<WebState>) -> ApiResult<serde_json::Value> {
    state.market.pause().await.map_err(market_err)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn resume(State(state): State<WebState>) -> ApiResult<serde_json::Value> {
    state.market.resume().await.map_err(market_err)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn stream(ws: WebSocketUpgrade, State(state): State<WebState>) -> Response {
    ws.on_upgrade(move |socket| push_events(socket, state.market))
}

/// Pushes the latest snapshot, then every market event, until the client
/// goes away.
async fn push_events(socket: WebSocket, market: MarketHandle) {
    let mut events = market.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let initial = MarketEvent::Snapshot {
        snapshot: market.latest(),
    };
    if send_event(&mut sender, &initial).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if let Err(e) = send_event(&mut sender, &event).await {
                        debug!("WebSocket send failed: {}", e);
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket subscriber lagged; skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("WebSocket subscriber disconnected");
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &MarketEvent) -> Result<()> {
    let json = serde_json::to_string(event)?;
    sender.send(Message::Text(json)).await?;
    Ok(())
}

fn status_for(err: &MarketError) -> StatusCode {
    match err {
        MarketError::UnknownSymbol(_) => StatusCode::NOT_FOUND,
        MarketError::UnknownTimeframe(_)
        | MarketError::InvalidBudget(_)
        | MarketError::InvalidParameter { .. } => StatusCode::BAD_REQUEST,
        MarketError::OptimizerInfeasible { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        MarketError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        MarketError::Superseded | MarketError::Cancelled => StatusCode::CONFLICT,
        MarketError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        MarketError::Io(_) | MarketError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn market_err(err: MarketError) -> (StatusCode, Json<ApiError>) {
    api_err(status_for(&err), err.code(), &err.to_string())
}

fn api_err(status: StatusCode, code: &str, message: &str) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: message.to_string(),
            code: code.to_string(),
        }),
    )
}
