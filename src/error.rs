/// Errors raised by the market core, grouped by who can fix them.
#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    // ── Seeding ──
    #[error("Invalid instrument parameter for {symbol}: {message}")]
    InvalidParameter { symbol: String, message: String },

    // ── Caller input ──
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Unknown timeframe: {0} (expected one of 1D, 1W, 1M, 3M, 1Y)")]
    UnknownTimeframe(String),

    #[error("Invalid budget: {0}")]
    InvalidBudget(f64),

    // ── Optimizer ──
    #[error("Optimizer infeasible: {reason}")]
    OptimizerInfeasible { reason: String },

    #[error("Optimization exceeded its compute budget of {0} ms")]
    Timeout(u64),

    #[error("Optimization superseded by a newer request")]
    Superseded,

    #[error("Optimization cancelled")]
    Cancelled,

    // ── Collaborators ──
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MarketError {
    pub fn invalid_parameter(symbol: &str, message: impl Into<String>) -> Self {
        MarketError::InvalidParameter {
            symbol: symbol.to_string(),
            message: message.into(),
        }
    }

    pub fn resolution() -> Self {
        MarketError::OptimizerInfeasible {
            reason: "resolution".to_string(),
        }
    }

    /// Stable machine-readable code, used by the HTTP surface.
    pub fn code(&self) -> &'static str {
        match self {
            MarketError::InvalidParameter { .. } => "INVALID_PARAMETER",
            MarketError::UnknownSymbol(_) => "UNKNOWN_SYMBOL",
            MarketError::UnknownTimeframe(_) => "UNKNOWN_TIMEFRAME",
            MarketError::InvalidBudget(_) => "INVALID_BUDGET",
            MarketError::OptimizerInfeasible { .. } => "OPTIMIZER_INFEASIBLE",
            MarketError::Timeout(_) => "TIMEOUT",
            MarketError::Superseded => "SUPERSEDED",
            MarketError::Cancelled => "CANCELLED",
            MarketError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            MarketError::Io(_) => "IO",
            MarketError::Serialization(_) => "SERIALIZATION",
        }
    }
}

pub type MarketResult<T> = Result<T, MarketError>;
