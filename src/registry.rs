use crate::error::{MarketError, MarketResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A tradable instrument and the parameters that drive its simulated path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub name: String,
    pub sector: String,
    pub base_price: f64,
    pub annual_drift: f64,
    pub annual_volatility: f64,
    pub beta: f64,
}

impl Instrument {
    pub fn new(
        symbol: &str,
        name: &str,
        sector: &str,
        base_price: f64,
        annual_drift: f64,
        annual_volatility: f64,
        beta: f64,
    ) -> MarketResult<Self> {
        let instrument = Self {
            symbol: symbol.trim().to_uppercase(),
            name: name.to_string(),
            sector: sector.to_string(),
            base_price,
            annual_drift,
            annual_volatility,
            beta,
        };
        instrument.validate()?;
        Ok(instrument)
    }

    pub fn validate(&self) -> MarketResult<()> {
        if self.symbol.is_empty() {
            return Err(MarketError::invalid_parameter("", "symbol must not be empty"));
        }
        if !self.base_price.is_finite() || self.base_price <= 0.0 {
            return Err(MarketError::invalid_parameter(
                &self.symbol,
                format!("base_price must be > 0, got {}", self.base_price),
            ));
        }
        if !self.annual_volatility.is_finite() || self.annual_volatility < 0.0 {
            return Err(MarketError::invalid_parameter(
                &self.symbol,
                format!("annual_volatility must be >= 0, got {}", self.annual_volatility),
            ));
        }
        if !self.annual_drift.is_finite() || !self.beta.is_finite() {
            return Err(MarketError::invalid_parameter(
                &self.symbol,
                "annual_drift and beta must be finite",
            ));
        }
        Ok(())
    }
}

/// Seeded catalog of instruments, addressable by symbol.
#[derive(Clone, Debug, Default)]
pub struct InstrumentRegistry {
    instruments: Vec<Instrument>,
    by_symbol: HashMap<String, usize>,
}

impl InstrumentRegistry {
    pub fn new(instruments: Vec<Instrument>) -> MarketResult<Self> {
        let mut by_symbol = HashMap::with_capacity(instruments.len());
        for (idx, instrument) in instruments.iter().enumerate() {
            instrument.validate()?;
            let key = instrument.symbol.trim().to_uppercase();
            if by_symbol.insert(key, idx).is_some() {
                return Err(MarketError::invalid_parameter(
                    &instrument.symbol,
                    "duplicate symbol",
                ));
            }
        }
        Ok(Self {
            instruments,
            by_symbol,
        })
    }

    /// The built-in NEPSE-flavoured universe used when nothing else is seeded.
    pub fn default_catalog() -> MarketResult<Self> {
        let seeds: &[(&str, &str, &str, f64, f64, f64, f64)] = &[
            ("NABIL", "Nabil Bank", "Commercial Bank", 850.0, 0.10, 0.22, 1.1),
            ("SCB", "Standard Chartered Bank Nepal", "Commercial Bank", 380.0, 0.06, 0.18, 0.9),
            ("NICA", "NIC Asia Bank", "Commercial Bank", 720.0, 0.08, 0.26, 1.2),
            ("GBIME", "Global IME Bank", "Commercial Bank", 210.0, 0.05, 0.24, 1.0),
            ("EDBL", "Excel Development Bank", "Development Bank", 390.0, 0.07, 0.30, 1.1),
            ("UPPER", "Upper Tamakoshi Hydropower", "Hydropower", 270.0, 0.12, 0.38, 1.4),
            ("CHCL", "Chilime Hydropower", "Hydropower", 480.0, 0.09, 0.32, 1.3),
            ("NLIC", "Nepal Life Insurance", "Life Insurance", 760.0, 0.08, 0.28, 1.0),
            ("SICL", "Shikhar Insurance", "Non-Life Insurance", 620.0, 0.06, 0.27, 0.9),
            ("UNL", "Unilever Nepal", "Manufacturing", 24000.0, 0.04, 0.15, 0.6),
            ("SHL", "Soaltee Hotel", "Hotels & Tourism", 410.0, 0.07, 0.29, 1.2),
            ("NTC", "Nepal Telecom", "Telecom", 890.0, 0.03, 0.12, 0.7),
        ];

        let instruments = seeds
            .iter()
            .map(|&(symbol, name, sector, price, drift, vol, beta)| {
                Instrument::new(symbol, name, sector, price, drift, vol, beta)
            })
            .collect::<MarketResult<Vec<_>>>()?;
        Self::new(instruments)
    }

    pub fn get(&self, symbol: &str) -> MarketResult<&Instrument> {
        self.position(symbol)
            .map(|idx| &self.instruments[idx])
            .ok_or_else(|| MarketError::UnknownSymbol(symbol.to_string()))
    }

    pub fn position(&self, symbol: &str) -> Option<usize> {
        let key = symbol.trim().to_uppercase();
        self.by_symbol.get(&key).copied()
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.instruments
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.instruments.iter().map(|i| i.symbol.as_str())
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_is_valid() {
        let catalog = InstrumentRegistry::default_catalog().unwrap();
        assert_eq!(catalog.len(), 12);
        assert_eq!(catalog.position("unl"), Some(9));
        assert!(catalog.instruments().iter().all(|i| i.validate().is_ok()));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let catalog = InstrumentRegistry::default_catalog().unwrap();
        let nabil = catalog.get("nabil").unwrap();
        assert_eq!(nabil.base_price, 850.0);
        assert!(matches!(
            catalog.get("NOPE"),
            Err(MarketError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let err = Instrument::new("BAD", "Bad", "X", 0.0, 0.1, 0.2, 1.0).unwrap_err();
        assert!(matches!(err, MarketError::InvalidParameter { .. }));

        let err = Instrument::new("BAD", "Bad", "X", 10.0, 0.1, -0.2, 1.0).unwrap_err();
        assert!(matches!(err, MarketError::InvalidParameter { .. }));
    }

    #[test]
    fn test_rejects_duplicate_symbols() {
        let a = Instrument::new("AAA", "A", "X", 10.0, 0.0, 0.1, 1.0).unwrap();
        let result = InstrumentRegistry::new(vec![a.clone(), a]);
        assert!(matches!(result, Err(MarketError::InvalidParameter { .. })));
    }
}
