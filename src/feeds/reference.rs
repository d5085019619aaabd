//! Reference-price resolver.
//!
//! Per symbol, keeps the latest observation from every source and resolves
//! one oracle-aligned reference price:
//!
//! 1. primary oracle, if fresh
//! 2. secondary oracle, if fresh
//! 3. median of fresh exchange feeds, if at least two are fresh
//! 4. the last resolution, while it has not aged out
//!
//! The resolved value is kept behind an `ArcSwap` so the hot path (every
//! strategy tick) is a lock-free load.

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};

use super::aggregator::{SourceKind, SourceUpdate};

#[derive(Debug, Clone, Copy)]
pub struct FreshnessConfig {
    pub primary_secs: i64,
    pub secondary_secs: i64,
    pub exchange_secs: i64,
    /// How long a past resolution may serve as fallback.
    pub last_known_secs: i64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            primary_secs: 5,
            secondary_secs: 5,
            exchange_secs: 5,
            last_known_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedSource {
    PrimaryOracle,
    SecondaryOracle,
    ExchangeMedian,
    LastKnown,
}

impl ResolvedSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedSource::PrimaryOracle => "primary_oracle",
            ResolvedSource::SecondaryOracle => "secondary_oracle",
            ResolvedSource::ExchangeMedian => "exchange_median",
            ResolvedSource::LastKnown => "last_known",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResolvedPrice {
    pub price: f64,
    pub source: ResolvedSource,
    pub ts: i64,
}

/// Entries above this oracle/exchange gap are never admitted.
const MAX_DIVERGENCE_BPS: f64 = 50.0;
/// Gap that becomes dangerous once the oracle also lags.
const DANGEROUS_DIVERGENCE_BPS: f64 = 20.0;
const DANGEROUS_ORACLE_AGE_SECS: i64 = 2;

/// Gap between the settlement oracle and the exchange consensus for one
/// symbol. The oracle decides the window outcome, so when the exchanges have
/// moved away from a lagging oracle the apparent edge is an illusion.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OracleDivergence {
    pub oracle_price: f64,
    pub exchange_price: f64,
    pub divergence_bps: f64,
    pub oracle_age_secs: i64,
    pub is_stale: bool,
    /// Meaningful gap on top of a lagging oracle: the regime where outcomes
    /// flip at settlement.
    pub is_dangerous_regime: bool,
}

impl OracleDivergence {
    /// Whether strategy admission should refuse new entries for this symbol.
    pub fn should_skip_trade(&self) -> bool {
        self.is_stale
            || self.divergence_bps.abs() > MAX_DIVERGENCE_BPS
            || self.is_dangerous_regime
    }
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    kind: SourceKind,
    price: f64,
    ts: i64,
}

struct SymbolState {
    /// source name -> latest observation
    sources: RwLock<HashMap<&'static str, Observation>>,
    resolved: ArcSwap<Option<ResolvedPrice>>,
}

pub struct ReferencePriceResolver {
    config: FreshnessConfig,
    symbols: RwLock<HashMap<String, Arc<SymbolState>>>,
}

impl ReferencePriceResolver {
    pub fn new(config: FreshnessConfig) -> Self {
        Self {
            config,
            symbols: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, update: &SourceUpdate) {
        let state = self.state_for(&update.symbol);
        state.sources.write().insert(
            update.source,
            Observation {
                kind: update.kind,
                price: update.price,
                ts: update.ts,
            },
        );
        self.recompute(&state, update.ts);
    }

    /// Lock-free read of the latest resolution, freshness-checked against
    /// `now`.
    pub fn resolve(&self, symbol: &str, now: i64) -> Option<ResolvedPrice> {
        let state = {
            let symbols = self.symbols.read();
            symbols.get(symbol)?.clone()
        };
        let resolved = (**state.resolved.load()).as_ref().copied()?;
        if now - resolved.ts > self.config.last_known_secs {
            return None;
        }
        Some(resolved)
    }

    /// Freshest oracle price (primary outranks secondary), for window
    /// outcome comparison.
    pub fn fresh_oracle_price(&self, symbol: &str, now: i64) -> Option<f64> {
        let state = {
            let symbols = self.symbols.read();
            symbols.get(symbol)?.clone()
        };
        let sources = state.sources.read();
        let pick = |kind: SourceKind| {
            sources
                .values()
                .filter(|obs| obs.kind == kind && self.is_fresh(obs, now))
                .max_by_key(|obs| obs.ts)
                .map(|obs| obs.price)
        };
        pick(SourceKind::PrimaryOracle).or_else(|| pick(SourceKind::SecondaryOracle))
    }

    /// Median of the fresh exchange feeds, without the two-source minimum
    /// the reference resolution requires.
    pub fn fresh_exchange_median(&self, symbol: &str, now: i64) -> Option<f64> {
        let state = {
            let symbols = self.symbols.read();
            symbols.get(symbol)?.clone()
        };
        let sources = state.sources.read();
        let mut prices: Vec<f64> = sources
            .values()
            .filter(|obs| obs.kind == SourceKind::Exchange && self.is_fresh(obs, now))
            .map(|obs| obs.price)
            .collect();
        if prices.is_empty() {
            return None;
        }
        prices.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = prices.len() / 2;
        Some(if prices.len() % 2 == 0 {
            (prices[mid - 1] + prices[mid]) * 0.5
        } else {
            prices[mid]
        })
    }

    /// Oracle-vs-exchange gap analysis, consumed at strategy admission.
    /// None when either side has never reported; a silent oracle with a
    /// last-known observation still gets an age and a staleness flag.
    pub fn oracle_divergence(&self, symbol: &str, now: i64) -> Option<OracleDivergence> {
        let state = {
            let symbols = self.symbols.read();
            symbols.get(symbol)?.clone()
        };
        let oracle = {
            let sources = state.sources.read();
            let pick = |kind: SourceKind| {
                sources
                    .values()
                    .filter(|obs| obs.kind == kind)
                    .max_by_key(|obs| obs.ts)
                    .copied()
            };
            pick(SourceKind::PrimaryOracle).or_else(|| pick(SourceKind::SecondaryOracle))?
        };
        let exchange_price = self.fresh_exchange_median(symbol, now)?;

        let divergence_bps = ((exchange_price - oracle.price) / oracle.price) * 10_000.0;
        let oracle_age_secs = now - oracle.ts;
        let is_stale = oracle_age_secs > self.config.primary_secs;
        let is_dangerous_regime = divergence_bps.abs() > DANGEROUS_DIVERGENCE_BPS
            && oracle_age_secs > DANGEROUS_ORACLE_AGE_SECS;

        Some(OracleDivergence {
            oracle_price: oracle.price,
            exchange_price,
            divergence_bps,
            oracle_age_secs,
            is_stale,
            is_dangerous_regime,
        })
    }

    /// Spread (max - min) across all fresh sources, for feed-health
    /// monitoring.
    pub fn source_spread(&self, symbol: &str, now: i64) -> Option<f64> {
        let state = {
            let symbols = self.symbols.read();
            symbols.get(symbol)?.clone()
        };
        let sources = state.sources.read();
        let fresh: Vec<f64> = sources
            .values()
            .filter(|obs| self.is_fresh(obs, now))
            .map(|obs| obs.price)
            .collect();
        if fresh.len() < 2 {
            return None;
        }
        let max = fresh.iter().cloned().fold(f64::MIN, f64::max);
        let min = fresh.iter().cloned().fold(f64::MAX, f64::min);
        Some(max - min)
    }

    pub fn tracked_symbols(&self) -> Vec<String> {
        self.symbols.read().keys().cloned().collect()
    }

    fn state_for(&self, symbol: &str) -> Arc<SymbolState> {
        {
            let symbols = self.symbols.read();
            if let Some(st) = symbols.get(symbol) {
                return st.clone();
            }
        }
        let mut symbols = self.symbols.write();
        symbols
            .entry(symbol.to_string())
            .or_insert_with(|| {
                Arc::new(SymbolState {
                    sources: RwLock::new(HashMap::new()),
                    resolved: ArcSwap::new(Arc::new(None)),
                })
            })
            .clone()
    }

    fn is_fresh(&self, obs: &Observation, now: i64) -> bool {
        let threshold = match obs.kind {
            SourceKind::PrimaryOracle => self.config.primary_secs,
            SourceKind::SecondaryOracle => self.config.secondary_secs,
            SourceKind::Exchange => self.config.exchange_secs,
        };
        now - obs.ts <= threshold
    }

    fn recompute(&self, state: &SymbolState, now: i64) {
        let mut primary: Option<Observation> = None;
        let mut secondary: Option<Observation> = None;
        let mut exchanges: Vec<Observation> = Vec::new();

        {
            let sources = state.sources.read();
            for obs in sources.values() {
                if !self.is_fresh(obs, now) {
                    continue;
                }
                match obs.kind {
                    SourceKind::PrimaryOracle => {
                        if primary.map(|p| obs.ts > p.ts).unwrap_or(true) {
                            primary = Some(*obs);
                        }
                    }
                    SourceKind::SecondaryOracle => {
                        if secondary.map(|p| obs.ts > p.ts).unwrap_or(true) {
                            secondary = Some(*obs);
                        }
                    }
                    SourceKind::Exchange => exchanges.push(*obs),
                }
            }
        }

        let next = if let Some(p) = primary {
            Some(ResolvedPrice {
                price: p.price,
                source: ResolvedSource::PrimaryOracle,
                ts: p.ts,
            })
        } else if let Some(s) = secondary {
            Some(ResolvedPrice {
                price: s.price,
                source: ResolvedSource::SecondaryOracle,
                ts: s.ts,
            })
        } else if exchanges.len() >= 2 {
            let mut prices: Vec<f64> = exchanges.iter().map(|o| o.price).collect();
            prices.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = prices.len() / 2;
            let median = if prices.len() % 2 == 0 {
                (prices[mid - 1] + prices[mid]) * 0.5
            } else {
                prices[mid]
            };
            let ts = exchanges.iter().map(|o| o.ts).max().unwrap_or(now);
            Some(ResolvedPrice {
                price: median,
                source: ResolvedSource::ExchangeMedian,
                ts,
            })
        } else {
            // keep the previous resolution, demoted to last-known
            (**state.resolved.load()).as_ref().and_then(|prev| {
                if now - prev.ts <= self.config.last_known_secs {
                    Some(ResolvedPrice {
                        source: ResolvedSource::LastKnown,
                        ..*prev
                    })
                } else {
                    None
                }
            })
        };

        state.resolved.store(Arc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(
        source: &'static str,
        kind: SourceKind,
        symbol: &str,
        price: f64,
        ts: i64,
    ) -> SourceUpdate {
        SourceUpdate {
            source,
            kind,
            symbol: symbol.to_string(),
            price,
            ts,
        }
    }

    fn resolver() -> ReferencePriceResolver {
        ReferencePriceResolver::new(FreshnessConfig::default())
    }

    #[test]
    fn primary_outranks_everything_while_fresh() {
        let r = resolver();
        let now = 1_000_000;
        r.record(&update("binance", SourceKind::Exchange, "BTCUSDT", 50_100.0, now));
        r.record(&update("kraken", SourceKind::Exchange, "BTCUSDT", 50_200.0, now));
        r.record(&update("oracle_secondary", SourceKind::SecondaryOracle, "BTCUSDT", 50_050.0, now));
        r.record(&update("oracle_primary", SourceKind::PrimaryOracle, "BTCUSDT", 50_000.0, now));

        let resolved = r.resolve("BTCUSDT", now).unwrap();
        assert_eq!(resolved.source, ResolvedSource::PrimaryOracle);
        assert!((resolved.price - 50_000.0).abs() < 1e-9);
    }

    #[test]
    fn stale_primary_falls_back_to_secondary() {
        let r = resolver();
        let now = 1_000_000;
        r.record(&update("oracle_primary", SourceKind::PrimaryOracle, "BTCUSDT", 50_000.0, now - 10));
        r.record(&update("oracle_secondary", SourceKind::SecondaryOracle, "BTCUSDT", 50_050.0, now));

        let resolved = r.resolve("BTCUSDT", now).unwrap();
        assert_eq!(resolved.source, ResolvedSource::SecondaryOracle);
    }

    #[test]
    fn exchange_median_needs_two_fresh_feeds() {
        let r = resolver();
        let now = 1_000_000;
        r.record(&update("binance", SourceKind::Exchange, "BTCUSDT", 50_100.0, now));
        // one exchange is not enough; previous resolution also absent
        assert!(r.resolve("BTCUSDT", now).is_none());

        r.record(&update("kraken", SourceKind::Exchange, "BTCUSDT", 50_300.0, now));
        let resolved = r.resolve("BTCUSDT", now).unwrap();
        assert_eq!(resolved.source, ResolvedSource::ExchangeMedian);
        assert!((resolved.price - 50_200.0).abs() < 1e-9);
    }

    #[test]
    fn odd_exchange_count_takes_middle_value() {
        let r = resolver();
        let now = 1_000_000;
        r.record(&update("binance", SourceKind::Exchange, "BTCUSDT", 50_100.0, now));
        r.record(&update("kraken", SourceKind::Exchange, "BTCUSDT", 50_400.0, now));
        r.record(&update("coinbase", SourceKind::Exchange, "BTCUSDT", 50_200.0, now));

        let resolved = r.resolve("BTCUSDT", now).unwrap();
        assert!((resolved.price - 50_200.0).abs() < 1e-9);
    }

    #[test]
    fn last_known_survives_within_age_limit() {
        let r = resolver();
        let t0 = 1_000_000;
        r.record(&update("oracle_primary", SourceKind::PrimaryOracle, "BTCUSDT", 50_000.0, t0));

        // all sources go stale; a later record triggers recompute
        let t1 = t0 + 20;
        r.record(&update("binance", SourceKind::Exchange, "BTCUSDT", 50_100.0, t1 - 8));

        let resolved = r.resolve("BTCUSDT", t1).unwrap();
        assert_eq!(resolved.source, ResolvedSource::LastKnown);
        assert!((resolved.price - 50_000.0).abs() < 1e-9);

        // and ages out entirely
        assert!(r.resolve("BTCUSDT", t0 + 600).is_none());
    }

    #[test]
    fn divergence_agreement_is_tradable() {
        let r = resolver();
        let now = 1_000_000;
        r.record(&update("oracle_primary", SourceKind::PrimaryOracle, "BTCUSDT", 50_000.0, now));
        r.record(&update("binance", SourceKind::Exchange, "BTCUSDT", 50_010.0, now));

        let d = r.oracle_divergence("BTCUSDT", now).unwrap();
        // 10 / 50_000 = 2 bps
        assert!((d.divergence_bps - 2.0).abs() < 1e-9);
        assert!(!d.is_stale);
        assert!(!d.is_dangerous_regime);
        assert!(!d.should_skip_trade());
    }

    #[test]
    fn stale_oracle_blocks_trading() {
        let r = resolver();
        let now = 1_000_000;
        r.record(&update("oracle_primary", SourceKind::PrimaryOracle, "BTCUSDT", 50_000.0, now - 10));
        r.record(&update("binance", SourceKind::Exchange, "BTCUSDT", 50_010.0, now));

        let d = r.oracle_divergence("BTCUSDT", now).unwrap();
        assert!(d.is_stale);
        assert!(d.should_skip_trade());
    }

    #[test]
    fn wide_divergence_blocks_trading() {
        let r = resolver();
        let now = 1_000_000;
        r.record(&update("oracle_primary", SourceKind::PrimaryOracle, "BTCUSDT", 50_000.0, now));
        // 300 / 50_000 = 60 bps, over the hard limit
        r.record(&update("binance", SourceKind::Exchange, "BTCUSDT", 50_300.0, now));

        let d = r.oracle_divergence("BTCUSDT", now).unwrap();
        assert!(d.divergence_bps > 50.0);
        assert!(d.should_skip_trade());
    }

    #[test]
    fn dangerous_regime_needs_gap_and_lag() {
        let r = resolver();
        let now = 1_000_000;
        // 30 bps gap with a 3s-old oracle: inside the hard limit but lagging
        r.record(&update("oracle_primary", SourceKind::PrimaryOracle, "BTCUSDT", 50_000.0, now - 3));
        r.record(&update("binance", SourceKind::Exchange, "BTCUSDT", 50_150.0, now));

        let d = r.oracle_divergence("BTCUSDT", now).unwrap();
        assert!(!d.is_stale);
        assert!(d.is_dangerous_regime);
        assert!(d.should_skip_trade());

        // same gap with a fresh oracle is fine
        r.record(&update("oracle_primary", SourceKind::PrimaryOracle, "BTCUSDT", 50_000.0, now));
        let d = r.oracle_divergence("BTCUSDT", now).unwrap();
        assert!(!d.is_dangerous_regime);
        assert!(!d.should_skip_trade());
    }

    #[test]
    fn divergence_absent_without_both_sides() {
        let r = resolver();
        let now = 1_000_000;
        r.record(&update("oracle_primary", SourceKind::PrimaryOracle, "BTCUSDT", 50_000.0, now));
        assert!(r.oracle_divergence("BTCUSDT", now).is_none());
        assert!(r.oracle_divergence("ETHUSDT", now).is_none());
    }

    #[test]
    fn per_kind_reads_for_window_agreement() {
        let r = resolver();
        let now = 1_000_000;
        r.record(&update("oracle_primary", SourceKind::PrimaryOracle, "BTCUSDT", 50_000.0, now));
        r.record(&update("binance", SourceKind::Exchange, "BTCUSDT", 50_100.0, now));
        r.record(&update("kraken", SourceKind::Exchange, "BTCUSDT", 50_300.0, now));

        assert_eq!(r.fresh_oracle_price("BTCUSDT", now), Some(50_000.0));
        assert_eq!(r.fresh_exchange_median("BTCUSDT", now), Some(50_200.0));
        // a single exchange feed is still a median here
        r.record(&update("binance", SourceKind::Exchange, "ETHUSDT", 3_000.0, now));
        assert_eq!(r.fresh_exchange_median("ETHUSDT", now), Some(3_000.0));
        // stale oracle drops out of the fresh read
        assert!(r.fresh_oracle_price("BTCUSDT", now + 20).is_none());
    }

    #[test]
    fn spread_across_fresh_sources() {
        let r = resolver();
        let now = 1_000_000;
        r.record(&update("binance", SourceKind::Exchange, "BTCUSDT", 50_100.0, now));
        r.record(&update("kraken", SourceKind::Exchange, "BTCUSDT", 50_300.0, now));
        r.record(&update("oracle_primary", SourceKind::PrimaryOracle, "BTCUSDT", 50_000.0, now));

        let spread = r.source_spread("BTCUSDT", now).unwrap();
        assert!((spread - 300.0).abs() < 1e-9);
    }
}
