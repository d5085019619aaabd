//! Strategy runner and the built-in drift strategy.
//!
//! Strategies are synchronous tick consumers: they see normalized `Tick`s in
//! arrival order for each symbol and may emit one entry intent per tick. The
//! runner owns tick composition (reference price + book + window clock),
//! admission control, and dispatch into the order manager. Strategies never
//! see the exchange.

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use statrs::distribution::{ContinuousCDF, Normal};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::controls::{ControlPanel, Controls};
use crate::engine::order_manager::OrderManager;
use crate::engine::positions::{OppositeDecision, PositionManager};
use crate::errors::ExecError;
use crate::exchange::ExchangeApi;
use crate::feeds::{OracleDivergence, ReferencePriceResolver};
use crate::models::{
    BestPrices, BookSnapshot, Direction, OrderType, Side, SignalContext, Tick, TradeSignal,
};
use crate::store::TradeStore;
use crate::window::{epoch_for, window_id, WindowManager};

// ============================================================================
// Strategy capability
// ============================================================================

/// An entry request from a strategy; the runner turns it into a full
/// `TradeSignal` with token and market plumbing attached.
#[derive(Debug, Clone)]
pub struct EntryIntent {
    pub direction: Direction,
    pub stake_usd: f64,
    /// Limit price for the outcome token; None takes the book ask.
    pub limit_price: Option<f64>,
    pub model_prob: f64,
    pub edge: f64,
}

pub trait Strategy: Send + Sync {
    fn id(&self) -> &'static str;
    fn on_tick(&mut self, tick: &Tick) -> Option<EntryIntent>;
}

// ============================================================================
// Instruments
// ============================================================================

/// One tradable 15-minute up/down market.
#[derive(Debug, Clone)]
pub struct InstrumentSpec {
    pub symbol: String,
    pub market_id: String,
    pub up_token_id: String,
    pub down_token_id: String,
}

impl InstrumentSpec {
    /// Parse `SYMBOL:market:upToken:downToken` entries from a comma list.
    pub fn parse_list(raw: &str) -> Vec<InstrumentSpec> {
        raw.split(',')
            .filter_map(|entry| {
                let parts: Vec<&str> = entry.trim().split(':').collect();
                if parts.len() != 4 || parts.iter().any(|p| p.trim().is_empty()) {
                    if !entry.trim().is_empty() {
                        warn!(entry = %entry, "skipping malformed instrument spec");
                    }
                    return None;
                }
                Some(InstrumentSpec {
                    symbol: parts[0].trim().to_ascii_uppercase(),
                    market_id: parts[1].trim().to_string(),
                    up_token_id: parts[2].trim().to_string(),
                    down_token_id: parts[3].trim().to_string(),
                })
            })
            .collect()
    }

    pub fn from_env() -> Vec<InstrumentSpec> {
        std::env::var("INSTRUMENTS")
            .map(|v| Self::parse_list(&v))
            .unwrap_or_default()
    }
}

// ============================================================================
// Book cache
// ============================================================================

/// Short-TTL read-through cache over `get_best_prices`, so tick composition
/// does not hammer the venue book endpoint.
pub struct BookCache {
    exchange: Arc<dyn ExchangeApi>,
    ttl: Duration,
    inner: Mutex<HashMap<String, (BestPrices, Instant)>>,
}

impl BookCache {
    pub fn new(exchange: Arc<dyn ExchangeApi>, ttl: Duration) -> Self {
        Self {
            exchange,
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn best(&self, token_id: &str) -> Option<BestPrices> {
        {
            let inner = self.inner.lock();
            if let Some((prices, at)) = inner.get(token_id) {
                if at.elapsed() <= self.ttl {
                    return Some(*prices);
                }
            }
        }
        match self.exchange.get_best_prices(token_id).await {
            Ok(prices) => {
                self.inner
                    .lock()
                    .insert(token_id.to_string(), (prices, Instant::now()));
                Some(prices)
            }
            Err(e) => {
                debug!(token_id, error = %e, "book fetch failed");
                None
            }
        }
    }
}

// ============================================================================
// Built-in drift strategy
// ============================================================================

/// EWMA variance of per-second log returns; sigma is per sqrt-second.
#[derive(Debug, Clone, Default)]
struct EwmaVol {
    lambda: f64,
    var: Option<f64>,
    last_price: Option<f64>,
    last_ts: Option<i64>,
}

impl EwmaVol {
    fn new(lambda: f64) -> Self {
        Self {
            lambda,
            ..Default::default()
        }
    }

    fn record(&mut self, price: f64, ts: i64) {
        if let (Some(prev), Some(prev_ts)) = (self.last_price, self.last_ts) {
            let dt = (ts - prev_ts).max(1) as f64;
            if prev > 0.0 && price > 0.0 && ts > prev_ts {
                let r = (price / prev).ln() / dt;
                let obs = r * r;
                let next = match self.var {
                    Some(v) => self.lambda * v + (1.0 - self.lambda) * obs,
                    None => obs,
                };
                if next.is_finite() {
                    self.var = Some(next);
                }
            }
        }
        self.last_price = Some(price);
        self.last_ts = Some(ts);
    }

    fn sigma_per_sqrt_s(&self) -> Option<f64> {
        self.var.filter(|v| v.is_finite() && *v > 0.0).map(f64::sqrt)
    }
}

/// P(final >= start) for a driftless lognormal walk with the given
/// per-sqrt-second sigma and remaining seconds.
pub fn p_up_driftless(p_start: f64, p_now: f64, sigma: f64, t_rem_sec: f64) -> Option<f64> {
    if !(p_start > 0.0 && p_now > 0.0) {
        return None;
    }
    if !(sigma.is_finite() && sigma > 0.0) || !(t_rem_sec.is_finite() && t_rem_sec > 0.0) {
        return None;
    }
    let denom = sigma * t_rem_sec.sqrt();
    if !(denom.is_finite() && denom > 0.0) {
        return None;
    }
    let z = (p_now / p_start).ln() / denom;
    let n = Normal::new(0.0, 1.0).ok()?;
    let p = n.cdf(z);
    p.is_finite().then(|| p.clamp(0.0001, 0.9999))
}

/// Pull a probability toward 0.5; raw model output overstates certainty on
/// short windows.
pub fn shrink_to_half(p: f64, shrink: f64) -> f64 {
    let s = shrink.clamp(0.0, 1.0);
    (0.5 + s * (p - 0.5)).clamp(0.0001, 0.9999)
}

#[derive(Debug, Clone)]
pub struct DriftStrategyConfig {
    pub min_edge: f64,
    pub stake_usd: f64,
    pub shrink: f64,
    pub cooldown_secs: i64,
    /// Skip entries this close to the window end.
    pub window_end_skip_secs: i64,
    pub ewma_lambda: f64,
}

impl Default for DriftStrategyConfig {
    fn default() -> Self {
        Self {
            min_edge: 0.05,
            stake_usd: 3.0,
            shrink: 0.35,
            cooldown_secs: 30,
            window_end_skip_secs: 90,
            ewma_lambda: 0.97,
        }
    }
}

impl DriftStrategyConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        let read = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<f64>().ok());
        if let Some(v) = read("DRIFT_MIN_EDGE").filter(|v| *v > 0.0 && *v < 0.5) {
            cfg.min_edge = v;
        }
        if let Some(v) = read("DRIFT_STAKE_USD").filter(|v| *v > 0.0) {
            cfg.stake_usd = v;
        }
        if let Some(v) = read("DRIFT_SHRINK").filter(|v| (0.0..=1.0).contains(v)) {
            cfg.shrink = v;
        }
        if let Some(v) = read("DRIFT_COOLDOWN_SECS").filter(|v| *v >= 0.0) {
            cfg.cooldown_secs = v as i64;
        }
        if let Some(v) = read("DRIFT_WINDOW_END_SKIP_SECS").filter(|v| *v >= 0.0) {
            cfg.window_end_skip_secs = v as i64;
        }
        cfg
    }
}

#[derive(Debug, Default)]
struct DriftSymbolState {
    epoch: i64,
    start_spot: Option<f64>,
    vol: EwmaVol,
    last_signal_ts: i64,
}

/// Sample strategy: driftless-lognormal probability of UP vs the implied
/// book price, entering whichever side shows enough edge.
pub struct DriftStrategy {
    config: DriftStrategyConfig,
    symbols: HashMap<String, DriftSymbolState>,
}

impl DriftStrategy {
    pub fn new(config: DriftStrategyConfig) -> Self {
        Self {
            config,
            symbols: HashMap::new(),
        }
    }
}

impl Strategy for DriftStrategy {
    fn id(&self) -> &'static str {
        "drift"
    }

    fn on_tick(&mut self, tick: &Tick) -> Option<EntryIntent> {
        let lambda = self.config.ewma_lambda;
        let st = self
            .symbols
            .entry(tick.symbol.clone())
            .or_insert_with(|| DriftSymbolState {
                vol: EwmaVol::new(lambda),
                ..Default::default()
            });

        let epoch = epoch_for(tick.ts);
        if st.epoch != epoch {
            st.epoch = epoch;
            st.start_spot = Some(tick.spot);
        }
        st.vol.record(tick.spot, tick.ts);

        if tick.secs_remaining < self.config.window_end_skip_secs {
            return None;
        }
        if tick.ts - st.last_signal_ts < self.config.cooldown_secs {
            return None;
        }

        let start = st.start_spot?;
        let sigma = st.vol.sigma_per_sqrt_s()?;
        let p_up = p_up_driftless(start, tick.spot, sigma, tick.secs_remaining as f64)?;
        let p_up = shrink_to_half(p_up, self.config.shrink);

        let up_ask = tick.book.up.ask;
        let down_ask = tick.book.down.ask;

        let mut best: Option<EntryIntent> = None;
        if up_ask > 0.0 {
            let edge = p_up - up_ask;
            if edge >= self.config.min_edge {
                best = Some(EntryIntent {
                    direction: Direction::Up,
                    stake_usd: self.config.stake_usd,
                    limit_price: Some(up_ask),
                    model_prob: p_up,
                    edge,
                });
            }
        }
        if down_ask > 0.0 {
            let edge = (1.0 - p_up) - down_ask;
            if edge >= self.config.min_edge
                && best.as_ref().map(|b| edge > b.edge).unwrap_or(true)
            {
                best = Some(EntryIntent {
                    direction: Direction::Down,
                    stake_usd: self.config.stake_usd,
                    limit_price: Some(down_ask),
                    model_prob: 1.0 - p_up,
                    edge,
                });
            }
        }

        if best.is_some() {
            st.last_signal_ts = tick.ts;
        }
        best
    }
}

// ============================================================================
// Runner
// ============================================================================

#[derive(Debug, Clone)]
pub struct StrategyRunnerConfig {
    pub poll_interval: Duration,
    pub book_ttl: Duration,
}

impl Default for StrategyRunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            book_ttl: Duration::from_millis(1500),
        }
    }
}

pub struct StrategyRunner {
    instruments: Vec<InstrumentSpec>,
    strategies: Vec<Box<dyn Strategy>>,
    resolver: Arc<ReferencePriceResolver>,
    windows: Arc<WindowManager>,
    orders: Arc<OrderManager>,
    positions: Arc<PositionManager>,
    controls: Arc<ControlPanel>,
    books: BookCache,
    store: TradeStore,
    config: StrategyRunnerConfig,
}

impl StrategyRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instruments: Vec<InstrumentSpec>,
        strategies: Vec<Box<dyn Strategy>>,
        resolver: Arc<ReferencePriceResolver>,
        windows: Arc<WindowManager>,
        orders: Arc<OrderManager>,
        positions: Arc<PositionManager>,
        controls: Arc<ControlPanel>,
        exchange: Arc<dyn ExchangeApi>,
        store: TradeStore,
        config: StrategyRunnerConfig,
    ) -> Self {
        let books = BookCache::new(exchange, config.book_ttl);
        Self {
            instruments,
            strategies,
            resolver,
            windows,
            orders,
            positions,
            controls,
            books,
            store,
            config,
        }
    }

    /// Admission gate applied to every strategy signal before dispatch.
    /// `divergence` is the symbol's current oracle-vs-exchange analysis;
    /// None (either side never reported) does not block.
    pub fn admit(
        controls: &Controls,
        strategy_id: &str,
        symbol: &str,
        divergence: Option<&OracleDivergence>,
    ) -> Result<(), &'static str> {
        if controls.kill_switch.blocks_new_orders() {
            return Err("kill_switch");
        }
        if !controls.strategy_allowed(strategy_id) {
            return Err("strategy_disabled");
        }
        if !controls.instrument_allowed(symbol) {
            return Err("instrument_not_allowed");
        }
        if divergence.map(|d| d.should_skip_trade()).unwrap_or(false) {
            return Err("oracle_divergence");
        }
        Ok(())
    }

    async fn compose_tick(&self, inst: &InstrumentSpec, now: i64) -> Option<Tick> {
        let resolved = self.resolver.resolve(&inst.symbol, now)?;

        // the first tick of a fresh window locks the strike
        if let Err(e) = self.windows.maybe_freeze_strike(&inst.symbol, now).await {
            warn!(symbol = %inst.symbol, error = %e, "strike freeze failed");
        }
        let snap = self.windows.current_window(&inst.symbol)?;

        let up = self.books.best(&inst.up_token_id).await.unwrap_or_default();
        let down = self
            .books
            .best(&inst.down_token_id)
            .await
            .unwrap_or_default();

        let book = BookSnapshot {
            ts: now,
            up,
            down,
            up_bid_size: 0.0,
            up_ask_size: 0.0,
            down_bid_size: 0.0,
            down_ask_size: 0.0,
        };
        let implied_up = (up.mid > 0.0).then_some(up.mid);

        Some(Tick {
            ts: now,
            symbol: inst.symbol.clone(),
            spot: resolved.price,
            book,
            implied_up,
            secs_remaining: (snap.close_ts - now).max(0),
        })
    }

    fn build_signal(inst: &InstrumentSpec, epoch: i64, intent: &EntryIntent) -> TradeSignal {
        let token_id = match intent.direction {
            Direction::Up => inst.up_token_id.clone(),
            Direction::Down => inst.down_token_id.clone(),
        };
        TradeSignal {
            token_id,
            side: Side::Buy,
            size: intent.stake_usd,
            limit_price: intent.limit_price,
            order_type: OrderType::Ioc,
            window_id: window_id(&inst.symbol, epoch),
            market_id: inst.market_id.clone(),
            context: SignalContext {
                symbol: Some(inst.symbol.clone()),
                strategy_id: None, // filled by the runner per strategy
                model_prob: Some(intent.model_prob),
                edge: Some(intent.edge),
                token_side: Some(intent.direction.as_str().to_string()),
            },
        }
    }

    async fn dispatch(
        &self,
        inst: &InstrumentSpec,
        strategy_id: &'static str,
        tick: &Tick,
        intent: EntryIntent,
    ) {
        let controls = self.controls.snapshot();
        let divergence = self.resolver.oracle_divergence(&inst.symbol, tick.ts);
        if let Err(reason) = Self::admit(&controls, strategy_id, &inst.symbol, divergence.as_ref())
        {
            if reason == "oracle_divergence" {
                if let Some(d) = divergence {
                    warn!(
                        symbol = %inst.symbol,
                        divergence_bps = d.divergence_bps,
                        oracle_age_secs = d.oracle_age_secs,
                        stale = d.is_stale,
                        "signal rejected: settlement oracle cannot be trusted"
                    );
                }
            } else {
                debug!(strategy_id, symbol = %inst.symbol, reason, "signal rejected at admission");
            }
            return;
        }

        let epoch = epoch_for(tick.ts);

        // opposite-side resolution before dispatch
        let opposite_bid = match intent.direction {
            Direction::Up => tick.book.down.bid,
            Direction::Down => tick.book.up.bid,
        };
        match self
            .positions
            .check_opposite(
                &inst.symbol,
                epoch,
                intent.direction,
                (opposite_bid > 0.0).then_some(opposite_bid),
            )
            .await
        {
            Ok(OppositeDecision::Allow) => {}
            Ok(OppositeDecision::CloseFirst(pos)) => {
                info!(symbol = %inst.symbol, "closing profitable opposite position before reversal");
                if let Err(e) = self
                    .positions
                    .close_for_reversal(&pos, opposite_bid.clamp(0.01, 0.99))
                    .await
                {
                    warn!(error = %e, "reversal close failed; dropping signal");
                    return;
                }
            }
            Ok(OppositeDecision::Block { reason }) => {
                info!(symbol = %inst.symbol, reason, "signal blocked by opposite position");
                return;
            }
            Err(e) => {
                warn!(error = %e, "opposite check failed; dropping signal");
                return;
            }
        }

        let mut signal = Self::build_signal(inst, epoch, &intent);
        signal.context.strategy_id = Some(strategy_id.to_string());
        signal.size = signal.size.min(controls.max_position_usd);

        match self.orders.execute(&signal, controls.trading_mode).await {
            Ok(result) => {
                info!(
                    strategy_id,
                    symbol = %inst.symbol,
                    order_id = %result.order_id,
                    status = %result.status,
                    edge = intent.edge,
                    "signal executed"
                );
            }
            Err(ExecError::Busy) => {
                debug!(strategy_id, "order manager busy; strategy may retry next tick");
            }
            Err(e) => {
                if e.is_fatal() {
                    self.controls
                        .escalate(crate::models::KillSwitch::Flatten, "fatal execution error");
                }
                warn!(strategy_id, code = e.code(), error = %e, "signal execution failed");
            }
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick_timer = interval(self.config.poll_interval);
        tick_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            instruments = self.instruments.len(),
            strategies = self.strategies.len(),
            "strategy runner started"
        );

        loop {
            tokio::select! {
                _ = tick_timer.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("strategy runner shutting down");
                        return;
                    }
                }
            }

            let now = Utc::now().timestamp();
            let instruments = self.instruments.clone();
            for inst in &instruments {
                let Some(tick) = self.compose_tick(inst, now).await else {
                    continue;
                };

                if let Err(e) = self
                    .store
                    .insert_tick(
                        tick.ts,
                        &tick.symbol,
                        tick.spot,
                        tick.implied_up,
                        tick.secs_remaining,
                    )
                    .await
                {
                    debug!(error = %e, "tick persist failed");
                }

                // stop monitoring runs off the same tick
                if tick.book.up.bid > 0.0 {
                    let _ = self
                        .positions
                        .on_price(&inst.up_token_id, tick.book.up.bid, now)
                        .await;
                }
                if tick.book.down.bid > 0.0 {
                    let _ = self
                        .positions
                        .on_price(&inst.down_token_id, tick.book.down.bid, now)
                        .await;
                }

                let intents: Vec<(&'static str, EntryIntent)> = self
                    .strategies
                    .iter_mut()
                    .filter_map(|s| {
                        let id = s.id();
                        s.on_tick(&tick).map(|intent| (id, intent))
                    })
                    .collect();
                for (strategy_id, intent) in intents {
                    self.dispatch(inst, strategy_id, &tick, intent).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KillSwitch;

    #[test]
    fn instrument_spec_parsing() {
        let specs = InstrumentSpec::parse_list(
            "BTCUSDT:mkt-1:tok-up:tok-down, ethusdt:mkt-2:eup:edown,,bad:entry",
        );
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].symbol, "BTCUSDT");
        assert_eq!(specs[1].symbol, "ETHUSDT");
        assert_eq!(specs[1].up_token_id, "eup");
    }

    #[test]
    fn admission_gates() {
        let mut controls = Controls::default();
        assert!(StrategyRunner::admit(&controls, "drift", "BTCUSDT", None).is_ok());

        controls.kill_switch = KillSwitch::Pause;
        assert_eq!(
            StrategyRunner::admit(&controls, "drift", "BTCUSDT", None).unwrap_err(),
            "kill_switch"
        );

        controls.kill_switch = KillSwitch::Off;
        controls.allowed_strategies = "other".to_string();
        assert_eq!(
            StrategyRunner::admit(&controls, "drift", "BTCUSDT", None).unwrap_err(),
            "strategy_disabled"
        );

        controls.allowed_strategies = "*".to_string();
        controls.allowed_instruments = "ETHUSDT".to_string();
        assert_eq!(
            StrategyRunner::admit(&controls, "drift", "BTCUSDT", None).unwrap_err(),
            "instrument_not_allowed"
        );
    }

    #[test]
    fn admission_blocks_on_oracle_divergence() {
        let controls = Controls::default();
        let healthy = OracleDivergence {
            oracle_price: 50_000.0,
            exchange_price: 50_010.0,
            divergence_bps: 2.0,
            oracle_age_secs: 1,
            is_stale: false,
            is_dangerous_regime: false,
        };
        assert!(StrategyRunner::admit(&controls, "drift", "BTCUSDT", Some(&healthy)).is_ok());

        let lagging = OracleDivergence {
            oracle_price: 50_000.0,
            exchange_price: 50_150.0,
            divergence_bps: 30.0,
            oracle_age_secs: 3,
            is_stale: false,
            is_dangerous_regime: true,
        };
        assert_eq!(
            StrategyRunner::admit(&controls, "drift", "BTCUSDT", Some(&lagging)).unwrap_err(),
            "oracle_divergence"
        );
    }

    #[test]
    fn p_up_is_half_at_start() {
        let p = p_up_driftless(100.0, 100.0, 0.001, 300.0).unwrap();
        assert!((p - 0.5).abs() < 1e-9);
    }

    #[test]
    fn p_up_increases_with_spot() {
        let below = p_up_driftless(100.0, 99.5, 0.001, 300.0).unwrap();
        let above = p_up_driftless(100.0, 100.5, 0.001, 300.0).unwrap();
        assert!(below < 0.5);
        assert!(above > 0.5);
    }

    #[test]
    fn p_up_rejects_degenerate_inputs() {
        assert!(p_up_driftless(0.0, 100.0, 0.001, 300.0).is_none());
        assert!(p_up_driftless(100.0, 100.0, 0.0, 300.0).is_none());
        assert!(p_up_driftless(100.0, 100.0, 0.001, 0.0).is_none());
    }

    #[test]
    fn shrink_pulls_toward_half() {
        assert!((shrink_to_half(0.9, 0.5) - 0.7).abs() < 1e-9);
        assert!((shrink_to_half(0.5, 0.35) - 0.5).abs() < 1e-9);
        // full shrink collapses to coin flip
        assert!((shrink_to_half(0.99, 0.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn ewma_vol_needs_two_points() {
        let mut vol = EwmaVol::new(0.97);
        vol.record(100.0, 1);
        assert!(vol.sigma_per_sqrt_s().is_none());
        vol.record(100.5, 2);
        assert!(vol.sigma_per_sqrt_s().unwrap() > 0.0);
    }

    fn tick(symbol: &str, ts: i64, spot: f64, up_ask: f64, down_ask: f64, secs: i64) -> Tick {
        Tick {
            ts,
            symbol: symbol.to_string(),
            spot,
            book: BookSnapshot {
                ts,
                up: BestPrices::from_bid_ask(up_ask - 0.02, up_ask),
                down: BestPrices::from_bid_ask(down_ask - 0.02, down_ask),
                ..Default::default()
            },
            implied_up: Some(up_ask - 0.01),
            secs_remaining: secs,
        }
    }

    #[test]
    fn drift_strategy_buys_mispriced_up() {
        let mut strategy = DriftStrategy::new(DriftStrategyConfig {
            min_edge: 0.05,
            cooldown_secs: 0,
            ..Default::default()
        });

        let epoch = 900_000; // multiple of 900
        // warm up with a fairly-priced book: establish start price and
        // volatility without emitting
        assert!(strategy
            .on_tick(&tick("BTCUSDT", epoch, 100.0, 0.55, 0.55, 800))
            .is_none());
        assert!(strategy
            .on_tick(&tick("BTCUSDT", epoch + 1, 100.05, 0.55, 0.55, 799))
            .is_none());
        assert!(strategy
            .on_tick(&tick("BTCUSDT", epoch + 2, 100.02, 0.55, 0.55, 798))
            .is_none());

        // spot well above start, UP priced cheap at 0.40
        let intent = strategy
            .on_tick(&tick("BTCUSDT", epoch + 10, 100.6, 0.40, 0.62, 790))
            .expect("expected an entry");
        assert_eq!(intent.direction, Direction::Up);
        assert!(intent.edge >= 0.05);
        assert!(intent.model_prob > 0.5);
    }

    #[test]
    fn drift_strategy_skips_window_tail() {
        let mut strategy = DriftStrategy::new(DriftStrategyConfig {
            min_edge: 0.0,
            cooldown_secs: 0,
            window_end_skip_secs: 90,
            ..Default::default()
        });
        let epoch = 900_000;
        strategy.on_tick(&tick("BTCUSDT", epoch, 100.0, 0.40, 0.40, 800));
        strategy.on_tick(&tick("BTCUSDT", epoch + 1, 100.3, 0.40, 0.40, 799));
        // inside the skip zone: no entries regardless of edge
        assert!(strategy
            .on_tick(&tick("BTCUSDT", epoch + 2, 100.6, 0.10, 0.40, 60))
            .is_none());
    }

    #[test]
    fn drift_strategy_respects_cooldown() {
        let mut strategy = DriftStrategy::new(DriftStrategyConfig {
            min_edge: 0.01,
            cooldown_secs: 30,
            ..Default::default()
        });
        let epoch = 900_000;
        strategy.on_tick(&tick("BTCUSDT", epoch, 100.0, 0.60, 0.60, 800));
        strategy.on_tick(&tick("BTCUSDT", epoch + 1, 100.4, 0.60, 0.60, 799));
        let first = strategy.on_tick(&tick("BTCUSDT", epoch + 5, 100.8, 0.30, 0.80, 795));
        assert!(first.is_some());
        // within cooldown: silent
        assert!(strategy
            .on_tick(&tick("BTCUSDT", epoch + 10, 101.0, 0.30, 0.80, 790))
            .is_none());
        // after cooldown: allowed again
        assert!(strategy
            .on_tick(&tick("BTCUSDT", epoch + 40, 101.2, 0.30, 0.80, 760))
            .is_some());
    }
}
