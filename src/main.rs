//! quarterbot - automated trading engine for 15-minute binary up/down
//! markets.
//!
//! Startup order matters: storage, exchange client, reconciliation (before
//! any new signal is admitted), feeds, window lifecycle, positions, and only
//! then the strategy runner and API server.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use std::{path::Path, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, time::interval};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quarterbot::{
    api::{self, ApiState},
    config::Config,
    engine::{
        ControlPanel, Controls, DriftStrategy, DriftStrategyConfig, InstrumentSpec, OrderManager,
        OrderManagerConfig, PaperLedger, PositionConfig, PositionManager, Reconciler,
        StrategyRunner, StrategyRunnerConfig,
    },
    exchange::{ClobClient, ExchangeApi, TokenBucket},
    feeds::{
        aux_oracle::{AuxOracleConfig, AuxOracleFeed},
        chainlink::{ChainlinkConfig, ChainlinkFeed},
        exchange_ws, FeedAggregator, FreshnessConfig, ReferencePriceResolver,
    },
    models::{KillSwitch, WsServerEvent},
    store::{IntentLog, TradeStore},
    window::WindowManager,
};

#[derive(Debug, Parser)]
#[command(name = "quarterbot", about = "15-minute binary window trading engine")]
struct Cli {
    /// Database path (overrides DB_PATH).
    #[arg(long)]
    db_path: Option<String>,
    /// API listen address (overrides LISTEN_ADDR).
    #[arg(long)]
    listen: Option<String>,
    /// Trading mode: PAPER, DRY_RUN, or LIVE (explicit flag counts as
    /// operator confirmation).
    #[arg(long)]
    mode: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    info!("🚀 quarterbot starting");
    info!("💾 database: {}", config.db_path);

    // ---------------------------------------------------------------
    // Storage + exchange
    // ---------------------------------------------------------------
    let store = TradeStore::new(&config.db_path)?;
    let wal = IntentLog::new(&store);

    let bucket = Arc::new(TokenBucket::new(
        config.exchange_rate_limit,
        config.exchange_rate_refill_per_sec,
    ));
    let exchange: Arc<dyn ExchangeApi> = match ClobClient::from_env(bucket.clone()) {
        Some(client) => {
            info!("🔐 exchange client initialized with credentials");
            Arc::new(client)
        }
        None => {
            let host = std::env::var("CLOB_HOST")
                .unwrap_or_else(|_| "https://clob.polymarket.com".to_string());
            warn!("⚠️  no exchange credentials; public client only (no LIVE trading)");
            Arc::new(ClobClient::public(host, bucket.clone())?)
        }
    };

    // ---------------------------------------------------------------
    // Controls, ledger, order manager
    // ---------------------------------------------------------------
    let controls = Arc::new(ControlPanel::new(Controls::from_env()));
    if let Some(mode) = cli.mode {
        let value = if mode.eq_ignore_ascii_case("LIVE") {
            "LIVE_CONFIRMED".to_string()
        } else {
            mode
        };
        controls
            .apply("trading_mode", &value)
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    info!(
        "🎛️  trading mode: {}",
        controls.snapshot().trading_mode.as_str()
    );

    let (events_tx, _) = tokio::sync::broadcast::channel::<WsServerEvent>(1000);
    let ledger = Arc::new(parking_lot::Mutex::new(PaperLedger::with_cash(
        config.paper_cash_usd,
    )));

    let orders = Arc::new(OrderManager::new(
        store.clone(),
        wal.clone(),
        exchange.clone(),
        OrderManagerConfig::from_env(),
        ledger.clone(),
        events_tx.clone(),
    ));

    // ---------------------------------------------------------------
    // Reconcile before admitting any new signal
    // ---------------------------------------------------------------
    let reconciler = Reconciler::new(store.clone(), wal.clone(), exchange.clone(), orders.clone());
    match reconciler.run().await {
        Ok(report) => {
            if report.intents_unresolved > 0 || report.unknowns_remaining > 0 {
                warn!(
                    unresolved = report.intents_unresolved,
                    unknowns = report.unknowns_remaining,
                    "reconciliation left open questions; affected (window, token) pairs stay gated"
                );
            }
        }
        Err(e) => {
            // admitting signals with an unreconciled log risks double spends
            error!(error = %e, "startup reconciliation failed; aborting");
            return Err(e);
        }
    }

    // ---------------------------------------------------------------
    // Feeds
    // ---------------------------------------------------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let instruments = Arc::new(InstrumentSpec::from_env());
    if instruments.is_empty() {
        warn!("⚠️  INSTRUMENTS not set; ingesting prices but nothing is tradable");
    }
    let symbols: Vec<String> = if instruments.is_empty() {
        vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
    } else {
        instruments.iter().map(|i| i.symbol.clone()).collect()
    };

    let resolver = Arc::new(ReferencePriceResolver::new(FreshnessConfig::default()));
    let (aggregator, feed_tx) =
        FeedAggregator::new(resolver.clone(), config.feed_silence_secs);
    let feed_health = aggregator.health_handle();

    tokio::spawn(exchange_ws::run_exchange_ticker(
        "binance",
        config.exchange_ws_url.clone(),
        symbols.clone(),
        feed_tx.clone(),
        shutdown_rx.clone(),
    ));

    match ChainlinkConfig::from_env() {
        Some(chainlink_cfg) => {
            info!("🔗 primary oracle feed enabled ({} symbols)", chainlink_cfg.feeds.len());
            let feed = ChainlinkFeed::new(chainlink_cfg)?;
            tokio::spawn(feed.run(feed_tx.clone(), shutdown_rx.clone()));
        }
        None => {
            warn!("⚠️  primary oracle not configured (ORACLE_RPC_URL/ORACLE_FEEDS); strikes fall back to exchange prices");
        }
    }

    if let Some(aux_cfg) = AuxOracleConfig::from_env(symbols.clone()) {
        info!("📡 secondary oracle poller enabled");
        let feed = AuxOracleFeed::new(aux_cfg)?;
        tokio::spawn(feed.run(feed_tx.clone(), shutdown_rx.clone()));
    }

    tokio::spawn(aggregator.run(shutdown_rx.clone()));

    // flag silent feed sources
    {
        let health = feed_health.clone();
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        for source in health.sweep(Utc::now().timestamp()) {
                            warn!(source, "feed source degraded (silent)");
                        }
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    // ---------------------------------------------------------------
    // Window lifecycle + positions
    // ---------------------------------------------------------------
    let windows = Arc::new(WindowManager::new(store.clone(), resolver.clone()));
    let now = Utc::now().timestamp();
    for symbol in &symbols {
        windows.track_symbol(symbol, now);
    }
    tokio::spawn(windows.clone().run(shutdown_rx.clone()));

    let positions = Arc::new(PositionManager::new(
        store.clone(),
        orders.clone(),
        ledger.clone(),
        PositionConfig::from_env(),
    ));
    tokio::spawn(positions.clone().run(
        orders.subscribe_fills(),
        windows.subscribe(),
        shutdown_rx.clone(),
    ));

    // ---------------------------------------------------------------
    // Strategy runner
    // ---------------------------------------------------------------
    let runner = StrategyRunner::new(
        instruments.as_ref().clone(),
        vec![Box::new(DriftStrategy::new(DriftStrategyConfig::from_env()))],
        resolver.clone(),
        windows.clone(),
        orders.clone(),
        positions.clone(),
        controls.clone(),
        exchange.clone(),
        store.clone(),
        StrategyRunnerConfig::default(),
    );
    tokio::spawn(runner.run(shutdown_rx.clone()));

    // ---------------------------------------------------------------
    // Kill-switch actions + session-loss monitor
    // ---------------------------------------------------------------
    {
        let orders = orders.clone();
        let positions = positions.clone();
        let mut controls_rx = controls.watch();
        tokio::spawn(async move {
            let mut acted = false;
            while controls_rx.changed().await.is_ok() {
                let switch = controls_rx.borrow().kill_switch;
                if switch >= KillSwitch::Flatten && !acted {
                    acted = true;
                    warn!("🛑 kill switch flatten: cancelling open orders and exiting positions");
                    let (cancelled, failed) = orders.cancel_all().await;
                    info!(
                        cancelled = cancelled.len(),
                        failed = failed.len(),
                        "flatten cancel sweep done"
                    );
                    if let Err(e) = positions.flatten_all().await {
                        error!(error = %e, "flatten position sweep failed");
                    }
                } else if switch < KillSwitch::Flatten {
                    acted = false;
                }
            }
        });
    }

    {
        let controls = controls.clone();
        let ledger = ledger.clone();
        let initial_cash = config.paper_cash_usd;
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let cash = ledger.lock().cash_usd;
                        let loss = initial_cash - cash;
                        let max_loss = controls.snapshot().max_session_loss;
                        if loss > max_loss {
                            controls.escalate(
                                KillSwitch::Flatten,
                                &format!("session loss {loss:.2} exceeded limit {max_loss:.2}"),
                            );
                        }
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    // daily tick retention sweep
    {
        let store = store.clone();
        let retention_days = config.tick_retention_days;
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(86_400));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let cutoff = Utc::now().timestamp() - retention_days * 86_400;
                        match store.prune_ticks_before(cutoff).await {
                            Ok(0) => {}
                            Ok(n) => info!("🧹 pruned {} ticks (retention={}d)", n, retention_days),
                            Err(e) => warn!(error = %e, "tick prune failed"),
                        }
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    // ---------------------------------------------------------------
    // API server
    // ---------------------------------------------------------------
    let api_state = ApiState {
        store: store.clone(),
        controls: controls.clone(),
        events: events_tx.clone(),
        ledger: ledger.clone(),
        feed_health,
        resolver: resolver.clone(),
        instruments,
    };
    let app = api::router(api_state);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    info!("🎯 API server listening on {}", config.listen_addr);

    let shutdown_signal = {
        let controls = controls.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received; draining in-flight work");
            // stop admitting new signals first
            controls.escalate(KillSwitch::Pause, "shutdown");
            let _ = shutdown_tx.send(true);
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("server error")?;

    // bounded grace period for in-flight intents to reach a terminal state
    tokio::time::sleep(config.shutdown_grace).await;

    info!("👋 quarterbot stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quarterbot=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // standard dotenv search, then the crate directory explicitly so
    // running with --manifest-path from elsewhere still picks it up
    let _ = dotenv();
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    for p in [manifest_dir.join(".env"), manifest_dir.join("../.env")] {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
