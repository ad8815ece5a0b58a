#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[cfg(feature = "jemalloc")]
fn jemalloc_purge() {
    use tikv_jemalloc_ctl::epoch;
    // Advancing the epoch makes jemalloc re-evaluate its decay windows.
    if let Ok(e) = epoch::mib() {
        let _ = e.advance();
    }
    log::debug!("jemalloc: epoch advanced");
}

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;

use sr_zone_trader::analyzer::MarketAnalyzer;
use sr_zone_trader::bybit_api::BybitClient;
use sr_zone_trader::config::{Credentials, Settings, CANDLE_CHANNEL_CAPACITY};
use sr_zone_trader::position_engine::PositionEngine;
use sr_zone_trader::telegram::TelegramBot;
use sr_zone_trader::types::TpMode;
use sr_zone_trader::websocket_handler::{reconnect_with_backoff, KlineStream};
use sr_zone_trader::websocket_private::OrderStream;

const WS_MAX_RETRIES: u32 = 20;
const WS_INITIAL_DELAY_SECS: u64 = 5;

/// Support/resistance zone trader for one Bybit USDT perpetual.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML settings file; built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    symbol: Option<String>,
    #[arg(long)]
    leverage: Option<u32>,
    /// Margin per trade in USDT.
    #[arg(long)]
    notional: Option<f64>,
    /// "single" or "dual" take-profit ladder.
    #[arg(long)]
    tp_mode: Option<TpMode>,
    /// Market out of any open position on Ctrl-C instead of leaving SL/TP working.
    #[arg(long)]
    close_on_exit: bool,
}

fn load_settings(args: &Args) -> Result<Settings, Box<dyn std::error::Error>> {
    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(symbol) = &args.symbol {
        settings.symbol = symbol.to_uppercase();
    }
    if let Some(leverage) = args.leverage {
        settings.leverage = leverage;
    }
    if let Some(notional) = args.notional {
        settings.notional = notional;
    }
    if let Some(mode) = args.tp_mode {
        settings.engine.tp_mode = mode;
    }
    settings.check()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let settings = load_settings(&args)?;
    let symbol = settings.symbol.clone();
    log::info!(
        "[{}] {}m, leverage {}x, margin {:.2} USDT, TP mode {:?}",
        symbol, settings.interval, settings.leverage, settings.notional, settings.engine.tp_mode
    );

    let credentials = Credentials::from_env()?;
    let bybit = Arc::new(BybitClient::new(credentials.clone())?);
    let engine = Arc::new(PositionEngine::new(bybit.clone(), &symbol, settings.engine.clone()));
    let tg = TelegramBot::from_env();
    if tg.is_none() {
        log::info!("Telegram not configured, notifications disabled");
    }

    // ── Adopt whatever the exchange already holds ─────────────────────────────
    engine.reconcile().await?;

    // ── Warm-up from closed history ───────────────────────────────────────────
    let mut analyzer = MarketAnalyzer::new(settings.trading.clone());
    match bybit.fetch_klines(&symbol, &settings.interval, settings.warmup_candles).await {
        Ok(history) => {
            let used = analyzer.warm_up(&history);
            let zones = analyzer.zones();
            log::info!(
                "[{}] warmed up on {} closed candles: {} support / {} resistance zones",
                symbol,
                used,
                zones.support_zones().len(),
                zones.resistance_zones().len()
            );
        }
        Err(e) => log::warn!("[{}] warm-up fetch failed: {}; starting cold", symbol, e),
    }

    if let Some(tg) = &tg {
        tg.notify_start(&symbol, &settings.interval, settings.leverage, settings.notional).await;
        tokio::spawn(tg.clone().forward_events(engine.subscribe()));
    }

    #[cfg(feature = "jemalloc")]
    {
        use sr_zone_trader::position_engine::EngineEvent;
        use tokio::sync::broadcast::error::RecvError;
        let mut events = engine.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::PositionClosed(_)) => jemalloc_purge(),
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // ── Private order stream -> engine ────────────────────────────────────────
    let (update_tx, update_rx) = mpsc::channel(settings.engine.update_channel_capacity);
    let resync = Arc::new(Notify::new());
    let orders = OrderStream::new(&credentials, update_tx).with_resync(resync.clone());
    tokio::spawn(async move {
        reconnect_with_backoff("private WS", || orders.connect(), WS_MAX_RETRIES, WS_INITIAL_DELAY_SECS)
            .await
            .unwrap_or_else(|e| log::error!("Private WebSocket failed permanently: {}", e));
    });
    {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_order_updates(update_rx).await });
    }
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            loop {
                resync.notified().await;
                if let Err(e) = engine.reconcile().await {
                    log::error!("reconcile after private WS (re)connect failed: {}", e);
                }
            }
        });
    }

    // ── Public kline stream ───────────────────────────────────────────────────
    let (candle_tx, mut candle_rx) = mpsc::channel(CANDLE_CHANNEL_CAPACITY);
    let klines = KlineStream::new(&symbol, &settings.interval, candle_tx);
    tokio::spawn(async move {
        reconnect_with_backoff("kline WS", || klines.connect(), WS_MAX_RETRIES, WS_INITIAL_DELAY_SECS)
            .await
            .unwrap_or_else(|e| log::error!("Kline WebSocket failed permanently: {}", e));
    });

    // ── Main loop ─────────────────────────────────────────────────────────────
    let mut entries = JoinSet::new();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            candle = candle_rx.recv() => {
                let Some(candle) = candle else {
                    log::error!("[{}] candle stream ended", symbol);
                    break;
                };
                let signal = analyzer.generate_signal(&candle);
                if let Ok(snapshot) = serde_json::to_string(&analyzer.snapshot()) {
                    log::debug!("[{}] {}", symbol, snapshot);
                }
                let Some(signal) = signal else { continue };

                if let Some(tg) = &tg {
                    let tg = tg.clone();
                    let signal = signal.clone();
                    tokio::spawn(async move { tg.notify_signal(&signal).await });
                }
                match engine.reserve_if_idle().await {
                    Ok(true) => {
                        let engine = engine.clone();
                        let (leverage, notional) = (settings.leverage, settings.notional);
                        entries.spawn(async move { engine.open_reserved(&signal, leverage, notional).await });
                    }
                    Ok(false) => {}
                    Err(e) => log::error!("[{}] entry slot unavailable: {}", symbol, e),
                }
            }
            Some(joined) = entries.join_next() => log_entry(&symbol, joined),
            _ = &mut shutdown => {
                log::info!("[{}] shutdown requested", symbol);
                break;
            }
        }
    }

    while let Some(joined) = entries.join_next().await {
        log_entry(&symbol, joined);
    }
    if args.close_on_exit {
        match engine.close_active_position().await {
            Ok(Some(closed)) => log::info!("[{}] closed on exit, pnl {:+.4}", symbol, closed.profit),
            Ok(None) => {}
            Err(e) => log::error!("[{}] close on exit failed: {}", symbol, e),
        }
    } else if !engine.active_positions().await.is_empty() {
        log::warn!("[{}] exiting with a position open; exchange-side SL/TP stay working", symbol);
    }
    if let Some(tg) = &tg {
        tg.notify_summary(&engine.closed_positions().await).await;
    }
    Ok(())
}

fn log_entry<T, E: std::fmt::Display>(
    symbol: &str,
    joined: Result<Result<T, E>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => log::warn!("[{}] entry abandoned: {}", symbol, e),
        Err(e) => log::error!("[{}] entry task panicked: {}", symbol, e),
    }
}
