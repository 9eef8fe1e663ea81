/// Dropwatch Monitor - headless dropwatch session
///
/// Resolves the symbol list, loads history for one symbol/timeframe, then
/// either polls or runs live analysis and logs every update until Ctrl-C.
///
/// Configuration (environment):
/// - API_URL: REST base URL (default http://localhost:5000/api)
/// - HUB_URL: hub WebSocket URL (default ws://localhost:5000/analysisHub)
/// - SYMBOL, TIME_FRAME, TIME_RANGE_DAYS, REFRESH_INTERVAL_SECS
/// - LIVE=1 to start live analysis right away
/// - MAX_GREEN_CANDLES, MIN_CONSECUTIVE_CANDLES, DROP_THRESHOLD
/// - APPLY_BEST_PATTERN=1 to take candle count and drop from pattern statistics
/// - CACHE_DIR: where the symbol list is cached (default .dropwatch)
use chrono::SecondsFormat;
use dropwatch::{
    api::{AnalysisApi, ApiConfig},
    params::{AnalysisParameters, PatternStatisticsConfig, TimeFrame, TimeRange},
    session::{Session, SessionConfig, SessionUpdate},
    symbols::{select_symbol, SymbolCache},
    HubConfig,
};
use rustls::crypto::ring::default_provider;
use std::{error::Error, str::FromStr, sync::Arc, time::Duration};
use tracing::{info, warn};

#[derive(Debug)]
struct MonitorConfig {
    api_url: String,
    hub_url: String,
    symbol: String,
    time_frame: TimeFrame,
    time_range: TimeRange,
    refresh_interval: Duration,
    live: bool,
    apply_best_pattern: bool,
    params: AnalysisParameters,
    cache_dir: String,
}

impl MonitorConfig {
    fn from_env() -> Result<Self, String> {
        let defaults = AnalysisParameters::default();
        Ok(Self {
            api_url: std::env::var("API_URL")
                .unwrap_or_else(|_| ApiConfig::default().base_url),
            hub_url: std::env::var("HUB_URL").unwrap_or_else(|_| HubConfig::default().url),
            symbol: std::env::var("SYMBOL").unwrap_or_else(|_| "BTCUSDT".to_string()),
            time_frame: env_or("TIME_FRAME", TimeFrame::default())?,
            time_range: env_or("TIME_RANGE_DAYS", TimeRange::default())?,
            refresh_interval: Duration::from_secs(env_or("REFRESH_INTERVAL_SECS", 10u64)?),
            live: env_flag("LIVE"),
            apply_best_pattern: env_flag("APPLY_BEST_PATTERN"),
            params: AnalysisParameters {
                max_green_candles: env_or("MAX_GREEN_CANDLES", defaults.max_green_candles)?,
                min_consecutive_candles: env_or(
                    "MIN_CONSECUTIVE_CANDLES",
                    defaults.min_consecutive_candles,
                )?,
                significant_drop_threshold: env_or(
                    "DROP_THRESHOLD",
                    defaults.significant_drop_threshold,
                )?,
            },
            cache_dir: std::env::var("CACHE_DIR").unwrap_or_else(|_| ".dropwatch".to_string()),
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| format!("invalid {key}={value}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = default_provider().install_default();
    init_logging();

    let config = MonitorConfig::from_env()?;
    info!(?config, "Starting dropwatch monitor");

    let api = AnalysisApi::new(ApiConfig::new(config.api_url.clone()))?;

    let cache = SymbolCache::new(&config.cache_dir);
    let symbols = match cache.resolve(&api).await {
        Ok(symbols) => symbols,
        Err(e) => {
            warn!(error = %e, "Could not resolve symbol list, using configured symbol");
            Vec::new()
        }
    };
    let symbol = select_symbol(&symbols, &config.symbol).unwrap_or_else(|| config.symbol.clone());
    if symbol != config.symbol {
        warn!(requested = %config.symbol, %symbol, "Symbol not offered by backend, using default");
    }

    let mut params = config.params;
    if config.apply_best_pattern {
        match api
            .pattern_statistics(&symbol, config.time_frame, PatternStatisticsConfig::default())
            .await
        {
            Ok(statistics) => {
                if let Some(best) = statistics.first() {
                    params.apply_pattern(best);
                    info!(
                        candle_count = best.candle_count,
                        drop_percent = best.drop_percent,
                        average_reversal_percent = best.average_reversal_percent,
                        "Applied best historical pattern"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Pattern statistics unavailable, keeping parameters"),
        }
    }

    let session_config = SessionConfig::new(symbol)
        .with_time_frame(config.time_frame)
        .with_time_range(config.time_range)
        .with_refresh_interval(config.refresh_interval);
    let hub = HubConfig::new(config.hub_url.clone());
    let (handle, mut updates) = Session::new(session_config, Arc::new(api), Arc::new(hub)).spawn();

    if config.live {
        handle.start_live(params).await?;
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            update = updates.recv() => match update {
                Some(update) => log_update(&update),
                None => break,
            },
        }
    }

    // Nobody reads updates from here on; a full queue would stall the teardown
    drop(updates);
    let session = handle.shutdown().await?;
    info!(
        candles = session.store().len(),
        signals = session.signal_log().len(),
        active_reversals = session.signal_log().active_len(),
        "Dropwatch monitor stopped"
    );
    Ok(())
}

fn log_update(update: &SessionUpdate) {
    match update {
        SessionUpdate::CandlesChanged { candles, summary } => {
            let latest = candles.last();
            info!(
                len = candles.len(),
                inserted = summary.inserted,
                merged = summary.merged,
                evicted = summary.evicted,
                latest_time = latest
                    .map(|c| c.time.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_default(),
                latest_close = latest.map(|c| c.close).unwrap_or_default(),
                "Candles updated"
            );
        }
        SessionUpdate::SignalLogged { outcome, entry } => match entry {
            Some(entry) => info!(?outcome, "{}", entry),
            None => info!(?outcome, "Signal logged"),
        },
        SessionUpdate::LiveStarted { symbol, time_frame } => {
            info!(%symbol, %time_frame, "Live analysis running")
        }
        SessionUpdate::LiveStopped { reason: Some(reason) } => {
            warn!(%reason, "Live analysis ended by backend")
        }
        SessionUpdate::LiveStopped { reason: None } => info!("Live analysis stopped"),
        SessionUpdate::Status(status) => info!(?status, "Hub connection"),
        SessionUpdate::Notice(notice) => warn!(%notice, "Notice"),
    }
}

/// Initialize logging
fn init_logging() {
    tracing_subscriber::fmt()
        // Filter messages based on the INFO level
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        // Enable colours
        .with_ansi(true)
        .init()
}
