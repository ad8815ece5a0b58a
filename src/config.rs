use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::types::TpMode;

// ─── Bybit endpoints ──────────────────────────────────────────────────────────
pub const BYBIT_REST_URL: &str = "https://api.bybit.com";
pub const BYBIT_WS_PUBLIC_URL: &str = "wss://stream.bybit.com/v5/public/linear";
pub const BYBIT_WS_PRIVATE_URL: &str = "wss://stream.bybit.com/v5/private";
pub const RECV_WINDOW_MS: &str = "5000";
pub const PING_INTERVAL_SECS: u64 = 20;
// BYBIT_API_KEY, BYBIT_SECRET, TELEGRAM_TOKEN, TELEGRAM_CHAT_ID
// are read from environment variables at runtime (.env is honoured)

// ─── Runtime defaults ─────────────────────────────────────────────────────────
pub const DEFAULT_SYMBOL: &str = "BTCUSDT";
pub const KLINE_INTERVAL: &str = "5";
/// Closed candles replayed through the analyzer before going live (Bybit caps a page at 1000).
pub const WARMUP_CANDLES: usize = 1000;
pub const CANDLE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
    #[error("{0} env var not set")]
    MissingEnv(&'static str),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Signal pipeline tuning. Defaults favour fewer, higher-volume setups.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TradingConfig {
    pub volume_window: usize,
    pub volume_high_multiplier: f64,
    pub volume_low_multiplier: f64,

    pub zone_tolerance: f64,
    pub zone_min_touches: u32,

    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    /// Longs are vetoed at or above this RSI.
    pub rsi_max_for_long: f64,
    /// Shorts are vetoed at or below this RSI.
    pub rsi_min_for_short: f64,

    pub atr_period: usize,
    pub ema_short_period: usize,
    pub ema_long_period: usize,
    pub adx_period: usize,
    pub adx_threshold: f64,

    pub sl_adjustment: f64,
    pub sl_buffer: f64,
    /// Ceiling on (entry - sl) / entry.
    pub max_risk_fraction: f64,
    pub tp2_risk_multiple: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            volume_window: 25,
            volume_high_multiplier: 1.45,
            volume_low_multiplier: 0.7,
            zone_tolerance: 0.005,
            zone_min_touches: 0,
            rsi_period: 21,
            rsi_overbought: 65.0,
            rsi_oversold: 35.0,
            rsi_max_for_long: 70.0,
            rsi_min_for_short: 30.0,
            atr_period: 14,
            ema_short_period: 20,
            ema_long_period: 60,
            adx_period: 14,
            adx_threshold: 15.0,
            sl_adjustment: 1.2,
            sl_buffer: 0.004,
            max_risk_fraction: 0.02,
            tp2_risk_multiple: 1.5,
        }
    }
}

/// Position lifecycle knobs: retry schedules, fee model, TP ladder mode.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub tp_mode: TpMode,
    /// Round-trip fee allowance used for the breakeven stop after TP1.
    pub commission_rate: f64,
    pub order_retry_attempts: u32,
    pub order_retry_initial_ms: u64,
    pub order_retry_max_ms: u64,
    pub fill_poll_attempts: u32,
    pub fill_poll_delay_ms: u64,
    pub cancel_retry_attempts: u32,
    pub cancel_retry_delay_ms: u64,
    pub read_retry_attempts: u32,
    pub read_retry_delay_ms: u64,
    pub dedup_capacity: usize,
    pub update_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tp_mode: TpMode::Dual,
            commission_rate: 0.002,
            order_retry_attempts: 3,
            order_retry_initial_ms: 1_000,
            order_retry_max_ms: 8_000,
            fill_poll_attempts: 15,
            fill_poll_delay_ms: 2_000,
            cancel_retry_attempts: 3,
            cancel_retry_delay_ms: 1_000,
            read_retry_attempts: 3,
            read_retry_delay_ms: 1_000,
            dedup_capacity: 1_000,
            update_channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn placement_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.order_retry_attempts,
            Duration::from_millis(self.order_retry_initial_ms),
            Duration::from_millis(self.order_retry_max_ms),
        )
    }

    pub fn fill_wait_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.fill_poll_attempts, Duration::from_millis(self.fill_poll_delay_ms))
    }

    pub fn cancel_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.cancel_retry_attempts,
            Duration::from_millis(self.cancel_retry_delay_ms),
        )
    }

    pub fn read_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.read_retry_attempts, Duration::from_millis(self.read_retry_delay_ms))
    }

    /// Same shape with every delay zeroed. Used by tests and dry runs.
    pub fn without_delays(mut self) -> Self {
        self.order_retry_initial_ms = 0;
        self.order_retry_max_ms = 0;
        self.fill_poll_delay_ms = 0;
        self.cancel_retry_delay_ms = 0;
        self.read_retry_delay_ms = 0;
        self
    }
}

/// Everything the binary needs apart from credentials.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub symbol: String,
    pub interval: String,
    pub leverage: u32,
    /// Margin committed per trade, in USDT.
    pub notional: f64,
    pub warmup_candles: usize,
    pub trading: TradingConfig,
    pub engine: EngineConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            symbol: DEFAULT_SYMBOL.to_string(),
            interval: KLINE_INTERVAL.to_string(),
            leverage: 1,
            notional: 100.0,
            warmup_candles: WARMUP_CANDLES,
            trading: TradingConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: display.clone(), source })?;
        let settings: Settings =
            toml::from_str(&raw).map_err(|source| ConfigError::Parse { path: display, source })?;
        settings.check()?;
        Ok(settings)
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        let t = &self.trading;
        if self.leverage == 0 {
            return Err(ConfigError::Invalid("leverage must be at least 1".into()));
        }
        if self.notional <= 0.0 {
            return Err(ConfigError::Invalid("notional must be positive".into()));
        }
        if t.volume_window == 0 || t.rsi_period == 0 || t.atr_period == 0 || t.adx_period == 0 {
            return Err(ConfigError::Invalid("indicator periods must be positive".into()));
        }
        if t.ema_short_period == 0 || t.ema_short_period >= t.ema_long_period {
            return Err(ConfigError::Invalid(format!(
                "ema_short_period ({}) must be positive and below ema_long_period ({})",
                t.ema_short_period, t.ema_long_period
            )));
        }
        if !(0.0..1.0).contains(&t.zone_tolerance) || !(0.0..1.0).contains(&t.max_risk_fraction) {
            return Err(ConfigError::Invalid(
                "zone_tolerance and max_risk_fraction must be fractions in [0, 1)".into(),
            ));
        }
        if self.engine.fill_poll_attempts == 0 || self.engine.order_retry_attempts == 0 {
            return Err(ConfigError::Invalid("retry attempt counts must be at least 1".into()));
        }
        Ok(())
    }
}

/// API credentials from the environment.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key =
            std::env::var("BYBIT_API_KEY").map_err(|_| ConfigError::MissingEnv("BYBIT_API_KEY"))?;
        let api_secret =
            std::env::var("BYBIT_SECRET").map_err(|_| ConfigError::MissingEnv("BYBIT_SECRET"))?;
        Ok(Credentials { api_key, api_secret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            symbol = "ETHUSDT"
            leverage = 3

            [trading]
            rsi_period = 14

            [engine]
            tp_mode = "single"
            "#,
        )
        .unwrap();
        assert_eq!(settings.symbol, "ETHUSDT");
        assert_eq!(settings.leverage, 3);
        assert_eq!(settings.trading.rsi_period, 14);
        assert_eq!(settings.trading.volume_window, 25);
        assert_eq!(settings.engine.tp_mode, TpMode::Single);
        assert_eq!(settings.engine.fill_poll_attempts, 15);
        assert!(settings.check().is_ok());
    }

    #[test]
    fn check_rejects_inverted_ema_periods() {
        let mut settings = Settings::default();
        settings.trading.ema_short_period = 60;
        settings.trading.ema_long_period = 20;
        assert!(matches!(settings.check(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn policies_follow_engine_config() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.fill_wait_policy().max_attempts(), 15);
        assert_eq!(cfg.placement_policy().delay_for(1), Duration::from_millis(1_000));
        assert_eq!(cfg.placement_policy().delay_for(2), Duration::from_millis(2_000));
        assert_eq!(cfg.clone().without_delays().fill_wait_policy().delay_for(3), Duration::ZERO);
    }
}
