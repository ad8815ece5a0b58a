use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::{BYBIT_WS_PUBLIC_URL, PING_INTERVAL_SECS};
use crate::types::Candle;

pub type WsResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// A session that lived this long resets the reconnect budget.
const STABLE_SESSION: Duration = Duration::from_secs(60);

/// Public kline stream for one symbol and interval. Only confirmed (closed)
/// candles are forwarded, each timestamp once.
pub struct KlineStream {
    symbol: String,
    interval: String,
    url: String,
    candles: mpsc::Sender<Candle>,
    last_sent: AtomicI64,
}

impl KlineStream {
    pub fn new(symbol: &str, interval: &str, candles: mpsc::Sender<Candle>) -> Self {
        KlineStream {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            url: BYBIT_WS_PUBLIC_URL.to_string(),
            candles,
            last_sent: AtomicI64::new(i64::MIN),
        }
    }

    pub fn topic(&self) -> String {
        format!("kline.{}.{}", self.interval, self.symbol)
    }

    /// Run one session. Returns `Ok` only when the candle receiver is gone;
    /// every connection loss is an `Err` so the caller reconnects.
    pub async fn connect(&self) -> WsResult {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        log::info!("WebSocket connected to Bybit ({})", self.url);

        let (mut write, mut read) = ws_stream.split();
        let topic = self.topic();
        let sub_msg = json!({ "op": "subscribe", "args": [topic.as_str()] });
        write.send(Message::Text(sub_msg.to_string())).await?;
        log::info!("Subscribed to {}", topic);

        let mut ping_timer = interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_timer.tick().await;

        let drop_reason = loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    let ping = json!({"op": "ping"}).to_string();
                    if let Err(e) = write.send(Message::Text(ping)).await {
                        break format!("ping failed: {e}");
                    }
                    log::debug!("WebSocket ping sent");
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let Ok(data) = serde_json::from_str::<Value>(&text) else { continue };
                            if data["op"].as_str() == Some("pong") {
                                log::debug!("WebSocket pong received");
                                continue;
                            }
                            if data["topic"].as_str() != Some(topic.as_str()) {
                                continue;
                            }
                            for candle in parse_klines(&data) {
                                if !self.accept(&candle) {
                                    continue;
                                }
                                if self.candles.send(candle).await.is_err() {
                                    log::info!("[{}] candle receiver dropped, stopping stream", self.symbol);
                                    return Ok(());
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) => break "closed by server".to_string(),
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream ended".to_string(),
                        _ => {}
                    }
                }
            }
        };
        log::warn!("[{}] kline stream dropped: {}", self.symbol, drop_reason);
        Err(drop_reason.into())
    }

    /// Confirmed and newer than anything already forwarded.
    fn accept(&self, candle: &Candle) -> bool {
        if !candle.confirmed {
            return false;
        }
        let previous = self.last_sent.fetch_max(candle.timestamp, Ordering::Relaxed);
        candle.timestamp > previous
    }
}

/// Kline push payload (`data` array with named string fields).
pub fn parse_klines(message: &Value) -> Vec<Candle> {
    let Some(items) = message["data"].as_array() else { return Vec::new() };
    items
        .iter()
        .filter_map(|k| {
            let field = |name: &str| k[name].as_str()?.parse::<f64>().ok();
            let timestamp = k["start"].as_i64()?;
            Some(Candle {
                timestamp,
                open: field("open")?,
                high: field("high")?,
                low: field("low")?,
                close: field("close")?,
                volume: field("volume")?,
                confirmed: k["confirm"].as_bool().unwrap_or(false),
            })
        })
        .collect()
}

/// Keep a stream alive: retry `connect` with doubling delays. A session that
/// ran for a while resets the budget; `max_retries` consecutive quick failures
/// give up.
pub async fn reconnect_with_backoff<F, Fut>(
    name: &str,
    mut connect: F,
    max_retries: u32,
    initial_delay_secs: u64,
) -> WsResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WsResult>,
{
    let mut retries = 0;
    let mut delay = initial_delay_secs;

    loop {
        let started = Instant::now();
        match connect().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if started.elapsed() >= STABLE_SESSION {
                    retries = 0;
                    delay = initial_delay_secs;
                }
                retries += 1;
                if retries >= max_retries {
                    return Err(format!("{} failed after {} retries: {}", name, retries, e).into());
                }
                log::warn!(
                    "{} error: {}. Reconnect in {}s ({}/{})",
                    name, e, delay, retries, max_retries
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
                delay = (delay * 2).min(300);
            }
        }
    }
}
