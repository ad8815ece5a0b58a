//! Bybit v5 private WebSocket: the `order` topic, forwarded as [`OrderUpdate`]s.
//!
//! Each successful authentication pings `resync` so the engine can reconcile
//! whatever happened while the socket was down.

use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::{Credentials, BYBIT_WS_PRIVATE_URL, PING_INTERVAL_SECS};
use crate::types::{OrderStatus, OrderUpdate};
use crate::websocket_handler::WsResult;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of the auth signature.
const AUTH_EXPIRY_MS: i64 = 5_000;

pub struct OrderStream {
    api_key: String,
    api_secret: String,
    url: String,
    updates: mpsc::Sender<OrderUpdate>,
    resync: Option<Arc<Notify>>,
}

impl OrderStream {
    pub fn new(credentials: &Credentials, updates: mpsc::Sender<OrderUpdate>) -> Self {
        OrderStream {
            api_key: credentials.api_key.clone(),
            api_secret: credentials.api_secret.clone(),
            url: BYBIT_WS_PRIVATE_URL.to_string(),
            updates,
            resync: None,
        }
    }

    pub fn with_resync(mut self, notify: Arc<Notify>) -> Self {
        self.resync = Some(notify);
        self
    }

    fn auth_message(&self) -> WsResult<Value> {
        let expires = chrono::Utc::now().timestamp_millis() + AUTH_EXPIRY_MS;
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| format!("HMAC key: {e}"))?;
        mac.update(format!("GET/realtime{}", expires).as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(json!({ "op": "auth", "args": [self.api_key, expires, signature] }))
    }

    /// Run one session; see [`KlineStream::connect`](crate::websocket_handler::KlineStream::connect).
    pub async fn connect(&self) -> WsResult {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        log::info!("Private WebSocket connected to Bybit");

        let (mut write, mut read) = ws_stream.split();
        write.send(Message::Text(self.auth_message()?.to_string())).await?;

        let sub_msg = json!({ "op": "subscribe", "args": ["order"] });
        let mut ping_timer = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_timer.tick().await;

        let mut authed = false;
        let drop_reason = loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    let ping = json!({"op": "ping"}).to_string();
                    if let Err(e) = write.send(Message::Text(ping)).await {
                        break format!("ping failed: {e}");
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let Ok(data) = serde_json::from_str::<Value>(&text) else { continue };
                            if data["op"].as_str() == Some("auth") {
                                if data["success"].as_bool() != Some(true) {
                                    break format!("auth failed: {}", data["ret_msg"]);
                                }
                                log::info!("Private WS authenticated");
                                authed = true;
                                write.send(Message::Text(sub_msg.to_string())).await?;
                                if let Some(notify) = &self.resync {
                                    notify.notify_one();
                                }
                                continue;
                            }
                            if !authed || data["topic"].as_str() != Some("order") {
                                continue;
                            }
                            for update in parse_order_updates(&data) {
                                log::debug!(
                                    "[{}] order {} {:?} cum={} avg={}",
                                    update.symbol, update.order_id, update.status,
                                    update.cum_exec_qty, update.avg_price
                                );
                                if self.updates.send(update).await.is_err() {
                                    log::info!("order update receiver dropped, stopping private stream");
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
        log::warn!("private stream dropped: {}", drop_reason);
        Err(drop_reason.into())
    }
}

/// `order` topic payload. Linear rows only; spot and options share the topic.
pub fn parse_order_updates(message: &Value) -> Vec<OrderUpdate> {
    let Some(items) = message["data"].as_array() else { return Vec::new() };
    let num = |v: &Value| v.as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
    items
        .iter()
        .filter(|o| o["category"].as_str().map_or(true, |c| c == "linear"))
        .filter_map(|o| {
            Some(OrderUpdate {
                order_id: o["orderId"].as_str()?.to_string(),
                symbol: o["symbol"].as_str()?.to_string(),
                status: OrderStatus::from_bybit(o["orderStatus"].as_str()?),
                updated_time: o["updatedTime"].as_str()?.parse().ok()?,
                cum_exec_qty: num(&o["cumExecQty"]),
                avg_price: num(&o["avgPrice"]),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_push_becomes_updates() {
        let msg = json!({
            "topic": "order",
            "creationTime": 1_700_000_000_000i64,
            "data": [
                {
                    "category": "linear", "symbol": "BTCUSDT", "orderId": "a1",
                    "orderStatus": "Filled", "cumExecQty": "0.010", "avgPrice": "30100.5",
                    "updatedTime": "1700000000123"
                },
                {
                    "category": "spot", "symbol": "BTCUSDT", "orderId": "s1",
                    "orderStatus": "Filled", "cumExecQty": "1", "avgPrice": "1",
                    "updatedTime": "1700000000124"
                },
                {
                    "category": "linear", "symbol": "BTCUSDT", "orderId": "a2",
                    "orderStatus": "Untriggered", "cumExecQty": "0", "avgPrice": "",
                    "updatedTime": "1700000000125"
                }
            ]
        });
        let updates = parse_order_updates(&msg);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].order_id, "a1");
        assert_eq!(updates[0].status, OrderStatus::Filled);
        assert_eq!(updates[0].updated_time, 1_700_000_000_123);
        assert_eq!(updates[0].avg_price, 30100.5);
        assert_eq!(updates[1].status, OrderStatus::Untriggered);
        assert_eq!(updates[1].avg_price, 0.0);
    }

    #[test]
    fn auth_message_signs_with_expiry() {
        let (tx, _rx) = mpsc::channel(1);
        let creds = Credentials { api_key: "key".into(), api_secret: "secret".into() };
        let msg = OrderStream::new(&creds, tx).auth_message().unwrap();
        assert_eq!(msg["op"], "auth");
        assert_eq!(msg["args"][0], "key");
        assert!(msg["args"][1].as_i64().unwrap() > chrono::Utc::now().timestamp_millis());
        assert_eq!(msg["args"][2].as_str().unwrap().len(), 64);
    }
}
