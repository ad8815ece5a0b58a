use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{Credentials, BYBIT_REST_URL, RECV_WINDOW_MS};
use crate::exchange::{CancelOutcome, Exchange, ExchangeError, OrderKind, OrderRequest};
use crate::types::{
    Candle, ExchangePosition, OpenOrder, OrderState, OrderStatus, Side, SymbolRules,
};

type HmacSha256 = Hmac<Sha256>;

/// Back-off Bybit asks for after retCode 10006 when no reset header is sent.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(10);

/// Cancel rejections that mean the order is no longer working.
const ORDER_GONE_CODES: [i64; 4] = [110001, 110008, 110010, 170213];
const DUPLICATE_LINK_ID: i64 = 110072;
const LEVERAGE_NOT_MODIFIED: i64 = 110043;

// ── Error mapping ─────────────────────────────────────────────────────────────

/// Classify a Bybit retCode + HTTP status.
fn classify_error(ret_code: i64, http_status: u16, msg: &str) -> ExchangeError {
    match (ret_code, http_status) {
        (10006, _) | (_, 429) => ExchangeError::RateLimit { retry_after: RATE_LIMIT_BACKOFF },
        // 10002: timestamp outside recv_window, 10016: server busy.
        (10002 | 10016, _) | (_, 500..=599) => {
            ExchangeError::Transient(format!("retCode={} msg={}", ret_code, msg))
        }
        _ => ExchangeError::Permanent { code: ret_code, message: msg.to_string() },
    }
}

/// Unwrap the `{retCode, retMsg, result}` envelope.
fn check_response(http_status: u16, json: Value) -> Result<Value, ExchangeError> {
    let ret_code = json["retCode"].as_i64().unwrap_or(-1);
    if ret_code == 0 {
        Ok(json["result"].clone())
    } else {
        let msg = json["retMsg"].as_str().unwrap_or("unknown");
        Err(classify_error(ret_code, http_status, msg))
    }
}

/// Bybit sends numbers as strings; empty strings mean "not set".
fn num(v: &Value) -> f64 {
    v.as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| v.as_f64())
        .unwrap_or(0.0)
}

fn first_in_list(result: &Value) -> Option<&Value> {
    result["list"].as_array().and_then(|l| l.first())
}

// ── Response parsing ──────────────────────────────────────────────────────────

/// Kline rows arrive newest-first as string arrays. The newest row is the
/// interval still forming, so it is marked unconfirmed.
fn parse_klines(result: &Value) -> Result<Vec<Candle>, ExchangeError> {
    let list = result["list"]
        .as_array()
        .ok_or_else(|| ExchangeError::Transient("kline: missing result.list".into()))?;

    let mut candles: Vec<Candle> = list
        .iter()
        .enumerate()
        .filter_map(|(i, row)| {
            let arr = row.as_array()?;
            let field = |k: usize| arr.get(k)?.as_str()?.parse::<f64>().ok();
            Some(Candle {
                timestamp: arr.first()?.as_str()?.parse().ok()?,
                open: field(1)?,
                high: field(2)?,
                low: field(3)?,
                close: field(4)?,
                volume: field(5)?,
                confirmed: i > 0,
            })
        })
        .collect();
    candles.reverse();
    Ok(candles)
}

fn parse_order_state(order: &Value) -> OrderState {
    OrderState {
        status: OrderStatus::from_bybit(order["orderStatus"].as_str().unwrap_or("")),
        filled_qty: num(&order["cumExecQty"]),
        avg_price: num(&order["avgPrice"]),
    }
}

fn parse_position(result: &Value) -> Option<ExchangePosition> {
    let entry = first_in_list(result)?;
    let size = num(&entry["size"]);
    let side = Side::from_bybit(entry["side"].as_str()?)?;
    (size > 0.0).then(|| ExchangePosition { side, size, avg_price: num(&entry["avgPrice"]) })
}

fn parse_open_orders(result: &Value) -> Vec<OpenOrder> {
    let Some(list) = result["list"].as_array() else { return Vec::new() };
    list.iter()
        .filter_map(|o| {
            Some(OpenOrder {
                order_id: o["orderId"].as_str()?.to_string(),
                side: Side::from_bybit(o["side"].as_str()?)?,
                qty: num(&o["qty"]),
                price: num(&o["price"]),
                trigger_price: num(&o["triggerPrice"]),
                reduce_only: o["reduceOnly"].as_bool().unwrap_or(false),
            })
        })
        .collect()
}

fn parse_symbol_rules(result: &Value) -> Result<SymbolRules, ExchangeError> {
    let info = first_in_list(result).ok_or_else(|| ExchangeError::Permanent {
        code: -1,
        message: "instruments-info: symbol not listed".into(),
    })?;
    let rules = SymbolRules {
        tick_size: num(&info["priceFilter"]["tickSize"]),
        qty_step: num(&info["lotSizeFilter"]["qtyStep"]),
        min_qty: num(&info["lotSizeFilter"]["minOrderQty"]),
    };
    if rules.tick_size <= 0.0 || rules.qty_step <= 0.0 {
        return Err(ExchangeError::Permanent {
            code: -1,
            message: format!("instruments-info: unusable filters {:?}", rules),
        });
    }
    Ok(rules)
}

fn order_body(request: &OrderRequest, rules: &SymbolRules) -> Value {
    let mut body = json!({
        "category":    "linear",
        "symbol":      request.symbol,
        "side":        request.side.as_str(),
        "qty":         rules.format_qty(request.qty),
        "reduceOnly":  request.reduce_only,
        "orderLinkId": request.link_id,
        "positionIdx": 0,
    });
    match request.kind {
        OrderKind::Market => {
            body["orderType"] = json!("Market");
        }
        OrderKind::Limit { price } => {
            body["orderType"] = json!("Limit");
            body["price"] = json!(rules.format_price(price));
            body["timeInForce"] = json!("GTC");
        }
        OrderKind::Conditional { trigger_price, trigger_direction } => {
            body["orderType"] = json!("Market");
            body["triggerPrice"] = json!(rules.format_price(trigger_price));
            body["triggerDirection"] = json!(trigger_direction.code());
            body["triggerBy"] = json!("LastPrice");
        }
    }
    body
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Bybit v5 REST client for USDT linear perpetuals. Retries live in the
/// caller's [`RetryPolicy`](crate::retry::RetryPolicy); every method here is a
/// single attempt with a classified error.
pub struct BybitClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    rules: Mutex<HashMap<String, SymbolRules>>,
}

impl BybitClient {
    pub fn new(credentials: Credentials) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(BybitClient {
            client,
            base_url: BYBIT_REST_URL.to_string(),
            api_key: credentials.api_key,
            api_secret: credentials.api_secret,
            rules: Mutex::new(HashMap::new()),
        })
    }

    fn sign(&self, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Permanent { code: -1, message: format!("HMAC key: {}", e) })?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Attach the v5 auth headers; `payload` is the query string or JSON body.
    fn authed(
        &self,
        builder: reqwest::RequestBuilder,
        payload: &str,
    ) -> Result<reqwest::RequestBuilder, ExchangeError> {
        let ts = chrono::Utc::now().timestamp_millis().to_string();
        let signature = self.sign(&format!("{}{}{}{}", ts, self.api_key, RECV_WINDOW_MS, payload))?;
        Ok(builder
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS))
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Value, ExchangeError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        let http_status = resp.status().as_u16();
        match resp.json::<Value>().await {
            Ok(json) => check_response(http_status, json),
            Err(e) => Err(classify_error(-1, http_status, &format!("unparseable body: {}", e))),
        }
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<Value, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        self.send(self.client.get(&url)).await
    }

    async fn signed_get(&self, path: &str, query: &str) -> Result<Value, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let builder = self.authed(self.client.get(&url), query)?;
        self.send(builder).await
    }

    async fn signed_post(&self, path: &str, body: &Value) -> Result<Value, ExchangeError> {
        let body = body.to_string();
        let url = format!("{}{}", self.base_url, path);
        let builder = self
            .authed(self.client.post(&url), &body)?
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        self.send(builder).await
    }

    /// Recover the id of an order whose create call timed out but landed.
    async fn find_by_link_id(&self, symbol: &str, link_id: &str) -> Result<Option<String>, ExchangeError> {
        let query = format!("category=linear&symbol={}&orderLinkId={}", symbol, link_id);
        let result = self.signed_get("/v5/order/realtime", &query).await?;
        Ok(first_in_list(&result)
            .and_then(|o| o["orderId"].as_str())
            .map(str::to_string))
    }

    /// The last `limit` klines, oldest first (public endpoint, max 1000 per page).
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let query = format!(
            "category=linear&symbol={}&interval={}&limit={}",
            symbol,
            interval,
            limit.clamp(1, 1000)
        );
        let result = self.public_get("/v5/market/kline", &query).await?;
        parse_klines(&result)
    }
}

#[async_trait]
impl Exchange for BybitClient {
    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        let rules = self.get_symbol_rules(&request.symbol).await?;
        let body = order_body(request, &rules);
        match self.signed_post("/v5/order/create", &body).await {
            Ok(result) => result["orderId"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| ExchangeError::Transient("order/create: missing orderId".into())),
            // An earlier attempt reached the book before its response was lost.
            Err(ExchangeError::Permanent { code: DUPLICATE_LINK_ID, message }) => {
                match self.find_by_link_id(&request.symbol, &request.link_id).await? {
                    Some(id) => {
                        log::warn!("order {} already on the book (link {})", id, request.link_id);
                        Ok(id)
                    }
                    None => Err(ExchangeError::Permanent { code: DUPLICATE_LINK_ID, message }),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<CancelOutcome, ExchangeError> {
        let body = json!({ "category": "linear", "symbol": symbol, "orderId": order_id });
        match self.signed_post("/v5/order/cancel", &body).await {
            Ok(_) => Ok(CancelOutcome::Cancelled),
            Err(ExchangeError::Permanent { code, message }) if ORDER_GONE_CODES.contains(&code) => {
                log::debug!("cancel {}: {} (retCode={})", order_id, message, code);
                Ok(CancelOutcome::AlreadyGone)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderState>, ExchangeError> {
        let query = format!("category=linear&symbol={}&orderId={}", symbol, order_id);
        let live = self.signed_get("/v5/order/realtime", &query).await?;
        if let Some(order) = first_in_list(&live) {
            return Ok(Some(parse_order_state(order)));
        }
        let history = self.signed_get("/v5/order/history", &query).await?;
        Ok(first_in_list(&history).map(parse_order_state))
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<ExchangePosition>, ExchangeError> {
        let query = format!("category=linear&symbol={}", symbol);
        let result = self.signed_get("/v5/position/list", &query).await?;
        Ok(parse_position(&result))
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let query = format!("category=linear&symbol={}&openOnly=0&limit=50", symbol);
        let result = self.signed_get("/v5/order/realtime", &query).await?;
        Ok(parse_open_orders(&result))
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        if let Ok(cache) = self.rules.lock() {
            if let Some(rules) = cache.get(symbol) {
                return Ok(*rules);
            }
        }
        let query = format!("category=linear&symbol={}", symbol);
        let result = self.public_get("/v5/market/instruments-info", &query).await?;
        let rules = parse_symbol_rules(&result)?;
        log::info!(
            "[{}] tick={} step={} min={}",
            symbol, rules.tick_size, rules.qty_step, rules.min_qty
        );
        if let Ok(mut cache) = self.rules.lock() {
            cache.insert(symbol.to_string(), rules);
        }
        Ok(rules)
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let query = format!("category=linear&symbol={}", symbol);
        let result = self.public_get("/v5/market/tickers", &query).await?;
        let price = first_in_list(&result).map_or(0.0, |t| num(&t["lastPrice"]));
        if price > 0.0 {
            Ok(price)
        } else {
            Err(ExchangeError::Transient(format!("tickers: no last price for {}", symbol)))
        }
    }

    async fn get_wallet_equity(&self) -> Result<f64, ExchangeError> {
        let result = self.signed_get("/v5/account/wallet-balance", "accountType=UNIFIED").await?;
        Ok(first_in_list(&result).map_or(0.0, |w| num(&w["totalEquity"])))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let body = json!({
            "category":     "linear",
            "symbol":       symbol,
            "buyLeverage":  leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self.signed_post("/v5/position/set-leverage", &body).await {
            Ok(_) => Ok(()),
            Err(ExchangeError::Permanent { code: LEVERAGE_NOT_MODIFIED, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
