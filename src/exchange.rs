//! Transport seam between the position engine and a derivatives exchange.
//!
//! The engine only speaks through [`Exchange`]; `bybit_api::BybitClient` is the
//! production implementation and the integration tests plug in a scripted mock.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::types::{
    ExchangePosition, OpenOrder, OrderState, Side, SymbolRules, TriggerDirection,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExchangeError {
    /// Rate limited (retCode=10006 or HTTP 429).
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimit { retry_after: Duration },
    /// Network, timeout, HTTP 5xx, server overload, timestamp skew.
    #[error("transient error: {0}")]
    Transient(String),
    /// Invalid params, insufficient margin, unknown symbol: fatal to the operation.
    #[error("rejected (retCode={code}): {message}")]
    Permanent { code: i64, message: String },
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExchangeError::Permanent { .. })
    }
}

/// Result of a cancel request. Both variants satisfy the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// Already cancelled, filled, or never existed.
    AlreadyGone,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OrderKind {
    Market,
    Limit { price: f64 },
    Conditional { trigger_price: f64, trigger_direction: TriggerDirection },
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub kind: OrderKind,
    pub reduce_only: bool,
    /// Client order id. Reused across retries so the exchange rejects a duplicate.
    pub link_id: String,
}

impl OrderRequest {
    fn new(symbol: &str, side: Side, qty: f64, kind: OrderKind, reduce_only: bool) -> Self {
        OrderRequest {
            symbol: symbol.to_string(),
            side,
            qty,
            kind,
            reduce_only,
            link_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn market(symbol: &str, side: Side, qty: f64, reduce_only: bool) -> Self {
        Self::new(symbol, side, qty, OrderKind::Market, reduce_only)
    }

    pub fn limit(symbol: &str, side: Side, qty: f64, price: f64, reduce_only: bool) -> Self {
        Self::new(symbol, side, qty, OrderKind::Limit { price }, reduce_only)
    }

    /// Market order that fires once `trigger_price` is crossed in `trigger_direction`.
    pub fn conditional(
        symbol: &str,
        side: Side,
        qty: f64,
        trigger_price: f64,
        trigger_direction: TriggerDirection,
        reduce_only: bool,
    ) -> Self {
        Self::new(
            symbol,
            side,
            qty,
            OrderKind::Conditional { trigger_price, trigger_direction },
            reduce_only,
        )
    }
}

#[async_trait]
pub trait Exchange: Send + Sync {
    /// Returns the exchange order id.
    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str)
        -> Result<CancelOutcome, ExchangeError>;

    /// `None` while the exchange has no record of the order yet (eventual consistency).
    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderState>, ExchangeError>;

    /// `None` when flat.
    async fn get_position(&self, symbol: &str) -> Result<Option<ExchangePosition>, ExchangeError>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError>;

    async fn get_current_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Total equity of the trading account in USDT.
    async fn get_wallet_equity(&self) -> Result<f64, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_permanent_errors_are_final() {
        assert!(ExchangeError::Transient("reset".into()).is_retryable());
        assert!(ExchangeError::RateLimit { retry_after: Duration::from_secs(1) }.is_retryable());
        assert!(!ExchangeError::Permanent { code: 10001, message: "bad qty".into() }.is_retryable());
    }

    #[test]
    fn every_request_gets_its_own_link_id() {
        let a = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, false);
        let b = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, false);
        assert_ne!(a.link_id, b.link_id);
        assert_eq!(a.link_id.len(), 32);
    }
}
