#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sr_zone_trader::config::EngineConfig;
use sr_zone_trader::exchange::{CancelOutcome, Exchange, ExchangeError, OrderKind, OrderRequest};
use sr_zone_trader::position_engine::PositionEngine;
use sr_zone_trader::types::{
    Direction, ExchangePosition, OpenOrder, OrderState, OrderStatus, OrderUpdate, Signal,
    SymbolRules,
};

pub const SYMBOL: &str = "BTCUSDT";

#[derive(Clone, Debug)]
pub struct MockOrder {
    pub id: String,
    pub request: OrderRequest,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_price: f64,
    /// Status queries left before a resting market order fills.
    pub polls_left: u32,
}

impl MockOrder {
    fn is_live(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::New | OrderStatus::Untriggered | OrderStatus::PartiallyFilled
        )
    }
}

pub struct MockState {
    pub price: f64,
    pub equity: f64,
    pub rules: SymbolRules,
    pub position: Option<ExchangePosition>,
    pub orders: Vec<MockOrder>,
    pub leverage: Option<u32>,
    /// Market orders fill instantly at `price` when set.
    pub fill_market_orders: bool,
    pub reject_conditional: bool,
    pub reject_limits: bool,
    /// The next N placements fail with a transient error.
    pub transient_place_failures: u32,
    /// The next N cancels fail with a transient error.
    pub transient_cancel_failures: u32,
    /// The next N position reads fail with a transient error.
    pub position_read_failures: u32,
    /// Market orders rest and fill on the Nth status query instead of at once.
    pub market_fill_after_polls: u32,
    pub calls: Vec<String>,
    next_id: u64,
    clock: i64,
}

pub struct MockExchange {
    pub state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new(price: f64) -> Self {
        MockExchange {
            state: Mutex::new(MockState {
                price,
                equity: 10_000.0,
                rules: SymbolRules { tick_size: 0.01, qty_step: 0.001, min_qty: 0.001 },
                position: None,
                orders: Vec::new(),
                leverage: None,
                fill_market_orders: true,
                reject_conditional: false,
                reject_limits: false,
                transient_place_failures: 0,
                transient_cancel_failures: 0,
                position_read_failures: 0,
                market_fill_after_polls: 0,
                calls: Vec::new(),
                next_id: 1,
                clock: 1_000,
            }),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut st = self.state.lock().unwrap();
        f(&mut st)
    }

    pub fn order(&self, id: &str) -> MockOrder {
        self.with(|st| st.orders.iter().find(|o| o.id == id).cloned().unwrap())
    }

    pub fn live_orders(&self) -> Vec<MockOrder> {
        self.with(|st| st.orders.iter().filter(|o| o.is_live()).cloned().collect())
    }

    pub fn market_orders(&self) -> Vec<MockOrder> {
        self.with(|st| {
            st.orders
                .iter()
                .filter(|o| o.request.kind == OrderKind::Market)
                .cloned()
                .collect()
        })
    }

    pub fn calls(&self, prefix: &str) -> usize {
        self.with(|st| st.calls.iter().filter(|c| c.starts_with(prefix)).count())
    }

    /// Insert a resting order as if placed by an earlier process.
    pub fn seed_order(&self, request: OrderRequest) -> String {
        self.with(|st| {
            let id = st.next_order_id();
            let status = match request.kind {
                OrderKind::Conditional { .. } => OrderStatus::Untriggered,
                _ => OrderStatus::New,
            };
            st.orders.push(MockOrder {
                id: id.clone(),
                request,
                status,
                filled_qty: 0.0,
                avg_price: 0.0,
                polls_left: 0,
            });
            id
        })
    }

    /// Fill a resting order at its own price and return the push notification.
    pub fn fill(&self, id: &str) -> OrderUpdate {
        self.with(|st| {
            let idx = st.orders.iter().position(|o| o.id == id).unwrap();
            let price = match st.orders[idx].request.kind {
                OrderKind::Limit { price } => price,
                OrderKind::Conditional { trigger_price, .. } => trigger_price,
                OrderKind::Market => st.price,
            };
            let request = st.orders[idx].request.clone();
            st.apply_fill(&request, price);
            let order = &mut st.orders[idx];
            order.status = OrderStatus::Filled;
            order.filled_qty = request.qty;
            order.avg_price = price;
            st.update_for(id, OrderStatus::Filled)
        })
    }

    /// Flip an order's status without touching the position.
    pub fn set_status(&self, id: &str, status: OrderStatus) -> OrderUpdate {
        self.with(|st| {
            if let Some(o) = st.orders.iter_mut().find(|o| o.id == id) {
                o.status = status.clone();
            }
            st.update_for(id, status)
        })
    }
}

impl MockState {
    fn next_order_id(&mut self) -> String {
        let id = format!("ord-{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn update_for(&mut self, id: &str, status: OrderStatus) -> OrderUpdate {
        self.clock += 1;
        let (cum, avg) = self
            .orders
            .iter()
            .find(|o| o.id == id)
            .map_or((0.0, 0.0), |o| (o.filled_qty, o.avg_price));
        OrderUpdate {
            order_id: id.to_string(),
            symbol: SYMBOL.to_string(),
            status,
            updated_time: self.clock,
            cum_exec_qty: cum,
            avg_price: avg,
        }
    }

    fn apply_fill(&mut self, request: &OrderRequest, price: f64) {
        let opens = match &self.position {
            Some(p) => p.side == request.side,
            None => !request.reduce_only,
        };
        if opens {
            match self.position.as_mut() {
                Some(p) => {
                    let cost = p.avg_price * p.size + price * request.qty;
                    p.size += request.qty;
                    p.avg_price = cost / p.size;
                }
                None => {
                    self.position =
                        Some(ExchangePosition { side: request.side, size: request.qty, avg_price: price })
                }
            }
        } else if let Some(p) = self.position.as_mut() {
            p.size = ((p.size - request.qty) * 1e9).round() / 1e9;
            if p.size <= 0.0 {
                self.position = None;
            }
        }
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("place {:?}", request.kind));
        if st.transient_place_failures > 0 {
            st.transient_place_failures -= 1;
            return Err(ExchangeError::Transient("connection reset".into()));
        }
        let rejected = match request.kind {
            OrderKind::Conditional { .. } => st.reject_conditional,
            OrderKind::Limit { .. } => st.reject_limits,
            OrderKind::Market => false,
        };
        if rejected {
            return Err(ExchangeError::Permanent { code: 10001, message: "params error".into() });
        }
        // Same client id twice: the exchange refuses the duplicate.
        if st.orders.iter().any(|o| o.request.link_id == request.link_id) {
            return Err(ExchangeError::Permanent { code: 110072, message: "duplicate orderLinkId".into() });
        }

        let id = st.next_order_id();
        let mut order = MockOrder {
            id: id.clone(),
            request: request.clone(),
            status: OrderStatus::New,
            filled_qty: 0.0,
            avg_price: 0.0,
            polls_left: 0,
        };
        match request.kind {
            OrderKind::Market if st.fill_market_orders && st.market_fill_after_polls > 0 => {
                order.polls_left = st.market_fill_after_polls;
            }
            OrderKind::Market if st.fill_market_orders => {
                let price = st.price;
                st.apply_fill(request, price);
                order.status = OrderStatus::Filled;
                order.filled_qty = request.qty;
                order.avg_price = price;
            }
            OrderKind::Conditional { .. } => order.status = OrderStatus::Untriggered,
            _ => {}
        }
        st.orders.push(order);
        Ok(id)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<CancelOutcome, ExchangeError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("cancel {}", order_id));
        if st.transient_cancel_failures > 0 {
            st.transient_cancel_failures -= 1;
            return Err(ExchangeError::Transient("timeout".into()));
        }
        match st.orders.iter_mut().find(|o| o.id == order_id) {
            Some(o) if o.is_live() => {
                o.status = OrderStatus::Cancelled;
                Ok(CancelOutcome::Cancelled)
            }
            _ => Ok(CancelOutcome::AlreadyGone),
        }
    }

    async fn get_order_status(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderState>, ExchangeError> {
        let mut st = self.state.lock().unwrap();
        let resting = st
            .orders
            .iter()
            .position(|o| o.id == order_id && o.polls_left > 0 && o.status == OrderStatus::New);
        if let Some(idx) = resting {
            st.orders[idx].polls_left -= 1;
            if st.orders[idx].polls_left == 0 {
                let (request, price) = (st.orders[idx].request.clone(), st.price);
                st.apply_fill(&request, price);
                let order = &mut st.orders[idx];
                order.status = OrderStatus::Filled;
                order.filled_qty = request.qty;
                order.avg_price = price;
            }
        }
        Ok(st.orders.iter().find(|o| o.id == order_id).map(|o| OrderState {
            status: o.status.clone(),
            filled_qty: o.filled_qty,
            avg_price: o.avg_price,
        }))
    }

    async fn get_position(&self, _symbol: &str) -> Result<Option<ExchangePosition>, ExchangeError> {
        let mut st = self.state.lock().unwrap();
        if st.position_read_failures > 0 {
            st.position_read_failures -= 1;
            return Err(ExchangeError::Transient("read timeout".into()));
        }
        Ok(st.position.clone())
    }

    async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let st = self.state.lock().unwrap();
        Ok(st
            .orders
            .iter()
            .filter(|o| o.is_live())
            .map(|o| {
                let (price, trigger_price) = match o.request.kind {
                    OrderKind::Limit { price } => (price, 0.0),
                    OrderKind::Conditional { trigger_price, .. } => (0.0, trigger_price),
                    OrderKind::Market => (0.0, 0.0),
                };
                OpenOrder {
                    order_id: o.id.clone(),
                    side: o.request.side,
                    qty: o.request.qty,
                    price,
                    trigger_price,
                    reduce_only: o.request.reduce_only,
                }
            })
            .collect())
    }

    async fn get_symbol_rules(&self, _symbol: &str) -> Result<SymbolRules, ExchangeError> {
        Ok(self.state.lock().unwrap().rules)
    }

    async fn get_current_price(&self, _symbol: &str) -> Result<f64, ExchangeError> {
        Ok(self.state.lock().unwrap().price)
    }

    async fn get_wallet_equity(&self) -> Result<f64, ExchangeError> {
        Ok(self.state.lock().unwrap().equity)
    }

    async fn set_leverage(&self, _symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.state.lock().unwrap().leverage = Some(leverage);
        Ok(())
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig { fill_poll_attempts: 3, ..EngineConfig::default() }.without_delays()
}

pub async fn reconciled_engine(
    exchange: Arc<MockExchange>,
    cfg: EngineConfig,
) -> PositionEngine<MockExchange> {
    let engine = PositionEngine::new(exchange, SYMBOL, cfg);
    engine.reconcile().await.unwrap();
    engine
}

/// Long at 100 with SL 98, TP1 102, TP2 103.
pub fn long_signal() -> Signal {
    Signal {
        direction: Direction::Long,
        kind: "bullish_engulfing".into(),
        timestamp: 0,
        entry: 100.0,
        stop_loss: 98.0,
        take_profit_1: 102.0,
        take_profit_2: 103.0,
    }
}

pub fn short_signal() -> Signal {
    Signal {
        direction: Direction::Short,
        kind: "bearish_marubozu".into(),
        timestamp: 0,
        entry: 100.0,
        stop_loss: 102.0,
        take_profit_1: 98.0,
        take_profit_2: 97.0,
    }
}
