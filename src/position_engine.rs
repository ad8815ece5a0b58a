//! Lifecycle of the single position the bot may hold on its instrument.
//!
//! ```text
//! None -> EntryPending -> OpenFull -> (TP1) -> OpenPartial -> Closed -> None
//! ```
//!
//! All state sits behind one async mutex shared by the signal path
//! (`try_reserve_entry` / `open_reserved`) and the order-update consumer
//! (`handle_order_update`). The entry order is placed and polled without the
//! lock; the lock is taken again before the position record and its protective
//! legs are created, so a notification can never see a half-built position.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::config::EngineConfig;
use crate::exchange::{CancelOutcome, Exchange, ExchangeError, OrderRequest};
use crate::order_updates::RecentUpdates;
use crate::retry::Attempt;
use crate::types::{
    floor_to_step, ClosedPosition, CloseReason, Direction, ExchangePosition, Leg, OpenOrder,
    OrderState, OrderStatus, OrderUpdate, Position, Side, Signal, SymbolRules, TpMode,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    None,
    EntryPending,
    OpenFull,
    OpenPartial,
    /// Transient: legs are being torn down before the record moves to history.
    Closed,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine has not reconciled with the exchange yet")]
    NotReconciled,
    #[error("wallet equity {equity:.2} USDT below required margin {required:.2} USDT")]
    InsufficientBalance { equity: f64, required: f64 },
    #[error("quantity {qty} below exchange minimum {min}")]
    QuantityBelowMinimum { qty: f64, min: f64 },
    #[error("entry order {0} was not filled")]
    EntryNotFilled(String),
    #[error("{leg:?} leg could not be placed: {source}")]
    LegPlacement { leg: Leg, source: ExchangeError },
    #[error("close order {0} was not filled")]
    CloseNotFilled(String),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

#[derive(Clone, Debug)]
pub enum EngineEvent {
    PositionOpened(Position),
    PartialClose { position: Position, price: f64, qty_closed: f64 },
    PositionClosed(ClosedPosition),
    Alert(String),
}

struct EngineState {
    phase: Phase,
    tp_mode: TpMode,
    active: Option<Position>,
    closed: Vec<ClosedPosition>,
    /// Entry order placed but not yet confirmed.
    pending_entry: Option<String>,
    recent: RecentUpdates,
    reconciled: bool,
    needs_reconcile: bool,
}

pub struct PositionEngine<E: Exchange> {
    exchange: Arc<E>,
    symbol: String,
    cfg: EngineConfig,
    state: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

impl<E: Exchange> fmt::Debug for PositionEngine<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PositionEngine").field("symbol", &self.symbol).finish()
    }
}

/// Split a filled quantity into TP1 (two thirds) and TP2 (the rest). Falls back
/// to a single full-size TP when either half would not clear the minimum lot.
pub fn split_take_profit(qty: f64, rules: &SymbolRules, mode: TpMode) -> (f64, Option<f64>) {
    if mode == TpMode::Single {
        return (qty, None);
    }
    let tp1 = floor_to_step(qty * 2.0 / 3.0, rules.qty_step);
    let tp2 = floor_to_step(qty - tp1, rules.qty_step);
    if tp1 >= rules.min_qty && tp2 >= rules.min_qty {
        (tp1, Some(tp2))
    } else {
        (qty, None)
    }
}

/// Stop that locks in the entry plus the round-trip fee.
pub fn breakeven_stop(direction: Direction, entry: f64, commission_rate: f64) -> f64 {
    entry * (1.0 + direction.sign() * commission_rate)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl<E: Exchange> PositionEngine<E> {
    pub fn new(exchange: Arc<E>, symbol: &str, cfg: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = EngineState {
            phase: Phase::None,
            tp_mode: cfg.tp_mode,
            active: None,
            closed: Vec::new(),
            pending_entry: None,
            recent: RecentUpdates::new(cfg.dedup_capacity),
            reconciled: false,
            needs_reconcile: false,
        };
        PositionEngine {
            exchange,
            symbol: symbol.to_string(),
            cfg,
            state: Mutex::new(state),
            events,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    pub async fn set_tp_mode(&self, mode: TpMode) {
        let mut st = self.state.lock().await;
        log::info!("[{}] TP mode {:?} -> {:?} (applies to the next entry)", self.symbol, st.tp_mode, mode);
        st.tp_mode = mode;
    }

    pub async fn tp_mode(&self) -> TpMode {
        self.state.lock().await.tp_mode
    }

    pub async fn active_positions(&self) -> Vec<Position> {
        self.state.lock().await.active.iter().cloned().collect()
    }

    pub async fn closed_positions(&self) -> Vec<ClosedPosition> {
        self.state.lock().await.closed.clone()
    }

    fn emit(&self, event: EngineEvent) {
        // No subscriber is fine.
        let _ = self.events.send(event);
    }

    fn alert(&self, message: String) {
        log::warn!("[{}] {}", self.symbol, message);
        self.emit(EngineEvent::Alert(message));
    }

    fn transition(&self, st: &mut EngineState, to: Phase) {
        if st.phase != to {
            log::info!("[{}] {:?} -> {:?}", self.symbol, st.phase, to);
            st.phase = to;
        }
    }

    // ── Exchange helpers ─────────────────────────────────────────────────────

    async fn place(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        let label = format!("[{}] place {:?} {}", self.symbol, request.kind, request.side);
        let id = self
            .cfg
            .placement_policy()
            .run(&label, move || self.exchange.place_order(request))
            .await?;
        log::info!(
            "[{}] order {} placed: {} {:?} qty={} reduceOnly={} link={}",
            self.symbol, id, request.side, request.kind, request.qty, request.reduce_only, request.link_id
        );
        Ok(id)
    }

    /// Cancel that treats "already cancelled / filled / unknown" as success.
    async fn cancel(&self, order_id: &str) -> Result<CancelOutcome, ExchangeError> {
        let label = format!("[{}] cancel {}", self.symbol, order_id);
        let outcome = self
            .cfg
            .cancel_policy()
            .run(&label, move || self.exchange.cancel_order(&self.symbol, order_id))
            .await?;
        match outcome {
            CancelOutcome::Cancelled => log::info!("[{}] order {} cancelled", self.symbol, order_id),
            CancelOutcome::AlreadyGone => {
                log::info!("[{}] order {} already gone", self.symbol, order_id)
            }
        }
        Ok(outcome)
    }

    async fn read_position(&self) -> Result<Option<ExchangePosition>, ExchangeError> {
        let label = format!("[{}] position", self.symbol);
        self.cfg.read_policy().run(&label, move || self.exchange.get_position(&self.symbol)).await
    }

    async fn read_price(&self) -> Result<f64, ExchangeError> {
        let label = format!("[{}] price", self.symbol);
        self.cfg
            .read_policy()
            .run(&label, move || self.exchange.get_current_price(&self.symbol))
            .await
    }

    async fn read_rules(&self) -> Result<SymbolRules, ExchangeError> {
        let label = format!("[{}] rules", self.symbol);
        self.cfg
            .read_policy()
            .run(&label, move || self.exchange.get_symbol_rules(&self.symbol))
            .await
    }

    async fn read_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        let label = format!("[{}] open orders", self.symbol);
        self.cfg
            .read_policy()
            .run(&label, move || self.exchange.get_open_orders(&self.symbol))
            .await
    }

    /// Poll until the order is filled or dead. `None` if it never settled.
    async fn wait_for_fill(&self, order_id: &str) -> Option<OrderState> {
        let label = format!("[{}] fill {}", self.symbol, order_id);
        self.cfg
            .fill_wait_policy()
            .poll(&label, move || async move {
                match self.exchange.get_order_status(&self.symbol, order_id).await {
                    Ok(Some(s)) if s.status == OrderStatus::Filled || s.status.is_dead() => {
                        Attempt::Done(s)
                    }
                    Ok(Some(s)) => Attempt::Retry(format!("status {:?}", s.status)),
                    Ok(None) => Attempt::Retry("order not visible yet".into()),
                    Err(e) => Attempt::Retry(e.to_string()),
                }
            })
            .await
    }

    /// Reduce-only market order for `qty` against `direction`.
    async fn flatten(&self, direction: Direction, qty: f64) -> Result<String, ExchangeError> {
        let request = OrderRequest::market(&self.symbol, direction.exit_side(), qty, true);
        self.place(&request).await
    }

    /// Cancel every id, logging the ones that could not be confirmed gone.
    /// Returns `false` if any id had to be abandoned.
    async fn cancel_all(&self, ids: impl IntoIterator<Item = String>) -> bool {
        let mut clean = true;
        for id in ids {
            if let Err(e) = self.cancel(&id).await {
                log::warn!("[{}] abandoning order {}: cancel failed: {}", self.symbol, id, e);
                clean = false;
            }
        }
        clean
    }

    // ── Entry ────────────────────────────────────────────────────────────────

    /// Claim the single position slot. `Ok(false)` when a position is open or
    /// an entry is already in flight; the caller drops the signal.
    pub async fn try_reserve_entry(&self) -> Result<bool, EngineError> {
        let mut st = self.state.lock().await;
        self.reserve_locked(&mut st).await
    }

    /// Same as [`try_reserve_entry`](Self::try_reserve_entry), but `Ok(false)`
    /// right away while another transition (close, TP1 handling, resync) holds
    /// the engine.
    pub async fn reserve_if_idle(&self) -> Result<bool, EngineError> {
        let Ok(mut st) = self.state.try_lock() else {
            log::info!("[{}] engine busy, entry signal dropped", self.symbol);
            return Ok(false);
        };
        self.reserve_locked(&mut st).await
    }

    async fn reserve_locked(&self, st: &mut EngineState) -> Result<bool, EngineError> {
        if !st.reconciled {
            return Err(EngineError::NotReconciled);
        }
        if st.needs_reconcile {
            self.reconcile_locked(st).await?;
        }
        if st.phase != Phase::None || st.active.is_some() {
            log::info!("[{}] slot busy ({:?}), entry signal dropped", self.symbol, st.phase);
            return Ok(false);
        }
        self.transition(st, Phase::EntryPending);
        Ok(true)
    }

    /// Reserve and open in one call. `Ok(None)` when the slot is taken.
    pub async fn open_position(
        &self,
        signal: &Signal,
        leverage: u32,
        notional: f64,
    ) -> Result<Option<Position>, EngineError> {
        if !self.try_reserve_entry().await? {
            return Ok(None);
        }
        self.open_reserved(signal, leverage, notional).await.map(Some)
    }

    /// Run the entry for a slot claimed with [`try_reserve_entry`](Self::try_reserve_entry).
    /// On any failure the slot is released and no partial state is kept.
    pub async fn open_reserved(
        &self,
        signal: &Signal,
        leverage: u32,
        notional: f64,
    ) -> Result<Position, EngineError> {
        match self.execute_entry(signal, leverage, notional).await {
            Ok(position) => Ok(position),
            Err(e) => {
                let mut st = self.state.lock().await;
                st.pending_entry = None;
                if st.phase == Phase::EntryPending {
                    self.transition(&mut st, Phase::None);
                }
                log::error!("[{}] {} entry failed: {}", self.symbol, signal.direction, e);
                Err(e)
            }
        }
    }

    async fn execute_entry(
        &self,
        signal: &Signal,
        leverage: u32,
        notional: f64,
    ) -> Result<Position, EngineError> {
        let rules = self.read_rules().await?;
        let label = format!("[{}] wallet", self.symbol);
        let equity = self
            .cfg
            .read_policy()
            .run(&label, move || self.exchange.get_wallet_equity())
            .await?;
        if equity < notional {
            return Err(EngineError::InsufficientBalance { equity, required: notional });
        }

        let label = format!("[{}] leverage", self.symbol);
        self.cfg
            .placement_policy()
            .run(&label, move || self.exchange.set_leverage(&self.symbol, leverage))
            .await?;

        let price = self.read_price().await?;
        let raw_qty = floor_to_step(notional * leverage as f64 / price, rules.qty_step);
        if raw_qty < rules.min_qty && rules.min_qty * price / leverage as f64 > equity {
            return Err(EngineError::QuantityBelowMinimum { qty: raw_qty, min: rules.min_qty });
        }
        let qty = rules.clamp_qty(raw_qty);

        let request = OrderRequest::market(&self.symbol, signal.direction.entry_side(), qty, false);
        let entry_id = self.place(&request).await?;
        self.state.lock().await.pending_entry = Some(entry_id.clone());

        let fill = self.wait_for_fill(&entry_id).await;
        let filled = match fill {
            Some(s) if s.filled_qty > 0.0 => s,
            other => {
                log::warn!("[{}] entry {} not filled: {:?}", self.symbol, entry_id, other);
                self.abandon_entry(&entry_id, signal.direction).await;
                return Err(EngineError::EntryNotFilled(entry_id));
            }
        };

        let mut st = self.state.lock().await;
        st.pending_entry = None;
        let entry_price = if filled.avg_price > 0.0 { filled.avg_price } else { price };
        let mut position = Position {
            order_id: entry_id.clone(),
            symbol: self.symbol.clone(),
            direction: signal.direction,
            entry: entry_price,
            stop_loss: rules.floor_price(signal.stop_loss),
            take_profit_1: rules.floor_price(signal.take_profit_1),
            take_profit_2: rules.floor_price(signal.take_profit_2),
            quantity: filled.filled_qty,
            initial_quantity: filled.filled_qty,
            tp1_hit: false,
            sl_order_id: None,
            tp1_order_id: None,
            tp2_order_id: None,
            active_order_ids: BTreeSet::new(),
            leg_fills: HashMap::new(),
            realized_profit: 0.0,
            closed: false,
            opened_at: now_ms(),
        };

        if let Err(e) = self.attach_legs(&mut position, &rules, st.tp_mode).await {
            let legs = std::mem::take(&mut position.active_order_ids);
            let cancelled = self.cancel_all(legs).await;
            let flattened = self.flatten(position.direction, position.quantity).await;
            if let Err(fe) = &flattened {
                self.alert(format!("entry {} rollback could not flatten: {}", entry_id, fe));
            }
            if !cancelled || flattened.is_err() {
                st.needs_reconcile = true;
            }
            self.transition(&mut st, Phase::None);
            return Err(e);
        }

        log::info!(
            "[{}] {} opened qty={} @ {:.4} SL={:?} TP1={:?} TP2={:?}",
            self.symbol,
            position.direction,
            position.quantity,
            position.entry,
            position.sl_order_id,
            position.tp1_order_id,
            position.tp2_order_id
        );
        st.active = Some(position.clone());
        self.transition(&mut st, Phase::OpenFull);
        drop(st);
        self.emit(EngineEvent::PositionOpened(position.clone()));
        Ok(position)
    }

    /// Entry never confirmed: cancel it and undo whatever part did fill.
    async fn abandon_entry(&self, entry_id: &str, direction: Direction) {
        let mut uncertain = self.cancel(entry_id).await.is_err();
        match self.read_position().await {
            Ok(Some(p)) if p.size > 0.0 && p.side == direction.entry_side() => {
                if let Err(e) = self.flatten(direction, p.size).await {
                    self.alert(format!("unconfirmed entry {} left {} open: {}", entry_id, p.size, e));
                    uncertain = true;
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("[{}] position check after unfilled entry failed: {}", self.symbol, e);
                uncertain = true;
            }
        }
        if uncertain {
            self.state.lock().await.needs_reconcile = true;
        }
    }

    /// Stop-loss, then TP1, then TP2. SL or TP1 failing is fatal to the entry;
    /// ids placed so far stay in `active_order_ids` for the caller to roll back.
    async fn attach_legs(
        &self,
        pos: &mut Position,
        rules: &SymbolRules,
        mode: TpMode,
    ) -> Result<(), EngineError> {
        let exit = pos.direction.exit_side();

        let sl = OrderRequest::conditional(
            &self.symbol,
            exit,
            pos.quantity,
            pos.stop_loss,
            pos.direction.stop_trigger(),
            true,
        );
        let sl_id = self
            .place(&sl)
            .await
            .map_err(|source| EngineError::LegPlacement { leg: Leg::StopLoss, source })?;
        pos.sl_order_id = Some(sl_id.clone());
        pos.active_order_ids.insert(sl_id);

        let (tp1_qty, tp2_qty) = split_take_profit(pos.quantity, rules, mode);
        let tp1 = OrderRequest::limit(&self.symbol, exit, tp1_qty, pos.take_profit_1, true);
        let tp1_id = self
            .place(&tp1)
            .await
            .map_err(|source| EngineError::LegPlacement { leg: Leg::TakeProfit1, source })?;
        pos.tp1_order_id = Some(tp1_id.clone());
        pos.active_order_ids.insert(tp1_id);

        if let Some(qty) = tp2_qty {
            let tp2 = OrderRequest::limit(&self.symbol, exit, qty, pos.take_profit_2, true);
            match self.place(&tp2).await {
                Ok(id) => {
                    pos.tp2_order_id = Some(id.clone());
                    pos.active_order_ids.insert(id);
                }
                Err(e) => self.alert(format!(
                    "TP2 leg not placed ({}); position keeps SL and TP1 only",
                    e
                )),
            }
        }
        Ok(())
    }

    // ── Notifications ────────────────────────────────────────────────────────

    /// Drain the private order stream until the sender side closes.
    pub async fn run_order_updates(&self, mut updates: mpsc::Receiver<OrderUpdate>) {
        while let Some(update) = updates.recv().await {
            self.handle_order_update(update).await;
        }
        log::info!("[{}] order update stream closed", self.symbol);
    }

    pub async fn handle_order_update(&self, update: OrderUpdate) {
        if update.symbol != self.symbol {
            log::debug!("[{}] ignoring update for {}", self.symbol, update.symbol);
            return;
        }
        let mut st = self.state.lock().await;
        if !st.recent.insert(&update.order_id, update.updated_time) {
            log::debug!(
                "[{}] duplicate update {} @{} dropped",
                self.symbol, update.order_id, update.updated_time
            );
            return;
        }
        if st.needs_reconcile {
            if let Err(e) = self.reconcile_locked(&mut st).await {
                log::error!("[{}] reconcile before update failed: {}", self.symbol, e);
            }
        }
        if st.pending_entry.as_deref() == Some(update.order_id.as_str()) {
            log::debug!("[{}] entry {} is {:?}", self.symbol, update.order_id, update.status);
            return;
        }

        let leg = match st.active.as_ref() {
            Some(pos) if pos.active_order_ids.contains(&update.order_id) => pos.leg_of(&update.order_id),
            Some(pos) if pos.order_id == update.order_id => Some(Leg::Entry),
            _ => None,
        };
        let Some(leg) = leg else {
            log::warn!(
                "[{}] update for untracked order {} ({:?}) ignored",
                self.symbol, update.order_id, update.status
            );
            return;
        };

        match (leg, &update.status) {
            (Leg::Entry, _) => {
                log::debug!("[{}] entry {} is {:?}", self.symbol, update.order_id, update.status)
            }
            (_, OrderStatus::PartiallyFilled) => {
                if let Some(pos) = st.active.as_mut() {
                    pos.leg_fills.insert(update.order_id.clone(), update.cum_exec_qty);
                }
                log::info!(
                    "[{}] {:?} {} partially filled: {}",
                    self.symbol, leg, update.order_id, update.cum_exec_qty
                );
            }
            (Leg::StopLoss, OrderStatus::Filled) => {
                self.finalize_close(&mut st, CloseReason::StopLoss, Some(update.avg_price), &update.order_id)
                    .await;
            }
            (Leg::TakeProfit1, OrderStatus::Filled) => {
                let has_tp2 = st.active.as_ref().map_or(false, |p| p.tp2_order_id.is_some() && !p.tp1_hit);
                if has_tp2 {
                    self.on_tp1_partial(&mut st, &update).await;
                } else {
                    self.finalize_close(&mut st, CloseReason::TakeProfit, None, &update.order_id).await;
                }
            }
            (Leg::TakeProfit2, OrderStatus::Filled) => {
                self.finalize_close(&mut st, CloseReason::TakeProfit2, Some(update.avg_price), &update.order_id)
                    .await;
            }
            (_, status) if status.is_dead() => {
                if let Some(pos) = st.active.as_mut() {
                    pos.active_order_ids.remove(&update.order_id);
                    match leg {
                        Leg::StopLoss => pos.sl_order_id = None,
                        Leg::TakeProfit1 => pos.tp1_order_id = None,
                        Leg::TakeProfit2 => pos.tp2_order_id = None,
                        Leg::Entry => {}
                    }
                }
                if matches!(leg, Leg::StopLoss | Leg::TakeProfit1) {
                    st.needs_reconcile = true;
                }
                self.alert(format!("{:?} order {} went {:?} unexpectedly", leg, update.order_id, status));
            }
            (_, status) => {
                log::debug!("[{}] {:?} {} is {:?}", self.symbol, leg, update.order_id, status)
            }
        }
    }

    /// TP1 filled with TP2 still working: move the stop to breakeven plus fees
    /// for whatever size the exchange says is left.
    async fn on_tp1_partial(&self, st: &mut EngineState, update: &OrderUpdate) {
        let Some(pos) = st.active.as_mut() else { return };
        pos.active_order_ids.remove(&update.order_id);
        pos.tp1_order_id = None;
        pos.tp1_hit = true;
        let fill_price = if update.avg_price > 0.0 { update.avg_price } else { pos.take_profit_1 };

        if let Some(old_sl) = pos.sl_order_id.clone() {
            if let Err(e) = self.cancel(&old_sl).await {
                // The old stop still covers the remainder; leave it and resync.
                pos.book_partial(fill_price, update.cum_exec_qty);
                st.needs_reconcile = true;
                self.alert(format!("TP1 filled but old stop {} not cancelled: {}", old_sl, e));
                return;
            }
            pos.active_order_ids.remove(&old_sl);
            pos.sl_order_id = None;
        }
        // A resync from here on re-arms the stop at breakeven.
        pos.stop_loss = breakeven_stop(pos.direction, pos.entry, self.cfg.commission_rate);

        let remaining = match self.read_position().await {
            Ok(Some(p)) if p.size > 0.0 => p.size,
            Ok(_) => {
                log::info!("[{}] nothing left after TP1, closing out", self.symbol);
                self.finalize_close(st, CloseReason::TakeProfit, Some(update.avg_price), &update.order_id)
                    .await;
                return;
            }
            Err(e) => {
                pos.book_partial(fill_price, update.cum_exec_qty);
                st.needs_reconcile = true;
                self.alert(format!("TP1 filled but position size unreadable: {}; unprotected until resync", e));
                return;
            }
        };
        let qty_closed = (pos.quantity - remaining).max(0.0);
        pos.book_partial(fill_price, qty_closed);
        pos.quantity = remaining;

        let rules = match self.read_rules().await {
            Ok(r) => r,
            Err(e) => {
                st.needs_reconcile = true;
                self.alert(format!("TP1 filled but symbol rules unreadable: {}", e));
                return;
            }
        };
        let Some(pos) = st.active.as_mut() else { return };
        let stop = rules.floor_price(pos.stop_loss);
        pos.stop_loss = stop;
        let request = OrderRequest::conditional(
            &self.symbol,
            pos.direction.exit_side(),
            floor_to_step(remaining, rules.qty_step),
            stop,
            pos.direction.stop_trigger(),
            true,
        );

        match self.place(&request).await {
            Ok(id) => {
                pos.sl_order_id = Some(id.clone());
                pos.active_order_ids.insert(id);
            }
            Err(e) => {
                st.needs_reconcile = true;
                self.alert(format!("breakeven stop not placed: {}; remainder unprotected", e));
            }
        }

        let Some(pos) = st.active.clone() else { return };
        log::info!(
            "[{}] TP1 hit: closed {} @ {:.4}, {} left, stop -> {:.4}",
            self.symbol, qty_closed, fill_price, remaining, stop
        );
        self.transition(st, Phase::OpenPartial);
        self.emit(EngineEvent::PartialClose { position: pos, price: fill_price, qty_closed });
    }

    /// Tear down the remaining legs, flatten any leftover size, move the
    /// position to history and free the slot.
    async fn finalize_close(
        &self,
        st: &mut EngineState,
        reason: CloseReason,
        fill_price: Option<f64>,
        filled_order: &str,
    ) {
        let Some(mut pos) = st.active.take() else { return };
        self.transition(st, Phase::Closed);

        let leftovers: Vec<String> = std::mem::take(&mut pos.active_order_ids)
            .into_iter()
            .filter(|id| id != filled_order)
            .collect();
        if !self.cancel_all(leftovers).await {
            st.needs_reconcile = true;
        }

        match self.read_position().await {
            Ok(Some(p)) if p.size > 0.0 && p.side == pos.direction.entry_side() => {
                log::warn!("[{}] {} still open after {}, flattening", self.symbol, p.size, reason);
                if let Err(e) = self.flatten(pos.direction, p.size).await {
                    st.needs_reconcile = true;
                    self.alert(format!("could not flatten {} after {}: {}", p.size, reason, e));
                }
            }
            Ok(_) => {}
            Err(e) => {
                st.needs_reconcile = true;
                log::warn!("[{}] position check on close failed: {}", self.symbol, e);
            }
        }

        let close_price = match fill_price.filter(|p| *p > 0.0) {
            Some(p) => p,
            None => match self.read_price().await {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("[{}] mark price unavailable ({}), using entry", self.symbol, e);
                    pos.entry
                }
            },
        };
        let profit = pos.realized_profit + pos.profit_at(close_price);
        pos.closed = true;
        let closed = ClosedPosition { position: pos, close_price, close_time: now_ms(), reason, profit };
        log::info!(
            "[{}] {} closed by {} @ {:.4} pnl={:+.4}",
            self.symbol, closed.position.direction, reason, close_price, profit
        );
        st.closed.push(closed.clone());
        st.pending_entry = None;
        self.transition(st, Phase::None);
        self.emit(EngineEvent::PositionClosed(closed));
    }

    // ── Manual close ─────────────────────────────────────────────────────────

    /// Cancel every working leg, market out the exchange-reported size, then
    /// settle. `Ok(None)` when nothing is open.
    pub async fn close_active_position(&self) -> Result<Option<ClosedPosition>, EngineError> {
        let mut st = self.state.lock().await;
        if st.needs_reconcile {
            self.reconcile_locked(&mut st).await?;
        }
        let Some(pos) = st.active.as_mut() else {
            log::info!("[{}] manual close: nothing open", self.symbol);
            return Ok(None);
        };
        let direction = pos.direction;

        let ids: Vec<String> = pos.active_order_ids.iter().cloned().collect();
        for id in ids {
            match self.cancel(&id).await {
                Ok(_) => {
                    pos.active_order_ids.remove(&id);
                }
                Err(e) => {
                    self.recover_failed_close(&mut st, format!("cancel of {} failed: {}", id, e)).await;
                    return Err(e.into());
                }
            }
        }
        pos.sl_order_id = None;
        pos.tp1_order_id = None;
        pos.tp2_order_id = None;

        let size = match self.read_position().await {
            Ok(Some(p)) if p.size > 0.0 => p.size,
            Ok(_) => {
                log::warn!("[{}] manual close: exchange already flat", self.symbol);
                self.finalize_close(&mut st, CloseReason::Reconciled, None, "").await;
                return Ok(st.closed.last().cloned());
            }
            Err(e) => {
                self.recover_failed_close(&mut st, format!("position unreadable: {}", e)).await;
                return Err(e.into());
            }
        };

        let close_id = match self.flatten(direction, size).await {
            Ok(id) => id,
            Err(e) => {
                self.recover_failed_close(&mut st, format!("close order rejected: {}", e)).await;
                return Err(e.into());
            }
        };
        let fill = self.wait_for_fill(&close_id).await;
        match fill {
            Some(s) if s.status == OrderStatus::Filled => {
                self.finalize_close(&mut st, CloseReason::Manual, Some(s.avg_price), &close_id).await;
                Ok(st.closed.last().cloned())
            }
            other => {
                log::error!("[{}] close order {} not filled: {:?}", self.symbol, close_id, other);
                self.recover_failed_close(&mut st, format!("close order {} not filled", close_id)).await;
                Err(EngineError::CloseNotFilled(close_id))
            }
        }
    }

    /// A manual close gave up after pulling the legs. Resync at once so the
    /// stop goes back on; if that fails too the next transition retries.
    async fn recover_failed_close(&self, st: &mut EngineState, reason: String) {
        st.needs_reconcile = true;
        self.alert(format!("manual close failed ({}); re-arming protection", reason));
        if let Err(e) = self.reconcile_locked(st).await {
            log::error!("[{}] resync after failed close failed: {}", self.symbol, e);
        }
    }

    // ── Reconciliation ───────────────────────────────────────────────────────

    /// Rebuild local belief from the exchange. Required once before the first
    /// entry; re-run automatically after any failure that left state uncertain.
    pub async fn reconcile(&self) -> Result<(), EngineError> {
        let mut st = self.state.lock().await;
        self.reconcile_locked(&mut st).await
    }

    async fn reconcile_locked(&self, st: &mut EngineState) -> Result<(), EngineError> {
        if st.phase == Phase::EntryPending {
            log::info!("[{}] entry in flight, reconcile deferred", self.symbol);
            st.needs_reconcile = true;
            return Ok(());
        }
        let exchange_pos = self.read_position().await?.filter(|p| p.size > 0.0);
        let orders = self.read_open_orders().await?;
        let live: BTreeSet<String> = orders.iter().map(|o| o.order_id.clone()).collect();

        match (st.active.is_some(), exchange_pos) {
            (true, Some(ex)) => self.resync_active(st, &live, &ex).await?,
            (true, None) => {
                log::warn!("[{}] exchange is flat, settling local position", self.symbol);
                self.finalize_close(st, CloseReason::Reconciled, None, "").await;
            }
            (false, Some(ex)) => self.import_orphan(st, &orders, &ex),
            (false, None) => {
                if st.phase != Phase::None {
                    self.transition(st, Phase::None);
                }
            }
        }

        st.reconciled = true;
        st.needs_reconcile = false;
        log::info!("[{}] reconciled: {:?}, {} open orders", self.symbol, st.phase, orders.len());
        Ok(())
    }

    async fn resync_active(
        &self,
        st: &mut EngineState,
        live: &BTreeSet<String>,
        ex: &ExchangePosition,
    ) -> Result<(), EngineError> {
        let Some(pos) = st.active.as_mut() else { return Ok(()) };
        let gone: Vec<String> = pos.active_order_ids.difference(live).cloned().collect();
        for id in &gone {
            log::warn!("[{}] order {} no longer live, dropped", self.symbol, id);
            pos.active_order_ids.remove(id);
        }
        for slot in [&mut pos.sl_order_id, &mut pos.tp1_order_id, &mut pos.tp2_order_id] {
            if matches!(slot, Some(id) if !live.contains(id)) {
                *slot = None;
            }
        }
        if (pos.quantity - ex.size).abs() > f64::EPSILON {
            log::info!("[{}] size {} -> {} from exchange", self.symbol, pos.quantity, ex.size);
            pos.quantity = ex.size;
        }

        if pos.sl_order_id.is_none() {
            let rules = self.read_rules().await?;
            let request = OrderRequest::conditional(
                &self.symbol,
                pos.direction.exit_side(),
                floor_to_step(pos.quantity, rules.qty_step),
                rules.floor_price(pos.stop_loss),
                pos.direction.stop_trigger(),
                true,
            );
            let id = self.place(&request).await?;
            pos.sl_order_id = Some(id.clone());
            pos.active_order_ids.insert(id);
            self.alert(format!("stop re-armed at {:.4} after resync", pos.stop_loss));
        }

        let phase = if pos.tp1_hit { Phase::OpenPartial } else { Phase::OpenFull };
        self.transition(st, phase);
        Ok(())
    }

    /// Adopt a position found on the exchange with no local record, e.g. after
    /// a restart. Reduce-only conditional orders become the stop; reduce-only
    /// limits become TP1/TP2, nearest to the entry first.
    fn import_orphan(&self, st: &mut EngineState, orders: &[OpenOrder], ex: &ExchangePosition) {
        let direction = if ex.side == Side::Buy { Direction::Long } else { Direction::Short };
        let exit = direction.exit_side();
        let exits: Vec<&OpenOrder> =
            orders.iter().filter(|o| o.reduce_only && o.side == exit).collect();

        let stop: Option<&OpenOrder> = exits.iter().copied().find(|o| o.trigger_price > 0.0);
        let mut targets: Vec<&OpenOrder> = exits
            .iter()
            .copied()
            .filter(|o| o.trigger_price <= 0.0 && o.price > 0.0)
            .collect();
        targets.sort_by(|a, b| {
            (a.price - ex.avg_price).abs().total_cmp(&(b.price - ex.avg_price).abs())
        });
        let tp1 = targets.first().copied();
        let tp2 = targets.get(1).copied();

        let mut active_order_ids = BTreeSet::new();
        for o in stop.into_iter().chain(tp1).chain(tp2) {
            active_order_ids.insert(o.order_id.clone());
        }
        for o in orders.iter().filter(|o| !active_order_ids.contains(&o.order_id)) {
            log::warn!("[{}] open order {} not attributable to the position, left alone", self.symbol, o.order_id);
        }

        let position = Position {
            order_id: format!("orphan-{}", now_ms()),
            symbol: self.symbol.clone(),
            direction,
            entry: ex.avg_price,
            stop_loss: stop.map_or(0.0, |o| o.trigger_price),
            take_profit_1: tp1.map_or(0.0, |o| o.price),
            take_profit_2: tp2.map_or(0.0, |o| o.price),
            quantity: ex.size,
            initial_quantity: ex.size,
            tp1_hit: false,
            sl_order_id: stop.map(|o| o.order_id.clone()),
            tp1_order_id: tp1.map(|o| o.order_id.clone()),
            tp2_order_id: tp2.map(|o| o.order_id.clone()),
            active_order_ids,
            leg_fills: HashMap::new(),
            realized_profit: 0.0,
            closed: false,
            opened_at: now_ms(),
        };
        let unprotected = position.sl_order_id.is_none();
        st.active = Some(position);
        self.transition(st, Phase::OpenFull);
        self.alert(format!(
            "imported {} {} @ {:.4} from exchange{}",
            direction,
            ex.size,
            ex.avg_price,
            if unprotected { " WITHOUT a stop-loss" } else { "" }
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dual_split_keeps_two_thirds_on_tp1() {
        let rules = SymbolRules { tick_size: 0.01, qty_step: 0.001, min_qty: 0.001 };
        let (tp1, tp2) = split_take_profit(10.0, &rules, TpMode::Dual);
        assert_eq!(tp1, 6.666);
        assert_eq!(tp2, Some(3.334));
    }

    #[test]
    fn dual_split_collapses_below_min_lot() {
        let rules = SymbolRules { tick_size: 0.1, qty_step: 0.001, min_qty: 0.001 };
        assert_eq!(split_take_profit(0.002, &rules, TpMode::Dual), (0.002, None));
        assert_eq!(split_take_profit(10.0, &rules, TpMode::Single), (10.0, None));
    }

    #[test]
    fn breakeven_stop_covers_fees_on_both_sides() {
        assert!((breakeven_stop(Direction::Long, 100.0, 0.002) - 100.2).abs() < 1e-9);
        assert!((breakeven_stop(Direction::Short, 100.0, 0.002) - 99.8).abs() < 1e-9);
    }
}
