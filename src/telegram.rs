use tokio::sync::broadcast;

use crate::position_engine::EngineEvent;
use crate::types::{ClosedPosition, Direction, Position, Signal};

const BASE_URL: &str = "https://api.telegram.org";

#[derive(Clone)]
pub struct TelegramBot {
    client: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramBot {
    /// `None` unless both TELEGRAM_TOKEN and TELEGRAM_CHAT_ID are set.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("TELEGRAM_TOKEN").ok().filter(|t| !t.is_empty())?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok().filter(|c| !c.is_empty())?;
        Some(TelegramBot {
            client: reqwest::Client::new(),
            url: format!("{}/bot{}/sendMessage", BASE_URL, token),
            chat_id,
        })
    }

    pub async fn send(&self, text: &str) {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML"
        });

        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                let preview: String = text.chars().take(80).collect();
                log::info!("Telegram sent: {}", preview.replace('\n', " "));
            }
            Ok(resp) => log::warn!("Telegram error status: {}", resp.status()),
            Err(e) => log::warn!("Telegram send failed: {}", e),
        }
    }

    pub async fn notify_start(&self, symbol: &str, interval: &str, leverage: u32, notional: f64) {
        self.send(&format!(
            "🤖 <b>S/R zone trader started</b>\n\
             Pair: {symbol} | TF: {interval}m | Lev: {leverage}x | Margin: {notional:.2} USDT"
        ))
        .await;
    }

    pub async fn notify_signal(&self, signal: &Signal) {
        self.send(&signal_message(signal)).await;
    }

    pub async fn notify_summary(&self, closed: &[ClosedPosition]) {
        self.send(&summary_message(closed)).await;
    }

    /// Relay engine events until the engine is dropped.
    pub async fn forward_events(self, mut events: broadcast::Receiver<EngineEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.send(&event_message(&event)).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Telegram relay skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn side_emoji(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "🟢",
        Direction::Short => "🔴",
    }
}

pub fn signal_message(s: &Signal) -> String {
    format!(
        "📐 <b>Signal {} ({})</b>\n\
         Entry: <code>{:.4}</code>  SL: <code>{:.4}</code>\n\
         TP1: <code>{:.4}</code>  TP2: <code>{:.4}</code>",
        s.direction, s.kind, s.entry, s.stop_loss, s.take_profit_1, s.take_profit_2
    )
}

fn opened_message(p: &Position) -> String {
    let tp2 = if p.tp2_order_id.is_some() {
        format!("{:.4}", p.take_profit_2)
    } else {
        "none".to_string()
    };
    format!(
        "{} <b>Position opened: {} {}</b>\n\
         Qty: <code>{}</code>  Entry: <code>{:.4}</code>\n\
         SL: <code>{:.4}</code>  TP1: <code>{:.4}</code>  TP2: <code>{}</code>",
        side_emoji(p.direction), p.direction, p.symbol, p.quantity, p.entry, p.stop_loss,
        p.take_profit_1, tp2
    )
}

pub fn event_message(event: &EngineEvent) -> String {
    match event {
        EngineEvent::PositionOpened(p) => opened_message(p),
        EngineEvent::PartialClose { position, price, qty_closed } => format!(
            "🎯 <b>TP1 hit: {} {}</b>\n\
             Closed <code>{}</code> @ <code>{:.4}</code>, <code>{}</code> left\n\
             Stop moved to breakeven <code>{:.4}</code>",
            position.direction, position.symbol, qty_closed, price, position.quantity,
            position.stop_loss
        ),
        EngineEvent::PositionClosed(c) => {
            let emoji = if c.profit >= 0.0 { "✅" } else { "❌" };
            format!(
                "{emoji} <b>Position closed: {} {}</b>\n\
                 Entry: <code>{:.4}</code>  Exit: <code>{:.4}</code>\n\
                 PnL: <code>{:+.2} USDT</code>\n\
                 Reason: {}",
                c.position.direction, c.position.symbol, c.position.entry, c.close_price,
                c.profit, c.reason
            )
        }
        EngineEvent::Alert(message) => format!("⚠️ <b>Alert</b>\n{message}"),
    }
}

pub fn summary_message(closed: &[ClosedPosition]) -> String {
    let trades = closed.len();
    let wins = closed.iter().filter(|c| c.profit > 0.0).count();
    let pnl: f64 = closed.iter().map(|c| c.profit).sum();
    let win_rate = if trades > 0 { wins as f64 / trades as f64 * 100.0 } else { 0.0 };
    format!(
        "📊 <b>Session summary</b>\n\
         Trades: <code>{trades}</code>  Wins: <code>{wins}</code>  WR: <code>{win_rate:.1}%</code>\n\
         PnL: <code>{pnl:+.2} USDT</code>"
    )
}
