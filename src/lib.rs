pub mod analyzer;
pub mod bybit_api;
pub mod config;
pub mod exchange;
pub mod indicators;
pub mod order_updates;
pub mod pattern_detector;
pub mod position_engine;
pub mod retry;
pub mod signal_validator;
pub mod telegram;
pub mod types;
pub mod websocket_handler;
pub mod websocket_private;
pub mod zones;
