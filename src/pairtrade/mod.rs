pub mod config;
pub mod engine;
pub mod scanner;
pub mod signal;
pub mod state_machine;
pub mod status;
pub mod store;

pub use config::PairTradeConfig;
pub use engine::PairTradeEngine;
