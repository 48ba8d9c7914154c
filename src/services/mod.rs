//! Exchange plumbing and the bracket manager service

pub mod bfx_errors;
pub mod bitfinex;
pub mod bracket;
pub mod gateway;
pub mod metrics;
pub mod private_ws;
pub mod retry;

pub use bfx_errors::GatewayError;
pub use bitfinex::BitfinexClient;
pub use bracket::{BracketGroup, BracketHandle, BracketManager, PrivateEvent};
pub use gateway::{OrderGateway, PaperGateway};
pub use metrics::{Metrics, MetricsSnapshot};
pub use private_ws::{PrivateWebSocket, PrivateWsConfig};
