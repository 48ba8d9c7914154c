//! Bitfinex Bracket Bot Library
//!
//! Keeps entry / stop-loss / take-profit triples consistent on Bitfinex:
//!
//! 1. **Resize**: as the entry fills, both exits are resized to the filled amount.
//! 2. **OCO**: when one exit fills, the other is cancelled.
//!
//! Group state survives restarts through an atomically written JSON file.

pub mod config;
pub mod services;
pub mod types;

pub use config::{BracketConfig, Config};
pub use services::{
    BitfinexClient, BracketGroup, BracketHandle, BracketManager, GatewayError, Metrics,
    OrderGateway, PaperGateway, PrivateEvent, PrivateWebSocket, PrivateWsConfig,
};
pub use types::{BracketRequest, BracketRole, Order, OrderId, OrderKind, OrderRequest};
