//! Private WebSocket - authenticated Bitfinex account stream
//!
//! Connects to `wss://api.bitfinex.com/ws/2`, authenticates with the
//! `trading` filter and forwards order and trade events on channel 0 to the
//! bracket manager.
//!
//! Auth message format:
//! ```json
//! {
//!   "event": "auth", "apiKey": "...", "authSig": "...",
//!   "authNonce": "...", "authPayload": "AUTH...", "filter": ["trading"], "dms": 4
//! }
//! ```

use crate::services::bitfinex::sign_payload;
use crate::services::bracket::{BracketHandle, PrivateEvent, TRACKED_CODES};
use crate::services::metrics::Metrics;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub const DEFAULT_WS_URL: &str = "wss://api.bitfinex.com/ws/2";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Dead-man-switch flag: cancel all orders when this socket disconnects
const DMS_CANCEL_ON_DISCONNECT: u8 = 4;

/// Info code asking clients to reconnect (server restart)
const INFO_RECONNECT: i64 = 20051;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthMessage {
    event: &'static str,
    api_key: String,
    auth_sig: String,
    auth_nonce: String,
    auth_payload: String,
    filter: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dms: Option<u8>,
}

impl AuthMessage {
    fn new(api_key: &str, api_secret: &str, nonce: i64, dead_man_switch: bool) -> Result<Self> {
        let auth_nonce = nonce.to_string();
        let auth_payload = format!("AUTH{}", auth_nonce);
        let auth_sig = sign_payload(api_secret, &auth_payload)?;

        Ok(Self {
            event: "auth",
            api_key: api_key.to_string(),
            auth_sig,
            auth_nonce,
            auth_payload,
            filter: vec!["trading"],
            dms: dead_man_switch.then_some(DMS_CANCEL_ON_DISCONNECT),
        })
    }
}

/// What a single text frame turned out to be
#[derive(Debug, PartialEq)]
enum Frame {
    Authenticated,
    Event(PrivateEvent),
    Malformed(String),
    Reconnect,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct PrivateWsConfig {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    pub dead_man_switch: bool,
}

/// Authenticated account stream service
pub struct PrivateWebSocket;

impl PrivateWebSocket {
    /// Run the private stream until shutdown_rx signals true.
    /// Auto-reconnects on disconnection.
    pub async fn run(
        config: PrivateWsConfig,
        handle: BracketHandle,
        metrics: Metrics,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("[Private WS] Starting against {}", config.url);

        let mut first_connect = true;
        loop {
            if *shutdown_rx.borrow() {
                info!("[Private WS] Shutdown signal received");
                break;
            }

            match Self::connect_and_listen(&config, &handle, &metrics, &mut shutdown_rx).await {
                Ok(()) => info!("[Private WS] Connection closed. Reconnecting..."),
                Err(e) => warn!("[Private WS] Error: {:#}. Reconnecting...", e),
            }

            if *shutdown_rx.borrow() {
                break;
            }

            if !first_connect {
                metrics.inc_private_ws_reconnects();
            }
            first_connect = false;

            tokio::select! {
                _ = sleep(RECONNECT_DELAY) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("[Private WS] Shutdown during reconnect delay");
                        break;
                    }
                }
            }
        }

        info!("[Private WS] Stopped");
    }

    async fn connect_and_listen(
        config: &PrivateWsConfig,
        handle: &BracketHandle,
        metrics: &Metrics,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (ws_stream, _) = connect_async(config.url.as_str())
            .await
            .context("Failed to connect to private WebSocket")?;

        info!("[Private WS] Connected");

        let (mut write, mut read) = ws_stream.split();

        let auth = AuthMessage::new(
            &config.api_key,
            &config.api_secret,
            Utc::now().timestamp_micros(),
            config.dead_man_switch,
        )?;
        write
            .send(Message::Text(serde_json::to_string(&auth)?))
            .await
            .context("Failed to send auth message")?;

        loop {
            let msg = tokio::select! {
                msg = read.next() => msg,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                    continue;
                }
            };

            let Some(msg) = msg else {
                break;
            };

            match msg {
                Ok(Message::Text(text)) => match Self::handle_message(&text)? {
                    Frame::Authenticated => info!("[Private WS] Authenticated"),
                    Frame::Event(event) => {
                        debug!("[Private WS] Event {:?}", event);
                        handle
                            .submit_event(event)
                            .await
                            .context("Bracket manager unavailable")?;
                    }
                    Frame::Malformed(reason) => {
                        metrics.inc_events_malformed();
                        debug!("[Private WS] Skipping malformed message: {}", reason);
                    }
                    Frame::Reconnect => {
                        info!("[Private WS] Server requested reconnect");
                        break;
                    }
                    Frame::Ignored => {}
                },
                Ok(Message::Ping(data)) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => {
                    info!("[Private WS] Server closed connection");
                    break;
                }
                Err(e) => {
                    warn!("[Private WS] WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Classify one text frame. Only a rejected login is an error.
    fn handle_message(text: &str) -> Result<Frame> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return Ok(Frame::Malformed(format!("invalid JSON: {}", e))),
        };

        if let Some(event) = value.get("event").and_then(|v| v.as_str()) {
            return match event {
                "auth" => {
                    let status = value.get("status").and_then(|v| v.as_str()).unwrap_or_default();
                    if status == "OK" {
                        Ok(Frame::Authenticated)
                    } else {
                        let reason = value.get("msg").and_then(|v| v.as_str()).unwrap_or("unknown");
                        bail!("authentication rejected: {}", reason)
                    }
                }
                "info" if value.get("code").and_then(|v| v.as_i64()) == Some(INFO_RECONNECT) => {
                    Ok(Frame::Reconnect)
                }
                _ => Ok(Frame::Ignored),
            };
        }

        let Some(fields) = value.as_array() else {
            return Ok(Frame::Ignored);
        };

        // Account events only ever arrive on channel 0
        if fields.first().and_then(|v| v.as_i64()) != Some(0) {
            return Ok(Frame::Ignored);
        }

        let Some(code) = fields.get(1).and_then(|v| v.as_str()) else {
            return Ok(Frame::Ignored);
        };

        if code == "hb" || !TRACKED_CODES.contains(&code) {
            return Ok(Frame::Ignored);
        }

        Ok(match PrivateEvent::decode(code, &value) {
            Some(event) => Frame::Event(event),
            None => Frame::Malformed(format!("undecodable {} payload", code)),
        })
    }
}
