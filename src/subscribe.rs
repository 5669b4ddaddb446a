//! Live coordinator logs over a WebSocket `eth_subscribe`.
//!
//! The subscription only shortens the time to first sight. Polling stays
//! authoritative: every (re)connect is announced with
//! [`LiveEvent::Connected`] so the relay can backfill whatever was missed
//! while the socket was down.

use alloy_primitives::Address;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::abi::CoordinatorEvent;
use crate::error::ChainError;
use crate::notify::{AlertSink, Severity};
use crate::rpc::{self, JsonRpcError, RpcLog};

/// Delay before reconnecting after a dropped or failed subscription.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Blocks rescanned over HTTP after each (re)connect.
pub const BACKFILL_BLOCKS: u64 = 200;

const METHOD: &str = "eth_subscribe";

#[derive(Debug)]
pub enum LiveEvent {
    /// The subscription is (re)established.
    Connected,
    Log(CoordinatorEvent),
}

#[derive(Deserialize, Debug)]
struct WsMessage {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<JsonRpcError>,
    params: Option<WsNotification>,
}

#[derive(Deserialize, Debug)]
struct WsNotification {
    subscription: String,
    result: RpcLog,
}

#[derive(Debug)]
enum Frame {
    Subscribed(String),
    Log(RpcLog),
    Ignored,
}

fn parse_frame(text: &str) -> Result<Frame, ChainError> {
    let message: WsMessage = serde_json::from_str(text).map_err(|e| ChainError::Decode {
        method: METHOD,
        message: e.to_string(),
    })?;
    if let Some(err) = message.error {
        return Err(ChainError::Rpc {
            method: METHOD,
            code: err.code,
            message: err.message,
        });
    }
    if let Some(notification) = message.params {
        debug!(subscription = %notification.subscription, "Subscription log");
        return Ok(Frame::Log(notification.result));
    }
    match (message.id, message.result) {
        (Some(_), Some(Value::String(id))) => Ok(Frame::Subscribed(id)),
        _ => Ok(Frame::Ignored),
    }
}

fn ws_error(e: impl std::fmt::Display) -> ChainError {
    ChainError::Transport {
        method: METHOD,
        message: e.to_string(),
    }
}

pub struct LogSubscriber {
    url: String,
    coordinator: Address,
    alerts: Arc<dyn AlertSink>,
    reconnect_delay: Duration,
}

impl LogSubscriber {
    pub fn new(url: String, coordinator: Address, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            url,
            coordinator,
            alerts,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Forward coordinator logs to `events` until shutdown or until the
    /// receiver goes away, reconnecting after every failure.
    pub async fn run(self, events: mpsc::Sender<LiveEvent>, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            tokio::select! {
                result = self.stream(&events) => match result {
                    Ok(()) => warn!("Log subscription ended"),
                    Err(e) => {
                        error!(error = %e, "Log subscription failed");
                        self.alerts
                            .notify(Severity::Warning, &format!("WebSocket error, reconnecting: {e}"))
                            .await;
                    }
                },
                _ = shutdown.changed() => break,
            }
            if events.is_closed() {
                break;
            }

            info!(delay = ?self.reconnect_delay, "Reconnecting log subscription");
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("Log subscription stopped");
    }

    /// One connection: subscribe, then forward logs until the socket closes.
    async fn stream(&self, events: &mpsc::Sender<LiveEvent>) -> Result<(), ChainError> {
        info!("Connecting log subscription");
        let (mut ws, _) = connect_async(self.url.as_str()).await.map_err(ws_error)?;

        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": METHOD,
            "params": ["logs", {"address": self.coordinator, "topics": rpc::coordinator_topics()}],
        });
        ws.send(Message::text(request.to_string()))
            .await
            .map_err(ws_error)?;

        let mut subscribed = false;
        while let Some(message) = ws.next().await {
            let text = match message.map_err(ws_error)? {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            match parse_frame(&text)? {
                Frame::Subscribed(id) if !subscribed => {
                    info!(subscription = %id, "Log subscription established");
                    subscribed = true;
                    if events.send(LiveEvent::Connected).await.is_err() {
                        return Ok(());
                    }
                }
                Frame::Log(log) if subscribed => {
                    if let Some(event) = rpc::decode_rpc_log(log) {
                        if events.send(LiveEvent::Log(event)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                _ => {}
            }
        }

        if subscribed {
            Ok(())
        } else {
            Err(ws_error("connection closed before the subscription was acknowledged"))
        }
    }
}
