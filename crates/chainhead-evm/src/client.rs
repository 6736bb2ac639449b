//! WebSocket JSON-RPC head client with auto-reconnect.
//!
//! A background task owns the connection. Callers talk to it over a command
//! channel; responses are matched to requests by id. `newHeads`
//! notifications are parsed into [`EvmHead`]s and pushed into the
//! subscription they belong to.
//!
//! Subscriptions do not survive a reconnect. When the socket drops, every
//! live subscription receives an error so its owner can subscribe again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use chainhead_core::client::{HeadClient, HeadSubscription, SubscriptionSender};
use chainhead_core::error::ChainHeadError;

use crate::head::{parse_hex_u64, EvmHead};

/// Configuration for the WebSocket client.
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// Reconnect backoff starting duration.
    pub reconnect_initial: Duration,
    /// Maximum reconnect backoff.
    pub reconnect_max: Duration,
    /// How long a request may wait for its response, including time spent
    /// waiting for a connection.
    pub request_timeout: Duration,
    /// Heads buffered per subscription before new ones are dropped.
    pub subscription_buffer: usize,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            subscription_buffer: 64,
        }
    }
}

/// Outgoing JSON-RPC 2.0 frame. Ids are always numeric; id 0 is reserved
/// for fire-and-forget `eth_unsubscribe` calls.
#[derive(Debug, Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    params: Vec<Value>,
}

impl RpcRequest {
    fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// Reply to one of our requests. Frames whose id is not a number are not
/// ours and fail to parse.
#[derive(Debug, Deserialize)]
struct RpcReply {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

impl RpcReply {
    /// The result value, or the node's error rendered as a message.
    fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(err) => Err(format!("JSON-RPC error {}: {}", err.code, err.message)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Command sent from callers to the background WS task.
enum WsCommand {
    Call {
        req: RpcRequest,
        tx: oneshot::Sender<Result<Value, ChainHeadError>>,
    },
    Subscribe {
        req: RpcRequest,
        chain_id: u64,
        sender: SubscriptionSender<EvmHead>,
        tx: oneshot::Sender<Result<String, ChainHeadError>>,
    },
    Unsubscribe {
        id: String,
    },
}

/// WebSocket head client for one EVM chain.
pub struct WsHeadClient {
    url: String,
    chain_id: u64,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    next_id: AtomicU64,
    config: WsClientConfig,
    shutdown: CancellationToken,
}

impl WsHeadClient {
    /// Start the background task and ask the node for its chain id.
    pub async fn connect(
        url: impl Into<String>,
        config: WsClientConfig,
    ) -> Result<Self, ChainHeadError> {
        let mut client = Self::with_chain_id(url, 0, config);
        client.chain_id = client.fetch_chain_id().await?;
        tracing::info!(url = %client.url, chain_id = client.chain_id, "Connected to node");
        Ok(client)
    }

    /// Start the background task for a chain whose id is already known.
    pub fn with_chain_id(url: impl Into<String>, chain_id: u64, config: WsClientConfig) -> Self {
        let url = url.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<WsCommand>();
        let shutdown = CancellationToken::new();

        tokio::spawn(ws_task(url.clone(), cmd_rx, config.clone(), shutdown.clone()));

        Self {
            url,
            chain_id,
            cmd_tx,
            next_id: AtomicU64::new(1),
            config,
            shutdown,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Query `eth_chainId`.
    pub async fn fetch_chain_id(&self) -> Result<u64, ChainHeadError> {
        let value = self.call("eth_chainId", vec![]).await?;
        value
            .as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| ChainHeadError::Rpc(format!("invalid eth_chainId result: {value}")))
    }

    fn request(&self, method: &str, params: Vec<Value>) -> RpcRequest {
        RpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params)
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainHeadError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Call {
                req: self.request(method, params),
                tx,
            })
            .map_err(|_| ChainHeadError::Rpc("WS task closed".into()))?;
        self.await_reply(method, rx).await
    }

    async fn await_reply<T>(
        &self,
        method: &str,
        rx: oneshot::Receiver<Result<T, ChainHeadError>>,
    ) -> Result<T, ChainHeadError> {
        match time::timeout(self.config.request_timeout, rx).await {
            Err(_) => Err(ChainHeadError::Rpc(format!(
                "{method} timed out after {:?}",
                self.config.request_timeout
            ))),
            Ok(Err(_)) => Err(ChainHeadError::Rpc("WS response dropped".into())),
            Ok(Ok(result)) => result,
        }
    }
}

impl Drop for WsHeadClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl HeadClient<EvmHead> for WsHeadClient {
    fn configured_chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn head_by_number(&self, number: Option<u64>) -> Result<Option<EvmHead>, ChainHeadError> {
        let tag = match number {
            Some(n) => format!("{n:#x}"),
            None => "latest".to_string(),
        };
        let block = self
            .call("eth_getBlockByNumber", vec![json!(tag), json!(false)])
            .await?;
        if block.is_null() {
            return Ok(None);
        }
        EvmHead::from_json(&block, self.chain_id)
            .map(Some)
            .ok_or_else(|| ChainHeadError::Rpc(format!("malformed block {tag}")))
    }

    async fn subscribe_new_heads(&self) -> Result<HeadSubscription<EvmHead>, ChainHeadError> {
        let (subscription, sender) = HeadSubscription::channel(self.config.subscription_buffer);
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Subscribe {
                req: self.request("eth_subscribe", vec![json!("newHeads")]),
                chain_id: self.chain_id,
                sender,
                tx,
            })
            .map_err(|_| ChainHeadError::Subscription("WS task closed".into()))?;
        let id = self.await_reply("eth_subscribe", rx).await?;
        tracing::debug!(subscription = %id, "Subscribed to newHeads");

        let cmd_tx = self.cmd_tx.clone();
        Ok(subscription.on_unsubscribe(move || {
            let _ = cmd_tx.send(WsCommand::Unsubscribe { id });
        }))
    }
}

// ─── Background task ──────────────────────────────────────────────────────────

/// Background task that owns the WebSocket connection.
async fn ws_task(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    config: WsClientConfig,
    shutdown: CancellationToken,
) {
    let mut dispatcher = Dispatcher::default();
    let mut backoff = config.reconnect_initial;

    loop {
        tracing::info!(url = %url, "connecting via WebSocket");

        let conn = tokio::select! {
            _ = shutdown.cancelled() => return,
            conn = tokio_tungstenite::connect_async(url.as_str()) => conn,
        };

        match conn {
            Err(e) => {
                tracing::warn!(error = %e, "WS connect failed, retrying in {backoff:?}");
            }
            Ok((ws_stream, _)) => {
                backoff = config.reconnect_initial; // reset on success
                let (mut sink, mut stream) = ws_stream.split();

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            let _ = sink.send(Message::Close(None)).await;
                            dispatcher.fail_all("client closed");
                            return;
                        }
                        cmd = cmd_rx.recv() => {
                            let Some(cmd) = cmd else {
                                dispatcher.fail_all("client closed");
                                return;
                            };
                            if let Some(text) = dispatcher.prepare(cmd) {
                                if sink.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        msg = stream.next() => {
                            match msg {
                                None => break,
                                Some(Err(e)) => {
                                    tracing::warn!(error = %e, "WS receive error");
                                    break;
                                }
                                Some(Ok(Message::Text(text))) => dispatcher.on_text(text.as_str()),
                                Some(Ok(Message::Close(_))) => break,
                                _ => {}
                            }
                        }
                    }
                }

                dispatcher.fail_all("websocket disconnected");
                tracing::warn!(url = %url, "WS disconnected, reconnecting in {backoff:?}");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(config.reconnect_max);
    }
}

enum Pending {
    Call(oneshot::Sender<Result<Value, ChainHeadError>>),
    Subscribe {
        chain_id: u64,
        sender: SubscriptionSender<EvmHead>,
        tx: oneshot::Sender<Result<String, ChainHeadError>>,
    },
}

struct ActiveSubscription {
    chain_id: u64,
    sender: SubscriptionSender<EvmHead>,
}

/// Per-connection request and subscription bookkeeping.
#[derive(Default)]
struct Dispatcher {
    pending: HashMap<u64, Pending>,
    subscriptions: HashMap<String, ActiveSubscription>,
}

impl Dispatcher {
    /// Record `cmd` and return the text frame to send, if any.
    fn prepare(&mut self, cmd: WsCommand) -> Option<String> {
        let (req, pending) = match cmd {
            WsCommand::Call { req, tx } => (req, Pending::Call(tx)),
            WsCommand::Subscribe {
                req,
                chain_id,
                sender,
                tx,
            } => (req, Pending::Subscribe { chain_id, sender, tx }),
            WsCommand::Unsubscribe { id } => {
                self.subscriptions.remove(&id)?;
                let req = RpcRequest::new(0, "eth_unsubscribe", vec![json!(id)]);
                return serde_json::to_string(&req).ok();
            }
        };
        let id = req.id;
        let text = match serde_json::to_string(&req) {
            Ok(text) => text,
            Err(e) => {
                pending.fail(&e.to_string());
                return None;
            }
        };
        self.pending.insert(id, pending);
        Some(text)
    }

    fn on_text(&mut self, text: &str) {
        let Ok(val) = serde_json::from_str::<Value>(text) else {
            tracing::debug!("failed to parse WS message as JSON");
            return;
        };

        if val.get("method").and_then(|m| m.as_str()) == Some("eth_subscription") {
            let params = &val["params"];
            if let Some(id) = params["subscription"].as_str() {
                self.dispatch(id, &params["result"]);
            }
            return;
        }

        let Ok(resp) = serde_json::from_value::<RpcReply>(val) else {
            return;
        };
        let Some(pending) = self.pending.remove(&resp.id) else {
            return;
        };
        match pending {
            Pending::Call(tx) => {
                let _ = tx.send(resp.into_result().map_err(ChainHeadError::Rpc));
            }
            Pending::Subscribe {
                chain_id,
                sender,
                tx,
            } => {
                let result = match resp.into_result() {
                    Ok(Value::String(sub_id)) => {
                        self.subscriptions
                            .insert(sub_id.clone(), ActiveSubscription { chain_id, sender });
                        Ok(sub_id)
                    }
                    Ok(other) => Err(ChainHeadError::Subscription(format!(
                        "unexpected eth_subscribe result: {other}"
                    ))),
                    Err(e) => Err(ChainHeadError::Subscription(e)),
                };
                let _ = tx.send(result);
            }
        }
    }

    fn dispatch(&mut self, id: &str, result: &Value) {
        let Some(sub) = self.subscriptions.get(id) else {
            tracing::debug!(subscription = id, "notification for unknown subscription");
            return;
        };
        match EvmHead::from_json(result, sub.chain_id) {
            Some(head) => {
                if !sub.sender.try_send_head(head) {
                    self.subscriptions.remove(id);
                }
            }
            None => tracing::warn!(subscription = id, "malformed newHeads notification"),
        }
    }

    /// Fail every in-flight request and every live subscription.
    fn fail_all(&mut self, reason: &str) {
        for (_, pending) in self.pending.drain() {
            pending.fail(reason);
        }
        for (_, sub) in self.subscriptions.drain() {
            sub.sender.fail(ChainHeadError::Subscription(reason.to_string()));
        }
    }
}

impl Pending {
    fn fail(self, reason: &str) {
        match self {
            Pending::Call(tx) => {
                let _ = tx.send(Err(ChainHeadError::Rpc(reason.to_string())));
            }
            Pending::Subscribe { tx, .. } => {
                let _ = tx.send(Err(ChainHeadError::Subscription(reason.to_string())));
            }
        }
    }
}
