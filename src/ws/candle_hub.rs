//! Candle hub: pushes the live 1-minute candle set to subscribers.
//!
//! Clients subscribe per market symbol; symbols are validated against the
//! markets table and invalid ones silently dropped. The first subscription
//! to a symbol anywhere kicks off candle initialization so the stream has an
//! opening price before the first trade.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};

use super::{next_text, write_pump, CLIENT_QUEUE};
use crate::models::Candle;
use crate::repo::MarketRepo;
use crate::services::candles::aggregator::{initialize_symbol_candle, truncate_minute};
use crate::AppState;

/// Symbols with at least one subscriber anywhere, shared between the hub's
/// clients and the aggregator (which initializes candles for them on
/// rollover).
#[derive(Clone, Default)]
pub struct SymbolRegistry {
    symbols: Arc<RwLock<HashSet<String>>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a symbol; true when it was not tracked before.
    pub async fn insert(&self, symbol: &str) -> bool {
        self.symbols.write().await.insert(symbol.to_string())
    }

    pub async fn all(&self) -> Vec<String> {
        self.symbols.read().await.iter().cloned().collect()
    }
}

#[derive(Debug, Deserialize)]
struct CandleSubscription {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    symbols: Vec<String>,
}

#[derive(Clone)]
pub(crate) struct ClientHandle {
    queue: mpsc::Sender<String>,
    symbols: Arc<RwLock<HashSet<String>>>,
}

enum HubCommand {
    Register { id: u64, client: ClientHandle },
    Unregister { id: u64 },
    Broadcast(Vec<Candle>),
}

/// The hub task: sole owner of the client set.
pub struct CandleHub {
    commands: mpsc::Receiver<HubCommand>,
    clients: HashMap<u64, ClientHandle>,
}

#[derive(Clone)]
pub struct CandleHubHandle {
    commands: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl CandleHub {
    pub fn new() -> (Self, CandleHubHandle) {
        let (tx, rx) = mpsc::channel(256);
        (
            Self { commands: rx, clients: HashMap::new() },
            CandleHubHandle { commands: tx, next_id: Arc::new(AtomicU64::new(1)) },
        )
    }

    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Register { id, client } => {
                    self.clients.insert(id, client);
                    tracing::info!(total = self.clients.len(), "candle client connected");
                }
                HubCommand::Unregister { id } => {
                    if self.clients.remove(&id).is_some() {
                        tracing::info!(total = self.clients.len(), "candle client disconnected");
                    }
                }
                HubCommand::Broadcast(candles) => self.broadcast(&candles).await,
            }
        }
    }

    async fn broadcast(&mut self, candles: &[Candle]) {
        let mut dropped = Vec::new();

        for (&id, client) in &self.clients {
            let filtered: Vec<Candle> = {
                let subs = client.symbols.read().await;
                if subs.is_empty() {
                    // Not subscribed to anything yet: send the full set.
                    candles.to_vec()
                } else {
                    candles.iter().filter(|c| subs.contains(&c.symbol)).cloned().collect()
                }
            };
            if filtered.is_empty() {
                continue;
            }

            let payload = match serde_json::to_string(&filtered) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize candle broadcast");
                    continue;
                }
            };

            if client.queue.try_send(payload).is_err() {
                dropped.push(id);
            }
        }

        for id in dropped {
            self.clients.remove(&id);
            tracing::warn!(client = id, "dropping slow candle subscriber");
        }
    }
}

impl CandleHubHandle {
    pub(crate) async fn register(&self, client: ClientHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.commands.send(HubCommand::Register { id, client }).await;
        id
    }

    pub(crate) async fn unregister(&self, id: u64) {
        let _ = self.commands.send(HubCommand::Unregister { id }).await;
    }

    pub async fn broadcast(&self, candles: Vec<Candle>) {
        let _ = self.commands.send(HubCommand::Broadcast(candles)).await;
    }
}

/// `GET /ws/candles`
pub async fn candles_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sink, mut stream) = socket.split();
    let (queue_tx, queue_rx) = mpsc::channel(CLIENT_QUEUE);
    let symbols: Arc<RwLock<HashSet<String>>> = Arc::new(RwLock::new(HashSet::new()));

    let id = state
        .candle_hub
        .register(ClientHandle { queue: queue_tx, symbols: Arc::clone(&symbols) })
        .await;

    tokio::spawn(write_pump(sink, queue_rx));

    while let Some(text) = next_text(&mut stream).await {
        let message: CandleSubscription = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable candle subscription");
                continue;
            }
        };
        handle_subscription(&state, &symbols, message).await;
    }

    // Unregistering drops the hub's queue sender, which ends the write pump.
    state.candle_hub.unregister(id).await;
}

async fn handle_subscription(
    state: &Arc<AppState>,
    symbols: &Arc<RwLock<HashSet<String>>>,
    message: CandleSubscription,
) {
    match message.kind.as_str() {
        "subscribe" => {
            for symbol in message.symbols {
                match MarketRepo::validate_symbol(&state.db.pool, &symbol).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(symbol = %symbol, "rejected subscription to unknown symbol");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(symbol = %symbol, error = %e, "symbol validation failed");
                        continue;
                    }
                }

                symbols.write().await.insert(symbol.clone());

                if state.symbol_registry.insert(&symbol).await {
                    let pool = state.db.pool.clone();
                    let store = Arc::clone(&state.candle_store);
                    tokio::spawn(async move {
                        let minute = truncate_minute(Utc::now());
                        if let Err(e) =
                            initialize_symbol_candle(&pool, &store, &symbol, minute).await
                        {
                            tracing::warn!(symbol = %symbol, error = %e, "candle initialization failed");
                        }
                    });
                }
            }
        }
        "unsubscribe" => {
            let mut subs = symbols.write().await;
            for symbol in &message.symbols {
                subs.remove(symbol);
            }
        }
        other => tracing::debug!(kind = other, "unknown candle message type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn candle(symbol: &str) -> Candle {
        let minute = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Candle::flat(symbol, minute, dec!(100))
    }

    async fn connect(
        hub: &CandleHubHandle,
        subscribed: &[&str],
    ) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let symbols: HashSet<String> = subscribed.iter().map(|s| s.to_string()).collect();
        let id = hub
            .register(ClientHandle { queue: tx, symbols: Arc::new(RwLock::new(symbols)) })
            .await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_broadcast_filters_by_subscription() {
        let (hub, handle) = CandleHub::new();
        tokio::spawn(hub.run());

        let (_, mut btc_rx) = connect(&handle, &["BTC/USDT"]).await;
        let (_, mut all_rx) = connect(&handle, &[]).await;

        handle
            .broadcast(vec![candle("BTC/USDT"), candle("ETH/USDT")])
            .await;

        let btc_payload = btc_rx.recv().await.unwrap();
        let btc_candles: Vec<Candle> = serde_json::from_str(&btc_payload).unwrap();
        assert_eq!(btc_candles.len(), 1);
        assert_eq!(btc_candles[0].symbol, "BTC/USDT");

        // A client with no subscriptions receives the full set.
        let all_payload = all_rx.recv().await.unwrap();
        let all_candles: Vec<Candle> = serde_json::from_str(&all_payload).unwrap();
        assert_eq!(all_candles.len(), 2);
    }

    #[tokio::test]
    async fn test_no_frame_when_nothing_matches() {
        let (hub, handle) = CandleHub::new();
        tokio::spawn(hub.run());

        let (_, mut rx) = connect(&handle, &["SOL/USDT"]).await;
        handle.broadcast(vec![candle("BTC/USDT")]).await;
        // Follow with a matching broadcast; the first must not have produced
        // a frame.
        handle.broadcast(vec![candle("SOL/USDT")]).await;

        let payload = rx.recv().await.unwrap();
        let candles: Vec<Candle> = serde_json::from_str(&payload).unwrap();
        assert_eq!(candles[0].symbol, "SOL/USDT");
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_on_overflow() {
        let (hub, handle) = CandleHub::new();
        tokio::spawn(hub.run());

        let (_, mut rx) = connect(&handle, &["BTC/USDT"]).await;

        // Never drain the queue; once it overflows the hub must drop the
        // client and release its sender.
        for _ in 0..CLIENT_QUEUE + 50 {
            handle.broadcast(vec![candle("BTC/USDT")]).await;
        }

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, CLIENT_QUEUE);
    }
}
