//! Order-book hub: pushes depth-20 book snapshots per market.
//!
//! Same shape as the candle hub but keyed by market id. On subscribe the
//! client gets an immediate fetch-and-send of the book so it does not wait
//! for the next broadcast tick.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::StreamExt;
use serde::Deserialize;
use sqlx::PgPool;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::{next_text, write_pump, CLIENT_QUEUE};
use crate::repo::{MarketRepo, OrderBook, OrderRepo};
use crate::AppState;

/// Book depth pushed to subscribers.
const BOOK_DEPTH: i64 = 20;

const BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct BookSubscription {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    market_ids: Vec<Uuid>,
}

#[derive(Clone)]
pub(crate) struct ClientHandle {
    queue: mpsc::Sender<String>,
    market_ids: Arc<RwLock<HashSet<Uuid>>>,
}

enum HubCommand {
    Register { id: u64, client: ClientHandle },
    Unregister { id: u64 },
    Broadcast(HashMap<Uuid, OrderBook>),
}

pub struct OrderbookHub {
    commands: mpsc::Receiver<HubCommand>,
    clients: HashMap<u64, ClientHandle>,
}

#[derive(Clone)]
pub struct OrderbookHubHandle {
    commands: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl OrderbookHub {
    pub fn new() -> (Self, OrderbookHubHandle) {
        let (tx, rx) = mpsc::channel(256);
        (
            Self { commands: rx, clients: HashMap::new() },
            OrderbookHubHandle { commands: tx, next_id: Arc::new(AtomicU64::new(1)) },
        )
    }

    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Register { id, client } => {
                    self.clients.insert(id, client);
                    tracing::info!(total = self.clients.len(), "orderbook client connected");
                }
                HubCommand::Unregister { id } => {
                    if self.clients.remove(&id).is_some() {
                        tracing::info!(total = self.clients.len(), "orderbook client disconnected");
                    }
                }
                HubCommand::Broadcast(books) => self.broadcast(&books).await,
            }
        }
    }

    async fn broadcast(&mut self, books: &HashMap<Uuid, OrderBook>) {
        let mut dropped = Vec::new();

        for (&id, client) in &self.clients {
            let filtered: HashMap<Uuid, &OrderBook> = {
                let subs = client.market_ids.read().await;
                if subs.is_empty() {
                    // Unlike candles, an unsubscribed book client gets nothing.
                    continue;
                }
                books.iter().filter(|(mid, _)| subs.contains(mid)).map(|(m, b)| (*m, b)).collect()
            };
            if filtered.is_empty() {
                continue;
            }

            let payload = match serde_json::to_string(&filtered) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize book broadcast");
                    continue;
                }
            };

            if client.queue.try_send(payload).is_err() {
                dropped.push(id);
            }
        }

        for id in dropped {
            self.clients.remove(&id);
            tracing::warn!(client = id, "dropping slow orderbook subscriber");
        }
    }
}

impl OrderbookHubHandle {
    pub(crate) async fn register(&self, client: ClientHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.commands.send(HubCommand::Register { id, client }).await;
        id
    }

    pub(crate) async fn unregister(&self, id: u64) {
        let _ = self.commands.send(HubCommand::Unregister { id }).await;
    }

    pub async fn broadcast(&self, books: HashMap<Uuid, OrderBook>) {
        let _ = self.commands.send(HubCommand::Broadcast(books)).await;
    }
}

/// `GET /ws/orderbook`
pub async fn orderbook_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sink, mut stream) = socket.split();
    let (queue_tx, queue_rx) = mpsc::channel(CLIENT_QUEUE);
    let market_ids: Arc<RwLock<HashSet<Uuid>>> = Arc::new(RwLock::new(HashSet::new()));

    let id = state
        .orderbook_hub
        .register(ClientHandle {
            queue: queue_tx.clone(),
            market_ids: Arc::clone(&market_ids),
        })
        .await;

    tokio::spawn(write_pump(sink, queue_rx));

    while let Some(text) = next_text(&mut stream).await {
        let message: BookSubscription = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable book subscription");
                continue;
            }
        };

        match message.kind.as_str() {
            "subscribe" => {
                {
                    let mut subs = market_ids.write().await;
                    for market_id in &message.market_ids {
                        subs.insert(*market_id);
                    }
                }
                // Push the current books right away rather than waiting for
                // the next broadcast tick.
                let pool = state.db.pool.clone();
                let queue = queue_tx.clone();
                let ids = message.market_ids.clone();
                tokio::spawn(send_immediate_books(pool, ids, queue));
            }
            "unsubscribe" => {
                let mut subs = market_ids.write().await;
                for market_id in &message.market_ids {
                    subs.remove(market_id);
                }
            }
            other => tracing::debug!(kind = other, "unknown book message type"),
        }
    }

    state.orderbook_hub.unregister(id).await;
}

async fn send_immediate_books(pool: PgPool, market_ids: Vec<Uuid>, queue: mpsc::Sender<String>) {
    let mut books = HashMap::new();
    for market_id in market_ids {
        match OrderRepo::get_order_book(&pool, market_id, BOOK_DEPTH).await {
            Ok(book) => {
                books.insert(market_id, book);
            }
            Err(e) => tracing::warn!(market = %market_id, error = %e, "immediate book fetch failed"),
        }
    }
    if books.is_empty() {
        return;
    }
    if let Ok(payload) = serde_json::to_string(&books) {
        let _ = queue.try_send(payload);
    }
}

/// Periodic tick: fetch the depth-20 book of every active market and hand
/// the mapping to the hub. Single-iteration failures are logged and skipped.
pub async fn run_orderbook_broadcaster(pool: PgPool, hub: OrderbookHubHandle) {
    let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
    tracing::info!("orderbook broadcaster started");

    loop {
        ticker.tick().await;

        let markets = match MarketRepo::list_active(&pool).await {
            Ok(markets) => markets,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list markets");
                continue;
            }
        };

        let mut books = HashMap::new();
        for market in markets {
            match OrderRepo::get_order_book(&pool, market.id, BOOK_DEPTH).await {
                Ok(book) => {
                    books.insert(market.id, book);
                }
                Err(e) => {
                    tracing::warn!(market = %market.symbol, error = %e, "book fetch failed");
                }
            }
        }

        if !books.is_empty() {
            hub.broadcast(books).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book(market_id: Uuid) -> OrderBook {
        OrderBook {
            market_id,
            bids: vec![crate::repo::PriceLevel { price: dec!(99), amount: dec!(1) }],
            asks: vec![crate::repo::PriceLevel { price: dec!(101), amount: dec!(2) }],
        }
    }

    async fn connect(
        hub: &OrderbookHubHandle,
        subscribed: &[Uuid],
    ) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let ids: HashSet<Uuid> = subscribed.iter().copied().collect();
        let id = hub
            .register(ClientHandle { queue: tx, market_ids: Arc::new(RwLock::new(ids)) })
            .await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_broadcast_filters_by_market() {
        let (hub, handle) = OrderbookHub::new();
        tokio::spawn(hub.run());

        let (subscribed, other) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, mut rx) = connect(&handle, &[subscribed]).await;

        let mut books = HashMap::new();
        books.insert(subscribed, book(subscribed));
        books.insert(other, book(other));
        handle.broadcast(books).await;

        let payload = rx.recv().await.unwrap();
        let received: HashMap<Uuid, serde_json::Value> = serde_json::from_str(&payload).unwrap();
        assert_eq!(received.len(), 1);
        assert!(received.contains_key(&subscribed));
    }

    #[tokio::test]
    async fn test_unsubscribed_client_receives_nothing() {
        let (hub, handle) = OrderbookHub::new();
        tokio::spawn(hub.run());

        let market_id = Uuid::new_v4();
        let (_, mut silent_rx) = connect(&handle, &[]).await;
        let (_, mut loud_rx) = connect(&handle, &[market_id]).await;

        let mut books = HashMap::new();
        books.insert(market_id, book(market_id));
        handle.broadcast(books).await;

        // The subscribed client hears it; the unsubscribed one must not.
        assert!(loud_rx.recv().await.is_some());
        assert!(silent_rx.try_recv().is_err());
    }
}
