//! WebSocket fan-out.
//!
//! Two hubs with an identical shape: candles keyed by market symbol and
//! order books keyed by market id. Each hub is a single task owning the
//! client set and consuming register/unregister/broadcast commands; every
//! client gets a bounded send queue and is dropped on overflow rather than
//! stalling the broadcaster.

pub mod candle_hub;
pub mod orderbook_hub;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;

/// Per-client send queue capacity; a client that falls this far behind is
/// dropped.
pub(crate) const CLIENT_QUEUE: usize = 256;

pub(crate) const PING_INTERVAL: Duration = Duration::from_secs(54);
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Drain the client's queue into the socket, pinging every 54 s. Exits when
/// the queue closes or a write misses its 10 s deadline.
pub(crate) async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<String>,
) {
    let start = tokio::time::Instant::now() + PING_INTERVAL;
    let mut ping = tokio::time::interval_at(start, PING_INTERVAL);

    loop {
        tokio::select! {
            frame = queue.recv() => match frame {
                Some(text) => {
                    match tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Text(text))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                match tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }
}

/// Next text frame from the client, or `None` once the connection is done.
/// Any frame (pong included) extends the 60 s read deadline.
pub(crate) async fn next_text(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    loop {
        match tokio::time::timeout(READ_TIMEOUT, stream.next()).await {
            Err(_) => return None,
            Ok(None) => return None,
            Ok(Some(Err(_))) => return None,
            Ok(Some(Ok(Message::Text(text)))) => return Some(text),
            Ok(Some(Ok(Message::Close(_)))) => return None,
            Ok(Some(Ok(_))) => {}
        }
    }
}
