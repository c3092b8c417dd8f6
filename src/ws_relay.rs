//! C4 — bridges Bus topics to browser WebSocket clients.
//!
//! Each client has a bounded outbound queue and a writer task that
//! drains it onto the socket with a per-write timeout. A full queue
//! drops the message for that one client; it never disconnects the
//! client or blocks the broadcaster.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use hyper::{Body, Request, Response, StatusCode};
use hyper_tungstenite::{tungstenite::Message, HyperWebsocket};
use tokio::sync::mpsc;

const DEFAULT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

struct Client {
    id: u64,
    sender: mpsc::Sender<Vec<u8>>,
}

#[derive(Default)]
pub struct WsRelay {
    topics: DashMap<String, Vec<Client>>,
    next_id: AtomicU64,
}

impl WsRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    fn register(&self, topic: &str, sender: mpsc::Sender<Vec<u8>>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .entry(topic.to_string())
            .or_insert_with(Vec::new)
            .push(Client { id, sender });
        id
    }

    fn unregister(&self, topic: &str, id: u64) {
        if let Some(mut clients) = self.topics.get_mut(topic) {
            clients.retain(|c| c.id != id);
            let empty = clients.is_empty();
            drop(clients);
            if empty {
                self.topics.remove_if(topic, |_, v| v.is_empty());
            }
        }
    }

    /// Non-blocking enqueue into every current subscriber of `topic`. A
    /// full client queue drops that client's copy without disconnecting
    /// it. A topic with no clients is a no-op.
    pub fn broadcast(&self, topic: &str, msg: Vec<u8>) {
        let clients = match self.topics.get(topic) {
            Some(c) => c,
            None => return,
        };
        for client in clients.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = client.sender.try_send(msg.clone()) {
                tracing::debug!(topic, client_id = client.id, "ws client queue full, dropping message");
            }
        }
    }

    /// Handles `GET /ws?topic=<t>`. Missing `topic` yields `400`.
    /// Otherwise performs a WebSocket upgrade, registers the new client,
    /// spawns its writer task, and runs a read loop that only observes
    /// close frames (data frames are discarded).
    pub async fn handle_upgrade(
        self: &Arc<Self>,
        mut req: Request<Body>,
        _peer: SocketAddr,
    ) -> anyhow::Result<Response<Body>> {
        let topic = req
            .uri()
            .query()
            .and_then(|q| {
                url_query_value(q, "topic")
            });
        let topic = match topic {
            Some(t) if !t.is_empty() => t,
            _ => {
                return Ok(Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(Body::from("missing 'topic' query parameter"))?)
            }
        };

        let (response, websocket) = hyper_tungstenite::upgrade(&mut req, None)?;
        let relay = self.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.serve_client(topic, websocket).await {
                tracing::debug!(error = %e, "ws client connection ended");
            }
        });
        Ok(response)
    }

    async fn serve_client(self: Arc<Self>, topic: String, websocket: HyperWebsocket) -> anyhow::Result<()> {
        let ws = websocket.await?;
        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(DEFAULT_QUEUE_CAPACITY);
        let id = self.register(&topic, tx);

        let writer = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let write_fut = write.send(Message::Binary(payload));
                match tokio::time::timeout(DEFAULT_WRITE_TIMEOUT, write_fut).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => break,
                }
            }
        });

        // Read loop solely observes close frames; data frames are discarded.
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        self.unregister(&topic, id);
        writer.abort();
        Ok(())
    }
}

fn url_query_value(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let k = parts.next().unwrap_or("");
        if k == key {
            return Some(parts.next().unwrap_or("").to_string());
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn broadcast_to_empty_topic_is_noop() {
        let relay = WsRelay::new();
        relay.broadcast("nobody", b"hi".to_vec());
    }

    #[tokio::test]
    async fn full_queue_drops_message_without_disconnect() {
        let relay = WsRelay::new();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(1);
        let id = relay.register("t", tx);

        relay.broadcast("t", b"first".to_vec());
        relay.broadcast("t", b"second".to_vec()); // queue full, dropped

        assert_eq!(rx.recv().await, Some(b"first".to_vec()));
        // Client is still registered; a third broadcast can be received.
        relay.broadcast("t", b"third".to_vec());
        assert_eq!(rx.recv().await, Some(b"third".to_vec()));

        relay.unregister("t", id);
    }

    #[test]
    fn query_value_parses_topic() {
        assert_eq!(url_query_value("topic=events", "topic"), Some("events".to_string()));
        assert_eq!(url_query_value("a=1&topic=events", "topic"), Some("events".to_string()));
        assert_eq!(url_query_value("a=1", "topic"), None);
    }
}
