//! Client-side relay connection
//!
//! One manager task owns the WebSocket and reconnects with a fixed delay
//! up to the attempt cap. The sync loop observes `Connected`/`Disconnected`
//! transitions and decides what to queue; this layer only moves envelopes.

use crate::config::{MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY_MS};
use crate::protocol::Envelope;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Connection lifecycle and traffic, as seen by the sync loop.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Connected,
    Message(Envelope),
    Disconnected,
}

/// Handle for sending envelopes to the relay.
#[derive(Clone)]
pub struct Transport {
    outbound: mpsc::Sender<Envelope>,
}

impl Transport {
    /// Spawn the connection manager. Events flow into `events_tx` until the
    /// transport or the receiving side is dropped.
    pub fn spawn(
        server_url: &str,
        client_name: &str,
        events_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel::<Envelope>(256);
        let url = ws_url(server_url, client_name);
        tokio::spawn(run_manager(url, events_tx, outbound_rx));
        Self { outbound }
    }

    /// Queue an envelope for the wire. Returns false when the transport is
    /// saturated or gone; callers treat that as disconnected.
    pub fn send(&self, message: Envelope) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    /// Test constructor: a transport whose outbound end is observable.
    #[cfg(test)]
    pub fn detached() -> (Self, mpsc::Receiver<Envelope>) {
        let (outbound, rx) = mpsc::channel(256);
        (Self { outbound }, rx)
    }
}

/// Build the ws endpoint URL with the identity query parameter.
fn ws_url(server_url: &str, client_name: &str) -> String {
    let base = server_url.trim_end_matches('/');
    format!("{}/ws?clientName={}", base, encode_query(client_name))
}

/// Minimal percent-encoding for the query value.
fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

async fn run_manager(
    url: String,
    events: mpsc::Sender<TransportEvent>,
    mut outbound: mpsc::Receiver<Envelope>,
) {
    let mut attempts: u32 = 0;
    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                attempts = 0;
                tracing::info!("Connected to relay");
                if events.send(TransportEvent::Connected).await.is_err() {
                    return;
                }

                let (mut write, mut read) = stream.split();
                loop {
                    tokio::select! {
                        queued = outbound.recv() => match queued {
                            Some(message) => {
                                let text = match message.encode() {
                                    Ok(text) => text,
                                    Err(e) => {
                                        tracing::warn!("Dropping oversized message: {}", e);
                                        continue;
                                    }
                                };
                                if write.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            // Transport handle dropped: shut down cleanly.
                            None => {
                                let _ = write.send(Message::Close(None)).await;
                                return;
                            }
                        },
                        incoming = read.next() => match incoming {
                            Some(Ok(Message::Text(text))) => {
                                match Envelope::decode(text.as_str()) {
                                    Ok(message) => {
                                        if events
                                            .send(TransportEvent::Message(message))
                                            .await
                                            .is_err()
                                        {
                                            return;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!("Ignoring unknown message: {}", e);
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::debug!("WebSocket error: {}", e);
                                break;
                            }
                        },
                    }
                }

                tracing::warn!("Disconnected from relay");
                if events.send(TransportEvent::Disconnected).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!("Connect attempt failed: {}", e);
            }
        }

        attempts += 1;
        if attempts >= MAX_RECONNECT_ATTEMPTS {
            tracing::error!(
                "Giving up after {} reconnect attempts",
                MAX_RECONNECT_ATTEMPTS
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(RECONNECT_DELAY_MS)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_encodes_name() {
        assert_eq!(
            ws_url("ws://localhost:3777", "alice"),
            "ws://localhost:3777/ws?clientName=alice"
        );
        assert_eq!(
            ws_url("ws://localhost:3777/", "agent one"),
            "ws://localhost:3777/ws?clientName=agent%20one"
        );
    }

    #[test]
    fn test_encode_query_keeps_unreserved() {
        assert_eq!(encode_query("a-b_c.d~1"), "a-b_c.d~1");
        assert_eq!(encode_query("a&b=c"), "a%26b%3Dc");
    }
}
