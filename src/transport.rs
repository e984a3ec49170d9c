//! The duck-typed `{send, close, onFrame, onClose, state}` wrapper called for
//! in the design notes, realized as a cheap-to-clone [`Transport`] handle plus
//! a dedicated writer task.
//!
//! Neither the [`crate::registry`] nor the [`crate::relay`] module ever touch
//! a `WebSocketStream` directly — they hold a `Transport` and an inbound
//! `mpsc::UnboundedReceiver<String>`. This keeps the close-race guard in
//! §4.1 honest: identity is the channel, not any particular socket object,
//! so a transport can be swapped out from under a stale reference without
//! the old reference accidentally operating on the new one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

enum Outbound {
    Text(String),
    Close(&'static str),
}

/// A cheap-to-clone handle to a live WebSocket connection's write side.
#[derive(Clone)]
pub struct Transport {
    tx: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl Transport {
    /// Queue a text frame for sending. Silently dropped if the writer task
    /// has already exited (closed/errored connection).
    pub fn send_text(&self, text: String) {
        let _ = self.tx.send(Outbound::Text(text));
    }

    pub fn send_json(&self, value: &serde_json::Value) {
        if let Ok(text) = serde_json::to_string(value) {
            self.send_text(text);
        }
    }

    /// Normal-close the connection with the given reason string (§4.1, §4.3.6).
    pub fn close(&self, reason: &'static str) {
        let _ = self.tx.send(Outbound::Close(reason));
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Witness equality: true iff both handles drive the same underlying
    /// writer task. This is the ABA guard §4.1 requires for
    /// `unregister(deviceId, transportWitness)`.
    pub fn is_same(&self, other: &Transport) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Split an accepted (or outbound) WebSocket stream into a [`Transport`]
/// handle plus a channel of inbound text frames.
///
/// The returned receiver yields items until the peer closes the connection,
/// a fatal I/O error occurs, or [`Transport::close`] is called — at which
/// point it is dropped and `transport.is_open()` becomes `false`.
pub fn spawn<S>(ws: WebSocketStream<S>) -> (Transport, mpsc::UnboundedReceiver<String>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
    let open = Arc::new(AtomicBool::new(true));

    let writer_open = Arc::clone(&open);
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let should_stop = matches!(msg, Outbound::Close(_));
            match msg {
                Outbound::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                }
            }
            if should_stop {
                break;
            }
        }
        writer_open.store(false, Ordering::Release);
        let _ = sink.close().await;
    });

    let reader_open = Arc::clone(&open);
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if in_tx.send(text.to_string()).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "transport read error");
                    break;
                }
            }
        }
        reader_open.store(false, Ordering::Release);
    });

    (Transport { tx: out_tx, open }, in_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (
        WebSocketStream<TcpStream>,
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_fut = async {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        };
        let client_fut = tokio_tungstenite::connect_async(format!("ws://{addr}"));
        let (server, client) = tokio::join!(server_fut, client_fut);
        (server, client.unwrap().0)
    }

    #[tokio::test]
    async fn send_and_receive_round_trip() {
        let (server_ws, mut client_ws) = pair().await;
        let (transport, mut inbound) = spawn(server_ws);

        transport.send_text("hello".to_string());
        let msg = client_ws.next().await.unwrap().unwrap();
        assert_eq!(msg.into_text().unwrap(), "hello");

        client_ws
            .send(Message::Text("world".into()))
            .await
            .unwrap();
        let received = inbound.recv().await.unwrap();
        assert_eq!(received, "world");
    }

    #[tokio::test]
    async fn close_marks_transport_not_open() {
        let (server_ws, mut client_ws) = pair().await;
        let (transport, mut inbound) = spawn(server_ws);

        transport.close("bye");
        // Drain until the writer task has processed the close and exited.
        while client_ws.next().await.transpose().ok().flatten().is_some() {}
        assert!(inbound.recv().await.is_none());

        // Give the writer task a moment to flip the flag.
        for _ in 0..50 {
            if !transport.is_open() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn witness_equality_distinguishes_transports() {
        let (server_ws_a, _client_a) = pair().await;
        let (server_ws_b, _client_b) = pair().await;
        let (transport_a, _) = spawn(server_ws_a);
        let (transport_b, _) = spawn(server_ws_b);
        let transport_a_clone = transport_a.clone();

        assert!(transport_a.is_same(&transport_a_clone));
        assert!(!transport_a.is_same(&transport_b));
    }
}
