//! Live control-socket connector over `tokio-tungstenite`.
//!
//! Each [`Connection`] it returns owns two background tasks: a writer that
//! drains an unbounded queue into the socket and a reader that turns frames
//! into [`TransportEvent`]s. Closing the transport cancels both.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::protocol::PONG;
use crate::socket::{ConnectRequest, Connection, Connector, Transport, TransportEvent};

// ── Connector ───────────────────────────────────────────────────────

/// Opens real WebSocket connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Connection, Error>> {
        Box::pin(open(request))
    }
}

// ── Transport ───────────────────────────────────────────────────────

struct WebSocketTransport {
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl Transport for WebSocketTransport {
    fn send(&self, frame: String) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        self.outbound
            .send(Message::text(frame))
            .map_err(|_| Error::TransportClosed)
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Connection lifecycle ────────────────────────────────────────────

/// Perform the upgrade handshake and spawn the reader/writer pair.
///
/// If `cookie` is set it is injected as a `Cookie` header on the upgrade
/// request.
async fn open(request: ConnectRequest) -> Result<Connection, Error> {
    // Never log the query string: it may carry the bearer token.
    tracing::info!(
        host = request.url.host_str().unwrap_or_default(),
        path = request.url.path(),
        "Connecting to control socket"
    );

    let uri: tungstenite::http::Uri =
        request
            .url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect {
                message: e.to_string(),
                status: None,
            })?;

    let mut builder = ClientRequestBuilder::new(uri);
    if let Some(cookie) = request.cookie {
        builder = builder.with_header("Cookie", cookie);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(builder)
        .await
        .map_err(handshake_error)?;

    tracing::info!("Control socket connected");

    let (mut write, mut read) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let writer_cancel = cancel.clone();
    let writer_events = event_tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = writer_cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.close().await;
                    break;
                }
                msg = out_rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = write.send(msg).await {
                        let _ = writer_events.send(TransportEvent::Error(Error::WebSocketConnect {
                            message: e.to_string(),
                            status: None,
                        }));
                        break;
                    }
                }
            }
        }
        tracing::debug!("Control socket writer exiting");
    });

    let reader_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = reader_cancel.cancelled() => break,
                frame = read.next() => {
                    let event = match frame {
                        Some(Ok(Message::Text(text))) => {
                            if text.as_str() == PONG {
                                TransportEvent::Pong
                            } else {
                                TransportEvent::Message(text.to_string())
                            }
                        }
                        Some(Ok(Message::Ping(_))) => {
                            // tungstenite queues the pong reply itself
                            tracing::trace!("Control socket ping");
                            continue;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|cf| (Some(u16::from(cf.code)), cf.reason.to_string()))
                                .unwrap_or_default();
                            tracing::info!(?code, %reason, "Control socket close frame received");
                            let _ = event_tx.send(TransportEvent::Closed { code, reason });
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            let _ = event_tx.send(TransportEvent::Error(Error::WebSocketConnect {
                                message: e.to_string(),
                                status: None,
                            }));
                            break;
                        }
                        None => {
                            tracing::info!("Control socket stream ended");
                            let _ = event_tx.send(TransportEvent::Closed {
                                code: None,
                                reason: String::new(),
                            });
                            break;
                        }
                    };
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Control socket reader exiting");
    });

    Ok(Connection {
        transport: Box::new(WebSocketTransport {
            outbound: out_tx,
            cancel,
        }),
        events: event_rx,
    })
}

/// Map a handshake failure, keeping the HTTP status of a rejected upgrade.
fn handshake_error(err: tungstenite::Error) -> Error {
    let status = match &err {
        tungstenite::Error::Http(response) => Some(response.status().as_u16()),
        _ => None,
    };
    Error::WebSocketConnect {
        message: err.to_string(),
        status,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use url::Url;

    async fn local_url(listener: &TcpListener) -> Url {
        let addr = listener.local_addr().unwrap();
        Url::parse(&format!("ws://{addr}/control/websocket?bearer_token=abc")).unwrap()
    }

    #[tokio::test]
    async fn text_frames_and_pong_are_mapped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = local_url(&listener).await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    if text.as_str() == "ping" {
                        ws.send(Message::text("pong")).await.unwrap();
                    } else {
                        ws.send(Message::text(format!("echo:{}", text.as_str())))
                            .await
                            .unwrap();
                    }
                }
            }
        });

        let mut conn = WebSocketConnector::new()
            .connect(ConnectRequest { url, cookie: None })
            .await
            .unwrap();

        conn.transport.send("ping".into()).unwrap();
        assert!(matches!(conn.events.recv().await, Some(TransportEvent::Pong)));

        conn.transport.send("hello".into()).unwrap();
        match conn.events.recv().await {
            Some(TransportEvent::Message(text)) => assert_eq!(text, "echo:hello"),
            other => panic!("unexpected event: {other:?}"),
        }

        conn.transport.close();
        assert!(matches!(
            conn.transport.send("late".into()),
            Err(Error::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn rejected_upgrade_carries_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = local_url(&listener).await;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0_u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            stream.shutdown().await.unwrap();
        });

        let err = WebSocketConnector::new()
            .connect(ConnectRequest { url, cookie: None })
            .await
            .unwrap_err();
        assert!(err.is_unauthorized(), "got {err:?}");
    }
}
