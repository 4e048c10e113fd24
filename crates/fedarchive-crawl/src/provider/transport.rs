//! WebSocket transport shared by the built-in providers.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::{Error, Result};

const USER_AGENT: &str = concat!("Mozilla/5.0 (compatible; fedarchive/", env!("CARGO_PKG_VERSION"), ")");

/// One data frame read from the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// A connected WebSocket.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl WsTransport {
    /// Dial `url`, optionally with a bearer token.
    pub async fn connect(url: &str, bearer: Option<&str>) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::Connection(format!("{url}: {e}")))?;

        let headers = request.headers_mut();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        if let Some(token) = bearer {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Connection(format!("invalid token: {e}")))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| Error::Connection(format!("{url}: {e}")))?;

        tracing::debug!("WebSocket handshake with {} returned {}", url, response.status());
        Ok(Self {
            stream,
            closed: false,
        })
    }

    /// Send a text frame.
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::Subscription(e.to_string()))
    }

    /// Wait for the next data frame.
    ///
    /// Control frames are skipped. A close frame or the end of the stream is
    /// reported as a receive error so the session reconnects.
    pub async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(Error::Receive(e.to_string())),
                None => return Err(Error::Receive("stream ended".to_string())),
            };

            match message {
                Message::Text(text) => return Ok(Frame::Text(text)),
                Message::Binary(bytes) => return Ok(Frame::Binary(bytes)),
                Message::Close(frame) => {
                    self.closed = true;
                    let reason = frame
                        .map(|f| format!("{} {}", f.code, f.reason))
                        .unwrap_or_else(|| "no reason".to_string());
                    return Err(Error::Receive(format!("closed by peer: {reason}")));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    /// Close the socket. Repeated calls are no-ops.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(Error::Connection(format!("close failed: {e}"))),
        }
    }
}
