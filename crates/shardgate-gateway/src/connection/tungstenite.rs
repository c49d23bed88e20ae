//! `tokio-tungstenite` transport

use super::transport::{
    OutgoingFrame, Transport, TransportConnection, TransportError, TransportEvent, TransportSink,
};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket transport over `tokio-tungstenite`
#[derive(Debug, Clone)]
pub struct TungsteniteTransport {
    event_buffer: usize,
}

impl TungsteniteTransport {
    /// Inbound events buffered per connection
    pub const DEFAULT_EVENT_BUFFER: usize = 256;

    #[must_use]
    pub fn new() -> Self {
        Self {
            event_buffer: Self::DEFAULT_EVENT_BUFFER,
        }
    }

    #[must_use]
    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer.max(1);
        self
    }
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> Result<TransportConnection, TransportError> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, mut stream) = socket.split();
        let (tx, rx) = mpsc::channel(self.event_buffer);

        let reader = tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                let event = match next {
                    Ok(Message::Text(text)) => TransportEvent::Message {
                        data: text.into_bytes(),
                        binary: false,
                    },
                    Ok(Message::Binary(data)) => TransportEvent::Message { data, binary: true },
                    Ok(Message::Ping(payload)) => TransportEvent::Ping(payload),
                    Ok(Message::Pong(payload)) => TransportEvent::Pong(payload),
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame.map_or((None, String::new()), |f| {
                            (Some(u16::from(f.code)), f.reason.into_owned())
                        });
                        let _ = tx.send(TransportEvent::Close { code, reason }).await;
                        return;
                    }
                    Ok(Message::Frame(_)) => continue,
                    Err(e) => {
                        let _ = tx.send(TransportEvent::Error(e.to_string())).await;
                        return;
                    }
                };

                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });

        Ok(TransportConnection {
            sink: Box::new(TungsteniteSink { sink, reader }),
            events: rx,
        })
    }
}

struct TungsteniteSink {
    sink: WsSink,
    reader: JoinHandle<()>,
}

#[async_trait]
impl TransportSink for TungsteniteSink {
    async fn send(&mut self, frame: OutgoingFrame) -> Result<(), TransportError> {
        let message = match frame {
            OutgoingFrame::Text(text) => Message::Text(text),
            OutgoingFrame::Binary(data) => Message::Binary(data),
            OutgoingFrame::Ping(payload) => Message::Ping(payload),
            OutgoingFrame::Pong(payload) => Message::Pong(payload),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let result = self
            .sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Send(e.to_string()));
        let _ = self.sink.close().await;
        result
    }
}

impl Drop for TungsteniteSink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
