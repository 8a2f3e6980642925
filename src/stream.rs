use crate::transport::{
    BatchHandle, BatchTransport, Result, TransportMode, stream_base,
};
use async_trait::async_trait;
use cvcore::progress::ProgressEvent;
use cvcore::request::BatchRequest;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const STREAM_PATH: &str = "/progress";

/// Server-push transport: one WebSocket connection per batch operation. The
/// request goes out as a single text frame, then the server streams progress
/// events until a terminal one.
pub struct StreamingTransport {
    url: String,
}

impl StreamingTransport {
    pub fn new(endpoint: &str) -> Self {
        Self {
            url: format!("{}{}", stream_base(endpoint), STREAM_PATH),
        }
    }
}

#[async_trait]
impl BatchTransport for StreamingTransport {
    async fn start(&self, request: BatchRequest) -> Result<BatchHandle> {
        info!(target: "Stream", "Dialing {}", self.url);
        let (ws, _response) = connect_async(self.url.as_str()).await?;
        let (mut sink, stream) = ws.split();

        let body = request.to_json()?;
        debug!(target: "Stream", "--> Sending {} request", request.kind().as_str());
        sink.send(Message::text(body)).await?;

        let (event_tx, event_rx) = mpsc::channel(100);
        let (close_tx, close_rx) = watch::channel(false);
        tokio::task::spawn(read_pump(stream, sink, event_tx, close_rx));

        Ok(BatchHandle::new(event_rx, Some(close_tx)))
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Streaming
    }
}

async fn read_pump(
    mut stream: WsStream,
    mut sink: WsSink,
    event_tx: mpsc::Sender<ProgressEvent>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut saw_terminal = false;
    let mut closed_by_consumer = false;

    loop {
        tokio::select! {
            // Fires when the consumer closes the handle, or drops it.
            _ = close_rx.changed() => {
                trace!(target: "Stream", "Consumer closed the stream");
                closed_by_consumer = true;
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match ProgressEvent::from_json(text.as_str()) {
                        Ok(event) => {
                            debug!(target: "Stream", "<-- {} event", event.type_name());
                            let terminal = event.is_terminal();
                            if event_tx.send(event).await.is_err() {
                                warn!(target: "Stream", "Event receiver dropped, closing read pump");
                                closed_by_consumer = true;
                                break;
                            }
                            if terminal {
                                saw_terminal = true;
                                break;
                            }
                        }
                        // A single corrupt message must not abort the operation.
                        Err(e) => {
                            warn!(target: "Stream", "Skipping undecodable progress message: {e}");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    trace!(target: "Stream", "Received close frame");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(target: "Stream", "Error reading from websocket: {e}");
                    break;
                }
                None => {
                    trace!(target: "Stream", "Websocket stream ended");
                    break;
                }
            }
        }
    }

    if saw_terminal {
        let _ = sink.send(Message::Close(None)).await;
    } else if !closed_by_consumer {
        // The connection dropped mid-operation; surface it as a terminal
        // error event so downstream handling stays uniform.
        let _ = event_tx
            .send(ProgressEvent::Error {
                message: "connection to the decrypt service was lost before the operation finished"
                    .to_string(),
            })
            .await;
    }
}
