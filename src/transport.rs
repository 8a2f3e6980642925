use async_trait::async_trait;
use cvcore::progress::ProgressEvent;
use cvcore::request::BatchRequest;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] ureq::Error),

    #[error("request/response codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(String),
}

/// Which of the two transports the capability probe selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Streaming,
    Sync,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Streaming => "streaming",
            TransportMode::Sync => "sync",
        }
    }
}

/// A started batch operation: an ordered sequence of progress events plus an
/// explicit early-close signal. The sequence ends after a terminal event, on
/// transport failure (after a synthetic `error` event), or once closed.
pub struct BatchHandle {
    events: mpsc::Receiver<ProgressEvent>,
    close_tx: Option<watch::Sender<bool>>,
}

impl BatchHandle {
    pub fn new(
        events: mpsc::Receiver<ProgressEvent>,
        close_tx: Option<watch::Sender<bool>>,
    ) -> Self {
        Self { events, close_tx }
    }

    /// Waits for the next event. `None` means the stream is over.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Closes the stream before its terminal event. Not an error: no further
    /// events are delivered, and the producer shuts down. Idempotent.
    pub fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(true);
        }
        self.events.close();
    }
}

/// The streaming/fallback duality behind one seam. The controller picks an
/// implementation once (capability probe) and never special-cases it again.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn start(&self, request: BatchRequest) -> Result<BatchHandle>;

    fn mode(&self) -> TransportMode;
}

/// Selects the transport from the endpoint scheme, once, before any
/// operation starts. `ws`/`wss` endpoints stream; anything else (or the
/// force flag) uses the blocking single-call fallback.
pub fn probe_transport_mode(endpoint: &str, force_sync: bool) -> TransportMode {
    if force_sync {
        return TransportMode::Sync;
    }
    let scheme = endpoint
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .unwrap_or_default();
    match scheme.as_str() {
        "ws" | "wss" => TransportMode::Streaming,
        _ => TransportMode::Sync,
    }
}

/// WebSocket base for the configured endpoint (`http`→`ws`, `https`→`wss`).
pub fn stream_base(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        endpoint.to_string()
    }
}

/// HTTP base for the configured endpoint (`ws`→`http`, `wss`→`https`), used
/// by the fallback transport and the cloud key lookup.
pub fn http_base(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("ws://") {
        format!("http://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("wss://") {
        format!("https://{rest}")
    } else {
        endpoint.to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_follows_endpoint_scheme() {
        assert_eq!(
            probe_transport_mode("ws://vault.local:8777", false),
            TransportMode::Streaming
        );
        assert_eq!(
            probe_transport_mode("wss://vault.example.com", false),
            TransportMode::Streaming
        );
        assert_eq!(
            probe_transport_mode("WSS://vault.example.com", false),
            TransportMode::Streaming
        );
        assert_eq!(
            probe_transport_mode("http://vault.local:8777", false),
            TransportMode::Sync
        );
        assert_eq!(
            probe_transport_mode("https://vault.example.com", false),
            TransportMode::Sync
        );
        assert_eq!(
            probe_transport_mode("vault.local", false),
            TransportMode::Sync
        );
    }

    #[test]
    fn force_sync_overrides_streaming_scheme() {
        assert_eq!(
            probe_transport_mode("wss://vault.example.com", true),
            TransportMode::Sync
        );
    }

    #[test]
    fn sibling_bases_swap_schemes() {
        assert_eq!(stream_base("http://h:1"), "ws://h:1");
        assert_eq!(stream_base("https://h"), "wss://h");
        assert_eq!(stream_base("wss://h"), "wss://h");
        assert_eq!(http_base("ws://h:1"), "http://h:1");
        assert_eq!(http_base("wss://h"), "https://h");
        assert_eq!(http_base("https://h"), "https://h");
    }

    #[tokio::test]
    async fn closing_a_handle_ends_the_sequence() {
        let (tx, rx) = mpsc::channel(4);
        let (close_tx, close_rx) = watch::channel(false);
        let mut handle = BatchHandle::new(rx, Some(close_tx));

        tx.send(ProgressEvent::Start { total: 1 }).await.unwrap();
        assert_eq!(
            handle.next_event().await,
            Some(ProgressEvent::Start { total: 1 })
        );

        handle.close();
        assert!(*close_rx.borrow());
        assert!(tx
            .send(ProgressEvent::Error {
                message: "late".into()
            })
            .await
            .is_err());
        assert_eq!(handle.next_event().await, None);
    }
}
