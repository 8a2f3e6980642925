use crate::transport::{
    BatchHandle, BatchTransport, Result, TransportError, TransportMode, http_base,
};
use async_trait::async_trait;
use cvcore::request::{BatchRequest, FallbackResponse};
use log::{debug, info};
use tokio::sync::mpsc;

const DECRYPT_PATH: &str = "/decrypt";

/// Single-call transport for environments without streaming support: the
/// whole batch runs server-side during one blocking POST, and the response
/// converts to exactly one terminal event. Selected by the capability probe,
/// never as a mid-stream fallback.
pub struct SyncTransport {
    url: String,
}

impl SyncTransport {
    pub fn new(endpoint: &str) -> Self {
        Self {
            url: format!("{}{}", http_base(endpoint), DECRYPT_PATH),
        }
    }
}

#[async_trait]
impl BatchTransport for SyncTransport {
    async fn start(&self, request: BatchRequest) -> Result<BatchHandle> {
        let url = self.url.clone();
        let body = serde_json::to_vec(&request)?;
        info!(
            target: "Fallback",
            "Issuing blocking {} request to {}",
            request.kind().as_str(),
            url
        );

        // ureq is blocking, so the call runs on the blocking pool.
        let response_body = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let response = ureq::post(&url)
                .header("Content-Type", "application/json")
                .send(&body[..])?;
            Ok(response.into_body().read_to_vec()?)
        })
        .await
        .map_err(|e| TransportError::Join(e.to_string()))??;

        let response: FallbackResponse = serde_json::from_slice(&response_body)?;
        let event = response.into_terminal_event();
        debug!(target: "Fallback", "<-- terminal {} snapshot", event.type_name());

        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(event).await;
        Ok(BatchHandle::new(rx, None))
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Sync
    }
}
