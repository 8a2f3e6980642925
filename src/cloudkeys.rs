use crate::transport::http_base;
use async_trait::async_trait;
use cvcore::request::KeyFetchResponse;
use log::debug;
use thiserror::Error;

const KEYS_PATH: &str = "/keys";

pub type Result<T> = std::result::Result<T, KeyServiceError>;

#[derive(Debug, Error)]
pub enum KeyServiceError {
    #[error("HTTP error: {0}")]
    Http(#[from] ureq::Error),

    #[error("undecodable key service response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("key lookup rejected with status {0}")]
    Rejected(i32),

    #[error("blocking task failed: {0}")]
    Join(String),
}

/// Cloud lookup of an account's credential bundle. Any subset of the keys
/// may come back; a missing field means "not obtained", not an error.
#[async_trait]
pub trait KeyService: Send + Sync {
    async fn fetch_account_keys(&self, account: &str) -> Result<KeyFetchResponse>;
}

pub struct HttpKeyService {
    url: String,
}

impl HttpKeyService {
    pub fn new(endpoint: &str) -> Self {
        Self {
            url: format!("{}{}", http_base(endpoint), KEYS_PATH),
        }
    }
}

#[async_trait]
impl KeyService for HttpKeyService {
    async fn fetch_account_keys(&self, account: &str) -> Result<KeyFetchResponse> {
        let url = format!("{}?account={}", self.url, urlencoding::encode(account));
        debug!(target: "Workflow/Backfill", "Requesting account keys from {url}");

        let body = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let response = ureq::get(&url).call()?;
            Ok(response.into_body().read_to_vec()?)
        })
        .await
        .map_err(|e| KeyServiceError::Join(e.to_string()))??;

        let response: KeyFetchResponse = serde_json::from_slice(&body)?;
        if !response.is_ok() {
            return Err(KeyServiceError::Rejected(response.status));
        }
        Ok(response)
    }
}
