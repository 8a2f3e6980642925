use serde::{Deserialize, Serialize};

use crate::progress::{CompletionSummary, OperationKind, ProgressEvent};

/// A batch decrypt request, sent as one JSON object over either transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchRequest {
    DecryptDatabase {
        account: String,
        storage_path: String,
        db_key: String,
    },
    DecryptMedia {
        account: String,
        storage_path: String,
        /// Canonical `0xHH` form.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        xor_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aes_key: Option<String>,
    },
}

impl BatchRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            BatchRequest::DecryptDatabase { .. } => OperationKind::Database,
            BatchRequest::DecryptMedia { .. } => OperationKind::Media,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Response body of the blocking single-call fallback. Count fields mirror a
/// terminal `complete` event and are flattened alongside the status.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FallbackResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(flatten)]
    pub summary: CompletionSummary,
}

impl FallbackResponse {
    /// Converts the one-shot response into the terminal event it is
    /// equivalent to, so downstream handling is identical to the stream path.
    pub fn into_terminal_event(self) -> ProgressEvent {
        match self.status.as_str() {
            "completed" => ProgressEvent::Complete(self.summary),
            _ => ProgressEvent::Error {
                message: self.message.unwrap_or_else(|| {
                    format!("decrypt service reported status {:?}", self.status)
                }),
            },
        }
    }
}

/// Response of the cloud key lookup. `status` 0 means success; a missing key
/// field means "not obtained", not an error.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct KeyFetchResponse {
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub db_key: Option<String>,
    #[serde(default)]
    pub xor_key: Option<String>,
    #[serde(default)]
    pub aes_key: Option<String>,
}

impl KeyFetchResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_request_wire_shape() {
        let request = BatchRequest::DecryptDatabase {
            account: "acct-1".into(),
            storage_path: "/data".into(),
            db_key: "ab".repeat(32),
        };
        let value: serde_json::Value =
            serde_json::from_str(&request.to_json().unwrap()).unwrap();
        assert_eq!(value["op"], "decrypt_database");
        assert_eq!(value["account"], "acct-1");
        assert_eq!(value["storage_path"], "/data");
        assert_eq!(value["db_key"], "ab".repeat(32));
    }

    #[test]
    fn media_request_omits_absent_keys() {
        let request = BatchRequest::DecryptMedia {
            account: "acct-1".into(),
            storage_path: "/data".into(),
            xor_key: Some("0xA5".into()),
            aes_key: None,
        };
        let value: serde_json::Value =
            serde_json::from_str(&request.to_json().unwrap()).unwrap();
        assert_eq!(value["op"], "decrypt_media");
        assert_eq!(value["xor_key"], "0xA5");
        assert!(value.get("aes_key").is_none());
        assert_eq!(request.kind(), OperationKind::Media);
    }

    #[test]
    fn completed_fallback_becomes_complete_event() {
        let response: FallbackResponse = serde_json::from_str(
            r#"{"status":"completed","success_count":7,"failure_count":2,"output_dir":"/out"}"#,
        )
        .unwrap();
        match response.into_terminal_event() {
            ProgressEvent::Complete(summary) => {
                assert_eq!(summary.success_count, Some(7));
                assert_eq!(summary.failure_count, Some(2));
                assert_eq!(summary.output_dir.as_deref(), Some("/out"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn failed_fallback_becomes_error_event() {
        let response: FallbackResponse =
            serde_json::from_str(r#"{"status":"failed","message":"wrong key"}"#).unwrap();
        assert_eq!(
            response.into_terminal_event(),
            ProgressEvent::Error {
                message: "wrong key".into()
            }
        );

        let response: FallbackResponse = serde_json::from_str(r#"{"status":"failed"}"#).unwrap();
        match response.into_terminal_event() {
            ProgressEvent::Error { message } => assert!(message.contains("failed")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn key_fetch_response_defaults() {
        let response: KeyFetchResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(response.is_ok());
        assert_eq!(response.xor_key, None);

        let response: KeyFetchResponse =
            serde_json::from_str(r#"{"status":-2,"xor_key":"a5"}"#).unwrap();
        assert!(!response.is_ok());
        assert_eq!(response.xor_key.as_deref(), Some("a5"));
    }
}
