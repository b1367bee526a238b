use crate::error::{AppError, Result};
use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Response produced by a downstream handler, or substituted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl IdempotentResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Replayable form of a response as persisted by record stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(with = "hex::serde", default)]
    pub body: Vec<u8>,
}

impl From<&IdempotentResponse> for StoredResponse {
    fn from(response: &IdempotentResponse) -> Self {
        Self {
            status: response.status.as_u16(),
            headers: response.headers.clone(),
            body: response.body.clone(),
        }
    }
}

impl TryFrom<StoredResponse> for IdempotentResponse {
    type Error = AppError;

    fn try_from(stored: StoredResponse) -> Result<Self> {
        let status = StatusCode::from_u16(stored.status).map_err(|e| {
            AppError::Storage(format!("Stored response has invalid status {}: {}", stored.status, e))
        })?;

        Ok(Self {
            status,
            headers: stored.headers,
            body: stored.body,
        })
    }
}
