use crate::error::{AppError, Result};
use crate::idempotency::response::{IdempotentResponse, StoredResponse};
use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Marker accepted in place of a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSentinel {
    /// Replay the status of the first response.
    Original,
}

/// `CONFLICT_STATUS_CODE` as it appears in settings: a number, or `"original"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConflictStatusSetting {
    Code(u16),
    Sentinel(ConflictSentinel),
}

impl Default for ConflictStatusSetting {
    fn default() -> Self {
        ConflictStatusSetting::Code(StatusCode::CONFLICT.as_u16())
    }
}

/// What a duplicate request receives when not in manual mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    Fixed(StatusCode),
    ReplayOriginal,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::Fixed(StatusCode::CONFLICT)
    }
}

impl TryFrom<ConflictStatusSetting> for ConflictPolicy {
    type Error = AppError;

    fn try_from(setting: ConflictStatusSetting) -> Result<Self> {
        match setting {
            ConflictStatusSetting::Code(code) => StatusCode::from_u16(code)
                .map(ConflictPolicy::Fixed)
                .map_err(|_| {
                    AppError::Configuration(format!("Invalid conflict status code: {}", code))
                }),
            ConflictStatusSetting::Sentinel(ConflictSentinel::Original) => {
                Ok(ConflictPolicy::ReplayOriginal)
            }
        }
    }
}

impl ConflictPolicy {
    pub fn replays_original(&self) -> bool {
        matches!(self, ConflictPolicy::ReplayOriginal)
    }

    /// Builds the response for a duplicate request.
    ///
    /// `original` is only consulted when replaying; without it a bare 409 is returned.
    pub fn resolve(&self, original: Option<StoredResponse>) -> Result<IdempotentResponse> {
        match (self, original) {
            (ConflictPolicy::Fixed(status), _) => Ok(IdempotentResponse::new(*status)),
            (ConflictPolicy::ReplayOriginal, Some(stored)) => IdempotentResponse::try_from(stored),
            (ConflictPolicy::ReplayOriginal, None) => Ok(IdempotentResponse::new(StatusCode::CONFLICT)),
        }
    }
}
