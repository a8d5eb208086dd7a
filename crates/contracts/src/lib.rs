//! Wire contracts shared by the world kernel, the session layer and the world manager.

pub mod protocol;
pub mod transfer;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use protocol::*;
pub use transfer::{AgentTransfer, MemoryEntryTransfer, OrgTransfer};

pub const PROTOCOL_VERSION_1_0: &str = "1.0";
pub const PROTOCOL_VERSION_1_1: &str = "1.1";
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 2] = [PROTOCOL_VERSION_1_0, PROTOCOL_VERSION_1_1];

pub const CHUNK_SIZE_X: i32 = 16;
pub const CHUNK_SIZE_Z: i32 = 16;
pub const WORLD_HEIGHT: i32 = 1;

/// Events are open JSON objects keyed by field name. `type` and `t` are always present.
pub type Event = Map<String, Value>;

/// Picks the highest version offered by the client that this server also speaks.
pub fn select_protocol_version(offered: &[String], fallback: &str) -> Option<&'static str> {
    let mut candidates: Vec<&str> = offered.iter().map(String::as_str).collect();
    if candidates.is_empty() && !fallback.is_empty() {
        candidates.push(fallback);
    }
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .rev()
        .copied()
        .find(|supported| candidates.contains(supported))
}

pub fn is_supported_protocol_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorCode {
    #[serde(rename = "E_PROTO_BAD_REQUEST")]
    ProtoBadRequest,
    #[serde(rename = "E_BAD_REQUEST")]
    BadRequest,
    #[serde(rename = "E_INVALID_TARGET")]
    InvalidTarget,
    #[serde(rename = "E_BLOCKED")]
    Blocked,
    #[serde(rename = "E_NO_RESOURCE")]
    NoResource,
    #[serde(rename = "E_NO_PERMISSION")]
    NoPermission,
    #[serde(rename = "E_CONFLICT")]
    Conflict,
    #[serde(rename = "E_RATE_LIMIT")]
    RateLimit,
    #[serde(rename = "E_INTERNAL")]
    Internal,
    #[serde(rename = "E_STALE")]
    Stale,
    #[serde(rename = "E_WORLD_BUSY")]
    WorldBusy,
    #[serde(rename = "E_WORLD_DENIED")]
    WorldDenied,
    #[serde(rename = "E_WORLD_NOT_FOUND")]
    WorldNotFound,
    #[serde(rename = "E_WORLD_COOLDOWN")]
    WorldCooldown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProtoBadRequest => "E_PROTO_BAD_REQUEST",
            Self::BadRequest => "E_BAD_REQUEST",
            Self::InvalidTarget => "E_INVALID_TARGET",
            Self::Blocked => "E_BLOCKED",
            Self::NoResource => "E_NO_RESOURCE",
            Self::NoPermission => "E_NO_PERMISSION",
            Self::Conflict => "E_CONFLICT",
            Self::RateLimit => "E_RATE_LIMIT",
            Self::Internal => "E_INTERNAL",
            Self::Stale => "E_STALE",
            Self::WorldBusy => "E_WORLD_BUSY",
            Self::WorldDenied => "E_WORLD_DENIED",
            Self::WorldNotFound => "E_WORLD_NOT_FOUND",
            Self::WorldCooldown => "E_WORLD_COOLDOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body returned by the admin HTTP surface on failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub ok: bool,
    pub error: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: message.into(),
        }
    }
}

/// Entry in the world manifest sent with WELCOME.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorldRef {
    pub world_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub world_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entry_point_id: String,
    #[serde(default)]
    pub requires_permit: bool,
    #[serde(default)]
    pub switch_cooldown_ticks: u64,
    #[serde(default)]
    pub reset_every_ticks: u64,
    #[serde(default)]
    pub reset_notice_ticks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_highest_common_version() {
        let offered = vec!["1.0".to_string(), "1.1".to_string(), "2.0".to_string()];
        assert_eq!(select_protocol_version(&offered, ""), Some("1.1"));

        let only_old = vec!["1.0".to_string()];
        assert_eq!(select_protocol_version(&only_old, ""), Some("1.0"));
    }

    #[test]
    fn falls_back_to_hello_version_when_list_is_empty() {
        assert_eq!(select_protocol_version(&[], "1.0"), Some("1.0"));
        assert_eq!(select_protocol_version(&[], "0.9"), None);
        assert_eq!(select_protocol_version(&["3.0".to_string()], "1.1"), None);
    }

    #[test]
    fn error_codes_serialize_as_wire_names() {
        let raw = serde_json::to_string(&ErrorCode::RateLimit).expect("serialize");
        assert_eq!(raw, "\"E_RATE_LIMIT\"");
        let parsed: ErrorCode = serde_json::from_str("\"E_NO_PERMISSION\"").expect("parse");
        assert_eq!(parsed, ErrorCode::NoPermission);
        assert_eq!(ErrorCode::ProtoBadRequest.to_string(), "E_PROTO_BAD_REQUEST");
    }
}
