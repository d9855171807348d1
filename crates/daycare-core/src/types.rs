use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Unique identifier for an agent.
pub type AgentId = String;

/// Milliseconds since the Unix epoch. Every history timestamp uses this unit.
pub type Millis = i64;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> Millis {
    chrono::Utc::now().timestamp_millis()
}

/// Fresh identifier for a script block's tool-call chain.
pub fn new_tool_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// A file attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// One entry of the model provider priority list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Registry id of the provider implementation.
    pub id: String,
    /// Model to request from that provider.
    pub model: String,
    /// Provider-specific options (auth, endpoints, ...), passed through untouched.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

/// Resource limits applied to every interpreter start and resume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlmLimits {
    pub max_duration_secs: f64,
    pub max_memory: u64,
    pub max_recursion_depth: u32,
    pub max_allocations: u64,
}

impl Default for RlmLimits {
    fn default() -> Self {
        Self {
            max_duration_secs: 30.0,
            max_memory: 50 * 1024 * 1024,
            max_recursion_depth: 100,
            max_allocations: 1_000_000,
        }
    }
}

/// Opaque paused interpreter state.
///
/// Only the interpreter worker knows how to read the bytes. Everywhere else it is
/// carried around untouched and serialized as base64.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Snapshot(Vec<u8>);

impl Snapshot {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> std::result::Result<Self, base64::DecodeError> {
        BASE64.decode(encoded).map(Self)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Snapshot({} bytes)", self.0.len())
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Snapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}
