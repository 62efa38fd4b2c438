use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// `null` decodes like an absent field, so a null required field is reported
// as missing rather than malformed.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventEntity {
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_email: Option<String>,
}

/// Caller-submitted event record. Field names on the wire are camelCase.
///
/// Every field defaults when absent so that a structurally valid body with a
/// missing field surfaces as `MissingField` rather than `MalformedBody`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, deserialize_with = "null_as_default")]
    pub event_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub event_type: String,
    /// Caller clock, carried through untouched. Never used for ordering.
    #[serde(default)]
    pub occurred_at: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub workspace_slug: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub entity: EventEntity,
    #[serde(default, deserialize_with = "null_as_default")]
    pub payload: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: EventMetadata,
}

impl Envelope {
    pub fn idempotency_key(&self) -> &str {
        &self.metadata.idempotency_key
    }

    pub fn correlation_id(&self) -> &str {
        &self.metadata.correlation_id
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Pending,
    Dispatched,
    /// Terminal: the stored envelope could not be decoded. Kept for recovery tooling.
    Failed,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchState::Pending => "pending",
            DispatchState::Dispatched => "dispatched",
            DispatchState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DispatchState::Pending),
            "dispatched" => Some(DispatchState::Dispatched),
            "failed" => Some(DispatchState::Failed),
            _ => None,
        }
    }
}

/// Retry bookkeeping stored next to each staged record.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct RetryState {
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_delay_ms: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StagedRecord {
    pub sequence_number: u64,
    pub received_at: DateTime<Utc>,
    pub dispatch_state: DispatchState,
    pub retry: RetryState,
    pub envelope: Envelope,
}
