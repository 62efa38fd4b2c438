//! Structural and semantic validation of inbound envelopes.
//!
//! `validate` is a pure function of the request bytes: no I/O, no clock, no
//! shared state.

use crate::envelope::Envelope;
use crate::error::ValidationError;
use serde_json::Value;

/// Required fields, checked in this order. The first empty one is reported.
pub const REQUIRED_FIELDS: [&str; 4] = [
    "eventId",
    "eventType",
    "workspaceSlug",
    "metadata.idempotencyKey",
];

pub fn validate(raw: &[u8]) -> Result<Envelope, ValidationError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| ValidationError::MalformedBody(e.to_string()))?;
    if !value.is_object() {
        return Err(ValidationError::MalformedBody(
            "expected a JSON object".to_string(),
        ));
    }
    let envelope: Envelope =
        serde_json::from_value(value).map_err(|e| ValidationError::MalformedBody(e.to_string()))?;

    if let Some(field) = first_missing_field(&envelope) {
        return Err(ValidationError::MissingField(field));
    }
    Ok(envelope)
}

fn first_missing_field(env: &Envelope) -> Option<&'static str> {
    let values = [
        env.event_id.as_str(),
        env.event_type.as_str(),
        env.workspace_slug.as_str(),
        env.metadata.idempotency_key.as_str(),
    ];
    REQUIRED_FIELDS
        .iter()
        .zip(values)
        .find(|(_, v)| v.trim().is_empty())
        .map(|(name, _)| *name)
}
