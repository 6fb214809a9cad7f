//! Parley wire format: the JSON envelope carried inside every relay event.
//!
//! These types ARE the protocol. Field names are camelCase on the wire and
//! only chunk 0 carries the exchange metadata (`chunkCount`, `senderId`,
//! `maxResponseSize`). Authenticity is attached after decode by the relay
//! boundary and never serialized.

use crate::crypto::PublicId;
use crate::error::{ErrorKind, ParleyError, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Correlation id prefix of a request exchange.
pub const REQUEST_PREFIX: &str = "req";

/// Correlation id prefix of a response exchange.
pub const RESPONSE_PREFIX: &str = "res";

/// Relay event kind used for parley traffic unless configured otherwise.
pub const DEFAULT_EVENT_KIND: u16 = 28_080;

/// Exchange lifetime when neither the caller nor the config picks one.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ── Correlation ids ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Request,
    Response,
}

/// Identifies one request/response pair.
///
/// The request uses `req<suffix>` and its response `res<suffix>`; the
/// registry always keys on the request form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Validate an id taken from the wire or the application.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.starts_with(REQUEST_PREFIX) || id.starts_with(RESPONSE_PREFIX) {
            Ok(Self(id))
        } else {
            Err(ParleyError::new(
                ErrorKind::InvalidEnvelope,
                format!("correlation id {id:?} must start with {REQUEST_PREFIX} or {RESPONSE_PREFIX}"),
            ))
        }
    }

    /// Fresh request id: `req.` followed by 16 lowercase hex chars.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(format!("{REQUEST_PREFIX}.{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> ExchangeKind {
        if self.is_response() {
            ExchangeKind::Response
        } else {
            ExchangeKind::Request
        }
    }

    pub fn is_request(&self) -> bool {
        self.0.starts_with(REQUEST_PREFIX)
    }

    pub fn is_response(&self) -> bool {
        self.0.starts_with(RESPONSE_PREFIX)
    }

    /// Text after the three-character prefix.
    pub fn suffix(&self) -> &str {
        self.0.get(REQUEST_PREFIX.len()..).unwrap_or_default()
    }

    pub fn request_form(&self) -> CorrelationId {
        Self(format!("{REQUEST_PREFIX}{}", self.suffix()))
    }

    pub fn response_form(&self) -> CorrelationId {
        Self(format!("{RESPONSE_PREFIX}{}", self.suffix()))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Authenticity ──────────────────────────────────────────────────────────────

/// Transport-level verdict on whether an event's signature checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Authenticity {
    Valid,
    Invalid,
    #[default]
    Unknown,
}

impl Authenticity {
    /// Aggregate verdict over a set of chunks: any `Invalid` taints the whole
    /// set, `Valid` requires every chunk to be valid.
    pub fn combine<I>(verdicts: I) -> Authenticity
    where
        I: IntoIterator<Item = Authenticity>,
    {
        let mut all_valid = true;
        let mut any = false;
        for v in verdicts {
            any = true;
            match v {
                Authenticity::Invalid => return Authenticity::Invalid,
                Authenticity::Unknown => all_valid = false,
                Authenticity::Valid => {}
            }
        }
        if any && all_valid {
            Authenticity::Valid
        } else {
            Authenticity::Unknown
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// One chunk as it travels through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub correlation_id: CorrelationId,
    pub chunk_index: u64,
    /// Exchange-wide expiry, Unix milliseconds.
    pub deadline: u64,
    pub payload_fragment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<PublicId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_size: Option<u64>,
}

impl Envelope {
    pub fn is_first(&self) -> bool {
        self.chunk_index == 0
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate an inbound envelope.
    ///
    /// Every violation is collected; the resulting `InvalidEnvelope` error
    /// carries them as `{"errors": [...]}`.
    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| {
            invalid(vec![format!("envelope is not valid JSON: {e}")])
        })?;
        let Some(obj) = value.as_object() else {
            return Err(invalid(vec!["envelope must be a JSON object".into()]));
        };

        let violations = violations(obj);
        if !violations.is_empty() {
            return Err(invalid(violations));
        }
        serde_json::from_value(value).map_err(|e| invalid(vec![e.to_string()]))
    }
}

fn invalid(errors: Vec<String>) -> ParleyError {
    ParleyError::new(ErrorKind::InvalidEnvelope, "malformed envelope")
        .with_data(json!({ "errors": errors }))
}

fn violations(obj: &Map<String, Value>) -> Vec<String> {
    let mut errors = Vec::new();

    match obj.get("correlationId").and_then(Value::as_str) {
        Some(id) if id.starts_with(REQUEST_PREFIX) || id.starts_with(RESPONSE_PREFIX) => {}
        Some(_) => errors.push(format!(
            "correlationId must start with {REQUEST_PREFIX} or {RESPONSE_PREFIX}"
        )),
        None => errors.push("correlationId must be a string".into()),
    }

    let chunk_index = check_integer(obj, "chunkIndex", 0, true, &mut errors);
    check_integer(obj, "deadline", 0, true, &mut errors);

    if !obj.get("payloadFragment").is_some_and(Value::is_string) {
        errors.push("payloadFragment must be a string".into());
    }

    if chunk_index == Some(0) {
        check_integer(obj, "chunkCount", 1, true, &mut errors);
        match obj.get("senderId").and_then(Value::as_str) {
            Some(s) if PublicId::parse(s).is_ok() => {}
            _ => errors.push("senderId must be a 64-character hex string".into()),
        }
    }

    check_integer(obj, "maxResponseSize", 1, false, &mut errors);
    errors
}

/// Checks that `field` is an integer `>= min`. Returns the value when valid.
fn check_integer(
    obj: &Map<String, Value>,
    field: &str,
    min: u64,
    required: bool,
    errors: &mut Vec<String>,
) -> Option<u64> {
    let Some(v) = obj.get(field) else {
        if required {
            errors.push(format!("{field} is required"));
        }
        return None;
    };
    if let Some(n) = v.as_u64() {
        if n >= min {
            return Some(n);
        }
        errors.push(format!("{field} must be >= {min}"));
    } else if v.as_i64().is_some() {
        errors.push(format!("{field} must be >= {min}"));
    } else {
        errors.push(format!("{field} must be an integer"));
    }
    None
}
