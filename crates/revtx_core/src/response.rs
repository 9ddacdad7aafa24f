//! The response envelope pervasive in the RevTx API.
//!
//! Every facade operation returns a [`Response`]: an HTTP-like status code,
//! a message, an optional payload and an extra map. The wire-compatible
//! form is the ordered list `[code, message, payload, extra]`; see
//! [`Response::to_list_value`] and [`Response::from_list_value`].

use serde_json::{Map, Value};

/// Status codes used throughout the manager.
pub mod code {
    /// OK.
    pub const OK: u16 = 200;
    /// No change / nothing to do.
    pub const NO_CHANGE: u16 = 304;
    /// Bad request (malformed name, missing or over-long tx id).
    pub const BAD_REQUEST: u16 = 400;
    /// Duplicate tx id at `begin`.
    pub const DUPLICATE: u16 = 409;
    /// Precondition failed.
    pub const PRECONDITION: u16 = 412;
    /// Transaction has an incompatible status.
    pub const BAD_STATUS: u16 = 480;
    /// No such transaction.
    pub const NO_SUCH_TX: u16 = 484;
    /// Implementation bug or function load failure.
    pub const INTERNAL: u16 = 500;
    /// Operation not implemented.
    pub const NOT_IMPLEMENTED: u16 = 501;
    /// Environmental failure (lock, database, rollback failure).
    pub const ENV_FAILURE: u16 = 532;
}

/// Extra key instructing the request wrapper to skip SQL-tx rollback.
const EXTRA_ROLLBACK: &str = "rollback";
/// Extra key carrying the list of undo calls from a dry-run probe.
const EXTRA_UNDO_DATA: &str = "undo_data";

/// A response envelope: `{code, message, payload, extra}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// HTTP-like status code.
    pub code: u16,
    /// Human-readable message.
    pub message: String,
    /// Optional result payload.
    pub payload: Option<Value>,
    /// Extra metadata (e.g. `rollback`, `undo_data`).
    pub extra: Map<String, Value>,
}

impl Response {
    /// Creates a response with the given code and message.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            payload: None,
            extra: Map::new(),
        }
    }

    /// A `200 OK` response.
    #[must_use]
    pub fn ok() -> Self {
        Self::new(code::OK, "OK")
    }

    /// A `304` response.
    pub fn no_change(message: impl Into<String>) -> Self {
        Self::new(code::NO_CHANGE, message)
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets a key in the extra map.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Attaches dry-run undo data to the extra map.
    #[must_use]
    pub fn with_undo_data(self, undo_data: Value) -> Self {
        self.with_extra(EXTRA_UNDO_DATA, undo_data)
    }

    /// Marks this response so the request wrapper skips SQL-tx rollback.
    #[must_use]
    pub fn without_sqltx_rollback(self) -> Self {
        self.with_extra(EXTRA_ROLLBACK, Value::Bool(false))
    }

    /// Whether the code is a success (`200` or `304`).
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.code, code::OK | code::NO_CHANGE)
    }

    /// Whether the wrapper should skip rolling back its SQL transaction.
    #[must_use]
    pub fn skip_sqltx_rollback(&self) -> bool {
        self.extra.get(EXTRA_ROLLBACK) == Some(&Value::Bool(false))
    }

    /// The `undo_data` extra, if present.
    #[must_use]
    pub fn undo_data(&self) -> Option<&Value> {
        self.extra.get(EXTRA_UNDO_DATA)
    }

    /// Converts to the ordered list form `[code, message, payload, extra]`.
    #[must_use]
    pub fn to_list_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.code),
            Value::from(self.message.clone()),
            self.payload.clone().unwrap_or(Value::Null),
            Value::Object(self.extra.clone()),
        ])
    }

    /// Parses the ordered list form. Returns `None` when the value is not
    /// a well-formed envelope.
    #[must_use]
    pub fn from_list_value(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        let code = u16::try_from(items.first()?.as_u64()?).ok()?;
        let message = items.get(1)?.as_str()?.to_string();
        let payload = match items.get(2) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.clone()),
        };
        let extra = match items.get(3) {
            None | Some(Value::Null) => Map::new(),
            Some(v) => v.as_object()?.clone(),
        };
        Some(Self {
            code,
            message,
            payload,
            extra,
        })
    }
}
