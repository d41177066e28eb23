//! Message model and Content-Length framing for the lspmux wire protocol.
//!
//! A message is an opaque JSON-RPC envelope. Three shapes exist, told apart
//! by the presence of the `method` and `id` fields:
//!
//! - *request*: `method` and `id`;
//! - *response*: `id` without `method`, carrying `result` or `error`;
//! - *notification*: `method` without `id`.
//!
//! The full body object is kept verbatim; the router only ever rewrites the
//! `id` field before re-serializing. Everything else round-trips untouched.

mod codec;

pub use self::codec::LspCodec;

use core::fmt;

use serde_json::{Map, Value};

/// JSON-RPC message identifier: integer, string or null.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Int(i64),
    Str(String),
    Null,
}

impl MessageId {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MessageId::Int(value) => Some(*value),
            _ => None,
        }
    }

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(MessageId::Int),
            Value::String(string) => Some(MessageId::Str(string.clone())),
            Value::Null => Some(MessageId::Null),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            MessageId::Int(value) => Value::from(*value),
            MessageId::Str(value) => Value::from(value.clone()),
            MessageId::Null => Value::Null,
        }
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        MessageId::Int(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Int(value) => write!(f, "#{value}"),
            MessageId::Str(value) => write!(f, "{value:?}"),
            MessageId::Null => write!(f, "null"),
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    MissingContentLength,
    InvalidContentLength { value: String },
    HeaderBlockOversized { size: usize, max: usize },
    TruncatedMessage { missing: usize },
    InvalidBody(serde_json::Error),
    InvalidEnvelope { reason: &'static str },
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::InvalidBody(source) => Some(source),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MissingContentLength => {
                write!(f, "header block without a well-formed Content-Length")
            }
            Error::InvalidContentLength { value } => {
                write!(f, "invalid Content-Length value: `{value}`")
            }
            Error::HeaderBlockOversized { size, max } => {
                write!(f, "header block oversized: max is {max}, got at least {size}")
            }
            Error::TruncatedMessage { missing } => {
                write!(f, "stream ended mid-message: {missing} more bytes expected")
            }
            Error::InvalidBody(source) => write!(f, "invalid message body: {source}"),
            Error::InvalidEnvelope { reason } => write!(f, "invalid envelope: {reason}"),
        }
    }
}

/// A decoded JSON-RPC envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Classifies a JSON value into one of the three message shapes.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let Value::Object(body) = value else {
            return Err(Error::InvalidEnvelope {
                reason: "message is not a JSON object",
            });
        };

        let has_method = match body.get("method") {
            Some(Value::String(_)) => true,
            Some(_) => {
                return Err(Error::InvalidEnvelope {
                    reason: "`method` is not a string",
                });
            }
            None => false,
        };

        let id = match body.get("id") {
            Some(value) => Some(MessageId::from_json(value).ok_or(Error::InvalidEnvelope {
                reason: "`id` is not an integer, string or null",
            })?),
            None => None,
        };

        match (has_method, id) {
            (true, Some(_)) => Ok(Message::Request(Request { body })),
            (true, None) => Ok(Message::Notification(Notification { body })),
            (false, Some(_)) => Ok(Message::Response(Response { body })),
            (false, None) => Err(Error::InvalidEnvelope {
                reason: "message has neither `method` nor `id`",
            }),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Message::Request(request) => Value::Object(request.body),
            Message::Response(response) => Value::Object(response.body),
            Message::Notification(notification) => Value::Object(notification.body),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(request.method()),
            Message::Notification(notification) => Some(notification.method()),
            Message::Response(_) => None,
        }
    }
}

/// A message carrying both `method` and `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    body: Map<String, Value>,
}

impl Request {
    pub fn new(id: MessageId, method: &str, params: Option<Value>) -> Self {
        let mut body = Map::new();
        body.insert("jsonrpc".to_owned(), Value::from("2.0"));
        body.insert("id".to_owned(), id.to_json());
        body.insert("method".to_owned(), Value::from(method));
        if let Some(params) = params {
            body.insert("params".to_owned(), params);
        }
        Self { body }
    }

    pub fn id(&self) -> MessageId {
        id_of(&self.body)
    }

    pub fn set_id(&mut self, id: MessageId) {
        self.body.insert("id".to_owned(), id.to_json());
    }

    pub fn method(&self) -> &str {
        self.body.get("method").and_then(Value::as_str).unwrap_or("")
    }

    pub fn params(&self) -> Option<&Value> {
        self.body.get("params")
    }

    /// Mutable access to `params`, inserting an empty object when absent.
    pub fn params_mut(&mut self) -> &mut Value {
        self.body
            .entry("params".to_owned())
            .or_insert_with(|| Value::Object(Map::new()))
    }
}

/// A message carrying `id` but no `method`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    body: Map<String, Value>,
}

impl Response {
    pub fn success(id: MessageId, result: Value) -> Self {
        let mut body = Map::new();
        body.insert("jsonrpc".to_owned(), Value::from("2.0"));
        body.insert("id".to_owned(), id.to_json());
        body.insert("result".to_owned(), result);
        Self { body }
    }

    pub fn failure(id: MessageId, code: i64, message: &str) -> Self {
        let mut error = Map::new();
        error.insert("code".to_owned(), Value::from(code));
        error.insert("message".to_owned(), Value::from(message));

        let mut body = Map::new();
        body.insert("jsonrpc".to_owned(), Value::from("2.0"));
        body.insert("id".to_owned(), id.to_json());
        body.insert("error".to_owned(), Value::Object(error));
        Self { body }
    }

    /// Rebuilds a response from a cached `result`/`error` pair.
    pub fn from_parts(id: MessageId, result: Option<Value>, error: Option<Value>) -> Self {
        let mut body = Map::new();
        body.insert("jsonrpc".to_owned(), Value::from("2.0"));
        body.insert("id".to_owned(), id.to_json());
        if let Some(error) = error {
            body.insert("error".to_owned(), error);
        } else {
            body.insert("result".to_owned(), result.unwrap_or(Value::Null));
        }
        Self { body }
    }

    pub fn id(&self) -> MessageId {
        id_of(&self.body)
    }

    pub fn set_id(&mut self, id: MessageId) {
        self.body.insert("id".to_owned(), id.to_json());
    }

    pub fn result(&self) -> Option<&Value> {
        self.body.get("result")
    }

    pub fn error(&self) -> Option<&Value> {
        self.body.get("error")
    }
}

/// A message carrying `method` but no `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    body: Map<String, Value>,
}

impl Notification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        let mut body = Map::new();
        body.insert("jsonrpc".to_owned(), Value::from("2.0"));
        body.insert("method".to_owned(), Value::from(method));
        if let Some(params) = params {
            body.insert("params".to_owned(), params);
        }
        Self { body }
    }

    pub fn method(&self) -> &str {
        self.body.get("method").and_then(Value::as_str).unwrap_or("")
    }

    pub fn params(&self) -> Option<&Value> {
        self.body.get("params")
    }
}

fn id_of(body: &Map<String, Value>) -> MessageId {
    body.get("id")
        .and_then(MessageId::from_json)
        .unwrap_or(MessageId::Null)
}
