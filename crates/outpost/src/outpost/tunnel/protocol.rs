use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ERR_AUTH_FAILED: &str = "AUTH_FAILED";
pub const ERR_SUBDOMAIN_TAKEN: &str = "SUBDOMAIN_TAKEN";
pub const ERR_INVALID_SUBDOMAIN: &str = "INVALID_SUBDOMAIN";
pub const ERR_DOMAIN_NOT_ALLOWED: &str = "DOMAIN_NOT_ALLOWED";
pub const ERR_BAD_HANDSHAKE: &str = "BAD_HANDSHAKE";

/// Room for the JSON envelope and headers around a base64 body.
const FRAME_OVERHEAD: usize = 1024 * 1024;

/// Largest WebSocket message needed to carry a body of `max_body` bytes.
pub fn max_frame_len(max_body: usize) -> usize {
    max_body
        .div_ceil(3)
        .saturating_mul(4)
        .saturating_add(FRAME_OVERHEAD)
}

/// Error codes after which a client must not reconnect.
pub fn is_terminal_error_code(code: &str) -> bool {
    code == ERR_AUTH_FAILED || code == ERR_SUBDOMAIN_TAKEN
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("binary frames are not supported")]
    Binary,
}

/// Wire header map. Repeated headers (e.g. `set-cookie`) travel as arrays.
pub type Headers = BTreeMap<String, HeaderValues>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let s: &[String] = match self {
            HeaderValues::One(v) => std::slice::from_ref(v),
            HeaderValues::Many(v) => v.as_slice(),
        };
        s.iter().map(String::as_str)
    }

    fn push(&mut self, v: String) {
        match self {
            HeaderValues::One(first) => {
                let first = std::mem::take(first);
                *self = HeaderValues::Many(vec![first, v]);
            }
            HeaderValues::Many(all) => all.push(v),
        }
    }
}

/// Collects an `http::HeaderMap` into wire form. Non UTF-8 values are replaced lossily.
pub fn headers_from_map(map: &http::HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in map {
        let v = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match out.get_mut(name.as_str()) {
            Some(existing) => existing.push(v),
            None => {
                out.insert(name.as_str().to_string(), HeaderValues::One(v));
            }
        }
    }
    out
}

/// Flattens wire headers into `(name, value)` pairs, keeping repeated values.
pub fn header_pairs(headers: &Headers) -> impl Iterator<Item = (&str, &str)> {
    headers
        .iter()
        .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    OpenTunnel(OpenTunnel),
    TunnelOpened { url: String },
    Error { code: String, message: String },
    Request(TunnelRequest),
    Response(TunnelResponse),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTunnel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "body_base64")]
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelResponse {
    pub request_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "body_base64")]
    pub body: Option<Bytes>,
}

impl Message {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Message::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::OpenTunnel(_) => "open_tunnel",
            Message::TunnelOpened { .. } => "tunnel_opened",
            Message::Error { .. } => "error",
            Message::Request(_) => "request",
            Message::Response(_) => "response",
        }
    }
}

pub fn encode(msg: &Message) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(ProtocolError::Encode)
}

pub fn decode(frame: &str) -> Result<Message, ProtocolError> {
    serde_json::from_str(frame).map_err(ProtocolError::Malformed)
}

mod body_base64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(body: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        match body {
            Some(b) => s.serialize_str(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| STANDARD.decode(s).map(Bytes::from).map_err(D::Error::custom))
            .transpose()
    }
}
