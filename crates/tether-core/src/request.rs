//! Structured request/response: the plain-data shapes exchanged between a
//! native bridge and the core.
//!
//! Wire format (JSON):
//!
//! - Request: `{method, url, headers, body}` where `url` is the path with the
//!   query string folded in, `headers` is a JSON object (or a string holding a
//!   JSON object, for bridges that can only pass strings), and `body` is
//!   either an array of bytes or a base64 string.
//! - Response: `{status, headers, body}` with one value per header key and
//!   `body` always base64-encoded.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TetherError};

/// An HTTP-like request from a native bridge.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// HTTP method: `GET`, `POST`, `PUT`, `DELETE`, `PATCH`, ...
    pub method: String,
    /// Path with query string, e.g. `/tasks?filter=active`.
    pub url: String,
    /// Header bag.
    #[serde(default, deserialize_with = "wire::headers")]
    pub headers: BTreeMap<String, String>,
    /// Raw body bytes.
    #[serde(default, with = "wire::body")]
    pub body: Vec<u8>,
}

impl Request {
    /// Create a request with no headers and an empty body.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Parse a request from its JSON wire form.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| TetherError::MalformedMessage {
            message: format!("invalid request JSON: {e}"),
        })
    }

    /// Set a header, returning the request.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(key, value);
        self
    }

    /// Attach a body, returning the request.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a header value, replacing any existing value with the same
    /// (case-insensitive) name.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(&key));
        let _ = self.headers.insert(key, value.into());
    }

    /// Look up a header (case-insensitive).
    pub fn header(&self, key: &str) -> Option<&str> {
        find_header(&self.headers, key)
    }

    /// The URL path without the query string.
    pub fn path(&self) -> &str {
        self.url.split_once('?').map_or(self.url.as_str(), |(path, _)| path)
    }

    /// The raw query string (empty when absent).
    pub fn query(&self) -> &str {
        self.url.split_once('?').map_or("", |(_, query)| query)
    }

    /// First decoded value of a query parameter.
    pub fn query_value(&self, key: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query().as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// Whether this is an HTMX request (`HX-Request: true`).
    pub fn is_htmx(&self) -> bool {
        self.header("HX-Request") == Some("true")
    }

    /// The `Content-Type` header, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    /// Body as UTF-8 (lossy).
    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// The result of executing a [`Request`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// First value of each response header, keyed by canonical name.
    #[serde(default, deserialize_with = "wire::headers")]
    pub headers: BTreeMap<String, String>,
    /// Concatenated response body.
    #[serde(default, with = "wire::body")]
    pub body: Vec<u8>,
}

impl Response {
    /// Create an empty response with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// A plain-text error response.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        let mut resp = Self::new(status);
        resp.set_header("Content-Type", "text/plain; charset=utf-8");
        resp.body = message.into().into_bytes();
        resp
    }

    /// An HTML response.
    pub fn html(status: u16, body: impl Into<String>) -> Self {
        let mut resp = Self::new(status);
        resp.set_header("Content-Type", "text/html; charset=utf-8");
        resp.body = body.into().into_bytes();
        resp
    }

    /// Set a header value under its canonical name.
    pub fn set_header(&mut self, key: &str, value: impl Into<String>) {
        let _ = self.headers.insert(canonical_header_key(key), value.into());
    }

    /// Look up a header (case-insensitive).
    pub fn header(&self, key: &str) -> Option<&str> {
        find_header(&self.headers, key)
    }

    /// Body as UTF-8 (lossy).
    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Serialize to the JSON wire form (body base64-encoded).
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TetherError::MalformedMessage {
            message: format!("failed to encode response: {e}"),
        })
    }
}

/// Canonical MIME header form: `content-type` → `Content-Type`.
///
/// Keys containing characters outside `[A-Za-z0-9-_]` are returned unchanged.
pub fn canonical_header_key(key: &str) -> String {
    if !key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return key.to_owned();
    }
    let mut upper = true;
    key.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

fn find_header<'a>(headers: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

mod wire {
    use std::collections::BTreeMap;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HeaderWire {
        Map(BTreeMap<String, String>),
        Encoded(String),
    }

    pub(super) fn headers<'de, D>(d: D) -> Result<BTreeMap<String, String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<HeaderWire>::deserialize(d)? {
            None => Ok(BTreeMap::new()),
            Some(HeaderWire::Map(map)) => Ok(map),
            Some(HeaderWire::Encoded(s)) if s.trim().is_empty() => Ok(BTreeMap::new()),
            Some(HeaderWire::Encoded(s)) => serde_json::from_str(&s).map_err(D::Error::custom),
        }
    }

    pub(super) mod body {
        use super::{Deserialize, Deserializer, Engine, STANDARD};
        use serde::Serializer;
        use serde::de::Error as _;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum BodyWire {
            Bytes(Vec<u8>),
            Base64(String),
        }

        pub(crate) fn serialize<S: Serializer>(body: &[u8], s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&STANDARD.encode(body))
        }

        pub(crate) fn deserialize<'de, D>(d: D) -> Result<Vec<u8>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<BodyWire>::deserialize(d)? {
                None => Ok(Vec::new()),
                Some(BodyWire::Bytes(bytes)) => Ok(bytes),
                Some(BodyWire::Base64(text)) => {
                    STANDARD.decode(text.trim()).map_err(D::Error::custom)
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn path_and_query_split() {
        let req = Request::new("GET", "/tasks?filter=active&page=2");
        assert_eq!(req.path(), "/tasks");
        assert_eq!(req.query(), "filter=active&page=2");
        assert_eq!(req.query_value("page").as_deref(), Some("2"));
        assert_eq!(req.query_value("missing"), None);
    }

    #[test]
    fn path_without_query() {
        let req = Request::new("GET", "/");
        assert_eq!(req.path(), "/");
        assert_eq!(req.query(), "");
    }

    #[test]
    fn query_value_is_decoded() {
        let req = Request::new("GET", "/search?q=hello%20world&tag=a%2Bb");
        assert_eq!(req.query_value("q").as_deref(), Some("hello world"));
        assert_eq!(req.query_value("tag").as_deref(), Some("a+b"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = Request::new("GET", "/").with_header("HX-Request", "true");
        assert_eq!(req.header("hx-request"), Some("true"));
        assert!(req.is_htmx());
    }

    #[test]
    fn set_header_replaces_other_casing() {
        let mut req = Request::new("GET", "/").with_header("content-type", "a");
        req.set_header("Content-Type", "b");
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.content_type(), Some("b"));
    }

    #[test]
    fn request_headers_accept_object_or_encoded_string() {
        let obj = json!({"method": "GET", "url": "/", "headers": {"A": "1"}});
        let req: Request = serde_json::from_value(obj).unwrap();
        assert_eq!(req.header("a"), Some("1"));

        let encoded = json!({"method": "GET", "url": "/", "headers": "{\"B\":\"2\"}"});
        let req: Request = serde_json::from_value(encoded).unwrap();
        assert_eq!(req.header("b"), Some("2"));

        let empty = json!({"method": "GET", "url": "/", "headers": "{}"});
        let req: Request = serde_json::from_value(empty).unwrap();
        assert!(req.headers.is_empty());
    }

    #[test]
    fn request_body_accepts_bytes_or_base64() {
        let raw = json!({"method": "POST", "url": "/", "body": [104, 105]});
        let req: Request = serde_json::from_value(raw).unwrap();
        assert_eq!(req.body_str(), "hi");

        let b64 = json!({"method": "POST", "url": "/", "body": "aGk="});
        let req: Request = serde_json::from_value(b64).unwrap();
        assert_eq!(req.body, b"hi");
    }

    #[test]
    fn request_missing_optional_fields() {
        let req = Request::from_json(br#"{"method":"GET","url":"/"}"#).unwrap();
        assert!(req.headers.is_empty());
        assert!(req.body.is_empty());
    }

    #[test]
    fn request_from_invalid_json() {
        assert_matches!(
            Request::from_json(b"not json"),
            Err(TetherError::MalformedMessage { .. })
        );
    }

    #[test]
    fn response_json_encodes_body_as_base64() {
        let resp = Response::html(200, "<h1>Hello</h1>");
        let value: serde_json::Value = serde_json::from_slice(&resp.to_json().unwrap()).unwrap();
        assert_eq!(value["status"], 200);
        assert_eq!(value["headers"]["Content-Type"], "text/html; charset=utf-8");
        assert_eq!(value["body"], "PGgxPkhlbGxvPC9oMT4=");
    }

    #[test]
    fn response_error_constructor() {
        let resp = Response::error(500, "Bridge not initialized");
        assert_eq!(resp.status, 500);
        assert!(!resp.is_success());
        assert_eq!(resp.body_str(), "Bridge not initialized");
        assert!(resp.header("content-type").unwrap().starts_with("text/plain"));
    }

    #[test]
    fn canonical_keys() {
        assert_eq!(canonical_header_key("content-type"), "Content-Type");
        assert_eq!(canonical_header_key("HX-TRIGGER"), "Hx-Trigger");
        assert_eq!(canonical_header_key("x-tether-secret"), "X-Tether-Secret");
        assert_eq!(canonical_header_key("bad key"), "bad key");
    }
}
