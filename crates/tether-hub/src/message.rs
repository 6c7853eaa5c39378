//! Channel wire model.
//!
//! Two shapes travel over a channel:
//!
//! - [`Envelope`]: server → client. `{channel?, format?, target?, swap?,
//!   payload, request_id?}`; `{"payload": "..."}` alone is valid and means
//!   an HTML fragment on the `ui` channel.
//! - [`ClientMessage`]: client → server. `{type, request_id, event, headers,
//!   values, path, id?}`; every field is optional on the wire.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::{Result, TetherError};

/// Default logical channel for HTML updates.
pub const DEFAULT_CHANNEL: &str = "ui";

/// Common swap strategies understood by the UI side.
pub mod swap {
    /// Replace the target's children.
    pub const INNER_HTML: &str = "innerHTML";
    /// Replace the target itself.
    pub const OUTER_HTML: &str = "outerHTML";
    /// Append inside the target.
    pub const BEFORE_END: &str = "beforeend";
    /// Prepend inside the target.
    pub const AFTER_BEGIN: &str = "afterbegin";
    /// Remove the target.
    pub const DELETE: &str = "delete";
}

/// Payload encoding of an [`Envelope`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// HTML fragment.
    #[default]
    Html,
    /// JSON document.
    Json,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Html => "html",
            Self::Json => "json",
        })
    }
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_owned()
}

/// A server → client message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical channel (`"ui"` unless routed elsewhere).
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Payload format.
    #[serde(default)]
    pub format: Format,
    /// Target selector for a swap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Swap strategy (see [`swap`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<String>,
    /// The content itself. The one field the wire form must carry.
    pub payload: String,
    /// Correlation ID of the [`ClientMessage`] this answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Envelope {
    /// An HTML envelope on the `ui` channel.
    pub fn html(payload: impl Into<String>) -> Self {
        Self {
            channel: default_channel(),
            format: Format::Html,
            target: None,
            swap: None,
            payload: payload.into(),
            request_id: None,
        }
    }

    /// An HTML envelope aimed at `target` with an explicit swap strategy.
    pub fn swap(
        target: impl Into<String>,
        swap: impl Into<String>,
        html: impl Into<String>,
    ) -> Self {
        Self::html(html).with_target(target).with_swap(swap)
    }

    /// An HTML envelope answering the request with `request_id`.
    pub fn reply(request_id: impl Into<String>, html: impl Into<String>) -> Self {
        Self::html(html).with_request_id(request_id)
    }

    /// A JSON envelope on a custom channel.
    pub fn json<T: Serialize + ?Sized>(channel: impl Into<String>, data: &T) -> Result<Self> {
        let payload = serde_json::to_string(data).map_err(|e| TetherError::MalformedMessage {
            message: format!("failed to encode envelope payload: {e}"),
        })?;
        Ok(Self::html(payload).as_json().to_channel(channel))
    }

    /// Set the target selector.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the swap strategy.
    #[must_use]
    pub fn with_swap(mut self, swap: impl Into<String>) -> Self {
        self.swap = Some(swap.into());
        self
    }

    /// Set the correlation ID.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Switch the payload format to JSON.
    #[must_use]
    #[allow(clippy::wrong_self_convention)]
    pub fn as_json(mut self) -> Self {
        self.format = Format::Json;
        self
    }

    /// Route to a custom channel.
    #[must_use]
    #[allow(clippy::wrong_self_convention)]
    pub fn to_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Serialize to the wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| TetherError::MalformedMessage {
            message: format!("failed to encode envelope: {e}"),
        })
    }

    /// Parse from the wire form.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| TetherError::MalformedMessage {
            message: format!("invalid envelope: {e}"),
        })
    }
}

/// A client → server message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Message kind; `"request"` for UI-originated messages.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Correlation ID echoed back in a reply envelope.
    #[serde(default)]
    pub request_id: String,
    /// DOM event that triggered the send (`click`, `submit`, ...).
    #[serde(default)]
    pub event: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Form data and extra values.
    #[serde(default)]
    pub values: serde_json::Map<String, Value>,
    /// Channel path the message was sent on.
    #[serde(default)]
    pub path: String,
    /// ID of the element that sent the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ClientMessage {
    /// A `request` message with no values.
    pub fn request(request_id: impl Into<String>) -> Self {
        Self {
            kind: "request".into(),
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    /// Add a value, returning the message.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.values.insert(key.into(), value.into());
        self
    }

    /// Add a header, returning the message.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.headers.insert(key.into(), value.into());
        self
    }

    /// Parse one inbound frame.
    pub fn parse(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| TetherError::MalformedMessage {
            message: e.to_string(),
        })
    }

    /// Serialize to the wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| TetherError::MalformedMessage {
            message: format!("failed to encode client message: {e}"),
        })
    }

    /// Raw value for `key`.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Value for `key` when it is a string.
    pub fn str_value(&self, key: &str) -> Option<&str> {
        self.value(key).and_then(Value::as_str)
    }

    /// Header value (case-insensitive).
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// The `HX-Target` header.
    pub fn hx_target(&self) -> Option<&str> {
        self.header("HX-Target")
    }

    /// The `HX-Current-URL` header.
    pub fn current_url(&self) -> Option<&str> {
        self.header("HX-Current-URL")
    }
}
