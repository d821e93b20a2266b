// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Serialization formats and the content-type selector.
//!
//! Formats are external collaborators; the core ships JSON and picks the
//! first registered format that supports a connection's content type.

use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{CoreError, Result};

/// A serialization format, selected by content type.
pub trait Format: Send + Sync {
    /// Whether this format can handle the given content type.
    fn supports(&self, content_type: &str) -> bool;

    /// Encode a value for the wire.
    fn encode(&self, value: &Value, content_type: &str) -> Result<Bytes>;

    /// Decode wire bytes into a value.
    fn decode(&self, bytes: &[u8], content_type: &str) -> Result<Value>;
}

/// The default JSON format.
pub struct JsonFormat;

impl Format for JsonFormat {
    fn supports(&self, content_type: &str) -> bool {
        let essence = content_type.split(';').next().unwrap_or("").trim();
        essence == "application/json" || essence.ends_with("+json")
    }

    fn encode(&self, value: &Value, _content_type: &str) -> Result<Bytes> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| CoreError::internal(format!("json encode failed: {}", e)))?;
        Ok(Bytes::from(bytes))
    }

    fn decode(&self, bytes: &[u8], _content_type: &str) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::InvalidPayload {
            reason: e.to_string(),
        })
    }
}

/// Chooses a format by content type and delegates encode/decode.
#[derive(Clone)]
pub struct FormatSelector {
    formats: Vec<Arc<dyn Format>>,
}

impl Default for FormatSelector {
    fn default() -> Self {
        Self {
            formats: vec![Arc::new(JsonFormat)],
        }
    }
}

impl FormatSelector {
    /// A selector with an explicit format list; the first supporting format
    /// wins.
    pub fn new(formats: Vec<Arc<dyn Format>>) -> Self {
        Self { formats }
    }

    /// Append a format with lower priority than the existing ones.
    pub fn register(&mut self, format: Arc<dyn Format>) {
        self.formats.push(format);
    }

    /// The first format supporting the content type.
    pub fn select(&self, content_type: &str) -> Option<&Arc<dyn Format>> {
        self.formats.iter().find(|f| f.supports(content_type))
    }

    pub fn encode(&self, value: &Value, content_type: &str) -> Result<Bytes> {
        self.require(content_type)?.encode(value, content_type)
    }

    pub fn decode(&self, bytes: &[u8], content_type: &str) -> Result<Value> {
        self.require(content_type)?.decode(bytes, content_type)
    }

    fn require(&self, content_type: &str) -> Result<&Arc<dyn Format>> {
        self.select(content_type)
            .ok_or_else(|| CoreError::InvalidPayload {
                reason: format!("unsupported content type '{}'", content_type),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_supports_media_types() {
        let format = JsonFormat;
        assert!(format.supports("application/json"));
        assert!(format.supports("application/json; charset=utf-8"));
        assert!(format.supports("application/vnd.acme+json"));
        assert!(!format.supports("application/msgpack"));
    }

    #[test]
    fn test_json_round_trip() {
        let format = JsonFormat;
        let value = json!({"a": [1, 2, 3], "b": "text"});
        let bytes = format.encode(&value, "application/json").unwrap();
        let back = format.decode(&bytes, "application/json").unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn test_json_decode_failure_is_invalid_payload() {
        let err = JsonFormat
            .decode(b"{not json", "application/json")
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidPayload { .. }));
    }

    #[test]
    fn test_selector_picks_first_supporting_format() {
        struct Msgpackish;
        impl Format for Msgpackish {
            fn supports(&self, content_type: &str) -> bool {
                content_type == "application/msgpack"
            }
            fn encode(&self, _: &Value, _: &str) -> Result<Bytes> {
                Ok(Bytes::from_static(b"mp"))
            }
            fn decode(&self, _: &[u8], _: &str) -> Result<Value> {
                Ok(json!("mp"))
            }
        }

        let mut selector = FormatSelector::default();
        selector.register(Arc::new(Msgpackish));

        assert!(selector.select("application/json").is_some());
        let bytes = selector.encode(&json!(1), "application/msgpack").unwrap();
        assert_eq!(&bytes[..], b"mp");
    }

    #[test]
    fn test_selector_rejects_unknown_content_type() {
        let selector = FormatSelector::default();
        let err = selector.decode(b"x", "application/grpc").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPayload { .. }));
    }
}
