//! Untyped JSON-RPC envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Identifier of an in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
	/// Numeric identifier, allocated by the transport.
	Number(i64),
	/// String identifier.
	String(String),
}

impl std::fmt::Display for RequestId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RequestId::Number(n) => write!(f, "{n}"),
			RequestId::String(s) => write!(f, "{s}"),
		}
	}
}

/// A request envelope, before typed decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnyRequest {
	/// Request identifier. The transport replaces a placeholder id with a
	/// fresh one when the message is written.
	pub id: RequestId,
	/// Wire method name.
	pub method: String,
	/// Raw parameter payload.
	pub params: JsonValue,
}

/// A notification envelope, before typed decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnyNotification {
	/// Wire method name.
	pub method: String,
	/// Raw parameter payload.
	pub params: JsonValue,
}

/// A response envelope, before typed decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnyResponse {
	/// Identifier of the request this replies to.
	pub id: RequestId,
	/// Successful result payload, if any.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<JsonValue>,
	/// Error payload, if the request failed.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<ResponseError>,
}

/// Error payload of a failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("engine error {code}: {message}")]
pub struct ResponseError {
	/// Numeric error code.
	pub code: i64,
	/// Human-readable message.
	pub message: String,
	/// Optional structured details.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<JsonValue>,
}
