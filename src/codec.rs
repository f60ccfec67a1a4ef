//! Document codec
//!
//! Requests and responses cross the bridge as a single structured document,
//! a mapping/array/scalar tree equivalent to JSON. The codec owns no runtime
//! state; it only moves documents between [`Document`] and compact text.

use crate::error::BridgeError;

/// Structured request/response value exchanged with callers.
pub type Document = serde_json::Value;

/// Parse interchange text into a document.
pub fn decode(text: &str) -> Result<Document, BridgeError> {
    serde_json::from_str(text).map_err(|e| BridgeError::Serialization(e.to_string()))
}

/// Parse interchange text that must hold a request (a mapping).
pub fn decode_request(text: &str) -> Result<Document, BridgeError> {
    let doc = decode(text)?;
    if !doc.is_object() {
        return Err(BridgeError::InvalidRequest(format!(
            "request must be an object, got {}",
            kind_of(&doc)
        )));
    }
    Ok(doc)
}

/// Encode a document as compact interchange text.
pub fn encode(doc: &Document) -> Result<String, BridgeError> {
    serde_json::to_string(doc).map_err(|e| BridgeError::Serialization(e.to_string()))
}

/// Encode a document with indentation, for human consumption.
pub fn encode_pretty(doc: &Document) -> Result<String, BridgeError> {
    serde_json::to_string_pretty(doc).map_err(|e| BridgeError::Serialization(e.to_string()))
}

/// Short name of a document's top-level shape, used in error messages.
pub fn kind_of(doc: &Document) -> &'static str {
    match doc {
        Document::Null => "null",
        Document::Bool(_) => "boolean",
        Document::Number(n) if n.is_f64() => "float",
        Document::Number(_) => "integer",
        Document::String(_) => "string",
        Document::Array(_) => "array",
        Document::Object(_) => "object",
    }
}
