//! Engine payload handling.
//!
//! Payloads are JSON objects. The gateway never interprets them beyond the
//! correlation field: on the way in the client's value under that field is
//! swapped for a gateway tag, on the way out the client's value is put back.
//! Key order is preserved so untouched fields round-trip byte for byte.

use crate::framing::FrameError;
use crate::tag::Tag;
use serde_json::{json, Map, Value};

/// Error code for malformed or oversized client input.
pub const CODE_BAD_REQUEST: u16 = 400;
/// Error code for requests the engine did not accept.
pub const CODE_UNAVAILABLE: u16 = 503;
/// Error code for requests that got no reply in time.
pub const CODE_TIMEOUT: u16 = 504;

/// A parsed client request, not yet tagged.
#[derive(Debug, Clone)]
pub struct Request {
    fields: Map<String, Value>,
}

/// A request ready for the engine.
#[derive(Debug, Clone)]
pub struct TaggedRequest {
    /// Serialized payload carrying the gateway tag
    pub payload: String,
    /// Whatever the client had under the tag field, if anything
    pub client_tag: Option<Value>,
}

impl Request {
    /// Parse a frame into a request object.
    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_slice(frame).map_err(|e| FrameError::Malformed(e.to_string()))?;

        match value {
            Value::Object(fields) => Ok(Self { fields }),
            _ => Err(FrameError::Malformed(
                "request is not a JSON object".to_string(),
            )),
        }
    }

    /// Serialize with `tag` under `field`.
    pub fn tagged(mut self, field: &str, tag: Tag) -> TaggedRequest {
        let client_tag = self.fields.insert(field.to_string(), Value::from(tag.value()));
        TaggedRequest {
            payload: Value::Object(self.fields).to_string(),
            client_tag,
        }
    }
}

/// Read the gateway tag out of an engine payload.
///
/// Anything that is not an object with an unsigned integer under `field`
/// has no tag.
pub fn extract_tag(payload: &str, field: &str) -> Option<Tag> {
    let value: Value = serde_json::from_str(payload).ok()?;
    value.get(field)?.as_u64().map(Tag::from_raw)
}

/// Put the client's tag back into an engine response.
///
/// The field is removed when the client did not send one. Payloads that
/// are not JSON objects are passed through untouched.
pub fn restore_tag(payload: &str, field: &str, client_tag: Option<&Value>) -> String {
    let Ok(Value::Object(mut fields)) = serde_json::from_str::<Value>(payload) else {
        return payload.to_string();
    };

    match client_tag {
        Some(original) => {
            fields.insert(field.to_string(), original.clone());
        }
        None => {
            fields.shift_remove(field);
        }
    }

    Value::Object(fields).to_string()
}

/// Build an engine-style error object for the client.
pub fn error_response(field: &str, client_tag: Option<&Value>, code: u16, message: &str) -> String {
    let mut response = json!({
        "@type": "error",
        "code": code,
        "message": message,
    });

    if let (Some(tag), Value::Object(fields)) = (client_tag, &mut response) {
        fields.insert(field.to_string(), tag.clone());
    }

    response.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(matches!(
            Request::parse(b"not json"),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            Request::parse(b"[1,2,3]"),
            Err(FrameError::Malformed(_))
        ));
        assert!(Request::parse(b"{}").is_ok());
    }

    #[test]
    fn test_tagged_replaces_client_tag_in_place() {
        let request = Request::parse(br#"{"tag":"a1","op":"ping"}"#).unwrap();

        let tagged = request.tagged("tag", Tag::from_raw(42));
        assert_eq!(tagged.payload, r#"{"tag":42,"op":"ping"}"#);
        assert_eq!(tagged.client_tag, Some(json!("a1")));
    }

    #[test]
    fn test_tagged_appends_missing_field() {
        let request = Request::parse(br#"{"@type":"getMe"}"#).unwrap();
        let tagged = request.tagged("@extra", Tag::from_raw(3));

        assert_eq!(tagged.payload, r#"{"@type":"getMe","@extra":3}"#);
        assert!(tagged.client_tag.is_none());
    }

    #[test]
    fn test_extract_tag() {
        assert_eq!(
            extract_tag(r#"{"tag":17,"result":"pong"}"#, "tag"),
            Some(Tag::from_raw(17))
        );
        assert_eq!(extract_tag(r#"{"tag":"a1"}"#, "tag"), None);
        assert_eq!(extract_tag(r#"{"@type":"updateOption"}"#, "@extra"), None);
        assert_eq!(extract_tag("garbage", "tag"), None);
    }

    #[test]
    fn test_restore_tag_is_byte_identical() {
        let reply = restore_tag(
            r#"{"tag":17,"result":"pong"}"#,
            "tag",
            Some(&json!("a1")),
        );
        assert_eq!(reply, r#"{"tag":"a1","result":"pong"}"#);
    }

    #[test]
    fn test_restore_tag_removes_gateway_tag() {
        let reply = restore_tag(r#"{"@type":"user","@extra":5,"id":1}"#, "@extra", None);
        assert_eq!(reply, r#"{"@type":"user","id":1}"#);
    }

    #[test]
    fn test_restore_tag_passes_through_non_objects() {
        assert_eq!(restore_tag("plain text", "tag", None), "plain text");
    }

    #[test]
    fn test_error_response() {
        let err = error_response("tag", Some(&json!("a1")), CODE_TIMEOUT, "request timed out");
        assert_eq!(
            err,
            r#"{"@type":"error","code":504,"message":"request timed out","tag":"a1"}"#
        );

        let err = error_response("tag", None, CODE_BAD_REQUEST, "bad");
        assert_eq!(err, r#"{"@type":"error","code":400,"message":"bad"}"#);
    }
}
