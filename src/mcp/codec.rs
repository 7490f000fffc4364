//! Wire codec for protocol messages
//!
//! One message per frame: a compact JSON object terminated by `\n`. Compact JSON
//! escapes every newline inside strings, so the terminator is the only raw
//! newline in a frame and stream transports can split on it.

use serde_json::Value;

use crate::errors::DecodeError;
use crate::mcp::types::Message;

pub const FRAME_DELIMITER: u8 = b'\n';

const KNOWN_TYPES: [&str; 5] = ["list_tools", "tool_list", "tool_call", "tool_result", "text"];

pub fn encode(message: &Message) -> Vec<u8> {
    let mut frame = serde_json::to_vec(message).expect("protocol message serialization");
    frame.push(FRAME_DELIMITER);
    frame
}

pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
    let text = std::str::from_utf8(frame)
        .map_err(|err| DecodeError::Syntax(format!("invalid utf-8: {err}")))?
        .trim();

    let value: Value =
        serde_json::from_str(text).map_err(|err| DecodeError::Syntax(err.to_string()))?;

    let Some(object) = value.as_object() else {
        return Err(DecodeError::MalformedMessage(
            "frame must be a JSON object".to_string(),
        ));
    };

    match object.get("type").and_then(Value::as_str) {
        Some(kind) if KNOWN_TYPES.contains(&kind) => {}
        Some(kind) => return Err(DecodeError::UnknownType(kind.to_string())),
        None => return Err(DecodeError::UnknownType("<missing>".to_string())),
    }

    serde_json::from_value(value).map_err(|err| DecodeError::MalformedMessage(err.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mcp::types::{CallId, ToolCallRequest, ToolCallResult, ToolDescriptor};

    #[test]
    fn every_variant_round_trips() {
        let messages = [
            Message::ListTools {
                id: CallId::from("list-1"),
            },
            Message::ToolList {
                id: CallId::from("list-1"),
                tools: vec![ToolDescriptor::new("summarize", json!({"type": "object"}))],
            },
            Message::ToolCall(ToolCallRequest::new(
                CallId::from("call-1"),
                "summarize",
                json!({"path": "doc.txt", "options": {"sentences": 2}}),
            )),
            Message::ToolResult(ToolCallResult::success(
                CallId::from("call-1"),
                json!({"summary": "Short.", "sentences": 1}),
            )),
            Message::ToolResult(ToolCallResult::error(CallId::from("call-2"), "boom")),
            Message::Text {
                content: "server notice".to_string(),
            },
        ];

        for message in messages {
            assert_eq!(
                decode(&encode(&message)).expect("decode"),
                message,
                "{}",
                message.kind()
            );
        }
    }

    #[test]
    fn tool_list_round_trips_with_and_without_description() {
        let message = Message::ToolList {
            id: CallId::from("list-1"),
            tools: vec![
                ToolDescriptor::new("a", json!({"type": "object"})).with_description("first"),
                ToolDescriptor::new("b", json!({})),
            ],
        };

        assert_eq!(decode(&encode(&message)).expect("decode"), message);
    }

    #[test]
    fn multiline_text_stays_in_one_frame() {
        let message = Message::Text {
            content: "line one\nline two\n".to_string(),
        };
        let frame = encode(&message);

        let newlines = frame.iter().filter(|byte| **byte == FRAME_DELIMITER).count();
        assert_eq!(newlines, 1);
        assert_eq!(frame.last(), Some(&FRAME_DELIMITER));
        assert_eq!(decode(&frame).expect("decode"), message);
    }

    #[test]
    fn encodes_wire_type_tags() {
        let frame = encode(&Message::ToolResult(ToolCallResult::error(
            CallId::from("7"),
            "boom",
        )));
        let value: Value = serde_json::from_slice(&frame).expect("json");

        assert_eq!(value["type"], "tool_result");
        assert_eq!(value["id"], "7");
        assert_eq!(value["is_error"], true);
        assert_eq!(value["content"], "boom");
    }

    #[test]
    fn ignores_unknown_fields() {
        let decoded = decode(
            br#"{"type":"tool_result","id":"9","content":{"ok":1},"is_error":false,"trace":"x"}"#,
        )
        .expect("decode");

        assert_eq!(
            decoded,
            Message::ToolResult(ToolCallResult::success(CallId::from("9"), json!({"ok": 1})))
        );
    }

    #[test]
    fn defaults_optional_fields() {
        let decoded = decode(br#"{"type":"tool_call","id":"1","name":"ping"}"#).expect("decode");
        let Message::ToolCall(request) = decoded else {
            panic!("expected tool call");
        };
        assert_eq!(request.arguments, json!({}));

        let decoded =
            decode(br#"{"type":"tool_result","id":"1","content":"ok"}"#).expect("decode");
        let Message::ToolResult(result) = decoded else {
            panic!("expected tool result");
        };
        assert!(!result.is_error);
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let error = decode(br#"{"type":"tool_call","id":"1"}"#).expect_err("missing name");
        assert!(matches!(error, DecodeError::MalformedMessage(_)));

        let error = decode(br#"{"type":"tool_result","content":"x"}"#).expect_err("missing id");
        assert!(matches!(error, DecodeError::MalformedMessage(_)));
    }

    #[test]
    fn rejects_unknown_or_missing_type() {
        let error = decode(br#"{"type":"resources/list"}"#).expect_err("unknown type");
        assert_eq!(error, DecodeError::UnknownType("resources/list".to_string()));

        let error = decode(br#"{"id":"1"}"#).expect_err("missing type");
        assert!(matches!(error, DecodeError::UnknownType(_)));
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(matches!(decode(b"{"), Err(DecodeError::Syntax(_))));
        assert!(matches!(decode(&[0xff, 0xfe]), Err(DecodeError::Syntax(_))));
        assert!(matches!(
            decode(b"[1,2]"),
            Err(DecodeError::MalformedMessage(_))
        ));
    }
}
