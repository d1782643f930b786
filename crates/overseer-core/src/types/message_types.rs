//! Parsed agent output records
//!
//! Agents emit one self-contained JSON record per stdout line. The shape is
//! provider-defined; we model the fields the orchestrator consumes and keep
//! the rest in `extra` so nothing is lost on re-emission.

use serde::{Deserialize, Serialize};

/// Token usage counters carried on a streamed record
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// One line of the agent's structured output stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessage {
    /// The record's `type` discriminator, e.g. "system", "assistant", "result"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Fields we don't model, preserved verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StreamMessage {
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_record() {
        let line = r#"{"type":"result","subtype":"success","session_id":"s-1","model":"sonnet","usage":{"input_tokens":120,"output_tokens":45}}"#;
        let msg = StreamMessage::parse(line).unwrap();
        assert_eq!(msg.kind, "result");
        assert_eq!(msg.session_id.as_deref(), Some("s-1"));
        let usage = msg.usage.unwrap();
        assert_eq!(usage.input_tokens, 120);
        assert_eq!(usage.output_tokens, 45);
        assert_eq!(usage.cache_read_input_tokens, 0);
    }

    #[test]
    fn test_unmodeled_fields_preserved() {
        let line = r#"{"type":"assistant","message":{"role":"assistant"},"cost_usd":0.01}"#;
        let msg = StreamMessage::parse(line).unwrap();
        assert!(msg.extra.contains_key("message"));
        assert!(msg.extra.contains_key("cost_usd"));
    }

    #[test]
    fn test_malformed_line_is_error() {
        assert!(StreamMessage::parse("not json at all").is_err());
        assert!(StreamMessage::parse("{\"no_type\":true}").is_err());
    }
}
