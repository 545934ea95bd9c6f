//! Demultiplexing of structured (`stream-json`) agent transcripts.
//!
//! The transcript is a mix of JSON-object lines and arbitrary text. Lines of
//! `type: "assistant"` contribute the text blocks of `message.content`; lines of
//! `type: "result"` carry the final payload in `result` along with the run's
//! `usage` and `total_cost_usd`. The model comes from the `system` init line.
//! Anything else is skipped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token counts from a `result` line's `usage` object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

/// What the agent reported about its own consumption.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentUsage {
    pub tokens: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
    pub model: Option<String>,
}

/// Text and usage pulled out of a structured transcript.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamExtract {
    /// Assistant text segments joined by newlines.
    pub assistant_text: String,
    /// Final result payload; the last `result` line wins.
    pub final_result: String,
    pub usage: AgentUsage,
}

pub fn demux(raw: &str) -> StreamExtract {
    let mut segments: Vec<String> = Vec::new();
    let mut final_result = String::new();
    let mut usage = AgentUsage::default();

    for line in raw.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        match value.get("type").and_then(Value::as_str) {
            Some("assistant") => segments.extend(assistant_segments(&value)),
            Some("result") => {
                if let Some(result) = value.get("result").and_then(Value::as_str) {
                    final_result = result.to_string();
                }
                if let Some(tokens) = value
                    .get("usage")
                    .and_then(|raw| TokenUsage::deserialize(raw).ok())
                {
                    usage.tokens = Some(tokens);
                }
                if let Some(cost) = value.get("total_cost_usd").and_then(Value::as_f64) {
                    usage.cost_usd = Some(cost);
                }
            }
            Some("system") => {
                if let Some(model) = value.get("model").and_then(Value::as_str) {
                    usage.model = Some(model.to_string());
                }
            }
            _ => {}
        }
    }

    StreamExtract {
        assistant_text: segments.join("\n"),
        final_result,
        usage,
    }
}

fn assistant_segments(value: &Value) -> Vec<String> {
    let Some(blocks) = value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Noise lines are skipped and the result payload is taken verbatim.
    #[test]
    fn result_line_carries_marker_and_assistant_stays_empty() {
        let raw = "\
booting agent...
{\"type\":\"system\",\"subtype\":\"init\"}
not json { at all
{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"<promise>ABORT</promise>\"}
trailing noise
";
        let extract = demux(raw);
        assert_eq!(extract.final_result, "<promise>ABORT</promise>");
        assert_eq!(extract.assistant_text, "");
    }

    #[test]
    fn assistant_text_blocks_are_joined_in_order() {
        let raw = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"first"},{"type":"tool_use","name":"bash"}]}}
{"type":"user","message":{"content":[{"type":"tool_result","content":"ok"}]}}
{"type":"assistant","message":{"content":[{"type":"text","text":"second"}]}}
{"type":"result","result":"early"}
{"type":"result","result":"final"}"#;
        let extract = demux(raw);
        assert_eq!(extract.assistant_text, "first\nsecond");
        assert_eq!(extract.final_result, "final");
    }

    #[test]
    fn usage_cost_and_model_are_collected() {
        let raw = r#"{"type":"system","subtype":"init","model":"claude-sonnet-4"}
{"type":"result","result":"done","total_cost_usd":0.0421,"usage":{"input_tokens":1200,"output_tokens":340,"cache_read_input_tokens":9000,"server_tool_use":{"web_search_requests":0}}}"#;
        let usage = demux(raw).usage;
        assert_eq!(usage.model.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(usage.cost_usd, Some(0.0421));
        assert_eq!(
            usage.tokens,
            Some(TokenUsage {
                input_tokens: 1200,
                output_tokens: 340,
                cache_creation_input_tokens: 0,
                cache_read_input_tokens: 9000,
            })
        );
    }

    #[test]
    fn result_without_usage_reports_none() {
        let usage = demux(r#"{"type":"result","result":"ok"}"#).usage;
        assert_eq!(usage, AgentUsage::default());
    }

    #[test]
    fn empty_transcript_yields_empty_extract() {
        assert_eq!(demux(""), StreamExtract::default());
    }
}
