//! 规划辅助：system prompt 拼装、LLM 输出解析与最终回复的 schema 校验
//!
//! LLM 返回纯文本；形如 {"tool": "ext__tool", "args": {...}} 的 JSON（可包在 ```json 代码块里）是工具调用，
//! 其余为最终回复。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;

/// LLM 返回的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    Response(String),
    ToolCall(ToolCall),
}

/// 暴露给 LLM 的工具描述
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

fn extract_json(trimmed: &str) -> Option<&str> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析 LLM 输出
///
/// JSON 合法且含非空 `tool` 字段时是工具调用；JSON 合法但不是工具调用时按最终回复处理
/// （有输出 schema 时最终回复本身就是 JSON）；看起来想调用工具但 JSON 不合法时报 JsonParseError。
pub fn parse_llm_output(output: &str) -> Result<PlannerOutput, AgentError> {
    let trimmed = output.trim();
    let Some(json_str) = extract_json(trimmed) else {
        return Ok(PlannerOutput::Response(trimmed.to_string()));
    };

    match serde_json::from_str::<Value>(json_str) {
        Ok(Value::Object(map)) => match map.get("tool") {
            Some(Value::String(tool)) if !tool.is_empty() => {
                let call: ToolCall = serde_json::from_value(Value::Object(map))
                    .map_err(|e| AgentError::JsonParseError(format!("{e}: {json_str}")))?;
                Ok(PlannerOutput::ToolCall(call))
            }
            _ => Ok(PlannerOutput::Response(trimmed.to_string())),
        },
        Ok(_) => Ok(PlannerOutput::Response(trimmed.to_string())),
        Err(e) if json_str.contains("\"tool\"") => {
            Err(AgentError::JsonParseError(format!("{e}: {json_str}")))
        }
        Err(_) => Ok(PlannerOutput::Response(trimmed.to_string())),
    }
}

/// 最终回复对 schema 的校验：必须是 JSON；schema 声明 object 时检查类型与 required 字段
pub fn check_response_schema(answer: &str, schema: &Value) -> Result<Value, AgentError> {
    let trimmed = answer.trim();
    let candidate = extract_json(trimmed).unwrap_or(trimmed);
    let value: Value = serde_json::from_str(candidate)
        .map_err(|e| AgentError::SchemaMismatch(format!("answer is not JSON ({e})")))?;

    if schema.get("type").and_then(Value::as_str) == Some("object") {
        let Some(obj) = value.as_object() else {
            return Err(AgentError::SchemaMismatch("answer must be a JSON object".into()));
        };
        let missing: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|req| {
                req.iter()
                    .filter_map(Value::as_str)
                    .filter(|k| !obj.contains_key(*k))
                    .collect()
            })
            .unwrap_or_default();
        if !missing.is_empty() {
            return Err(AgentError::SchemaMismatch(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
    }
    Ok(value)
}

const BASE_PROMPT: &str = "You are an autonomous agent working inside a session. \
Solve the user's task step by step using the tools listed below.\n\
To call a tool, reply with ONLY one JSON object and nothing else:\n\
{\"tool\": \"<extension>__<tool>\", \"args\": {...}}\n\
When the task is done, reply with the final answer as plain text (no tool JSON).";

/// 拼装 system prompt：基础说明 + Recipe 指令 + 追加段落 + 工具清单 + 输出要求
pub fn build_system_prompt(
    instructions: Option<&str>,
    extras: &[String],
    tools: &[ToolDescriptor],
    response_schema: Option<&Value>,
) -> String {
    let mut prompt = String::from(BASE_PROMPT);
    if let Some(i) = instructions.filter(|i| !i.trim().is_empty()) {
        prompt.push_str("\n\n# Instructions\n");
        prompt.push_str(i.trim());
    }
    for extra in extras {
        prompt.push_str("\n\n");
        prompt.push_str(extra.trim());
    }
    prompt.push_str("\n\n# Tools\n");
    if tools.is_empty() {
        prompt.push_str("(no tools available; answer directly)\n");
    }
    for t in tools {
        prompt.push_str(&format!("- {}: {}\n  args schema: {}\n", t.name, t.description, t.parameters));
    }
    if let Some(schema) = response_schema {
        prompt.push_str("\n# Final answer format\nThe final answer must be a single JSON value matching this schema:\n");
        prompt.push_str(&schema.to_string());
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_tool_call() {
        let out = parse_llm_output(r#"{"tool": "echo__echo", "args": {"text": "hi"}}"#).unwrap();
        assert_eq!(
            out,
            PlannerOutput::ToolCall(ToolCall {
                tool: "echo__echo".into(),
                args: json!({"text": "hi"})
            })
        );
    }

    #[test]
    fn test_parse_fenced_without_args() {
        let out = parse_llm_output("Let me look.\n```json\n{\"tool\": \"developer__list_dir\"}\n```").unwrap();
        match out {
            PlannerOutput::ToolCall(tc) => {
                assert_eq!(tc.tool, "developer__list_dir");
                assert_eq!(tc.args, json!({}));
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_plain_and_json_answers() {
        assert_eq!(
            parse_llm_output("All done.").unwrap(),
            PlannerOutput::Response("All done.".into())
        );
        assert_eq!(
            parse_llm_output(r#"{"summary": "ok"}"#).unwrap(),
            PlannerOutput::Response(r#"{"summary": "ok"}"#.into())
        );
    }

    #[test]
    fn test_parse_broken_tool_json() {
        let err = parse_llm_output(r#"{"tool": "echo__echo", "args": {"text": }"#).unwrap_err();
        assert!(matches!(err, AgentError::JsonParseError(_)));
    }

    #[test]
    fn test_schema_check() {
        let schema = json!({"type": "object", "required": ["summary", "score"]});
        assert!(check_response_schema(r#"{"summary": "x", "score": 3}"#, &schema).is_ok());
        assert!(matches!(
            check_response_schema(r#"{"summary": "x"}"#, &schema),
            Err(AgentError::SchemaMismatch(m)) if m.contains("score")
        ));
        assert!(check_response_schema("not json", &schema).is_err());
        assert!(check_response_schema("[1, 2]", &schema).is_err());
    }

    #[test]
    fn test_system_prompt_sections() {
        let tools = vec![ToolDescriptor {
            name: "echo__echo".into(),
            description: "Echo text".into(),
            parameters: json!({"type": "object"}),
        }];
        let prompt = build_system_prompt(Some("Be brief."), &["Extra rule.".into()], &tools, None);
        assert!(prompt.contains("# Instructions\nBe brief."));
        assert!(prompt.contains("Extra rule."));
        assert!(prompt.contains("- echo__echo: Echo text"));
        assert!(!prompt.contains("Final answer format"));
    }
}
