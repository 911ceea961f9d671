use crate::domain::BridgeMessage;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use jaq_interpret::{
    Ctx as JaqCtx, FilterT, ParseCtx as JaqParseCtx, RcIter as JaqRcIter, Val as JaqVal,
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;
use thiserror::Error;

const SOURCE_SLOT: usize = 0;
const TRACE_POINTERS: [&str; 3] = [
    "/metadata/trace_id",
    "/headers/trace_id",
    "/body/trace_id",
];

/// Per-execution value store. Slot 0 holds the source message; each
/// transformer appends its output as the next slot. Expressions address slots
/// with jq filters over the slot array, e.g. `.[1].payload.temperature`.
#[derive(Debug, Default, Clone)]
pub struct ExecutionContext {
    slots: BTreeMap<usize, JsonValue>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds slot 0 from an inbound message. Bodies that parse as JSON are
    /// stored structurally; anything else is carried base64-encoded.
    pub fn from_message(message: &BridgeMessage) -> Self {
        let mut context = Self::new();
        context.insert_slot(SOURCE_SLOT, message_to_value(message));
        context
    }

    pub fn insert_slot(&mut self, slot: usize, value: JsonValue) {
        self.slots.insert(slot, value);
    }

    pub fn push_slot(&mut self, value: JsonValue) -> usize {
        let slot = self.slots.keys().next_back().map_or(0, |last| last + 1);
        self.slots.insert(slot, value);
        slot
    }

    pub fn slot_value(&self, slot: usize) -> Option<&JsonValue> {
        self.slots.get(&slot)
    }

    pub fn last_slot_value(&self) -> Option<&JsonValue> {
        self.slots.values().next_back()
    }

    pub fn resolve_expression(&self, expression: &str) -> Result<JsonValue, ContextError> {
        let trimmed = expression.trim();

        if trimmed.is_empty() {
            return Err(ContextError::InvalidExpression {
                expression: expression.to_string(),
            });
        }

        if let Some(literal) = parse_literal_string(trimmed) {
            return Ok(JsonValue::String(literal));
        }

        self.evaluate_jq(trimmed)
    }

    /// Resolves a template value: strings starting with `.` are evaluated as
    /// jq expressions, objects and arrays are walked recursively, everything
    /// else passes through unchanged.
    pub fn resolve_template(&self, value: &JsonValue) -> Result<JsonValue, ContextError> {
        match value {
            JsonValue::String(inner) => {
                let trimmed = inner.trim();
                if trimmed.starts_with('.') {
                    self.evaluate_jq(trimmed)
                } else {
                    Ok(JsonValue::String(inner.clone()))
                }
            }
            JsonValue::Object(map) => {
                let mut resolved = JsonMap::with_capacity(map.len());
                for (key, val) in map {
                    resolved.insert(key.clone(), self.resolve_template(val)?);
                }
                Ok(JsonValue::Object(resolved))
            }
            JsonValue::Array(items) => Ok(JsonValue::Array(
                items
                    .iter()
                    .map(|item| self.resolve_template(item))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            _ => Ok(value.clone()),
        }
    }

    pub fn resolve_to_string(&self, value: &JsonValue) -> Result<String, ContextError> {
        let resolved = self.resolve_template(value)?;
        Ok(match resolved {
            JsonValue::Null => String::new(),
            JsonValue::Bool(flag) => flag.to_string(),
            JsonValue::Number(num) => num.to_string(),
            JsonValue::String(inner) => inner,
            other => other.to_string(),
        })
    }

    fn evaluate_jq(&self, expression: &str) -> Result<JsonValue, ContextError> {
        let (parsed, parse_errors) = jaq_parse::parse(expression, jaq_parse::main());

        if !parse_errors.is_empty() {
            let reason = parse_errors
                .into_iter()
                .map(|err| err.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ContextError::InvalidJqExpression {
                expression: expression.to_string(),
                reason,
            });
        }

        let main = parsed.ok_or_else(|| ContextError::InvalidJqExpression {
            expression: expression.to_string(),
            reason: "expression did not produce a filter".to_string(),
        })?;

        let mut ctx = JaqParseCtx::new(Vec::new());
        let filter = ctx.compile(main);
        if !ctx.errs.is_empty() {
            return Err(ContextError::InvalidJqExpression {
                expression: expression.to_string(),
                reason: "failed to compile expression".to_string(),
            });
        }

        let inputs = JaqRcIter::new(std::iter::empty::<Result<JaqVal, String>>());
        let input = JaqVal::from(JsonValue::Array(self.snapshot_slots()));
        let mut results = filter.run((JaqCtx::new([], &inputs), input));

        let first = results
            .next()
            .ok_or_else(|| ContextError::JaqNoResults {
                expression: expression.to_string(),
            })?
            .map_err(|err| ContextError::JaqRuntime {
                expression: expression.to_string(),
                error: err.to_string(),
            })?;

        if results.next().is_some() {
            return Err(ContextError::JaqMultipleResults {
                expression: expression.to_string(),
            });
        }

        Ok(JsonValue::from(first))
    }

    fn snapshot_slots(&self) -> Vec<JsonValue> {
        let Some(max_slot) = self.slots.keys().copied().max() else {
            return Vec::new();
        };

        let mut ordered = vec![JsonValue::Null; max_slot + 1];
        for (slot, value) in &self.slots {
            ordered[*slot] = value.clone();
        }
        ordered
    }

    pub fn into_vec(self) -> Vec<JsonValue> {
        let Some(max_slot) = self.slots.keys().copied().max() else {
            return Vec::new();
        };

        let mut ordered = vec![JsonValue::Null; max_slot + 1];
        for (slot, value) in self.slots {
            ordered[slot] = value;
        }
        ordered
    }

    /// Trace metadata surfaced with every execution log line.
    pub fn observability(&self) -> ExecutionObservability {
        ExecutionObservability {
            trace_id: TRACE_POINTERS.iter().find_map(|pointer| {
                self.slot_value(SOURCE_SLOT)
                    .and_then(|value| value.pointer(pointer))
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
            }),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionObservability {
    pub trace_id: Option<String>,
}

pub fn message_to_value(message: &BridgeMessage) -> JsonValue {
    let mut headers = JsonMap::new();
    for (name, value) in &message.headers {
        headers.insert(name.clone(), JsonValue::String(value.clone()));
    }

    let mut metadata = JsonMap::new();
    for (key, value) in &message.metadata {
        metadata.insert(key.clone(), JsonValue::String(value.clone()));
    }

    let body = match serde_json::from_slice::<JsonValue>(&message.body) {
        Ok(parsed) => parsed,
        Err(_) => JsonValue::String(BASE64_STANDARD.encode(&message.body)),
    };

    let mut root = JsonMap::new();
    root.insert("endpoint".to_string(), JsonValue::String(message.endpoint.clone()));
    root.insert("headers".to_string(), JsonValue::Object(headers));
    root.insert("metadata".to_string(), JsonValue::Object(metadata));
    root.insert("body".to_string(), body);
    JsonValue::Object(root)
}

fn parse_literal_string(expression: &str) -> Option<String> {
    let trimmed = expression.trim();
    if trimmed.len() < 2 {
        return None;
    }

    let first = trimmed.chars().next()?;
    let last = trimmed.chars().last()?;
    if first != last || (first != '"' && first != '\'') {
        return None;
    }

    let inner = &trimmed[1..trimmed.len() - 1];
    let mut output = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => output.push('\n'),
                Some('r') => output.push('\r'),
                Some('t') => output.push('\t'),
                Some(other) => output.push(other),
                None => {}
            }
        } else {
            output.push(ch);
        }
    }
    Some(output)
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("expression `{expression}` is not a valid slot reference")]
    InvalidExpression { expression: String },
    #[error("jq expression `{expression}` is invalid: {reason}")]
    InvalidJqExpression { expression: String, reason: String },
    #[error("jq expression `{expression}` returned no results")]
    JaqNoResults { expression: String },
    #[error("jq expression `{expression}` produced multiple results")]
    JaqMultipleResults { expression: String },
    #[error("jq expression `{expression}` failed at runtime: {error}")]
    JaqRuntime { expression: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context_with_body(body: JsonValue) -> ExecutionContext {
        let message = BridgeMessage::new("sensor-in", Vec::new(), body.to_string().into_bytes());
        ExecutionContext::from_message(&message)
    }

    #[test]
    fn source_slot_exposes_parsed_body() {
        let context = context_with_body(json!({"temperature": 21.5}));
        let value = context.resolve_expression(".[0].body.temperature").unwrap();
        assert_eq!(value, json!(21.5));
    }

    #[test]
    fn non_json_body_is_base64_encoded() {
        let message = BridgeMessage::new("sensor-in", Vec::new(), vec![0xff, 0x00, 0x7f]);
        let context = ExecutionContext::from_message(&message);
        let body = context.resolve_expression(".[0].body").unwrap();
        assert_eq!(body, json!(BASE64_STANDARD.encode([0xff, 0x00, 0x7f])));
    }

    #[test]
    fn push_slot_appends_after_last() {
        let mut context = context_with_body(json!({}));
        let slot = context.push_slot(json!({"scaled": 42}));
        assert_eq!(slot, 1);
        let value = context.resolve_expression(".[1].scaled").unwrap();
        assert_eq!(value, json!(42));
    }

    #[test]
    fn templates_resolve_nested_expressions() {
        let context = context_with_body(json!({"device": "press-7", "value": 3}));
        let template = json!({
            "id": ".[0].body.device",
            "reading": ".[0].body.value",
            "unit": "bar"
        });
        let resolved = context.resolve_template(&template).unwrap();
        assert_eq!(
            resolved,
            json!({"id": "press-7", "reading": 3, "unit": "bar"})
        );
    }

    #[test]
    fn literal_strings_bypass_jq() {
        let context = context_with_body(json!({}));
        let value = context.resolve_expression("'fixed'").unwrap();
        assert_eq!(value, json!("fixed"));
    }

    #[test]
    fn multiple_results_are_rejected() {
        let context = context_with_body(json!({"values": [1, 2, 3]}));
        let err = context.resolve_expression(".[0].body.values[]").unwrap_err();
        assert!(matches!(err, ContextError::JaqMultipleResults { .. }));
    }

    #[test]
    fn trace_id_surfaces_from_metadata() {
        let message = BridgeMessage::new("sensor-in", Vec::new(), b"{}".to_vec())
            .with_metadata("trace_id", "abc-123");
        let context = ExecutionContext::from_message(&message);
        assert_eq!(context.observability().trace_id.as_deref(), Some("abc-123"));
    }
}
