//! Payload conversion steps. Each transformer reads the execution context and
//! appends its output as a new slot, so later steps and sink bindings can
//! address it by index.

use crate::config::bridge::{TransformerDefinition, TransformerKind};
use crate::route::context::{ContextError, ExecutionContext};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Transformer {
    name: String,
    step: TransformStep,
}

#[derive(Debug, Clone)]
enum TransformStep {
    Expression(String),
    Template(JsonValue),
}

impl Transformer {
    pub fn from_definition(definition: &TransformerDefinition) -> Result<Self, TransformError> {
        let step = match &definition.kind {
            TransformerKind::Expression => {
                let expression = definition
                    .options
                    .get("expression")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| TransformError::MissingOption {
                        name: definition.name.clone(),
                        option: "expression",
                    })?;
                TransformStep::Expression(expression.to_string())
            }
            TransformerKind::Template => {
                let template = definition.options.get("template").ok_or_else(|| {
                    TransformError::MissingOption {
                        name: definition.name.clone(),
                        option: "template",
                    }
                })?;
                TransformStep::Template(template.clone())
            }
            TransformerKind::Unknown(kind) => {
                return Err(TransformError::UnknownKind {
                    name: definition.name.clone(),
                    kind: kind.clone(),
                })
            }
        };

        Ok(Self {
            name: definition.name.clone(),
            step,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the step and appends its output slot, returning the slot index.
    pub fn apply(&self, context: &mut ExecutionContext) -> Result<usize, TransformError> {
        let output = match &self.step {
            TransformStep::Expression(expression) => context
                .resolve_expression(expression)
                .map_err(|source| TransformError::Evaluation {
                    name: self.name.clone(),
                    source,
                })?,
            TransformStep::Template(template) => context
                .resolve_template(template)
                .map_err(|source| TransformError::Evaluation {
                    name: self.name.clone(),
                    source,
                })?,
        };

        Ok(context.push_slot(output))
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transformer `{name}` has unknown kind `{kind}`")]
    UnknownKind { name: String, kind: String },
    #[error("transformer `{name}` is missing option `{option}`")]
    MissingOption { name: String, option: &'static str },
    #[error("transformer `{name}` failed: {source}")]
    Evaluation {
        name: String,
        #[source]
        source: ContextError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BridgeMessage;
    use serde_json::json;

    fn definition(name: &str, kind: TransformerKind, options: JsonValue) -> TransformerDefinition {
        let JsonValue::Object(options) = options else {
            panic!("options must be an object");
        };
        TransformerDefinition {
            name: name.to_string(),
            kind,
            options,
        }
    }

    fn seeded_context(body: JsonValue) -> ExecutionContext {
        let message = BridgeMessage::new("plc-in", Vec::new(), body.to_string().into_bytes());
        ExecutionContext::from_message(&message)
    }

    #[test]
    fn expression_transformer_pushes_result_slot() {
        let transformer = Transformer::from_definition(&definition(
            "celsius",
            TransformerKind::Expression,
            json!({"expression": ".[0].body.raw / 10"}),
        ))
        .unwrap();

        let mut context = seeded_context(json!({"raw": 215}));
        let slot = transformer.apply(&mut context).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(context.slot_value(1), Some(&json!(21.5)));
    }

    #[test]
    fn template_transformer_builds_structured_output() {
        let transformer = Transformer::from_definition(&definition(
            "envelope",
            TransformerKind::Template,
            json!({"template": {"device": ".[0].body.device", "ok": true}}),
        ))
        .unwrap();

        let mut context = seeded_context(json!({"device": "press-7"}));
        transformer.apply(&mut context).unwrap();
        assert_eq!(
            context.last_slot_value(),
            Some(&json!({"device": "press-7", "ok": true}))
        );
    }

    #[test]
    fn chained_transformers_see_earlier_slots() {
        let first = Transformer::from_definition(&definition(
            "scale",
            TransformerKind::Expression,
            json!({"expression": ".[0].body.raw * 2"}),
        ))
        .unwrap();
        let second = Transformer::from_definition(&definition(
            "wrap",
            TransformerKind::Template,
            json!({"template": {"value": ".[1]"}}),
        ))
        .unwrap();

        let mut context = seeded_context(json!({"raw": 4}));
        first.apply(&mut context).unwrap();
        second.apply(&mut context).unwrap();
        assert_eq!(context.last_slot_value(), Some(&json!({"value": 8})));
    }

    #[test]
    fn missing_expression_option_is_rejected() {
        let err = Transformer::from_definition(&definition(
            "broken",
            TransformerKind::Expression,
            json!({}),
        ))
        .unwrap_err();
        assert!(matches!(
            err,
            TransformError::MissingOption {
                option: "expression",
                ..
            }
        ));
    }

    #[test]
    fn invalid_expression_surfaces_evaluation_error() {
        let transformer = Transformer::from_definition(&definition(
            "syntax",
            TransformerKind::Expression,
            json!({"expression": ".[0].body | | bad"}),
        ))
        .unwrap();

        let mut context = seeded_context(json!({}));
        let err = transformer.apply(&mut context).unwrap_err();
        assert!(matches!(err, TransformError::Evaluation { .. }));
    }
}
