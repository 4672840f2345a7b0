use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::responses::TextFormat;

/// Types usable as strict structured output.
///
/// Strict mode requires `additionalProperties: false` on every object, every
/// property listed in `required` (nullable ones included) and no `$ref`s.
pub trait StructuredOutput: JsonSchema + DeserializeOwned {
    fn strict_schema() -> Value {
        let mut value = serde_json::to_value(schema_for!(Self)).unwrap_or_default();

        let definitions = value
            .as_object_mut()
            .and_then(|root| {
                root.remove("$schema");
                root.remove("definitions")
            })
            .unwrap_or(Value::Object(Map::new()));

        inline_refs(&mut value, &definitions);
        close_objects(&mut value);
        value
    }

    /// `text.format` block for a Responses request.
    fn text_format(name: &str) -> TextFormat {
        TextFormat::json_schema(name, Self::strict_schema())
    }
}

impl<T: JsonSchema + DeserializeOwned> StructuredOutput for T {}

fn inline_refs(value: &mut Value, definitions: &Value) {
    match value {
        Value::Object(map) => {
            let target = map
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|r| r.strip_prefix("#/definitions/"))
                .and_then(|name| definitions.get(name))
                .cloned();
            if let Some(def) = target {
                *value = def;
                inline_refs(value, definitions);
                return;
            }

            // schemars wraps referenced fields with descriptions as a single-entry allOf
            let single = match map.get("allOf").and_then(Value::as_array) {
                Some(all_of) if all_of.len() == 1 => Some(all_of[0].clone()),
                _ => None,
            };
            if let Some(inner) = single {
                *value = inner;
                inline_refs(value, definitions);
                return;
            }

            for v in map.values_mut() {
                inline_refs(v, definitions);
            }
        }
        Value::Array(items) => {
            for item in items {
                inline_refs(item, definitions);
            }
        }
        _ => {}
    }
}

fn close_objects(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str) == Some("object") {
                map.insert("additionalProperties".to_string(), Value::Bool(false));
                let keys: Vec<Value> = map
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|props| props.keys().cloned().map(Value::String).collect())
                    .unwrap_or_default();
                map.insert("required".to_string(), Value::Array(keys));
            }
            for v in map.values_mut() {
                close_objects(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                close_objects(item);
            }
        }
        _ => {}
    }
}
