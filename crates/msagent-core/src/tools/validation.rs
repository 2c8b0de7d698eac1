use jsonschema::JSONSchema;
use serde_json::{Map, Value};
use tracing::debug;

/// Checks tool arguments against a tool's declared input schema.
///
/// Schemas the validator cannot compile fall back to checking `required`
/// properties only, so an unusual schema never makes a tool unusable.
pub struct ArgumentValidator {
    compiled: Option<JSONSchema>,
    required: Vec<String>,
}

impl std::fmt::Debug for ArgumentValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgumentValidator")
            .field("compiled", &self.compiled.is_some())
            .field("required", &self.required)
            .finish()
    }
}

impl ArgumentValidator {
    pub fn new(tool_name: &str, schema: &Value) -> Self {
        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let compiled = match JSONSchema::compile(schema) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                debug!(tool = tool_name, error = %e, "input schema not compilable; checking required fields only");
                None
            }
        };

        Self { compiled, required }
    }

    pub fn validate(&self, arguments: &Value) -> Result<(), String> {
        if let Some(compiled) = &self.compiled {
            if let Err(errors) = compiled.validate(arguments) {
                let messages: Vec<String> = errors
                    .map(|e| {
                        let path = e.instance_path.to_string();
                        if path.is_empty() {
                            e.to_string()
                        } else {
                            format!("{path}: {e}")
                        }
                    })
                    .collect();
                return Err(messages.join("; "));
            }
            return Ok(());
        }

        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|key| arguments.get(key.as_str()).is_none())
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required properties: {}", missing.join(", ")))
        }
    }
}

/// Turns assembled call arguments into the object sent to the server.
///
/// `null` means "no arguments". A JSON string holds raw text the model
/// produced that did not parse as JSON.
pub fn normalize_arguments(arguments: &Value) -> Result<Value, String> {
    match arguments {
        Value::Object(_) => Ok(arguments.clone()),
        Value::Null => Ok(Value::Object(Map::new())),
        Value::String(raw) => Err(format!("arguments are not valid JSON: {raw}")),
        other => Err(format!("arguments must be a JSON object, got {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn path_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    #[rstest]
    #[case(json!({"path": "a.txt"}), true)]
    #[case(json!({}), false)]
    #[case(json!({"path": 42}), false)]
    fn validates_against_schema(#[case] arguments: Value, #[case] ok: bool) {
        let validator = ArgumentValidator::new("read_file", &path_schema());
        assert_eq!(validator.validate(&arguments).is_ok(), ok);
    }

    #[test]
    fn uncompilable_schema_checks_required_only() {
        let schema = json!({"type": "not-a-type", "required": ["path"]});
        let validator = ArgumentValidator::new("odd", &schema);

        assert!(validator.validate(&json!({"path": "x"})).is_ok());
        let err = validator.validate(&json!({})).unwrap_err();
        assert!(err.contains("path"));
    }

    #[rstest]
    #[case(json!(null), Ok(json!({})))]
    #[case(json!({"a": 1}), Ok(json!({"a": 1})))]
    fn normalizes_accepted_shapes(#[case] input: Value, #[case] expected: Result<Value, String>) {
        assert_eq!(normalize_arguments(&input), expected);
    }

    #[test]
    fn rejects_raw_text_and_non_objects() {
        assert!(normalize_arguments(&json!("{\"path\": ")).unwrap_err().contains("not valid JSON"));
        assert!(normalize_arguments(&json!([1, 2])).is_err());
    }
}
