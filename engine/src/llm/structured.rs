//! Schema-constrained generation
//!
//! Structured calls ask the model for a JSON object matching a declared schema
//! and then deserialize it into a concrete Rust type. A value that does not
//! deserialize is reported as `LLMError::SchemaValidation`, never passed on.

use super::{LLMError, LanguageModel, Message, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Named JSON schema sent alongside a structured request
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub name: String,
    pub schema: Value,
}

impl OutputSchema {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }

    /// Object schema whose properties are all required booleans
    pub fn boolean_object(name: &str, fields: &[(&str, &str)]) -> Self {
        let mut properties = serde_json::Map::new();
        for (field, description) in fields {
            properties.insert(
                (*field).to_string(),
                serde_json::json!({ "type": "boolean", "description": description }),
            );
        }
        let required: Vec<&str> = fields.iter().map(|(field, _)| *field).collect();

        Self::new(
            name,
            serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": required,
                "additionalProperties": false
            }),
        )
    }
}

/// Types that can be produced by a structured call
pub trait StructuredOutput: DeserializeOwned + Send {
    fn schema() -> OutputSchema;
}

/// Run a structured call and validate the result against `T`
pub async fn generate_typed<T: StructuredOutput>(
    model: &dyn LanguageModel,
    messages: &[Message],
) -> Result<T> {
    let schema = T::schema();
    let value = model.generate_structured(messages, &schema).await?;
    parse_structured(&schema.name, value)
}

/// Deserialize a raw structured value, mapping failure to `SchemaValidation`
pub fn parse_structured<T: DeserializeOwned>(schema_name: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| LLMError::SchemaValidation {
        schema: schema_name.to_string(),
        reason: e.to_string(),
    })
}
