use async_trait::async_trait;
use serde_json::Value;

/// A named, schema-described operation the model can invoke.
/// Consumers implement this for each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the arguments object. `None` means no parameters.
    fn schema(&self) -> Option<Value> {
        None
    }

    /// Schema computed when tools are offered to the model, for tools whose
    /// parameters depend on live state. Takes precedence over [`Tool::schema`].
    fn dynamic_schema(&self) -> Option<Value> {
        None
    }

    /// Run the tool. `Err` is a hard failure; an `Ok` value carrying a
    /// non-null `error` field is a soft failure. Both count as failed.
    async fn execute(&self, args: &Value) -> Result<Value, String>;
}

/// True when a tool result reports failure through an `error` field.
pub fn is_soft_error(output: &Value) -> bool {
    match output.get("error") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}
