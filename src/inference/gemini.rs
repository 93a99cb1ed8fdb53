use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::InferenceProvider;
use crate::error::InferenceError;
use crate::types::{InferenceRequest, Message, Role, ToolChoice};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Schema keywords the Gemini function-declaration dialect rejects.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "additionalProperties", "$id", "examples"];

/// Google Gemini `generateContent` provider.
pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub(crate) fn build_body(request: &InferenceRequest) -> Value {
        let mut system_parts = Vec::new();
        let mut contents: Vec<Value> = Vec::new();
        // functionResponse parts must carry the tool name, which only the
        // assistant message that made the call knows.
        let mut call_names: HashMap<&str, &str> = HashMap::new();
        let mut seen_conversation = false;

        for msg in &request.messages {
            let (role, parts) = match msg.role {
                Role::System if !seen_conversation => {
                    system_parts.push(json!({ "text": msg.content }));
                    continue;
                }
                Role::System => ("user", vec![json!({ "text": format!("[System] {}", msg.content) })]),
                Role::User => ("user", vec![json!({ "text": msg.content })]),
                Role::Assistant => {
                    for call in &msg.tool_calls {
                        call_names.insert(call.id.as_str(), call.name.as_str());
                    }
                    ("model", Self::model_parts(msg))
                }
                Role::Tool => {
                    let id = msg.tool_call_id.as_deref().unwrap_or_default();
                    let name = call_names.get(id).copied().unwrap_or(id);
                    let response = match serde_json::from_str::<Value>(&msg.content) {
                        Ok(v @ Value::Object(_)) => v,
                        Ok(other) => json!({ "result": other }),
                        Err(_) => json!({ "result": msg.content }),
                    };
                    (
                        "user",
                        vec![json!({ "functionResponse": { "name": name, "response": response } })],
                    )
                }
            };
            seen_conversation = true;
            if parts.is_empty() {
                continue;
            }

            // Consecutive turns from the same side are merged into one content.
            match contents.last_mut() {
                Some(last) if last["role"] == role => {
                    if let Some(existing) = last["parts"].as_array_mut() {
                        existing.extend(parts);
                    }
                }
                _ => contents.push(json!({ "role": role, "parts": parts })),
            }
        }

        let mut generation = json!({ "maxOutputTokens": request.max_tokens });
        if let Some(t) = request.temperature {
            generation["temperature"] = json!(t);
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation,
        });

        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({ "parts": system_parts });
        }

        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .filter_map(|t| {
                    let f = t.get("function")?;
                    let name = f.get("name")?.clone();
                    let mut decl = json!({
                        "name": name,
                        "description": f.get("description").cloned().unwrap_or_default(),
                    });
                    if let Some(params) = f.get("parameters") {
                        decl["parameters"] = clean_schema(params);
                    }
                    Some(decl)
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
            if request.tool_choice == ToolChoice::None {
                body["toolConfig"] = json!({ "functionCallingConfig": { "mode": "NONE" } });
            }
        }

        body
    }

    fn model_parts(msg: &Message) -> Vec<Value> {
        let mut parts = Vec::new();
        if !msg.content.is_empty() {
            parts.push(json!({ "text": msg.content }));
        }
        let signatures = msg
            .provider_metadata
            .get("thought_signatures")
            .and_then(Value::as_object);
        for call in &msg.tool_calls {
            let mut part = json!({
                "functionCall": { "name": call.name, "args": call.arguments }
            });
            if let Some(sig) = signatures.and_then(|s| s.get(&call.id)) {
                part["thoughtSignature"] = sig.clone();
            }
            parts.push(part);
        }
        parts
    }
}

fn clean_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), clean_schema(v)))
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(clean_schema).collect()),
        other => other.clone(),
    }
}

#[async_trait]
impl InferenceProvider for GeminiProvider {
    async fn infer(&self, request: InferenceRequest) -> Result<Value, InferenceError> {
        let body = Self::build_body(&request);
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, request.model
        );

        debug!(
            model = %request.model,
            contents = body["contents"].as_array().map_or(0, Vec::len),
            "gemini inference request"
        );

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(InferenceError::ApiError { status, body: text });
        }

        serde_json::from_str(&text).map_err(|e| InferenceError::Parse(e.to_string()))
    }
}
