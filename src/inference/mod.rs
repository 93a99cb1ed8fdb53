pub mod gemini;
pub mod openai;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::InferenceError;
use crate::types::InferenceRequest;

/// Pure model-endpoint call. No state, no history, no retries.
/// Request in, raw JSON reply out; the normalizer interprets it.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn infer(&self, request: InferenceRequest) -> Result<Value, InferenceError>;
}

/// Blanket impl so `Box<dyn InferenceProvider>` can be passed directly to the engine.
#[async_trait]
impl InferenceProvider for Box<dyn InferenceProvider> {
    async fn infer(&self, request: InferenceRequest) -> Result<Value, InferenceError> {
        (**self).infer(request).await
    }
}

#[async_trait]
impl<P: InferenceProvider + ?Sized> InferenceProvider for Arc<P> {
    async fn infer(&self, request: InferenceRequest) -> Result<Value, InferenceError> {
        (**self).infer(request).await
    }
}

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use retry::RetryingProvider;
