//! Exponential backoff with jitter around any provider, for use with
//! `backon::Retryable`.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde_json::Value;
use tracing::warn;

use super::InferenceProvider;
use crate::config::RetryConfig;
use crate::error::InferenceError;
use crate::types::InferenceRequest;

pub fn backoff_from(config: &RetryConfig) -> ExponentialBuilder {
    let builder = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.min_delay_ms))
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_factor(config.factor)
        .with_max_times(config.max_retries);
    if config.jitter {
        builder.with_jitter()
    } else {
        builder
    }
}

/// Retries transient failures (network errors, 429, 5xx). Anything else,
/// including a 400 reporting a malformed tool call, is returned at once.
pub struct RetryingProvider<P> {
    inner: P,
    backoff: ExponentialBuilder,
}

impl<P: InferenceProvider> RetryingProvider<P> {
    pub fn new(inner: P, config: &RetryConfig) -> Self {
        Self {
            inner,
            backoff: backoff_from(config),
        }
    }
}

#[async_trait]
impl<P: InferenceProvider> InferenceProvider for RetryingProvider<P> {
    async fn infer(&self, request: InferenceRequest) -> Result<Value, InferenceError> {
        let inner = &self.inner;
        (|| {
            let request = request.clone();
            async move { inner.infer(request).await }
        })
        .retry(self.backoff.clone())
        .when(InferenceError::is_transient)
        .notify(|err: &InferenceError, delay: Duration| {
            warn!(error = %err, delay_ms = delay.as_millis() as u64, "transient inference error, retrying");
        })
        .await
    }
}
