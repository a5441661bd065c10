//! Retry of transient service failures
//!
//! Every read or write against the coordination service goes through
//! [`with_retry`]. Only [`ServiceError::is_transient`] errors are retried;
//! anything that says something about our identity (expired session, missing
//! node) is returned on the first occurrence.

use crate::config::RetryConfig;
use crate::error::ServiceError;
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;

impl RetryConfig {
    /// Exponential backoff policy described by this config
    pub fn policy(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_times);

        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// Run `operation`, retrying connection errors according to `config`
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    operation
        .retry(config.policy())
        .when(ServiceError::is_transient)
        .notify(|err: &ServiceError, delay: Duration| {
            tracing::warn!(
                operation = operation_name,
                error = %err,
                "Transient failure, retrying in {:?}",
                delay
            );
        })
        .await
}
