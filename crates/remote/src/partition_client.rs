use std::{future::Future, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cache::{ClientFactory, CommunicationClientFactory, ResolvedClient},
    error::{ClientError, RemoteError},
    resolver::{PartitionKey, ReplicaSelector},
    retry::{ExceptionHandlingResult, RetryTracker, classify},
};

/// Routes calls to one partition of the source service through the client cache,
/// retrying classified failures.
pub struct ServicePartitionClient<F: ClientFactory> {
    factory: Arc<CommunicationClientFactory<F>>,
    partition_key: PartitionKey,
    selector: ReplicaSelector,
    listener: String,
}

impl<F: ClientFactory> std::fmt::Debug for ServicePartitionClient<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePartitionClient")
            .field("partition_key", &self.partition_key)
            .field("selector", &self.selector)
            .field("listener", &self.listener)
            .finish()
    }
}

impl<F: ClientFactory> Clone for ServicePartitionClient<F> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            partition_key: self.partition_key.clone(),
            selector: self.selector,
            listener: self.listener.clone(),
        }
    }
}

impl<F: ClientFactory> ServicePartitionClient<F> {
    pub fn new(
        factory: Arc<CommunicationClientFactory<F>>,
        partition_key: PartitionKey,
        listener: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            partition_key,
            selector: ReplicaSelector::default(),
            listener: listener.into(),
        }
    }

    pub fn with_selector(mut self, selector: ReplicaSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn factory(&self) -> &Arc<CommunicationClientFactory<F>> {
        &self.factory
    }

    /// Invokes `op` against the current client of the partition.
    ///
    /// Failures are classified by the factory's exception handlers. Transient failures are
    /// retried on the same client; non-transient ones drop the client and re-resolve the
    /// partition first. Consecutive failures with the same error id count towards that
    /// id's retry bound, a different id starts a new count. Cancellation is honored before
    /// every client acquisition and every backoff delay.
    pub async fn invoke_with_retry<T, Op, Fut>(
        &self,
        mut op: Op,
        cancel: &CancellationToken,
    ) -> Result<T, ClientError>
    where
        Op: FnMut(Arc<F::Client>) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut tracker = RetryTracker::default();
        let mut current: Option<ResolvedClient<F::Client>> = None;

        loop {
            let resolved = match current.take() {
                Some(resolved) => resolved,
                None => {
                    if cancel.is_cancelled() {
                        return Err(ClientError::Cancelled);
                    }
                    match self
                        .factory
                        .get_client(&self.partition_key, self.selector, &self.listener, cancel)
                        .await
                    {
                        Ok(resolved) => resolved,
                        Err(ClientError::Remote(error)) => {
                            let retry = self.on_failure(&mut tracker, error, None).await?;
                            self.backoff(retry.delay, cancel).await?;
                            continue;
                        }
                        Err(other) => return Err(other),
                    }
                }
            };

            let error = match op(resolved.client.clone()).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let retry = self
                .on_failure(&mut tracker, error, Some(&resolved))
                .await?;
            if retry.transient {
                current = Some(resolved);
            }
            self.backoff(retry.delay, cancel).await?;
        }
    }

    /// Classifies a failure and updates the retry bookkeeping. Non-transient failures
    /// invalidate the routing before returning.
    async fn on_failure(
        &self,
        tracker: &mut RetryTracker,
        error: RemoteError,
        resolved: Option<&ResolvedClient<F::Client>>,
    ) -> Result<NextAttempt, ClientError> {
        let settings = self.factory.settings();
        let decision = match classify(self.factory.exception_handlers(), &error, settings) {
            ExceptionHandlingResult::Retry(decision) => decision,
            ExceptionHandlingResult::Throw => {
                debug!(error = %error, "Remote call failed with non-retryable error");
                return Err(exhausted(tracker, error));
            }
        };

        let attempt = tracker.record(&decision.error_id);
        if attempt > decision.max_retry_count {
            warn!(
                error = %error,
                error_id = decision.error_id,
                attempts = attempt,
                "Remote call exceeded retry bound"
            );
            return Err(exhausted(tracker, error));
        }
        tracker.total_retries += 1;

        let delay = decision
            .delay
            .unwrap_or_else(|| settings.policy.delay(decision.transient, attempt));
        debug!(
            error = %error,
            error_id = decision.error_id,
            attempt,
            transient = decision.transient,
            delay_ms = delay.as_millis() as u64,
            "Retrying remote call"
        );

        if !decision.transient {
            match resolved {
                Some(resolved) => self.factory.invalidate(&self.partition_key, resolved).await,
                None => self.factory.mark_stale(&self.partition_key, None),
            }
        }
        Ok(NextAttempt {
            transient: decision.transient,
            delay,
        })
    }

    async fn backoff(&self, delay: Duration, cancel: &CancellationToken) -> Result<(), ClientError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

struct NextAttempt {
    transient: bool,
    delay: Duration,
}

fn exhausted(tracker: &RetryTracker, last: RemoteError) -> ClientError {
    if tracker.distinct_ids.len() > 1 {
        ClientError::Aggregate {
            last,
            error_ids: tracker.distinct_ids.clone(),
            retries: tracker.total_retries,
        }
    } else {
        ClientError::Remote(last)
    }
}
