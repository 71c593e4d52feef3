//! Caller side of the `homo.Function` service.
//!
//! Every call carries a FunctionInvokeID so a retried attempt is recognised
//! by the runtime and answered from its invocation cache instead of running
//! the function twice.

use std::{cmp::min, time::Duration};

use anyhow::{anyhow, Context, Result};
use function_proto::{FunctionClient as GrpcFunctionClient, FunctionMessage};
use rand::Rng;
use tonic::{
    transport::{Channel, Endpoint},
    Code,
    Status,
};
use tracing::{debug, warn};

use crate::{
    config::{ClientConfig, RetryConfig},
    message::FunctionMessageExt,
};

/// Exponential backoff with jitter. Each delay lies in `[d/2, d]` where `d`
/// grows by `factor` from `min_delay` up to `max_delay`.
pub struct Backoff {
    next: Duration,
    max: Duration,
    factor: f64,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            next: Duration::from_millis(config.min_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            factor: config.factor,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        // Saturate at `max` when the product is not a representable duration.
        self.next = Duration::try_from_secs_f64(base.as_secs_f64() * self.factor)
            .map_or(self.max, |next| min(self.max, next));
        base.mul_f64(rand::rng().random_range(0.5..=1.0))
    }
}

pub fn is_retryable(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted | Code::Aborted
    )
}

/// Cheap to share; concurrent calls each use their own clone of the
/// underlying channel.
#[derive(Clone)]
pub struct FunctionClient {
    client: GrpcFunctionClient<Channel>,
    call_timeout: Option<Duration>,
    retry: RetryConfig,
}

impl FunctionClient {
    /// Builds a client whose connection is established on first use.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let channel = Self::endpoint(config)?.connect_lazy();
        Ok(Self::with_channel(channel, config))
    }

    /// Builds a client and connects eagerly, failing fast when the runtime is
    /// unreachable.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let channel = Self::endpoint(config)?
            .connect()
            .await
            .with_context(|| format!("error connecting to {}", config.address))?;
        Ok(Self::with_channel(channel, config))
    }

    fn endpoint(config: &ClientConfig) -> Result<Endpoint> {
        config.retry.validate()?;
        let endpoint = Endpoint::from_shared(config.address.clone())
            .with_context(|| format!("invalid function address: {}", config.address))?
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        Ok(endpoint)
    }

    fn with_channel(channel: Channel, config: &ClientConfig) -> Self {
        let client = GrpcFunctionClient::new(channel)
            .max_decoding_message_size(config.max_message_size)
            .max_encoding_message_size(config.max_message_size);
        Self {
            client,
            call_timeout: config.call_timeout(),
            retry: config.retry.clone(),
        }
    }

    /// Invokes `Call`, retrying transient failures with backoff.
    ///
    /// Errors are `anyhow` wrappers around the final `tonic::Status`.
    pub async fn call(&self, mut message: FunctionMessage) -> Result<FunctionMessage> {
        let invoke_id = message.ensure_invoke_id().to_string();
        let mut backoff = Backoff::new(&self.retry);
        let mut attempt = 1;
        loop {
            match self.call_once(message.clone()).await {
                Ok(response) => {
                    if !response.function_invoke_id.is_empty()
                        && response.function_invoke_id != invoke_id
                    {
                        return Err(anyhow!(
                            "response invoke id {} does not match request {}",
                            response.function_invoke_id,
                            invoke_id
                        ));
                    }
                    debug!(invoke_id = %invoke_id, attempt, "call succeeded");
                    return Ok(response);
                }
                Err(status) if is_retryable(&status) && attempt < self.retry.max_attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        invoke_id = %invoke_id,
                        attempt,
                        code = ?status.code(),
                        error = status.message(),
                        "call failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(status) => {
                    return Err(anyhow::Error::new(status).context(format!(
                        "call to function {} failed after {} attempt(s)",
                        message.function_name, attempt
                    )));
                }
            }
        }
    }

    async fn call_once(&self, message: FunctionMessage) -> Result<FunctionMessage, Status> {
        let mut client = self.client.clone();
        let fut = client.call(message);
        let response = match self.call_timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut).await.map_err(|_| {
                Status::deadline_exceeded(format!("call timed out after {timeout:?}"))
            })??,
            None => fut.await?,
        };
        Ok(response.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            min_delay_ms: 100,
            max_delay_ms: 400,
            factor: 2.0,
        };
        let mut backoff = Backoff::new(&config);
        let expected = [100, 200, 400, 400, 400];
        for base in expected {
            let base = Duration::from_millis(base);
            let delay = backoff.next_delay();
            assert!(delay >= base / 2 && delay <= base, "{delay:?} vs {base:?}");
        }
    }

    #[test]
    fn test_backoff_saturates_on_extreme_factor() {
        for factor in [f64::MAX, f64::INFINITY, f64::NAN] {
            let config = RetryConfig {
                max_attempts: 10,
                min_delay_ms: 100,
                max_delay_ms: 400,
                factor,
            };
            let mut backoff = Backoff::new(&config);
            assert!(backoff.next_delay() <= Duration::from_millis(100));
            for _ in 0..3 {
                assert!(backoff.next_delay() <= Duration::from_millis(400));
            }
        }
    }

    #[test]
    fn test_retryable_codes() {
        assert!(is_retryable(&Status::unavailable("down")));
        assert!(is_retryable(&Status::deadline_exceeded("slow")));
        assert!(is_retryable(&Status::resource_exhausted("busy")));
        assert!(!is_retryable(&Status::not_found("missing")));
        assert!(!is_retryable(&Status::internal("boom")));
        assert!(!is_retryable(&Status::invalid_argument("bad")));
    }

    #[test]
    fn test_invalid_address() {
        let config = ClientConfig {
            address: "not a uri".to_string(),
            ..Default::default()
        };
        assert!(FunctionClient::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_runtime_exhausts_retries() {
        let config = ClientConfig {
            address: "http://127.0.0.1:1".to_string(),
            connect_timeout_secs: 1,
            retry: RetryConfig {
                max_attempts: 2,
                min_delay_ms: 1,
                max_delay_ms: 2,
                factor: 2.0,
            },
            ..Default::default()
        };
        let client = FunctionClient::new(&config).unwrap();
        let err = client
            .call(FunctionMessage {
                function_name: "sum".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("after 2 attempt(s)"));
        let status = err.downcast_ref::<Status>().unwrap();
        assert_eq!(status.code(), Code::Unavailable);
    }
}
