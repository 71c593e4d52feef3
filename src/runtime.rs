//! Server side of the `homo.Function` service.
//!
//! A `FunctionRuntime` dispatches each `Call` to the handler registered for
//! the message's `FunctionName`. Failures are reported through the gRPC
//! status; the response message never carries error information.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use function_proto::{Function, FunctionMessage};
use opentelemetry::KeyValue;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn, Instrument};

use crate::{
    config::ServerConfig,
    invocation_cache::InvocationCache,
    metrics::{function_calls, Timer},
};

#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn call(&self, message: FunctionMessage) -> Result<FunctionMessage>;
}

/// Returns the request unchanged.
pub struct EchoHandler;

#[async_trait]
impl FunctionHandler for EchoHandler {
    async fn call(&self, message: FunctionMessage) -> Result<FunctionMessage> {
        Ok(message)
    }
}

/// Adapts an async closure into a `FunctionHandler`.
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(FunctionMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<FunctionMessage>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> FunctionHandler for HandlerFn<F>
where
    F: Fn(FunctionMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<FunctionMessage>> + Send,
{
    async fn call(&self, message: FunctionMessage) -> Result<FunctionMessage> {
        (self.f)(message).await
    }
}

pub struct FunctionRuntime {
    handlers: HashMap<String, Arc<dyn FunctionHandler>>,
    fallback: Option<Arc<dyn FunctionHandler>>,
    call_timeout: Option<Duration>,
    cache: Option<InvocationCache>,
    metrics: Arc<function_calls::Metrics>,
}

impl FunctionRuntime {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: None,
            call_timeout: config.call_timeout(),
            cache: InvocationCache::from_config(&config.invocation_cache),
            metrics: Arc::new(function_calls::Metrics::new()),
        }
    }

    pub fn register(
        mut self,
        function_name: impl Into<String>,
        handler: impl FunctionHandler + 'static,
    ) -> Self {
        self.handlers.insert(function_name.into(), Arc::new(handler));
        self
    }

    /// Handler used for names without a registered handler.
    pub fn with_fallback(mut self, handler: impl FunctionHandler + 'static) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn resolve(&self, function_name: &str) -> Result<Arc<dyn FunctionHandler>, Status> {
        if let Some(handler) = self.handlers.get(function_name) {
            return Ok(handler.clone());
        }
        if let Some(fallback) = &self.fallback {
            return Ok(fallback.clone());
        }
        if function_name.is_empty() {
            return Err(Status::invalid_argument("FunctionName is required"));
        }
        Err(Status::not_found(format!("function {function_name} not found")))
    }

    #[tracing::instrument(
        skip_all,
        fields(
            function = %message.function_name,
            invoke_id = %message.function_invoke_id,
        )
    )]
    pub async fn invoke(&self, message: FunctionMessage) -> Result<FunctionMessage, Status> {
        let labels = [KeyValue::new("function", message.function_name.clone())];
        self.metrics.calls.add(1, &labels);
        self.metrics
            .payload_bytes
            .add(message.payload.len() as u64, &labels);

        let result = self.dispatch(message, &labels).await;
        if let Err(status) = &result {
            warn!(code = ?status.code(), error = status.message(), "call failed");
            self.metrics.errors.add(
                1,
                &[
                    labels[0].clone(),
                    KeyValue::new("code", status.code().description()),
                ],
            );
        }
        result
    }

    async fn dispatch(
        &self,
        message: FunctionMessage,
        labels: &[KeyValue],
    ) -> Result<FunctionMessage, Status> {
        let run = HandlerRun {
            handler: self.resolve(&message.function_name)?,
            call_timeout: self.call_timeout,
            metrics: self.metrics.clone(),
            labels: labels.to_vec(),
        };
        let Some(cache) = self
            .cache
            .as_ref()
            .filter(|_| !message.function_invoke_id.is_empty())
        else {
            return run.run(message).await;
        };

        // Duplicates of an in-flight invocation wait for its result. A failed
        // run leaves the slot empty so the next attempt runs the handler.
        // The task outlives a caller that gives up, so its retry can join it.
        let slot = cache.slot(&message.function_name, &message.function_invoke_id);
        let task = tokio::spawn(
            async move {
                let mut ran = false;
                let result = slot
                    .get_or_try_init(|| {
                        ran = true;
                        run.run(message)
                    })
                    .await
                    .cloned();
                (result, ran)
            }
            .in_current_span(),
        );
        let (result, ran) = task
            .await
            .map_err(|err| Status::internal(format!("invocation task failed: {err}")))?;
        let response = result?;
        if !ran {
            debug!("answering retried invocation from cache");
            self.metrics.cache_hits.add(1, labels);
        }
        Ok(response)
    }
}

/// One handler execution with the runtime state it needs.
struct HandlerRun {
    handler: Arc<dyn FunctionHandler>,
    call_timeout: Option<Duration>,
    metrics: Arc<function_calls::Metrics>,
    labels: Vec<KeyValue>,
}

impl HandlerRun {
    async fn run(self, message: FunctionMessage) -> Result<FunctionMessage, Status> {
        let invoke_id = message.function_invoke_id.clone();
        let function_name = message.function_name.clone();

        let mut response = {
            let _timer = Timer::start_with_labels(&self.metrics.call_duration, &self.labels);
            let fut = self.handler.call(message);
            let result = match self.call_timeout {
                Some(timeout) => tokio::time::timeout(timeout, fut).await.map_err(|_| {
                    Status::deadline_exceeded(format!(
                        "function {function_name} timed out after {timeout:?}"
                    ))
                })?,
                None => fut.await,
            };
            result.map_err(handler_error_to_status)?
        };

        if response.function_invoke_id.is_empty() {
            response.function_invoke_id = invoke_id;
        }
        info!("call completed");
        Ok(response)
    }
}

fn handler_error_to_status(err: anyhow::Error) -> Status {
    match err.downcast::<Status>() {
        Ok(status) => status,
        Err(err) => Status::internal(format!("{err:#}")),
    }
}

#[tonic::async_trait]
impl Function for FunctionRuntime {
    async fn call(
        &self,
        request: Request<FunctionMessage>,
    ) -> Result<Response<FunctionMessage>, Status> {
        let response = self.invoke(request.into_inner()).await?;
        Ok(Response::new(response))
    }
}
