use std::{net::SocketAddr, sync::Once, time::Duration};

use anyhow::Result;
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    client::FunctionClient,
    config::{ClientConfig, Config, RetryConfig},
    runtime::FunctionRuntime,
    service::Service,
};

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(env_filter),
            ),
        );
    });
}

/// A runtime serving on an ephemeral localhost port.
pub struct TestService {
    pub service: Service,
    pub addr: SocketAddr,
    handle: JoinHandle<Result<()>>,
}

impl TestService {
    pub async fn new(runtime: FunctionRuntime) -> Result<Self> {
        Self::with_config(Config::default(), runtime).await
    }

    pub async fn with_config(mut config: Config, runtime: FunctionRuntime) -> Result<Self> {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        config.server.listen_addr = addr.to_string();

        let service = Service::new(config, runtime)?;
        let handle = tokio::spawn({
            let service = service.clone();
            async move { service.serve(listener).await }
        });

        Ok(Self {
            service,
            addr,
            handle,
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            address: format!("http://{}", self.addr),
            connect_timeout_secs: 1,
            call_timeout_secs: 5,
            retry: RetryConfig {
                max_attempts: 3,
                min_delay_ms: 10,
                max_delay_ms: 50,
                factor: 2.0,
            },
            ..Default::default()
        }
    }

    pub fn client(&self) -> Result<FunctionClient> {
        FunctionClient::new(&self.client_config())
    }

    pub async fn stop(self) -> Result<()> {
        self.service.shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.handle).await???;
        Ok(())
    }
}
