use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use function_proto::{descriptor::FUNCTION_FILE_DESCRIPTOR_SET, FunctionServer};
use tokio::{net::TcpListener, signal, sync::watch};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{config::Config, runtime::FunctionRuntime};

#[derive(Clone)]
pub struct Service {
    pub config: Config,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub runtime: Arc<FunctionRuntime>,
}

impl Service {
    pub fn new(config: Config, runtime: FunctionRuntime) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            runtime: Arc::new(runtime),
        })
    }

    /// Binds the configured listen address and serves until Ctrl-C, SIGTERM
    /// or `shutdown`.
    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = self.config.server.listen_addr.parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("error binding {addr}"))?;

        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(shutdown_tx).await;
        });

        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FUNCTION_FILE_DESCRIPTOR_SET)
            .build_v1()
            .context("error building reflection service")?;

        let max_message_size = self.config.server.max_message_size;
        let function_service = FunctionServer::from_arc(self.runtime.clone())
            .max_decoding_message_size(max_message_size)
            .max_encoding_message_size(max_message_size);

        let mut shutdown_rx = self.shutdown_rx.clone();
        info!(
            functions = ?self.runtime.function_names(),
            "function runtime listening on {}",
            addr
        );
        let mut server = Server::builder();
        if let Some(limit) = self.config.server.concurrency_limit {
            server = server.concurrency_limit_per_connection(limit);
        }
        server
            .layer(TraceLayer::new_for_grpc())
            .add_service(function_service)
            .add_service(reflection_service)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown_rx.changed().await.ok();
            })
            .await
            .context("function runtime server error")?;

        info!("function runtime stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        // Only fails when every receiver is gone, i.e. nothing is serving.
        let _ = self.shutdown_tx.send(());
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down function runtime gracefully");
}
