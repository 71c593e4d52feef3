use std::path::PathBuf;

use ::tracing::{error, info, info_span};
use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use homo_function::{
    client::FunctionClient,
    config::Config,
    message::{new_invocation, Qos},
    metrics::init_provider,
    runtime::{EchoHandler, FunctionRuntime},
    service::Service,
    tracing::setup_tracing,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "homo-function")]
#[command(version, about = "Runtime and client for the homo.Function service", long_about = None)]
struct Cli {
    #[arg(
        global = true,
        short,
        long,
        value_name = "FILE",
        help = "Path to config file"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Serve the function runtime, echoing every call")]
    Serve,
    #[command(about = "Invoke a function once and print the response")]
    Call {
        #[arg(long, short = 'f')]
        function: String,

        #[arg(long, default_value = "")]
        topic: String,

        #[arg(long, default_value_t = 0, help = "0, 1 or 2")]
        qos: u32,

        #[arg(long, default_value = "")]
        payload: String,

        #[arg(long, help = "Overrides client.address from the config")]
        address: Option<String>,
    },
    #[command(about = "Write the default config to a file")]
    InitConfig { config_path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_path(&path.to_string_lossy())
            .with_context(|| format!("error loading config from {}", path.display()))?,
        None => Config::from_env()?,
    };

    let tracer_provider = setup_tracing(&config)?;

    let root_span = info_span!(
        "homo-function",
        env = config.env,
        "homo-instance" = config.instance_id()
    );
    let _guard = root_span.enter();

    let result = run(cli.command, config).await;
    if let Err(err) = &result {
        error!("{:?}", err);
    }

    // export traces before shutdown
    if let Some(tracer_provider) = tracer_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }
    result
}

async fn run(command: Commands, mut config: Config) -> Result<()> {
    match command {
        Commands::Serve => {
            info!(version = VERSION, "starting function runtime");
            let meter_provider = init_provider(&config.telemetry, &config.instance_id(), VERSION)?;
            let runtime = FunctionRuntime::new(&config.server).with_fallback(EchoHandler);
            let service = Service::new(config, runtime)?;
            service.start().await?;
            if let Some(meter_provider) = meter_provider {
                if let Err(err) = meter_provider.shutdown() {
                    error!("Error shutting down meter provider: {:?}", err);
                }
            }
        }
        Commands::Call {
            function,
            topic,
            qos,
            payload,
            address,
        } => {
            if let Some(address) = address {
                config.client.address = address;
            }
            let qos = Qos::try_from(qos).map_err(|qos| anyhow::anyhow!("invalid qos {qos}"))?;
            let client = FunctionClient::new(&config.client)?;
            let request = new_invocation(function, topic, qos, Bytes::from(payload));
            let response = client.call(request).await?;
            println!("id: {}", response.id);
            println!("qos: {}", response.qos);
            println!("topic: {}", response.topic);
            println!("timestamp: {}", response.timestamp);
            println!("function_name: {}", response.function_name);
            println!("function_invoke_id: {}", response.function_invoke_id);
            println!("payload: {}", String::from_utf8_lossy(&response.payload));
        }
        Commands::InitConfig { config_path } => {
            println!("Initializing config file at: {config_path}");
            Config::generate(&config_path)?;
        }
    }
    Ok(())
}
