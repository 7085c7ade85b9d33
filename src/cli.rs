//! Command line entry point.
//!
//! ```bash
//! hostlink serve                                   # relay server with a simulated host
//! hostlink call create_object --params '{"object_type":"MESH"}'
//! hostlink tools --category object                 # print tool schema records
//! ```

use crate::client::HostClient;
use crate::config::{self, Config};
use crate::ipc::{self, HostExecutor, IpcBridge};
use crate::server::{RelayContext, RelayServer};
use crate::tool::{catalog, ToolRegistry};
use crate::transport::TcpConnector;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "hostlink", author, version, about)]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay server with an in-process host executor
    Serve(ServeArgs),

    /// Send one tool call to a running relay server
    Call(CallArgs),

    /// Print tool schema records
    Tools(ToolsArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Override the configured port
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Args)]
struct CallArgs {
    /// Tool name
    tool: String,

    /// Parameters as a JSON object
    #[arg(short, long, default_value = "{}")]
    params: String,
}

#[derive(Debug, Args)]
struct ToolsArgs {
    /// Only tools in this category
    #[arg(short, long)]
    category: Option<String>,

    /// Ask the running server instead of the local catalog
    #[arg(long)]
    remote: bool,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let _log_guard = crate::logging::init(&config)?;

    match cli.command {
        Command::Serve(args) => serve(config, args).await,
        Command::Call(args) => call(config, args).await,
        Command::Tools(args) => tools(config, args).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let Some(path) = path else {
        return config::load_or_create_config();
    };
    let mut config = config::load_from_path(path)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn registry_for(config: &Config) -> Result<Arc<ToolRegistry>> {
    let registry = ToolRegistry::with_overlay(config.tools.clone());
    catalog::register_simulated_host(&registry).context("failed to register built-in tools")?;
    Ok(Arc::new(registry))
}

async fn serve(mut config: Config, args: ServeArgs) -> Result<()> {
    if let Some(port) = args.port {
        config.port = port;
    }

    let registry = registry_for(&config)?;
    let (server_end, host_end) = ipc::memory_pair();
    let mut executor =
        HostExecutor::spawn(host_end, registry.clone()).context("failed to start host executor")?;
    let bridge = IpcBridge::start(server_end, config.request_timeout())
        .context("failed to start ipc bridge")?;

    let context = RelayContext::new(registry, bridge.clone(), config.api_version.clone());
    let server = RelayServer::bind(&config.endpoint(), context).await?;
    println!("hostlink relay listening on {}", server.local_addr()?);

    server
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received shutdown signal");
        })
        .await?;

    bridge.shutdown();
    executor.stop();
    Ok(())
}

async fn call(config: Config, args: CallArgs) -> Result<()> {
    let params: serde_json::Value =
        serde_json::from_str(&args.params).context("--params must be valid JSON")?;

    let registry = registry_for(&config)?;
    let connector = Arc::new(TcpConnector::new(config.host.clone(), config.port));
    let client = HostClient::connect(&config, registry, connector)
        .await
        .with_context(|| format!("failed to connect to {}", config.endpoint()))?;

    let result = client.execute(&args.tool, params).await;
    client.shutdown().await?;

    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn tools(config: Config, args: ToolsArgs) -> Result<()> {
    let records = if args.remote {
        let connector = Arc::new(TcpConnector::new(config.host.clone(), config.port));
        let client = HostClient::connect(&config, registry_for(&config)?, connector).await?;
        let records = client.list_remote_tools().await;
        client.shutdown().await?;
        records?
    } else {
        registry_for(&config)?.schema_records()
    };

    let records: Vec<_> = records
        .into_iter()
        .filter(|r| args.category.as_deref().map_or(true, |c| r.category == c))
        .collect();

    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
