//! Conduit CLI — talk to MCP servers and broker-backed workers.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use conduit_broker::{AmqpBroker, BrokerRpc, QueueTransport};
use conduit_config::{CliOverrides, ConduitConfig};
use conduit_mcp::{McpClient, McpToolContent, McpToolResult};
use conduit_types::{ClientCapabilities, Implementation};
use serde_json::Value;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "conduit",
    version,
    about = "Call MCP servers over stdio or workers over a message broker"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// AMQP URI of the broker (overrides CONDUIT_BROKER_URI)
    #[arg(long, global = true)]
    broker_uri: Option<String>,

    /// How long to wait for a broker reply, in milliseconds
    #[arg(long, global = true)]
    reply_timeout_ms: Option<u64>,

    /// Directory holding config.toml (overrides CONDUIT_CONFIG_DIR)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Call a tool on an MCP server
    Call {
        /// Server name from the [servers] table, or a queue with --via-broker
        server: String,
        /// Tool to call
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Reach the server through a broker queue instead of a subprocess
        #[arg(long)]
        via_broker: bool,
    },
    /// List the tools an MCP server exposes
    Tools {
        /// Server name from the [servers] table
        server: String,
    },
    /// Check an MCP server is responsive
    Ping {
        /// Server name from the [servers] table
        server: String,
    },
    /// Send a JSON request to a queue and print the worker's reply
    Send {
        /// Queue to publish to
        queue: String,
        /// Request body as JSON
        body: String,
    },
    /// Enqueue a long-running task without waiting for it
    Enqueue {
        /// Task type understood by the worker
        task_type: String,
        /// Task payload as JSON
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = ConduitConfig::load(CliOverrides {
        broker_uri: cli.broker_uri,
        reply_timeout_ms: cli.reply_timeout_ms,
        config_dir: cli.config_dir,
    })
    .context("Failed to load configuration")?;

    match cli.command {
        Command::Call {
            server,
            tool,
            args,
            via_broker,
        } => {
            let arguments = parse_json("--args", &args)?;
            if !arguments.is_object() {
                bail!("--args must be a JSON object");
            }
            let client = if via_broker {
                queue_client(&config, &server).await?
            } else {
                child_client(&config, &server).await?
            };
            let outcome = client.call_tool(&tool, arguments).await;
            shutdown(&client).await;
            let result = outcome.with_context(|| format!("Tool '{tool}' failed on '{server}'"))?;
            print_tool_result(&result);
            if result.is_error {
                std::process::exit(1);
            }
        }
        Command::Tools { server } => {
            let client = child_client(&config, &server).await?;
            let outcome = client.list_tools().await;
            shutdown(&client).await;
            for tool in outcome.context("Failed to list tools")? {
                if tool.description.is_empty() {
                    println!("{}", tool.name);
                } else {
                    println!("{}\t{}", tool.name, tool.description);
                }
            }
        }
        Command::Ping { server } => {
            let client = child_client(&config, &server).await?;
            let outcome = client.ping().await;
            shutdown(&client).await;
            outcome.with_context(|| format!("Server '{server}' did not answer ping"))?;
            println!("pong");
        }
        Command::Send { queue, body } => {
            let request = parse_json("body", &body)?;
            let rpc = broker_rpc(&config).await?;
            let outcome = rpc.send_to_queue::<Value, Value>(&queue, &request).await;
            close_broker(&rpc).await;
            let reply = outcome.with_context(|| format!("No usable reply from '{queue}'"))?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Command::Enqueue { task_type, payload } => {
            let payload = parse_json("payload", &payload)?;
            let rpc = broker_rpc(&config).await?;
            let outcome = rpc.enqueue_long_running_task(&task_type, payload).await;
            close_broker(&rpc).await;
            outcome.context("Failed to enqueue task")?;
            eprintln!("Enqueued '{task_type}' on {}", config.broker.task_queue);
        }
    }

    Ok(())
}

fn parse_json(what: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{what} is not valid JSON"))
}

async fn child_client(config: &ConduitConfig, server: &str) -> Result<McpClient> {
    let server_config = config.server(server)?.clone();
    McpClient::connect_child(server, server_config)
        .await
        .with_context(|| format!("Failed to start MCP server '{server}'"))
}

async fn queue_client(config: &ConduitConfig, queue: &str) -> Result<McpClient> {
    let rpc = Arc::new(broker_rpc(config).await?);
    let client = McpClient::new(queue, Arc::new(QueueTransport::new(rpc, queue)));
    let client_info = Implementation::new("conduit", env!("CARGO_PKG_VERSION"));
    if let Err(e) = client
        .initialize(client_info, ClientCapabilities::default())
        .await
    {
        shutdown(&client).await;
        return Err(e).with_context(|| format!("Handshake over queue '{queue}' failed"));
    }
    Ok(client)
}

async fn broker_rpc(config: &ConduitConfig) -> Result<BrokerRpc> {
    let broker = AmqpBroker::connect(&config.broker.uri)
        .await
        .with_context(|| format!("Failed to connect to broker at {}", config.broker.uri))?;
    Ok(BrokerRpc::new(Arc::new(broker), &config.broker))
}

async fn shutdown(client: &McpClient) {
    if let Err(e) = client.shutdown().await {
        tracing::debug!("Shutting down '{}' failed: {e}", client.server_name());
    }
}

async fn close_broker(rpc: &BrokerRpc) {
    if let Err(e) = rpc.close().await {
        tracing::debug!("Closing broker connection failed: {e}");
    }
}

fn print_tool_result(result: &McpToolResult) {
    for item in &result.content {
        match item {
            McpToolContent::Text { text } => println!("{text}"),
            McpToolContent::Image { mime_type, data } => {
                println!("[image {mime_type}, {} base64 bytes]", data.len())
            }
            McpToolContent::Resource { resource } => println!("{resource}"),
            McpToolContent::Unsupported => println!("[unsupported content]"),
        }
    }
}
