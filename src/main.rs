use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};

use pgpulse_agent::config::Config;
use pgpulse_agent::plugins;
use pgpulse_agent::query::PgPool;
use pgpulse_agent::scheduler::Scheduler;
use pgpulse_agent::sink;

#[derive(Parser, Debug)]
#[command(name = "pgpulse-agent", about = "PostgreSQL monitoring agent")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/pgpulse/agent.toml")]
    config: String,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the backend template of all plugins as JSON
    ExportTemplate {
        /// Template name used in trigger expressions
        #[arg(long, default_value = "PostgreSQL")]
        name: String,
    },
    /// Print backend agent parameters pairing each key with its SQL
    ExportParameters {
        /// Agent plugin group to export
        #[arg(long, default_value = "pg")]
        plugin_type: String,
    },
}

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("pgpulse-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Load configuration
    let config = if std::path::Path::new(&cli.config).exists() {
        Config::load(&cli.config)?
    } else if cli.check {
        anyhow::bail!("config file {} not found", cli.config);
    } else {
        Config::default()
    };

    // Initialize logging
    init_logging(&config)?;

    if cli.check {
        let plugins = plugins::create_plugins(&config);
        for plugin in &plugins {
            println!("{}: {:?}", plugin.name(), plugin.state());
        }
        println!("Configuration is valid.");
        return Ok(());
    }

    match cli.command {
        Some(Command::ExportTemplate { name }) => {
            let plugins = plugins::create_plugins(&config);
            let template = plugins::json_template(&name, &plugins);
            println!("{}", serde_json::to_string_pretty(&template)?);
            return Ok(());
        }
        Some(Command::ExportParameters { plugin_type }) => {
            let plugins = plugins::create_plugins(&config);
            for param in plugins::agent_parameters(&plugins, &plugin_type) {
                println!("{}", param);
            }
            return Ok(());
        }
        None => {}
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %config.client_hostname(),
        "Starting pgpulse agent"
    );

    // Run the agent
    if let Err(e) = run(config).await {
        error!(error = %e, "Agent terminated with error");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(&config.agent.log_level)
        });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let query = Arc::new(PgPool::new(&config.postgres));
    let sink = sink::create_sink(&config);
    let plugins = plugins::create_plugins(&config);

    let handles = Scheduler::new(plugins, query, sink.clone()).spawn();
    if handles.is_empty() {
        anyhow::bail!("no plugin is enabled");
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, exiting");

    for handle in handles {
        handle.abort();
    }
    if let Err(e) = sink.close().await {
        error!(sink = sink.name(), error = %e, "Failed to flush pending metrics");
    }
    Ok(())
}
