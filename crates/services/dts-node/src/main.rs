use clap::Parser;
use dts_config::{load_node_config, NodeConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use dts_node::run_node;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Distributed task system node", long_about = None)]
struct Cli {
    /// Path to the node configuration file
    #[clap(long, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Executor listen address, e.g. 0.0.0.0:7520
    #[clap(long)]
    listen: Option<String>,

    /// Node identity (defaults to the host name)
    #[clap(long)]
    node_id: Option<String>,

    /// Disable multicast discovery; only direct peers are used
    #[clap(long)]
    no_discovery: bool,

    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> anyhow::Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => load_node_config(path)?,
        None if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() => load_node_config(DEFAULT_CONFIG_PATH)?,
        None => NodeConfig::default(),
    };
    config.apply_env();

    if let Some(listen) = &cli.listen {
        config.node.listen_address = listen.clone();
    }
    if let Some(node_id) = &cli.node_id {
        config.node.node_id = Some(node_id.clone());
    }
    if cli.no_discovery {
        config.discovery.enabled = false;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    if let Err(e) = run_node(config).await {
        tracing::error!("Node service error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
