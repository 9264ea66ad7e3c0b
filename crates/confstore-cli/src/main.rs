use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use confstore_backends::{new_client, StoreClient};
use confstore_common::{BackendConfig, BackendKind, Config};

#[derive(Parser)]
#[command(name = "confstore")]
#[command(about = "Query and watch configuration backends", long_about = None)]
struct Cli {
    /// Backend kind: etcd, env or file
    #[arg(short, long)]
    backend: Option<String>,

    /// Backend node address; repeat for clusters. The file backend takes
    /// the document path here.
    #[arg(short, long = "node")]
    nodes: Vec<String>,

    /// Client TLS certificate (etcd)
    #[arg(long)]
    client_cert: Option<PathBuf>,

    /// Client TLS key (etcd)
    #[arg(long)]
    client_key: Option<PathBuf>,

    /// CA bundle for server verification (etcd)
    #[arg(long)]
    client_ca_keys: Option<PathBuf>,

    /// Optional TOML config file; command-line flags override it
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch current values for keys or prefixes
    Get {
        /// Keys or key prefixes to resolve
        keys: Vec<String>,
    },
    /// Block on changes under a prefix and re-print values on each one
    Watch {
        /// Prefix to watch
        prefix: String,
        /// Keys to re-read after each change (defaults to the prefix)
        #[arg(long = "key")]
        keys: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let client = new_client(&config).await?;

    match cli.command {
        Commands::Get { keys } => {
            let values = client.get_values(&keys).await?;
            print_values(&values);
        }
        Commands::Watch { prefix, keys } => {
            let keys = if keys.is_empty() {
                vec![prefix.clone()]
            } else {
                keys
            };
            watch_loop(client, prefix, keys).await?;
        }
    }
    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<BackendConfig> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)?.store,
        None => BackendConfig::default(),
    };
    if let Some(backend) = &cli.backend {
        config.backend = backend.parse::<BackendKind>()?;
    }
    if !cli.nodes.is_empty() {
        config.nodes = cli.nodes.clone();
    }
    if cli.client_cert.is_some() {
        config.client_cert = cli.client_cert.clone();
    }
    if cli.client_key.is_some() {
        config.client_key = cli.client_key.clone();
    }
    if cli.client_ca_keys.is_some() {
        config.client_ca_keys = cli.client_ca_keys.clone();
    }
    Ok(config)
}

/// The reactive loop: snapshot, then block on the next change and
/// re-read, until ctrl-c.
async fn watch_loop(
    client: Arc<dyn StoreClient>,
    prefix: String,
    keys: Vec<String>,
) -> Result<()> {
    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
                stop.cancel();
            }
        });
    }

    let values = client.get_values(&keys).await?;
    print_values(&values);

    let mut index = 0u64;
    loop {
        index = client.watch_prefix(&prefix, index, &stop).await?;
        if stop.is_cancelled() {
            return Ok(());
        }
        info!("change detected under {prefix} at index {index}");
        match client.get_values(&keys).await {
            Ok(values) => print_values(&values),
            Err(err) => error!("re-read after change failed: {err}"),
        }
    }
}

fn print_values(values: &std::collections::HashMap<String, String>) {
    // Sorted output so repeated runs are comparable.
    let sorted: BTreeMap<_, _> = values.iter().collect();
    for (key, value) in sorted {
        println!("{key} = {value}");
    }
}
