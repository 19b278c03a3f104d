//! Branch server entry point
//!
//! Boots one branch node: parses CLI arguments, layers them over the optional
//! configuration file, seeds the default catalogue and runs until ctrl-c.

use clap::Parser;
use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bodega_core::{BranchNode, Configuration};
use bodega_inventory::{InventoryStore, Product};

#[derive(Parser)]
#[command(name = "bodega-server", about = "Distributed branch inventory node")]
struct Cli {
    /// Branch identifier, unique across the cluster
    #[arg(short = 'i', long = "id")]
    id: Option<String>,

    /// Peer listening port
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Peer to dial at startup, `id@host:port`; repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Configuration file
    #[arg(short = 'f', long = "config", default_value = "conf/bodega.yml")]
    config_file: String,

    /// Skip seeding the default catalogue
    #[arg(long = "no-seed", default_value_t = false)]
    no_seed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut builder =
        Config::builder().add_source(config::File::with_name(&args.config_file).required(false));
    if let Some(id) = &args.id {
        builder = builder.set_override("bodega.branch.id", id.clone())?;
    }
    if let Some(port) = args.port {
        builder = builder.set_override("bodega.peer.port", i64::from(port))?;
    }
    if !args.peers.is_empty() {
        builder = builder.set_override("bodega.peer.list", args.peers.join(","))?;
    }

    let configuration = Configuration::from_config(builder.build()?);
    let node = BranchNode::new(&configuration)?;

    if !args.no_seed {
        seed_default_catalogue(node.inventory());
    }

    let addr = node.start().await?;
    info!(
        branch = node.branch_id(),
        peer_addr = %addr,
        gateway_port = configuration.gateway_port(),
        "Branch server running"
    );

    tokio::signal::ctrl_c().await?;
    info!(branch = node.branch_id(), "Shutting down");
    node.stop().await;

    Ok(())
}

/// Default catalogue every branch boots with
fn seed_default_catalogue(store: &InventoryStore) {
    let products = [
        Product::new("P001", "Laptop", "High-performance laptop", 999.99, 10, 3)
            .with_category("Electronics"),
        Product::new("P002", "Mouse", "Wireless mouse", 29.99, 25, 5).with_category("Electronics"),
        Product::new("P003", "Keyboard", "Mechanical keyboard", 79.99, 15, 4)
            .with_category("Electronics"),
        Product::new("P004", "Monitor", "24-inch LED monitor", 199.99, 8, 2)
            .with_category("Electronics"),
        Product::new("P005", "Headphones", "Noise-cancelling headphones", 149.99, 12, 3)
            .with_category("Electronics"),
        Product::new("P006", "Notebook", "A4 spiral notebook", 5.99, 50, 10)
            .with_category("Office"),
        Product::new("P007", "Pen Set", "Blue ink pen set (10 pack)", 12.99, 30, 8)
            .with_category("Office"),
        Product::new("P008", "Stapler", "Heavy-duty stapler", 24.99, 15, 5).with_category("Office"),
    ];

    let count = products.len();
    for product in products {
        store.add(product);
    }
    info!(branch = store.branch_id(), count, "Seeded default catalogue");
}
