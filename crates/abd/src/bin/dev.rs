use abd::{InMemoryNetwork, InMemoryTransport, ProcessId, Register, RegisterOptions};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run an in-process ABD register cluster for development", long_about = None)]
struct Args {
    /// Number of replicas to start
    #[arg(short, long, default_value = "5")]
    nodes: u16,

    /// Number of writes issued by replica 1
    #[arg(short, long, default_value = "3")]
    writes: u32,

    /// Replicas to crash before writing (capped to a minority)
    #[arg(short, long, default_value = "0")]
    crash: u16,

    /// Register group name
    #[arg(long, default_value = "abd-dev")]
    group: String,
}

type DevRegister = Register<String, InMemoryTransport<String>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.nodes == 0 {
        return Err("at least one replica is required".into());
    }

    info!("Starting {} replicas in group {}", args.nodes, args.group);
    let network = InMemoryNetwork::new();
    let mut registers: Vec<DevRegister> = Vec::new();
    for node_id in 1..=args.nodes {
        let transport = Arc::new(network.endpoint(ProcessId::from_node_id(node_id)));
        // replica 1 is the single writer
        let options = if node_id == 1 {
            RegisterOptions::writable()
        } else {
            RegisterOptions::read_only()
        };
        registers.push(Register::init(&args.group, transport, options).await?);
    }

    let max_crash = (args.nodes - 1) / 2;
    if args.crash > max_crash {
        warn!(
            "Capping crashes at {} so a majority stays alive",
            max_crash
        );
    }
    let crashed = args.crash.min(max_crash);
    for node_id in (args.nodes - crashed + 1)..=args.nodes {
        network
            .crash(&args.group, ProcessId::from_node_id(node_id))
            .await;
    }
    let live = (args.nodes - crashed) as usize;

    let writer = &registers[0];
    for i in 1..=args.writes {
        let value = format!("value-{}", i);
        let label = writer.write(value.clone()).await?;
        info!("{} wrote {} with label {}", writer.id(), value, label);
    }

    for register in &registers[..live] {
        match register.read_labeled().await {
            Ok((value, label)) => info!(
                "{} read {} (label {})",
                register.id(),
                value.as_deref().unwrap_or("(nil)"),
                label
            ),
            Err(e) => error!("{} failed to read: {}", register.id(), e),
        }
    }

    for register in &registers[..live] {
        let (value, label) = register.snapshot().await;
        info!(
            "{} holds {} (label {})",
            register.id(),
            value.as_deref().unwrap_or("(nil)"),
            label
        );
    }
    if let Some(stats) = network.stats(&args.group).await {
        info!(
            "Network delivered {} messages, dropped {}",
            stats.delivered, stats.dropped
        );
    }

    for register in &registers {
        register.close().await?;
    }
    Ok(())
}
