//! famez-client: a headless native peer for the FAME-Z fabric.
//!
//! Connects, completes the handshake, answers fabric traffic (ping,
//! CTL-Write, Peer-Attribute probes), and logs everything it sees until
//! the broker goes away. Interactive commanding belongs to a wrapper;
//! this binary is the protocol engine.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use famez_client::{ClientError, FabricClient, FabricEvent};

#[derive(Parser, Debug)]
#[command(name = "famez-client")]
#[command(about = "Native FAME-Z fabric client")]
struct Args {
    /// Absolute path to the broker's UNIX domain socket
    #[arg(long, short = 'S', default_value = "/tmp/famez_socket")]
    socketpath: PathBuf,

    /// Specify multiple times to increase verbosity
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    let default = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create runtime");
    let local = tokio::task::LocalSet::new();
    if let Err(e) = local.block_on(&rt, run(&args)) {
        eprintln!("famez-client: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: &Args) -> Result<(), ClientError> {
    let (client, mut events) = FabricClient::connect(&args.socketpath).await?;
    tracing::info!(
        socketpath = %args.socketpath.display(),
        my_id = client.my_id(),
        "connected"
    );

    while let Some(event) = events.recv().await {
        match event {
            FabricEvent::Ready { my_id, server_id } => {
                tracing::info!(my_id, server_id, "ready player one");
            }
            FabricEvent::Message {
                from,
                nodename,
                payload,
                ..
            } => {
                tracing::info!("\"{}\" ({}) sends \"{}\"", nodename, from, payload);
            }
            FabricEvent::PeerGone(id) => {
                tracing::info!(id, "peer departed");
            }
            FabricEvent::Disconnected => {
                tracing::info!("broker gone; exiting");
                break;
            }
        }
    }
    Ok(())
}
