use broker::network::Broker;
use clap::Parser;
use log::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Broker port to listen on
    #[arg(short, long, default_value = "9000")]
    port: u16,

    /// Maximum number of connected peers
    #[arg(short, long, default_value = "256")]
    max_sessions: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Tip: Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    info!("Starting broker on {}", address);
    info!("Max sessions: {}", args.max_sessions);

    let broker = Broker::bind(&address, args.max_sessions).await?;
    let handle = broker.handle();

    tokio::select! {
        result = broker.run() => {
            if let Err(e) = result {
                error!("Broker stopped with error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            handle.shutdown();
        }
    }

    Ok(())
}
