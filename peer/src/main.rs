use clap::Parser;
use log::{error, info, warn};
use peer::chat::ChatLog;
use peer::config::LobbyConfig;
use peer::identity::generate_identity;
use peer::node::{Node, NodeEvent};
use peer::remote::BrokerTransport;
use shared::{Message, DEFAULT_LOBBY_SIZE, RENDEZVOUS_ID};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker address
    #[arg(short = 'b', long, default_value = "127.0.0.1:9000")]
    broker: String,

    /// Players per lobby, host included
    #[arg(short = 'n', long, default_value_t = DEFAULT_LOBBY_SIZE)]
    lobby_size: usize,

    /// Well-known identity the lobby host claims
    #[arg(long, default_value = RENDEZVOUS_ID)]
    rendezvous_id: String,

    /// Seconds between supervisor health checks
    #[arg(long, default_value = "10")]
    health_interval_secs: u64,

    /// Seconds a sealed host keeps the rendezvous identity
    #[arg(long, default_value = "5")]
    release_grace_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Tip: Set RUST_LOG=info to see lobby progress");
    }

    let args = Args::parse();
    let config = LobbyConfig {
        lobby_size: args.lobby_size,
        health_interval: Duration::from_secs(args.health_interval_secs),
        release_grace: Duration::from_secs(args.release_grace_secs),
        ..LobbyConfig::default()
    }
    .with_rendezvous_id(args.rendezvous_id);

    let identity = generate_identity();
    info!("Starting peer {} against broker {}", identity, args.broker);

    let (transport, transport_events) = BrokerTransport::connect(&args.broker).await?;
    let (node, handle, mut updates) = Node::new(identity, config, transport, transport_events)?;
    let node_task = tokio::spawn(node.run());

    println!("Commands: /peers, /join, /reset, /quit; anything else is chat");

    let mut chat = ChatLog::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match line.trim() {
                        "/quit" => break,
                        "/join" => {
                            handle.request_join();
                        }
                        "/reset" => {
                            handle.reset();
                        }
                        "/peers" => {
                            if let Some(snapshot) = handle.snapshot().await {
                                println!(
                                    "{} [{}] peers: {:?}",
                                    snapshot.peer_id, snapshot.phase, snapshot.roster
                                );
                            }
                        }
                        text => {
                            handle.send_chat(text);
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            },

            update = updates.recv() => {
                match update {
                    Some(NodeEvent::Delivered(message @ Message::Chat { .. })) => {
                        for entry in chat.ingest(&message) {
                            println!("[{}] {}", entry.peer_id, entry.text);
                        }
                    }
                    Some(NodeEvent::Delivered(_)) => {}
                    Some(NodeEvent::Status(text)) => println!("* {}", text),
                    Some(NodeEvent::Roster(roster)) => info!("Lobby members: {:?}", roster),
                    Some(NodeEvent::Fatal(text)) => {
                        error!("{}", text);
                        println!("! {}", text);
                    }
                    None => {
                        warn!("Node stopped");
                        break;
                    }
                }
            },

            _ = tokio::signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    handle.shutdown();
    if let Err(e) = node_task.await {
        error!("Node task failed: {}", e);
    }
    Ok(())
}
