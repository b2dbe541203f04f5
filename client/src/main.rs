use clap::{Parser, Subcommand};
use log::info;
use masterclient::network::{HostEvent, MasterClient};
use protocol::Reply;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Master server address
    #[arg(short = 's', long, default_value = "127.0.0.1:42068")]
    server: SocketAddr,

    /// Seconds to wait for each answer from the master
    #[arg(short = 't', long, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Print the live server list
    List,
    /// Register as a game host and keep answering pings
    Register {
        /// Game port to register (also the UDP port pings arrive on)
        #[arg(short = 'p', long)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let client = MasterClient::new(args.server, Duration::from_secs(args.timeout));

    match args.command {
        Action::List => {
            for server in client.list().await? {
                println!("{} {}", server.host, server.port);
            }
        }
        Action::Register { port } => {
            let mut host = client.register(port).await?;
            println!("registered on port {}", host.port());
            for mask in host.bans() {
                println!("ban {}", mask);
            }

            loop {
                tokio::select! {
                    event = host.next_event() => match event? {
                        HostEvent::Pinged(from) => info!("Pinged by {}", from),
                        HostEvent::Reply(Reply::AddGban(mask)) => println!("ban {}", mask),
                        HostEvent::Reply(Reply::ClearGbans) => println!("bans cleared"),
                        HostEvent::Reply(reply) => println!("{}", reply),
                        HostEvent::Unknown(line) => info!("Ignoring {:?}", line),
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
