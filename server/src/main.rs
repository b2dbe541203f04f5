use clap::Parser;
use log::{error, info};
use master::network::Server;
use std::fs::OpenOptions;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Directory holding master.toml and master.log
    #[clap(long, default_value = ".")]
    dir: PathBuf,
    /// Port for both the TCP listener and the UDP ping socket
    #[clap(short, long, default_value_t = protocol::DEFAULT_PORT)]
    port: u16,
    /// IPv4 address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: Ipv4Addr,
}

/// Sends log output to `<dir>/master.log`, or stdout if it cannot be opened.
fn init_logging(dir: &Path) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    let path = dir.join("master.log");
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        Err(e) => {
            eprintln!("Cannot open {}: {}, logging to stdout", path.display(), e);
            builder.target(env_logger::Target::Stdout);
        }
    }
    builder.init();
}

/// Parses arguments, binds the sockets and runs the master until Ctrl+C.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(&args.dir);

    let addr = SocketAddrV4::new(args.host, args.port);
    let mut server = match Server::bind(addr, args.dir.join("master.toml")).await {
        Ok(server) => server,
        Err(e) => {
            error!("Startup failed: {}", e);
            return Err(e.into());
        }
    };

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
