//! Integration tests for the master server and its client
//!
//! These tests run a real server on loopback and talk to it over TCP and UDP.

use master::config::{Limits, MasterConfig};
use master::master::Master;
use master::network::Server;
use masterclient::network::{ClientError, MasterClient, ServerEntry};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

/// Binds a server on a free loopback port and runs it in the background
async fn start(master: Master<TcpStream>) -> SocketAddr {
    let mut server = Server::with_master(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), master)
        .await
        .expect("Failed to bind master server");
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });
    addr
}

fn master_with(limits: Limits) -> Master<TcpStream> {
    Master::new(limits)
}

fn master_from(config: &str) -> Master<TcpStream> {
    let config = MasterConfig::from_toml(config).unwrap();
    Master::from_config(&config, 0).unwrap()
}

/// Reads until the server closes the connection
async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match timeout(WAIT, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return received,
            Ok(Ok(n)) => received.extend_from_slice(&buf[..n]),
            Err(_) => panic!("server did not close the connection"),
        }
    }
}

/// REGISTRATION AND LISTING
mod registration_tests {
    use super::*;

    /// A host that answers pings shows up in the list
    #[tokio::test]
    async fn register_ping_and_list() {
        let addr = start(master_from("")).await;
        let client = MasterClient::new(addr, WAIT);

        let host = client.register(0).await.expect("registration failed");
        assert!(host.bans().is_empty());

        let servers = client.list().await.unwrap();
        assert_eq!(
            servers,
            vec![ServerEntry {
                host: "127.0.0.1".to_string(),
                port: host.port()
            }]
        );
    }

    /// Listing before any host went live returns nothing
    #[tokio::test]
    async fn list_with_no_servers_is_empty() {
        let addr = start(master_with(Limits::default())).await;
        let client = MasterClient::new(addr, WAIT);
        assert!(client.list().await.unwrap().is_empty());
    }

    /// A second host on the same address is refused past the per-address cap
    #[tokio::test]
    async fn too_many_servers_on_ip() {
        let addr = start(master_with(Limits {
            server_dup_limit: 1,
            ..Limits::default()
        }))
        .await;
        let client = MasterClient::new(addr, WAIT);

        let _first = client.register(0).await.unwrap();
        match client.register(0).await {
            Err(ClientError::Rejected(reason)) => assert_eq!(reason, "too many servers on ip"),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("second registration should be refused"),
        }
    }

    /// Global bans are pushed to a registering host
    #[tokio::test]
    async fn registered_host_receives_global_bans() {
        let addr = start(master_from(
            "[[ban]]\nscope = \"global\"\nmask = \"192.168.0.0/16\"\n",
        ))
        .await;
        let client = MasterClient::new(addr, WAIT);

        let mut host = client.register(0).await.unwrap();
        while host.bans().is_empty() {
            timeout(WAIT, host.next_event()).await.unwrap().unwrap();
        }
        assert_eq!(host.bans(), &["192.168.0.0/16".parse::<protocol::IpMask>().unwrap()]);
    }
}

/// PROTOCOL ENFORCEMENT
mod enforcement_tests {
    use super::*;

    /// Client-scope bans drop the connection at accept time
    #[tokio::test]
    async fn banned_client_is_refused() {
        let addr = start(master_from(
            "[[ban]]\nscope = \"client\"\nmask = \"127.0.0.0/8\"\n",
        ))
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _ = stream.write_all(b"list\n").await;
        assert!(read_to_close(&mut stream).await.is_empty());
    }

    /// A line longer than the input limit closes the session
    #[tokio::test]
    async fn oversized_line_closes_session() {
        let addr = start(master_with(Limits {
            input_limit: 64,
            ..Limits::default()
        }))
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[b'x'; 100]).await.unwrap();
        assert!(read_to_close(&mut stream).await.is_empty());
    }

    /// Out of range ports get a failreg and the session stays open
    #[tokio::test]
    async fn invalid_port_is_reported() {
        let addr = start(master_with(Limits::default())).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"regserv 70000\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = timeout(WAIT, stream.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"failreg invalid port\n");
    }

    /// Unknown commands are ignored
    #[tokio::test]
    async fn unknown_command_is_ignored() {
        let addr = start(master_with(Limits::default())).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"hello master\nregserv 70000\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = timeout(WAIT, stream.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"failreg invalid port\n");
    }
}
