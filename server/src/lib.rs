//! # Master Server Library
//!
//! This library implements a master server for a multiplayer game: the
//! well-known rendezvous point that game hosts register with and that players
//! query for the list of live hosts. It also distributes an operator-managed
//! ban list to registered hosts and brokers a challenge/response login.
//!
//! ## Core Responsibilities
//!
//! ### Registration and Liveness
//! A game host opens a TCP session and sends `regserv <port>`. The master
//! does not trust the claim: it probes `host:port` over UDP and only lists
//! the host once it answers. Unanswered probes are retried a fixed number of
//! times before the entry is dropped and the owner is told why.
//!
//! ### Server List Queries
//! A player sends `list` and receives one `addserver` line per live host,
//! after which the connection is closed. Every concurrent query shares one
//! immutable snapshot of the list; a new snapshot is built only after the
//! set of live hosts has changed.
//!
//! ### Bans
//! Bans come in three scopes. Client bans refuse connections, server bans
//! refuse and evict game hosts, and global bans are pushed to every
//! registered host as `cleargbans`/`addgban` lines.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! One task owns every socket and all state. Each tick waits (at most one
//! second) for any socket to become ready, then services sessions, answers
//! pongs and runs the ping cycle. There are no locks and no channels.
//!
//! ### Sans-IO Core
//! [`master::Master`] holds all state and is driven with explicit readiness
//! and timestamps, so the whole protocol is tested with in-memory sockets.
//! [`network::Server`] is the thin tokio layer that feeds it.
//!
//! ## Module Organization
//!
//! - `auth`: outstanding login challenges per session
//! - `bans`: scoped address bans with optional expiry
//! - `broadcast`: reference-counted list snapshots shared by sessions
//! - `client_manager`: connection admission and the session table
//! - `config`: TOML configuration and limits
//! - `gameserver`: registered hosts and their ping state machine
//! - `master`: the state and per-tick logic
//! - `network`: sockets, readiness and the tick loop
//! - `session`: one TCP connection's buffers
//! - `utils`: clock helpers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use master::network::Server;
//! use std::net::{Ipv4Addr, SocketAddrV4};
//! use std::path::PathBuf;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, protocol::DEFAULT_PORT);
//!     let mut server = Server::bind(addr, PathBuf::from("master.toml")).await?;
//!
//!     // Runs forever: accepts sessions, answers commands, pings hosts.
//!     server.run().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod bans;
pub mod broadcast;
pub mod client_manager;
pub mod config;
pub mod gameserver;
pub mod master;
pub mod network;
pub mod session;
pub mod utils;
