//! # Master Server Client Library
//!
//! Client side of the master server protocol, used both by the
//! `masterclient` command line tool and by the workspace integration tests.
//!
//! ## Operations
//!
//! ### Listing
//! [`network::MasterClient::list`] connects, sends `list` and collects the
//! `addserver` lines until the master closes the connection.
//!
//! ### Registering
//! [`network::MasterClient::register`] plays a game host: it binds a UDP
//! socket on the game port, sends `regserv <port>` over TCP and echoes every
//! probe the master sends until `succreg` (or `failreg`) arrives. The
//! returned [`network::GameHost`] keeps answering probes and tracks the
//! global ban list the master pushes.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use masterclient::network::MasterClient;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = MasterClient::new("127.0.0.1:42068".parse()?, Duration::from_secs(5));
//!     for server in client.list().await? {
//!         println!("{}:{}", server.host, server.port);
//!     }
//!     Ok(())
//! }
//! ```

pub mod network;
