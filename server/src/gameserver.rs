//! Registered game hosts and their UDP liveness checks
//!
//! A host is added by `regserv` but only shows up in the server list once it
//! has answered a probe. Each entry moves through a small state machine:
//!
//! - unprobed: no ping sent yet, probed on the next check
//! - pinging: probes outstanding, re-sent every `ping_time_ms`, evicted after
//!   `ping_retry` unanswered probes
//! - established: the last pong is not older than the last ping; no further
//!   probes are sent and the entry lives until `keepalive_time_ms` of silence
//!
//! Re-registering the same address and port drops the entry back to
//! unprobed, which is how hosts keep themselves listed.

use crate::bans::{BanList, BanScope};
use crate::config::Limits;
use log::{debug, info};
use protocol::Reply;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

/// Turns a host address into the text shown in the server list.
pub trait AddressResolver: Send {
    fn display_addr(&self, addr: Ipv4Addr) -> Option<String>;
}

/// Shows addresses in dotted-quad form.
#[derive(Debug, Default, Clone, Copy)]
pub struct NumericResolver;

impl AddressResolver for NumericResolver {
    fn display_addr(&self, addr: Ipv4Addr) -> Option<String> {
        Some(addr.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("too many servers on ip")]
    TooManyOnAddress,
    #[error("failed resolving ip")]
    Resolve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// Same address and port were already listed; ping state was reset
    Refreshed,
    /// The global server limit is reached; nothing happened
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    KeepaliveExpired,
    PingRetriesExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingAction {
    Probe(SocketAddrV4),
    Evicted { addr: SocketAddrV4, reason: Eviction },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongOutcome {
    pub addr: SocketAddrV4,
    /// The pong answered a ping newer than any earlier pong
    pub promote: bool,
    /// This was the entry's first pong, so it just became visible
    pub first_pong: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameServerEntry {
    pub addr: SocketAddrV4,
    pub display_addr: String,
    pub numpings: u32,
    pub lastping: Option<u64>,
    pub lastpong: Option<u64>,
}

impl GameServerEntry {
    fn new(addr: SocketAddrV4, display_addr: String) -> Self {
        Self {
            addr,
            display_addr,
            numpings: 0,
            lastping: None,
            lastpong: None,
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Listed entries are the ones that have answered at least once.
    pub fn is_live(&self) -> bool {
        self.lastpong.is_some()
    }

    fn heartbeat_established(&self) -> bool {
        matches!((self.lastping, self.lastpong), (Some(ping), Some(pong)) if ping <= pong)
    }

    fn reset_pings(&mut self) {
        self.lastping = None;
        self.numpings = 0;
    }
}

pub struct GameServerRegistry {
    servers: Vec<GameServerEntry>,
    resolver: Box<dyn AddressResolver>,
}

impl Default for GameServerRegistry {
    fn default() -> Self {
        Self::new(Box::new(NumericResolver))
    }
}

impl GameServerRegistry {
    pub fn new(resolver: Box<dyn AddressResolver>) -> Self {
        Self {
            servers: Vec::new(),
            resolver,
        }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, addr: SocketAddrV4) -> Option<&GameServerEntry> {
        self.servers.iter().find(|server| server.addr == addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GameServerEntry> {
        self.servers.iter()
    }

    /// Registers `ip:port`, or refreshes the entry if it is already known.
    pub fn add(
        &mut self,
        ip: Ipv4Addr,
        port: u16,
        limits: &Limits,
    ) -> Result<Registration, RegisterError> {
        if self.servers.len() >= limits.server_limit {
            return Ok(Registration::Ignored);
        }

        let addr = SocketAddrV4::new(ip, port);
        let mut dups = 0;
        for server in self.servers.iter_mut().filter(|server| server.ip() == ip) {
            dups += 1;
            if server.port() == port {
                server.reset_pings();
                return Ok(Registration::Refreshed);
            }
        }
        if dups >= limits.server_dup_limit {
            return Err(RegisterError::TooManyOnAddress);
        }

        let display_addr = self
            .resolver
            .display_addr(ip)
            .ok_or(RegisterError::Resolve)?;
        info!("Game server {} registered", addr);
        self.servers.push(GameServerEntry::new(addr, display_addr));
        Ok(Registration::Added)
    }

    /// Runs one round of the ping cycle.
    ///
    /// Returns the probes to send and the entries that were dropped, in
    /// registration order.
    pub fn check(&mut self, now: u64, limits: &Limits) -> Vec<PingAction> {
        let mut actions = Vec::new();
        let mut i = 0;
        while i < self.servers.len() {
            let server = &mut self.servers[i];

            if server.heartbeat_established() {
                let silence = now.saturating_sub(server.lastpong.unwrap_or(now));
                if silence > limits.keepalive_time_ms {
                    debug!("Game server {} keepalive expired", server.addr);
                    actions.push(PingAction::Evicted {
                        addr: server.addr,
                        reason: Eviction::KeepaliveExpired,
                    });
                    self.servers.remove(i);
                    continue;
                }
            } else if server
                .lastping
                .map_or(true, |ping| now.saturating_sub(ping) > limits.ping_time_ms)
            {
                if server.numpings >= limits.ping_retry {
                    info!("Game server {} did not answer pings", server.addr);
                    actions.push(PingAction::Evicted {
                        addr: server.addr,
                        reason: Eviction::PingRetriesExhausted,
                    });
                    self.servers.remove(i);
                    continue;
                }
                server.numpings += 1;
                server.lastping = Some(now);
                actions.push(PingAction::Probe(server.addr));
            }
            i += 1;
        }
        actions
    }

    /// Records a datagram received from `from`. Returns `None` when no entry
    /// has that address and port.
    pub fn record_pong(&mut self, from: SocketAddrV4, now: u64) -> Option<PongOutcome> {
        let server = self.servers.iter_mut().find(|server| server.addr == from)?;

        let promote = match (server.lastping, server.lastpong) {
            (Some(_), None) => true,
            (Some(ping), Some(pong)) => ping > pong,
            (None, _) => false,
        };
        let first_pong = server.lastpong.is_none();
        server.lastpong = Some(now);

        Some(PongOutcome {
            addr: from,
            promote,
            first_pong,
        })
    }

    /// Drops every entry whose address matches a server-scope ban.
    pub fn ban_sweep(&mut self, bans: &BanList) -> Vec<SocketAddrV4> {
        let mut removed = Vec::new();
        for i in (0..self.servers.len()).rev() {
            if bans.matches(BanScope::Server, self.servers[i].ip()) {
                let server = self.servers.remove(i);
                info!("Game server {} removed by ban", server.addr);
                removed.push(server.addr);
            }
        }
        removed
    }

    /// Serializes every live entry as `addserver` lines.
    pub fn render_list(&self) -> Vec<u8> {
        let mut out = String::new();
        for server in self.servers.iter().filter(|server| server.is_live()) {
            out.push_str(
                &Reply::AddServer {
                    ip: server.display_addr.clone(),
                    port: server.port(),
                }
                .line(),
            );
        }
        out.into_bytes()
    }
}
