//! Connection admission and the table of live sessions
//!
//! This module owns every accepted TCP session and decides who gets in:
//! - Global capacity (`client_limit`) refuses new connections outright
//! - Client-scope bans refuse connections from matching addresses
//! - Per-address duplicates (`dup_limit`) evict that address's oldest
//!   session to make room for the newcomer
//!
//! Sessions are kept in admission order and addressed by index while the
//! master walks them, so removing one mid-walk never skips its neighbour.

use crate::bans::{BanList, BanScope};
use crate::config::Limits;
use crate::session::{ClientSession, SessionId, SessionSocket};
use log::info;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

/// Why a connection was turned away at accept time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Refusal {
    #[error("client limit reached")]
    Full,
    #[error("address is banned")]
    Banned,
}

/// A successful admission
pub struct Admitted<S> {
    pub id: SessionId,
    /// Oldest session from the same address, dropped to honour `dup_limit`
    pub evicted: Option<ClientSession<S>>,
}

/// What the event loop should wait on for one session
#[derive(Debug, Clone, Copy)]
pub struct Interest<'a, S> {
    pub id: SessionId,
    pub socket: &'a S,
    /// Wait for writability instead of readability
    pub write: bool,
}

/// Owns all live sessions and hands out session ids
///
/// Ids start from 1 and are never reused, so stale readiness reports for
/// a destroyed session can never hit its successor.
pub struct ConnectionRegistry<S> {
    sessions: Vec<ClientSession<S>>,
    next_session_id: SessionId,
}

impl<S> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: Vec::new(),
            next_session_id: 1,
        }
    }
}

impl<S: SessionSocket> ConnectionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to admit a freshly accepted connection
    ///
    /// On refusal the socket is dropped, which closes it. When the address
    /// already holds `dup_limit` sessions the oldest one (by connect time)
    /// is removed and handed back so the caller can release what it held.
    pub fn admit(
        &mut self,
        socket: S,
        addr: SocketAddrV4,
        now: u64,
        limits: &Limits,
        bans: &BanList,
    ) -> Result<Admitted<S>, Refusal> {
        if self.sessions.len() >= limits.client_limit {
            info!("Refusing {}: client limit reached", addr);
            return Err(Refusal::Full);
        }
        if bans.matches(BanScope::Client, *addr.ip()) {
            info!("Refusing {}: address is banned", addr);
            return Err(Refusal::Banned);
        }

        let evicted = if self.count_from(*addr.ip()) >= limits.dup_limit {
            self.oldest_from(*addr.ip()).map(|index| {
                let session = self.sessions.remove(index);
                info!(
                    "Session {} from {} evicted by a newer connection",
                    session.id, session.addr
                );
                session
            })
        } else {
            None
        };

        let id = self.next_session_id;
        self.next_session_id += 1;
        self.sessions.push(ClientSession::new(id, addr, socket, now));
        info!("Session {} connected from {}", id, addr);

        Ok(Admitted { id, evicted })
    }

    /// Removes the session at `index`, preserving the order of the rest
    pub fn destroy(&mut self, index: usize) -> Option<ClientSession<S>> {
        (index < self.sessions.len()).then(|| self.sessions.remove(index))
    }

    pub fn get(&self, index: usize) -> Option<&ClientSession<S>> {
        self.sessions.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ClientSession<S>> {
        self.sessions.get_mut(index)
    }

    /// Finds the current index of a session id
    pub fn position(&self, id: SessionId) -> Option<usize> {
        self.sessions.iter().position(|session| session.id == id)
    }

    /// Finds the session that declared the game server at `addr`
    pub fn find_server_owner(&self, addr: SocketAddrV4) -> Option<usize> {
        self.sessions
            .iter()
            .position(|session| session.owns_server(addr))
    }

    pub fn count_from(&self, ip: Ipv4Addr) -> usize {
        self.sessions
            .iter()
            .filter(|session| session.ip() == ip)
            .count()
    }

    /// Index of the longest-connected session from `ip`
    pub fn oldest_from(&self, ip: Ipv4Addr) -> Option<usize> {
        self.sessions
            .iter()
            .enumerate()
            .filter(|(_, session)| session.ip() == ip)
            .min_by_key(|(_, session)| session.connect_time)
            .map(|(index, _)| index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSession<S>> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientSession<S>> {
        self.sessions.iter_mut()
    }

    /// What each session is waiting for: sessions with anything to send
    /// wait for writability, everyone else for readability
    pub fn interest(&self) -> impl Iterator<Item = Interest<'_, S>> {
        self.sessions.iter().map(|session| Interest {
            id: session.id,
            socket: session.socket(),
            write: session.has_pending_output(),
        })
    }

    /// Returns the number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no sessions are live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
