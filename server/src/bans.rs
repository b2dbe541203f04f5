//! Address bans in three independent scopes
//!
//! - `Client` bans refuse TCP connections at accept time
//! - `Server` bans refuse game-server registration and evict registered hosts
//! - `Global` bans are not enforced here; they are broadcast to registered
//!   game servers which enforce them on their own players
//!
//! Entries never merge. The same mask may appear several times and each copy
//! is removed independently.

use protocol::IpMask;
use serde::Deserialize;
use std::fmt;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BanScope {
    Client,
    Server,
    Global,
}

impl fmt::Display for BanScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BanScope::Client => write!(f, "client"),
            BanScope::Server => write!(f, "server"),
            BanScope::Global => write!(f, "global"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    pub scope: BanScope,
    pub mask: IpMask,
    pub reason: Option<String>,
    /// Unix time in seconds after which the ban no longer applies
    pub expiry: Option<u64>,
}

impl BanEntry {
    pub fn new(scope: BanScope, mask: IpMask) -> Self {
        Self {
            scope,
            mask,
            reason: None,
            expiry: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_expiry(mut self, expiry: u64) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn is_expired(&self, now_unix: u64) -> bool {
        self.expiry.is_some_and(|expiry| now_unix >= expiry)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BanList {
    entries: Vec<BanEntry>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: BanEntry) {
        self.entries.push(entry);
    }

    /// Removes the first entry of `scope` with exactly this mask.
    pub fn remove(&mut self, scope: BanScope, mask: IpMask) -> bool {
        match self
            .entries
            .iter()
            .position(|entry| entry.scope == scope && entry.mask == mask)
        {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self, scope: BanScope) {
        self.entries.retain(|entry| entry.scope != scope);
    }

    pub fn matches(&self, scope: BanScope, addr: Ipv4Addr) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.scope == scope && entry.mask.matches(addr))
    }

    pub fn entries(&self, scope: BanScope) -> impl Iterator<Item = &BanEntry> {
        self.entries.iter().filter(move |entry| entry.scope == scope)
    }

    /// Drops every entry whose expiry has passed, returning how many went.
    pub fn purge_expired(&mut self, now_unix: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| !entry.is_expired(now_unix));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
