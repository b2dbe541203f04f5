//! The master's whole state and the work done on every tick
//!
//! [`Master`] never touches the clock or the operating system. The network
//! layer feeds it accepted sockets, readiness reports, UDP pongs and the
//! current time in milliseconds, and sends the probes it asks for. That
//! keeps every rule about sessions, registrations and bans testable with
//! in-memory sockets.
//!
//! Sessions are walked by index. A session torn down during the walk is
//! removed in place and the walk continues at the same index, so no other
//! session is skipped or serviced twice.

use crate::auth::{Authenticator, UserTable};
use crate::bans::{BanList, BanScope};
use crate::broadcast::{Broadcasts, ListKind, Subscription};
use crate::client_manager::{ConnectionRegistry, Interest, Refusal};
use crate::config::{ConfigError, Limits, MasterConfig};
use crate::gameserver::{AddressResolver, Eviction, GameServerRegistry, PingAction, Registration};
use crate::session::{Flush, Received, SessionId, SessionSocket};
use log::{debug, info};
use protocol::{Command, Reply};
use std::collections::HashSet;
use std::io;
use std::net::SocketAddrV4;
use thiserror::Error;

/// Sessions whose sockets became ready since the last tick
#[derive(Debug, Clone, Default)]
pub struct Readiness {
    readable: HashSet<SessionId>,
    writable: HashSet<SessionId>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_readable(&mut self, id: SessionId) {
        self.readable.insert(id);
    }

    pub fn mark_writable(&mut self, id: SessionId) {
        self.writable.insert(id);
    }

    pub fn is_readable(&self, id: SessionId) -> bool {
        self.readable.contains(&id)
    }

    pub fn is_writable(&self, id: SessionId) -> bool {
        self.writable.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty()
    }
}

/// Why a session was closed
#[derive(Debug, Error)]
enum Teardown {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the connection")]
    Closed,
    #[error("input line too long")]
    InputOverflow,
    #[error("too much output queued")]
    OutputOverflow,
    #[error("idle timeout")]
    IdleTimeout,
    #[error("list sent")]
    Finished,
    #[error("list request refused")]
    ListRefused,
    #[error("registration from banned address")]
    ServerBanned,
    #[error("address banned")]
    ClientBanned,
}

pub struct Master<S> {
    limits: Limits,
    bans: BanList,
    users: UserTable,
    authenticator: Option<Box<dyn Authenticator>>,
    servers: GameServerRegistry,
    broadcasts: Broadcasts,
    clients: ConnectionRegistry<S>,
}

impl<S: SessionSocket> Master<S> {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            bans: BanList::new(),
            users: UserTable::new(),
            authenticator: None,
            servers: GameServerRegistry::default(),
            broadcasts: Broadcasts::new(),
            clients: ConnectionRegistry::new(),
        }
    }

    /// Builds a master and applies `config` as the first reload.
    pub fn from_config(config: &MasterConfig, now_unix: u64) -> Result<Self, ConfigError> {
        let mut master = Self::new(config.limits.clone());
        master.reload(config, now_unix)?;
        Ok(master)
    }

    pub fn with_authenticator(mut self, authenticator: Box<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_resolver(mut self, resolver: Box<dyn AddressResolver>) -> Self {
        self.servers = GameServerRegistry::new(resolver);
        self
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn bans(&self) -> &BanList {
        &self.bans
    }

    pub fn servers(&self) -> &GameServerRegistry {
        &self.servers
    }

    pub fn clients(&self) -> &ConnectionRegistry<S> {
        &self.clients
    }

    pub fn broadcasts(&self) -> &Broadcasts {
        &self.broadcasts
    }

    /// Per-session readiness the event loop has to wait for.
    pub fn interest(&self) -> impl Iterator<Item = Interest<'_, S>> {
        self.clients.interest()
    }

    /// Admits a new connection, or drops the socket if it is refused.
    pub fn accept(&mut self, socket: S, addr: SocketAddrV4, now: u64) -> Result<SessionId, Refusal> {
        let admitted = self
            .clients
            .admit(socket, addr, now, &self.limits, &self.bans)?;
        if let Some(subscription) = admitted.evicted.and_then(|session| session.subscription) {
            self.broadcasts.release(subscription);
        }
        Ok(admitted.id)
    }

    /// Handles a datagram from a game host. The payload is not inspected.
    pub fn handle_pong(&mut self, from: SocketAddrV4, now: u64) {
        let Some(outcome) = self.servers.record_pong(from, now) else {
            debug!("Ignoring datagram from unregistered {}", from);
            return;
        };
        if outcome.first_pong {
            self.broadcasts.servers.mark_stale();
        }
        if !outcome.promote {
            return;
        }

        info!("Game server {} answered ping", from);
        let Some(session) = self
            .clients
            .find_server_owner(from)
            .and_then(|index| self.clients.get_mut(index))
        else {
            return;
        };
        session.registered_server = true;
        session.queue(&Reply::SuccReg);
        if session.subscription.is_none() {
            session.subscription = self.broadcasts.subscribe_latest(ListKind::GlobalBans);
        }
    }

    /// Runs one ping round. Returns the hosts to probe.
    pub fn check_game_servers(&mut self, now: u64) -> Vec<SocketAddrV4> {
        let mut probes = Vec::new();
        for action in self.servers.check(now, &self.limits) {
            match action {
                PingAction::Probe(addr) => probes.push(addr),
                PingAction::Evicted { addr, reason } => {
                    self.broadcasts.servers.mark_stale();
                    if reason != Eviction::PingRetriesExhausted {
                        continue;
                    }
                    if let Some(session) = self
                        .clients
                        .find_server_owner(addr)
                        .and_then(|index| self.clients.get_mut(index))
                    {
                        session.queue(&Reply::FailReg("failed pinging server".to_string()));
                    }
                }
            }
        }
        probes
    }

    /// Services every session once: write, read and run commands, then
    /// enforce the output and idle limits.
    pub fn service_sessions(&mut self, ready: &Readiness, now: u64) {
        let mut index = 0;
        while index < self.clients.len() {
            match self.service_session(index, ready, now) {
                Ok(()) => index += 1,
                Err(reason) => self.purge_client(index, &reason),
            }
        }
    }

    fn service_session(&mut self, index: usize, ready: &Readiness, now: u64) -> Result<(), Teardown> {
        let Some(session) = self.clients.get_mut(index) else {
            return Ok(());
        };
        let id = session.id;

        if ready.is_writable(id) && session.has_pending_output() {
            if let Flush::SnapshotSent(subscription) = session.flush(&self.broadcasts)? {
                self.broadcasts.release(subscription);
            }
            if session.is_finished() {
                return Err(Teardown::Finished);
            }
        }

        if ready.is_readable(id) {
            match session.receive(self.limits.input_limit)? {
                Received::Closed => return Err(Teardown::Closed),
                Received::Data(_) => self.process_input(index, now)?,
                Received::NotReady => {}
            }
        }

        let Some(session) = self.clients.get(index) else {
            return Ok(());
        };
        if session.output_len() > self.limits.output_limit {
            return Err(Teardown::OutputOverflow);
        }
        if session.is_timed_out(now, &self.limits) {
            return Err(Teardown::IdleTimeout);
        }
        Ok(())
    }

    /// Runs every complete line the session has buffered. `list` ends the
    /// conversation, so anything after it is dropped.
    fn process_input(&mut self, index: usize, now: u64) -> Result<(), Teardown> {
        let Some(lines) = self.clients.get_mut(index).map(|session| session.take_lines()) else {
            return Ok(());
        };

        for line in lines {
            if let Some(session) = self.clients.get_mut(index) {
                session.last_input = now;
            }
            let Some(command) = Command::parse(&line) else {
                debug!("Ignoring unknown line {:?}", line);
                continue;
            };
            match command {
                Command::List => return self.list(index),
                Command::RegServ { port } => self.register_server(index, port)?,
                Command::ReqAuth { id, name } => self.request_auth(index, id, &name, now),
                Command::ConfAuth { id, value } => self.confirm_auth(index, id, &value, now),
            }
        }

        let input_len = self.clients.get(index).map_or(0, |session| session.input_len());
        if input_len >= self.limits.input_limit {
            return Err(Teardown::InputOverflow);
        }
        Ok(())
    }

    fn list(&mut self, index: usize) -> Result<(), Teardown> {
        let latest = self
            .broadcasts
            .servers
            .refresh(|| self.servers.render_list());

        let Some(session) = self.clients.get_mut(index) else {
            return Ok(());
        };
        if session.subscription.is_some() {
            return Err(Teardown::ListRefused);
        }
        let Some(id) = latest.and_then(|id| self.broadcasts.servers.subscribe(id)) else {
            return Err(Teardown::ListRefused);
        };
        session.subscription = Some(Subscription {
            kind: ListKind::Servers,
            id,
        });
        session.clear_output();
        session.close_after_flush = true;
        Ok(())
    }

    fn register_server(&mut self, index: usize, port: i64) -> Result<(), Teardown> {
        let Some(session) = self.clients.get_mut(index) else {
            return Ok(());
        };
        if self.bans.matches(BanScope::Server, session.ip()) {
            return Err(Teardown::ServerBanned);
        }

        let port = match u16::try_from(port) {
            Ok(port) if session.server_port.map_or(true, |declared| declared == port) => port,
            _ => {
                session.queue(&Reply::FailReg("invalid port".to_string()));
                return Ok(());
            }
        };
        session.server_port = Some(port);

        match self.servers.add(session.ip(), port, &self.limits) {
            Ok(Registration::Added) | Ok(Registration::Refreshed) => {
                if session.subscription.is_none() {
                    session.subscription = self.broadcasts.subscribe_latest(ListKind::GlobalBans);
                }
            }
            Ok(Registration::Ignored) => {
                debug!("Server limit reached, ignoring {}:{}", session.ip(), port);
            }
            Err(e) => {
                info!("Registration of {}:{} failed: {}", session.ip(), port, e);
                session.queue(&Reply::FailReg(e.to_string()));
            }
        }
        Ok(())
    }

    fn request_auth(&mut self, index: usize, id: u32, name: &str, now: u64) {
        let Some(session) = self.clients.get_mut(index) else {
            return;
        };
        let replies = session.auth.request(
            id,
            name,
            now,
            &self.limits,
            &self.users,
            self.authenticator.as_deref_mut(),
        );
        for reply in &replies {
            session.queue(reply);
        }
    }

    fn confirm_auth(&mut self, index: usize, id: u32, value: &str, now: u64) {
        let Some(session) = self.clients.get_mut(index) else {
            return;
        };
        let replies = session
            .auth
            .confirm(id, value, now, &self.limits, self.authenticator.as_deref());
        for reply in &replies {
            session.queue(reply);
        }
    }

    fn purge_client(&mut self, index: usize, reason: &Teardown) {
        let Some(session) = self.clients.destroy(index) else {
            return;
        };
        if let Some(subscription) = session.subscription {
            self.broadcasts.release(subscription);
        }
        debug!("Session {} from {} closed: {}", session.id, session.addr, reason);
    }

    /// Drops listed game servers whose address is now server-banned.
    pub fn ban_game_servers(&mut self) {
        if !self.servers.ban_sweep(&self.bans).is_empty() {
            self.broadcasts.servers.mark_stale();
        }
    }

    /// Closes every session whose address is now client-banned.
    pub fn ban_clients(&mut self) {
        for index in (0..self.clients.len()).rev() {
            let banned = self
                .clients
                .get(index)
                .is_some_and(|session| self.bans.matches(BanScope::Client, session.ip()));
            if banned {
                self.purge_client(index, &Teardown::ClientBanned);
            }
        }
    }

    /// Publishes the global ban list and hands it to every session that
    /// declared a game server and is not already receiving a list.
    pub fn gen_gban_list(&mut self) {
        let mut list = Reply::ClearGbans.line();
        for entry in self.bans.entries(BanScope::Global) {
            list.push_str(&Reply::AddGban(entry.mask).line());
        }
        if self.broadcasts.gbans.publish_cumulative(list.into_bytes()).is_none() {
            return;
        }

        for session in self
            .clients
            .iter_mut()
            .filter(|session| session.server_port.is_some() && session.subscription.is_none())
        {
            session.subscription = self.broadcasts.subscribe_latest(ListKind::GlobalBans);
        }
    }

    /// Replaces limits, bans and users with `config` and enforces the new
    /// bans on everything already connected.
    pub fn reload(&mut self, config: &MasterConfig, now_unix: u64) -> Result<(), ConfigError> {
        let mut bans = config.ban_list()?;
        bans.purge_expired(now_unix);

        self.limits = config.limits.clone();
        self.bans = bans;
        self.users = config.user_table();
        info!(
            "Configuration loaded: {} bans, {} users",
            self.bans.len(),
            self.users.len()
        );

        self.ban_game_servers();
        self.ban_clients();
        self.gen_gban_list();
        Ok(())
    }

    /// Drops bans whose expiry has passed.
    pub fn expire_bans(&mut self, now_unix: u64) {
        let expired = self.bans.purge_expired(now_unix);
        if expired > 0 {
            info!("{} bans expired", expired);
            self.gen_gban_list();
        }
    }
}
