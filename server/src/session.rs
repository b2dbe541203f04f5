//! One accepted TCP connection and its line-oriented buffers
//!
//! A session owns its socket, the bytes received but not yet split into
//! lines, and whatever it still has to send. Output comes from two places:
//! direct replies queued by command handlers, and at most one subscription
//! to a shared list snapshot. Direct output always goes first; the snapshot
//! is streamed once it has drained.
//!
//! Nothing here blocks. The socket is only touched when the caller knows it
//! is ready, and a `WouldBlock` simply means "try again next tick".

use crate::auth::AuthState;
use crate::broadcast::{Broadcasts, Subscription};
use crate::config::Limits;
use protocol::Reply;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

pub type SessionId = u64;

/// Non-blocking byte transport under a session.
pub trait SessionSocket {
    fn try_send(&mut self, data: &[u8]) -> io::Result<usize>;
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl SessionSocket for tokio::net::TcpStream {
    fn try_send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.try_write(data)
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }
}

/// Result of one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Data(usize),
    NotReady,
    /// The peer closed its side
    Closed,
}

/// Result of one write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Nothing was queued
    Idle,
    /// Some bytes remain
    Pending,
    OutputSent,
    /// The whole snapshot went out; the caller must release it
    SnapshotSent(Subscription),
}

pub struct ClientSession<S> {
    pub id: SessionId,
    pub addr: SocketAddrV4,
    socket: S,
    input: Vec<u8>,
    output: String,
    output_pos: usize,
    /// Bytes of the subscribed snapshot already sent
    snapshot_pos: usize,
    pub subscription: Option<Subscription>,
    pub connect_time: u64,
    pub last_input: u64,
    /// Port declared by `regserv`
    pub server_port: Option<u16>,
    /// Set once the declared game server answered a ping
    pub registered_server: bool,
    /// Close as soon as all output has been sent
    pub close_after_flush: bool,
    pub auth: AuthState,
}

impl<S: SessionSocket> ClientSession<S> {
    pub fn new(id: SessionId, addr: SocketAddrV4, socket: S, now: u64) -> Self {
        Self {
            id,
            addr,
            socket,
            input: Vec::new(),
            output: String::new(),
            output_pos: 0,
            snapshot_pos: 0,
            subscription: None,
            connect_time: now,
            last_input: now,
            server_port: None,
            registered_server: false,
            close_after_flush: false,
            auth: AuthState::new(),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.addr.ip()
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// Whether the game server this session declared lives at `addr`.
    pub fn owns_server(&self, addr: SocketAddrV4) -> bool {
        self.ip() == *addr.ip() && self.server_port == Some(addr.port())
    }

    pub fn queue(&mut self, reply: &Reply) {
        self.output.push_str(&reply.line());
    }

    /// Drops queued direct output, keeping any subscription.
    pub fn clear_output(&mut self) {
        self.output.clear();
        self.output_pos = 0;
    }

    pub fn output_len(&self) -> usize {
        self.output.len()
    }

    pub fn input_len(&self) -> usize {
        self.input.len()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty() || self.subscription.is_some()
    }

    /// Whether a one-shot session has nothing left to send.
    pub fn is_finished(&self) -> bool {
        self.close_after_flush && !self.has_pending_output()
    }

    /// Reads whatever fits below `input_limit`.
    pub fn receive(&mut self, input_limit: usize) -> io::Result<Received> {
        let start = self.input.len();
        if start >= input_limit {
            return Ok(Received::NotReady);
        }
        self.input.resize(input_limit, 0);
        let result = self.socket.try_recv(&mut self.input[start..]);
        let read = match &result {
            Ok(n) => *n,
            Err(_) => 0,
        };
        self.input.truncate(start + read);

        match result {
            Ok(0) => Ok(Received::Closed),
            Ok(n) => Ok(Received::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Received::NotReady),
            Err(e) => Err(e),
        }
    }

    /// Splits off every complete line. The unterminated tail stays buffered.
    pub fn take_lines(&mut self) -> Vec<String> {
        let Some(end) = self.input.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.input.split_off(end + 1);
        let complete = std::mem::replace(&mut self.input, rest);
        complete
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Writes the next chunk of pending output. A snapshot that has started
    /// going out is finished before any direct output, so lines never
    /// interleave; otherwise direct output goes first.
    pub fn flush(&mut self, broadcasts: &Broadcasts) -> io::Result<Flush> {
        match self.subscription {
            Some(subscription) if self.snapshot_pos > 0 || self.output.is_empty() => {
                self.flush_snapshot(subscription, broadcasts)
            }
            _ if !self.output.is_empty() => self.flush_output(),
            _ => Ok(Flush::Idle),
        }
    }

    fn flush_output(&mut self) -> io::Result<Flush> {
        if !send_from(&mut self.socket, self.output.as_bytes(), &mut self.output_pos)? {
            return Ok(Flush::Pending);
        }
        self.output.clear();
        self.output_pos = 0;
        Ok(Flush::OutputSent)
    }

    fn flush_snapshot(&mut self, subscription: Subscription, broadcasts: &Broadcasts) -> io::Result<Flush> {
        let data = broadcasts.get(subscription).unwrap_or(&[]);
        if !send_from(&mut self.socket, data, &mut self.snapshot_pos)? {
            return Ok(Flush::Pending);
        }
        self.snapshot_pos = 0;
        self.subscription = None;
        Ok(Flush::SnapshotSent(subscription))
    }

    /// Idle check. Registered game servers get the longer keepalive window.
    pub fn is_timed_out(&self, now: u64, limits: &Limits) -> bool {
        let allowed = if self.registered_server {
            limits.keepalive_time_ms
        } else {
            limits.client_time_ms
        };
        now.saturating_sub(self.last_input) >= allowed
    }
}

/// Sends `data[*pos..]` and advances `pos`. Returns whether everything has
/// been sent.
fn send_from<S: SessionSocket>(socket: &mut S, data: &[u8], pos: &mut usize) -> io::Result<bool> {
    if *pos < data.len() {
        match socket.try_send(&data[*pos..]) {
            Ok(n) => *pos += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(*pos >= data.len())
}
