//! Server network layer: sockets, readiness and the tick loop

use crate::config::{ConfigError, MasterConfig};
use crate::master::{Master, Readiness};
use crate::utils::{millis_since, unix_time};
use log::{debug, error, info, warn};
use protocol::PING_PROBE;
use std::future::poll_fn;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::task::Poll;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Longest the loop sleeps without any socket becoming ready
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What woke the loop up
#[derive(Default)]
struct Wakeup {
    accepted: Vec<(TcpStream, SocketAddr)>,
    ping_ready: bool,
    reload: bool,
    ready: Readiness,
}

impl Wakeup {
    fn is_empty(&self) -> bool {
        self.accepted.is_empty() && !self.ping_ready && !self.reload && self.ready.is_empty()
    }
}

/// Listening sockets plus the master they feed
pub struct Server {
    listener: TcpListener,
    ping_socket: UdpSocket,
    master: Master<TcpStream>,
    config_path: Option<PathBuf>,
    started: Instant,
    #[cfg(unix)]
    reload_signal: Option<Signal>,
}

impl Server {
    /// Loads the config at `config_path` (defaults if it does not exist) and
    /// binds to `addr`.
    pub async fn bind(addr: SocketAddrV4, config_path: PathBuf) -> Result<Self, ServerError> {
        let config = match MasterConfig::load(&config_path)? {
            Some(config) => config,
            None => {
                warn!("{} not found, using defaults", config_path.display());
                MasterConfig::default()
            }
        };
        let master = Master::from_config(&config, unix_time())?;
        let mut server = Self::with_master(addr, master).await?;
        server.config_path = Some(config_path);
        Ok(server)
    }

    /// Binds the TCP listener and the UDP ping socket to the same address
    /// and port.
    pub async fn with_master(addr: SocketAddrV4, master: Master<TcpStream>) -> Result<Self, ServerError> {
        let bind_error = |source| ServerError::Bind { addr, source };

        let socket = TcpSocket::new_v4().map_err(bind_error)?;
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(SocketAddr::V4(addr)).map_err(bind_error)?;
        let listener = socket.listen(1024).map_err(bind_error)?;

        // Port 0 picks the TCP port first; pings use the same one.
        let bound = listener.local_addr().map_err(bind_error)?;
        let ping_socket = UdpSocket::bind(bound).await.map_err(bind_error)?;
        info!("Master server listening on {}", bound);

        Ok(Server {
            listener,
            ping_socket,
            master,
            config_path: None,
            started: Instant::now(),
            #[cfg(unix)]
            reload_signal: Self::hangup_signal(),
        })
    }

    #[cfg(unix)]
    fn hangup_signal() -> Option<Signal> {
        match signal(SignalKind::hangup()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("Reload on SIGHUP unavailable: {}", e);
                None
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn master(&self) -> &Master<TcpStream> {
        &self.master
    }

    /// Milliseconds since the server started
    fn now(&self) -> u64 {
        millis_since(self.started)
    }

    /// Re-reads the config file and applies it. On failure the running
    /// configuration stays in place.
    pub fn reload_config(&mut self) {
        let Some(path) = self.config_path.as_ref() else {
            return;
        };
        let config = match MasterConfig::load(path) {
            Ok(Some(config)) => config,
            Ok(None) => {
                warn!("{} not found, reverting to defaults", path.display());
                MasterConfig::default()
            }
            Err(e) => {
                error!("Reload failed: {}", e);
                return;
            }
        };
        match self.master.reload(&config, unix_time()) {
            Ok(()) => info!("Reloaded {}", path.display()),
            Err(e) => error!("Reload of {} failed: {}", path.display(), e),
        }
    }

    /// Waits until a socket is ready, a connection arrives or a reload is
    /// requested. Gives up after `WAIT_TIMEOUT` with nothing ready.
    async fn wait(&mut self) -> Wakeup {
        let Self {
            listener,
            ping_socket,
            master,
            #[cfg(unix)]
            reload_signal,
            ..
        } = self;

        let ready = poll_fn(move |cx| {
            let mut wakeup = Wakeup::default();

            loop {
                match listener.poll_accept(cx) {
                    Poll::Ready(Ok(connection)) => wakeup.accepted.push(connection),
                    Poll::Ready(Err(e)) => {
                        warn!("Accept failed: {}", e);
                        break;
                    }
                    Poll::Pending => break,
                }
            }

            wakeup.ping_ready = ping_socket.poll_recv_ready(cx).is_ready();

            for interest in master.interest() {
                if interest.write {
                    if interest.socket.poll_write_ready(cx).is_ready() {
                        wakeup.ready.mark_writable(interest.id);
                    }
                } else if interest.socket.poll_read_ready(cx).is_ready() {
                    wakeup.ready.mark_readable(interest.id);
                }
            }

            #[cfg(unix)]
            if let Some(hangup) = reload_signal.as_mut() {
                while let Poll::Ready(Some(())) = hangup.poll_recv(cx) {
                    wakeup.reload = true;
                }
            }

            if wakeup.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(wakeup)
            }
        });

        tokio::time::timeout(WAIT_TIMEOUT, ready)
            .await
            .unwrap_or_default()
    }

    /// One pass of the main loop
    pub async fn tick(&mut self) {
        let wakeup = self.wait().await;
        let now = self.now();

        if wakeup.reload {
            info!("Reload requested");
            self.reload_config();
        }

        if wakeup.ping_ready {
            self.receive_pongs(now);
        }

        for (stream, addr) in wakeup.accepted {
            match addr {
                SocketAddr::V4(addr) => {
                    if let Err(refusal) = self.master.accept(stream, addr, now) {
                        debug!("Connection from {} refused: {}", addr, refusal);
                    }
                }
                SocketAddr::V6(addr) => warn!("Rejecting non-IPv4 peer {}", addr),
            }
        }

        self.master.expire_bans(unix_time());
        self.master.service_sessions(&wakeup.ready, now);

        for server in self.master.check_game_servers(now) {
            self.send_probe(server);
        }
    }

    fn receive_pongs(&mut self, now: u64) {
        let mut buf = [0u8; 64];
        loop {
            match self.ping_socket.try_recv_from(&mut buf) {
                Ok((_, SocketAddr::V4(from))) => self.master.handle_pong(from, now),
                Ok((_, from)) => debug!("Ignoring datagram from {}", from),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("Ping socket receive failed: {}", e);
                    break;
                }
            }
        }
    }

    fn send_probe(&self, server: SocketAddrV4) {
        if let Err(e) = self.ping_socket.try_send_to(&PING_PROBE, SocketAddr::V4(server)) {
            debug!("Failed to ping {}: {}", server, e);
        }
    }

    /// Main server loop; runs until the task is dropped
    pub async fn run(&mut self) {
        info!("Master server started");
        loop {
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn loopback() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
    }

    async fn server() -> Server {
        Server::with_master(loopback(), Master::new(Limits::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_tcp_and_udp_share_port() {
        let server = server().await;
        let tcp = server.local_addr().unwrap();
        let udp = server.ping_socket.local_addr().unwrap();
        assert_ne!(tcp.port(), 0);
        assert_eq!(tcp, udp);
    }

    #[tokio::test]
    async fn test_bind_error_names_address() {
        let first = server().await;
        let taken = match first.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };
        // A UDP socket already holds the port, so the second bind must fail
        // at one of the two sockets.
        let result = Server::with_master(taken, Master::new(Limits::default())).await;
        match result {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr, taken),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("second bind to {} succeeded", taken),
        }
    }

    #[tokio::test]
    async fn test_idle_tick_times_out() {
        let mut server = server().await;
        let started = Instant::now();
        server.tick().await;
        assert!(started.elapsed() >= WAIT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_accept_and_answer_invalid_port() {
        let mut server = server().await;
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        while server.master().clients().is_empty() {
            server.tick().await;
        }

        client.write_all(b"regserv 99999\n").await.unwrap();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            let n = client.read(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        while !reader.is_finished() {
            server.tick().await;
        }
        assert_eq!(reader.await.unwrap(), "failreg invalid port\n");
    }

    #[tokio::test]
    async fn test_pong_is_handled_in_the_tick_that_evicts_its_owner() {
        let limits = Limits {
            dup_limit: 1,
            ..Limits::default()
        };
        let mut server = Server::with_master(loopback(), Master::new(limits)).await.unwrap();
        let addr = server.local_addr().unwrap();

        let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let game_port = host.local_addr().unwrap().port();
        let mut owner = TcpStream::connect(addr).await.unwrap();
        while server.master().clients().is_empty() {
            server.tick().await;
        }
        owner
            .write_all(format!("regserv {}\n", game_port).as_bytes())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        loop {
            server.tick().await;
            if let Ok((len, _)) = host.try_recv_from(&mut buf) {
                assert_eq!(&buf[..len], &PING_PROBE);
                break;
            }
        }

        // Pong and a connection that pushes out the owner arrive together.
        host.send_to(&PING_PROBE, addr).await.unwrap();
        let _newcomer = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.tick().await;

        let game_server = SocketAddrV4::new(Ipv4Addr::LOCALHOST, game_port);
        assert!(server.master().servers().get(game_server).unwrap().lastpong.is_some());
        assert_eq!(server.master().clients().len(), 1);
        assert!(!server.master().clients().iter().any(|session| session.owns_server(game_server)));
    }

    #[tokio::test]
    async fn test_reload_without_path_is_noop() {
        let mut server = server().await;
        server.reload_config();
        assert!(server.master().bans().is_empty());
    }
}
