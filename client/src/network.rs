use log::{debug, info, warn};
use protocol::{Command, IpMask, Reply};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Io(#[from] io::Error),
    #[error("timed out waiting for the master")]
    Timeout,
    #[error("registration refused: {0}")]
    Rejected(String),
    #[error("master closed the connection")]
    Closed,
}

/// A server list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub host: String,
    pub port: u16,
}

/// Something that happened while acting as a game host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A probe arrived and was answered
    Pinged(SocketAddr),
    Reply(Reply),
    /// A line that is not part of the protocol
    Unknown(String),
}

/// Talks to one master server
pub struct MasterClient {
    master: SocketAddr,
    timeout: Duration,
}

impl MasterClient {
    pub fn new(master: SocketAddr, timeout: Duration) -> Self {
        Self { master, timeout }
    }

    /// Asks for the server list and reads until the master hangs up.
    pub async fn list(&self) -> Result<Vec<ServerEntry>, ClientError> {
        let mut stream = timeout(self.timeout, TcpStream::connect(self.master))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.write_all(format!("{}\n", Command::List).as_bytes()).await?;

        let mut lines = BufReader::new(stream).lines();
        let mut servers = Vec::new();
        loop {
            let line = timeout(self.timeout, lines.next_line())
                .await
                .map_err(|_| ClientError::Timeout)??;
            let Some(line) = line else {
                break;
            };
            match Reply::parse(&line) {
                Some(Reply::AddServer { ip, port }) => servers.push(ServerEntry { host: ip, port }),
                _ => debug!("Ignoring line {:?}", line),
            }
        }
        info!("Master {} lists {} servers", self.master, servers.len());
        Ok(servers)
    }

    /// Registers a game host on `port` (0 picks a free one) and waits until
    /// the master has confirmed it by pinging.
    pub async fn register(&self, port: u16) -> Result<GameHost, ClientError> {
        let udp = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
        let port = udp.local_addr()?.port();

        let mut stream = timeout(self.timeout, TcpStream::connect(self.master))
            .await
            .map_err(|_| ClientError::Timeout)??;
        let command = Command::RegServ { port: port as i64 };
        stream.write_all(format!("{}\n", command).as_bytes()).await?;

        let mut host = GameHost {
            udp,
            lines: BufReader::new(stream).lines(),
            port,
            bans: Vec::new(),
        };

        loop {
            let event = timeout(self.timeout, host.next_event())
                .await
                .map_err(|_| ClientError::Timeout)??;
            match event {
                HostEvent::Reply(Reply::SuccReg) => {
                    info!("Registered on port {}", port);
                    return Ok(host);
                }
                HostEvent::Reply(Reply::FailReg(reason)) => return Err(ClientError::Rejected(reason)),
                _ => {}
            }
        }
    }
}

/// A registered game host: keeps answering probes and tracks the global
/// ban list pushed by the master.
pub struct GameHost {
    udp: UdpSocket,
    lines: Lines<BufReader<TcpStream>>,
    port: u16,
    bans: Vec<IpMask>,
}

impl GameHost {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Global bans received so far
    pub fn bans(&self) -> &[IpMask] {
        &self.bans
    }

    /// Waits for the next probe or reply line. Probes are echoed back to
    /// their sender.
    pub async fn next_event(&mut self) -> Result<HostEvent, ClientError> {
        let mut buf = [0u8; 64];
        tokio::select! {
            received = self.udp.recv_from(&mut buf) => {
                let (len, from) = received?;
                self.udp.send_to(&buf[..len], from).await?;
                debug!("Answered probe from {}", from);
                Ok(HostEvent::Pinged(from))
            }
            line = self.lines.next_line() => {
                let line = line?.ok_or(ClientError::Closed)?;
                let Some(reply) = Reply::parse(&line) else {
                    warn!("Unrecognized line from master: {:?}", line);
                    return Ok(HostEvent::Unknown(line));
                };
                match &reply {
                    Reply::ClearGbans => self.bans.clear(),
                    Reply::AddGban(mask) => self.bans.push(*mask),
                    _ => {}
                }
                Ok(HostEvent::Reply(reply))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    async fn fake_master() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    async fn read_line(stream: &mut TcpStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while stream.read(&mut byte).await.unwrap() == 1 && byte[0] != b'\n' {
            line.push(byte[0]);
        }
        String::from_utf8(line).unwrap()
    }

    #[tokio::test]
    async fn test_list_collects_addserver_lines() {
        let (listener, addr) = fake_master().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            assert_eq!(read_line(&mut stream).await, "list");
            stream
                .write_all(b"addserver 1.2.3.4 28785\ngarbage\naddserver 5.6.7.8 1\n")
                .await
                .unwrap();
        });

        let client = MasterClient::new(addr, Duration::from_secs(5));
        let servers = assert_ok!(client.list().await);
        assert_eq!(
            servers,
            vec![
                ServerEntry { host: "1.2.3.4".to_string(), port: 28785 },
                ServerEntry { host: "5.6.7.8".to_string(), port: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn test_register_reports_failreg() {
        let (listener, addr) = fake_master().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let line = read_line(&mut stream).await;
            assert!(line.starts_with("regserv "));
            stream.write_all(b"failreg too many servers on ip\n").await.unwrap();
        });

        let client = MasterClient::new(addr, Duration::from_secs(5));
        match client.register(0).await {
            Err(ClientError::Rejected(reason)) => assert_eq!(reason, "too many servers on ip"),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("registration should fail"),
        }
    }

    #[tokio::test]
    async fn test_register_answers_probe_then_succeeds() {
        let (listener, addr) = fake_master().await;
        let master = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let line = read_line(&mut stream).await;
            let port: u16 = line.trim_start_matches("regserv ").parse().unwrap();

            let pinger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            pinger.send_to(&protocol::PING_PROBE, ("127.0.0.1", port)).await.unwrap();
            let mut buf = [0u8; 16];
            let (len, _) = pinger.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], &protocol::PING_PROBE);

            stream
                .write_all(b"cleargbans\naddgban 10.0.0.0/8\nsuccreg\n")
                .await
                .unwrap();
            stream
        });

        let client = MasterClient::new(addr, Duration::from_secs(5));
        let host = assert_ok!(client.register(0).await);
        assert_ne!(host.port(), 0);
        assert_eq!(host.bans(), &["10.0.0.0/8".parse::<IpMask>().unwrap()]);
        assert_ok!(master.await);
    }

    #[tokio::test]
    async fn test_list_times_out_on_silent_master() {
        let (listener, addr) = fake_master().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let client = MasterClient::new(addr, Duration::from_millis(100));
        let result = client.list().await;
        assert!(matches!(assert_err!(result), ClientError::Timeout));
    }
}
