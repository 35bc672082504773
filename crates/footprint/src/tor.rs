//! Tor-backed [`IdentityBackend`]: one SOCKS port and one control port per slot.

use crate::error::{CollectError, CollectResult};
use crate::identity::{Identity, IdentityBackend};
use async_trait::async_trait;
use std::time::Duration;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time::timeout,
};

pub const DEFAULT_SOCKS_PORT_BASE: u16 = 9080;
pub const DEFAULT_CONTROL_PORT_BASE: u16 = 8148;
pub const DEFAULT_PROBE_URL: &str = "https://api.ipify.org";
/// Tor refuses NEWNYM more often than this.
pub const NEWNYM_MIN_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct TorSettings {
    pub host: String,
    pub socks_port_base: u16,
    pub control_port_base: u16,
    pub control_password: String,
    pub probe_url: String,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    /// Bounds connecting to the control port and each reply line read from it.
    pub control_timeout: Duration,
    pub newnym_wait: Duration,
}

impl Default for TorSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            socks_port_base: DEFAULT_SOCKS_PORT_BASE,
            control_port_base: DEFAULT_CONTROL_PORT_BASE,
            control_password: String::new(),
            probe_url: DEFAULT_PROBE_URL.into(),
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            control_timeout: Duration::from_secs(5),
            newnym_wait: NEWNYM_MIN_INTERVAL,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TorBackend {
    settings: TorSettings,
}

impl TorBackend {
    pub fn new(settings: TorSettings) -> Self {
        Self { settings }
    }

    pub fn proxy_url(&self, slot: u16) -> CollectResult<String> {
        let port = offset_port(self.settings.socks_port_base, slot)?;
        Ok(format!("socks5h://{}:{port}", self.settings.host))
    }

    pub fn control_addr(&self, slot: u16) -> CollectResult<String> {
        let port = offset_port(self.settings.control_port_base, slot)?;
        Ok(format!("{}:{port}", self.settings.host))
    }
}

fn offset_port(base: u16, slot: u16) -> CollectResult<u16> {
    base.checked_add(slot).ok_or_else(|| {
        CollectError::InvalidConfig(format!("port base {base} + slot {slot} overflows"))
    })
}

#[async_trait]
impl IdentityBackend for TorBackend {
    fn open(&self, slot: u16, generation: u32) -> CollectResult<Identity> {
        let proxy_url = self.proxy_url(slot)?;
        let proxy = reqwest::Proxy::all(&proxy_url)
            .map_err(|e| CollectError::InvalidConfig(format!("bad proxy {proxy_url}: {e}")))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.settings.request_timeout)
            .build()
            .map_err(|e| CollectError::InvalidConfig(format!("http client init failed: {e}")))?;
        Ok(Identity::new(slot, generation, Some(proxy_url), client))
    }

    async fn probe(&self, identity: &Identity) -> CollectResult<()> {
        let response = identity
            .client()
            .get(&self.settings.probe_url)
            .timeout(self.settings.probe_timeout)
            .send()
            .await
            .map_err(|e| CollectError::TransportFailure(e.to_string()))?;
        if response.status() == reqwest::StatusCode::OK {
            Ok(())
        } else {
            Err(CollectError::TransportFailure(format!(
                "probe returned HTTP {}",
                response.status()
            )))
        }
    }

    async fn request_new_identity(&self, slot: u16) -> CollectResult<Duration> {
        let addr = self.control_addr(slot)?;
        let mut control = ControlConnection::connect(&addr, self.settings.control_timeout).await?;
        control.authenticate(&self.settings.control_password).await?;
        control.signal_newnym().await?;
        Ok(self.settings.newnym_wait)
    }
}

/// A minimal client for the Tor control protocol.
pub struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    reply_timeout: Duration,
}

impl ControlConnection {
    /// Connects to `addr`. `io_timeout` bounds the connect and every reply
    /// line read afterwards.
    pub async fn connect(addr: &str, io_timeout: Duration) -> CollectResult<Self> {
        let stream = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CollectError::ControlChannel(format!("connect to {addr} timed out")))?
            .map_err(|e| CollectError::ControlChannel(format!("connect to {addr}: {e}")))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
            reply_timeout: io_timeout,
        })
    }

    pub async fn authenticate(&mut self, password: &str) -> CollectResult<()> {
        let escaped = password.replace('\\', "\\\\").replace('"', "\\\"");
        self.command(&format!("AUTHENTICATE \"{escaped}\"")).await
    }

    pub async fn signal_newnym(&mut self) -> CollectResult<()> {
        self.command("SIGNAL NEWNYM").await
    }

    /// Sends one command and waits for the end of its reply.
    async fn command(&mut self, line: &str) -> CollectResult<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;

        let verb = line.split_whitespace().next().unwrap_or(line);
        loop {
            let mut reply = String::new();
            let read = timeout(self.reply_timeout, self.reader.read_line(&mut reply))
                .await
                .map_err(|_| {
                    CollectError::ControlChannel(format!("no {verb} reply within {:?}", self.reply_timeout))
                })??;
            if read == 0 {
                return Err(CollectError::ControlChannel(format!(
                    "connection closed while waiting for {verb} reply"
                )));
            }
            let reply = reply.trim_end();
            // "250-" and "250+" continue a reply; "250 " ends it.
            let code = reply.get(..3).unwrap_or(reply);
            let rest = reply.get(3..).unwrap_or_default();
            if code != "250" {
                return Err(CollectError::ControlChannel(format!("{verb} rejected: {reply}")));
            }
            if rest.starts_with(' ') || rest.is_empty() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts one connection and answers each line with the next scripted reply.
    async fn fake_control_port(replies: Vec<&'static str>) -> (u16, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            for reply in replies {
                let Some(line) = lines.next_line().await.unwrap() else {
                    break;
                };
                seen.push(line);
                write.write_all(reply.as_bytes()).await.unwrap();
            }
            seen
        });
        (port, handle)
    }

    fn backend_on(control_port: u16, password: &str) -> TorBackend {
        TorBackend::new(TorSettings {
            control_port_base: control_port,
            control_password: password.into(),
            newnym_wait: Duration::from_millis(1),
            ..TorSettings::default()
        })
    }

    #[tokio::test]
    async fn newnym_authenticates_then_signals() {
        let (port, server) = fake_control_port(vec!["250 OK\r\n", "250 OK\r\n"]).await;
        let backend = backend_on(port, "pa\"ss");

        let wait = backend.request_new_identity(0).await.unwrap();
        assert_eq!(wait, Duration::from_millis(1));

        let seen = server.await.unwrap();
        assert_eq!(seen, vec!["AUTHENTICATE \"pa\\\"ss\"", "SIGNAL NEWNYM"]);
    }

    #[tokio::test]
    async fn rejected_authentication_is_a_control_error() {
        let (port, _server) =
            fake_control_port(vec!["515 Authentication failed: Password did not match\r\n"]).await;
        let backend = backend_on(port, "wrong");

        let err = backend.request_new_identity(0).await.unwrap_err();
        assert!(matches!(err, CollectError::ControlChannel(msg) if msg.contains("515")));
    }

    #[tokio::test]
    async fn multi_line_reply_is_consumed_to_the_end() {
        let (port, server) =
            fake_control_port(vec!["250-extra=1\r\n250 OK\r\n", "250 OK\r\n"]).await;
        let backend = backend_on(port, "");

        backend.request_new_identity(0).await.unwrap();
        assert_eq!(server.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn silent_control_port_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accepts and holds the connection without ever answering.
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        let backend = TorBackend::new(TorSettings {
            control_port_base: port,
            control_timeout: Duration::from_millis(200),
            ..TorSettings::default()
        });

        let result = timeout(Duration::from_secs(5), backend.request_new_identity(0))
            .await
            .expect("rotation request must not hang");
        assert!(matches!(result, Err(CollectError::ControlChannel(msg)) if msg.contains("AUTHENTICATE")));
    }

    #[test]
    fn ports_are_offset_by_slot() {
        let backend = TorBackend::new(TorSettings::default());
        assert_eq!(backend.proxy_url(3).unwrap(), "socks5h://127.0.0.1:9083");
        assert_eq!(backend.control_addr(3).unwrap(), "127.0.0.1:8151");
        assert!(TorBackend::new(TorSettings {
            socks_port_base: u16::MAX,
            ..TorSettings::default()
        })
        .proxy_url(1)
        .is_err());
    }
}
