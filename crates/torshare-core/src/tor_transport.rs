//! Tor transport: SOCKS5 streams and control-port circuit renewal

use crate::transport::TransportProvider;
use crate::{Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_socks::tcp::Socks5Stream;

/// Longest a single readiness check may take
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval between readiness checks
const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for reaching the local Tor process
#[derive(Clone, Debug)]
pub struct TorConfig {
    /// Host the SOCKS and control ports listen on
    pub host: String,
    /// SOCKS5 proxy port
    pub socks_port: u16,
    /// Control port used for NEWNYM
    pub control_port: u16,
    /// Control-port password, if the control port requires one
    pub control_password: Option<String>,
    /// Tor binary to launch when the proxy is not reachable
    pub tor_binary: Option<PathBuf>,
    /// Bound on reaching the proxy and on the SOCKS connect
    pub connect_timeout: Duration,
    /// Pause after NEWNYM while Tor builds fresh circuits
    pub circuit_settle: Duration,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            socks_port: 9050,
            control_port: 9051,
            control_password: None,
            tor_binary: None,
            connect_timeout: Duration::from_secs(30),
            circuit_settle: Duration::from_secs(5),
        }
    }
}

/// Streams routed through a local Tor SOCKS proxy
pub struct TorTransport {
    config: TorConfig,
    /// Tor process we launched ourselves, if any
    child: Mutex<Option<Child>>,
}

impl TorTransport {
    pub fn new(config: TorConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TorConfig::default())
    }

    pub fn config(&self) -> &TorConfig {
        &self.config
    }

    /// Whether this transport launched the Tor process it talks to.
    ///
    /// A launched process is killed when the transport is dropped.
    pub async fn owns_process(&self) -> bool {
        self.child.lock().await.is_some()
    }

    async fn proxy_reachable(&self) -> bool {
        matches!(
            tokio::time::timeout(
                CHECK_TIMEOUT,
                TcpStream::connect((self.config.host.as_str(), self.config.socks_port)),
            )
            .await,
            Ok(Ok(_))
        )
    }

    async fn spawn_tor(&self) -> Result<()> {
        let Some(binary) = self.config.tor_binary.as_ref() else {
            return Ok(());
        };

        let mut child = self.child.lock().await;
        if child.is_some() {
            return Ok(());
        }

        tracing::info!("Starting Tor ({})", binary.display());
        let spawned = Command::new(binary)
            .arg("--SocksPort")
            .arg(self.config.socks_port.to_string())
            .arg("--ControlPort")
            .arg(self.config.control_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::TransportUnavailable(format!("failed to start tor: {}", e)))?;
        *child = Some(spawned);
        Ok(())
    }

    async fn control_command(
        &self,
        reader: &mut BufReader<TcpStream>,
        command: &str,
    ) -> Result<()> {
        reader.get_mut().write_all(command.as_bytes()).await?;
        reader.get_mut().write_all(b"\r\n").await?;
        reader.get_mut().flush().await?;

        let mut reply = String::new();
        let n = tokio::time::timeout(self.config.connect_timeout, reader.read_line(&mut reply))
            .await
            .map_err(|_| Error::TransportUnavailable("control port did not answer".to_string()))??;
        if n == 0 {
            return Err(Error::TransportUnavailable("control port closed".to_string()));
        }

        let verb = command.split_whitespace().next().unwrap_or(command);
        if !reply.starts_with("250") {
            return Err(Error::TransportUnavailable(format!(
                "{} rejected: {}",
                verb,
                reply.trim_end()
            )));
        }
        Ok(())
    }
}

impl TransportProvider for TorTransport {
    type Socket = TcpStream;
    type Stream = Socks5Stream<TcpStream>;

    async fn ensure_ready(&self, timeout: Duration) -> Result<()> {
        if self.proxy_reachable().await {
            tracing::info!("Tor is already running");
            return Ok(());
        }

        self.spawn_tor().await?;

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(CHECK_INTERVAL).await;
            if self.proxy_reachable().await {
                tracing::info!("Tor proxy reachable on port {}", self.config.socks_port);
                return Ok(());
            }
        }

        Err(Error::TransportUnavailable(format!(
            "Tor SOCKS proxy {}:{} not reachable after {:?}",
            self.config.host, self.config.socks_port, timeout
        )))
    }

    async fn open_socket(&self) -> Result<TcpStream> {
        let addr = (self.config.host.as_str(), self.config.socks_port);
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::TransportUnavailable(format!(
                "cannot reach Tor proxy {}:{}: {}",
                self.config.host, self.config.socks_port, e
            ))),
            Err(_) => Err(Error::TransportUnavailable(
                "timed out reaching Tor proxy".to_string(),
            )),
        }
    }

    async fn connect(
        &self,
        socket: TcpStream,
        address: &str,
        port: u16,
    ) -> Result<Socks5Stream<TcpStream>> {
        // Hostnames go to the proxy unresolved so .onion lookups stay inside Tor
        let connect = Socks5Stream::connect_with_socket(socket, (address, port));
        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::TransportUnavailable(format!(
                "SOCKS connect to {}:{} failed: {}",
                address, port, e
            ))),
            Err(_) => Err(Error::TransportUnavailable(format!(
                "SOCKS connect to {}:{} timed out",
                address, port
            ))),
        }
    }

    async fn renew_circuit(&self) -> Result<()> {
        let addr = (self.config.host.as_str(), self.config.control_port);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::TransportUnavailable("timed out reaching control port".to_string()))?
            .map_err(|e| Error::TransportUnavailable(format!("cannot reach control port: {}", e)))?;
        let mut reader = BufReader::new(stream);

        let auth = match &self.config.control_password {
            Some(password) => format!("AUTHENTICATE {}", quote_control_string(password)),
            None => "AUTHENTICATE".to_string(),
        };
        self.control_command(&mut reader, &auth).await?;
        self.control_command(&mut reader, "SIGNAL NEWNYM").await?;
        let _ = reader.get_mut().write_all(b"QUIT\r\n").await;

        tracing::info!("Requested new Tor circuit");
        tokio::time::sleep(self.config.circuit_settle).await;
        Ok(())
    }
}

/// Quote a value for the Tor control protocol
fn quote_control_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
