//! Raw socket transport for network-attached instruments.
//!
//! Many bench instruments expose a bare TCP command port (SCPI-over-socket,
//! typically port 5025). This adapter owns the socket and provides the
//! line-oriented query convention the drivers expect.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{Transport, TransportError};

pub struct TcpTransport {
    host: String,
    port: u16,

    /// Read timeout applied per call.
    timeout: Duration,

    /// Line terminator appended to outgoing commands.
    line_terminator: String,

    /// Response line ending character.
    response_delimiter: u8,

    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: String, port: u16, timeout: Duration) -> Self {
        Self {
            host,
            port,
            timeout,
            line_terminator: "\n".to_string(),
            response_delimiter: b'\n',
            stream: None,
        }
    }

    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        self.line_terminator = terminator;
        self
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> &str {
        "tcp"
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("connect to {addr} failed: {e}"))
        })?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        debug!(addr = %addr, "tcp transport opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            // Shutdown errors on an already-dead peer are not interesting.
            let _ = stream.shutdown().await;
            debug!(host = %self.host, port = self.port, "tcp transport closed");
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream_mut()?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        let line = format!("{}{}", command, self.line_terminator);
        let stream = self.stream_mut()?;
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        debug!(command = command.trim(), "sent tcp command");
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream_mut()?;
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(timeout, stream.read(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        if n == 0 {
            return Err(TransportError::UnexpectedEof);
        }
        buf.truncate(n);
        Ok(buf)
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        let line = format!("{}{}", command, self.line_terminator);
        let delimiter = self.response_delimiter;
        let timeout = self.timeout;

        let stream = self.stream_mut()?;
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        debug!(command = command.trim(), "sent tcp command");

        // Read byte-wise until the delimiter, bounded by the overall timeout.
        let mut response = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(TransportError::Timeout(timeout))?;
            let mut byte = [0u8; 1];
            let n = tokio::time::timeout(remaining, stream.read(&mut byte))
                .await
                .map_err(|_| TransportError::Timeout(timeout))??;
            if n == 0 {
                return Err(TransportError::UnexpectedEof);
            }
            if byte[0] == delimiter {
                break;
            }
            response.push(byte[0]);
        }

        let response = String::from_utf8_lossy(&response).trim().to_string();
        debug!(response = %response, "received tcp response");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    async fn echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let reply = match line.trim() {
                            "*IDN?" => "ACME,MODEL-1,0001,1.0".to_string(),
                            other => format!("echo:{other}"),
                        };
                        if write_half
                            .write_all(format!("{reply}\n").as_bytes())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let addr = echo_server().await;
        let mut transport =
            TcpTransport::new(addr.ip().to_string(), addr.port(), Duration::from_secs(1));
        transport.open().await.unwrap();
        assert!(transport.is_open());

        let idn = transport.query("*IDN?").await.unwrap();
        assert_eq!(idn, "ACME,MODEL-1,0001,1.0");

        let echoed = transport.query("WAV 1550.0").await.unwrap();
        assert_eq!(echoed, "echo:WAV 1550.0");

        transport.close().await.unwrap();
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_query_before_open_fails() {
        let mut transport =
            TcpTransport::new("127.0.0.1".to_string(), 1, Duration::from_millis(100));
        let err = transport.query("*IDN?").await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut transport =
            TcpTransport::new("127.0.0.1".to_string(), 1, Duration::from_millis(100));
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }
}
