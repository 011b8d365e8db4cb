//! SCPI over TCP communication helpers for Red Pitaya
//!
//! This module provides an async SCPI client for communicating with Red Pitaya
//! devices over TCP. It handles connection management, command/query
//! operations, and response parsing. Errors are reported with `anyhow` and
//! translated into [`BackendError`] at the session boundary by
//! [`into_backend_error`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use daq_core::error::BackendError;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Default SCPI port for Red Pitaya
pub const DEFAULT_PORT: u16 = 5000;

/// Pause after each command so the SCPI server can apply it.
const COMMAND_SETTLE: Duration = Duration::from_millis(10);

/// The device did not answer a query in time.
#[derive(Debug, thiserror::Error)]
#[error("Timeout waiting for response to '{query}'")]
pub struct ResponseTimeout {
    /// Query that went unanswered.
    pub query: String,
    /// How long we waited.
    pub waited: Duration,
}

/// Line-oriented SCPI operations (allows fake injection in tests).
#[async_trait]
pub trait ScpiOps: Send + Sync {
    /// Send a command without expecting a response.
    async fn write(&self, command: &str) -> Result<()>;
    /// Send a query and return the trimmed response line.
    async fn query(&self, query: &str) -> Result<String>;
    /// Shut down the transport.
    async fn close(&self) -> Result<()>;

    /// Query a floating-point value.
    async fn query_f64(&self, query: &str) -> Result<f64> {
        let response = self.query(query).await?;
        response.parse::<f64>().with_context(|| {
            format!(
                "Failed to parse '{}' as f64 from query: {}",
                response, query
            )
        })
    }
}

/// Async SCPI client for TCP communication with Red Pitaya
pub struct ScpiClient {
    stream: Mutex<BufReader<TcpStream>>,
    timeout: Duration,
}

impl ScpiClient {
    /// Open a TCP session to `host:port`.
    ///
    /// `host` may be a hostname or an IP literal; name resolution happens as
    /// part of the connect and is bounded by `connect_timeout`. `timeout`
    /// bounds every subsequent query.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ResponseTimeout {
                query: format!("connect {}:{}", host, port),
                waited: connect_timeout,
            })?
            .with_context(|| format!("Failed to connect to {}:{}", host, port))?;

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        tracing::debug!(host, port, "SCPI transport connected");

        Ok(Self {
            stream: Mutex::new(BufReader::new(stream)),
            timeout,
        })
    }

    /// Clear any pending data from the input buffer.
    ///
    /// A reply that arrived after its query timed out would otherwise be
    /// read as the answer to the next query.
    async fn flush_input_buffer(stream: &mut BufReader<TcpStream>) {
        let buffered = stream.buffer().len();
        if buffered > 0 {
            tracing::debug!("Flushing {} bytes from buffer", buffered);
            stream.consume(buffered);
        }

        let mut discard = [0u8; 256];
        loop {
            match timeout(Duration::from_millis(10), stream.get_mut().peek(&mut discard)).await {
                Ok(Ok(n)) if n > 0 => {
                    let mut stale = vec![0u8; n];
                    let _ = stream.get_mut().try_read(&mut stale);
                    tracing::debug!("Flushed {} stale bytes from stream", n);
                }
                _ => break,
            }
        }
    }
}

#[async_trait]
impl ScpiOps for ScpiClient {
    async fn write(&self, command: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;

        tracing::debug!("SCPI write: {:?}", command);
        let line = format!("{}\r\n", command);
        stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to write command: {}", command))?;
        stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush stream")?;

        tokio::time::sleep(COMMAND_SETTLE).await;
        Ok(())
    }

    async fn query(&self, query: &str) -> Result<String> {
        let mut stream = self.stream.lock().await;

        Self::flush_input_buffer(&mut stream).await;

        tracing::debug!("SCPI query: {:?}", query);
        let line = format!("{}\r\n", query);
        stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to write query: {}", query))?;
        stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush stream")?;

        let mut response = String::new();
        match timeout(self.timeout, stream.read_line(&mut response)).await {
            Ok(Ok(0)) => anyhow::bail!("Connection closed by device"),
            Ok(Ok(_)) => {
                let trimmed = response.trim().to_string();
                tracing::debug!("SCPI response: {:?}", trimmed);
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(e).context("Failed to read response"),
            Err(_) => Err(ResponseTimeout {
                query: query.to_string(),
                waited: self.timeout,
            }
            .into()),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut stream = self.stream.lock().await;
        stream
            .get_mut()
            .shutdown()
            .await
            .context("Failed to shut down SCPI stream")
    }
}

/// Translate a transport error into the backend taxonomy.
pub fn into_backend_error(err: anyhow::Error) -> BackendError {
    match err.downcast_ref::<ResponseTimeout>() {
        Some(timeout) => BackendError::Timeout(timeout.waited),
        None => BackendError::Communication(format!("{:#}", err)),
    }
}

/// Parse a `SYST:ERR?` reply (`<code>,"<message>"`).
///
/// Returns `None` for the "no error" reply (code 0).
pub fn parse_system_error(response: &str) -> Option<String> {
    let code = response
        .split_once(',')
        .map(|(code, _)| code)
        .unwrap_or(response)
        .trim();
    match code.parse::<i32>() {
        Ok(0) => None,
        _ => Some(response.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal line-based SCPI responder on a local port.
    async fn spawn_responder() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = match line.trim() {
                    "*IDN?" => Some("REDPITAYA,INSTR2020,0,2.00"),
                    "INP1:VOLT?" => Some("0.4321"),
                    _ => None,
                };
                if let Some(reply) = reply {
                    write
                        .write_all(format!("{}\r\n", reply).as_bytes())
                        .await
                        .unwrap();
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn test_query_roundtrip_over_tcp() {
        let port = spawn_responder().await;
        let client = ScpiClient::connect(
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(
            client.query("*IDN?").await.unwrap(),
            "REDPITAYA,INSTR2020,0,2.00"
        );
        let volts = client.query_f64("INP1:VOLT?").await.unwrap();
        assert!((volts - 0.4321).abs() < 1e-9);
        client.write("PID0:EN OFF").await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_query_maps_to_timeout() {
        let port = spawn_responder().await;
        let client = ScpiClient::connect(
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        let err = client.query("SILENT?").await.unwrap_err();
        assert_eq!(
            into_backend_error(err),
            BackendError::Timeout(Duration::from_millis(50))
        );
    }

    #[tokio::test]
    async fn test_refused_connection_is_communication_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = ScpiClient::connect(
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(
            into_backend_error(err),
            BackendError::Communication(_)
        ));
    }

    #[test]
    fn test_parse_system_error() {
        assert_eq!(parse_system_error("0,\"No error\""), None);
        assert_eq!(
            parse_system_error("-221,\"Settings conflict\""),
            Some("-221,\"Settings conflict\"".to_string())
        );
        assert_eq!(
            parse_system_error("garbage"),
            Some("garbage".to_string())
        );
    }
}
