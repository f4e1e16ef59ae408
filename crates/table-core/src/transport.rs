//! Transport abstraction over the controller link.
//!
//! A [`Transport`] moves newline-terminated ASCII lines to and from the
//! controller. Two variants exist, both built on the same [`LineTransport`]
//! engine so their `readline` semantics are identical:
//!
//! - [`SerialTransport`]: USB serial via `tokio-serial` (115200 8N1)
//! - [`SocketTransport`]: TCP line link (FluidNC telnet port)
//!
//! No retries live here; the connection manager owns retry policy.
//!
//! # Testing
//!
//! Any `AsyncRead + AsyncWrite` works as the stream, so tests drive a
//! `LineTransport<DuplexStream>` against a simulated controller:
//!
//! ```rust,ignore
//! let (host, device) = tokio::io::duplex(1024);
//! let transport = LineTransport::from_stream(device, TransportKind::Serial, "sim", state);
//! ```

use crate::error::TransportError;
use crate::state::SharedState;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

/// Trait alias for async line-link I/O.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Which physical link a transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// USB / UART serial port.
    Serial,
    /// TCP socket.
    Socket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Socket => write!(f, "socket"),
        }
    }
}

/// Uniform line-oriented interface to the controller.
#[async_trait]
pub trait Transport: Send {
    /// Send one line; the terminator is appended.
    async fn send(&mut self, line: &str) -> Result<(), TransportError>;

    /// Send a single real-time byte (`?`, `!`, `0x18`) without terminator.
    async fn send_realtime(&mut self, byte: u8) -> Result<(), TransportError>;

    /// Read one non-empty line, trimmed. `Ok(None)` when `timeout` elapses first.
    async fn readline(&mut self, timeout: Duration) -> Result<Option<String>, TransportError>;

    /// Bytes received but not yet returned by `readline`.
    fn available(&self) -> usize;

    /// False after `close` or after the device vanished.
    fn is_connected(&self) -> bool;

    /// Persist machine state, then release the handle.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Human-readable endpoint, e.g. `serial:/dev/ttyUSB0`.
    fn describe(&self) -> &str;

    /// Link kind.
    fn kind(&self) -> TransportKind;
}

/// Line engine shared by both transport variants.
pub struct LineTransport<S> {
    io: BufReader<S>,
    pending: Vec<u8>,
    kind: TransportKind,
    label: String,
    connected: bool,
    state: SharedState,
}

/// Serial-port transport.
pub type SerialTransport = LineTransport<tokio_serial::SerialStream>;

/// TCP socket transport.
pub type SocketTransport = LineTransport<tokio::net::TcpStream>;

impl<S: SerialPortIO> LineTransport<S> {
    /// Wrap an already-open stream.
    pub fn from_stream(
        stream: S,
        kind: TransportKind,
        endpoint: impl AsRef<str>,
        state: SharedState,
    ) -> Self {
        Self {
            io: BufReader::new(stream),
            pending: Vec::new(),
            kind,
            label: format!("{}:{}", kind, endpoint.as_ref()),
            connected: true,
            state,
        }
    }

    fn mark_failed(&mut self, err: std::io::Error) -> TransportError {
        let err = TransportError::from_io(err);
        if err.is_device_gone() {
            warn!(endpoint = %self.label, error = %err, "Device vanished");
            self.connected = false;
        }
        err
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Closed);
        }
        let writer = self.io.get_mut();
        if let Err(e) = writer.write_all(bytes).await {
            return Err(self.mark_failed(e));
        }
        if let Err(e) = self.io.get_mut().flush().await {
            return Err(self.mark_failed(e));
        }
        Ok(())
    }
}

impl SerialTransport {
    /// Open a serial port asynchronously using spawn_blocking.
    #[instrument(skip(state), err)]
    pub async fn open(
        port_path: &str,
        baud_rate: u32,
        state: SharedState,
    ) -> Result<Self, TransportError> {
        use tokio_serial::SerialPortBuilderExt;

        let path = port_path.to_string();
        let stream = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))?
        .map_err(|e| TransportError::Io(std::io::Error::from(e)))?;

        debug!(port = port_path, baud_rate, "Serial port opened");
        Ok(Self::from_stream(stream, TransportKind::Serial, port_path, state))
    }
}

impl SocketTransport {
    /// Connect to `host:port` within `timeout`.
    #[instrument(skip(state), err)]
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        state: SharedState,
    ) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ))
            })?
            .map_err(TransportError::Io)?;
        stream.set_nodelay(true).map_err(TransportError::Io)?;

        debug!(%addr, "Socket connected");
        Ok(Self::from_stream(stream, TransportKind::Socket, addr, state))
    }
}

#[async_trait]
impl<S: SerialPortIO + 'static> Transport for LineTransport<S> {
    async fn send(&mut self, line: &str) -> Result<(), TransportError> {
        trace!(endpoint = %self.label, %line, "TX");
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        self.write_bytes(framed.as_bytes()).await
    }

    async fn send_realtime(&mut self, byte: u8) -> Result<(), TransportError> {
        trace!(endpoint = %self.label, byte, "TX realtime");
        self.write_bytes(&[byte]).await
    }

    async fn readline(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        if !self.connected {
            return Err(TransportError::Closed);
        }
        let deadline = Instant::now() + timeout;
        loop {
            // Partial bytes from a timed-out read stay in `pending` for the next call.
            let read = tokio::time::timeout_at(deadline, self.io.read_until(b'\n', &mut self.pending));
            match read.await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    self.connected = false;
                    return Err(TransportError::DeviceGone(format!(
                        "{} closed the link",
                        self.label
                    )));
                }
                Ok(Ok(_)) => {
                    if self.pending.last() != Some(&b'\n') {
                        continue;
                    }
                    let raw = std::mem::take(&mut self.pending);
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    trace!(endpoint = %self.label, %line, "RX");
                    return Ok(Some(line));
                }
                Ok(Err(e)) => return Err(self.mark_failed(e)),
            }
        }
    }

    fn available(&self) -> usize {
        self.io.buffer().len() + self.pending.len()
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Err(e) = self.state.save() {
            warn!(endpoint = %self.label, error = %e, "Failed to persist state before close");
        }
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        debug!(endpoint = %self.label, "Closing transport");
        self.io
            .get_mut()
            .shutdown()
            .await
            .map_err(TransportError::from_io)
    }

    fn describe(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn transport(device: tokio::io::DuplexStream) -> LineTransport<tokio::io::DuplexStream> {
        LineTransport::from_stream(device, TransportKind::Serial, "sim", SharedState::in_memory())
    }

    #[tokio::test]
    async fn test_send_appends_newline() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut t = transport(device);

        t.send("G1 X1").await.unwrap();

        let mut buf = [0u8; 16];
        let n = host.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"G1 X1\n");
    }

    #[tokio::test]
    async fn test_readline_trims_and_skips_blank_lines() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut t = transport(device);

        host.write_all(b"\r\n  \r\nok\r\n").await.unwrap();

        let line = t.readline(Duration::from_millis(200)).await.unwrap();
        assert_eq!(line.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_readline_timeout_keeps_partial_line() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut t = transport(device);

        host.write_all(b"<Idle|MPos").await.unwrap();
        let first = t.readline(Duration::from_millis(20)).await.unwrap();
        assert!(first.is_none());

        host.write_all(b":0,0,0>\n").await.unwrap();
        let second = t.readline(Duration::from_millis(200)).await.unwrap();
        assert_eq!(second.as_deref(), Some("<Idle|MPos:0,0,0>"));
    }

    #[tokio::test]
    async fn test_eof_is_device_gone() {
        let (host, device) = tokio::io::duplex(64);
        let mut t = transport(device);
        drop(host);

        let err = t.readline(Duration::from_millis(200)).await.unwrap_err();
        assert!(err.is_device_gone());
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn test_close_persists_state_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = SharedState::load(&path);
        state.update(|s| s.set_machine(4.0, 2.0));

        let (_host, device) = tokio::io::duplex(64);
        let mut t = LineTransport::from_stream(device, TransportKind::Socket, "sim", state);
        t.close().await.unwrap();

        assert!(!t.is_connected());
        let saved = SharedState::load(&path).snapshot();
        assert_eq!(saved.machine_x, 4.0);
        assert!(matches!(t.send("?").await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_available_counts_buffered_bytes() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut t = transport(device);

        host.write_all(b"ok\nok\n").await.unwrap();
        let _ = t.readline(Duration::from_millis(200)).await.unwrap();
        assert_eq!(t.available(), 3);
    }
}
