// Modbus/TCP transport for the drive controllers
//
// Framing is handled by tokio-modbus. Holding register reads/writes use the
// standard client calls; Read Exception Status (0x07) goes through a custom
// request since the client has no dedicated call for it.

use async_trait::async_trait;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;
use tokio_modbus::client::{Client, Context, Reader, Writer, tcp};
use tokio_modbus::slave::Slave;
use tokio_modbus::{ExceptionCode, Request, Response};
use tracing::debug;

/// Default Modbus/TCP port
pub const DEFAULT_PORT: u16 = 502;
/// Default per-request I/O timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Function codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    ReadExceptionStatus = 0x07,
    ReadHoldingRegisters = 0x03,
    WriteMultipleRegisters = 0x10,
}

/// Error types for fieldbus communication
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Modbus error: {0}")]
    Modbus(#[from] tokio_modbus::Error),

    #[error("Timeout waiting for response from {peer}")]
    Timeout { peer: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Modbus exception {code} for function 0x{function:02X}")]
    Exception { function: u8, code: ExceptionCode },

    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String },
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Generic register transport to one drive controller
#[async_trait]
pub trait Transport: Send {
    /// Open the connection
    async fn connect(&mut self) -> Result<()>;

    /// Read `count` holding registers starting at `address`
    async fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>>;

    /// Write `words` to consecutive holding registers starting at `address`
    async fn write_registers(&mut self, address: u16, words: &[u16]) -> Result<()>;

    /// Read the latched exception status byte
    async fn read_exception_status(&mut self) -> Result<u8>;

    /// Release the connection
    async fn close(&mut self);
}

/// Modbus/TCP client for a single unit
pub struct ModbusTcpClient {
    peer: String,
    unit_id: u8,
    io_timeout: Duration,
    ctx: Option<Context>,
}

impl ModbusTcpClient {
    /// Create a client for `peer` ("host" or "host:port"); does not connect yet
    pub fn new(peer: impl Into<String>, unit_id: u8) -> Self {
        Self::with_timeout(peer, unit_id, Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }

    /// Create with a custom I/O timeout
    pub fn with_timeout(peer: impl Into<String>, unit_id: u8, io_timeout: Duration) -> Self {
        let mut peer = peer.into();
        if !peer.contains(':') {
            peer = format!("{}:{}", peer, DEFAULT_PORT);
        }
        Self {
            peer,
            unit_id,
            io_timeout,
            ctx: None,
        }
    }

    /// Peer address including the port
    pub fn peer(&self) -> &str {
        &self.peer
    }

    async fn resolve(peer: &str) -> Result<SocketAddr> {
        tokio::net::lookup_host(peer)
            .await?
            .next()
            .ok_or_else(|| TransportError::InvalidResponse {
                reason: format!("No address found for {}", peer),
            })
    }

    fn context(&mut self) -> Result<&mut Context> {
        self.ctx.as_mut().ok_or(TransportError::NotConnected)
    }

    /// Unwrap the timeout, transport and exception layers of one request
    fn finish<T>(
        &self,
        function: FunctionCode,
        outcome: std::result::Result<tokio_modbus::Result<T>, Elapsed>,
    ) -> Result<T> {
        let response = outcome.map_err(|_| TransportError::Timeout {
            peer: self.peer.clone(),
        })??;
        response.map_err(|code| TransportError::Exception {
            function: function as u8,
            code,
        })
    }
}

#[async_trait]
impl Transport for ModbusTcpClient {
    async fn connect(&mut self) -> Result<()> {
        debug!("Connecting to {}", self.peer);
        let addr = Self::resolve(&self.peer).await?;
        let ctx = timeout(self.io_timeout, tcp::connect_slave(addr, Slave(self.unit_id)))
            .await
            .map_err(|_| TransportError::Timeout {
                peer: self.peer.clone(),
            })??;
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let io_timeout = self.io_timeout;
        let ctx = self.context()?;
        let outcome = timeout(io_timeout, ctx.read_holding_registers(address, count)).await;
        let words = self.finish(FunctionCode::ReadHoldingRegisters, outcome)?;

        if words.len() != count as usize {
            return Err(TransportError::InvalidResponse {
                reason: format!("Expected {} registers, got {}", count, words.len()),
            });
        }
        Ok(words)
    }

    async fn write_registers(&mut self, address: u16, words: &[u16]) -> Result<()> {
        debug!(
            "Write {} registers at 0x{:04X}: {:04X?}",
            words.len(),
            address,
            words
        );
        let io_timeout = self.io_timeout;
        let ctx = self.context()?;
        let outcome = timeout(io_timeout, ctx.write_multiple_registers(address, words)).await;
        self.finish(FunctionCode::WriteMultipleRegisters, outcome)
    }

    async fn read_exception_status(&mut self) -> Result<u8> {
        let function = FunctionCode::ReadExceptionStatus as u8;
        let io_timeout = self.io_timeout;
        let ctx = self.context()?;
        let request = Request::Custom(function, Cow::Borrowed(&[]));
        let outcome = timeout(io_timeout, ctx.call(request)).await;

        match self.finish(FunctionCode::ReadExceptionStatus, outcome)? {
            Response::Custom(code, data) if code == function => {
                data.first()
                    .copied()
                    .ok_or_else(|| TransportError::InvalidResponse {
                        reason: "Missing exception status byte".to_string(),
                    })
            }
            other => Err(TransportError::InvalidResponse {
                reason: format!("Unexpected response: {:?}", other),
            }),
        }
    }

    async fn close(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            let _ = ctx.disconnect().await;
            debug!("Closed connection to {}", self.peer);
        }
    }
}
