//! # Transport Layer
//!
//! Async stream transport with bounded message reading/writing.
//! Works over TCP in the binaries and over in-memory pipes in tests.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::warn;

use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, ProtocolResult};
use crate::wire::{MessageDecoder, MessageType, WireMessage};

/// Default read buffer size
const READ_BUFFER_SIZE: usize = 8192;

/// Connection timeout
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport connection wrapping a byte stream
pub struct Transport<S = TcpStream> {
    /// The underlying stream
    stream: S,
    /// Message decoder for reading
    decoder: MessageDecoder,
    /// Read buffer
    read_buffer: Vec<u8>,
    max_field_len: usize,
    read_timeout: Duration,
    write_timeout: Duration,
    /// Bytes sent
    bytes_sent: u64,
    /// Bytes received
    bytes_received: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    /// Create a transport from an existing stream
    pub fn new(stream: S, config: &ProtocolConfig) -> Self {
        Self {
            stream,
            decoder: MessageDecoder::new(config.max_field_len),
            read_buffer: vec![0u8; READ_BUFFER_SIZE],
            max_field_len: config.max_field_len,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Get bytes sent
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Get bytes received
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Send a message
    pub async fn send<M: WireMessage>(&mut self, msg: &M) -> ProtocolResult<()> {
        let bytes = msg.to_bytes(self.max_field_len)?;

        timeout(self.write_timeout, self.stream.write_all(&bytes))
            .await
            .map_err(|_| ProtocolError::Timeout(self.write_timeout.as_secs()))??;

        self.bytes_sent += bytes.len() as u64;

        Ok(())
    }

    /// Receive a message of type `M`
    pub async fn recv<M: WireMessage>(&mut self) -> ProtocolResult<M> {
        loop {
            // Try to decode from buffered data first
            if let Some(msg) = self.decoder.decode::<M>()? {
                return Ok(msg);
            }
            self.fill().await?;
        }
    }

    /// Wait for the next message and report its type without consuming it
    pub async fn peek_type(&mut self) -> ProtocolResult<MessageType> {
        loop {
            if let Some(message_type) = self.decoder.peek_type()? {
                return Ok(message_type);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> ProtocolResult<()> {
        let n = timeout(self.read_timeout, self.stream.read(&mut self.read_buffer))
            .await
            .map_err(|_| ProtocolError::Timeout(self.read_timeout.as_secs()))??;

        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }

        self.bytes_received += n as u64;
        self.decoder.push(&self.read_buffer[..n]);
        Ok(())
    }

    /// Shutdown the connection
    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Get a mutable reference to the underlying stream
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl Transport<TcpStream> {
    /// Connect to a remote address
    pub async fn connect(addr: SocketAddr, config: &ProtocolConfig) -> ProtocolResult<Self> {
        let stream = timeout(CONNECTION_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(CONNECTION_TIMEOUT.as_secs()))??;

        stream.set_nodelay(true)?;

        Ok(Self::new(stream, config))
    }

    /// Get the peer address
    pub fn peer_addr(&self) -> ProtocolResult<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Get transport statistics
    pub fn stats(&self) -> ProtocolResult<TransportStats> {
        Ok(TransportStats {
            peer_addr: self.stream.peer_addr()?,
            local_addr: self.stream.local_addr()?,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
        })
    }
}

/// TCP listener wrapper
pub struct TransportListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ProtocolConfig,
}

impl TransportListener {
    /// Bind to an address
    pub async fn bind(addr: SocketAddr, config: ProtocolConfig) -> ProtocolResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            config,
        })
    }

    /// Get the local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept a new connection
    ///
    /// A failure to tune the accepted socket is logged, not returned.
    pub async fn accept(&self) -> ProtocolResult<(Transport, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }
        Ok((Transport::new(stream, &self.config), addr))
    }
}

/// Transport statistics
#[derive(Debug, Clone)]
pub struct TransportStats {
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl std::fmt::Display for TransportStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}: sent={} bytes, recv={} bytes",
            self.local_addr, self.peer_addr, self.bytes_sent, self.bytes_received
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Frame;
    use crate::handshake::AuthClientFinish;

    fn config() -> ProtocolConfig {
        ProtocolConfig::default()
    }

    #[tokio::test]
    async fn test_transport_echo() {
        let listener = TransportListener::bind("127.0.0.1:0".parse().unwrap(), config())
            .await
            .unwrap();
        let addr = listener.local_addr();

        let server_handle = tokio::spawn(async move {
            let (mut transport, _) = listener.accept().await.unwrap();
            let msg: AuthClientFinish = transport.recv().await.unwrap();
            transport.send(&msg).await.unwrap();
        });

        let mut client = Transport::connect(addr, &config()).await.unwrap();
        let msg = AuthClientFinish {
            signature: vec![0x5a; 64],
        };
        client.send(&msg).await.unwrap();

        let echo: AuthClientFinish = client.recv().await.unwrap();
        assert_eq!(echo, msg);
        assert!(client.stats().unwrap().bytes_received > 0);

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let (a, b) = tokio::io::duplex(1024);
        drop(b);
        let mut transport = Transport::new(a, &config());
        assert!(matches!(
            transport.recv::<Frame>().await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (a, _b) = tokio::io::duplex(1024);
        let cfg = ProtocolConfig {
            read_timeout_secs: 0,
            ..ProtocolConfig::default()
        };
        let mut transport = Transport::new(a, &cfg);
        assert!(matches!(
            transport.recv::<Frame>().await,
            Err(ProtocolError::Timeout(0))
        ));
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = Transport::new(a, &config());
        let mut reader = Transport::new(b, &config());
        let msg = AuthClientFinish {
            signature: vec![1; 64],
        };
        writer.send(&msg).await.unwrap();

        assert_eq!(
            reader.peek_type().await.unwrap(),
            MessageType::AuthClientFinish
        );
        assert_eq!(reader.recv::<AuthClientFinish>().await.unwrap(), msg);
    }
}
