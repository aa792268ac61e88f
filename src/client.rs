//! # Client
//!
//! Connects to a server, authenticates and issues commands over the secure
//! channel.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::channel::{ChannelStatistics, Frame, SecureChannel};
use crate::command::{Command, Reply};
use crate::config::ProtocolConfig;
use crate::crypto::KdfBinding;
use crate::error::{ProtocolError, ProtocolResult};
use crate::handshake::initiate_handshake;
use crate::identity::{ClientIdentity, TrustAnchor};
use crate::transport::Transport;

/// An authenticated client session
pub struct Client<S = TcpStream> {
    transport: Transport<S>,
    channel: SecureChannel,
    server_name: String,
}

impl Client<TcpStream> {
    /// Connect over TCP and run the handshake
    pub async fn connect(
        addr: SocketAddr,
        identity: &ClientIdentity,
        trust: &dyn TrustAnchor,
        expected_server: &str,
        config: &ProtocolConfig,
    ) -> ProtocolResult<Self> {
        info!("Connecting to {}", addr);
        let transport = Transport::connect(addr, config).await?;
        Self::establish(transport, identity, trust, expected_server, config.kdf_binding).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    /// Run the handshake over an existing transport
    pub async fn establish(
        mut transport: Transport<S>,
        identity: &ClientIdentity,
        trust: &dyn TrustAnchor,
        expected_server: &str,
        kdf: KdfBinding,
    ) -> ProtocolResult<Self> {
        let established =
            initiate_handshake(&mut transport, identity, trust, expected_server, kdf).await?;
        Ok(Self {
            transport,
            channel: SecureChannel::new(established.session_key),
            server_name: established.peer,
        })
    }

    /// Name of the authenticated server
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Rename a file in the user's server-side directory
    pub async fn rename(&mut self, old: &str, new: &str) -> ProtocolResult<()> {
        debug!("Requesting rename '{}' -> '{}'", old, new);
        let reply = self
            .request(&Command::Rename {
                old: old.to_string(),
                new: new.to_string(),
            })
            .await?;
        reply.into_result()
    }

    /// End the session. The channel is closed whatever the server answers.
    pub async fn logout(mut self) -> ProtocolResult<ChannelStatistics> {
        let reply = self.request(&Command::Logout).await;
        self.channel.close();
        reply?.into_result()?;
        let stats = self.channel.statistics();
        info!("Logged out from '{}' ({})", self.server_name, stats);
        // Server may already have hung up
        let _ = self.transport.shutdown().await;
        Ok(stats)
    }

    pub fn statistics(&self) -> ChannelStatistics {
        self.channel.statistics()
    }

    async fn request(&mut self, command: &Command) -> ProtocolResult<Reply> {
        let frame = command.seal(&mut self.channel)?;
        self.transport.send(&frame).await?;

        let frame: Frame = self.transport.recv().await?;
        let opened = self.channel.open(&frame)?;
        let reply = Reply::from_opened(&opened)?;

        let expected = Reply::answer_type(command.message_type())?;
        if reply.message_type != expected {
            return Err(ProtocolError::UnexpectedMessage {
                expected,
                actual: reply.message_type,
            });
        }
        Ok(reply)
    }
}
