//! # Server
//!
//! Accepts connections, authenticates each client and serves its commands
//! until logout. Every connection runs in its own task against a shared
//! read-only [`ServerContext`].

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::channel::{Frame, SecureChannel};
use crate::command::{validate_filename, Command, Reply};
use crate::config::{Config, ProtocolConfig};
use crate::error::{ProtocolError, ProtocolResult};
use crate::handshake::accept_handshake;
use crate::identity::IdentityStore;
use crate::transport::{Transport, TransportListener};

/// Executes authenticated commands on behalf of a user
pub trait CommandHandler: Send + Sync {
    /// Rename `old` to `new` for `user`. The error string is sent back to
    /// the client.
    fn rename(&self, user: &str, old: &str, new: &str) -> Result<(), String>;
}

/// Renames files inside `<root>/<user>/`
#[derive(Debug, Clone)]
pub struct UserDirectoryHandler {
    root: PathBuf,
}

impl UserDirectoryHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl CommandHandler for UserDirectoryHandler {
    fn rename(&self, user: &str, old: &str, new: &str) -> Result<(), String> {
        validate_filename(user)?;
        validate_filename(old)?;
        validate_filename(new)?;

        let dir = self.root.join(user);
        let from = dir.join(old);
        let to = dir.join(new);
        if !from.is_file() {
            return Err(format!("file '{}' not found", old));
        }
        if to.exists() {
            return Err(format!("file '{}' already exists", new));
        }
        fs::rename(&from, &to).map_err(|e| format!("rename failed: {}", e))
    }
}

/// Shared server state
pub struct ServerContext {
    pub identity: IdentityStore,
    pub protocol: ProtocolConfig,
    pub handler: Arc<dyn CommandHandler>,
}

impl ServerContext {
    pub fn new(
        identity: IdentityStore,
        protocol: ProtocolConfig,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            identity,
            protocol,
            handler,
        }
    }

    /// Load the identity store and set up per-user storage from `config`
    pub fn from_config(config: &Config) -> ProtocolResult<Self> {
        let identity = IdentityStore::load(&config.server.identity_dir, &config.server.users)?;
        if identity.server_name() != config.server.name {
            return Err(ProtocolError::ConfigError(format!(
                "Configured server name '{}' does not match certificate subject '{}'",
                config.server.name,
                identity.server_name()
            )));
        }
        let cert_len = identity.server_certificate_bytes().len();
        if cert_len > config.protocol.max_field_len {
            return Err(ProtocolError::ConfigError(format!(
                "Server certificate is {} bytes, above max_field_len {}",
                cert_len, config.protocol.max_field_len
            )));
        }
        let handler = UserDirectoryHandler::new(&config.server.storage_root);
        Ok(Self::new(
            identity,
            config.protocol.clone(),
            Arc::new(handler),
        ))
    }
}

/// Authenticate the peer on `transport` and serve its commands until logout.
///
/// Returns the authenticated username.
pub async fn serve_connection<S>(
    transport: &mut Transport<S>,
    ctx: &ServerContext,
) -> ProtocolResult<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let established =
        accept_handshake(transport, &ctx.identity, ctx.protocol.kdf_binding).await?;
    let user = established.peer;
    let mut channel = SecureChannel::new(established.session_key);

    loop {
        let frame: Frame = transport.recv().await?;
        let opened = channel.open(&frame)?;
        let answer_type = Reply::answer_type(opened.message_type)?;

        let reply = match Command::from_opened(&opened)? {
            Command::Rename { old, new } => {
                debug!("Rename request from '{}': '{}' -> '{}'", user, old, new);
                match ctx.handler.rename(&user, &old, &new) {
                    Ok(()) => {
                        info!("Rename for '{}' succeeded", user);
                        Reply::ok(answer_type)
                    }
                    Err(reason) => {
                        warn!("Rename for '{}' rejected: {}", user, reason);
                        Reply::error(answer_type, reason)
                    }
                }
            }
            Command::Logout => {
                let frame = Reply::ok(answer_type).seal(&mut channel)?;
                transport.send(&frame).await?;
                channel.close();
                info!("User '{}' logged out ({})", user, channel.statistics());
                return Ok(user);
            }
        };

        let frame = reply.seal(&mut channel)?;
        transport.send(&frame).await?;
    }
}

/// Pause after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections forever, one task per connection.
///
/// A failed accept or a failed connection never stops the loop.
pub async fn run(listener: TransportListener, ctx: Arc<ServerContext>) -> ProtocolResult<()> {
    info!(
        "Server '{}' listening on {}",
        ctx.identity.server_name(),
        listener.local_addr()
    );

    loop {
        let (mut transport, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept error: {}", e);
                // Keeps a persistent failure such as EMFILE from spinning
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        info!("New connection from {}", addr);

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            match serve_connection(&mut transport, &ctx).await {
                Ok(user) => info!("Connection from {} ({}) closed", addr, user),
                Err(ProtocolError::ConnectionClosed) => {
                    info!("Connection from {} closed by peer", addr)
                }
                Err(e) if e.is_authentication() => {
                    warn!("Rejected connection from {}: {}", addr, e)
                }
                Err(e) => error!("Connection error from {}: {}", addr, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::command::ReplyStatus;
    use crate::handshake::fixtures::{world, SERVER_NAME};
    use crate::handshake::initiate_handshake;
    use crate::identity::provision;
    use crate::wire::MessageType;
    use crate::MIN_FIELD_LEN;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    /// Records every rename and refuses names starting with "locked"
    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<(String, String, String)>>,
    }

    impl CommandHandler for RecordingHandler {
        fn rename(&self, user: &str, old: &str, new: &str) -> Result<(), String> {
            self.calls
                .lock()
                .unwrap()
                .push((user.to_string(), old.to_string(), new.to_string()));
            if old.starts_with("locked") {
                return Err("file is locked".to_string());
            }
            Ok(())
        }
    }

    #[test]
    fn test_user_directory_rename() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("alice")).unwrap();
        fs::write(root.path().join("alice/old.txt"), b"data").unwrap();

        let handler = UserDirectoryHandler::new(root.path());
        handler.rename("alice", "old.txt", "new.txt").unwrap();
        assert!(root.path().join("alice/new.txt").is_file());
        assert!(!root.path().join("alice/old.txt").exists());

        assert!(handler.rename("alice", "old.txt", "x.txt").is_err());
        assert!(handler.rename("alice", "new.txt", "../escape.txt").is_err());
        // Other users' files are out of reach
        assert!(handler.rename("bob", "new.txt", "x.txt").is_err());
    }

    #[test]
    fn test_rename_refuses_overwrite() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("alice")).unwrap();
        fs::write(root.path().join("alice/a"), b"1").unwrap();
        fs::write(root.path().join("alice/b"), b"2").unwrap();

        let handler = UserDirectoryHandler::new(root.path());
        assert!(handler.rename("alice", "a", "b").is_err());
        assert_eq!(fs::read(root.path().join("alice/b")).unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_serve_rename_and_logout() {
        let w = world();
        let handler = Arc::new(RecordingHandler::default());
        let cfg = ProtocolConfig::default();
        let authority = w.authority.clone();
        let alice = w.alice.clone();
        let ctx = ServerContext::new(w.store, cfg.clone(), handler.clone());

        let (a, b) = tokio::io::duplex(4096);
        let mut client_transport = Transport::new(a, &cfg);
        let mut server_transport = Transport::new(b, &cfg);

        let client = async {
            let established = initiate_handshake(
                &mut client_transport,
                &alice,
                &authority,
                SERVER_NAME,
                cfg.kdf_binding,
            )
            .await
            .unwrap();
            let mut channel = SecureChannel::new(established.session_key);

            let mut statuses = Vec::new();
            for cmd in [
                Command::Rename {
                    old: "old.txt".to_string(),
                    new: "new.txt".to_string(),
                },
                Command::Rename {
                    old: "locked.txt".to_string(),
                    new: "x.txt".to_string(),
                },
                Command::Logout,
            ] {
                let frame = cmd.seal(&mut channel).unwrap();
                client_transport.send(&frame).await.unwrap();
                let frame: Frame = client_transport.recv().await.unwrap();
                let reply = Reply::from_opened(&channel.open(&frame).unwrap()).unwrap();
                statuses.push((reply.message_type, reply.status));
            }
            statuses
        };

        let (statuses, served) = tokio::join!(client, serve_connection(&mut server_transport, &ctx));
        assert_eq!(served.unwrap(), "alice");
        assert_eq!(
            statuses,
            vec![
                (MessageType::RenameAns, ReplyStatus::Ok),
                (MessageType::RenameAns, ReplyStatus::Error),
                (MessageType::LogoutAns, ReplyStatus::Ok),
            ]
        );

        let calls = handler.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            (
                "alice".to_string(),
                "old.txt".to_string(),
                "new.txt".to_string()
            )
        );
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn test_replayed_frame_ends_connection() {
        let w = world();
        let handler = Arc::new(RecordingHandler::default());
        let cfg = ProtocolConfig::default();
        let authority = w.authority.clone();
        let alice = w.alice.clone();
        let ctx = ServerContext::new(w.store, cfg.clone(), handler.clone());

        let (a, b) = tokio::io::duplex(4096);
        let mut client_transport = Transport::new(a, &cfg);
        let mut server_transport = Transport::new(b, &cfg);

        let client = async {
            let established = initiate_handshake(
                &mut client_transport,
                &alice,
                &authority,
                SERVER_NAME,
                cfg.kdf_binding,
            )
            .await
            .unwrap();
            let mut channel = SecureChannel::new(established.session_key);
            let frame = Command::Rename {
                old: "old.txt".to_string(),
                new: "new.txt".to_string(),
            }
            .seal(&mut channel)
            .unwrap();
            client_transport.send(&frame).await.unwrap();
            let _: Frame = client_transport.recv().await.unwrap();
            // Same frame again
            client_transport.send(&frame).await.unwrap();
        };

        let (_, served) = tokio::join!(client, serve_connection(&mut server_transport, &ctx));
        assert!(matches!(
            served,
            Err(ProtocolError::ReplayOrReorder {
                expected: 1,
                received: 0
            })
        ));
        assert_eq!(handler.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_survives_broken_connection() {
        let w = world();
        let handler = Arc::new(RecordingHandler::default());
        let cfg = ProtocolConfig::default();
        let authority = w.authority.clone();
        let alice = w.alice.clone();
        let ctx = Arc::new(ServerContext::new(w.store, cfg.clone(), handler.clone()));

        let listener = TransportListener::bind("127.0.0.1:0".parse().unwrap(), cfg.clone())
            .await
            .unwrap();
        let addr = listener.local_addr();
        let server = tokio::spawn(run(listener, ctx));

        // Unknown message type, then hang up
        let mut junk = TcpStream::connect(addr).await.unwrap();
        junk.write_all(&[0x7f, 0x00, 0x02, 0xde, 0xad]).await.unwrap();
        drop(junk);

        // Connect and drop before sending anything
        drop(TcpStream::connect(addr).await.unwrap());

        let mut client = Client::connect(addr, &alice, &authority, SERVER_NAME, &cfg)
            .await
            .unwrap();
        client.rename("old.txt", "new.txt").await.unwrap();
        client.logout().await.unwrap();

        assert_eq!(
            handler.calls.lock().unwrap().as_slice(),
            &[(
                "alice".to_string(),
                "old.txt".to_string(),
                "new.txt".to_string()
            )]
        );
        assert!(!server.is_finished());
        server.abort();
    }

    #[test]
    fn test_certificate_over_field_limit_refused() {
        let dir = TempDir::new().unwrap();
        let name = "s".repeat(MIN_FIELD_LEN + 1);
        provision(dir.path(), "test-ca", &name, &["alice"]).unwrap();

        let mut config = Config::default();
        config.server.name = name;
        config.server.identity_dir = dir.path().to_path_buf();
        config.server.users = vec!["alice".to_string()];
        config.server.storage_root = dir.path().join("storage");
        config.protocol.max_field_len = MIN_FIELD_LEN;

        assert!(matches!(
            ServerContext::from_config(&config),
            Err(ProtocolError::ConfigError(_))
        ));

        config.protocol.max_field_len = crate::MAX_FIELD_LEN;
        assert!(ServerContext::from_config(&config).is_ok());
    }
}
