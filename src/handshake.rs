//! # Authentication Handshake
//!
//! Three messages establish a mutually authenticated session key:
//! 1. Client sends AuthStart with its username and ephemeral public key
//! 2. Server answers with its name, ephemeral public key, certificate and a
//!    signature over the transcript
//! 3. Client verifies the server, then returns its own transcript signature
//!
//! Both sides derive the session key from the ephemeral X25519 exchange.
//! The transcript is `client_eph || server_eph || username`, so a substituted
//! username or replayed ephemeral key breaks both signatures.
//!
//! ## Security Properties
//!
//! - Forward secrecy: ephemeral keys are discarded once the key is derived
//! - Mutual authentication: long-term Ed25519 keys sign the same transcript
//! - Any failure drops all ephemeral material and leaves the state `Failed`

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use x25519_dalek::PublicKey;

use crate::crypto::{
    derive_session_key, parse_ephemeral_public, EphemeralKeyPair, KdfBinding, SessionKey,
};
use crate::error::{ProtocolError, ProtocolResult};
use crate::identity::{Certificate, ClientIdentity, IdentityStore, TrustAnchor};
use crate::signature::{sign, verify, Transcript};
use crate::transport::Transport;
use crate::wire::{MessageType, WireMessage, WireReader, WireWriter};

/// First handshake message, client to server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthStart {
    pub username: String,
    pub ephemeral_public: Vec<u8>,
}

impl WireMessage for AuthStart {
    fn encode(&self, w: &mut WireWriter<'_>) -> ProtocolResult<()> {
        w.put_type(MessageType::AuthStart);
        w.put_field(self.username.as_bytes())?;
        w.put_field(&self.ephemeral_public)
    }

    fn decode(r: &mut WireReader<'_>) -> ProtocolResult<Option<Self>> {
        if r.expect_type(MessageType::AuthStart)?.is_none() {
            return Ok(None);
        }
        let Some(username) = r.field()? else { return Ok(None) };
        let Some(ephemeral_public) = r.field()? else { return Ok(None) };
        Ok(Some(Self {
            username: utf8_field(username, "Username")?,
            ephemeral_public: ephemeral_public.to_vec(),
        }))
    }
}

/// Server's answer carrying its proof of identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthServerAns {
    pub server_name: String,
    pub ephemeral_public: Vec<u8>,
    pub certificate: Vec<u8>,
    pub signature: Vec<u8>,
}

impl WireMessage for AuthServerAns {
    fn encode(&self, w: &mut WireWriter<'_>) -> ProtocolResult<()> {
        w.put_type(MessageType::AuthServerAns);
        w.put_field(self.server_name.as_bytes())?;
        w.put_field(&self.ephemeral_public)?;
        w.put_field(&self.certificate)?;
        w.put_field(&self.signature)
    }

    fn decode(r: &mut WireReader<'_>) -> ProtocolResult<Option<Self>> {
        if r.expect_type(MessageType::AuthServerAns)?.is_none() {
            return Ok(None);
        }
        let Some(server_name) = r.field()? else { return Ok(None) };
        let Some(ephemeral_public) = r.field()? else { return Ok(None) };
        let Some(certificate) = r.field()? else { return Ok(None) };
        let Some(signature) = r.field()? else { return Ok(None) };
        Ok(Some(Self {
            server_name: utf8_field(server_name, "Server name")?,
            ephemeral_public: ephemeral_public.to_vec(),
            certificate: certificate.to_vec(),
            signature: signature.to_vec(),
        }))
    }
}

/// Client's transcript signature, completing the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClientFinish {
    pub signature: Vec<u8>,
}

impl WireMessage for AuthClientFinish {
    fn encode(&self, w: &mut WireWriter<'_>) -> ProtocolResult<()> {
        w.put_type(MessageType::AuthClientFinish);
        w.put_field(&self.signature)
    }

    fn decode(r: &mut WireReader<'_>) -> ProtocolResult<Option<Self>> {
        if r.expect_type(MessageType::AuthClientFinish)?.is_none() {
            return Ok(None);
        }
        let Some(signature) = r.field()? else { return Ok(None) };
        Ok(Some(Self {
            signature: signature.to_vec(),
        }))
    }
}

fn utf8_field(bytes: &[u8], what: &str) -> ProtocolResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ProtocolError::MalformedMessage(format!("{} is not valid UTF-8", what)))
}

/// Handshake state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Client before sending AuthStart
    Init,
    /// Server waiting for AuthStart
    AwaitClientHello,
    /// Client building AuthStart
    SendHello,
    /// Client waiting for AuthServerAns
    AwaitServerResponse,
    /// Server building AuthServerAns
    SendResponse,
    /// Server waiting for AuthClientFinish
    AwaitClientFinish,
    /// Session key derived, peer authenticated
    Established,
    /// Terminal; all ephemeral material discarded
    Failed,
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "Init"),
            Self::AwaitClientHello => write!(f, "AwaitClientHello"),
            Self::SendHello => write!(f, "SendHello"),
            Self::AwaitServerResponse => write!(f, "AwaitServerResponse"),
            Self::SendResponse => write!(f, "SendResponse"),
            Self::AwaitClientFinish => write!(f, "AwaitClientFinish"),
            Self::Established => write!(f, "Established"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

fn check_state(actual: HandshakeState, expected: HandshakeState, to: &str) -> ProtocolResult<()> {
    if actual != expected {
        return Err(ProtocolError::InvalidStateTransition {
            from: actual.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}

/// Result of a successful handshake
#[derive(Debug)]
pub struct Established {
    /// Authenticated peer: the username on the server, the server name on
    /// the client
    pub peer: String,
    pub session_key: SessionKey,
}

/// Server state kept between AuthStart and AuthClientFinish
struct PendingServer {
    transcript: Transcript,
    client_public: PublicKey,
    ephemeral: EphemeralKeyPair,
}

/// Server-side handshake handler
pub struct ServerHandshake<'a> {
    store: &'a IdentityStore,
    kdf: KdfBinding,
    state: HandshakeState,
    pending: Option<PendingServer>,
}

impl<'a> ServerHandshake<'a> {
    pub fn new(store: &'a IdentityStore, kdf: KdfBinding) -> Self {
        Self {
            store,
            kdf,
            state: HandshakeState::AwaitClientHello,
            pending: None,
        }
    }

    /// Validate AuthStart and produce the signed answer.
    ///
    /// The username is checked before any ephemeral key is generated.
    pub fn process_auth_start(&mut self, msg: &AuthStart) -> ProtocolResult<AuthServerAns> {
        check_state(self.state, HandshakeState::AwaitClientHello, "SendResponse")?;
        let result = self.answer(msg);
        self.settle(result, HandshakeState::AwaitClientFinish)
    }

    fn answer(&mut self, msg: &AuthStart) -> ProtocolResult<AuthServerAns> {
        if !self.store.users().contains(&msg.username) {
            return Err(ProtocolError::UnknownUser(msg.username.clone()));
        }
        let client_public = parse_ephemeral_public(&msg.ephemeral_public)?;

        self.state = HandshakeState::SendResponse;
        let ephemeral = EphemeralKeyPair::generate();
        let transcript = Transcript::new(
            client_public.to_bytes(),
            ephemeral.public_bytes(),
            msg.username.as_str(),
        );
        let signature = sign(self.store.server_private_key(), &transcript.to_bytes())?;

        let answer = AuthServerAns {
            server_name: self.store.server_name().to_string(),
            ephemeral_public: ephemeral.public_bytes().to_vec(),
            certificate: self.store.server_certificate_bytes().to_vec(),
            signature: signature.to_bytes().to_vec(),
        };
        self.pending = Some(PendingServer {
            transcript,
            client_public,
            ephemeral,
        });
        Ok(answer)
    }

    /// Verify the client's signature and derive the session key
    pub fn process_client_finish(&mut self, msg: &AuthClientFinish) -> ProtocolResult<Established> {
        check_state(self.state, HandshakeState::AwaitClientFinish, "Established")?;
        let result = match self.pending.take() {
            Some(pending) => self.finish(pending, msg),
            None => Err(ProtocolError::InvalidStateTransition {
                from: self.state.to_string(),
                to: "Established".to_string(),
            }),
        };
        self.settle(result, HandshakeState::Established)
    }

    fn finish(&self, pending: PendingServer, msg: &AuthClientFinish) -> ProtocolResult<Established> {
        let username = pending.transcript.username.clone();
        let client_key = self
            .store
            .users()
            .lookup(&username)
            .ok_or_else(|| ProtocolError::UnknownUser(username.clone()))?;
        if !verify(client_key, &pending.transcript.to_bytes(), &msg.signature) {
            return Err(ProtocolError::VerificationFailure(format!(
                "Client signature for '{}' did not verify",
                username
            )));
        }

        let shared = pending.ephemeral.derive_shared_secret(&pending.client_public)?;
        let session_key = derive_session_key(
            &shared,
            self.kdf,
            &pending.transcript.client_ephemeral,
            &pending.transcript.server_ephemeral,
        )?;
        Ok(Established {
            peer: username,
            session_key,
        })
    }

    fn settle<T>(&mut self, result: ProtocolResult<T>, next: HandshakeState) -> ProtocolResult<T> {
        match result {
            Ok(value) => {
                self.state = next;
                Ok(value)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Discard all ephemeral material and fail the handshake
    pub fn abort(&mut self) {
        self.pending = None;
        self.state = HandshakeState::Failed;
    }

    /// Whether an ephemeral private key is currently held
    pub fn holds_ephemeral(&self) -> bool {
        self.pending.is_some()
    }

    /// Get current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }
}

/// Client-side handshake handler
pub struct ClientHandshake<'a> {
    identity: &'a ClientIdentity,
    trust: &'a dyn TrustAnchor,
    expected_server: String,
    kdf: KdfBinding,
    state: HandshakeState,
    ephemeral: Option<EphemeralKeyPair>,
}

impl<'a> ClientHandshake<'a> {
    pub fn new(
        identity: &'a ClientIdentity,
        trust: &'a dyn TrustAnchor,
        expected_server: impl Into<String>,
        kdf: KdfBinding,
    ) -> Self {
        Self {
            identity,
            trust,
            expected_server: expected_server.into(),
            kdf,
            state: HandshakeState::Init,
            ephemeral: None,
        }
    }

    /// Generate the ephemeral key and build AuthStart
    pub fn start(&mut self) -> ProtocolResult<AuthStart> {
        check_state(self.state, HandshakeState::Init, "SendHello")?;
        self.state = HandshakeState::SendHello;

        let ephemeral = EphemeralKeyPair::generate();
        let msg = AuthStart {
            username: self.identity.username().to_string(),
            ephemeral_public: ephemeral.public_bytes().to_vec(),
        };
        self.ephemeral = Some(ephemeral);
        self.state = HandshakeState::AwaitServerResponse;
        Ok(msg)
    }

    /// Authenticate the server and produce the finishing signature
    pub fn process_server_answer(
        &mut self,
        msg: &AuthServerAns,
    ) -> ProtocolResult<(AuthClientFinish, Established)> {
        check_state(self.state, HandshakeState::AwaitServerResponse, "Established")?;
        let result = match self.ephemeral.take() {
            Some(ephemeral) => self.finish(ephemeral, msg),
            None => Err(ProtocolError::InvalidStateTransition {
                from: self.state.to_string(),
                to: "Established".to_string(),
            }),
        };
        match result {
            Ok(done) => {
                self.state = HandshakeState::Established;
                Ok(done)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn finish(
        &self,
        ephemeral: EphemeralKeyPair,
        msg: &AuthServerAns,
    ) -> ProtocolResult<(AuthClientFinish, Established)> {
        let server_public = parse_ephemeral_public(&msg.ephemeral_public)?;

        let cert = Certificate::from_bytes(&msg.certificate).map_err(|e| {
            ProtocolError::VerificationFailure(format!("Unparseable server certificate: {}", e))
        })?;
        let server_key = self.trust.verify_certificate(&cert)?;
        if cert.subject != msg.server_name {
            return Err(ProtocolError::VerificationFailure(format!(
                "Certificate subject '{}' does not match server name '{}'",
                cert.subject, msg.server_name
            )));
        }
        if cert.subject != self.expected_server {
            return Err(ProtocolError::VerificationFailure(format!(
                "Expected server '{}', got '{}'",
                self.expected_server, cert.subject
            )));
        }

        let transcript = Transcript::new(
            ephemeral.public_bytes(),
            server_public.to_bytes(),
            self.identity.username(),
        );
        let transcript_bytes = transcript.to_bytes();
        if !verify(&server_key, &transcript_bytes, &msg.signature) {
            return Err(ProtocolError::VerificationFailure(
                "Server signature over transcript did not verify".to_string(),
            ));
        }

        let own = sign(self.identity.private_key(), &transcript_bytes)?;
        let shared = ephemeral.derive_shared_secret(&server_public)?;
        let session_key = derive_session_key(
            &shared,
            self.kdf,
            &transcript.client_ephemeral,
            &transcript.server_ephemeral,
        )?;

        Ok((
            AuthClientFinish {
                signature: own.to_bytes().to_vec(),
            },
            Established {
                peer: cert.subject,
                session_key,
            },
        ))
    }

    /// Discard all ephemeral material and fail the handshake
    pub fn abort(&mut self) {
        self.ephemeral = None;
        self.state = HandshakeState::Failed;
    }

    pub fn holds_ephemeral(&self) -> bool {
        self.ephemeral.is_some()
    }

    /// Get current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }
}

/// Run the server side of the handshake over `transport`
pub async fn accept_handshake<S>(
    transport: &mut Transport<S>,
    store: &IdentityStore,
    kdf: KdfBinding,
) -> ProtocolResult<Established>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = ServerHandshake::new(store, kdf);
    let result = drive_server(&mut handshake, transport).await;
    match &result {
        Ok(established) => info!("Handshake complete with user '{}'", established.peer),
        Err(e) => {
            handshake.abort();
            warn!("Server handshake failed: {}", e);
        }
    }
    result
}

async fn drive_server<S>(
    handshake: &mut ServerHandshake<'_>,
    transport: &mut Transport<S>,
) -> ProtocolResult<Established>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start: AuthStart = transport.recv().await?;
    debug!("AuthStart from '{}'", start.username);
    let answer = handshake.process_auth_start(&start)?;
    transport.send(&answer).await?;

    let finish: AuthClientFinish = transport.recv().await?;
    handshake.process_client_finish(&finish)
}

/// Run the client side of the handshake over `transport`
pub async fn initiate_handshake<S>(
    transport: &mut Transport<S>,
    identity: &ClientIdentity,
    trust: &dyn TrustAnchor,
    expected_server: &str,
    kdf: KdfBinding,
) -> ProtocolResult<Established>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = ClientHandshake::new(identity, trust, expected_server, kdf);
    let result = drive_client(&mut handshake, transport).await;
    match &result {
        Ok(established) => info!("Authenticated server '{}'", established.peer),
        Err(e) => {
            handshake.abort();
            warn!("Client handshake failed: {}", e);
        }
    }
    result
}

async fn drive_client<S>(
    handshake: &mut ClientHandshake<'_>,
    transport: &mut Transport<S>,
) -> ProtocolResult<Established>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = handshake.start()?;
    transport.send(&start).await?;

    let answer: AuthServerAns = transport.recv().await?;
    debug!("AuthServerAns from '{}'", answer.server_name);
    let (finish, established) = handshake.process_server_answer(&answer)?;
    transport.send(&finish).await?;
    Ok(established)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use crate::identity::{
        Certificate, CertificateAuthority, ClientIdentity, Identity, IdentityStore,
        RegisteredUsers,
    };

    pub const CA_NAME: &str = "test-ca";
    pub const SERVER_NAME: &str = "fileserver";

    /// Authority, server store and registered client identities in memory
    pub struct World {
        pub authority: CertificateAuthority,
        pub store: IdentityStore,
        pub alice: ClientIdentity,
        pub bob: ClientIdentity,
    }

    pub fn world() -> World {
        let ca_key = SigningKey::generate(&mut OsRng);
        let server_key = SigningKey::generate(&mut OsRng);
        let cert =
            Certificate::issue(SERVER_NAME, &server_key.verifying_key(), CA_NAME, &ca_key).unwrap();

        let alice = ClientIdentity::new("alice", SigningKey::generate(&mut OsRng));
        let bob = ClientIdentity::new("bob", SigningKey::generate(&mut OsRng));
        let users: RegisteredUsers = [
            ("alice".to_string(), alice.identity.public_key),
            ("bob".to_string(), bob.identity.public_key),
        ]
        .into_iter()
        .collect();

        let store = IdentityStore::from_parts(
            users,
            Identity::with_private(SERVER_NAME, server_key),
            cert,
        )
        .unwrap();

        World {
            authority: CertificateAuthority::new(CA_NAME, ca_key.verifying_key()),
            store,
            alice,
            bob,
        }
    }
}
