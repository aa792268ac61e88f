//! # Identity Store
//!
//! Long-term Ed25519 identities loaded once at startup and read-only after.
//!
//! ## Directory Layout
//!
//! ```text
//! certificates/
//!   alice.pub     hex public key of every registered user
//!   server.crt    hex bincode certificate of the server
//!   server.key    hex secret key of the server
//!   ca.pub        trust anchor public key (clients)
//!   alice.key     hex secret key of a client
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{ProtocolError, ProtocolResult};
use crate::signature::SIGNATURE_SIZE;

/// Certificate file name inside the identity directory
pub const SERVER_CERT_FILE: &str = "server.crt";
/// Server private key file name
pub const SERVER_KEY_FILE: &str = "server.key";
/// Trust anchor file name
pub const CA_PUBLIC_FILE: &str = "ca.pub";

/// A named long-term identity
#[derive(Clone)]
pub struct Identity {
    pub name: String,
    pub public_key: VerifyingKey,
    private_key: Option<SigningKey>,
}

impl Identity {
    pub fn public_only(name: impl Into<String>, public_key: VerifyingKey) -> Self {
        Self {
            name: name.into(),
            public_key,
            private_key: None,
        }
    }

    pub fn with_private(name: impl Into<String>, private_key: SigningKey) -> Self {
        Self {
            name: name.into(),
            public_key: private_key.verifying_key(),
            private_key: Some(private_key),
        }
    }

    pub fn private_key(&self) -> Option<&SigningKey> {
        self.private_key.as_ref()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("name", &self.name)
            .field("public_key", &hex::encode(self.public_key.as_bytes()))
            .field("has_private_key", &self.private_key.is_some())
            .finish()
    }
}

/// Username to public key mapping, exact-match lookup only
#[derive(Debug, Clone, Default)]
pub struct RegisteredUsers {
    users: HashMap<String, VerifyingKey>,
}

impl RegisteredUsers {
    pub fn lookup(&self, username: &str) -> Option<&VerifyingKey> {
        self.users.get(username)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl FromIterator<(String, VerifyingKey)> for RegisteredUsers {
    fn from_iter<I: IntoIterator<Item = (String, VerifyingKey)>>(iter: I) -> Self {
        Self {
            users: iter.into_iter().collect(),
        }
    }
}

/// Signed body of a certificate
#[derive(Serialize)]
struct CertificateBody<'a> {
    subject: &'a str,
    public_key: &'a [u8; 32],
    issuer: &'a str,
}

/// Proof of the server's long-term identity, issued by a certificate authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub subject: String,
    pub public_key: [u8; 32],
    pub issuer: String,
    pub signature: Vec<u8>,
}

impl Certificate {
    /// Issue a certificate for `subject` signed by the authority key
    pub fn issue(
        subject: impl Into<String>,
        public_key: &VerifyingKey,
        issuer: impl Into<String>,
        issuer_key: &SigningKey,
    ) -> ProtocolResult<Self> {
        let mut cert = Self {
            subject: subject.into(),
            public_key: public_key.to_bytes(),
            issuer: issuer.into(),
            signature: Vec::new(),
        };
        let body = cert.body_bytes()?;
        cert.signature = issuer_key.sign(&body).to_bytes().to_vec();
        Ok(cert)
    }

    fn body_bytes(&self) -> ProtocolResult<Vec<u8>> {
        Ok(bincode::serialize(&CertificateBody {
            subject: &self.subject,
            public_key: &self.public_key,
            issuer: &self.issuer,
        })?)
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| e.into())
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> ProtocolResult<Self> {
        bincode::deserialize(data).map_err(|e| e.into())
    }

    /// The subject's public key
    pub fn subject_key(&self) -> ProtocolResult<VerifyingKey> {
        VerifyingKey::from_bytes(&self.public_key).map_err(|e| {
            ProtocolError::VerificationFailure(format!("Invalid certificate key: {}", e))
        })
    }
}

/// Validates a peer certificate and yields the key it vouches for
pub trait TrustAnchor: Send + Sync {
    fn verify_certificate(&self, cert: &Certificate) -> ProtocolResult<VerifyingKey>;
}

/// Trust anchor backed by a single Ed25519 authority key
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    pub name: String,
    pub public_key: VerifyingKey,
}

impl CertificateAuthority {
    pub fn new(name: impl Into<String>, public_key: VerifyingKey) -> Self {
        Self {
            name: name.into(),
            public_key,
        }
    }

    /// Load the authority key from `ca.pub` in an identity directory
    pub fn load(dir: &Path, name: impl Into<String>) -> ProtocolResult<Self> {
        let public_key = read_public_key(&dir.join(CA_PUBLIC_FILE))?;
        Ok(Self::new(name, public_key))
    }
}

impl TrustAnchor for CertificateAuthority {
    fn verify_certificate(&self, cert: &Certificate) -> ProtocolResult<VerifyingKey> {
        if cert.issuer != self.name {
            return Err(ProtocolError::VerificationFailure(format!(
                "Certificate issued by unknown authority '{}'",
                cert.issuer
            )));
        }
        let raw: [u8; SIGNATURE_SIZE] = cert.signature.as_slice().try_into().map_err(|_| {
            ProtocolError::VerificationFailure("Certificate signature has wrong length".to_string())
        })?;
        let body = cert.body_bytes()?;
        self.public_key
            .verify(&body, &Signature::from_bytes(&raw))
            .map_err(|_| {
                ProtocolError::VerificationFailure("Certificate signature invalid".to_string())
            })?;
        cert.subject_key()
    }
}

/// Server-side trust configuration: registered users plus the server identity
pub struct IdentityStore {
    users: RegisteredUsers,
    server: Identity,
    certificate: Certificate,
    certificate_bytes: Vec<u8>,
}

impl IdentityStore {
    /// Load every registered user's key and the server's certificate and
    /// private key from `dir`.
    ///
    /// Fails if anything is missing or unparseable; the server must not start
    /// with partial trust configuration.
    pub fn load<S: AsRef<str>>(dir: &Path, usernames: &[S]) -> ProtocolResult<Self> {
        let mut users = HashMap::with_capacity(usernames.len());
        for user in usernames {
            let user = user.as_ref();
            let path = dir.join(format!("{}.pub", user));
            let key = read_public_key(&path)?;
            debug!("Loaded public key for {} from {}", user, path.display());
            users.insert(user.to_string(), key);
        }

        let cert_path = dir.join(SERVER_CERT_FILE);
        let certificate_bytes = read_hex_file(&cert_path)?;
        let certificate = Certificate::from_bytes(&certificate_bytes)
            .map_err(|e| ProtocolError::identity_load(&cert_path, e))?;

        let key_path = dir.join(SERVER_KEY_FILE);
        let private_key = read_signing_key(&key_path)?;
        if private_key.verifying_key().to_bytes() != certificate.public_key {
            return Err(ProtocolError::identity_load(
                &key_path,
                "private key does not match the certificate",
            ));
        }

        let server = Identity::with_private(certificate.subject.clone(), private_key);
        info!(
            "Identity store loaded: server '{}', {} registered users",
            server.name,
            users.len()
        );

        Ok(Self {
            users: RegisteredUsers { users },
            server,
            certificate,
            certificate_bytes,
        })
    }

    /// Build a store from in-memory parts
    pub fn from_parts(
        users: RegisteredUsers,
        server: Identity,
        certificate: Certificate,
    ) -> ProtocolResult<Self> {
        let certificate_bytes = certificate.to_bytes()?;
        Ok(Self {
            users,
            server,
            certificate,
            certificate_bytes,
        })
    }

    pub fn users(&self) -> &RegisteredUsers {
        &self.users
    }

    pub fn server_name(&self) -> &str {
        &self.server.name
    }

    pub fn server_certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Encoded certificate, transmitted verbatim
    pub fn server_certificate_bytes(&self) -> &[u8] {
        &self.certificate_bytes
    }

    pub fn server_private_key(&self) -> Option<&SigningKey> {
        self.server.private_key()
    }
}

/// A client's own long-term identity
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub identity: Identity,
}

impl ClientIdentity {
    pub fn new(username: impl Into<String>, private_key: SigningKey) -> Self {
        Self {
            identity: Identity::with_private(username, private_key),
        }
    }

    /// Load `<username>.key` from an identity directory
    pub fn load(dir: &Path, username: &str) -> ProtocolResult<Self> {
        let key = read_signing_key(&dir.join(format!("{}.key", username)))?;
        Ok(Self::new(username, key))
    }

    pub fn username(&self) -> &str {
        &self.identity.name
    }

    pub fn private_key(&self) -> Option<&SigningKey> {
        self.identity.private_key()
    }
}

fn read_hex_file(path: &Path) -> ProtocolResult<Vec<u8>> {
    let content = fs::read_to_string(path).map_err(|e| ProtocolError::identity_load(path, e))?;
    hex::decode(content.trim()).map_err(|e| ProtocolError::identity_load(path, e))
}

fn read_key_bytes(path: &Path) -> ProtocolResult<Zeroizing<[u8; 32]>> {
    let bytes = Zeroizing::new(read_hex_file(path)?);
    let raw: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| ProtocolError::identity_load(path, "key must be 32 bytes"))?;
    Ok(Zeroizing::new(raw))
}

/// Read a hex-encoded Ed25519 public key
pub fn read_public_key(path: &Path) -> ProtocolResult<VerifyingKey> {
    let raw = read_key_bytes(path)?;
    VerifyingKey::from_bytes(&*raw).map_err(|e| ProtocolError::identity_load(path, e))
}

/// Read a hex-encoded Ed25519 secret key
pub fn read_signing_key(path: &Path) -> ProtocolResult<SigningKey> {
    let raw = read_key_bytes(path)?;
    Ok(SigningKey::from_bytes(&*raw))
}

fn write_hex_file(path: &Path, bytes: &[u8], secret: bool) -> ProtocolResult<()> {
    let encoded = Zeroizing::new(hex::encode(bytes));
    fs::write(path, encoded.as_bytes()).map_err(|e| ProtocolError::identity_load(path, e))?;
    #[cfg(unix)]
    if secret {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| ProtocolError::identity_load(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = secret;
    Ok(())
}

/// Write a hex-encoded Ed25519 public key
pub fn write_public_key(path: &Path, key: &VerifyingKey) -> ProtocolResult<()> {
    write_hex_file(path, key.as_bytes(), false)
}

/// Write a hex-encoded Ed25519 secret key (mode 0600 on unix)
pub fn write_signing_key(path: &Path, key: &SigningKey) -> ProtocolResult<()> {
    let raw = Zeroizing::new(key.to_bytes());
    write_hex_file(path, &raw[..], true)
}

/// Write a hex-encoded certificate
pub fn write_certificate(path: &Path, cert: &Certificate) -> ProtocolResult<()> {
    write_hex_file(path, &cert.to_bytes()?, false)
}

/// Generate a complete identity directory: an authority, a server identity
/// certified by it and one key pair per user.
///
/// Returns the paths written.
pub fn provision<S: AsRef<str>>(
    dir: &Path,
    authority_name: &str,
    server_name: &str,
    usernames: &[S],
) -> ProtocolResult<Vec<PathBuf>> {
    fs::create_dir_all(dir).map_err(|e| ProtocolError::identity_load(dir, e))?;
    let mut written = Vec::new();

    let ca_key = SigningKey::generate(&mut OsRng);
    let ca_path = dir.join(CA_PUBLIC_FILE);
    write_public_key(&ca_path, &ca_key.verifying_key())?;
    written.push(ca_path);

    let server_key = SigningKey::generate(&mut OsRng);
    let cert = Certificate::issue(server_name, &server_key.verifying_key(), authority_name, &ca_key)?;
    let cert_path = dir.join(SERVER_CERT_FILE);
    write_certificate(&cert_path, &cert)?;
    written.push(cert_path);
    let server_key_path = dir.join(SERVER_KEY_FILE);
    write_signing_key(&server_key_path, &server_key)?;
    written.push(server_key_path);

    for user in usernames {
        let user = user.as_ref();
        let key = SigningKey::generate(&mut OsRng);
        let pub_path = dir.join(format!("{}.pub", user));
        let key_path = dir.join(format!("{}.key", user));
        write_public_key(&pub_path, &key.verifying_key())?;
        write_signing_key(&key_path, &key)?;
        written.push(pub_path);
        written.push(key_path);
    }

    info!(
        "Provisioned identities for '{}' and {} users in {}",
        server_name,
        usernames.len(),
        dir.display()
    );
    Ok(written)
}
