//! # Secure Transfer Protocol
//!
//! This crate implements a mutually authenticated file command protocol with:
//! - X25519 ephemeral key agreement
//! - Ed25519 long-term identities and server certificates
//! - HKDF-SHA256 session key derivation
//! - AES-256-GCM authenticated frames with strict sequencing
//!
//! ## Protocol Overview
//!
//! ```text
//! Client                                         Server
//!   |                                               |
//!   |--- AuthStart (username, Ka) ----------------->|
//!   |                                               |
//!   |<-- AuthServerAns (name, Ks, cert, sig_s) -----|
//!   |                                               |
//!   |--- AuthClientFinish (sig_c) ----------------->|
//!   |                                               |
//!   |  [Both derive KDF(DH(Ka, Ks))]                |
//!   |                                               |
//!   |--- RenameReq [seq 0] ------------------------>|
//!   |<-- RenameAns [seq 0] -------------------------|
//!   |                                               |
//! ```
//!
//! Both signatures cover the transcript `Ka || Ks || username`.
//!
//! ## Security Properties
//!
//! - Forward secrecy (ephemeral keys, consumed by the exchange)
//! - Identity bound to the key exchange through the signed transcript
//! - Replay and reordering rejected by exact-next sequence numbers
//! - Secret material zeroized on drop

pub mod channel;
pub mod client;
pub mod command;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod sequence;
pub mod server;
pub mod signature;
pub mod transport;
pub mod wire;

pub use channel::*;
pub use client::*;
pub use command::*;
pub use config::*;
pub use crypto::*;
pub use error::*;
pub use handshake::*;
pub use identity::*;
pub use sequence::*;
pub use server::*;
pub use signature::*;
pub use transport::*;
pub use wire::*;

/// Default maximum length of a variable-length wire field
pub const MAX_FIELD_LEN: usize = 4096;

/// IV size for AES-GCM (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Tag size for AES-GCM authentication
pub const TAG_SIZE: usize = 16;

/// Key size for AES-256
pub const KEY_SIZE: usize = 32;

/// X25519 public key size
pub const EPHEMERAL_KEY_SIZE: usize = 32;

/// Fixed width of a filename field inside an encrypted payload
pub const FNAME_MAX_LEN: usize = 128;

/// Smallest usable field limit: a RenameReq ciphertext carries two names
pub const MIN_FIELD_LEN: usize = 2 * FNAME_MAX_LEN;
