//! # Secure Channel
//!
//! Frames, encrypts and sequences application messages after the handshake.
//!
//! ## Frame Format
//!
//! ```text
//! +--------+----------+---------+--------------------+---------------+
//! | Type   | Sequence | IV      | Ciphertext         | Tag           |
//! | 1 byte | 8 bytes  | 12 bytes| u16 len + bytes    | u16 len + 16  |
//! +--------+----------+---------+--------------------+---------------+
//! ```
//!
//! Type and sequence number are authenticated as associated data but sent in
//! clear. Every frame gets a fresh random IV. A failed tag is fatal for the
//! channel and the recovered bytes are wiped, never returned.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce, Tag,
};
use tracing::{trace, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{generate_iv, SessionKey};
use crate::error::{ProtocolError, ProtocolResult};
use crate::sequence::SequenceCounters;
use crate::wire::{MessageType, WireMessage, WireReader, WireWriter};
use crate::{NONCE_SIZE, TAG_SIZE};

/// Associated data size: type(1) + sequence(8)
const AAD_SIZE: usize = 9;

/// Encrypted application frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub sequence_number: u64,
    pub iv: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl Frame {
    fn aad(message_type: MessageType, sequence_number: u64) -> [u8; AAD_SIZE] {
        let mut aad = [0u8; AAD_SIZE];
        aad[0] = message_type as u8;
        aad[1..].copy_from_slice(&sequence_number.to_be_bytes());
        aad
    }
}

impl WireMessage for Frame {
    fn encode(&self, w: &mut WireWriter<'_>) -> ProtocolResult<()> {
        w.put_type(self.message_type);
        w.put_u64(self.sequence_number);
        w.put_slice(&self.iv);
        w.put_field(&self.ciphertext)?;
        w.put_field(&self.tag)
    }

    fn decode(r: &mut WireReader<'_>) -> ProtocolResult<Option<Self>> {
        let Some(tag_byte) = r.u8() else {
            return Ok(None);
        };
        let message_type = MessageType::try_from(tag_byte)?;
        if !message_type.is_application() {
            return Err(ProtocolError::MalformedMessage(format!(
                "{:?} is not an application message",
                message_type
            )));
        }
        let Some(sequence_number) = r.u64() else {
            return Ok(None);
        };
        let Some(iv) = r.array::<NONCE_SIZE>() else {
            return Ok(None);
        };
        let Some(ciphertext) = r.field()? else {
            return Ok(None);
        };
        let Some(tag) = r.fixed_field::<TAG_SIZE>("Authentication tag")? else {
            return Ok(None);
        };
        Ok(Some(Frame {
            message_type,
            sequence_number,
            iv,
            ciphertext: ciphertext.to_vec(),
            tag,
        }))
    }
}

/// Encrypt the concatenation of `fields` as one AEAD operation
pub fn encode_message(
    key: &SessionKey,
    message_type: MessageType,
    sequence_number: u64,
    fields: &[&[u8]],
) -> ProtocolResult<Frame> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let iv = generate_iv();
    let aad = Frame::aad(message_type, sequence_number);

    let mut buffer = Vec::with_capacity(fields.iter().map(|f| f.len()).sum());
    for field in fields {
        buffer.extend_from_slice(field);
    }

    let tag = match cipher.encrypt_in_place_detached(Nonce::from_slice(&iv), &aad, &mut buffer) {
        Ok(tag) => tag,
        Err(_) => {
            buffer.zeroize();
            return Err(ProtocolError::MalformedMessage(
                "Payload too large to encrypt".to_string(),
            ));
        }
    };

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&tag);

    Ok(Frame {
        message_type,
        sequence_number,
        iv,
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

/// Verify and decrypt a frame. Fails with
/// [`ProtocolError::AuthenticationFailure`] if anything covered by the tag
/// was altered.
pub fn decode_message(key: &SessionKey, frame: &Frame) -> ProtocolResult<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let aad = Frame::aad(frame.message_type, frame.sequence_number);

    let mut buffer = Zeroizing::new(frame.ciphertext.clone());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&frame.iv),
            &aad,
            &mut buffer,
            Tag::from_slice(&frame.tag),
        )
        .map_err(|_| ProtocolError::AuthenticationFailure)?;
    Ok(buffer)
}

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel can send and receive
    Active,
    /// Closed after a logout exchange
    Closed,
    /// A fatal error occurred; the channel refuses further use
    Failed,
}

/// Decrypted application message
pub struct OpenedMessage {
    pub message_type: MessageType,
    pub sequence_number: u64,
    pub plaintext: Zeroizing<Vec<u8>>,
}

/// Per-connection secure channel owning the session key and counters
pub struct SecureChannel {
    key: SessionKey,
    sequence: SequenceCounters,
    state: ChannelState,
    messages_sent: u64,
    messages_received: u64,
}

impl SecureChannel {
    /// Create a channel from a freshly negotiated session key
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            sequence: SequenceCounters::new(),
            state: ChannelState::Active,
            messages_sent: 0,
            messages_received: 0,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ChannelState::Active
    }

    fn ensure_active(&self) -> ProtocolResult<()> {
        if self.state != ChannelState::Active {
            return Err(ProtocolError::InvalidStateTransition {
                from: format!("{:?}", self.state),
                to: "Active".to_string(),
            });
        }
        Ok(())
    }

    fn fail<T>(&mut self, err: ProtocolError) -> ProtocolResult<T> {
        self.state = ChannelState::Failed;
        Err(err)
    }

    /// Encrypt fixed-width payload fields under the next send sequence number
    pub fn seal(&mut self, message_type: MessageType, fields: &[&[u8]]) -> ProtocolResult<Frame> {
        self.ensure_active()?;
        if !message_type.is_application() {
            return Err(ProtocolError::MalformedMessage(format!(
                "{:?} cannot travel on the secure channel",
                message_type
            )));
        }

        let seq = match self.sequence.next_send_seq() {
            Ok(seq) => seq,
            Err(e) => return self.fail(e),
        };
        match encode_message(&self.key, message_type, seq, fields) {
            Ok(frame) => {
                self.messages_sent += 1;
                trace!("Sealed {:?} seq={}", message_type, seq);
                Ok(frame)
            }
            Err(e) => self.fail(e),
        }
    }

    /// Authenticate, decrypt and sequence-check an incoming frame.
    ///
    /// Any failure moves the channel to [`ChannelState::Failed`].
    pub fn open(&mut self, frame: &Frame) -> ProtocolResult<OpenedMessage> {
        self.ensure_active()?;

        let plaintext = match decode_message(&self.key, frame) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    "Frame {:?} seq={} failed authentication",
                    frame.message_type, frame.sequence_number
                );
                return self.fail(e);
            }
        };

        if let Err(e) = self.sequence.validate_receive_seq(frame.sequence_number) {
            warn!("Rejected frame: {}", e);
            return self.fail(e);
        }

        self.messages_received += 1;
        trace!("Opened {:?} seq={}", frame.message_type, frame.sequence_number);
        Ok(OpenedMessage {
            message_type: frame.message_type,
            sequence_number: frame.sequence_number,
            plaintext,
        })
    }

    /// Close the channel after an orderly logout
    pub fn close(&mut self) {
        if self.state == ChannelState::Active {
            self.state = ChannelState::Closed;
        }
    }

    /// Get channel statistics
    pub fn statistics(&self) -> ChannelStatistics {
        ChannelStatistics {
            state: self.state,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            next_send_seq: self.sequence.peek_send(),
            expected_receive_seq: self.sequence.expected_receive(),
        }
    }
}

/// Channel statistics
#[derive(Debug, Clone)]
pub struct ChannelStatistics {
    pub state: ChannelState,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub next_send_seq: u64,
    pub expected_receive_seq: u64,
}

impl std::fmt::Display for ChannelStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}: sent={}, recv={}, next_send_seq={}, expected_recv_seq={}",
            self.state,
            self.messages_sent,
            self.messages_received,
            self.next_send_seq,
            self.expected_receive_seq,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;
    use crate::MAX_FIELD_LEN;

    fn test_key() -> SessionKey {
        SessionKey::from_bytes(random_bytes())
    }

    fn channel_pair() -> (SecureChannel, SecureChannel) {
        let key = test_key();
        (SecureChannel::new(key.clone()), SecureChannel::new(key))
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let key = test_key();
        let old = [b'a'; 128];
        let new = [b'b'; 128];

        let frame = encode_message(&key, MessageType::RenameReq, 7, &[&old, &new]).unwrap();
        assert_eq!(frame.ciphertext.len(), 256);

        let plain = decode_message(&key, &frame).unwrap();
        assert_eq!(&plain[..128], &old);
        assert_eq!(&plain[128..], &new);
    }

    #[test]
    fn test_fresh_iv_per_frame() {
        let key = test_key();
        let a = encode_message(&key, MessageType::RenameReq, 0, &[b"same"]).unwrap();
        let b = encode_message(&key, MessageType::RenameReq, 0, &[b"same"]).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_any_single_byte_mutation_fails() {
        let key = test_key();
        let frame = encode_message(&key, MessageType::RenameReq, 3, &[&[0x41u8; 64]]).unwrap();

        // Header: type and sequence number
        let mut t = frame.clone();
        t.message_type = MessageType::LogoutReq;
        assert!(matches!(decode_message(&key, &t), Err(ProtocolError::AuthenticationFailure)));

        for bit in 0..64 {
            let mut t = frame.clone();
            t.sequence_number ^= 1 << bit;
            assert!(matches!(decode_message(&key, &t), Err(ProtocolError::AuthenticationFailure)));
        }

        for i in 0..NONCE_SIZE {
            let mut t = frame.clone();
            t.iv[i] ^= 0x01;
            assert!(matches!(decode_message(&key, &t), Err(ProtocolError::AuthenticationFailure)));
        }

        for i in 0..frame.ciphertext.len() {
            let mut t = frame.clone();
            t.ciphertext[i] ^= 0x80;
            assert!(matches!(decode_message(&key, &t), Err(ProtocolError::AuthenticationFailure)));
        }

        for i in 0..TAG_SIZE {
            let mut t = frame.clone();
            t.tag[i] ^= 0xff;
            assert!(matches!(decode_message(&key, &t), Err(ProtocolError::AuthenticationFailure)));
        }
    }

    #[test]
    fn test_wire_byte_mutation_never_yields_plaintext() {
        let key = test_key();
        let frame = encode_message(&key, MessageType::RenameReq, 0, &[&[7u8; 32]]).unwrap();
        let bytes = frame.to_bytes(MAX_FIELD_LEN).unwrap();

        for i in 0..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[i] ^= 0x01;
            // Either the frame no longer parses or its tag fails
            if let Ok(parsed) = Frame::from_bytes(&tampered, MAX_FIELD_LEN) {
                assert!(decode_message(&key, &parsed).is_err(), "byte {} accepted", i);
            }
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let frame = encode_message(&test_key(), MessageType::RenameAns, 0, &[b"ok"]).unwrap();
        assert!(matches!(
            decode_message(&test_key(), &frame),
            Err(ProtocolError::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_channel_in_order() {
        let (mut client, mut server) = channel_pair();
        for i in 0..3u8 {
            let frame = client.seal(MessageType::RenameReq, &[&[i; 4]]).unwrap();
            assert_eq!(frame.sequence_number, i as u64);
            let opened = server.open(&frame).unwrap();
            assert_eq!(&opened.plaintext[..], &[i; 4]);
        }
        assert_eq!(server.statistics().messages_received, 3);
    }

    #[test]
    fn test_channel_replay_rejected() {
        let (mut client, mut server) = channel_pair();
        let frame = client.seal(MessageType::RenameReq, &[b"x"]).unwrap();
        server.open(&frame).unwrap();

        assert!(matches!(
            server.open(&frame),
            Err(ProtocolError::ReplayOrReorder { expected: 1, received: 0 })
        ));
        assert_eq!(server.state(), ChannelState::Failed);
    }

    #[test]
    fn test_channel_reorder_rejected() {
        let (mut client, mut server) = channel_pair();
        let first = client.seal(MessageType::RenameReq, &[b"1"]).unwrap();
        let second = client.seal(MessageType::RenameReq, &[b"2"]).unwrap();

        // Both are individually valid
        assert!(decode_message(&server.key, &first).is_ok());
        assert!(decode_message(&server.key, &second).is_ok());

        assert!(matches!(
            server.open(&second),
            Err(ProtocolError::ReplayOrReorder { expected: 0, received: 1 })
        ));
    }

    #[test]
    fn test_failed_channel_refuses_use() {
        let (mut client, mut server) = channel_pair();
        let mut frame = client.seal(MessageType::RenameReq, &[b"data"]).unwrap();
        frame.tag[0] ^= 1;

        assert!(matches!(server.open(&frame), Err(ProtocolError::AuthenticationFailure)));
        assert!(matches!(
            server.seal(MessageType::RenameAns, &[b"ok"]),
            Err(ProtocolError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_handshake_types_refused() {
        let (mut client, _) = channel_pair();
        assert!(client.seal(MessageType::AuthStart, &[b""]).is_err());
    }

    #[test]
    fn test_close() {
        let (mut client, _) = channel_pair();
        client.close();
        assert_eq!(client.state(), ChannelState::Closed);
        assert!(client.seal(MessageType::LogoutReq, &[b""]).is_err());
    }
}
