//! # Application Commands
//!
//! Payloads carried inside encrypted frames. Content is packed into
//! fixed-width NUL-padded fields so frame size leaks nothing about it.
//!
//! ```text
//! RenameReq   old name (128) | new name (128)
//! LogoutReq   zero field (128)
//! RenameAns   status (1)     | message (128)
//! LogoutAns   status (1)     | message (128)
//! ```

use zeroize::Zeroizing;

use crate::channel::{Frame, OpenedMessage, SecureChannel};
use crate::error::{ProtocolError, ProtocolResult};
use crate::wire::MessageType;
use crate::FNAME_MAX_LEN;

/// Pad `content` with NULs to the fixed field width.
///
/// Content that does not fit, or contains NUL, is rejected rather than
/// truncated.
pub fn pad_field(content: &str) -> ProtocolResult<Zeroizing<[u8; FNAME_MAX_LEN]>> {
    let bytes = content.as_bytes();
    if bytes.len() > FNAME_MAX_LEN {
        return Err(ProtocolError::FieldTooLarge {
            size: bytes.len(),
            max: FNAME_MAX_LEN,
        });
    }
    if bytes.contains(&0) {
        return Err(ProtocolError::MalformedMessage(
            "Field content contains NUL".to_string(),
        ));
    }
    let mut field = Zeroizing::new([0u8; FNAME_MAX_LEN]);
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

/// Strip NUL padding from a fixed-width field
pub fn strip_padding(field: &[u8]) -> ProtocolResult<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    if field[end..].iter().any(|&b| b != 0) {
        return Err(ProtocolError::MalformedMessage(
            "Data after field padding".to_string(),
        ));
    }
    String::from_utf8(field[..end].to_vec())
        .map_err(|_| ProtocolError::MalformedMessage("Field is not valid UTF-8".to_string()))
}

/// A filename accepted by the server: non-empty, a single path component
pub fn validate_filename(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("empty filename".to_string());
    }
    if name == "." || name == ".." {
        return Err(format!("'{}' is not a file name", name));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(format!("'{}' contains a path separator", name));
    }
    Ok(())
}

/// Client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Rename { old: String, new: String },
    Logout,
}

impl Command {
    pub fn message_type(&self) -> MessageType {
        match self {
            Command::Rename { .. } => MessageType::RenameReq,
            Command::Logout => MessageType::LogoutReq,
        }
    }

    /// Encrypt the command as the next frame on `channel`
    pub fn seal(&self, channel: &mut SecureChannel) -> ProtocolResult<Frame> {
        match self {
            Command::Rename { old, new } => {
                let old = pad_field(old)?;
                let new = pad_field(new)?;
                channel.seal(MessageType::RenameReq, &[&old[..], &new[..]])
            }
            Command::Logout => channel.seal(MessageType::LogoutReq, &[&[0u8; FNAME_MAX_LEN]]),
        }
    }

    /// Parse a decrypted request
    pub fn from_opened(msg: &OpenedMessage) -> ProtocolResult<Self> {
        let plain = &msg.plaintext;
        match msg.message_type {
            MessageType::RenameReq => {
                expect_len(plain, 2 * FNAME_MAX_LEN, msg.message_type)?;
                Ok(Command::Rename {
                    old: strip_padding(&plain[..FNAME_MAX_LEN])?,
                    new: strip_padding(&plain[FNAME_MAX_LEN..])?,
                })
            }
            MessageType::LogoutReq => {
                expect_len(plain, FNAME_MAX_LEN, msg.message_type)?;
                Ok(Command::Logout)
            }
            other => Err(ProtocolError::MalformedMessage(format!(
                "{:?} is not a client command",
                other
            ))),
        }
    }
}

/// Status byte of a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    Error = 1,
}

/// Server reply to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub message_type: MessageType,
    pub status: ReplyStatus,
    pub message: String,
}

impl Reply {
    pub fn ok(message_type: MessageType) -> Self {
        Self {
            message_type,
            status: ReplyStatus::Ok,
            message: String::new(),
        }
    }

    /// Error reply. Long messages are cut at a character boundary to fit
    /// the fixed field.
    pub fn error(message_type: MessageType, message: impl Into<String>) -> Self {
        let mut message: String = message.into().replace('\0', " ");
        while message.len() > FNAME_MAX_LEN {
            message.pop();
        }
        Self {
            message_type,
            status: ReplyStatus::Error,
            message,
        }
    }

    /// Answer type for a request type
    pub fn answer_type(request: MessageType) -> ProtocolResult<MessageType> {
        match request {
            MessageType::RenameReq => Ok(MessageType::RenameAns),
            MessageType::LogoutReq => Ok(MessageType::LogoutAns),
            other => Err(ProtocolError::MalformedMessage(format!(
                "{:?} has no answer type",
                other
            ))),
        }
    }

    pub fn seal(&self, channel: &mut SecureChannel) -> ProtocolResult<Frame> {
        let message = pad_field(&self.message)?;
        channel.seal(self.message_type, &[&[self.status as u8], &message[..]])
    }

    pub fn from_opened(msg: &OpenedMessage) -> ProtocolResult<Self> {
        if !matches!(msg.message_type, MessageType::RenameAns | MessageType::LogoutAns) {
            return Err(ProtocolError::MalformedMessage(format!(
                "{:?} is not a server reply",
                msg.message_type
            )));
        }
        let plain = &msg.plaintext;
        expect_len(plain, 1 + FNAME_MAX_LEN, msg.message_type)?;
        let status = match plain[0] {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::Error,
            other => {
                return Err(ProtocolError::MalformedMessage(format!(
                    "Unknown reply status {}",
                    other
                )))
            }
        };
        Ok(Self {
            message_type: msg.message_type,
            status,
            message: strip_padding(&plain[1..])?,
        })
    }

    /// Turn an error reply into [`ProtocolError::CommandRejected`]
    pub fn into_result(self) -> ProtocolResult<()> {
        match self.status {
            ReplyStatus::Ok => Ok(()),
            ReplyStatus::Error => Err(ProtocolError::CommandRejected(self.message)),
        }
    }
}

fn expect_len(plain: &[u8], expected: usize, message_type: MessageType) -> ProtocolResult<()> {
    if plain.len() != expected {
        return Err(ProtocolError::MalformedMessage(format!(
            "{:?} payload must be {} bytes, got {}",
            message_type,
            expected,
            plain.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{random_bytes, SessionKey};
    use rand::Rng;

    fn channel_pair() -> (SecureChannel, SecureChannel) {
        let key = SessionKey::from_bytes(random_bytes());
        (SecureChannel::new(key.clone()), SecureChannel::new(key))
    }

    #[test]
    fn test_pad_and_strip() {
        let field = pad_field("old.txt").unwrap();
        assert_eq!(field.len(), FNAME_MAX_LEN);
        assert_eq!(&field[..7], b"old.txt");
        assert!(field[7..].iter().all(|&b| b == 0));
        assert_eq!(strip_padding(&field[..]).unwrap(), "old.txt");
    }

    #[test]
    fn test_full_width_name() {
        let name = "n".repeat(FNAME_MAX_LEN);
        let field = pad_field(&name).unwrap();
        assert_eq!(strip_padding(&field[..]).unwrap(), name);
    }

    #[test]
    fn test_overlong_and_nul_rejected() {
        assert!(matches!(
            pad_field(&"x".repeat(FNAME_MAX_LEN + 1)),
            Err(ProtocolError::FieldTooLarge { .. })
        ));
        assert!(pad_field("a\0b").is_err());
    }

    #[test]
    fn test_garbage_after_padding_rejected() {
        let mut field = [0u8; FNAME_MAX_LEN];
        field[0] = b'a';
        field[10] = b'b';
        assert!(strip_padding(&field).is_err());
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("report.pdf").is_ok());
        assert!(validate_filename("").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("../etc/passwd").is_err());
        assert!(validate_filename("dir\\file").is_err());
    }

    #[test]
    fn test_rename_roundtrip_through_channel() {
        let (mut client, mut server) = channel_pair();
        let cmd = Command::Rename {
            old: "old.txt".to_string(),
            new: "new.txt".to_string(),
        };
        let frame = cmd.seal(&mut client).unwrap();
        assert_eq!(frame.message_type, MessageType::RenameReq);
        // Frame size does not depend on name length
        assert_eq!(frame.ciphertext.len(), 2 * FNAME_MAX_LEN);

        let opened = server.open(&frame).unwrap();
        assert_eq!(Command::from_opened(&opened).unwrap(), cmd);
    }

    /// Random non-NUL UTF-8 string of exactly `len` bytes
    fn random_name(rng: &mut impl Rng, len: usize) -> String {
        const WIDE: [char; 3] = ['é', '€', '🦀'];
        let mut name = String::with_capacity(len);
        while name.len() < len {
            let room = len - name.len();
            let c = if rng.gen_bool(0.3) {
                WIDE[rng.gen_range(0..WIDE.len())]
            } else {
                rng.gen_range(1u8..0x80) as char
            };
            if c.len_utf8() <= room {
                name.push(c);
            }
        }
        name
    }

    #[test]
    fn test_rename_roundtrip_any_name_length() {
        let mut rng = rand::thread_rng();
        let (mut client, mut server) = channel_pair();
        for old_len in 0..=FNAME_MAX_LEN {
            let new_len = rng.gen_range(0..=FNAME_MAX_LEN);
            let cmd = Command::Rename {
                old: random_name(&mut rng, old_len),
                new: random_name(&mut rng, new_len),
            };
            let frame = cmd.seal(&mut client).unwrap();
            assert_eq!(frame.ciphertext.len(), 2 * FNAME_MAX_LEN);
            let opened = server.open(&frame).unwrap();
            assert_eq!(Command::from_opened(&opened).unwrap(), cmd);
        }
    }

    #[test]
    fn test_logout_roundtrip() {
        let (mut client, mut server) = channel_pair();
        let frame = Command::Logout.seal(&mut client).unwrap();
        let opened = server.open(&frame).unwrap();
        assert_eq!(Command::from_opened(&opened).unwrap(), Command::Logout);
    }

    #[test]
    fn test_reply_roundtrip() {
        let (mut client, mut server) = channel_pair();
        let reply = Reply::error(MessageType::RenameAns, "no such file");
        let frame = reply.seal(&mut server).unwrap();
        let opened = client.open(&frame).unwrap();
        let parsed = Reply::from_opened(&opened).unwrap();
        assert_eq!(parsed, reply);
        assert!(matches!(
            parsed.into_result(),
            Err(ProtocolError::CommandRejected(m)) if m == "no such file"
        ));
    }

    #[test]
    fn test_long_error_message_fits() {
        let reply = Reply::error(MessageType::RenameAns, "é".repeat(200));
        assert!(reply.message.len() <= FNAME_MAX_LEN);
        assert!(pad_field(&reply.message).is_ok());
    }

    #[test]
    fn test_answer_types() {
        assert_eq!(
            Reply::answer_type(MessageType::RenameReq).unwrap(),
            MessageType::RenameAns
        );
        assert!(Reply::answer_type(MessageType::RenameAns).is_err());
    }
}
