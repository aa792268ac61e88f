//! # Sequence Numbers
//!
//! One counter per direction per connection. The receiver accepts a frame only
//! if its sequence number is exactly the next expected value, which rejects
//! replays and reordering alike. Counters never wrap.

use crate::error::{ProtocolError, ProtocolResult};

/// Send and receive counters for one connection
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SequenceCounters {
    next_send: u64,
    expected_receive: u64,
}

impl SequenceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the sequence number for the next outgoing frame and advance
    pub fn next_send_seq(&mut self) -> ProtocolResult<u64> {
        let seq = self.next_send;
        self.next_send = seq.checked_add(1).ok_or(ProtocolError::SequenceExhausted)?;
        Ok(seq)
    }

    /// Accept `received` iff it equals the expected next value, then advance
    pub fn validate_receive_seq(&mut self, received: u64) -> ProtocolResult<()> {
        if received != self.expected_receive {
            return Err(ProtocolError::ReplayOrReorder {
                expected: self.expected_receive,
                received,
            });
        }
        self.expected_receive = received
            .checked_add(1)
            .ok_or(ProtocolError::SequenceExhausted)?;
        Ok(())
    }

    /// Sequence number the next outgoing frame will carry
    pub fn peek_send(&self) -> u64 {
        self.next_send
    }

    /// Sequence number the next incoming frame must carry
    pub fn expected_receive(&self) -> u64 {
        self.expected_receive
    }
}
