//! Synchronization link wire format.
//!
//! Sync links between neighboring nodes are narrow: one 9-bit word per
//! cycle, a data byte plus a last-byte flag. A sync message is two bytes,
//! round id then value, so every message occupies exactly two link cycles.

use thiserror::Error;

/// Bytes in a serialized sync message.
pub const MESSAGE_BYTES: usize = 2;

/// Errors from link-level reassembly.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("sync message overran {MESSAGE_BYTES} bytes without a last flag")]
    Overrun,
    #[error("sync message ended after {got} of {MESSAGE_BYTES} bytes")]
    Underrun { got: usize },
}

/// One cycle's worth of sync link traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkWord {
    pub data: u8,
    /// Set on the final byte of a message.
    pub last: bool,
}

/// A distance report exchanged during a reclamation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMessage {
    /// Aggregation round id, so a late message from round N cannot corrupt
    /// round N+1.
    pub round: u8,
    /// Distance value being aggregated. The full sentinel distance equals
    /// the ident modulus, which fits a byte for any supported modulus.
    pub value: u8,
}

impl SyncMessage {
    /// Serialize to link words, round byte first.
    pub fn to_link_words(&self) -> [LinkWord; MESSAGE_BYTES] {
        [
            LinkWord { data: self.round, last: false },
            LinkWord { data: self.value, last: true },
        ]
    }
}

/// Reassembles sync messages from a byte-per-cycle link.
#[derive(Debug, Default)]
pub struct LinkReassembler {
    buf: [u8; MESSAGE_BYTES],
    len: usize,
}

impl LinkReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one link word; returns a message when its last byte arrives.
    pub fn push(&mut self, word: LinkWord) -> Result<Option<SyncMessage>, WireError> {
        if self.len == MESSAGE_BYTES {
            self.len = 0;
            return Err(WireError::Overrun);
        }
        self.buf[self.len] = word.data;
        self.len += 1;
        if !word.last {
            return Ok(None);
        }
        if self.len < MESSAGE_BYTES {
            let got = self.len;
            self.len = 0;
            return Err(WireError::Underrun { got });
        }
        self.len = 0;
        Ok(Some(SyncMessage { round: self.buf[0], value: self.buf[1] }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        let msg = SyncMessage { round: 7, value: 128 };
        let mut reasm = LinkReassembler::new();
        let words = msg.to_link_words();
        assert_eq!(reasm.push(words[0]).unwrap(), None);
        assert_eq!(reasm.push(words[1]).unwrap(), Some(msg));
    }

    #[test]
    fn test_back_to_back_messages() {
        let mut reasm = LinkReassembler::new();
        for round in 0..3u8 {
            let msg = SyncMessage { round, value: round + 10 };
            let words = msg.to_link_words();
            assert_eq!(reasm.push(words[0]).unwrap(), None);
            assert_eq!(reasm.push(words[1]).unwrap(), Some(msg));
        }
    }

    #[test]
    fn test_underrun() {
        let mut reasm = LinkReassembler::new();
        let err = reasm.push(LinkWord { data: 3, last: true }).unwrap_err();
        assert_eq!(err, WireError::Underrun { got: 1 });
        // Reassembler recovers after a framing error.
        let msg = SyncMessage { round: 1, value: 2 };
        let words = msg.to_link_words();
        assert_eq!(reasm.push(words[0]).unwrap(), None);
        assert_eq!(reasm.push(words[1]).unwrap(), Some(msg));
    }
}
