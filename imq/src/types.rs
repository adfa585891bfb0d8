use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use bytestring::ByteString;

pub use rmqtt_codec::types::{Publish, QoS};
pub use rmqtt_codec::v5::DisconnectReasonCode as Reason;
pub use rmqtt_codec::version::ProtocolVersion;

pub type ClientId = ByteString;
pub type TopicFilter = ByteString;
pub type ConnectionId = u64;

/// Lifecycle of one connection.
///
/// ```text
/// Handshaking -> Established -> Draining -> Closed
///      \___________________________________/^
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Handshaking = 0,
    Established = 1,
    Draining = 2,
    Closed = 3,
}

impl ConnState {
    #[inline]
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Handshaking,
            1 => ConnState::Established,
            2 => ConnState::Draining,
            _ => ConnState::Closed,
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Handshaking => "handshaking",
            ConnState::Established => "established",
            ConnState::Draining => "draining",
            ConnState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A `ConnState` shared between the connection task and its handle.
///
/// Transitions only move forward.
#[derive(Debug)]
pub struct AtomicConnState(AtomicU8);

impl Default for AtomicConnState {
    fn default() -> Self {
        Self(AtomicU8::new(ConnState::Handshaking as u8))
    }
}

impl AtomicConnState {
    #[inline]
    pub fn get(&self) -> ConnState {
        ConnState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves to `to` if that is later than the current state, returns whether it moved.
    #[inline]
    pub fn advance(&self, to: ConnState) -> bool {
        self.0.fetch_max(to as u8, Ordering::SeqCst) < to as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_only_moves_forward() {
        let s = AtomicConnState::default();
        assert_eq!(s.get(), ConnState::Handshaking);
        assert!(s.advance(ConnState::Established));
        assert!(s.advance(ConnState::Draining));
        assert!(!s.advance(ConnState::Established));
        assert_eq!(s.get(), ConnState::Draining);
        assert!(s.advance(ConnState::Closed));
        assert!(!s.advance(ConnState::Draining));
        assert_eq!(s.get().to_string(), "closed");
    }
}
