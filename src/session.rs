//! Session-layer classification.
//!
//! The byte after the source address identifies the session exchange kind
//! by a fixed pattern. Low-value polling exchanges (idle ack, search, get-id)
//! and address assignment are bookkeeping traffic that gets counted and
//! dropped; data exchanges carry an inner command header and payload.

use crate::framing::MARKER;
use crate::registry::Mac;

pub const IDLE_MARKER: u8 = 0x1f;
pub const DATA0_MARKER: u8 = 0x2f;
pub const DATA1_MARKER: u8 = 0x3f;
pub const SEARCH_MARKER: u8 = 0x8f;
pub const GETID_MARKER: u8 = 0xaf;

/// Ack byte answering an idle request.
pub const IDLE_ACK: u8 = 0x6f;
/// Expected trailing ack byte for Data0 / Data1 exchanges.
pub const DATA0_ACK: u8 = 0x4f;
pub const DATA1_ACK: u8 = 0x5f;

/// GiveAddr frames carry this marker in the address-byte position.
pub const GIVEADDR_MARKER: u8 = 0x80;
/// Terminator byte after the device MAC in a GiveAddr frame.
pub const GIVEADDR_TERM: u8 = 0x9f;

/// Address assignment: binds a device MAC to a 5-bit bus address and names
/// the bus master.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GiveAddr {
    pub address: u8,
    pub device_mac: Mac,
    pub master_mac: Mac,
}

/// Which of the two alternating data subchannels a frame belongs to.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DataChannel {
    Data0,
    Data1,
}

impl DataChannel {
    #[must_use]
    pub fn expected_ack(&self) -> u8 {
        match self {
            DataChannel::Data0 => DATA0_ACK,
            DataChannel::Data1 => DATA1_ACK,
        }
    }

    #[must_use]
    pub fn label(&self, acked: bool) -> &'static str {
        match (self, acked) {
            (DataChannel::Data0, true) => "DATA0+ACK0",
            (DataChannel::Data0, false) => "DATA0+NACK",
            (DataChannel::Data1, true) => "DATA1+ACK1",
            (DataChannel::Data1, false) => "DATA1+NACK",
        }
    }
}

/// A classified data exchange with its inner body carved out.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DataExchange {
    pub channel: DataChannel,
    /// Trailing ack byte matched the channel's expected value.
    pub acked: bool,
    /// Frame was wrapped in an idle request; an extra length byte preceded
    /// the inner header.
    pub request_triggered: bool,
    /// The request wrapper's own length byte, when present.
    pub request_length: Option<u8>,
    /// Inner header + payload, trailing ack pair stripped when acked.
    pub body: Vec<u8>,
}

/// Session kind of a reassembled frame.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Session {
    /// Idle request answered by the ack byte; counted, dropped.
    IdleAck,
    /// Idle request wrapping something other than a data exchange;
    /// forwarded with minimal annotation.
    IdleRequest,
    Search,
    GetId,
    GiveAddr(GiveAddr),
    Data(DataExchange),
    Unrecognized,
}

/// Classify an unescaped frame by its fixed-position patterns.
#[must_use]
pub fn classify(frame: &[u8]) -> Session {
    if frame.len() < 3 || frame[0] != MARKER {
        return Session::Unrecognized;
    }

    // GiveAddr reuses the address-byte slot for its own marker.
    if frame[1] == GIVEADDR_MARKER {
        if frame.len() >= 18 && frame[8] == GIVEADDR_TERM {
            let mut device_mac = [0u8; 6];
            device_mac.copy_from_slice(&frame[2..8]);
            let mut master_mac = [0u8; 6];
            master_mac.copy_from_slice(&frame[12..18]);
            return Session::GiveAddr(GiveAddr {
                address: frame[11] & 0x1f,
                device_mac,
                master_mac,
            });
        }
        return Session::Unrecognized;
    }

    let (marker_at, request_triggered) = match frame[2] {
        IDLE_MARKER => {
            if frame.len() > 4 && frame[4] == IDLE_ACK {
                return Session::IdleAck;
            }
            if frame.len() <= 4 {
                return Session::Unrecognized;
            }
            // Request-wrapped: the real session marker follows the idle
            // request pair.
            (4usize, true)
        }
        _ => (2usize, false),
    };

    let channel = match frame[marker_at] {
        DATA0_MARKER => DataChannel::Data0,
        DATA1_MARKER => DataChannel::Data1,
        SEARCH_MARKER if !request_triggered => return Session::Search,
        GETID_MARKER if !request_triggered => return Session::GetId,
        _ if request_triggered => return Session::IdleRequest,
        _ => return Session::Unrecognized,
    };

    let acked = frame.len() >= marker_at + 4 && frame[frame.len() - 2] == channel.expected_ack();
    let mut body: &[u8] = if acked {
        &frame[marker_at + 1..frame.len() - 2]
    } else {
        &frame[marker_at + 1..]
    };

    // Request-triggered exchanges carry an extra length byte ahead of the
    // inner header.
    let mut request_length = None;
    if request_triggered && !body.is_empty() {
        request_length = Some(body[0]);
        body = &body[1..];
    }

    Session::Data(DataExchange {
        channel,
        acked,
        request_triggered,
        request_length,
        body: body.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_ack_pattern() {
        // address 1, idle marker, ack byte at offset 4
        let frame = [0xff, 0x01, 0x1f, 0x6c, 0x6f, 0x6c];
        assert_eq!(classify(&frame), Session::IdleAck);
    }

    #[test]
    fn search_and_getid_patterns() {
        assert_eq!(classify(&[0xff, 0x02, 0x8f, 0x00]), Session::Search);
        assert_eq!(classify(&[0xff, 0x02, 0xaf, 0x00]), Session::GetId);
    }

    #[test]
    fn giveaddr_extracts_macs_and_address() {
        let mut frame = vec![0xff, 0x80];
        frame.extend_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]); // device
        frame.push(0x9f);
        frame.extend_from_slice(&[0x00, 0x00]); // reserved
        frame.push(0x05); // assigned address
        frame.extend_from_slice(&[0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6]); // master

        match classify(&frame) {
            Session::GiveAddr(g) => {
                assert_eq!(g.address, 5);
                assert_eq!(g.device_mac, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
                assert_eq!(g.master_mac, [0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6]);
            }
            other => panic!("expected GiveAddr, got {other:?}"),
        }
    }

    #[test]
    fn giveaddr_without_terminator_is_unrecognized() {
        let mut frame = vec![0xff, 0x80];
        frame.resize(18, 0x00);
        assert_eq!(classify(&frame), Session::Unrecognized);
    }

    #[test]
    fn data0_with_ack_carves_body() {
        // ff addr 2f [body] 4f 00
        let frame = [0xff, 0x03, 0x2f, 0x04, 0x03, 0x00, 0x07, 0x4f, 0x00];
        match classify(&frame) {
            Session::Data(d) => {
                assert_eq!(d.channel, DataChannel::Data0);
                assert!(d.acked);
                assert!(!d.request_triggered);
                assert_eq!(d.body, vec![0x04, 0x03, 0x00, 0x07]);
            }
            other => panic!("expected Data, got {other:?}"),
        }
    }

    #[test]
    fn data1_ack_mismatch_is_lost_ack() {
        let frame = [0xff, 0x03, 0x3f, 0x04, 0x03, 0x00, 0x07, 0x4f, 0x00];
        match classify(&frame) {
            Session::Data(d) => {
                assert_eq!(d.channel, DataChannel::Data1);
                assert!(!d.acked, "0x4f is not the Data1 ack byte");
            }
            other => panic!("expected Data, got {other:?}"),
        }
    }

    #[test]
    fn request_triggered_data_skips_extra_length_byte() {
        // idle marker, non-ack byte, then a Data0 exchange with its own
        // leading length byte
        let frame = [
            0xff, 0x01, 0x1f, 0x6c, 0x2f, 0x05, 0x04, 0x03, 0x00, 0x07, 0x4f, 0x00,
        ];
        match classify(&frame) {
            Session::Data(d) => {
                assert!(d.request_triggered);
                assert_eq!(d.request_length, Some(0x05));
                assert_eq!(d.body, vec![0x04, 0x03, 0x00, 0x07]);
            }
            other => panic!("expected Data, got {other:?}"),
        }
    }

    #[test]
    fn idle_request_without_data_marker() {
        let frame = [0xff, 0x01, 0x1f, 0x6c, 0x60, 0x00];
        assert_eq!(classify(&frame), Session::IdleRequest);
    }

    #[test]
    fn garbage_is_unrecognized() {
        assert_eq!(classify(&[0x01, 0x02, 0x03]), Session::Unrecognized);
        assert_eq!(classify(&[0xff, 0x01]), Session::Unrecognized);
        assert_eq!(classify(&[0xff, 0x01, 0x77, 0x00]), Session::Unrecognized);
    }
}
