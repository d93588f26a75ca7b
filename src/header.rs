//! Inner Orion2 command header.
//!
//! After session classification a data-exchange frame carries a 4-byte
//! command header: declared overall length, packet type, flag bits, and a
//! sequence number.

use serde::{Deserialize, Serialize};

/// Packet type, a 2-bit sub-field of the type byte.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum PacketType {
    AckServ,
    DtServ,
    AckData,
    DtData,
}

impl PacketType {
    #[must_use]
    pub fn from_bits(b: u8) -> Self {
        match b & 0x3 {
            0 => PacketType::AckServ,
            1 => PacketType::DtServ,
            2 => PacketType::AckData,
            _ => PacketType::DtData,
        }
    }

    /// Service packets carry key-exchange and bus-management commands;
    /// data packets carry application traffic.
    #[must_use]
    pub fn is_service(&self) -> bool {
        matches!(self, PacketType::AckServ | PacketType::DtServ)
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            PacketType::AckServ => "ACKSERV",
            PacketType::DtServ => "DTSERV",
            PacketType::AckData => "ACKDATA",
            PacketType::DtData => "DTDATA",
        }
    }
}

/// Which key a frame is encrypted under.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum KeyKind {
    Master,
    Work,
}

/// The 8 flag bits of the command header, bit 0 first.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub struct Flags {
    pub saf: bool,
    pub daf: bool,
    pub ackn: bool,
    pub pfirst: bool,
    pub psyn: bool,
    /// Bit 5: selects master (0) vs work (1) key for encrypted frames.
    pub key_kind: KeyKind,
    /// Bit 6: gates whether the decryption engine is invoked at all.
    pub encrypted: bool,
    pub reserved: bool,
}

impl Flags {
    #[must_use]
    pub fn decode(b: u8) -> Self {
        Flags {
            saf: b & 0x01 != 0,
            daf: b & 0x02 != 0,
            ackn: b & 0x04 != 0,
            pfirst: b & 0x08 != 0,
            psyn: b & 0x10 != 0,
            key_kind: if b & 0x20 != 0 {
                KeyKind::Work
            } else {
                KeyKind::Master
            },
            encrypted: b & 0x40 != 0,
            reserved: b & 0x80 != 0,
        }
    }

    #[must_use]
    pub fn label(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if self.saf {
            parts.push("SAF");
        }
        if self.daf {
            parts.push("DAF");
        }
        if self.ackn {
            parts.push("ACKN");
        }
        if self.pfirst {
            parts.push("PFIRST");
        }
        if self.psyn {
            parts.push("PSYN");
        }
        if self.encrypted {
            parts.push(match self.key_kind {
                KeyKind::Master => "ENC:MASTER",
                KeyKind::Work => "ENC:WORK",
            });
        }
        if self.reserved {
            parts.push("RSV");
        }
        parts.join("|")
    }
}

/// Command header at the front of a data-exchange body.
///
/// Layout: `[overall length][type byte][flags byte][sequence number]`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub struct Header {
    pub length: u8,
    pub packet_type: PacketType,
    pub flags: Flags,
    pub sequence: u8,
}

impl Header {
    /// Header length in bytes.
    pub const LEN: usize = 4;

    /// Construct from the provided bytes, or `None` if there are not enough
    /// bytes.
    #[must_use]
    pub fn decode(dat: &[u8]) -> Option<Self> {
        if dat.len() < Self::LEN {
            return None;
        }
        Some(Header {
            length: dat[0],
            packet_type: PacketType::from_bits(dat[1]),
            flags: Flags::decode(dat[2]),
            sequence: dat[3],
        })
    }

    /// Combined type+flags display label, e.g. `DTSERV SAF|ENC:MASTER`.
    #[must_use]
    pub fn label(&self) -> String {
        let flags = self.flags.label();
        if flags.is_empty() {
            self.packet_type.label().to_string()
        } else {
            format!("{} {}", self.packet_type.label(), flags)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_header() {
        let dat = [0x0a, 0x01, 0x61, 0x2a];
        let hdr = Header::decode(&dat).unwrap();

        assert_eq!(hdr.length, 10);
        assert_eq!(hdr.packet_type, PacketType::DtServ);
        assert!(hdr.flags.saf);
        assert!(hdr.flags.encrypted);
        assert_eq!(hdr.flags.key_kind, KeyKind::Work);
        assert_eq!(hdr.sequence, 0x2a);
        assert_eq!(hdr.label(), "DTSERV SAF|ENC:WORK");
    }

    #[test]
    fn decode_header_is_none_when_too_short() {
        assert!(Header::decode(&[0x0a, 0x01, 0x61]).is_none());
    }

    #[test]
    fn key_kind_bit_selects_master_vs_work() {
        assert_eq!(Flags::decode(0x40).key_kind, KeyKind::Master);
        assert_eq!(Flags::decode(0x60).key_kind, KeyKind::Work);
    }

    #[test]
    fn type_subfield_uses_low_two_bits_only() {
        assert_eq!(PacketType::from_bits(0x00), PacketType::AckServ);
        assert_eq!(PacketType::from_bits(0x01), PacketType::DtServ);
        assert_eq!(PacketType::from_bits(0x02), PacketType::AckData);
        assert_eq!(PacketType::from_bits(0x03), PacketType::DtData);
        assert_eq!(PacketType::from_bits(0xfd), PacketType::DtServ);
    }
}
