//! Command/content classification and record assembly.

use serde::Serialize;

use crate::header::PacketType;

/// Service command subtypes (AckServ/DtServ payload byte 0).
pub const SVC_NUMBER_REQUEST: u8 = 0x01;
pub const SVC_NUMBER_ASSIGN: u8 = 0x02;
pub const SVC_WORK_KEY_ASSIGN: u8 = 0x03;
pub const SVC_MASTER_KEY_ASSIGN: u8 = 0x04;
pub const SVC_ABILITY_QUERY: u8 = 0x05;

/// Data command subtypes (AckData/DtData payload byte 0).
pub const DATA_COMMAND: u8 = 0x01;
pub const DATA_COMMAND_RESPONSE: u8 = 0x02;
pub const DATA_USER_MESSAGE: u8 = 0x03;

/// Outcome of decoding one frame's payload. "Couldn't decrypt yet" is a
/// value, not an error: missing key material and protocol violations all
/// downgrade to a diagnostic annotation on the record.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum DecodeOutcome {
    Decoded(String),
    NotEncrypted,
    MissingMasterCounter,
    MissingWorkKey,
    Malformed(String),
    LostAck,
}

impl DecodeOutcome {
    /// Content-or-diagnostic string for the record.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            DecodeOutcome::Decoded(text) => text.clone(),
            DecodeOutcome::NotEncrypted => "not encrypted".to_string(),
            DecodeOutcome::MissingMasterCounter => "missing master-key counter".to_string(),
            DecodeOutcome::MissingWorkKey => "missing work key".to_string(),
            DecodeOutcome::Malformed(reason) => format!("malformed frame: {reason}"),
            DecodeOutcome::LostAck => "lost acknowledgment".to_string(),
        }
    }
}

/// Human label for a command subtype code. Unknown codes render with their
/// raw numeric value rather than being rejected.
#[must_use]
pub fn subtype_label(packet_type: PacketType, code: u8) -> String {
    let known = if packet_type.is_service() {
        match code {
            SVC_NUMBER_REQUEST => Some("number-request"),
            SVC_NUMBER_ASSIGN => Some("number-assign"),
            SVC_WORK_KEY_ASSIGN => Some("work-key-assign"),
            SVC_MASTER_KEY_ASSIGN => Some("master-key-assign"),
            SVC_ABILITY_QUERY => Some("ability-query"),
            _ => None,
        }
    } else {
        match code {
            DATA_COMMAND => Some("command"),
            DATA_COMMAND_RESPONSE => Some("command-response"),
            DATA_USER_MESSAGE => Some("user-message"),
            _ => None,
        }
    };
    match known {
        Some(label) => label.to_string(),
        None => format!("subtype 0x{code:02x}"),
    }
}

/// Compose the content annotation for a (possibly decrypted) inner payload.
#[must_use]
pub fn content_label(packet_type: PacketType, payload: &[u8]) -> String {
    match payload.first() {
        Some(&code) => {
            let label = subtype_label(packet_type, code);
            if payload.len() > 1 {
                format!("{label} {}", hex::encode(&payload[1..]))
            } else {
                label
            }
        }
        None => "empty payload".to_string(),
    }
}

/// One decoded frame, ready for the log and UI sinks.
#[derive(Serialize, Debug, Clone, Default)]
pub struct DecodedRecord {
    pub timestamp: String,
    pub raw_hex: String,
    /// Declared/actual length pair, e.g. `12/12`.
    pub length_info: String,
    pub sequence: String,
    /// `source > destination` in display MAC form, when known.
    pub direction: String,
    pub type_flags: String,
    pub content: String,
}

impl DecodedRecord {
    /// Minimal record carrying only a timestamp and payload text, used by
    /// the pass-through encodings and unparsed frames.
    #[must_use]
    pub fn raw(timestamp: String, raw_hex: String) -> Self {
        DecodedRecord {
            timestamp,
            raw_hex,
            ..Default::default()
        }
    }

    /// Log-sink line: fields joined by two spaces.
    #[must_use]
    pub fn log_line(&self) -> String {
        format!(
            "{}  {}  {}  {}  {}  {}  {}",
            self.timestamp,
            self.raw_hex,
            self.length_info,
            self.sequence,
            self.direction,
            self.type_flags,
            self.content
        )
    }

    /// Machine-readable rendering, one JSON object per record.
    ///
    /// # Errors
    /// Serialization failures from [serde_json].
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// UI-sink line: `@`-delimited fields in the same order.
    #[must_use]
    pub fn ui_line(&self) -> String {
        format!(
            "{}@{}@{}@{}@{}@{}@{}",
            self.timestamp,
            self.raw_hex,
            self.length_info,
            self.sequence,
            self.direction,
            self.type_flags,
            self.content
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_subtype_labels() {
        assert_eq!(subtype_label(PacketType::DtServ, 0x02), "number-assign");
        assert_eq!(subtype_label(PacketType::AckServ, 0x05), "ability-query");
    }

    #[test]
    fn data_subtype_labels() {
        assert_eq!(subtype_label(PacketType::DtData, 0x03), "user-message");
        assert_eq!(subtype_label(PacketType::AckData, 0x01), "command");
    }

    #[test]
    fn unknown_subtype_renders_numeric() {
        assert_eq!(subtype_label(PacketType::DtData, 0x7e), "subtype 0x7e");
        assert_eq!(subtype_label(PacketType::DtServ, 0x7e), "subtype 0x7e");
    }

    #[test]
    fn content_label_includes_payload_hex() {
        let payload = [0x01, 0xde, 0xad];
        assert_eq!(content_label(PacketType::DtData, &payload), "command dead");
        assert_eq!(content_label(PacketType::DtData, &[]), "empty payload");
    }

    #[test]
    fn diagnostics_render_exact_strings() {
        assert_eq!(DecodeOutcome::NotEncrypted.render(), "not encrypted");
        assert_eq!(
            DecodeOutcome::MissingMasterCounter.render(),
            "missing master-key counter"
        );
        assert_eq!(DecodeOutcome::MissingWorkKey.render(), "missing work key");
        assert_eq!(DecodeOutcome::LostAck.render(), "lost acknowledgment");
    }

    #[test]
    fn record_lines_preserve_field_order() {
        let rec = DecodedRecord {
            timestamp: "12:00:00.000000".into(),
            raw_hex: "ff012f".into(),
            length_info: "4/4".into(),
            sequence: "7".into(),
            direction: "a > b".into(),
            type_flags: "DTDATA".into(),
            content: "command".into(),
        };
        assert_eq!(
            rec.log_line(),
            "12:00:00.000000  ff012f  4/4  7  a > b  DTDATA  command"
        );
        assert_eq!(
            rec.ui_line(),
            "12:00:00.000000@ff012f@4/4@7@a > b@DTDATA@command"
        );
        assert_eq!(rec.ui_line().split('@').count(), 7);

        let json = rec.to_json().unwrap();
        assert!(json.contains("\"raw_hex\":\"ff012f\""));
    }
}
