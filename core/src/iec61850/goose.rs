// IEC 61850-8-1 GOOSE decoding, subscription side only.
//
// Only the PDU fields needed for stop-condition matching are extracted; any
// length overrun invalidates the whole message.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ethernet::ETHERTYPE_GOOSE;

/// Minimum frame worth inspecting: Ethernet header + VLAN tag + EtherType +
/// the 8-byte GOOSE header.
const MIN_GOOSE_FRAME: usize = 28;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GooseError {
    TooShort,
    NotGoose,
    MissingPdu,
    Truncated,
    UnsupportedLength(u8),
    EmptyGocbRef,
}

impl fmt::Display for GooseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GooseError::TooShort => write!(f, "frame too short for a GOOSE PDU"),
            GooseError::NotGoose => write!(f, "EtherType is not GOOSE (0x88B8)"),
            GooseError::MissingPdu => write!(f, "missing goosePdu tag 0x61"),
            GooseError::Truncated => write!(f, "TLV length overruns the frame"),
            GooseError::UnsupportedLength(n) => {
                write!(f, "unsupported BER length of {} bytes", n)
            }
            GooseError::EmptyGocbRef => write!(f, "gocbRef is empty"),
        }
    }
}

impl std::error::Error for GooseError {}

/// Decoded GOOSE message fields relevant to the stop listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GooseMessage {
    pub app_id: u16,
    pub gocb_ref: String,
    pub time_allowed_to_live: u32,
    pub dat_set: String,
    pub st_num: u32,
    pub sq_num: u32,
}

/// Fast EtherType check, tolerating an optional 802.1Q tag.
pub fn is_goose_frame(frame: &[u8]) -> bool {
    if frame.len() < 14 {
        return false;
    }
    let offset = if frame[12..14] == [0x81, 0x00] { 16 } else { 12 };
    frame.len() >= offset + 2
        && u16::from_be_bytes([frame[offset], frame[offset + 1]]) == ETHERTYPE_GOOSE
}

impl GooseMessage {
    /// Decode a raw Ethernet frame. Returns `Ok` only for a well-formed
    /// message with a non-empty `gocbRef`.
    pub fn from_frame(frame: &[u8]) -> Result<GooseMessage, GooseError> {
        if frame.len() < MIN_GOOSE_FRAME {
            return Err(GooseError::TooShort);
        }

        let mut offset = 12;
        if frame[offset..offset + 2] == [0x81, 0x00] {
            offset += 4;
        }

        if offset + 2 > frame.len()
            || u16::from_be_bytes([frame[offset], frame[offset + 1]]) != ETHERTYPE_GOOSE
        {
            return Err(GooseError::NotGoose);
        }
        offset += 2;

        if offset + 8 > frame.len() {
            return Err(GooseError::TooShort);
        }
        let app_id = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
        // Length word is informational; reserved1/reserved2 are skipped
        offset += 8;

        if frame.get(offset) != Some(&0x61) {
            return Err(GooseError::MissingPdu);
        }
        offset += 1;

        let (pdu_len, advance) = read_ber_length(frame, offset)?;
        offset += advance;
        if offset + pdu_len > frame.len() {
            return Err(GooseError::Truncated);
        }
        let pdu_end = offset + pdu_len;

        let mut msg = GooseMessage {
            app_id,
            ..GooseMessage::default()
        };

        while offset < pdu_end {
            let tag = frame[offset];
            offset += 1;
            let (field_len, advance) = read_ber_length(frame, offset)?;
            offset += advance;
            if offset + field_len > frame.len() {
                return Err(GooseError::Truncated);
            }
            let field = &frame[offset..offset + field_len];

            match tag {
                0x80 => msg.gocb_ref = String::from_utf8_lossy(field).into_owned(),
                0x81 => {
                    if field_len == 4 {
                        msg.time_allowed_to_live =
                            u32::from_be_bytes([field[0], field[1], field[2], field[3]]);
                    }
                }
                0x82 => msg.dat_set = String::from_utf8_lossy(field).into_owned(),
                0x85 => {
                    if field_len == 4 {
                        msg.st_num = u32::from_be_bytes([field[0], field[1], field[2], field[3]]);
                    }
                }
                0x86 => {
                    if field_len == 4 {
                        msg.sq_num = u32::from_be_bytes([field[0], field[1], field[2], field[3]]);
                    }
                }
                _ => {}
            }
            offset += field_len;
        }

        if msg.gocb_ref.is_empty() {
            return Err(GooseError::EmptyGocbRef);
        }
        Ok(msg)
    }
}

/// Read a BER definite length at `offset`: short form, or long form with one
/// or two length octets. Returns `(length, octets_consumed)`.
fn read_ber_length(frame: &[u8], offset: usize) -> Result<(usize, usize), GooseError> {
    let first = *frame.get(offset).ok_or(GooseError::Truncated)?;
    if first & 0x80 == 0 {
        return Ok((first as usize, 1));
    }
    match first & 0x7F {
        1 => {
            let len = *frame.get(offset + 1).ok_or(GooseError::Truncated)?;
            Ok((len as usize, 2))
        }
        2 => {
            if offset + 3 > frame.len() {
                return Err(GooseError::Truncated);
            }
            let len = u16::from_be_bytes([frame[offset + 1], frame[offset + 2]]);
            Ok((len as usize, 3))
        }
        n => Err(GooseError::UnsupportedLength(n)),
    }
}
