//! Framing of whole messages on a byte stream.
//!
//! Every frame starts with the 8-byte preamble (`"RRAC"` + u32 LE total
//! frame length, header included) followed by a u16 LE wire version:
//!
//! ```text
//! +------+--------------+---------+-----------------------------+
//! | RRAC | u32 length   | u16 ver | postcard body               |
//! +------+--------------+---------+-----------------------------+
//! ```
//!
//! Version 2 bodies are the plain message tree. Version 4 bodies replace
//! paths, member names and element names with `CodedString`s so the
//! string table can shorten them.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::msg::{
    ElementData, Message, MessageElement, MessageEntry, MessageEntryType, MessageHeader,
};
use crate::transport::string_table::{CodedString, StringTable};
use crate::{Error, Result};

pub const MAGIC: &[u8; 4] = b"RRAC";
/// Magic plus length
pub const PREAMBLE_LEN: usize = 8;
/// Preamble plus version
pub const HEADER_LEN: usize = 10;

/// Wire format of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireVersion {
    Message2,
    Message4,
}

impl WireVersion {
    pub fn as_u16(&self) -> u16 {
        match self {
            WireVersion::Message2 => 2,
            WireVersion::Message4 => 4,
        }
    }
}

/// Decoded fixed header of an incoming frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length including the header
    pub length: usize,
    pub version: WireVersion,
}

/// Validate the fixed header at the start of `bytes`.
///
/// `limit` is the largest frame currently accepted. A bad magic on the very
/// first frame of a stream means the peer is not speaking this protocol at
/// all, which is reported as a connection failure.
pub fn parse_header(bytes: &[u8], limit: usize, first_frame: bool) -> Result<FrameHeader> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Protocol("Incomplete frame header".into()));
    }
    if &bytes[0..4] != MAGIC {
        let msg = "Invalid message magic".to_string();
        return Err(if first_frame {
            Error::Connection(msg)
        } else {
            Error::Protocol(msg)
        });
    }
    let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if length <= HEADER_LEN {
        return Err(Error::Protocol(format!("Invalid message length {}", length)));
    }
    if length > limit {
        return Err(Error::Protocol(format!(
            "Message length {} exceeds maximum message size {}",
            length, limit
        )));
    }
    let version = match u16::from_le_bytes([bytes[8], bytes[9]]) {
        2 => WireVersion::Message2,
        4 => WireVersion::Message4,
        v => return Err(Error::Protocol(format!("Unsupported message version {}", v))),
    };
    Ok(FrameHeader { length, version })
}

fn frame(version: WireVersion, body: Vec<u8>) -> Result<Vec<u8>> {
    let length = HEADER_LEN + body.len();
    let length32 = u32::try_from(length)
        .map_err(|_| Error::Protocol("Message too large to frame".into()))?;
    let mut out = Vec::with_capacity(length);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&length32.to_le_bytes());
    out.extend_from_slice(&version.as_u16().to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Frame a message in the Message2 format
pub fn encode_message2(message: &Message) -> Result<Vec<u8>> {
    let body = postcard::to_allocvec(message)?;
    frame(WireVersion::Message2, body)
}

/// Frame a message in the Message4 format.
///
/// With a string table, strings without a confirmed code are sent literally
/// and pushed to `proposals` for the caller to offer to the peer.
pub fn encode_message4(
    message: &Message,
    table: Option<&StringTable>,
    proposals: &mut Vec<(u32, String)>,
) -> Result<Vec<u8>> {
    let mut coder = |s: &str| match table {
        Some(table) => table.encode(s, proposals),
        None => CodedString::Literal(s.to_string()),
    };
    let wire = WireMessage4 {
        header: message.header.clone(),
        entries: message
            .entries
            .iter()
            .map(|e| WireEntry4::from_entry(e, &mut coder))
            .collect(),
    };
    let body = postcard::to_allocvec(&wire)?;
    frame(WireVersion::Message4, body)
}

fn malformed_body(e: postcard::Error) -> Error {
    Error::Protocol(format!("Malformed message body: {}", e))
}

/// Decode a complete frame (header included) into a message
pub fn decode_frame(
    frame: &[u8],
    header: &FrameHeader,
    table: Option<&StringTable>,
) -> Result<Message> {
    if frame.len() != header.length {
        return Err(Error::Protocol("Frame length mismatch".into()));
    }
    let body = &frame[HEADER_LEN..];
    match header.version {
        WireVersion::Message2 => {
            let (message, rest) =
                postcard::take_from_bytes::<Message>(body).map_err(malformed_body)?;
            if !rest.is_empty() {
                return Err(Error::Protocol("Trailing bytes after message body".into()));
            }
            Ok(message)
        }
        WireVersion::Message4 => {
            let (wire, rest) =
                postcard::take_from_bytes::<WireMessage4>(body).map_err(malformed_body)?;
            if !rest.is_empty() {
                return Err(Error::Protocol("Trailing bytes after message body".into()));
            }
            let mut decoder = |s: CodedString| match table {
                Some(table) => table.decode(s),
                None => match s {
                    CodedString::Literal(s) => Ok(s),
                    CodedString::Code(c) => Err(Error::Protocol(format!(
                        "String table code {} received without a string table",
                        c
                    ))),
                },
            };
            let entries = wire
                .entries
                .into_iter()
                .map(|e| e.into_entry(&mut decoder))
                .collect::<Result<Vec<_>>>()?;
            Ok(Message {
                header: wire.header,
                entries,
            })
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage4 {
    header: MessageHeader,
    entries: Vec<WireEntry4>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEntry4 {
    entry_type: MessageEntryType,
    service_path: CodedString,
    member_name: CodedString,
    request_id: u32,
    error: ErrorCode,
    metadata: String,
    elements: Vec<WireElement4>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireElement4 {
    name: CodedString,
    data: WireData4,
}

#[derive(Debug, Serialize, Deserialize)]
enum WireData4 {
    Void,
    String(String),
    UInt32(u32),
    Int32(i32),
    Double(f64),
    Bytes(Vec<u8>),
    Elements(Vec<WireElement4>),
}

impl WireEntry4 {
    fn from_entry(e: &MessageEntry, coder: &mut impl FnMut(&str) -> CodedString) -> Self {
        WireEntry4 {
            entry_type: e.entry_type,
            service_path: coder(&e.service_path),
            member_name: coder(&e.member_name),
            request_id: e.request_id,
            error: e.error,
            metadata: e.metadata.clone(),
            elements: e
                .elements
                .iter()
                .map(|el| WireElement4::from_element(el, &mut *coder))
                .collect(),
        }
    }

    fn into_entry(
        self,
        decoder: &mut impl FnMut(CodedString) -> Result<String>,
    ) -> Result<MessageEntry> {
        Ok(MessageEntry {
            entry_type: self.entry_type,
            service_path: decoder(self.service_path)?,
            member_name: decoder(self.member_name)?,
            request_id: self.request_id,
            error: self.error,
            metadata: self.metadata,
            elements: self
                .elements
                .into_iter()
                .map(|el| el.into_element(&mut *decoder))
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

impl WireElement4 {
    fn from_element(
        el: &MessageElement,
        coder: &mut impl FnMut(&str) -> CodedString,
    ) -> Self {
        let data = match &el.data {
            ElementData::Void => WireData4::Void,
            ElementData::String(s) => WireData4::String(s.clone()),
            ElementData::UInt32(v) => WireData4::UInt32(*v),
            ElementData::Int32(v) => WireData4::Int32(*v),
            ElementData::Double(v) => WireData4::Double(*v),
            ElementData::Bytes(v) => WireData4::Bytes(v.clone()),
            ElementData::Elements(v) => WireData4::Elements(
                v.iter()
                    .map(|el| WireElement4::from_element(el, &mut *coder))
                    .collect(),
            ),
        };
        WireElement4 {
            name: coder(&el.name),
            data,
        }
    }

    fn into_element(
        self,
        decoder: &mut impl FnMut(CodedString) -> Result<String>,
    ) -> Result<MessageElement> {
        let data = match self.data {
            WireData4::Void => ElementData::Void,
            WireData4::String(s) => ElementData::String(s),
            WireData4::UInt32(v) => ElementData::UInt32(v),
            WireData4::Int32(v) => ElementData::Int32(v),
            WireData4::Double(v) => ElementData::Double(v),
            WireData4::Bytes(v) => ElementData::Bytes(v),
            WireData4::Elements(v) => ElementData::Elements(
                v.into_iter()
                    .map(|el| el.into_element(&mut *decoder))
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        Ok(MessageElement {
            name: decoder(self.name)?,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::NodeId;
    use crate::transport::buffer::RECV_BUFFER_SIZE;

    fn sample(payload_len: usize) -> Message {
        let mut msg = Message::new().with_entry(
            MessageEntry::new(MessageEntryType::Other(1), "position")
                .with_request_id(3)
                .with_element(MessageElement::new(
                    "data",
                    ElementData::Bytes(vec![0xAB; payload_len]),
                ))
                .with_element(MessageElement::new(
                    "nested",
                    ElementData::Elements(vec![MessageElement::uint32("x", 9)]),
                )),
        );
        msg.header.sender_node_id = NodeId::new_random();
        msg.header.sender_endpoint = 42;
        msg
    }

    #[test]
    fn message2_frames_round_trip() {
        let msg = sample(16);
        let bytes = encode_message2(&msg).unwrap();
        let header = parse_header(&bytes, usize::MAX, true).unwrap();
        assert_eq!(header.version, WireVersion::Message2);
        assert_eq!(header.length, bytes.len());
        assert_eq!(decode_frame(&bytes, &header, None).unwrap(), msg);
    }

    #[test]
    fn message4_frames_round_trip_around_the_read_buffer_size() {
        for len in [RECV_BUFFER_SIZE / 2, RECV_BUFFER_SIZE * 3] {
            let msg = sample(len);
            let mut proposals = Vec::new();
            let bytes = encode_message4(&msg, None, &mut proposals).unwrap();
            let header = parse_header(&bytes, usize::MAX, false).unwrap();
            assert_eq!(header.version, WireVersion::Message4);
            assert_eq!(decode_frame(&bytes, &header, None).unwrap(), msg);
        }
    }

    #[test]
    fn bad_magic_is_a_connection_error_only_on_the_first_frame() {
        let mut bytes = encode_message2(&sample(1)).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            parse_header(&bytes, usize::MAX, true),
            Err(Error::Connection(_))
        ));
        assert!(matches!(
            parse_header(&bytes, usize::MAX, false),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn zero_and_oversized_lengths_are_rejected() {
        let mut bytes = encode_message2(&sample(1)).unwrap();
        let limit = bytes.len() - 1;
        assert!(matches!(
            parse_header(&bytes, limit, false),
            Err(Error::Protocol(_))
        ));
        bytes[4..8].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            parse_header(&bytes, usize::MAX, false),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn truncated_bodies_are_protocol_errors() {
        let msg = sample(16);
        for bytes in [
            encode_message2(&msg).unwrap(),
            encode_message4(&msg, None, &mut Vec::new()).unwrap(),
        ] {
            let mut cut = bytes[..bytes.len() - 5].to_vec();
            let len = cut.len() as u32;
            cut[4..8].copy_from_slice(&len.to_le_bytes());
            let header = parse_header(&cut, usize::MAX, false).unwrap();
            assert!(matches!(
                decode_frame(&cut, &header, None),
                Err(Error::Protocol(_))
            ));
        }
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let mut bytes = encode_message2(&sample(1)).unwrap();
        bytes[8] = 3;
        assert!(matches!(
            parse_header(&bytes, usize::MAX, false),
            Err(Error::Protocol(_))
        ));
    }
}
