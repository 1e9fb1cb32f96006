use crate::error::{Error, ErrorCode, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 128-bit identifier uniquely naming a node instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh random NodeID
    pub fn new_random() -> Self {
        NodeId(Uuid::new_v4())
    }

    /// The all-zero NodeID, meaning "any node"
    pub fn any() -> Self {
        NodeId(Uuid::nil())
    }

    pub fn is_any(&self) -> bool {
        self.0.is_nil()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        NodeId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId::any()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for NodeId {
    type Err = Error;

    /// Accepts the hyphenated GUID form, optionally wrapped in `{}`
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s
            .trim()
            .trim_start_matches('{')
            .trim_end_matches('}');
        Uuid::parse_str(trimmed)
            .map(NodeId)
            .map_err(|_| Error::InvalidArgument(format!("Invalid NodeID: {}", s)))
    }
}

/// Routing information shared by every entry of a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub sender_node_id: NodeId,
    pub receiver_node_id: NodeId,
    pub sender_endpoint: u32,
    pub receiver_endpoint: u32,
    pub sender_node_name: String,
    pub receiver_node_name: String,
    pub metadata: String,
    pub message_id: u16,
    pub message_res_id: u16,
}

/// Entry kinds. The transport interprets the stream and connect kinds;
/// everything else is passed through to the node untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageEntryType {
    StreamOp,
    StreamOpRet,
    StreamCheckCapability,
    StreamCheckCapabilityRet,
    StringTableOp,
    StringTableOpRet,
    ConnectionTest,
    ConnectionTestRet,
    ConnectClient,
    ConnectClientRet,
    ConnectClientCombined,
    ConnectClientCombinedRet,
    Other(u16),
}

impl MessageEntryType {
    /// Entries used for stream negotiation, always framed as Message2
    pub fn is_stream_negotiation(&self) -> bool {
        matches!(
            self,
            MessageEntryType::StreamOp
                | MessageEntryType::StreamOpRet
                | MessageEntryType::StreamCheckCapability
                | MessageEntryType::StreamCheckCapabilityRet
        )
    }
}

/// Payload of a single element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElementData {
    Void,
    String(String),
    UInt32(u32),
    Int32(i32),
    Double(f64),
    Bytes(Vec<u8>),
    Elements(Vec<MessageElement>),
}

/// Named value inside an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageElement {
    pub name: String,
    pub data: ElementData,
}

impl MessageElement {
    pub fn new(name: impl Into<String>, data: ElementData) -> Self {
        MessageElement {
            name: name.into(),
            data,
        }
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        MessageElement::new(name, ElementData::String(value.into()))
    }

    pub fn uint32(name: impl Into<String>, value: u32) -> Self {
        MessageElement::new(name, ElementData::UInt32(value))
    }

    pub fn as_str(&self) -> Result<&str> {
        match &self.data {
            ElementData::String(s) => Ok(s),
            _ => Err(Error::Protocol(format!(
                "Element {} is not a string",
                self.name
            ))),
        }
    }

    pub fn as_u32(&self) -> Result<u32> {
        match &self.data {
            ElementData::UInt32(v) => Ok(*v),
            _ => Err(Error::Protocol(format!(
                "Element {} is not a uint32",
                self.name
            ))),
        }
    }

    pub fn as_elements(&self) -> Result<&[MessageElement]> {
        match &self.data {
            ElementData::Elements(v) => Ok(v),
            _ => Err(Error::Protocol(format!(
                "Element {} is not a nested element list",
                self.name
            ))),
        }
    }
}

/// One request, response or event inside a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub entry_type: MessageEntryType,
    pub service_path: String,
    pub member_name: String,
    pub request_id: u32,
    pub error: ErrorCode,
    pub metadata: String,
    pub elements: Vec<MessageElement>,
}

impl MessageEntry {
    pub fn new(entry_type: MessageEntryType, member_name: impl Into<String>) -> Self {
        MessageEntry {
            entry_type,
            service_path: String::new(),
            member_name: member_name.into(),
            request_id: 0,
            error: ErrorCode::None,
            metadata: String::new(),
            elements: Vec::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: u32) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_element(mut self, element: MessageElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn find_element(&self, name: &str) -> Result<&MessageElement> {
        self.elements
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::Protocol(format!("Element {} not found", name)))
    }

    pub fn try_find_element(&self, name: &str) -> Option<&MessageElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// Build a response entry carrying an error for this request
    pub fn error_response(&self, entry_type: MessageEntryType, err: &Error) -> MessageEntry {
        let mut ret = MessageEntry::new(entry_type, self.member_name.clone())
            .with_request_id(self.request_id)
            .with_element(MessageElement::string("errorname", format!("{:?}", err.code())))
            .with_element(MessageElement::string("errorstring", err.to_string()));
        ret.error = err.code();
        ret
    }

    /// Convert an error response into an `Error`, passing successful entries through
    pub fn into_result(self) -> Result<MessageEntry> {
        if !self.error.is_error() {
            return Ok(self);
        }
        let message = self
            .try_find_element("errorstring")
            .and_then(|e| e.as_str().ok())
            .unwrap_or("")
            .to_string();
        Err(Error::from_remote(self.error, message))
    }
}

/// A message tree as exchanged between two nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub entries: Vec<MessageEntry>,
}

impl Message {
    pub fn new() -> Self {
        Message::default()
    }

    pub fn with_entry(mut self, entry: MessageEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// The first entry, which determines how the transport treats the message
    pub fn first_entry(&self) -> Option<&MessageEntry> {
        self.entries.first()
    }

    pub fn first_entry_type(&self) -> Option<MessageEntryType> {
        self.entries.first().map(|e| e.entry_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_parses_braced_and_plain_forms() {
        let id = NodeId::new_random();
        let plain: NodeId = id.to_string().parse().unwrap();
        let braced: NodeId = format!("{{{}}}", id).parse().unwrap();
        assert_eq!(id, plain);
        assert_eq!(id, braced);
        assert!("not-a-node".parse::<NodeId>().is_err());
        assert!(NodeId::any().is_any());
    }

    #[test]
    fn error_entries_round_trip_into_errors() {
        let request = MessageEntry::new(MessageEntryType::StreamOp, "CreateConnection")
            .with_request_id(7);
        let err = Error::InvalidOperation("already attached".into());
        let ret = request.error_response(MessageEntryType::StreamOpRet, &err);
        assert_eq!(ret.request_id, 7);
        match ret.into_result() {
            Err(Error::InvalidOperation(msg)) => assert!(msg.contains("already attached")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
