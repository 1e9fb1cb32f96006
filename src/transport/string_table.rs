//! Session-scoped string interning for Message4 frames.
//!
//! Each direction has its own dynamic table. A sender proposes codes for
//! strings it uses, and only encodes a string as a code after the peer has
//! confirmed the proposal. The receiver decodes with the codes it confirmed.
//! A fixed set of well-known strings is shared by both peers from the start.

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::*;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::msg::{ElementData, Message, MessageElement, MessageEntry, MessageEntryType};
use crate::{Error, Result};

/// Strings both peers know without negotiation, coded `1..=len`
pub const STATIC_STRINGS: &[&str] = &[
    "CreateConnection",
    "GetRemoteNodeID",
    "GetNodeInfo",
    "nodeid",
    "nodename",
    "target_nodeid",
    "target_nodename",
    "capabilities",
    "return",
    "errorname",
    "errorstring",
    "RobotRaconteurServiceIndex",
    "GetLocalNodeServices",
    "GetRoutedNodes",
    "GetDetectedNodes",
    "servicename",
    "objecttype",
    "attributes",
];

/// First code handed out for dynamic entries
pub const DYNAMIC_CODE_BASE: u32 = 0x100;
/// Dynamic entries per direction
pub const MAX_DYNAMIC_ENTRIES: usize = 1024;
/// Longest string that will be interned
pub const MAX_STRING_LEN: usize = 128;

/// A string on the Message4 wire, either spelled out or replaced by a code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodedString {
    Literal(String),
    Code(u32),
}

fn static_code(s: &str) -> Option<u32> {
    STATIC_STRINGS
        .iter()
        .position(|x| *x == s)
        .map(|i| i as u32 + 1)
}

fn static_string(code: u32) -> Option<&'static str> {
    if code == 0 {
        return None;
    }
    STATIC_STRINGS.get(code as usize - 1).copied()
}

fn internable(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_STRING_LEN
}

#[derive(Debug)]
struct PendingProposal {
    entries: Vec<(u32, String)>,
    sent: Instant,
}

#[derive(Debug, Default)]
struct Tables {
    // Confirmed by the peer, usable for encoding
    local: HashMap<String, u32>,
    // Proposed by us, waiting for confirmation
    confirming: HashMap<String, u32>,
    // Proposed by the peer and accepted by us, used for decoding
    remote: HashMap<u32, String>,
    rejected: HashSet<String>,
    requests: HashMap<u32, PendingProposal>,
    next_code: u32,
    paused: bool,
}

/// String table shared by the send and receive paths of one connection
#[derive(Debug)]
pub struct StringTable {
    tables: Mutex<Tables>,
}

impl Default for StringTable {
    fn default() -> Self {
        StringTable::new()
    }
}

impl StringTable {
    pub fn new() -> Self {
        StringTable {
            tables: Mutex::new(Tables {
                next_code: DYNAMIC_CODE_BASE,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::InvalidOperation("String table lock poisoned".into()))
    }

    /// Code `s` if possible. Strings seen for the first time are queued in
    /// `proposals` unless updates are paused.
    pub fn encode(&self, s: &str, proposals: &mut Vec<(u32, String)>) -> CodedString {
        if let Some(code) = static_code(s) {
            return CodedString::Code(code);
        }
        let mut tables = match self.lock() {
            Ok(t) => t,
            Err(_) => return CodedString::Literal(s.to_string()),
        };
        if let Some(code) = tables.local.get(s) {
            return CodedString::Code(*code);
        }
        let can_propose = !tables.paused
            && internable(s)
            && !tables.confirming.contains_key(s)
            && !tables.rejected.contains(s)
            && tables.local.len() + tables.confirming.len() < MAX_DYNAMIC_ENTRIES
            && !proposals.iter().any(|(_, p)| p == s);
        if can_propose {
            let code = tables.next_code;
            tables.next_code += 1;
            tables.confirming.insert(s.to_string(), code);
            proposals.push((code, s.to_string()));
        }
        CodedString::Literal(s.to_string())
    }

    /// Resolve a received string
    pub fn decode(&self, s: CodedString) -> Result<String> {
        match s {
            CodedString::Literal(s) => Ok(s),
            CodedString::Code(code) => {
                if let Some(s) = static_string(code) {
                    return Ok(s.to_string());
                }
                self.lock()?
                    .remote
                    .get(&code)
                    .cloned()
                    .ok_or_else(|| Error::Protocol(format!("Unknown string table code {}", code)))
            }
        }
    }

    /// Remember a proposal that went out under `request_id`
    pub fn record_proposal(&self, request_id: u32, entries: Vec<(u32, String)>) {
        if let Ok(mut tables) = self.lock() {
            tables.requests.insert(
                request_id,
                PendingProposal {
                    entries,
                    sent: Instant::now(),
                },
            );
        }
    }

    /// Forget proposals that never reached the peer, so their strings can be
    /// proposed again
    pub fn abandon(&self, proposals: &[(u32, String)]) {
        if let Ok(mut tables) = self.lock() {
            for (code, s) in proposals {
                if tables.confirming.get(s) == Some(code) {
                    tables.confirming.remove(s);
                }
            }
        }
    }

    /// Build the `StringTableOp` message carrying a proposal
    pub fn proposal_message(request_id: u32, entries: &[(u32, String)]) -> Message {
        let mut entry = MessageEntry::new(MessageEntryType::StringTableOp, "")
            .with_request_id(request_id);
        for (code, s) in entries {
            entry
                .elements
                .push(MessageElement::new(s.clone(), ElementData::UInt32(*code)));
        }
        Message::new().with_entry(entry)
    }

    /// Accept the peer's proposal, returning the confirmation entry
    pub fn handle_proposal(&self, entry: &MessageEntry) -> Result<MessageEntry> {
        let mut tables = self.lock()?;
        let mut ret = MessageEntry::new(MessageEntryType::StringTableOpRet, "")
            .with_request_id(entry.request_id);
        for el in &entry.elements {
            let code = el.as_u32()?;
            let accept = code >= DYNAMIC_CODE_BASE
                && internable(&el.name)
                && (tables.remote.contains_key(&code) || tables.remote.len() < MAX_DYNAMIC_ENTRIES);
            if !accept {
                continue;
            }
            match tables.remote.get(&code) {
                Some(existing) if *existing != el.name => {
                    // Codes are never reassigned within a session
                    warn!("Peer reassigned string table code {}", code);
                    continue;
                }
                _ => {}
            }
            tables.remote.insert(code, el.name.clone());
            ret.elements.push(MessageElement::uint32("", code));
        }
        Ok(ret)
    }

    /// Apply the peer's confirmation of an earlier proposal
    pub fn handle_confirmation(&self, entry: &MessageEntry) -> Result<()> {
        let mut tables = self.lock()?;
        let pending = match tables.requests.remove(&entry.request_id) {
            Some(p) => p,
            None => {
                debug!(
                    "String table confirmation for unknown request {}",
                    entry.request_id
                );
                return Ok(());
            }
        };
        let accepted: HashSet<u32> = entry
            .elements
            .iter()
            .filter_map(|e| e.as_u32().ok())
            .collect();
        for (code, s) in pending.entries {
            tables.confirming.remove(&s);
            if accepted.contains(&code) {
                tables.local.insert(s, code);
            } else {
                tables.rejected.insert(s);
            }
        }
        Ok(())
    }

    /// Drop proposals older than `timeout` so their strings can be proposed again
    pub fn expire_requests(&self, timeout: Duration) {
        let mut tables = match self.lock() {
            Ok(t) => t,
            Err(_) => return,
        };
        let now = Instant::now();
        let stale: Vec<u32> = tables
            .requests
            .iter()
            .filter(|(_, p)| now.duration_since(p.sent) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(p) = tables.requests.remove(&id) {
                debug!("Expiring string table request {}", id);
                for (_, s) in p.entries {
                    tables.confirming.remove(&s);
                }
            }
        }
    }

    /// Freeze the table: no new proposals until `resume_updates`
    pub fn pause_updates(&self) {
        if let Ok(mut tables) = self.lock() {
            tables.paused = true;
        }
    }

    pub fn resume_updates(&self) {
        if let Ok(mut tables) = self.lock() {
            tables.paused = false;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.lock().map(|t| t.paused).unwrap_or(true)
    }

    /// Whether `s` can be sent as a code
    pub fn is_confirmed(&self, s: &str) -> bool {
        static_code(s).is_some() || self.lock().map(|t| t.local.contains_key(s)).unwrap_or(false)
    }

    pub fn pending_requests(&self) -> usize {
        self.lock().map(|t| t.requests.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_strings_are_always_coded() {
        let table = StringTable::new();
        let mut proposals = Vec::new();
        let coded = table.encode("CreateConnection", &mut proposals);
        assert_eq!(coded, CodedString::Code(1));
        assert!(proposals.is_empty());
        assert_eq!(table.decode(coded).unwrap(), "CreateConnection");
    }

    #[test]
    fn strings_are_coded_only_after_confirmation() {
        let sender = StringTable::new();
        let receiver = StringTable::new();

        let mut proposals = Vec::new();
        let first = sender.encode("com.example.Robot", &mut proposals);
        assert_eq!(first, CodedString::Literal("com.example.Robot".into()));
        assert_eq!(proposals.len(), 1);

        // Still pending, so still literal and not proposed twice
        let mut again = Vec::new();
        let second = sender.encode("com.example.Robot", &mut again);
        assert!(matches!(second, CodedString::Literal(_)));
        assert!(again.is_empty());

        sender.record_proposal(9, proposals.clone());
        let msg = StringTable::proposal_message(9, &proposals);
        let confirm = receiver.handle_proposal(&msg.entries[0]).unwrap();
        sender.handle_confirmation(&confirm).unwrap();

        let mut none = Vec::new();
        let coded = sender.encode("com.example.Robot", &mut none);
        assert_eq!(coded, CodedString::Code(DYNAMIC_CODE_BASE));
        assert_eq!(receiver.decode(coded).unwrap(), "com.example.Robot");
        assert_eq!(sender.pending_requests(), 0);
    }

    #[test]
    fn unknown_codes_fail_to_decode() {
        let table = StringTable::new();
        assert!(matches!(
            table.decode(CodedString::Code(DYNAMIC_CODE_BASE + 5)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn paused_table_makes_no_proposals() {
        let table = StringTable::new();
        table.pause_updates();
        let mut proposals = Vec::new();
        table.encode("some.member", &mut proposals);
        assert!(proposals.is_empty());
        table.resume_updates();
        table.encode("some.member", &mut proposals);
        assert_eq!(proposals.len(), 1);
    }

    #[test]
    fn abandoned_proposals_can_be_made_again() {
        let table = StringTable::new();
        let mut proposals = Vec::new();
        table.encode("member", &mut proposals);
        table.abandon(&proposals);

        let mut again = Vec::new();
        table.encode("member", &mut again);
        assert_eq!(again.len(), 1);
        assert_ne!(again[0].0, proposals[0].0);
        assert_eq!(table.pending_requests(), 0);
    }

    #[test]
    fn expired_proposals_can_be_made_again() {
        let table = StringTable::new();
        let mut proposals = Vec::new();
        table.encode("member", &mut proposals);
        table.record_proposal(1, proposals);
        std::thread::sleep(std::time::Duration::from_millis(5));
        table.expire_requests(Duration::from_millis(1));
        let mut again = Vec::new();
        table.encode("member", &mut again);
        assert_eq!(again.len(), 1);
    }
}
