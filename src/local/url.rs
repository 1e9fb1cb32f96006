use std::str::FromStr;

use crate::msg::NodeId;
use crate::{Error, Result};

pub const LOCAL_SCHEME: &str = "rr+local";

/// A parsed `rr+local://[user@]localhost/?nodeid=..&nodename=..&service=..` URL
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalUrl {
    /// Owner of the target node, when it runs as another user
    pub username: Option<String>,
    pub node_id: NodeId,
    pub node_name: String,
    pub service: Option<String>,
}

impl LocalUrl {
    /// Build the URL other processes use to reach a node
    pub fn for_node(node_id: NodeId, node_name: &str, username: Option<&str>) -> String {
        let mut url = match username {
            Some(user) => format!("{}://{}@localhost/?nodeid={}", LOCAL_SCHEME, user, node_id),
            None => format!("{}:///?nodeid={}", LOCAL_SCHEME, node_id),
        };
        if !node_name.is_empty() {
            url.push_str("&nodename=");
            url.push_str(node_name);
        }
        url
    }

    /// Whether the URL names a node at all
    pub fn is_addressed(&self) -> bool {
        !self.node_id.is_any() || !self.node_name.is_empty()
    }
}

fn invalid(msg: &str) -> Error {
    Error::Connection(msg.to_string())
}

/// `^[a-zA-Z][a-zA-Z0-9_\-]*$`
pub fn is_valid_username(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = s
                    .get(i + 1..i + 3)
                    .filter(|h| h.bytes().all(|b| b.is_ascii_hexdigit()))
                    .ok_or_else(|| invalid("Malformed URL"))?;
                let byte = u8::from_str_radix(hex, 16).map_err(|_| invalid("Malformed URL"))?;
                out.push(byte);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| invalid("Malformed URL"))
}

impl FromStr for LocalUrl {
    type Err = Error;

    fn from_str(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| invalid("Malformed URL"))?;
        if !scheme.eq_ignore_ascii_case(LOCAL_SCHEME) {
            return Err(invalid("Invalid url for local transport"));
        }

        let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, rest) = rest.split_at(authority_end);
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, query),
            None => (rest, ""),
        };
        if !(path.is_empty() || path == "/") {
            return Err(invalid("Invalid url for local transport"));
        }

        let (username, host) = match authority.rsplit_once('@') {
            Some((user, host)) => (Some(user), host),
            None => (None, authority),
        };
        if host.contains(':') {
            return Err(invalid("Invalid url for local transport"));
        }
        if !(host.is_empty() || host.eq_ignore_ascii_case("localhost")) {
            return Err(invalid("Invalid host for local transport"));
        }
        // A username only makes sense with an explicit localhost
        if username.is_some() && host.is_empty() {
            return Err(invalid("Invalid host for local transport"));
        }
        let username = match username {
            Some(user) => {
                if !is_valid_username(user) {
                    return Err(invalid("Invalid username for local transport"));
                }
                Some(user.to_string())
            }
            None => None,
        };

        let mut parsed = LocalUrl {
            username,
            ..Default::default()
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = percent_decode(value)?;
            match key {
                "nodeid" => {
                    parsed.node_id = value.parse().map_err(|_| {
                        Error::InvalidArgument(format!("Invalid NodeID in url: {}", value))
                    })?
                }
                "nodename" => parsed.node_name = value,
                "service" => parsed.service = Some(value),
                _ => {}
            }
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_urls() {
        let id = NodeId::new_random();
        let url: LocalUrl = format!("rr+local:///?nodeid={{{}}}&nodename=alice&service=robot", id)
            .parse()
            .unwrap();
        assert_eq!(url.node_id, id);
        assert_eq!(url.node_name, "alice");
        assert_eq!(url.service.as_deref(), Some("robot"));
        assert_eq!(url.username, None);

        let url: LocalUrl = "rr+local://bob@localhost/?nodename=alice".parse().unwrap();
        assert_eq!(url.username.as_deref(), Some("bob"));
        assert!(url.node_id.is_any());
    }

    #[test]
    fn rejects_ports_hosts_and_paths() {
        for bad in [
            "rr+local://host:1234/",
            "rr+local://localhost:1234/?nodename=a",
            "rr+local://example.com/?nodename=a",
            "rr+local:///service?nodename=a",
            "rr+tcp://localhost/?nodename=a",
            "rr+local",
        ] {
            assert!(
                matches!(bad.parse::<LocalUrl>(), Err(Error::Connection(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn rejects_invalid_usernames() {
        assert!("rr+local://1bob@localhost/?nodename=a".parse::<LocalUrl>().is_err());
        assert!("rr+local://b.ob@localhost/?nodename=a".parse::<LocalUrl>().is_err());
        assert!(is_valid_username("bob_the-builder2"));
    }

    #[test]
    fn rejects_usernames_without_a_host() {
        for bad in ["rr+local://bob@/?nodename=a", "rr+local://bob@?nodename=a"] {
            assert!(
                matches!(bad.parse::<LocalUrl>(), Err(Error::Connection(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn percent_escapes_must_be_two_hex_digits() {
        let url: LocalUrl = "rr+local:///?nodename=a%5Fb".parse().unwrap();
        assert_eq!(url.node_name, "a_b");
        for bad in [
            "rr+local:///?nodename=a%+1",
            "rr+local:///?nodename=a%-1",
            "rr+local:///?nodename=a%4",
            "rr+local:///?nodename=a%zz",
        ] {
            assert!(
                matches!(bad.parse::<LocalUrl>(), Err(Error::Connection(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn url_for_node_parses_back() {
        let id = NodeId::new_random();
        let url: LocalUrl = LocalUrl::for_node(id, "alice", Some("bob")).parse().unwrap();
        assert_eq!(url.node_id, id);
        assert_eq!(url.node_name, "alice");
        assert_eq!(url.username.as_deref(), Some("bob"));
    }
}
