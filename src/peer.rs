use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of the remote end of one connection.
///
/// Two peers are the same peer when their addresses compare equal
/// case-insensitively and their ports match, regardless of which in-memory
/// instance is being looked at.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    /// Address or host name of the remote end.
    pub host: String,
    /// Port number of the remote end.
    pub port: u16,
    /// Whether the connection to this peer is TLS-protected.
    pub secure: bool,
    /// Externally assigned index; the registry numbers peers on add.
    pub index: i32,
    /// Challenge value that was in force when this peer was admitted.
    pub challenge: Option<String>,
}

impl PeerInfo {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
            index: 0,
            challenge: None,
        }
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl Eq for PeerInfo {}

impl Hash for PeerInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.to_ascii_lowercase().hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_is_case_insensitive_on_host() {
        assert_eq!(PeerInfo::new("Host", 10, false), PeerInfo::new("host", 10, false));
        assert_ne!(PeerInfo::new("host", 10, false), PeerInfo::new("host", 11, false));
        assert_ne!(PeerInfo::new("hosta", 10, false), PeerInfo::new("hostb", 10, false));
    }

    #[test]
    fn equality_ignores_metadata_fields() {
        let mut a = PeerInfo::new("10.0.0.1", 9000, true);
        let mut b = PeerInfo::new("10.0.0.1", 9000, false);
        a.index = 3;
        b.challenge = Some("bob".to_string());
        assert_eq!(a, b);
    }

    #[test]
    fn hash_agrees_with_equality() {
        let mut set = HashSet::new();
        set.insert(PeerInfo::new("Example", 443, true));
        assert!(set.contains(&PeerInfo::new("example", 443, false)));
        assert!(!set.contains(&PeerInfo::new("example", 444, false)));
    }

    #[test]
    fn display_is_host_colon_port() {
        assert_eq!(PeerInfo::new("127.0.0.1", 8080, false).to_string(), "127.0.0.1:8080");
    }
}
