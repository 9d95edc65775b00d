//! Cluster-wide addresses.
//!
//! A [`MailBox`] names an entity (or a whole instance) together with the network
//! location of the process hosting it. Routing compares mailboxes at two
//! granularities: by id alone for logical identity, and by the full tuple to
//! notice that a peer came back on a different address.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable address of an entity or instance inside the mesh.
///
/// The derived `PartialEq` compares the full tuple. Use
/// [`MailBox::compare_only_id`] when only logical identity matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MailBox {
    /// Globally unique id within a host
    pub id: String,
    /// Ip of the hosting instance
    pub ip: String,
    /// Port of the hosting instance
    pub port: u16,
    /// Host number of the hosting instance
    pub host_num: u32,
}

impl MailBox {
    /// Creates a new mailbox.
    pub fn new(id: impl Into<String>, ip: impl Into<String>, port: u16, host_num: u32) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
            port,
            host_num,
        }
    }

    /// Logical identity check, ignoring the network location.
    pub fn compare_only_id(&self, other: &MailBox) -> bool {
        self.id == other.id
    }

    /// True when both mailboxes live on the same instance.
    pub fn compare_only_address(&self, other: &MailBox) -> bool {
        self.ip == other.ip && self.port == other.port && self.host_num == other.host_num
    }

    /// Full tuple comparison. Equivalent to `==`.
    pub fn compare_full(&self, other: &MailBox) -> bool {
        self == other
    }

    /// Returns a copy of this mailbox re-addressed to another entity id on the
    /// same instance.
    pub fn with_id(&self, id: impl Into<String>) -> MailBox {
        MailBox {
            id: id.into(),
            ip: self.ip.clone(),
            port: self.port,
            host_num: self.host_num,
        }
    }

    /// The `ip:port` pair used to open a TCP connection to the hosting instance.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for MailBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}#{}", self.id, self.ip, self.port, self.host_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparison_granularities() {
        let a = MailBox::new("server_0", "127.0.0.1", 9001, 1);
        let moved = MailBox::new("server_0", "127.0.0.1", 9101, 1);
        let sibling = a.with_id("entity_42");

        assert!(a.compare_only_id(&moved));
        assert!(!a.compare_full(&moved));
        assert_ne!(a, moved);

        assert!(a.compare_only_address(&sibling));
        assert!(!a.compare_only_id(&sibling));
    }

    #[test]
    fn test_display_and_socket_address() {
        let mb = MailBox::new("gate_0", "10.0.0.2", 7000, 3);
        assert_eq!(mb.socket_address(), "10.0.0.2:7000");
        assert_eq!(mb.to_string(), "gate_0@10.0.0.2:7000#3");
    }
}
