use std::{
    fmt,
    hash::{Hash, Hasher},
};

/// A known participant of the roster.
///
/// Identity is the host name alone: two peers with different display names
/// but the same host name are the same peer.
#[derive(Clone, Debug, Eq)]
pub struct Peer {
    display_name: String,
    host_name: String,
}

impl Peer {
    pub fn new(
        display_name: impl Into<String>,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            host_name: host_name.into(),
        }
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.host_name == other.host_name
    }
}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host_name.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.display_name, self.host_name)
    }
}
