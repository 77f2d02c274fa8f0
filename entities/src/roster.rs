use std::{fs, path::Path, slice};

use thiserror::Error;

use crate::Peer;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("line {line}: expected `<displayName> <hostName>`")]
    Malformed { line: usize },

    #[error("line {line}: host name `{host_name}` is listed more than once")]
    DuplicateHost { line: usize, host_name: String },

    #[error("couldn't read roster file: {0}")]
    Io(#[from] std::io::Error),
}

/// The ordered, static list of known peers.
///
/// A peer's position in the roster decides the TCP port its receiver
/// listens on (see [`Roster::data_port`]), so the order must be identical
/// on every participant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Roster {
    peers: Vec<Peer>,
}

impl Roster {
    /// Builds a roster, rejecting repeated host names.
    pub fn new(peers: Vec<Peer>) -> Result<Self, RosterError> {
        for (i, peer) in peers.iter().enumerate() {
            if peers[..i].contains(peer) {
                return Err(RosterError::DuplicateHost {
                    line: i + 1,
                    host_name: peer.host_name().to_string(),
                });
            }
        }
        Ok(Self { peers })
    }

    /// Parses the human-editable roster format: one `name hostName` pair per
    /// line. Blank lines and `#` comments are skipped, extra tokens are
    /// ignored.
    pub fn parse(text: &str) -> Result<Self, RosterError> {
        let mut peers: Vec<Peer> = Vec::new();
        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let (Some(name), Some(host)) = (tokens.next(), tokens.next())
            else {
                return Err(RosterError::Malformed { line: i + 1 });
            };
            let peer = Peer::new(name, host);
            if peers.contains(&peer) {
                return Err(RosterError::DuplicateHost {
                    line: i + 1,
                    host_name: host.to_string(),
                });
            }
            peers.push(peer);
        }
        Ok(Self { peers })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Peer> {
        self.peers.get(index)
    }

    pub fn iter(&self) -> slice::Iter<'_, Peer> {
        self.peers.iter()
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// Position of the peer with the given host name.
    pub fn index_of(&self, host_name: &str) -> Option<usize> {
        self.peers
            .iter()
            .position(|p| p.host_name() == host_name)
    }

    pub fn contains(&self, host_name: &str) -> bool {
        self.index_of(host_name).is_some()
    }

    /// Port on which the peer at `index` listens for pushed data:
    /// `base + index + 1`. The unshifted `base` belongs to the relay.
    ///
    /// Returns `None` when `index` is outside the roster or the port would
    /// overflow.
    pub fn data_port(&self, base: u16, index: usize) -> Option<u16> {
        if index >= self.peers.len() {
            return None;
        }
        let offset = u16::try_from(index).ok()?.checked_add(1)?;
        base.checked_add(offset)
    }

    /// Like [`Roster::data_port`], looked up by host name.
    pub fn receive_port(&self, base: u16, host_name: &str) -> Option<u16> {
        self.data_port(base, self.index_of(host_name)?)
    }
}

impl<'a> IntoIterator for &'a Roster {
    type Item = &'a Peer;
    type IntoIter = slice::Iter<'a, Peer>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.iter()
    }
}
