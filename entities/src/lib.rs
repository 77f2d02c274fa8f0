//! Peer and roster models shared by every relaydrop participant.
//!
//! This crate provides:
//! - `Peer`: a display name plus the host name that identifies it.
//! - `Roster`: the ordered list of peers loaded once by the relay and handed
//!   to every client on request. A peer's position decides its data port.
//!
//! Example:
//! ```rust
//! use relaydrop_entities::{Peer, Roster};
//!
//! let roster = Roster::parse("Ann ann-pc\nBob bob-pc\n").unwrap();
//!
//! assert_eq!(roster.index_of("bob-pc"), Some(1));
//! assert_eq!(roster.receive_port(9600, "bob-pc"), Some(9602));
//! assert_eq!(roster.get(0), Some(&Peer::new("Annie", "ann-pc")));
//! ```

mod peer;
mod roster;

pub use peer::Peer;
pub use roster::{Roster, RosterError};
