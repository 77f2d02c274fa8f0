//! Pieces shared by both ends of a relaydrop exchange.
//!
//! - [`wire`]: the binary batch framing used on every data connection.
//! - [`control`]: the line protocol used to query the roster.
//! - [`subscriber`]: observer registry used by every session and engine.
//! - [`resolver`] and [`net`]: peer identity and socket helpers.

pub mod control;
mod error;
pub mod net;
pub mod resolver;
pub mod subscriber;
pub mod wire;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use error::{TransferError, TransferResult};
pub use resolver::{PeerResolver, StaticResolver, SystemResolver};
pub use subscriber::{Subscriber, Subscribers};
pub use wire::{BatchRoute, DEFAULT_CHUNK_SIZE, FileHeader};

/// Delay between attempts of every retrying loop.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(4);

/// TCP ports used by a deployment.
///
/// The relay accepts control connections on `control_port` and uploads and
/// fan-out pulls on `data_port`. The roster peer at index `i` listens on
/// `data_port + i + 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortLayout {
    pub control_port: u16,
    pub data_port: u16,
}

impl Default for PortLayout {
    fn default() -> Self {
        Self {
            control_port: 9000,
            data_port: 9600,
        }
    }
}
