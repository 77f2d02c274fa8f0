//! Client side of a relaydrop deployment.
//!
//! A [`ClientSession`] keeps one peer attached to a relay: a control
//! connection for roster queries, a background roster listener, and a receive
//! loop that keeps pulling whatever the relay has to push. Outbound batches go
//! through [`ClientSession::send`]. Everything observable is reported as a
//! [`ClientEvent`].

mod auto_connect;
mod forward;
mod session;

use std::{env, net::IpAddr, path::PathBuf, time::Duration};

use relaydrop_entities::Roster;
use relaydropx_common::{
    DEFAULT_RETRY_INTERVAL, PortLayout, Subscriber, resolver::local_host_name,
};
use relaydropx_receiver::ReceiverConfig;
use relaydropx_sender::SenderConfig;

pub use auto_connect::spawn_auto_connect;
pub use session::{ClientSession, ConnectionState};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    Connecting { server: String },
    Connected { server: String },
    /// The relay could not be reached or went away. The cached roster has
    /// been cleared.
    Disconnected { server: String, reason: String },
    RosterChanged { roster: Roster },
    TransferStarted { receivers: Vec<String> },
    FileSendStarted { name: String },
    FileSendFinished { name: String, size: u64 },
    BatchSent { peer_host_name: String },
    SendFailed { reason: String },
    FileReceiveStarted { name: String, size: u64 },
    FileReceiveFinished { name: String, path: PathBuf },
    BatchReceived,
    ReceiveFailed { reason: String },
}

pub type ClientSubscriber = dyn Subscriber<ClientEvent>;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub ports: PortLayout,
    /// This peer's host name as listed in the roster. Decides the port the
    /// one-shot send listener binds.
    pub host_name: String,
    /// Source address for every connection and listener of this client.
    pub bind_address: Option<IpAddr>,
    /// Where received files land. Can be changed later with
    /// [`ClientSession::set_destination`].
    pub destination: PathBuf,
    /// Pause between two receive sessions.
    pub retry_interval: Duration,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ports: PortLayout::default(),
            host_name: local_host_name(),
            bind_address: None,
            destination: default_destination(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            sender: SenderConfig::default(),
            receiver: ReceiverConfig::default(),
        }
    }
}

/// `$HOME/Downloads` (`%USERPROFILE%\Downloads` on Windows), or the current
/// directory when neither is set.
pub fn default_destination() -> PathBuf {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join("Downloads"))
        .unwrap_or_else(|| PathBuf::from("."))
}
