//! The relay of a relaydrop deployment.
//!
//! [`RelayEngine`] serves roster queries on the control port, pulls uploads
//! from every connected peer, stages them, and hands each batch to every
//! receiver it names when that receiver next connects to the data port.
//! Pending deliveries live in a [`jobs::JobTable`].

mod engine;
mod forward;
pub mod jobs;

use std::{env, net::IpAddr, path::PathBuf, time::Duration};

use relaydropx_common::{DEFAULT_RETRY_INTERVAL, PortLayout, Subscriber};
use relaydropx_receiver::ReceiverConfig;
use relaydropx_sender::SenderConfig;
use uuid::Uuid;

pub use engine::RelayEngine;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    Started { ports: PortLayout },
    ClientConnected { host_name: String },
    ClientDisconnected { host_name: String },
    /// A control connection from a host outside the roster. It still gets
    /// roster replies but is never pulled from.
    ClientRejected { address: String, host_name: String },
    ReceiverAdded { source_host_name: String, host_name: String },
    FileReceiveStarted {
        source_host_name: String,
        name: String,
        size: u64,
    },
    FileReceiveFinished {
        source_host_name: String,
        name: String,
        path: PathBuf,
    },
    BatchReceived { source_host_name: String },
    UploadFailed { source_host_name: String, reason: String },
    /// Receivers of an upload that are not in the roster. They are dropped
    /// from the job; an upload naming no known receiver is discarded.
    UnknownReceivers {
        source_host_name: String,
        host_names: Vec<String>,
    },
    JobRegistered {
        job_id: Uuid,
        source_host_name: String,
        receivers: Vec<String>,
        files: Vec<PathBuf>,
    },
    FileSendStarted { receiver: String, name: String },
    FileSendFinished { receiver: String, name: String, size: u64 },
    BatchSent { receiver: String },
    FanOutFailed { receiver: String, reason: String },
    /// A data connection from a host with nothing pending; closed untouched.
    FanOutRejected { host_name: String },
    /// Staged files deleted because no pending delivery needs them.
    FilesReleased { paths: Vec<PathBuf> },
    Stopped,
}

pub type RelaySubscriber = dyn Subscriber<RelayEvent>;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub ports: PortLayout,
    /// Address both listeners bind to, and the source of outbound pulls.
    pub bind_address: Option<IpAddr>,
    /// Where uploads are staged until fanned out. Can be changed later with
    /// [`RelayEngine::set_staging_dir`].
    pub staging_dir: PathBuf,
    /// Pause between two pulls from the same peer when nothing came in.
    pub retry_interval: Duration,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ports: PortLayout::default(),
            bind_address: None,
            staging_dir: env::temp_dir(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            sender: SenderConfig::default(),
            receiver: ReceiverConfig::default(),
        }
    }
}
