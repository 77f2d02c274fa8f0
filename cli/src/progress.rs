use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use relaydrop_client::ClientEvent;
use relaydrop_relay::RelayEvent;
use relaydropx_common::Subscriber;
use uuid::Uuid;

/// Prints client events, with one spinner per file in transit.
pub struct ClientProgress {
    id: String,
    verbose: bool,
    print_rosters: bool,
    mp: MultiProgress,
    bars: RwLock<HashMap<String, ProgressBar>>,
}

impl ClientProgress {
    pub fn new(verbose: bool, print_rosters: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            verbose,
            print_rosters,
            mp: MultiProgress::new(),
            bars: RwLock::new(HashMap::new()),
        }
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::with_template("{spinner:.green} {msg} ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }

    fn start_bar(&self, key: String, message: String) {
        let pb = self.mp.add(ProgressBar::new_spinner());
        pb.set_style(Self::spinner_style());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message(message);
        let mut bars =
            self.bars.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = bars.insert(key, pb) {
            previous.abandon();
        }
    }

    fn finish_bar(&self, key: &str, message: String) {
        let bar = self
            .bars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match bar {
            Some(pb) => pb.finish_with_message(message),
            None => self.println(message),
        }
    }

    /// Stops every running spinner after a failed batch.
    fn abandon_bars(&self) {
        let bars = std::mem::take(
            &mut *self.bars.write().unwrap_or_else(PoisonError::into_inner),
        );
        for pb in bars.into_values() {
            pb.abandon();
        }
    }

    fn println(&self, message: impl AsRef<str>) {
        let _ = self.mp.println(message);
    }
}

impl Subscriber<ClientEvent> for ClientProgress {
    fn get_id(&self) -> String {
        self.id.clone()
    }

    fn log(&self, message: String) {
        if self.verbose {
            self.println(format!("[DEBUG] {}", message));
        }
    }

    fn notify(&self, event: ClientEvent) {
        match event {
            ClientEvent::Connecting { server } => {
                if self.verbose {
                    self.println(format!("Connecting to {}...", server));
                }
            }
            ClientEvent::Connected { server } => {
                self.println(format!("Connected to relay {}", server));
            }
            ClientEvent::Disconnected { server, reason } => {
                self.abandon_bars();
                self.println(format!(
                    "Disconnected from {}: {}",
                    server, reason
                ));
            }
            ClientEvent::RosterChanged { roster } => {
                if self.print_rosters && !roster.is_empty() {
                    self.println("Roster:");
                    for (index, peer) in roster.iter().enumerate() {
                        self.println(format!(
                            "  [{}] {} ({})",
                            index,
                            peer.display_name(),
                            peer.host_name()
                        ));
                    }
                }
            }
            ClientEvent::TransferStarted { receivers } => {
                self.println(format!("Sending to {}", receivers.join(", ")));
            }
            ClientEvent::FileSendStarted { name } => {
                self.start_bar(
                    format!("send:{name}"),
                    format!("Sending {}", name),
                );
            }
            ClientEvent::FileSendFinished { name, size } => {
                self.finish_bar(
                    &format!("send:{name}"),
                    format!("[DONE] Sent {} ({})", name, HumanBytes(size)),
                );
            }
            ClientEvent::BatchSent { peer_host_name } => {
                self.println(format!("Batch handed to {}", peer_host_name));
            }
            ClientEvent::SendFailed { reason } => {
                self.abandon_bars();
                self.println(format!("[ERROR] Send failed: {}", reason));
            }
            ClientEvent::FileReceiveStarted { name, size } => {
                self.start_bar(
                    format!("receive:{name}"),
                    format!("Receiving {} ({})", name, HumanBytes(size)),
                );
            }
            ClientEvent::FileReceiveFinished { name, path } => {
                self.finish_bar(
                    &format!("receive:{name}"),
                    format!("[DONE] Received {} -> {}", name, path.display()),
                );
            }
            ClientEvent::BatchReceived => {
                self.println("All files of the batch received");
            }
            ClientEvent::ReceiveFailed { reason } => {
                self.abandon_bars();
                self.println(format!("[ERROR] Receive failed: {}", reason));
            }
        }
    }
}

/// Prints relay events as status lines.
pub struct RelayPrinter {
    id: String,
    verbose: bool,
}

impl RelayPrinter {
    pub fn new(verbose: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            verbose,
        }
    }
}

impl Subscriber<RelayEvent> for RelayPrinter {
    fn get_id(&self) -> String {
        self.id.clone()
    }

    fn log(&self, message: String) {
        if self.verbose {
            println!("[DEBUG] {}", message);
        }
    }

    fn notify(&self, event: RelayEvent) {
        let line = match event {
            RelayEvent::Started { ports } => format!(
                "Relay listening on control port {} and data port {}",
                ports.control_port, ports.data_port
            ),
            RelayEvent::ClientConnected { host_name } => {
                format!("{} connected", host_name)
            }
            RelayEvent::ClientDisconnected { host_name } => {
                format!("{} disconnected", host_name)
            }
            RelayEvent::ClientRejected { address, host_name } => {
                format!(
                    "Rejected {} ({}): not in the roster",
                    host_name, address
                )
            }
            RelayEvent::ReceiverAdded { .. } => return,
            RelayEvent::FileReceiveStarted {
                source_host_name,
                name,
                size,
            } => format!(
                "Receiving {} ({}) from {}",
                name,
                HumanBytes(size),
                source_host_name
            ),
            RelayEvent::FileReceiveFinished { name, .. } => {
                format!("Received {}", name)
            }
            RelayEvent::BatchReceived { source_host_name } => {
                format!("Received all files from {}", source_host_name)
            }
            RelayEvent::UploadFailed {
                source_host_name,
                reason,
            } => format!(
                "[ERROR] Upload from {} failed: {}",
                source_host_name, reason
            ),
            RelayEvent::UnknownReceivers {
                source_host_name,
                host_names,
            } => format!(
                "[WARN] {} named peers outside the roster: {}",
                source_host_name,
                host_names.join(", ")
            ),
            RelayEvent::JobRegistered {
                source_host_name,
                receivers,
                files,
                ..
            } => format!(
                "{} file(s) from {} waiting for {}",
                files.len(),
                source_host_name,
                receivers.join(", ")
            ),
            RelayEvent::FileSendStarted { receiver, name } => {
                format!("Transferring {} to {}", name, receiver)
            }
            RelayEvent::FileSendFinished { .. } => return,
            RelayEvent::BatchSent { receiver } => {
                format!("Delivered pending files to {}", receiver)
            }
            RelayEvent::FanOutFailed { receiver, reason } => {
                format!("[ERROR] Delivery to {} failed: {}", receiver, reason)
            }
            RelayEvent::FanOutRejected { host_name } => {
                if !self.verbose {
                    return;
                }
                format!("Nothing pending for {}", host_name)
            }
            RelayEvent::FilesReleased { paths } => {
                if !self.verbose {
                    return;
                }
                format!("Removed {} staged file(s)", paths.len())
            }
            RelayEvent::Stopped => "Relay stopped".to_string(),
        };
        println!("{}", line);
    }
}
