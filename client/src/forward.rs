use relaydropx_common::{Subscriber, Subscribers};
use relaydropx_receiver::ReceiveFilesEvent;
use relaydropx_sender::SendFilesEvent;
use tracing::debug;
use uuid::Uuid;

use crate::ClientEvent;

/// Re-emits transfer events as client events.
pub(crate) struct Forwarder {
    id: String,
    subscribers: Subscribers<ClientEvent>,
}

impl Forwarder {
    pub(crate) fn new(subscribers: Subscribers<ClientEvent>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subscribers,
        }
    }
}

impl Subscriber<SendFilesEvent> for Forwarder {
    fn get_id(&self) -> String {
        self.id.clone()
    }

    fn log(&self, message: String) {
        self.subscribers.log(message);
    }

    fn notify(&self, event: SendFilesEvent) {
        let event = match event {
            SendFilesEvent::FileSendStarted { name } => {
                ClientEvent::FileSendStarted { name }
            }
            SendFilesEvent::FileSendFinished { name, size } => {
                ClientEvent::FileSendFinished { name, size }
            }
            SendFilesEvent::BatchSent { peer_host_name } => {
                ClientEvent::BatchSent { peer_host_name }
            }
            SendFilesEvent::Failed { reason } => {
                ClientEvent::SendFailed { reason }
            }
        };
        self.subscribers.notify(event);
    }
}

impl Subscriber<ReceiveFilesEvent> for Forwarder {
    fn get_id(&self) -> String {
        self.id.clone()
    }

    fn log(&self, message: String) {
        self.subscribers.log(message);
    }

    fn notify(&self, event: ReceiveFilesEvent) {
        let event = match event {
            // Pushes to a client are never relayed further.
            ReceiveFilesEvent::ReceiverAdded { host_name } => {
                debug!("Ignoring receiver manifest entry {}", host_name);
                return;
            }
            ReceiveFilesEvent::FileReceiveStarted { name, size } => {
                ClientEvent::FileReceiveStarted { name, size }
            }
            ReceiveFilesEvent::FileReceiveFinished { name, path } => {
                ClientEvent::FileReceiveFinished { name, path }
            }
            ReceiveFilesEvent::BatchReceived { .. } => {
                ClientEvent::BatchReceived
            }
            ReceiveFilesEvent::Failed { reason } => {
                ClientEvent::ReceiveFailed { reason }
            }
        };
        self.subscribers.notify(event);
    }
}
