use relaydropx_common::{Subscriber, Subscribers};
use relaydropx_receiver::ReceiveFilesEvent;
use relaydropx_sender::SendFilesEvent;
use uuid::Uuid;

use crate::RelayEvent;

/// Tags the events of one upload with the peer it was pulled from.
pub(crate) struct UploadForwarder {
    id: String,
    source_host_name: String,
    subscribers: Subscribers<RelayEvent>,
}

impl UploadForwarder {
    pub(crate) fn new(
        source_host_name: &str,
        subscribers: Subscribers<RelayEvent>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_host_name: source_host_name.to_string(),
            subscribers,
        }
    }
}

impl Subscriber<ReceiveFilesEvent> for UploadForwarder {
    fn get_id(&self) -> String {
        self.id.clone()
    }

    fn log(&self, message: String) {
        self.subscribers.log(message);
    }

    fn notify(&self, event: ReceiveFilesEvent) {
        let source_host_name = self.source_host_name.clone();
        self.subscribers.notify(match event {
            ReceiveFilesEvent::ReceiverAdded { host_name } => {
                RelayEvent::ReceiverAdded {
                    source_host_name,
                    host_name,
                }
            }
            ReceiveFilesEvent::FileReceiveStarted { name, size } => {
                RelayEvent::FileReceiveStarted {
                    source_host_name,
                    name,
                    size,
                }
            }
            ReceiveFilesEvent::FileReceiveFinished { name, path } => {
                RelayEvent::FileReceiveFinished {
                    source_host_name,
                    name,
                    path,
                }
            }
            ReceiveFilesEvent::BatchReceived { .. } => {
                RelayEvent::BatchReceived { source_host_name }
            }
            ReceiveFilesEvent::Failed { reason } => RelayEvent::UploadFailed {
                source_host_name,
                reason,
            },
        });
    }
}

/// Tags the events of one fan-out hand-off with its receiver.
pub(crate) struct FanOutForwarder {
    id: String,
    receiver: String,
    subscribers: Subscribers<RelayEvent>,
}

impl FanOutForwarder {
    pub(crate) fn new(
        receiver: &str,
        subscribers: Subscribers<RelayEvent>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            receiver: receiver.to_string(),
            subscribers,
        }
    }
}

impl Subscriber<SendFilesEvent> for FanOutForwarder {
    fn get_id(&self) -> String {
        self.id.clone()
    }

    fn log(&self, message: String) {
        self.subscribers.log(message);
    }

    fn notify(&self, event: SendFilesEvent) {
        let receiver = self.receiver.clone();
        self.subscribers.notify(match event {
            SendFilesEvent::FileSendStarted { name } => {
                RelayEvent::FileSendStarted { receiver, name }
            }
            SendFilesEvent::FileSendFinished { name, size } => {
                RelayEvent::FileSendFinished {
                    receiver,
                    name,
                    size,
                }
            }
            SendFilesEvent::BatchSent { .. } => {
                RelayEvent::BatchSent { receiver }
            }
            SendFilesEvent::Failed { reason } => {
                RelayEvent::FanOutFailed { receiver, reason }
            }
        });
    }
}
