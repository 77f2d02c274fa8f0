mod handler;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chrono::{DateTime, Utc};
use relaydropx_common::{
    BatchRoute, FileHeader, Subscriber, Subscribers, TransferResult,
};
use tokio::io::AsyncWrite;
use tracing::{error, info};
use uuid::Uuid;

use crate::{SenderConfig, SenderFile};
use handler::Carrier;

/// Progress of one outbound batch, in wire order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendFilesEvent {
    FileSendStarted { name: String },
    FileSendFinished { name: String, size: u64 },
    BatchSent { peer_host_name: String },
    /// Terminal. Nothing further is emitted for this run.
    Failed { reason: String },
}

pub type SendFilesSubscriber = dyn Subscriber<SendFilesEvent>;

pub struct SendFilesRequest {
    pub files: Vec<SenderFile>,
    pub route: BatchRoute,
    pub config: SenderConfig,
}

/// What went down the wire in a successful run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentBatch {
    pub route: BatchRoute,
    pub files: Vec<FileHeader>,
    pub peer_host_name: String,
}

pub struct SendFilesBubble {
    id: String,
    files: Vec<SenderFile>,
    route: BatchRoute,
    config: SenderConfig,
    is_finished: AtomicBool,
    subscribers: Subscribers<SendFilesEvent>,
    created_at: DateTime<Utc>,
}

impl SendFilesBubble {
    pub fn new(request: SendFilesRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            files: request.files,
            route: request.route,
            config: request.config,
            is_finished: AtomicBool::new(false),
            subscribers: Subscribers::new(),
            created_at: Utc::now(),
        }
    }

    pub fn get_id(&self) -> String {
        self.id.clone()
    }

    pub fn get_created_at(&self) -> String {
        self.created_at.to_rfc3339()
    }

    pub fn files(&self) -> &[SenderFile] {
        &self.files
    }

    pub fn route(&self) -> &BatchRoute {
        &self.route
    }

    pub fn is_finished(&self) -> bool {
        self.is_finished.load(Ordering::Acquire)
    }

    pub fn subscribe(&self, subscriber: Arc<SendFilesSubscriber>) {
        self.subscribers.subscribe(subscriber);
    }

    pub fn unsubscribe(&self, subscriber: Arc<SendFilesSubscriber>) {
        self.subscribers.unsubscribe(subscriber);
    }

    /// Pushes the batch down `writer`, then shuts the write side down.
    ///
    /// `peer_host_name` is the resolved identity of the other end and is
    /// reported in [`SendFilesEvent::BatchSent`]. Any failure aborts the run
    /// without retry and is reported once as [`SendFilesEvent::Failed`].
    pub async fn run<W>(
        &self,
        writer: W,
        peer_host_name: &str,
    ) -> TransferResult<SentBatch>
    where
        W: AsyncWrite + Unpin + Send,
    {
        info!(
            "Sending {} files to {} ({} relay receivers)",
            self.files.len(),
            peer_host_name,
            self.route.receivers().len()
        );
        let carrier = Carrier::new(writer, &self.config, &self.subscribers);
        let result = carrier.send_batch(&self.files, &self.route).await;
        match result {
            Ok(files) => {
                if self.config.delete_sources {
                    handler::delete_sources(&self.files, &self.subscribers)
                        .await;
                }
                self.is_finished.store(true, Ordering::Release);
                self.subscribers.notify(SendFilesEvent::BatchSent {
                    peer_host_name: peer_host_name.to_string(),
                });
                Ok(SentBatch {
                    route: self.route.clone(),
                    files,
                    peer_host_name: peer_host_name.to_string(),
                })
            }
            Err(e) => {
                error!("Sending to {} failed: {}", peer_host_name, e);
                self.subscribers.notify(SendFilesEvent::Failed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }
}
