use chrono::{DateTime, Utc};
use relaydropx_common::{
    BatchRoute, Subscriber, Subscribers, TransferError, TransferResult, wire,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::ReceiverConfig;

/// Progress of one inbound batch, in wire order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiveFilesEvent {
    /// One entry of the receiver manifest of a relayed batch.
    ReceiverAdded { host_name: String },
    FileReceiveStarted { name: String, size: u64 },
    FileReceiveFinished { name: String, path: PathBuf },
    BatchReceived { route: BatchRoute },
    /// Terminal. Files written so far, including a partial one, stay on disk.
    Failed { reason: String },
}

pub type ReceiveFilesSubscriber = dyn Subscriber<ReceiveFilesEvent>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedBatch {
    pub route: BatchRoute,
    pub files: Vec<ReceivedFile>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// The peer closed the connection before sending a byte; it had nothing
    /// to push.
    Idle,
    Received(ReceivedBatch),
}

pub struct ReceiveFilesBubble {
    id: String,
    config: ReceiverConfig,
    subscribers: Subscribers<ReceiveFilesEvent>,
    created_at: DateTime<Utc>,
}

impl ReceiveFilesBubble {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
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

    pub fn subscribe(&self, subscriber: Arc<ReceiveFilesSubscriber>) {
        self.subscribers.subscribe(subscriber);
    }

    pub fn unsubscribe(&self, subscriber: Arc<ReceiveFilesSubscriber>) {
        self.subscribers.unsubscribe(subscriber);
    }

    /// Reads one batch off `reader`, writing each file to
    /// `destination/<name>` (last write wins on name clashes).
    ///
    /// Every failure is reported once as [`ReceiveFilesEvent::Failed`] and
    /// returned; an [`ReceiveOutcome::Idle`] connection raises no event.
    pub async fn run<R>(
        &self,
        reader: R,
        destination: &Path,
    ) -> TransferResult<ReceiveOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let carrier = Carrier {
            reader: BufReader::new(reader),
            chunk_size: usize::try_from(self.config.chunk_size.max(1))
                .unwrap_or(usize::MAX),
            destination,
            subscribers: &self.subscribers,
        };
        match carrier.receive_batch().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!("File reception failed: {}", e);
                self.subscribers.notify(ReceiveFilesEvent::Failed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

struct Carrier<'a, R> {
    reader: BufReader<R>,
    chunk_size: usize,
    destination: &'a Path,
    subscribers: &'a Subscribers<ReceiveFilesEvent>,
}

impl<R> Carrier<'_, R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn receive_batch(mut self) -> TransferResult<ReceiveOutcome> {
        let Some(route) = wire::read_route_or_idle(&mut self.reader).await?
        else {
            debug!("Peer had nothing to send");
            return Ok(ReceiveOutcome::Idle);
        };
        for host_name in route.receivers() {
            self.subscribers.notify(ReceiveFilesEvent::ReceiverAdded {
                host_name: host_name.clone(),
            });
        }

        let count = wire::read_count(&mut self.reader).await?;
        info!("Receiving {} files", count);
        fs::create_dir_all(self.destination)
            .await
            .map_err(|e| TransferError::storage(self.destination, e))?;

        let mut files = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            files.push(self.receive_file().await?);
        }

        self.subscribers.notify(ReceiveFilesEvent::BatchReceived {
            route: route.clone(),
        });
        info!("Batch of {} files received", files.len());
        Ok(ReceiveOutcome::Received(ReceivedBatch { route, files }))
    }

    async fn receive_file(&mut self) -> TransferResult<ReceivedFile> {
        let header = wire::read_file_header(&mut self.reader).await?;
        wire::validate_file_name(&header.name)?;
        self.subscribers.notify(ReceiveFilesEvent::FileReceiveStarted {
            name: header.name.clone(),
            size: header.size,
        });

        let path = self.destination.join(&header.name);
        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| TransferError::storage(&path, e))?;

        let mut buffer = vec![0u8; self.chunk_size.min(header.size as usize)];
        let mut remaining = header.size;
        while remaining > 0 {
            let want = buffer.len().min(remaining as usize);
            let read = self
                .reader
                .read(&mut buffer[..want])
                .await
                .map_err(TransferError::from_read)?;
            if read == 0 {
                return Err(TransferError::framing(format!(
                    "stream ended {remaining} bytes short of `{}`",
                    header.name
                )));
            }
            file.write_all(&buffer[..read])
                .await
                .map_err(|e| TransferError::storage(&path, e))?;
            remaining -= read as u64;
        }
        file.flush()
            .await
            .map_err(|e| TransferError::storage(&path, e))?;

        self.subscribers.notify(ReceiveFilesEvent::FileReceiveFinished {
            name: header.name.clone(),
            path: path.clone(),
        });
        self.subscribers
            .log(format!("Received {} ({} bytes)", header.name, header.size));
        Ok(ReceivedFile {
            name: header.name,
            path,
            size: header.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaydropx_common::FileHeader;
    use tempfile::TempDir;

    async fn encode(route: &BatchRoute, files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        wire::write_route(&mut out, route).await.unwrap();
        wire::write_count(&mut out, files.len()).await.unwrap();
        for (name, content) in files {
            let header = FileHeader {
                name: name.to_string(),
                size: content.len() as u64,
            };
            wire::write_file_header(&mut out, &header).await.unwrap();
            out.extend_from_slice(content);
        }
        out
    }

    #[tokio::test]
    async fn empty_connection_is_idle() {
        let dir = TempDir::new().unwrap();
        let bubble = ReceiveFilesBubble::new(ReceiverConfig::default());

        let outcome = bubble.run(&b""[..], dir.path()).await.unwrap();

        assert_eq!(outcome, ReceiveOutcome::Idle);
    }

    #[tokio::test]
    async fn tiny_chunks_still_read_exact_sizes() {
        let dir = TempDir::new().unwrap();
        let raw = encode(
            &BatchRoute::Direct,
            &[("a.txt", &b"first file"[..]), ("b.txt", &b"second"[..])],
        )
        .await;
        let bubble = ReceiveFilesBubble::new(ReceiverConfig { chunk_size: 3 });

        let outcome = bubble.run(raw.as_slice(), dir.path()).await.unwrap();

        let ReceiveOutcome::Received(batch) = outcome else {
            panic!("expected a batch");
        };
        assert_eq!(batch.files.len(), 2);
        assert_eq!(
            std::fs::read(dir.path().join("a.txt")).unwrap(),
            b"first file"
        );
        assert_eq!(std::fs::read(dir.path().join("b.txt")).unwrap(), b"second");
    }

    #[tokio::test]
    async fn path_like_names_are_rejected_before_writing() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dest");
        let raw =
            encode(&BatchRoute::Direct, &[("../escape.txt", &b"x"[..])]).await;
        let bubble = ReceiveFilesBubble::new(ReceiverConfig::default());

        let err = bubble.run(raw.as_slice(), &dest).await.unwrap_err();

        assert!(err.is_framing(), "{err}");
        assert!(!dir.path().join("escape.txt").exists());
    }
}
