use relaydropx_common::{
    BatchRoute, FileHeader, Subscribers, TransferError, TransferResult, wire,
};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter},
};
use tracing::{debug, warn};

use super::SendFilesEvent;
use crate::{SenderConfig, SenderFile};

pub(super) struct Carrier<'a, W: AsyncWrite + Unpin> {
    writer: BufWriter<W>,
    chunk_size: usize,
    subscribers: &'a Subscribers<SendFilesEvent>,
}

impl<'a, W> Carrier<'a, W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub(super) fn new(
        writer: W,
        config: &SenderConfig,
        subscribers: &'a Subscribers<SendFilesEvent>,
    ) -> Self {
        let chunk_size = usize::try_from(config.chunk_size.max(1))
            .unwrap_or(usize::MAX);
        Self {
            writer: BufWriter::new(writer),
            chunk_size,
            subscribers,
        }
    }

    pub(super) async fn send_batch(
        mut self,
        files: &[SenderFile],
        route: &BatchRoute,
    ) -> TransferResult<Vec<FileHeader>> {
        // Sizes go into the manifest, so every file is checked before the
        // first byte is written.
        let mut headers = Vec::with_capacity(files.len());
        for file in files {
            let metadata = fs::metadata(&file.path)
                .await
                .map_err(|e| TransferError::storage(&file.path, e))?;
            headers.push(FileHeader {
                name: file.name.clone(),
                size: metadata.len(),
            });
        }

        wire::write_route(&mut self.writer, route).await?;
        wire::write_count(&mut self.writer, files.len()).await?;

        for (file, header) in files.iter().zip(&headers) {
            self.send_file(file, header).await?;
        }

        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(headers)
    }

    async fn send_file(
        &mut self,
        file: &SenderFile,
        header: &FileHeader,
    ) -> TransferResult<()> {
        self.subscribers.notify(SendFilesEvent::FileSendStarted {
            name: header.name.clone(),
        });
        debug!("Sending {} ({} bytes)", header.name, header.size);

        let mut source = fs::File::open(&file.path)
            .await
            .map_err(|e| TransferError::storage(&file.path, e))?;
        wire::write_file_header(&mut self.writer, header).await?;
        self.writer.flush().await?;

        let mut buffer = vec![0u8; self.chunk_size.min(header.size as usize)];
        let mut remaining = header.size;
        while remaining > 0 {
            let want = buffer.len().min(remaining as usize);
            let read = source
                .read(&mut buffer[..want])
                .await
                .map_err(|e| TransferError::storage(&file.path, e))?;
            if read == 0 {
                return Err(TransferError::storage(
                    &file.path,
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "file shrank while it was being sent",
                    ),
                ));
            }
            self.writer.write_all(&buffer[..read]).await?;
            self.writer.flush().await?;
            remaining -= read as u64;
        }

        self.subscribers.notify(SendFilesEvent::FileSendFinished {
            name: header.name.clone(),
            size: header.size,
        });
        self.subscribers
            .log(format!("Sent {} ({} bytes)", header.name, header.size));
        Ok(())
    }
}

pub(super) async fn delete_sources(
    files: &[SenderFile],
    subscribers: &Subscribers<SendFilesEvent>,
) {
    for file in files {
        match fs::remove_file(&file.path).await {
            Ok(()) => debug!("Deleted {}", file.path.display()),
            Err(e) => {
                warn!("Couldn't delete {}: {}", file.path.display(), e);
                subscribers.log(format!(
                    "Couldn't delete {}: {}",
                    file.path.display(),
                    e
                ));
            }
        }
    }
}
