use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

use chrono::Utc;
use relaydrop_entities::{Roster, RosterError};
use relaydropx_common::{
    BatchRoute, PeerResolver, PortLayout, Subscribers, SystemResolver,
    TransferError, TransferResult, control, net,
};
use relaydropx_receiver::{ReceiveFilesBubble, ReceiveOutcome, ReceivedBatch};
use relaydropx_sender::{SendFilesBubble, SendFilesRequest, SenderFile};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::watch,
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    RelayConfig, RelayEvent, RelaySubscriber,
    forward::{FanOutForwarder, UploadForwarder},
    jobs::{
        Claim, JobRetention, JobTable, PendingRelayJob, RetainForever,
        discard_batch_dir,
    },
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The relay. Clones share the same engine.
#[derive(Clone)]
pub struct RelayEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    roster: Roster,
    config: RelayConfig,
    resolver: Arc<dyn PeerResolver>,
    staging_dir: RwLock<PathBuf>,
    retention: RwLock<Arc<dyn JobRetention>>,
    jobs: JobTable,
    subscribers: Subscribers<RelayEvent>,
    running: Mutex<Option<Running>>,
}

struct Running {
    ports: PortLayout,
    shutdown: watch::Sender<bool>,
    acceptors: Vec<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once `flag` is raised or its sender is gone.
async fn signalled(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|raised| *raised).await;
}

impl RelayEngine {
    pub fn new(roster: Roster, config: RelayConfig) -> Self {
        Self::with_resolver(roster, config, Arc::new(SystemResolver))
    }

    pub fn with_resolver(
        roster: Roster,
        config: RelayConfig,
        resolver: Arc<dyn PeerResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                staging_dir: RwLock::new(config.staging_dir.clone()),
                roster,
                config,
                resolver,
                retention: RwLock::new(Arc::new(RetainForever)),
                jobs: JobTable::new(),
                subscribers: Subscribers::new(),
                running: Mutex::new(None),
            }),
        }
    }

    /// Loads the roster from a roster file.
    pub fn from_roster_file(
        path: impl AsRef<Path>,
        config: RelayConfig,
    ) -> Result<Self, RosterError> {
        Ok(Self::new(Roster::load(path)?, config))
    }

    pub fn roster(&self) -> &Roster {
        &self.inner.roster
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.inner.staging_dir()
    }

    /// Takes effect with the next pulled upload. Each upload is staged in a
    /// directory of its own below it.
    pub fn set_staging_dir(&self, dir: impl Into<PathBuf>) {
        *self
            .inner
            .staging_dir
            .write()
            .unwrap_or_else(PoisonError::into_inner) = dir.into();
    }

    /// Replaces the expiry policy, applied after every fan-out connection.
    pub fn set_retention(&self, retention: Arc<dyn JobRetention>) {
        *self
            .inner
            .retention
            .write()
            .unwrap_or_else(PoisonError::into_inner) = retention;
    }

    pub fn pending_jobs(&self) -> Vec<PendingRelayJob> {
        self.inner.jobs.jobs()
    }

    /// Outstanding deliveries that still need the staged file at `path`.
    pub fn staged_ref_count(&self, path: &Path) -> usize {
        self.inner.jobs.ref_count(path)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.running).is_some()
    }

    /// Ports actually bound, while running.
    pub fn local_ports(&self) -> Option<PortLayout> {
        lock(&self.inner.running).as_ref().map(|r| r.ports)
    }

    pub fn subscribe(&self, subscriber: Arc<RelaySubscriber>) {
        self.inner.subscribers.subscribe(subscriber);
    }

    pub fn unsubscribe(&self, subscriber: Arc<RelaySubscriber>) {
        self.inner.subscribers.unsubscribe(subscriber);
    }

    /// Binds the control and data ports and starts accepting. Must be called
    /// from within a Tokio runtime.
    pub fn start(&self) -> TransferResult<PortLayout> {
        let mut running = lock(&self.inner.running);
        if running.is_some() {
            return Err(TransferError::AlreadyRunning);
        }
        let bind_address = self.inner.config.bind_address;
        let configured = self.inner.config.ports;
        let control_listener =
            net::bind_listener(bind_address, configured.control_port)?;
        let data_listener =
            net::bind_listener(bind_address, configured.data_port)?;
        let ports = PortLayout {
            control_port: control_listener.local_addr()?.port(),
            data_port: data_listener.local_addr()?.port(),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let acceptors = vec![
            tokio::spawn(accept_control(
                self.inner.clone(),
                control_listener,
                ports.data_port,
                shutdown_rx,
            )),
            tokio::spawn(accept_fan_out(self.inner.clone(), data_listener)),
        ];
        *running = Some(Running {
            ports,
            shutdown,
            acceptors,
        });
        drop(running);

        info!(
            "Relay serving {} peers on ports {}/{}",
            self.inner.roster.len(),
            ports.control_port,
            ports.data_port
        );
        self.inner.subscribers.notify(RelayEvent::Started { ports });
        Ok(ports)
    }

    /// Closes both listeners and ends every per-client handler. Pending jobs
    /// and staged files are kept.
    pub fn stop(&self) {
        let Some(running) = lock(&self.inner.running).take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        for acceptor in running.acceptors {
            acceptor.abort();
        }
        info!("Relay stopped");
        self.inner.subscribers.notify(RelayEvent::Stopped);
    }
}

impl EngineInner {
    fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn dial(
        &self,
        host_name: &str,
        port: u16,
    ) -> std::io::Result<TcpStream> {
        let addr = self.resolver.resolve_address(host_name, port).await?;
        net::connect_from(self.config.bind_address, addr).await
    }

    /// Pulls from `host_name` until the relay stops or the peer's control
    /// connection closes.
    async fn pull_uploads(
        &self,
        host_name: &str,
        port: u16,
        mut shutdown: watch::Receiver<bool>,
        mut closed: watch::Receiver<bool>,
    ) {
        loop {
            let received = tokio::select! {
                _ = signalled(&mut shutdown) => return,
                _ = signalled(&mut closed) => return,
                received = self.pull_once(host_name, port) => received,
            };
            if received {
                continue;
            }
            tokio::select! {
                _ = signalled(&mut shutdown) => return,
                _ = signalled(&mut closed) => return,
                _ = sleep(self.config.retry_interval) => {}
            }
        }
    }

    /// One pull attempt. Returns whether a batch came in.
    async fn pull_once(&self, host_name: &str, port: u16) -> bool {
        let stream = match self.dial(host_name, port).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Nothing to pull from {}: {}", host_name, e);
                return false;
            }
        };
        let batch_dir = self.staging_dir().join(Uuid::new_v4().to_string());
        let bubble = ReceiveFilesBubble::new(self.config.receiver.clone());
        bubble.subscribe(Arc::new(UploadForwarder::new(
            host_name,
            self.subscribers.clone(),
        )));
        match bubble.run(stream, &batch_dir).await {
            Ok(ReceiveOutcome::Idle) => false,
            Ok(ReceiveOutcome::Received(batch)) => {
                self.register_upload(host_name, batch, batch_dir);
                true
            }
            Err(e) => {
                warn!("Upload from {} failed: {}", host_name, e);
                discard_batch_dir(&batch_dir);
                false
            }
        }
    }

    fn register_upload(
        &self,
        source_host_name: &str,
        batch: ReceivedBatch,
        batch_dir: PathBuf,
    ) {
        let receivers = batch.route.receivers();
        if receivers.is_empty() {
            info!(
                "Stored direct push of {} files from {} in {}",
                batch.files.len(),
                source_host_name,
                batch_dir.display()
            );
            return;
        }
        let (known, unknown): (Vec<String>, Vec<String>) = receivers
            .iter()
            .cloned()
            .partition(|receiver| self.roster.contains(receiver));
        if !unknown.is_empty() {
            warn!(
                "Upload from {} names peers outside the roster: {:?}",
                source_host_name, unknown
            );
            self.subscribers.notify(RelayEvent::UnknownReceivers {
                source_host_name: source_host_name.to_string(),
                host_names: unknown,
            });
        }
        let files = batch.files.into_iter().map(|file| file.path);
        let registered = self.jobs.register_batch(
            source_host_name,
            known,
            batch_dir.clone(),
            files,
        );
        let Some(job) = registered else {
            debug!("Nothing to deliver from {}", source_host_name);
            discard_batch_dir(&batch_dir);
            return;
        };
        info!(
            "Job {} from {} waits for {:?}",
            job.id(),
            source_host_name,
            job.receivers()
        );
        self.subscribers.notify(RelayEvent::JobRegistered {
            job_id: job.id(),
            source_host_name: source_host_name.to_string(),
            receivers: job.receivers().iter().cloned().collect(),
            files: job.files().iter().cloned().collect(),
        });
    }

    async fn hand_off(&self, stream: TcpStream, claim: Claim) {
        let files = claim
            .files()
            .iter()
            .map(SenderFile::from_path)
            .collect::<TransferResult<Vec<_>>>();
        let files = match files {
            Ok(files) => files,
            Err(e) => {
                error!("Can't fan out to {}: {}", claim.host_name(), e);
                self.subscribers.notify(RelayEvent::FanOutFailed {
                    receiver: claim.host_name().to_string(),
                    reason: e.to_string(),
                });
                self.jobs.abandon(claim);
                return;
            }
        };

        // Staged files are shared between jobs; the job table deletes them.
        let mut config = self.config.sender.clone();
        config.delete_sources = false;
        let bubble = SendFilesBubble::new(SendFilesRequest {
            files,
            route: BatchRoute::Direct,
            config,
        });
        bubble.subscribe(Arc::new(FanOutForwarder::new(
            claim.host_name(),
            self.subscribers.clone(),
        )));

        let result = bubble.run(stream, claim.host_name()).await;
        match result {
            Ok(sent) => {
                info!(
                    "Delivered {} files to {}",
                    sent.files.len(),
                    claim.host_name()
                );
                let released = self.jobs.complete(claim);
                self.notify_released(released);
            }
            Err(e) => {
                warn!("Fan-out to {} failed: {}", claim.host_name(), e);
                self.jobs.abandon(claim);
            }
        }
    }

    fn apply_retention(&self) {
        let retention = self
            .retention
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let released = self.jobs.sweep(retention.as_ref(), Utc::now());
        self.notify_released(released);
    }

    fn notify_released(&self, paths: Vec<PathBuf>) {
        if !paths.is_empty() {
            self.subscribers.notify(RelayEvent::FilesReleased { paths });
        }
    }
}

async fn accept_control(
    inner: Arc<EngineInner>,
    listener: TcpListener,
    data_port: u16,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(serve_client(
                    inner.clone(),
                    stream,
                    addr,
                    data_port,
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                warn!("Control accept failed: {}", e);
                sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn serve_client(
    inner: Arc<EngineInner>,
    stream: TcpStream,
    addr: SocketAddr,
    data_port: u16,
    shutdown: watch::Receiver<bool>,
) {
    let host_name = inner
        .resolver
        .resolve_host_name(addr.ip(), &inner.roster)
        .await;
    let (read_half, write_half) = stream.into_split();
    let (closed, closed_rx) = watch::channel(false);
    tokio::spawn(answer_roster_requests(
        inner.clone(),
        read_half,
        write_half,
        shutdown.clone(),
        closed,
    ));

    let Some(port) = inner.roster.receive_port(data_port, &host_name) else {
        warn!("{} ({}) is not in the roster", host_name, addr);
        inner.subscribers.notify(RelayEvent::ClientRejected {
            address: addr.to_string(),
            host_name,
        });
        return;
    };
    info!("{} connected from {}", host_name, addr);
    inner.subscribers.notify(RelayEvent::ClientConnected {
        host_name: host_name.clone(),
    });

    inner.pull_uploads(&host_name, port, shutdown, closed_rx).await;

    info!("{} went away", host_name);
    inner
        .subscribers
        .notify(RelayEvent::ClientDisconnected { host_name });
}

async fn answer_roster_requests(
    inner: Arc<EngineInner>,
    read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    mut shutdown: watch::Receiver<bool>,
    closed: watch::Sender<bool>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            _ = signalled(&mut shutdown) => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) if control::is_roster_request(&line) => {
                let reply =
                    control::write_roster_reply(&mut write_half, &inner.roster);
                if let Err(e) = reply.await {
                    debug!("Couldn't send roster: {}", e);
                    break;
                }
            }
            Ok(Some(line)) => debug!("Ignoring control line {:?}", line),
            Ok(None) => break,
            Err(e) => {
                debug!("Control connection failed: {}", e);
                break;
            }
        }
    }
    let _ = closed.send(true);
}

async fn accept_fan_out(inner: Arc<EngineInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(serve_fan_out(inner.clone(), stream, addr));
            }
            Err(e) => {
                warn!("Data accept failed: {}", e);
                sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn serve_fan_out(
    inner: Arc<EngineInner>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let host_name = inner
        .resolver
        .resolve_host_name(addr.ip(), &inner.roster)
        .await;
    match inner.jobs.claim(&host_name) {
        Some(claim) => inner.hand_off(stream, claim).await,
        None => {
            drop(stream);
            debug!("No pending work for {}", host_name);
            inner
                .subscribers
                .notify(RelayEvent::FanOutRejected { host_name });
        }
    }
    inner.apply_retention();
}
