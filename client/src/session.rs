use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use relaydrop_entities::Roster;
use relaydropx_common::{
    BatchRoute, PeerResolver, Subscribers, SystemResolver, TransferError,
    TransferResult, control, net,
};
use relaydropx_receiver::{ReceiveFilesBubble, ReceiveOutcome};
use relaydropx_sender::{
    SendFilesBubble, SendFilesRequest, SenderFile, SentBatch,
};
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{ClientConfig, ClientEvent, ClientSubscriber, forward::Forwarder};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One peer's attachment to a relay.
///
/// Clones share the same session.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: ClientConfig,
    resolver: Arc<dyn PeerResolver>,
    state: Mutex<SessionState>,
    roster: RwLock<Roster>,
    destination: RwLock<PathBuf>,
    subscribers: Subscribers<ClientEvent>,
    receiver: ReceiveFilesBubble,
}

struct SessionState {
    phase: ConnectionState,
    server: Option<String>,
    // Bumped on every connect and disconnect so stale workers can tell they
    // no longer own the session.
    generation: u64,
    control: Option<Arc<tokio::sync::Mutex<OwnedWriteHalf>>>,
    workers: Vec<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    pub fn with_resolver(
        config: ClientConfig,
        resolver: Arc<dyn PeerResolver>,
    ) -> Self {
        let subscribers = Subscribers::new();
        let receiver = ReceiveFilesBubble::new(config.receiver.clone());
        receiver.subscribe(Arc::new(Forwarder::new(subscribers.clone())));
        Self {
            inner: Arc::new(SessionInner {
                destination: RwLock::new(config.destination.clone()),
                config,
                resolver,
                state: Mutex::new(SessionState {
                    phase: ConnectionState::Disconnected,
                    server: None,
                    generation: 0,
                    control: None,
                    workers: Vec::new(),
                }),
                roster: RwLock::new(Roster::default()),
                subscribers,
                receiver,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).phase
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Relay host name of the current or last connection attempt.
    pub fn server(&self) -> Option<String> {
        lock(&self.inner.state).server.clone()
    }

    /// The roster most recently received from the relay. Empty until the
    /// first reply and after a disconnect.
    pub fn roster(&self) -> Roster {
        self.inner
            .roster
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn destination(&self) -> PathBuf {
        self.inner.destination()
    }

    /// Takes effect with the next receive session.
    pub fn set_destination(&self, destination: impl Into<PathBuf>) {
        *self
            .inner
            .destination
            .write()
            .unwrap_or_else(PoisonError::into_inner) = destination.into();
    }

    pub fn subscribe(&self, subscriber: Arc<ClientSubscriber>) {
        self.inner.subscribers.subscribe(subscriber);
    }

    pub fn unsubscribe(&self, subscriber: Arc<ClientSubscriber>) {
        self.inner.subscribers.unsubscribe(subscriber);
    }

    /// Opens the control connection to `server` and starts the roster
    /// listener and the receive loop.
    pub async fn connect(&self, server: &str) -> TransferResult<()> {
        let generation = {
            let mut state = lock(&self.inner.state);
            if state.phase != ConnectionState::Disconnected {
                let current = state.server.clone().unwrap_or_default();
                return Err(TransferError::AlreadyConnected(current));
            }
            state.phase = ConnectionState::Connecting;
            state.server = Some(server.to_string());
            state.generation += 1;
            state.generation
        };
        self.inner.subscribers.notify(ClientEvent::Connecting {
            server: server.to_string(),
        });
        info!("Connecting to relay {}", server);

        let stream = match self
            .inner
            .dial(server, self.inner.config.ports.control_port)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Couldn't reach relay {}: {}", server, e);
                self.inner.lose_connection(generation, server, &e);
                return Err(TransferError::ConnectionFailure(e));
            }
        };
        let (read_half, write_half) = stream.into_split();

        {
            let mut state = lock(&self.inner.state);
            if state.generation != generation {
                return Err(TransferError::NotConnected);
            }
            state.phase = ConnectionState::Connected;
            state.control = Some(Arc::new(tokio::sync::Mutex::new(write_half)));
        }
        self.inner.subscribers.notify(ClientEvent::Connected {
            server: server.to_string(),
        });

        let listener = tokio::spawn(listen_for_rosters(
            self.inner.clone(),
            read_half,
            server.to_string(),
            generation,
        ));
        let receive_loop = tokio::spawn(receive_loop(
            self.inner.clone(),
            server.to_string(),
            generation,
        ));
        let mut state = lock(&self.inner.state);
        if state.generation == generation {
            state.workers.push(listener);
            state.workers.push(receive_loop);
        } else {
            listener.abort();
            receive_loop.abort();
        }
        Ok(())
    }

    /// Drops the control connection and stops both workers. No-op when
    /// already disconnected.
    pub fn disconnect(&self) {
        let Some(server) = self.inner.reset(None) else {
            return;
        };
        info!("Disconnected from relay {}", server);
        self.inner.clear_roster();
        self.inner.subscribers.notify(ClientEvent::Disconnected {
            server,
            reason: "disconnected by request".to_string(),
        });
        self.inner.subscribers.notify(ClientEvent::RosterChanged {
            roster: Roster::default(),
        });
    }

    /// Asks the relay for its roster. The answer arrives as
    /// [`ClientEvent::RosterChanged`].
    pub async fn request_roster(&self) -> TransferResult<()> {
        let control = lock(&self.inner.state)
            .control
            .clone()
            .ok_or(TransferError::NotConnected)?;
        let mut writer = control.lock().await;
        control::write_roster_request(&mut *writer).await
    }

    /// Pushes `files` to the relay for delivery to the roster peers at
    /// `receiver_indices`.
    ///
    /// Binds this peer's own receive port, waits for the relay to pull, and
    /// streams the batch over that single connection.
    pub async fn send<P: AsRef<Path>>(
        &self,
        files: &[P],
        receiver_indices: &[usize],
    ) -> TransferResult<SentBatch> {
        if !self.is_connected() {
            return Err(TransferError::NotConnected);
        }
        if receiver_indices.is_empty() {
            return Err(TransferError::NoReceivers);
        }
        let roster = self.roster();
        let receivers = receiver_indices
            .iter()
            .map(|&index| {
                roster
                    .get(index)
                    .map(|peer| peer.host_name().to_string())
                    .ok_or(TransferError::RosterResolutionFailure {
                        index,
                        roster_len: roster.len(),
                    })
            })
            .collect::<TransferResult<Vec<_>>>()?;
        let host_name = &self.inner.config.host_name;
        let port = roster
            .receive_port(self.inner.config.ports.data_port, host_name)
            .ok_or_else(|| TransferError::UnknownPeer(host_name.clone()))?;
        let files = files
            .iter()
            .map(SenderFile::from_path)
            .collect::<TransferResult<Vec<_>>>()?;

        let listener =
            net::bind_listener(self.inner.config.bind_address, port)?;
        debug!("Waiting for the relay to pull on port {}", port);
        let (stream, addr) = listener.accept().await?;
        drop(listener);

        info!("Sending {} files to {:?}", files.len(), receivers);
        self.inner.subscribers.notify(ClientEvent::TransferStarted {
            receivers: receivers.clone(),
        });
        let peer_host_name =
            self.inner.resolver.resolve_host_name(addr.ip(), &roster).await;
        let mut config = self.inner.config.sender.clone();
        config.delete_sources = false;
        let bubble = SendFilesBubble::new(SendFilesRequest {
            files,
            route: BatchRoute::relayed(receivers),
            config,
        });
        bubble.subscribe(Arc::new(Forwarder::new(
            self.inner.subscribers.clone(),
        )));
        bubble.run(stream, &peer_host_name).await
    }
}

impl SessionInner {
    fn destination(&self) -> PathBuf {
        self.destination
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.state).generation == generation
    }

    async fn dial(&self, server: &str, port: u16) -> io::Result<TcpStream> {
        let addr = self.resolver.resolve_address(server, port).await?;
        net::connect_from(self.config.bind_address, addr).await
    }

    fn clear_roster(&self) {
        *self.roster.write().unwrap_or_else(PoisonError::into_inner) =
            Roster::default();
    }

    /// Moves to `Disconnected` and stops the workers, if `generation` (when
    /// given) still owns the session. Returns the server that was left.
    fn reset(&self, generation: Option<u64>) -> Option<String> {
        let (server, workers) = {
            let mut state = lock(&self.state);
            if state.phase == ConnectionState::Disconnected {
                return None;
            }
            if generation.is_some_and(|g| g != state.generation) {
                return None;
            }
            state.phase = ConnectionState::Disconnected;
            state.generation += 1;
            state.control = None;
            (
                state.server.clone().unwrap_or_default(),
                std::mem::take(&mut state.workers),
            )
        };
        for worker in workers {
            worker.abort();
        }
        Some(server)
    }

    fn lose_connection(
        &self,
        generation: u64,
        server: &str,
        reason: impl fmt::Display,
    ) {
        if self.reset(Some(generation)).is_none() {
            return;
        }
        self.clear_roster();
        self.subscribers.notify(ClientEvent::Disconnected {
            server: server.to_string(),
            reason: reason.to_string(),
        });
        self.subscribers.notify(ClientEvent::RosterChanged {
            roster: Roster::default(),
        });
    }
}

/// Applies roster replies until the control connection ends, which loses the
/// whole session.
async fn listen_for_rosters(
    inner: Arc<SessionInner>,
    read_half: OwnedReadHalf,
    server: String,
    generation: u64,
) {
    let mut reader = control::RosterReplyReader::new(read_half);
    loop {
        match reader.next_roster().await {
            Ok(Some(roster)) => {
                if !inner.is_current(generation) {
                    return;
                }
                debug!("Roster of {} peers received", roster.len());
                *inner.roster.write().unwrap_or_else(PoisonError::into_inner) =
                    roster.clone();
                inner
                    .subscribers
                    .notify(ClientEvent::RosterChanged { roster });
            }
            Ok(None) => {
                warn!("Relay {} closed the control connection", server);
                inner.lose_connection(
                    generation,
                    &server,
                    "relay closed the control connection",
                );
                return;
            }
            Err(e) if e.is_framing() => {
                warn!("Ignoring malformed roster reply: {}", e);
                inner.subscribers.log(format!("Malformed roster reply: {e}"));
            }
            Err(e) => {
                error!("Control connection to {} failed: {}", server, e);
                inner.lose_connection(generation, &server, &e);
                return;
            }
        }
    }
}

/// Keeps pulling from the relay's data port until connecting to it fails.
async fn receive_loop(
    inner: Arc<SessionInner>,
    server: String,
    generation: u64,
) {
    let data_port = inner.config.ports.data_port;
    loop {
        if !inner.is_current(generation) {
            return;
        }
        let stream = match inner.dial(&server, data_port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Relay {} is gone: {}", server, e);
                inner.lose_connection(generation, &server, &e);
                return;
            }
        };
        let destination = inner.destination();
        match inner.receiver.run(stream, &destination).await {
            Ok(ReceiveOutcome::Idle) => debug!("Nothing to receive"),
            Ok(ReceiveOutcome::Received(batch)) => {
                info!("Received {} files from the relay", batch.files.len());
            }
            // Already reported as `ReceiveFailed`.
            Err(e) => debug!("Receive session failed: {}", e),
        }
        sleep(inner.config.retry_interval).await;
    }
}
