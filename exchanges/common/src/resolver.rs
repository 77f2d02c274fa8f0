//! Mapping between roster host names and socket addresses.
//!
//! Peers are identified by the address they connect from, so both directions
//! are needed: a host name must resolve to an address to dial, and the remote
//! address of an accepted connection must map back to a roster host name.

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, SocketAddr},
};

use futures::{FutureExt, future::BoxFuture};
use relaydrop_entities::Roster;
use tokio::net::TcpStream;
use tracing::debug;

use crate::TransferResult;

pub trait PeerResolver: Send + Sync {
    /// Every address `host_name` resolves to.
    fn lookup_host<'a>(
        &'a self,
        host_name: &'a str,
    ) -> BoxFuture<'a, io::Result<Vec<IpAddr>>>;

    /// The address to dial for `host_name`, preferring IPv4.
    fn resolve_address<'a>(
        &'a self,
        host_name: &'a str,
        port: u16,
    ) -> BoxFuture<'a, io::Result<SocketAddr>> {
        async move {
            let addrs = self.lookup_host(host_name).await?;
            let ip = addrs
                .iter()
                .find(|ip| ip.is_ipv4())
                .or_else(|| addrs.first())
                .copied()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no address for host `{host_name}`"),
                    )
                })?;
            Ok(SocketAddr::new(ip, port))
        }
        .boxed()
    }

    /// The roster host name whose addresses include `ip`.
    ///
    /// Unmatched loopback addresses map to the local host name, any other
    /// unmatched address to its textual form.
    fn resolve_host_name<'a>(
        &'a self,
        ip: IpAddr,
        roster: &'a Roster,
    ) -> BoxFuture<'a, String> {
        async move {
            let ip = ip.to_canonical();
            for peer in roster {
                match self.lookup_host(peer.host_name()).await {
                    Ok(addrs) => {
                        if addrs.iter().any(|a| a.to_canonical() == ip) {
                            return peer.host_name().to_string();
                        }
                    }
                    Err(e) => {
                        debug!("Couldn't resolve {}: {}", peer.host_name(), e);
                    }
                }
            }
            fallback_host_name(ip)
        }
        .boxed()
    }
}

/// Resolution through the operating system's resolver.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl PeerResolver for SystemResolver {
    fn lookup_host<'a>(
        &'a self,
        host_name: &'a str,
    ) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        system_lookup(host_name).boxed()
    }
}

/// A fixed host name to address map. Names missing from the map go through
/// the system resolver.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(
        mut self,
        host_name: impl Into<String>,
        ip: IpAddr,
    ) -> Self {
        self.insert(host_name, ip);
        self
    }

    pub fn insert(&mut self, host_name: impl Into<String>, ip: IpAddr) {
        self.hosts.insert(host_name.into(), ip);
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl FromIterator<(String, IpAddr)> for StaticResolver {
    fn from_iter<T: IntoIterator<Item = (String, IpAddr)>>(iter: T) -> Self {
        Self {
            hosts: iter.into_iter().collect(),
        }
    }
}

impl PeerResolver for StaticResolver {
    fn lookup_host<'a>(
        &'a self,
        host_name: &'a str,
    ) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        match self.hosts.get(host_name) {
            Some(ip) => futures::future::ready(Ok(vec![*ip])).boxed(),
            None => system_lookup(host_name).boxed(),
        }
    }
}

async fn system_lookup(host_name: &str) -> io::Result<Vec<IpAddr>> {
    let addrs = tokio::net::lookup_host((host_name, 0)).await?;
    Ok(addrs.map(|a| a.ip()).collect())
}

/// Name of this machine, or `localhost` when it can't be read.
pub fn local_host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

pub fn fallback_host_name(ip: IpAddr) -> String {
    if ip.is_loopback() {
        local_host_name()
    } else {
        ip.to_string()
    }
}

/// Roster host name of whoever is on the other end of `stream`.
pub async fn peer_host_name(
    resolver: &dyn PeerResolver,
    stream: &TcpStream,
    roster: &Roster,
) -> TransferResult<String> {
    let addr = stream.peer_addr()?;
    Ok(resolver.resolve_host_name(addr.ip(), roster).await)
}
