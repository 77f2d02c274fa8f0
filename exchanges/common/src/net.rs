use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use tokio::net::{TcpListener, TcpSocket, TcpStream};

fn socket_for(addr: &SocketAddr) -> io::Result<TcpSocket> {
    if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

/// Connects to `remote`, binding the local end to `local` when given.
pub async fn connect_from(
    local: Option<IpAddr>,
    remote: SocketAddr,
) -> io::Result<TcpStream> {
    let Some(ip) = local else {
        return TcpStream::connect(remote).await;
    };
    let local = SocketAddr::new(ip, 0);
    let socket = socket_for(&local)?;
    socket.bind(local)?;
    socket.connect(remote).await
}

/// Listens on `port`, on `local` or on every IPv4 interface.
pub fn bind_listener(
    local: Option<IpAddr>,
    port: u16,
) -> io::Result<TcpListener> {
    let ip = local.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let addr = SocketAddr::new(ip, port);
    let socket = socket_for(&addr)?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}
