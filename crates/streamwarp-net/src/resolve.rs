//! Endpoint resolution for bind and connect paths.

use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
};

/// Resolves a configured `host` + `port` pair to the first socket
/// address the system resolver offers.
///
/// Servers resolve their bind address once per `start`; clients
/// resolve on every connect attempt, so a reconnect picks up DNS
/// changes. Failures come back as transport errors on the endpoint
/// that asked.
pub(crate) fn resolve_endpoint(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses resolved for {}:{}", host, port),
        )
    })
}
