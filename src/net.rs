use anyhow::{Context, Result, anyhow};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use tracing::info;

/// Where the replay engine hands packets to the network.
///
/// The engine is generic over this so tests can capture sends instead of
/// touching a socket.
pub trait Transmit {
    fn send_to(&self, payload: &[u8], dest: SocketAddrV4) -> io::Result<usize>;
}

/// UDP socket configured for multicast sending.
pub struct MulticastSender {
    socket: Socket,
}

impl MulticastSender {
    /// Create the egress socket. Loopback delivery stays enabled so a
    /// receiver on the same host sees the stream.
    pub fn new(interface: Option<&str>, ttl: u32) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("Failed to create UDP socket")?;
        socket
            .set_send_buffer_size(1024 * 1024)
            .context("Failed to set send buffer size")?;
        socket
            .set_multicast_ttl_v4(ttl)
            .context("Failed to set multicast TTL")?;
        socket
            .set_multicast_loop_v4(true)
            .context("Failed to enable multicast loopback")?;

        if let Some(name) = interface {
            let addr = resolve_interface_ipv4(name)?;
            socket
                .set_multicast_if_v4(&addr)
                .with_context(|| format!("Failed to bind multicast to {name} ({addr})"))?;
            info!("Sending multicast via {} ({})", name, addr);
        }

        Ok(Self { socket })
    }
}

impl Transmit for MulticastSender {
    fn send_to(&self, payload: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        self.socket
            .send_to(payload, &SockAddr::from(SocketAddr::V4(dest)))
    }
}

/// First IPv4 address of a named network interface.
fn resolve_interface_ipv4(name: &str) -> Result<Ipv4Addr> {
    let interface = pnet::datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| anyhow!("Network interface not found: {name}"))?;

    interface
        .ips
        .iter()
        .find_map(|net| match net.ip() {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow!("Network interface {name} has no IPv4 address"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_interface_is_fatal() {
        assert!(resolve_interface_ipv4("no-such-iface0").is_err());
    }

    #[test]
    fn creates_socket_without_interface() {
        MulticastSender::new(None, 1).unwrap();
    }
}
