use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::GroupsConfig;
use crate::transport::Transport;


/// IPv4 multicast over UDP. The socket is bound to the multicast port on all interfaces with
///  address (and port, where available) reuse, so that several processes on the same host can
///  participate in the same groups.
pub struct MulticastTransport {
    socket: UdpSocket,
    target: SocketAddrV4,
    recv_buf: Mutex<Vec<u8>>,
}

impl MulticastTransport {
    pub fn new(config: &GroupsConfig) -> anyhow::Result<MulticastTransport> {
        let target = match config.multicast_addr {
            SocketAddr::V4(addr) if addr.ip().is_multicast() => addr,
            other => bail!("{:?} is not an IPv4 multicast address", other),
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, target.port())))?;

        socket.join_multicast_v4(target.ip(), &config.interface)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(config.multicast_ttl)?;
        if !config.interface.is_unspecified() {
            socket.set_multicast_if_v4(&config.interface)?;
        }

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        debug!("joined multicast group {:?} on interface {:?}", target, config.interface);

        Ok(MulticastTransport {
            socket,
            target,
            recv_buf: Mutex::new(vec![0; config.max_datagram_size]),
        })
    }
}

#[async_trait]
impl Transport for MulticastTransport {
    async fn send(&self, datagram: &[u8]) -> anyhow::Result<()> {
        trace!("sending {} bytes to {:?}", datagram.len(), self.target);
        self.socket.send_to(datagram, self.target).await?;
        Ok(())
    }

    async fn recv(&self) -> anyhow::Result<Bytes> {
        let mut buf = self.recv_buf.lock().await;
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        trace!("received {} bytes from {:?}", len, from);
        Ok(Bytes::copy_from_slice(&buf[..len]))
    }

    fn description(&self) -> String {
        format!("multicast {:?}", self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_unicast_address() {
        let config = GroupsConfig::new(SocketAddr::from(([127, 0, 0, 1], 7447)));
        assert!(MulticastTransport::new(&config).is_err());
    }
}
