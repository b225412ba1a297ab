use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Instant;

#[cfg(test)] use mockall::automock;
use tracing::warn;

/// Abstraction over a datagram substrate: raw byte buffers to and from peer addresses,
///  with a hard per-packet size ceiling.
///
/// `recv` never blocks - it returns `None` once the substrate is drained. It takes the
///  tick's timestamp because some implementations (the relay tunnel) run internal
///  timers that must only advance when the engine is stepped.
///
/// Send failures are swallowed after logging: loss is steady-state for this class of
///  transport, and every layer above is built to tolerate it.
#[cfg_attr(test, automock)]
pub trait Socket {
    fn send(&self, to: SocketAddr, data: &[u8]);

    /// receives into `buf`, returning the sender and the number of bytes written
    fn recv(&self, now: Instant, buf: &mut [u8]) -> Option<(SocketAddr, usize)>;

    fn mtu(&self) -> usize;
}


pub struct UdpSocket {
    socket: std::net::UdpSocket,
    mtu: usize,
}

impl UdpSocket {
    pub const DEFAULT_MTU: usize = 1200;

    /// Binds a nonblocking UDP socket on all interfaces. Port 0 picks an ephemeral port.
    pub fn bind(port: u16) -> anyhow::Result<UdpSocket> {
        let socket = std::net::UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_nonblocking(true)?;
        Ok(UdpSocket {
            socket,
            mtu: Self::DEFAULT_MTU,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Socket for UdpSocket {
    fn send(&self, to: SocketAddr, data: &[u8]) {
        if let Err(e) = self.socket.send_to(data, to) {
            warn!("error sending datagram to {:?}: {}", to, e);
        }
    }

    fn recv(&self, _now: Instant, buf: &mut [u8]) -> Option<(SocketAddr, usize)> {
        match self.socket.recv_from(buf) {
            Ok((len, from)) => Some((from, len)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!("error receiving datagram: {}", e);
                None
            }
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}
