use std::net::SocketAddr;

#[cfg(test)]
use mockall::automock;
use tracing::trace;

use crate::error::{ArdpError, ArdpResult};

/// The engine's entire view of the transport below it: a non-blocking,
/// unreliable datagram socket. Introduced as a trait so the I/O part can be
/// mocked away for testing and so the tokio driver and plain `std` sockets
/// can share the engine unchanged.
///
/// Both operations must never block: a full socket buffer or an empty
/// receive queue is reported as `WouldBlock`, which the engine treats as a
/// soft condition (accelerated retransmit on send, end of the drain loop on
/// receive).
#[cfg_attr(test, automock)]
pub trait DatagramSocket: Send + Sync + 'static {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> ArdpResult<()>;

    fn recv_from(&self, buf: &mut [u8]) -> ArdpResult<(usize, SocketAddr)>;
}

/// `std` sockets work directly, provided the caller has put them into
/// non-blocking mode.
impl DatagramSocket for std::net::UdpSocket {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> ArdpResult<()> {
        match std::net::UdpSocket::send_to(self, buf, to) {
            Ok(sent) => {
                trace!("sent {} bytes to {:?}", sent, to);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(ArdpError::WouldBlock),
            Err(e) => {
                trace!("socket error sending to {:?}: {}", to, e);
                Err(ArdpError::Failed)
            }
        }
    }

    fn recv_from(&self, buf: &mut [u8]) -> ArdpResult<(usize, SocketAddr)> {
        match std::net::UdpSocket::recv_from(self, buf) {
            Ok(x) => Ok(x),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(ArdpError::WouldBlock),
            Err(e) => {
                trace!("socket error receiving: {}", e);
                Err(ArdpError::Failed)
            }
        }
    }
}
