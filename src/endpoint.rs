use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::config::ArdpConfig;
use crate::engine::ArdpEngine;
use crate::error::{ArdpError, ArdpResult};
use crate::events::ArdpEvents;
use crate::socket::DatagramSocket;

/// tokio sockets satisfy the engine's non-blocking contract through their
/// `try_*` operations; readiness is consumed and re-armed by the driver loop.
struct TokioDatagramSocket(Arc<UdpSocket>);

impl DatagramSocket for TokioDatagramSocket {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> ArdpResult<()> {
        match self.0.try_send_to(buf, to) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(ArdpError::WouldBlock),
            Err(e) => {
                warn!("error sending UDP packet to {:?}: {}", to, e);
                Err(ArdpError::Failed)
            }
        }
    }

    fn recv_from(&self, buf: &mut [u8]) -> ArdpResult<(usize, SocketAddr)> {
        match self.0.try_recv_from(buf) {
            Ok(x) => Ok(x),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(ArdpError::WouldBlock),
            Err(e) => {
                warn!("error receiving UDP packet: {}", e);
                Err(ArdpError::Failed)
            }
        }
    }
}

/// Owns a UDP socket and an engine, and supplies the cooperative schedule
/// the engine expects: call `run(true)` when the socket turns readable,
/// `run(false)` when the engine's reported deadline elapses or the host
/// poked it after an API call.
///
/// Hosts reach the engine through [`ArdpEndpoint::engine`], make their calls
/// under the lock, and [`poke`](ArdpEndpoint::poke) the driver so freshly
/// armed timers shorten the current sleep.
pub struct ArdpEndpoint {
    engine: Arc<Mutex<ArdpEngine>>,
    socket: Arc<UdpSocket>,
    kick: Arc<Notify>,
}

impl ArdpEndpoint {
    pub async fn bind(
        addr: SocketAddr,
        config: ArdpConfig,
        events: Box<dyn ArdpEvents>,
    ) -> anyhow::Result<ArdpEndpoint> {
        let socket = Arc::new(UdpSocket::bind(addr).await.context("binding UDP socket")?);
        info!("bound receive socket to {:?}", socket.local_addr()?);

        let engine = ArdpEngine::new(
            config,
            events,
            Arc::new(TokioDatagramSocket(socket.clone())),
        )?;

        Ok(ArdpEndpoint {
            engine: Arc::new(Mutex::new(engine)),
            socket,
            kick: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn engine(&self) -> Arc<Mutex<ArdpEngine>> {
        self.engine.clone()
    }

    /// Wake the driver loop after API calls made under the engine lock, so
    /// the deadline it is sleeping on gets recomputed.
    pub fn poke(&self) {
        self.kick.notify_one();
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut socket_ready = false;
        loop {
            let next_ms = {
                let mut engine = self.engine.lock().expect("engine lock poisoned");
                engine.run(socket_ready)
            };

            socket_ready = tokio::select! {
                r = self.socket.readable() => {
                    r.context("waiting for socket readability")?;
                    true
                }
                _ = deadline(next_ms) => false,
                _ = self.kick.notified() => false,
            };
        }
    }
}

async fn deadline(next_ms: Option<u32>) {
    match next_ms {
        Some(ms) => sleep(Duration::from_millis(ms as u64)).await,
        None => std::future::pending::<()>().await,
    }
}
