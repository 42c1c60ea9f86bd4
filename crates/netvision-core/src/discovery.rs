//! UDP discovery beacon.
//!
//! Advertises the relay hub's WebSocket port so devices on the same network
//! can find it without any configuration: a broadcast datagram on a fixed
//! interval, plus a unicast echo of the same payload to any datagram that
//! reaches the socket.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::protocol::discovery_payload;

/// Interval between broadcast announcements.
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone)]
pub struct DiscoveryBeaconOptions {
    /// UDP port to bind. 0 picks an ephemeral port.
    pub port: u16,
    /// WebSocket port advertised in the payload.
    pub ws_port: u16,
    /// Interval between broadcast announcements.
    pub interval: Duration,
    /// Where broadcasts are sent. `None` targets the limited broadcast
    /// address on the bound port.
    pub broadcast_addr: Option<SocketAddr>,
}

impl DiscoveryBeaconOptions {
    pub fn new(port: u16, ws_port: u16) -> Self {
        Self {
            port,
            ws_port,
            interval: BROADCAST_INTERVAL,
            broadcast_addr: None,
        }
    }
}

pub struct DiscoveryBeacon {
    socket: Arc<UdpSocket>,
    payload: String,
    interval: Duration,
    broadcast_addr: SocketAddr,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl DiscoveryBeacon {
    /// Bind the beacon socket. Announcements only start with
    /// [`DiscoveryBeacon::start`].
    pub async fn bind(options: DiscoveryBeaconOptions) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", options.port)).await?;
        socket.set_broadcast(true)?;
        let bound_port = socket.local_addr()?.port();
        let broadcast_addr = options
            .broadcast_addr
            .unwrap_or_else(|| (Ipv4Addr::BROADCAST, bound_port).into());
        info!(
            port = bound_port,
            ws_port = options.ws_port,
            "Discovery beacon bound"
        );
        Ok(Self {
            socket: Arc::new(socket),
            payload: discovery_payload(options.ws_port),
            interval: options.interval,
            broadcast_addr,
            shutdown_tx: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Start announcing. Broadcasts fire on the interval no matter what;
    /// inbound datagrams additionally get a unicast echo so devices that
    /// cannot hear broadcasts can probe directly.
    pub fn start(&mut self) {
        if self.shutdown_tx.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let socket = self.socket.clone();
        let payload = self.payload.clone();
        let broadcast_addr = self.broadcast_addr;
        let interval = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut buf = [0u8; 1024];
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = socket.send_to(payload.as_bytes(), broadcast_addr).await {
                            // Broadcast can fail on odd network setups; the
                            // unicast echo path still works, so keep going.
                            debug!(error = %e, "Discovery broadcast failed");
                        }
                    }
                    received = socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, peer)) => {
                                let request = String::from_utf8_lossy(&buf[..len]);
                                // Our own broadcasts loop back on some
                                // platforms; replying to them would echo
                                // forever.
                                if request.trim() == payload {
                                    continue;
                                }
                                debug!(%peer, "Discovery request");
                                if let Err(e) = socket.send_to(payload.as_bytes(), peer).await {
                                    warn!(%peer, error = %e, "Failed to answer discovery request");
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Discovery socket receive error");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Discovery beacon stopped");
                        break;
                    }
                }
            }
        });
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for DiscoveryBeacon {
    fn drop(&mut self) {
        self.stop();
    }
}
