//! Relay hub: the WebSocket broadcast bus at the center of the tooling.
//!
//! Devices, viewers and any other tooling all connect as equal peers. Every
//! inbound text frame is fanned out verbatim to every open peer, including
//! the sender; the hub decodes frames only to maintain its device registry
//! and to answer `get-devices`. Because all peers feed one broadcast
//! channel, every peer observes frames in the same order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::protocol::WireMessage;
use crate::registry::DeviceRegistry;

/// Frames buffered per slow peer before it starts missing messages.
const FANOUT_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub struct RelayHubOptions {
    /// TCP port to listen on. 0 picks an ephemeral port.
    pub port: u16,
}

pub struct RelayHub {
    options: RelayHubOptions,
    registry: Arc<RwLock<DeviceRegistry>>,
    broadcast_tx: broadcast::Sender<String>,
    peers: Arc<AtomicUsize>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl RelayHub {
    pub fn new(options: RelayHubOptions) -> Self {
        let (broadcast_tx, _) = broadcast::channel(FANOUT_BUFFER);
        Self {
            options,
            registry: Arc::new(RwLock::new(DeviceRegistry::new())),
            broadcast_tx,
            peers: Arc::new(AtomicUsize::new(0)),
            local_addr: None,
            shutdown_tx: None,
        }
    }

    /// Bind the listener and start accepting peers.
    pub async fn start(&mut self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.options.port)).await?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        info!(port = local_addr.port(), "Relay hub listening");

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let registry = self.registry.clone();
        let broadcast_tx = self.broadcast_tx.clone();
        let peers = self.peers.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                let registry = registry.clone();
                                let broadcast_tx = broadcast_tx.clone();
                                let peers = peers.clone();
                                let conn_shutdown = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    if let Err(e) = Self::handle_connection(
                                        stream,
                                        addr,
                                        registry,
                                        broadcast_tx,
                                        peers,
                                        conn_shutdown,
                                    )
                                    .await
                                    {
                                        warn!(%addr, error = %e, "Relay connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "Relay accept error");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Relay hub stopped");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Address the hub is bound to once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Peers currently connected.
    pub fn peer_count(&self) -> usize {
        self.peers.load(Ordering::SeqCst)
    }

    /// The hub's device registry, shared with whoever hosts the hub.
    pub fn registry(&self) -> Arc<RwLock<DeviceRegistry>> {
        self.registry.clone()
    }

    /// Stop accepting and close every open peer.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RwLock<DeviceRegistry>>,
        broadcast_tx: broadcast::Sender<String>,
        peers: Arc<AtomicUsize>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // Subscribe before the greeting so nothing slips past in between.
        let mut fanout_rx = broadcast_tx.subscribe();
        peers.fetch_add(1, Ordering::SeqCst);
        info!(%addr, "Relay peer connected");

        let hello = WireMessage::Hello {
            message: "netvision relay ready".to_string(),
        };
        let mut greeted = false;
        if let Ok(text) = hello.encode() {
            greeted = ws_tx.send(Message::Text(text)).await.is_ok();
        }

        if greeted {
            loop {
                tokio::select! {
                    frame = fanout_rx.recv() => {
                        match frame {
                            Ok(text) => {
                                if ws_tx.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(%addr, skipped, "Relay peer fell behind fan-out");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    inbound = ws_rx.next() => {
                        match inbound {
                            Some(Ok(Message::Text(text))) => {
                                match WireMessage::decode(&text) {
                                    Ok(message) => {
                                        Self::register_frame(&message, &registry).await;
                                        if let WireMessage::GetDevices = message {
                                            let devices = registry.read().await.snapshot();
                                            let reply = WireMessage::DevicesList { devices };
                                            match reply.encode() {
                                                Ok(reply_text) => {
                                                    if ws_tx.send(Message::Text(reply_text)).await.is_err() {
                                                        break;
                                                    }
                                                }
                                                Err(e) => {
                                                    warn!(error = %e, "Failed to encode devices-list");
                                                }
                                            }
                                        }
                                        // Fan out the original text, byte for
                                        // byte, to every peer.
                                        let _ = broadcast_tx.send(text);
                                    }
                                    Err(e) => {
                                        warn!(%addr, error = %e, "Dropping unparseable frame");
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                debug!(%addr, error = %e, "Relay peer socket error");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }

        peers.fetch_sub(1, Ordering::SeqCst);
        // A closing socket says nothing about the device behind it; the
        // registry only changes on explicit frames.
        info!(%addr, "Relay peer disconnected");
        Ok(())
    }

    async fn register_frame(message: &WireMessage, registry: &Arc<RwLock<DeviceRegistry>>) {
        match message {
            WireMessage::NetworkLog(envelope) => {
                registry.write().await.upsert_from_log(envelope);
            }
            WireMessage::DeviceConnected {
                device_id,
                device_name,
                device_platform,
            } => {
                registry.write().await.mark_connected(
                    device_id,
                    device_name.as_deref(),
                    *device_platform,
                );
                info!(device_id = %device_id, "Device connected");
            }
            WireMessage::DeviceDisconnected { device_id } => {
                registry.write().await.mark_disconnected(device_id);
                info!(device_id = %device_id, "Device disconnected");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_hub() -> (RelayHub, String) {
        let mut hub = RelayHub::new(RelayHubOptions { port: 0 });
        hub.start().await.unwrap();
        let addr = hub.local_addr().unwrap();
        (hub, format!("ws://127.0.0.1:{}", addr.port()))
    }

    async fn connect(url: &str) -> WsClient {
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }

    async fn next_text(ws: &mut WsClient) -> String {
        loop {
            let message = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("socket error");
            if let Message::Text(text) = message {
                return text;
            }
        }
    }

    #[tokio::test]
    async fn test_hello_greeting_on_connect() {
        let (_hub, url) = start_hub().await;
        let mut peer = connect(&url).await;
        let greeting = next_text(&mut peer).await;
        match WireMessage::decode(&greeting).unwrap() {
            WireMessage::Hello { message } => assert_eq!(message, "netvision relay ready"),
            other => panic!("unexpected greeting: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fanout_is_byte_identical_for_all_peers() {
        let (_hub, url) = start_hub().await;
        let mut sender = connect(&url).await;
        let mut observer_a = connect(&url).await;
        let mut observer_b = connect(&url).await;
        for peer in [&mut sender, &mut observer_a, &mut observer_b] {
            next_text(peer).await; // greeting
        }

        // Odd spacing and key order must survive the trip untouched.
        let frame = "{\"type\":\"network-log\",  \"url\":\"https://x.test/a\",\"method\":\"GET\",\"timestamp\":1,\"deviceId\":\"d1\"}";
        sender.send(Message::Text(frame.to_string())).await.unwrap();

        assert_eq!(next_text(&mut observer_a).await, frame);
        assert_eq!(next_text(&mut observer_b).await, frame);
        // The sender hears its own frame too.
        assert_eq!(next_text(&mut sender).await, frame);
    }

    #[tokio::test]
    async fn test_frames_arrive_in_receipt_order() {
        let (_hub, url) = start_hub().await;
        let mut sender = connect(&url).await;
        let mut observer = connect(&url).await;
        next_text(&mut sender).await;
        next_text(&mut observer).await;

        for n in 0..5 {
            let frame = format!(
                "{{\"type\":\"network-log\",\"method\":\"GET\",\"url\":\"https://x.test/{n}\",\"timestamp\":{n}}}"
            );
            sender.send(Message::Text(frame)).await.unwrap();
        }

        for n in 0..5 {
            let received = next_text(&mut observer).await;
            assert!(received.contains(&format!("https://x.test/{n}")));
        }
    }

    #[tokio::test]
    async fn test_get_devices_returns_registry_snapshot() {
        let (_hub, url) = start_hub().await;
        let mut peer = connect(&url).await;
        next_text(&mut peer).await;

        peer.send(Message::Text(
            r#"{"type":"device-connected","deviceId":"pixel-7","deviceName":"Pixel 7","devicePlatform":"android"}"#.to_string(),
        ))
        .await
        .unwrap();
        peer.send(Message::Text(r#"{"type":"get-devices"}"#.to_string()))
            .await
            .unwrap();

        let devices = loop {
            let text = next_text(&mut peer).await;
            if let Ok(WireMessage::DevicesList { devices }) = WireMessage::decode(&text) {
                break devices;
            }
        };
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "pixel-7");
        assert_eq!(devices[0].name, "Pixel 7");
        assert!(devices[0].connected);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped_not_fanned_out() {
        let (_hub, url) = start_hub().await;
        let mut sender = connect(&url).await;
        let mut observer = connect(&url).await;
        next_text(&mut sender).await;
        next_text(&mut observer).await;

        sender
            .send(Message::Text("this is not json".to_string()))
            .await
            .unwrap();
        sender
            .send(Message::Text(r#"{"type":"mystery-frame"}"#.to_string()))
            .await
            .unwrap();
        let valid = r#"{"type":"vite-ready"}"#;
        sender.send(Message::Text(valid.to_string())).await.unwrap();

        // The first frame the observer sees is the valid one.
        assert_eq!(next_text(&mut observer).await, valid);
    }

    #[tokio::test]
    async fn test_peer_close_does_not_touch_registry() {
        let (hub, url) = start_hub().await;
        let mut peer = connect(&url).await;
        next_text(&mut peer).await;
        peer.send(Message::Text(
            r#"{"type":"device-connected","deviceId":"d1"}"#.to_string(),
        ))
        .await
        .unwrap();
        next_text(&mut peer).await; // own echo
        peer.close(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let registry = hub.registry();
        let snapshot = registry.read().await.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].connected, "socket close must not disconnect");
    }

    #[tokio::test]
    async fn test_stop_closes_connected_peers() {
        let (mut hub, url) = start_hub().await;
        let mut peer = connect(&url).await;
        next_text(&mut peer).await;

        hub.stop().await;

        let closed = timeout(Duration::from_secs(2), async {
            loop {
                match peer.next().await {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "peer was not closed on hub stop");
    }
}
