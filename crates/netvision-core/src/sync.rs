//! Viewer-side sync engine.
//!
//! Maintains one WebSocket connection to the relay hub, forever: connects,
//! announces readiness, requests a device snapshot shortly after, and on any
//! disconnect retries on a fixed interval. Incoming logs are de-duplicated,
//! buffered up to a cap and optionally persisted; device state merges
//! additively so a snapshot never erases devices learned elsewhere.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::protocol::WireMessage;
use crate::registry::DeviceRegistry;
use crate::store::LogStore;
use crate::types::{DeviceRecord, LogEnvelope, LogKey};

/// Delay between reconnect attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);
/// Delay between connecting and requesting the device snapshot, giving the
/// hub a beat to settle.
pub const SYNC_REQUEST_DELAY: Duration = Duration::from_millis(500);
/// In-memory log cap.
pub const DEFAULT_MAX_LOGS: usize = 1000;

#[derive(Debug, Clone)]
pub struct SyncEngineOptions {
    /// Relay hub URL, e.g. `ws://127.0.0.1:8970`.
    pub url: String,
    pub reconnect_interval: Duration,
    pub sync_request_delay: Duration,
    /// Oldest in-memory logs are evicted past this count; 0 disables the cap.
    pub max_logs: usize,
}

impl SyncEngineOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_interval: RECONNECT_INTERVAL,
            sync_request_delay: SYNC_REQUEST_DELAY,
            max_logs: DEFAULT_MAX_LOGS,
        }
    }
}

/// Events emitted to whoever renders the engine's state.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    LogAppended(LogEnvelope),
    DevicesChanged(Vec<DeviceRecord>),
}

struct EngineState {
    logs: StdMutex<LogBuffer>,
    registry: RwLock<DeviceRegistry>,
    store: Option<LogStore>,
}

pub struct SyncEngine {
    options: SyncEngineOptions,
    state: Arc<EngineState>,
    event_tx: broadcast::Sender<ClientEvent>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl SyncEngine {
    pub fn new(options: SyncEngineOptions) -> Self {
        Self::build(options, None)
    }

    /// Engine with durable log storage attached. Every newly accepted log is
    /// written through; duplicates never reach the store.
    pub fn with_store(options: SyncEngineOptions, store: LogStore) -> Self {
        Self::build(options, Some(store))
    }

    fn build(options: SyncEngineOptions, store: Option<LogStore>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let max_logs = options.max_logs;
        Self {
            options,
            state: Arc::new(EngineState {
                logs: StdMutex::new(LogBuffer::new(max_logs)),
                registry: RwLock::new(DeviceRegistry::new()),
                store,
            }),
            event_tx,
            shutdown_tx: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    /// Start the connect loop. Calling start on a running engine is a no-op;
    /// the engine never holds more than one connection.
    pub fn start(&mut self) {
        if self.shutdown_tx.is_some() {
            debug!("Sync engine already running, connect attempt skipped");
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let url = self.options.url.clone();
        let reconnect_interval = self.options.reconnect_interval;
        let sync_request_delay = self.options.sync_request_delay;
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = Self::connect_once(&url, &state, &event_tx, sync_request_delay) => {
                        match result {
                            Ok(()) => info!("Sync engine connection closed"),
                            Err(e) => warn!(error = %e, "Sync engine connection failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
                tokio::select! {
                    _ = tokio::time::sleep(reconnect_interval) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
            info!("Sync engine stopped");
        });
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Buffered logs in arrival order.
    pub fn logs(&self) -> Vec<LogEnvelope> {
        self.logs_buffer().snapshot()
    }

    pub fn log_count(&self) -> usize {
        self.logs_buffer().len()
    }

    /// Known devices, buffered and merged across the connection's lifetime.
    pub async fn devices(&self) -> Vec<DeviceRecord> {
        self.state.registry.read().await.snapshot()
    }

    /// Drop every buffered log, and the persisted ones with them.
    pub fn clear_logs(&self) -> Result<()> {
        self.logs_buffer().clear();
        if let Some(store) = &self.state.store {
            store.clear()?;
        }
        Ok(())
    }

    fn logs_buffer(&self) -> std::sync::MutexGuard<'_, LogBuffer> {
        self.state.logs.lock().expect("log buffer mutex poisoned")
    }

    async fn connect_once(
        url: &str,
        state: &Arc<EngineState>,
        event_tx: &broadcast::Sender<ClientEvent>,
        sync_request_delay: Duration,
    ) -> Result<()> {
        let (ws_stream, _) = connect_async(url).await?;
        info!(url, "Sync engine connected");
        let _ = event_tx.send(ClientEvent::Connected);
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let result: Result<()> = async {
            // Announce readiness right away; the snapshot request follows
            // after a short settle delay.
            ws_tx
                .send(Message::Text(WireMessage::ViteReady.encode()?))
                .await?;

            let sync_timer = tokio::time::sleep(sync_request_delay);
            tokio::pin!(sync_timer);
            let mut sync_requested = false;

            loop {
                tokio::select! {
                    _ = &mut sync_timer, if !sync_requested => {
                        sync_requested = true;
                        ws_tx
                            .send(Message::Text(WireMessage::GetDevices.encode()?))
                            .await?;
                        debug!("Requested device snapshot");
                    }
                    inbound = ws_rx.next() => {
                        match inbound {
                            Some(Ok(Message::Text(text))) => {
                                Self::handle_frame(&text, state, event_tx).await;
                            }
                            Some(Ok(Message::Close(_))) | None => return Ok(()),
                            Some(Ok(_)) => {}
                            Some(Err(e)) => return Err(e.into()),
                        }
                    }
                }
            }
        }
        .await;

        let _ = event_tx.send(ClientEvent::Disconnected);
        info!("Sync engine disconnected");
        result
    }

    async fn handle_frame(
        text: &str,
        state: &Arc<EngineState>,
        event_tx: &broadcast::Sender<ClientEvent>,
    ) {
        let message = match WireMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable frame");
                return;
            }
        };

        match message {
            WireMessage::NetworkLog(envelope) => {
                let inserted = state
                    .logs
                    .lock()
                    .expect("log buffer mutex poisoned")
                    .push(envelope.clone());
                if !inserted {
                    debug!(url = %envelope.url, "Skipped duplicate log");
                    return;
                }
                if let Some(store) = &state.store {
                    if let Err(e) = store.insert(&envelope) {
                        warn!(error = %e, "Failed to persist log");
                    }
                }
                let device_seen = state.registry.write().await.upsert_from_log(&envelope);
                let _ = event_tx.send(ClientEvent::LogAppended(envelope));
                if device_seen {
                    let devices = state.registry.read().await.snapshot();
                    let _ = event_tx.send(ClientEvent::DevicesChanged(devices));
                }
            }
            WireMessage::DeviceConnected {
                device_id,
                device_name,
                device_platform,
            } => {
                state.registry.write().await.mark_connected(
                    &device_id,
                    device_name.as_deref(),
                    device_platform,
                );
                let devices = state.registry.read().await.snapshot();
                let _ = event_tx.send(ClientEvent::DevicesChanged(devices));
            }
            WireMessage::DeviceDisconnected { device_id } => {
                if state.registry.write().await.mark_disconnected(&device_id) {
                    let devices = state.registry.read().await.snapshot();
                    let _ = event_tx.send(ClientEvent::DevicesChanged(devices));
                }
            }
            WireMessage::DevicesList { devices } => {
                state.registry.write().await.merge(devices);
                let snapshot = state.registry.read().await.snapshot();
                let _ = event_tx.send(ClientEvent::DevicesChanged(snapshot));
            }
            WireMessage::Hello { message } => {
                debug!(message, "Relay greeting");
            }
            // Our own announcements echo back through the hub.
            WireMessage::GetDevices | WireMessage::ViteReady => {}
        }
    }
}

/// Bounded, de-duplicating log buffer. Eviction frees a slot's dedup key, so
/// a very old capture could in principle be accepted again after falling off
/// the buffer; the durable store keeps the full history either way.
struct LogBuffer {
    entries: VecDeque<LogEnvelope>,
    keys: HashSet<LogKey>,
    cap: usize,
}

impl LogBuffer {
    fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            keys: HashSet::new(),
            cap,
        }
    }

    /// Append unless the envelope is a duplicate. Returns `true` when the
    /// envelope was accepted.
    fn push(&mut self, envelope: LogEnvelope) -> bool {
        if !self.keys.insert(envelope.dedup_key()) {
            return false;
        }
        self.entries.push_back(envelope);
        if self.cap > 0 && self.entries.len() > self.cap {
            if let Some(evicted) = self.entries.pop_front() {
                self.keys.remove(&evicted.dedup_key());
            }
        }
        true
    }

    fn snapshot(&self) -> Vec<LogEnvelope> {
        self.entries.iter().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayHub, RelayHubOptions};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn envelope_at(timestamp: i64, url: &str) -> LogEnvelope {
        LogEnvelope {
            method: "GET".to_string(),
            url: url.to_string(),
            duration: 1.0,
            status: 200,
            request_headers: Default::default(),
            response_headers: Default::default(),
            request_body: None,
            response_body: None,
            cookies: None,
            timestamp,
            device_id: Some("d1".to_string()),
            device_name: Some("Device One".to_string()),
            device_platform: None,
        }
    }

    #[test]
    fn test_log_buffer_rejects_duplicates() {
        let mut buffer = LogBuffer::new(10);
        assert!(buffer.push(envelope_at(1, "https://x.test/a")));
        assert!(!buffer.push(envelope_at(1, "https://x.test/a")));
        assert!(buffer.push(envelope_at(2, "https://x.test/a")));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_log_buffer_caps_and_evicts_oldest() {
        let mut buffer = LogBuffer::new(3);
        for ts in 1..=5 {
            assert!(buffer.push(envelope_at(ts, "https://x.test/a")));
        }
        let logs = buffer.snapshot();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].timestamp, 3);
        assert_eq!(logs[2].timestamp, 5);
    }

    #[test]
    fn test_log_buffer_zero_cap_is_unbounded() {
        let mut buffer = LogBuffer::new(0);
        for ts in 1..=50 {
            buffer.push(envelope_at(ts, "https://x.test/a"));
        }
        assert_eq!(buffer.len(), 50);
    }

    async fn start_hub() -> (RelayHub, String) {
        let mut hub = RelayHub::new(RelayHubOptions { port: 0 });
        hub.start().await.unwrap();
        let addr = hub.local_addr().unwrap();
        (hub, format!("ws://127.0.0.1:{}", addr.port()))
    }

    fn fast_options(url: &str) -> SyncEngineOptions {
        let mut options = SyncEngineOptions::new(url);
        options.reconnect_interval = Duration::from_millis(100);
        options.sync_request_delay = Duration::from_millis(50);
        options
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<ClientEvent>, mut accept: F) -> ClientEvent
    where
        F: FnMut(&ClientEvent) -> bool,
    {
        timeout(Duration::from_secs(3), async {
            loop {
                match rx.recv().await {
                    Ok(event) if accept(&event) => return event,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_engine_buffers_and_dedups_wire_logs() {
        let (_hub, url) = start_hub().await;
        let mut engine = SyncEngine::with_store(fast_options(&url), LogStore::in_memory(0).unwrap());
        let mut events = engine.subscribe();
        engine.start();
        wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;

        let (mut device, _) = connect_async(&url).await.unwrap();
        let frame = WireMessage::NetworkLog(envelope_at(1, "https://x.test/a"))
            .encode()
            .unwrap();
        device.send(Message::Text(frame.clone())).await.unwrap();
        device.send(Message::Text(frame)).await.unwrap();
        device
            .send(Message::Text(
                WireMessage::NetworkLog(envelope_at(2, "https://x.test/b"))
                    .encode()
                    .unwrap(),
            ))
            .await
            .unwrap();

        wait_for(&mut events, |e| {
            matches!(e, ClientEvent::LogAppended(envelope) if envelope.timestamp == 2)
        })
        .await;
        assert_eq!(engine.log_count(), 2, "duplicate must be dropped");

        engine.clear_logs().unwrap();
        assert_eq!(engine.log_count(), 0);
        engine.stop();
    }

    #[tokio::test]
    async fn test_engine_requests_snapshot_after_connect() {
        let (_hub, url) = start_hub().await;

        // A device registers with the hub before any viewer exists.
        let (mut device, _) = connect_async(&url).await.unwrap();
        device
            .send(Message::Text(
                r#"{"type":"device-connected","deviceId":"pixel-7","deviceName":"Pixel 7"}"#
                    .to_string(),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut engine = SyncEngine::new(fast_options(&url));
        let mut events = engine.subscribe();
        engine.start();

        // The delayed get-devices brings the snapshot over.
        wait_for(&mut events, |e| {
            matches!(e, ClientEvent::DevicesChanged(devices)
                if devices.iter().any(|d| d.id == "pixel-7"))
        })
        .await;
        let devices = engine.devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Pixel 7");
        engine.stop();
    }

    #[tokio::test]
    async fn test_engine_reconnects_until_hub_appears() {
        // Reserve a port, then leave it dark so the first attempts fail.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut engine = SyncEngine::new(fast_options(&format!("ws://127.0.0.1:{port}")));
        let mut events = engine.subscribe();
        engine.start();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let mut hub = RelayHub::new(RelayHubOptions { port });
        hub.start().await.unwrap();

        wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;
        engine.stop();
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_engine_reconnects_after_hub_restart() {
        let (mut hub, url) = start_hub().await;
        let port = hub.local_addr().unwrap().port();
        let mut engine = SyncEngine::new(fast_options(&url));
        let mut events = engine.subscribe();
        engine.start();
        wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;

        hub.stop().await;
        wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected)).await;

        let mut revived = RelayHub::new(RelayHubOptions { port });
        revived.start().await.unwrap();
        wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;
        engine.stop();
        revived.stop().await;
    }

    #[tokio::test]
    async fn test_engine_start_is_single_flight() {
        let (hub, url) = start_hub().await;
        let mut engine = SyncEngine::new(fast_options(&url));
        let mut events = engine.subscribe();
        engine.start();
        engine.start();
        engine.start();
        wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(hub.peer_count(), 1, "one engine must hold one connection");
        engine.stop();
    }
}
