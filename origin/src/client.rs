//! Origin client implementation
//!
//! Owns the WebSocket connection to the mount control endpoint:
//! - Writer task draining an mpsc channel into the socket sink
//! - Reader task feeding text frames to the message router in order
//! - Keep-alive pings with round-trip logging
//! - Status poller rotating through subsystems
//!
//! There is no automatic reconnection. Callers reconnect with `connect`.

use crate::camera::{CameraStateMachine, CaptureSettings};
use crate::dispatcher::Dispatcher;
use crate::error::{OriginError, OriginResult};
use crate::event::OriginEvent;
use crate::image::{HttpImageSource, ImageNotification, ImagePipeline, ImageSource};
use crate::poller;
use crate::protocol::{commands, destinations, MOUNT_CONTROL_PATH};
use crate::router::MessageRouter;
use crate::telemetry::{TelemetryProcessor, TelescopeData};
use crate::{OriginConfig, TelescopeStatus};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound frames queued for the writer task
const OUTBOUND_QUEUE: usize = 100;

/// How long `disconnect` waits for the close frame to be written
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// State shared between the client, the reader task and image downloads
#[derive(Default)]
pub(crate) struct BackendState {
    pub(crate) status: TelescopeStatus,
    pub(crate) telemetry: TelemetryProcessor,
    pub(crate) camera: CameraStateMachine,
    pub(crate) capture: CaptureSettings,
    pub(crate) last_notification: Option<ImageNotification>,
    pub(crate) snapshot_in_flight: bool,
    pub(crate) image_ready: bool,
    pub(crate) last_live_image: Option<::image::DynamicImage>,
    /// Host of the current or last connection, used for image downloads
    pub(crate) host: Option<String>,
}

impl BackendState {
    fn clear_connection_flags(&mut self) {
        self.status.is_connected = false;
        self.status.is_logically_connected = false;
        self.status.is_camera_logically_connected = false;
    }
}

/// Origin client for communicating with a telescope
pub struct OriginClient {
    config: OriginConfig,
    port: u16,
    dispatcher: Arc<Dispatcher>,
    state: Arc<RwLock<BackendState>>,
    event_tx: broadcast::Sender<OriginEvent>,
    router: MessageRouter,
    writer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl OriginClient {
    /// Create a new client downloading images over HTTP
    pub fn new(config: OriginConfig) -> Self {
        let source = Arc::new(HttpImageSource::new(
            config.image_download_timeout(),
            config.image_http_port,
        ));
        Self::with_image_source(config, source)
    }

    /// Create a new client with a custom image source
    pub fn with_image_source(config: OriginConfig, source: Arc<dyn ImageSource>) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_buffer_size.max(1));
        let dispatcher = Arc::new(Dispatcher::new(config.pending_command_capacity));
        let state = Arc::new(RwLock::new(BackendState::default()));
        let pipeline = ImagePipeline::new(source, state.clone(), event_tx.clone());
        let router = MessageRouter::new(dispatcher.clone(), state.clone(), event_tx.clone(), pipeline);

        Self {
            config,
            port: crate::ORIGIN_DEFAULT_PORT,
            dispatcher,
            state,
            event_tx,
            router,
            writer: None,
            tasks: Vec::new(),
        }
    }

    pub fn config(&self) -> &OriginConfig {
        &self.config
    }

    /// Subscribe to client events
    pub fn subscribe(&self) -> broadcast::Receiver<OriginEvent> {
        self.event_tx.subscribe()
    }

    /// Connect to the mount control endpoint.
    ///
    /// Returns immediately if the transport is already up.
    pub async fn connect(&mut self, host: &str, port: u16) -> OriginResult<()> {
        if self.dispatcher.is_connected() {
            tracing::debug!("Already connected to Origin telescope");
            return Ok(());
        }

        // Tasks of a connection the device closed on us
        self.stop_tasks().await;

        let url = format!("ws://{}:{}{}", host, port, MOUNT_CONTROL_PATH);
        tracing::info!("Connecting to Origin telescope at {}", url);

        let duration = self.config.connect_timeout();
        let ws = match timeout(duration, connect_async(url.as_str())).await {
            Ok(Ok((ws, response))) => {
                tracing::debug!("WebSocket handshake status: {}", response.status());
                ws
            }
            Ok(Err(e)) => {
                tracing::error!("Failed to connect to {}: {}", url, e);
                return Err(OriginError::ConnectionFailed(format!("{}: {}", url, e)));
            }
            Err(_) => {
                tracing::error!("Connection to {} timed out after {:?}", url, duration);
                return Err(OriginError::ConnectionTimeout { url, duration });
            }
        };

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.dispatcher.attach(tx).await;
        self.port = port;
        {
            let mut state = self.state.write().await;
            state.host = Some(host.to_string());
            state.status.is_connected = true;
        }

        self.writer = Some(tokio::spawn(Self::writer_task(sink, rx)));
        self.tasks.push(tokio::spawn(Self::reader_task(
            stream,
            self.router.clone(),
            self.dispatcher.clone(),
            self.state.clone(),
            self.event_tx.clone(),
        )));
        self.tasks.push(tokio::spawn(Self::keepalive_task(
            self.dispatcher.clone(),
            self.config.keepalive_interval(),
        )));
        self.tasks.push(tokio::spawn(poller::poll_task(
            self.dispatcher.clone(),
            self.config.status_poll_interval(),
        )));

        tracing::info!("Connected to Origin telescope at {}:{}", host, port);
        self.dispatcher
            .send_command(commands::GET_STATUS, destinations::MOUNT, Value::Null)
            .await?;
        self.emit(OriginEvent::Connected);
        Ok(())
    }

    /// Close the connection and clear every connection flag. Safe to call
    /// when already disconnected.
    pub async fn disconnect(&mut self) {
        self.dispatcher.send_close().await;
        self.dispatcher.detach().await;
        self.stop_tasks().await;
        self.state.write().await.clear_connection_flags();

        tracing::info!("Disconnected from Origin telescope");
        self.emit(OriginEvent::Disconnected);
    }

    async fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            if timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                tracing::debug!("Writer task did not finish closing, aborting");
                writer.abort();
            }
        }
    }

    /// Transport-level connection state
    pub fn is_connected(&self) -> bool {
        self.dispatcher.is_connected()
    }

    /// Transport connected and marked logically connected
    pub async fn is_logically_connected(&self) -> bool {
        self.is_connected() && self.state.read().await.status.is_logically_connected
    }

    pub async fn is_camera_logically_connected(&self) -> bool {
        self.is_connected() && self.state.read().await.status.is_camera_logically_connected
    }

    /// Set the driver-level connection flag. Refused without a transport.
    pub async fn set_connected(&self, connected: bool) -> OriginResult<()> {
        if connected && !self.is_connected() {
            return Err(OriginError::NotConnected);
        }
        self.state.write().await.status.is_logically_connected = connected;
        Ok(())
    }

    /// Set the camera driver's connection flag. Refused without a transport.
    pub async fn set_camera_connected(&self, connected: bool) -> OriginResult<()> {
        if connected && !self.is_connected() {
            return Err(OriginError::NotConnected);
        }
        self.state.write().await.status.is_camera_logically_connected = connected;
        Ok(())
    }

    /// `host:port` of the current or last connection
    pub async fn connected_host(&self) -> Option<String> {
        self.state
            .read()
            .await
            .host
            .as_ref()
            .map(|host| format!("{}:{}", host, self.port))
    }

    pub async fn status(&self) -> TelescopeStatus {
        self.state.read().await.status.clone()
    }

    /// Ambient temperature in Celsius
    pub async fn temperature(&self) -> f64 {
        self.state.read().await.status.temperature
    }

    /// Snapshot of all telemetry sections
    pub async fn telemetry(&self) -> TelescopeData {
        self.state.read().await.telemetry.data().clone()
    }

    /// Send a raw command. Returns its correlation id.
    pub async fn send_command(
        &self,
        command: &str,
        destination: &str,
        params: Value,
    ) -> OriginResult<u32> {
        self.dispatcher.send_command(command, destination, params).await
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub(crate) fn shared(&self) -> &Arc<RwLock<BackendState>> {
        &self.state
    }

    pub(crate) fn emit(&self, event: OriginEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Attach an in-memory transport and return what would go on the wire
    #[cfg(test)]
    pub(crate) async fn attach_test_transport(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(64);
        self.dispatcher.attach(tx).await;
        let mut state = self.state.write().await;
        state.status.is_connected = true;
        state.host = Some("127.0.0.1".to_string());
        rx
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    async fn writer_task(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Message>) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = sink.send(msg).await {
                tracing::error!("Origin write error: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    }

    async fn reader_task(
        mut stream: SplitStream<WsStream>,
        router: MessageRouter,
        dispatcher: Arc<Dispatcher>,
        state: Arc<RwLock<BackendState>>,
        event_tx: broadcast::Sender<OriginEvent>,
    ) {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => router.handle_text(&text).await,
                Ok(Message::Pong(payload)) => log_pong(&payload),
                Ok(Message::Close(frame)) => {
                    tracing::info!("Origin telescope closed the connection: {:?}", frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Origin read error: {}", e);
                    break;
                }
            }
        }

        if dispatcher.detach().await {
            state.write().await.clear_connection_flags();
            tracing::info!("Disconnected from Origin telescope");
            let _ = event_tx.send(OriginEvent::Disconnected);
        }
    }

    async fn keepalive_task(dispatcher: Arc<Dispatcher>, period: Duration) {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let payload = current_time_ms().to_string().into_bytes();
            if let Err(e) = dispatcher.send_ping(payload).await {
                tracing::debug!("Keep-alive stopping: {}", e);
                break;
            }
        }
    }
}

impl Drop for OriginClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// Milliseconds since the UNIX epoch
fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Pong payloads echo the millisecond timestamp sent in the ping
fn log_pong(payload: &[u8]) {
    let sent = std::str::from_utf8(payload)
        .ok()
        .and_then(|s| s.parse::<u64>().ok());
    match sent {
        Some(sent) => tracing::debug!(
            "Pong received, round trip {} ms",
            current_time_ms().saturating_sub(sent)
        ),
        None => tracing::debug!("Pong received with {} byte payload", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_client_is_disconnected() {
        let client = OriginClient::new(OriginConfig::default());
        assert!(!client.is_connected());
        assert!(!client.is_logically_connected().await);
        assert!(client.connected_host().await.is_none());
        assert_eq!(client.temperature().await, 20.0);
        assert_eq!(client.status().await.current_operation, "Idle");
    }

    #[tokio::test]
    async fn test_logical_flags_require_transport() {
        let client = OriginClient::new(OriginConfig::default());
        assert!(matches!(
            client.set_connected(true).await,
            Err(OriginError::NotConnected)
        ));
        assert!(matches!(
            client.set_camera_connected(true).await,
            Err(OriginError::NotConnected)
        ));
        // Clearing is always allowed
        assert!(client.set_connected(false).await.is_ok());

        let _rx = client.attach_test_transport().await;
        client.set_connected(true).await.unwrap();
        client.set_camera_connected(true).await.unwrap();
        assert!(client.is_logically_connected().await);
        assert!(client.is_camera_logically_connected().await);
    }

    #[tokio::test]
    async fn test_disconnect_clears_flags_and_emits() {
        let mut client = OriginClient::new(OriginConfig::default());
        let mut rx = client.attach_test_transport().await;
        client.set_connected(true).await.unwrap();
        client.set_camera_connected(true).await.unwrap();
        let mut events = client.subscribe();

        client.disconnect().await;
        assert!(!client.is_connected());
        assert!(!client.is_logically_connected().await);
        let status = client.status().await;
        assert!(!status.is_connected);
        assert!(!status.is_logically_connected);
        assert!(!status.is_camera_logically_connected);
        assert!(matches!(events.recv().await.unwrap(), OriginEvent::Disconnected));
        assert!(matches!(rx.recv().await, Some(Message::Close(None))));

        // Second call is harmless
        client.disconnect().await;
        assert!(matches!(events.recv().await.unwrap(), OriginEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_send_command_while_disconnected() {
        let client = OriginClient::new(OriginConfig::default());
        assert!(matches!(
            client.send_command("Park", "Mount", Value::Null).await,
            Err(OriginError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = OriginClient::new(OriginConfig::default());
        let result = client.connect("127.0.0.1", port).await;
        assert!(matches!(result, Err(OriginError::ConnectionFailed(_))));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_log_pong_tolerates_garbage() {
        log_pong(b"not a number");
        log_pong(current_time_ms().to_string().as_bytes());
    }

    #[tokio::test]
    async fn test_connect_times_out_without_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept the TCP connection but never answer the upgrade
        let silent = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let mut client = OriginClient::new(OriginConfig {
            connect_timeout_secs: 1,
            ..OriginConfig::default()
        });
        let mut events = client.subscribe();
        let result = client.connect("127.0.0.1", port).await;

        match result {
            Err(OriginError::ConnectionTimeout { duration, .. }) => {
                assert_eq!(duration, Duration::from_secs(1));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(!client.is_connected());
        assert!(client.connected_host().await.is_none());
        assert!(events.try_recv().is_err());
        silent.abort();
    }

    #[tokio::test]
    async fn test_keepalive_sends_timestamped_pings() {
        let client = OriginClient::new(OriginConfig::default());
        let mut rx = client.attach_test_transport().await;
        let before = current_time_ms();
        let keepalive = tokio::spawn(OriginClient::keepalive_task(
            client.dispatcher().clone(),
            Duration::from_millis(20),
        ));

        for _ in 0..2 {
            let frame = timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match frame {
                Message::Ping(payload) => {
                    let sent: u64 = std::str::from_utf8(&payload).unwrap().parse().unwrap();
                    assert!(sent >= before);
                }
                other => panic!("expected ping, got {:?}", other),
            }
        }
        keepalive.abort();
    }
}
