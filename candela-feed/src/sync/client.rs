//! Sync channel client.
//!
//! Same connection machinery as the market-data client (reconnect with
//! bounded retries, heartbeat, idle deadline), carrying `{event, data}`
//! envelopes in both directions instead of market data.

use super::{ChangeDetector, Notification, StateBucket, SyncMessage};
use crate::{
    client::WsStream,
    connection::{ConnectionState, IdleDeadline, RetryPolicy, log_snippet},
    error::FeedError,
    protocol::WireTick,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

/// Sync channel configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket endpoint of the coordinating server
    pub url: String,
    /// Keep-alive ping interval while the connection is open
    pub heartbeat_interval: Duration,
    /// Treat the connection as dead after this long without any inbound frame
    pub idle_timeout: Duration,
    /// Reconnect backoff and attempt bound
    pub retry: RetryPolicy,
    /// Buffer size of the update channel
    pub channel_buffer_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9002".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            channel_buffer_size: 100,
        }
    }
}

impl SyncConfig {
    /// Create a new configuration with custom URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set channel buffer size
    pub fn with_channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size;
        self
    }
}

/// One inbound sync update, ready for the consumer's reducer.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncUpdate {
    Notification(Notification),
    Tick(WireTick),
    Bucket { bucket: StateBucket, data: Value },
}

impl SyncUpdate {
    fn from_message(message: SyncMessage) -> Option<Self> {
        match message {
            SyncMessage::Notification(notification) => {
                Some(SyncUpdate::Notification(notification))
            }
            SyncMessage::Tick(tick) => Some(SyncUpdate::Tick(tick)),
            SyncMessage::Bucket { bucket, data } => Some(SyncUpdate::Bucket { bucket, data }),
            SyncMessage::Ignore => None,
        }
    }
}

enum SyncCommand {
    SendState { bucket: StateBucket, data: Value },
    Reconnect,
    Disconnect,
}

/// Handle to a running sync connection task.
pub struct SyncClient {
    command_tx: mpsc::UnboundedSender<SyncCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    handle: JoinHandle<()>,
}

impl SyncClient {
    /// Validate the endpoint, spawn the connection task and return the
    /// handle together with the inbound update stream.
    ///
    /// Dropping the update receiver shuts the connection task down.
    pub fn connect(config: SyncConfig) -> Result<(Self, mpsc::Receiver<SyncUpdate>), FeedError> {
        Url::parse(&config.url)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (updates_tx, updates_rx) = mpsc::channel(config.channel_buffer_size);

        let handle = tokio::spawn(async move {
            run_sync_loop(config, command_rx, state_tx, updates_tx).await;
        });

        Ok((
            Self {
                command_tx,
                state_rx,
                handle,
            },
            updates_rx,
        ))
    }

    /// Queue one bucket snapshot for transmission.
    ///
    /// The snapshot only hits the wire when its content changed since the
    /// last transmission; while disconnected it is dropped (the full state
    /// is re-sent after the next reconnect anyway).
    pub fn send_update(&self, bucket: StateBucket, data: Value) -> Result<(), FeedError> {
        self.command_tx
            .send(SyncCommand::SendState { bucket, data })
            .map_err(|_| FeedError::NotRunning)
    }

    /// Force a fresh connection cycle, also un-parking an exhausted client.
    pub fn reconnect(&self) -> Result<(), FeedError> {
        self.command_tx
            .send(SyncCommand::Reconnect)
            .map_err(|_| FeedError::NotRunning)
    }

    /// Close the connection and park until an explicit reconnect.
    pub fn disconnect(&self) -> Result<(), FeedError> {
        self.command_tx
            .send(SyncCommand::Disconnect)
            .map_err(|_| FeedError::NotRunning)
    }

    /// Latest connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Connection state transitions as a stream.
    pub fn state_stream(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.state_rx.clone())
    }

    /// Terminate the connection task and wait for it to finish.
    pub async fn shutdown(self) {
        let Self {
            command_tx,
            state_rx,
            handle,
        } = self;
        drop(command_tx);
        drop(state_rx);
        if let Err(error) = handle.await {
            warn!("sync task ended abnormally: {}", error);
        }
    }
}

enum SessionEnd {
    Closed,
    Errored,
    Parked,
    Shutdown,
}

/// Main sync connection loop with auto-reconnect
async fn run_sync_loop(
    config: SyncConfig,
    mut command_rx: mpsc::UnboundedReceiver<SyncCommand>,
    state_tx: watch::Sender<ConnectionState>,
    updates_tx: mpsc::Sender<SyncUpdate>,
) {
    info!("Starting sync client for {}", config.url);

    let mut detector = ChangeDetector::new();
    let mut attempts: u32 = 0;
    let mut parked = false;

    loop {
        if parked {
            match command_rx.recv().await {
                None => break,
                Some(SyncCommand::Reconnect) => {
                    attempts = 0;
                    parked = false;
                }
                Some(SyncCommand::SendState { bucket, .. }) => {
                    debug!("Not connected, {} snapshot dropped", bucket);
                }
                Some(SyncCommand::Disconnect) => {}
            }
            continue;
        }

        let _ = state_tx.send(ConnectionState::Connecting);
        info!("Connecting to {}", config.url);

        match connect_async(&config.url).await {
            Ok((stream, _)) => {
                info!("Connected to {}", config.url);
                attempts = 0;
                let _ = state_tx.send(ConnectionState::Open);

                // the server may have restarted; forget what was transmitted
                // so every bucket is sent fresh on its next change
                detector.reset();

                let end = run_session(
                    &config,
                    &mut detector,
                    &mut command_rx,
                    &updates_tx,
                    stream,
                )
                .await;
                match end {
                    SessionEnd::Closed => {
                        let _ = state_tx.send(ConnectionState::Closed);
                    }
                    SessionEnd::Errored => {
                        let _ = state_tx.send(ConnectionState::Errored);
                    }
                    SessionEnd::Parked => {
                        let _ = state_tx.send(ConnectionState::Closed);
                        let _ = state_tx.send(ConnectionState::Disconnected);
                        parked = true;
                        continue;
                    }
                    SessionEnd::Shutdown => break,
                }
            }
            Err(error) => {
                error!("Failed to connect to {}: {}", config.url, error);
                let _ = state_tx.send(ConnectionState::Errored);
            }
        }

        let _ = state_tx.send(ConnectionState::Disconnected);

        attempts += 1;
        if config.retry.exhausted(attempts) {
            error!(
                "{}, parking until an explicit reconnect",
                FeedError::RetriesExhausted { attempts }
            );
            parked = true;
            continue;
        }

        debug!(
            "Waiting {:?} before reconnecting (attempt {}/{})",
            config.retry.backoff, attempts, config.retry.max_attempts
        );
        let backoff = tokio::time::sleep(config.retry.backoff);
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                _ = &mut backoff => break,
                command = command_rx.recv() => match command {
                    None => return,
                    Some(SyncCommand::Reconnect) => {
                        attempts = 0;
                        break;
                    }
                    Some(SyncCommand::SendState { bucket, .. }) => {
                        debug!("Not connected, {} snapshot dropped", bucket);
                    }
                    Some(SyncCommand::Disconnect) => {
                        parked = true;
                        break;
                    }
                }
            }
        }
    }

    info!("Sync client for {} stopped", config.url);
}

async fn run_session(
    config: &SyncConfig,
    detector: &mut ChangeDetector,
    command_rx: &mut mpsc::UnboundedReceiver<SyncCommand>,
    updates_tx: &mpsc::Sender<SyncUpdate>,
    stream: WsStream,
) -> SessionEnd {
    let (mut write, mut read) = stream.split();

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    let mut idle = IdleDeadline::new(config.idle_timeout);

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    idle.reset();
                    match serde_json::from_str::<SyncMessage>(&text) {
                        Ok(message) => {
                            if let Some(update) = SyncUpdate::from_message(message) {
                                if updates_tx.send(update).await.is_err() {
                                    info!("Sync update receiver gone, stopping");
                                    return SessionEnd::Shutdown;
                                }
                            }
                        }
                        Err(error) => {
                            debug!(
                                "Failed to parse sync message: {} - {}",
                                error,
                                log_snippet(&text)
                            );
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    warn!("Sync connection closed by server");
                    return SessionEnd::Closed;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    idle.reset();
                }
                Some(Ok(_)) => {
                    idle.reset();
                }
                Some(Err(error)) => {
                    error!("Sync connection error: {}", error);
                    return SessionEnd::Errored;
                }
                None => {
                    warn!("Sync stream ended");
                    return SessionEnd::Closed;
                }
            },

            command = command_rx.recv() => match command {
                None => return SessionEnd::Shutdown,
                Some(SyncCommand::SendState { bucket, data }) => {
                    match detector.encode_if_changed(bucket, &data) {
                        Some(envelope) => {
                            if let Err(error) = write.send(Message::text(envelope)).await {
                                error!("Failed to send {} snapshot: {}", bucket, error);
                                return SessionEnd::Errored;
                            }
                        }
                        None => debug!("{} unchanged, nothing sent", bucket),
                    }
                }
                Some(SyncCommand::Reconnect) => {
                    info!("Reconnect requested, cycling the connection");
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Closed;
                }
                Some(SyncCommand::Disconnect) => {
                    info!("Disconnect requested");
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Parked;
                }
            },

            _ = heartbeat.tick() => {
                if write.send(Message::Ping(vec![].into())).await.is_err() {
                    error!("Failed to send heartbeat ping");
                    return SessionEnd::Errored;
                }
            }

            _ = idle.expired() => {
                warn!(
                    "No inbound frame for {:?}, treating connection as dead",
                    config.idle_timeout
                );
                return SessionEnd::Errored;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:9002");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.channel_buffer_size, 100);
    }

    #[test]
    fn test_config_builder() {
        let config = SyncConfig::new("ws://localhost:9100")
            .with_heartbeat_interval(Duration::from_secs(5))
            .with_idle_timeout(Duration::from_secs(15))
            .with_retry(RetryPolicy {
                backoff: Duration::from_millis(250),
                max_attempts: 3,
            })
            .with_channel_buffer_size(16);

        assert_eq!(config.url, "ws://localhost:9100");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.channel_buffer_size, 16);
    }

    #[test]
    fn test_update_from_message_drops_ignore() {
        assert_eq!(SyncUpdate::from_message(SyncMessage::Ignore), None);
        assert_eq!(
            SyncUpdate::from_message(SyncMessage::Bucket {
                bucket: StateBucket::Tasks,
                data: json!({}),
            }),
            Some(SyncUpdate::Bucket {
                bucket: StateBucket::Tasks,
                data: json!({}),
            })
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = SyncClient::connect(SyncConfig::new("::"));
        assert!(matches!(result, Err(FeedError::Url(_))));
    }

    #[tokio::test]
    async fn test_client_lifecycle_without_server() {
        let config = SyncConfig::new("ws://127.0.0.1:9").with_retry(RetryPolicy {
            backoff: Duration::from_millis(1),
            max_attempts: 1,
        });
        let (client, _updates) = SyncClient::connect(config).unwrap();

        client
            .send_update(StateBucket::Notes, json!({ "n1": "hello" }))
            .unwrap();
        client.reconnect().unwrap();
        client.disconnect().unwrap();
        client.shutdown().await;
    }
}
