//! Market-data feed client.
//!
//! An explicitly owned, constructible client with automatic reconnection,
//! heartbeat, idle-deadline stall detection and typed `(channel, symbol)`
//! dispatch. No global socket state: every instance owns its connection
//! task and tears down deterministically.

use crate::{
    connection::{ConnectionState, IdleDeadline, RetryPolicy, log_snippet},
    error::FeedError,
    protocol::{FeedMessage, SubscriptionKey, subscribe_request, unsubscribe_request},
};
use candela_chart::candle::Candle;
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Feed client configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// WebSocket endpoint of the market-data venue
    pub url: String,
    /// Keep-alive ping interval while the connection is open
    pub heartbeat_interval: Duration,
    /// Treat the connection as dead after this long without any inbound frame
    pub idle_timeout: Duration,
    /// Reconnect backoff and attempt bound
    pub retry: RetryPolicy,
    /// Buffer size of each subscription's event channel
    pub channel_buffer_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9001".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            channel_buffer_size: 1000,
        }
    }
}

impl FeedConfig {
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

/// One normalized event delivered to a subscriber.
#[derive(Clone, Debug, PartialEq)]
pub struct FeedEvent {
    pub key: SubscriptionKey,
    pub time_received: DateTime<Utc>,
    pub kind: FeedEventKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FeedEventKind {
    Candle(Candle),
    Tick { price: f64 },
}

/// Commands accepted by the connection task.
enum FeedCommand {
    Subscribe {
        key: SubscriptionKey,
        tx: mpsc::Sender<FeedEvent>,
    },
    Unsubscribe {
        key: SubscriptionKey,
    },
    Reconnect,
    Disconnect,
}

/// Handle to a running feed connection task.
///
/// Obtained from [`FeedClient::connect`]; dropping every handle (or calling
/// [`FeedClient::shutdown`]) terminates the task.
pub struct FeedClient {
    command_tx: mpsc::UnboundedSender<FeedCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    channel_buffer_size: usize,
    handle: JoinHandle<()>,
}

impl FeedClient {
    /// Validate the endpoint and spawn the connection task.
    pub fn connect(config: FeedConfig) -> Result<Self, FeedError> {
        Url::parse(&config.url)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let channel_buffer_size = config.channel_buffer_size;

        let handle = tokio::spawn(async move {
            run_feed_loop(config, command_rx, state_tx).await;
        });

        Ok(Self {
            command_tx,
            state_rx,
            channel_buffer_size,
            handle,
        })
    }

    /// Register a `(channel, symbol)` subscription and receive its events.
    ///
    /// The subscription survives reconnects: it is replayed on every `Open`
    /// transition until unsubscribed or the receiver is dropped.
    pub fn subscribe(&self, key: SubscriptionKey) -> Result<mpsc::Receiver<FeedEvent>, FeedError> {
        let (tx, rx) = mpsc::channel(self.channel_buffer_size);
        self.command_tx
            .send(FeedCommand::Subscribe { key, tx })
            .map_err(|_| FeedError::NotRunning)?;
        Ok(rx)
    }

    pub fn unsubscribe(&self, key: SubscriptionKey) -> Result<(), FeedError> {
        self.command_tx
            .send(FeedCommand::Unsubscribe { key })
            .map_err(|_| FeedError::NotRunning)
    }

    /// Force a fresh connection cycle, also un-parking a client whose retry
    /// budget is exhausted.
    pub fn reconnect(&self) -> Result<(), FeedError> {
        self.command_tx
            .send(FeedCommand::Reconnect)
            .map_err(|_| FeedError::NotRunning)
    }

    /// Close the connection and clear every registered subscription.
    pub fn disconnect(&self) -> Result<(), FeedError> {
        self.command_tx
            .send(FeedCommand::Disconnect)
            .map_err(|_| FeedError::NotRunning)
    }

    /// Latest connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Connection state transitions as a stream, for connectivity indicators.
    pub fn state_stream(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.state_rx.clone())
    }

    /// Terminate the connection task and wait for it to finish.
    pub async fn shutdown(self) {
        let Self {
            command_tx,
            state_rx,
            handle,
            ..
        } = self;
        drop(command_tx);
        drop(state_rx);
        if let Err(error) = handle.await {
            warn!("feed task ended abnormally: {}", error);
        }
    }
}

/// Registered subscriptions, owned by the connection task.
///
/// Single source of truth for reconnect replay: the keys present here are
/// exactly the subscriptions re-sent on every `Open` transition.
#[derive(Default)]
struct SubscriptionRegistry {
    channels: FnvHashMap<SubscriptionKey, Vec<mpsc::Sender<FeedEvent>>>,
}

impl SubscriptionRegistry {
    /// Returns true when the key was not registered before, ie. a wire
    /// subscribe is required.
    fn register(&mut self, key: SubscriptionKey, tx: mpsc::Sender<FeedEvent>) -> bool {
        match self.channels.get_mut(&key) {
            Some(senders) => {
                senders.push(tx);
                false
            }
            None => {
                self.channels.insert(key, vec![tx]);
                true
            }
        }
    }

    /// Returns true when the key was registered, ie. a wire unsubscribe is
    /// required.
    fn remove(&mut self, key: &SubscriptionKey) -> bool {
        self.channels.remove(key).is_some()
    }

    fn keys(&self) -> Vec<SubscriptionKey> {
        self.channels.keys().cloned().collect()
    }

    fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn clear(&mut self) {
        self.channels.clear();
    }

    /// Deliver a classified message to its subscribers, pruning consumers
    /// that dropped their receiver. Returns the number of deliveries.
    fn dispatch(&mut self, message: &FeedMessage) -> usize {
        let Some(key) = message.subscription_key() else {
            return 0;
        };

        let kind = match message {
            FeedMessage::Candle { candle, .. } => FeedEventKind::Candle(Candle::from(candle)),
            FeedMessage::Tick(tick) => FeedEventKind::Tick { price: tick.price },
            FeedMessage::SubscribeAck | FeedMessage::Ignore => return 0,
        };

        let Some(senders) = self.channels.get_mut(&key) else {
            debug!("dropping message for unregistered stream {}", key);
            return 0;
        };

        let event = FeedEvent {
            key: key.clone(),
            time_received: Utc::now(),
            kind,
        };

        let mut delivered = 0;
        senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("subscriber of {} is lagging, event dropped", key);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if senders.is_empty() {
            debug!("last subscriber of {} gone, deregistering", key);
            self.channels.remove(&key);
        }
        delivered
    }
}

/// How one open session ended.
enum SessionEnd {
    /// Server closed the stream, or a reconnect was requested.
    Closed,
    /// Transport error, send failure or idle deadline.
    Errored,
    /// User disconnect: park until an explicit reconnect.
    Parked,
    /// Every client handle is gone.
    Shutdown,
}

/// Main connection loop with auto-reconnect
async fn run_feed_loop(
    config: FeedConfig,
    mut command_rx: mpsc::UnboundedReceiver<FeedCommand>,
    state_tx: watch::Sender<ConnectionState>,
) {
    info!("Starting feed client for {}", config.url);

    let mut registry = SubscriptionRegistry::default();
    let mut attempts: u32 = 0;
    let mut parked = false;

    loop {
        if parked {
            match command_rx.recv().await {
                None => break,
                Some(FeedCommand::Reconnect) => {
                    attempts = 0;
                    parked = false;
                }
                Some(FeedCommand::Subscribe { key, tx }) => {
                    registry.register(key, tx);
                }
                Some(FeedCommand::Unsubscribe { key }) => {
                    registry.remove(&key);
                }
                Some(FeedCommand::Disconnect) => {
                    registry.clear();
                }
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

                let end = run_session(&config, &mut registry, &mut command_rx, stream).await;
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
                    Some(FeedCommand::Reconnect) => {
                        attempts = 0;
                        break;
                    }
                    Some(FeedCommand::Subscribe { key, tx }) => {
                        registry.register(key, tx);
                    }
                    Some(FeedCommand::Unsubscribe { key }) => {
                        registry.remove(&key);
                    }
                    Some(FeedCommand::Disconnect) => {
                        registry.clear();
                        parked = true;
                        break;
                    }
                }
            }
        }
    }

    info!("Feed client for {} stopped", config.url);
}

/// Drive one open connection until it ends.
///
/// Replays the registered subscription set first, then multiplexes inbound
/// frames, commands, the heartbeat and the idle deadline.
async fn run_session(
    config: &FeedConfig,
    registry: &mut SubscriptionRegistry,
    command_rx: &mut mpsc::UnboundedReceiver<FeedCommand>,
    stream: WsStream,
) -> SessionEnd {
    let (mut write, mut read) = stream.split();

    let keys = registry.keys();
    if !keys.is_empty() {
        debug!("Replaying {} subscription(s)", keys.len());
        if let Err(error) = write.send(Message::text(subscribe_request(&keys))).await {
            error!("Failed to replay subscriptions: {}", error);
            return SessionEnd::Errored;
        }
    }

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    let mut idle = IdleDeadline::new(config.idle_timeout);

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    idle.reset();
                    match serde_json::from_str::<FeedMessage>(&text) {
                        Ok(message) => {
                            registry.dispatch(&message);
                        }
                        Err(error) => {
                            debug!(
                                "Failed to parse feed message: {} - {}",
                                error,
                                log_snippet(&text)
                            );
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    warn!("Feed connection closed by server");
                    return SessionEnd::Closed;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    idle.reset();
                }
                Some(Ok(_)) => {
                    idle.reset();
                }
                Some(Err(error)) => {
                    error!("Feed connection error: {}", error);
                    return SessionEnd::Errored;
                }
                None => {
                    warn!("Feed stream ended");
                    return SessionEnd::Closed;
                }
            },

            command = command_rx.recv() => match command {
                None => return SessionEnd::Shutdown,
                Some(FeedCommand::Subscribe { key, tx }) => {
                    let request = subscribe_request(&[key.clone()]);
                    if registry.register(key, tx) {
                        if let Err(error) = write.send(Message::text(request)).await {
                            error!("Failed to send subscribe: {}", error);
                            return SessionEnd::Errored;
                        }
                    }
                }
                Some(FeedCommand::Unsubscribe { key }) => {
                    let request = unsubscribe_request(&[key.clone()]);
                    if registry.remove(&key) {
                        if let Err(error) = write.send(Message::text(request)).await {
                            error!("Failed to send unsubscribe: {}", error);
                            return SessionEnd::Errored;
                        }
                    }
                }
                Some(FeedCommand::Reconnect) => {
                    info!("Reconnect requested, cycling the connection");
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Closed;
                }
                Some(FeedCommand::Disconnect) => {
                    info!("Disconnect requested, clearing subscriptions");
                    registry.clear();
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
    use crate::protocol::{FeedChannel, WireCandle, WireTick};
    use candela_chart::candle::Resolution;
    use serde_json::Value;
    use smol_str::SmolStr;

    fn candle_message(symbol: &str) -> FeedMessage {
        FeedMessage::Candle {
            resolution: Resolution::M1,
            candle: WireCandle {
                start_time: 1_700_000_000_000,
                open: 10.0,
                high: 12.0,
                low: 9.0,
                close: 11.0,
                volume: 1.0,
                symbol: SmolStr::new(symbol),
            },
        }
    }

    #[test]
    fn test_default_config() {
        let config = FeedConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:9001");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.channel_buffer_size, 1000);
    }

    #[test]
    fn test_config_builder() {
        let config = FeedConfig::new("ws://localhost:8080")
            .with_heartbeat_interval(Duration::from_secs(10))
            .with_idle_timeout(Duration::from_secs(20))
            .with_retry(RetryPolicy {
                backoff: Duration::from_millis(500),
                max_attempts: 2,
            })
            .with_channel_buffer_size(64);

        assert_eq!(config.url, "ws://localhost:8080");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, Duration::from_secs(20));
        assert_eq!(config.retry.backoff, Duration::from_millis(500));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.channel_buffer_size, 64);
    }

    #[test]
    fn test_replay_set_matches_registrations_exactly() {
        let mut registry = SubscriptionRegistry::default();
        let (btc_tx, _btc_rx) = mpsc::channel(8);
        let (eth_tx, _eth_rx) = mpsc::channel(8);

        registry.register(SubscriptionKey::candles("BTCUSDT", Resolution::M1), btc_tx);
        registry.register(SubscriptionKey::ticker("ETHUSDT"), eth_tx);

        let keys = registry.keys();
        assert_eq!(keys.len(), 2);

        // the replayed request names exactly the registered pairs
        let request: Value = serde_json::from_str(&subscribe_request(&keys)).unwrap();
        let channels = request["payload"]["channels"].as_array().unwrap();
        let mut pairs: Vec<(String, String)> = channels
            .iter()
            .flat_map(|channel| {
                let name = channel["name"].as_str().unwrap().to_string();
                channel["symbols"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(move |symbol| (name.clone(), symbol.as_str().unwrap().to_string()))
            })
            .collect();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("candlestick_1m".to_string(), "BTCUSDT".to_string()),
                ("ticker".to_string(), "ETHUSDT".to_string()),
            ]
        );
    }

    #[test]
    fn test_register_is_new_only_for_first_consumer() {
        let mut registry = SubscriptionRegistry::default();
        let key = SubscriptionKey::candles("BTCUSDT", Resolution::M5);
        let (first_tx, _first_rx) = mpsc::channel(8);
        let (second_tx, _second_rx) = mpsc::channel(8);

        assert!(registry.register(key.clone(), first_tx));
        assert!(!registry.register(key.clone(), second_tx));
        assert_eq!(registry.keys().len(), 1);

        assert!(registry.remove(&key));
        assert!(!registry.remove(&key));
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_composite_key() {
        let mut registry = SubscriptionRegistry::default();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(SubscriptionKey::candles("BTCUSDT", Resolution::M1), tx);

        // registered pair is delivered
        assert_eq!(registry.dispatch(&candle_message("BTCUSDT")), 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(
            event.key,
            SubscriptionKey::candles("BTCUSDT", Resolution::M1)
        );
        assert!(matches!(
            event.kind,
            FeedEventKind::Candle(candle) if candle.timestamp == 1_700_000_000_000
        ));

        // same channel, unregistered symbol is silently dropped
        assert_eq!(registry.dispatch(&candle_message("ETHUSDT")), 0);

        // non-routable messages are dropped
        assert_eq!(registry.dispatch(&FeedMessage::SubscribeAck), 0);
        assert_eq!(registry.dispatch(&FeedMessage::Ignore), 0);
    }

    #[tokio::test]
    async fn test_dispatch_fans_out_and_prunes_dead_consumers() {
        let mut registry = SubscriptionRegistry::default();
        let key = SubscriptionKey::ticker("BTCUSDT");
        let (first_tx, mut first_rx) = mpsc::channel(8);
        let (second_tx, second_rx) = mpsc::channel(8);
        registry.register(key.clone(), first_tx);
        registry.register(key.clone(), second_tx);

        let tick = FeedMessage::Tick(WireTick {
            symbol: SmolStr::new_static("BTCUSDT"),
            price: 64250.5,
        });
        assert_eq!(registry.dispatch(&tick), 2);
        assert!(first_rx.try_recv().is_ok());

        // one consumer goes away; dispatch keeps delivering to the other
        drop(second_rx);
        assert_eq!(registry.dispatch(&tick), 1);

        // last consumer gone deregisters the key entirely
        drop(first_rx);
        assert_eq!(registry.dispatch(&tick), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = FeedClient::connect(FeedConfig::new("not a url"));
        assert!(matches!(result, Err(FeedError::Url(_))));
    }

    #[tokio::test]
    async fn test_client_lifecycle_without_server() {
        // nothing listens on this port; the client must still accept
        // commands and shut down cleanly
        let config = FeedConfig::new("ws://127.0.0.1:9")
            .with_retry(RetryPolicy {
                backoff: Duration::from_millis(1),
                max_attempts: 1,
            })
            .with_channel_buffer_size(8);
        let client = FeedClient::connect(config).unwrap();

        let _events = client
            .subscribe(SubscriptionKey::candles("BTCUSDT", Resolution::M1))
            .unwrap();
        client
            .unsubscribe(SubscriptionKey::candles("BTCUSDT", Resolution::M1))
            .unwrap();
        client.disconnect().unwrap();
        client.shutdown().await;
    }

    #[test]
    fn test_feed_channel_is_part_of_the_key() {
        let one_minute = SubscriptionKey::candles("BTCUSDT", Resolution::M1);
        let five_minute = SubscriptionKey::candles("BTCUSDT", Resolution::M5);
        assert_ne!(one_minute, five_minute);
        assert_eq!(one_minute.channel, FeedChannel::Candlestick(Resolution::M1));
    }
}
