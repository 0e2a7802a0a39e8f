/// Candela Feed - Market-Data & State-Sync Connectivity
///
/// Everything that crosses a socket on behalf of the chart engine:
///
/// - A resilient market-data client with typed `(channel, symbol)`
///   subscriptions, reconnect replay, heartbeat and stall detection
/// - Wire protocol types with string-or-number field tolerance and
///   timestamp magnitude normalization
/// - REST candle history backfill so charts open populated
/// - A state-sync channel carrying application state deltas with
///   fingerprint-based outbound change detection
pub mod client;
pub mod connection;
pub mod error;
pub mod history;
pub mod protocol;
pub mod sync;

// Re-export commonly used types for convenience
pub use client::{FeedClient, FeedConfig, FeedEvent, FeedEventKind};
pub use connection::{ConnectionState, RetryPolicy};
pub use error::FeedError;
pub use history::HistoryClient;
pub use protocol::{
    FeedChannel, FeedMessage, SubscriptionKey, WireCandle, WireTick, normalize_timestamp_ms,
    subscribe_request, unsubscribe_request,
};
pub use sync::{
    Applied, ChangeDetector, Notification, NotificationLevel, StateBucket, SyncClient, SyncConfig,
    SyncMessage, SyncState, SyncUpdate,
};
