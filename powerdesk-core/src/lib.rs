//! Powerdesk synchronization core
//!
//! Keeps the trading console supplied with live data: a reconnecting,
//! heartbeat-monitored WebSocket channel for pushed price/order/notification
//! events, and a stale-while-revalidate request cache for pulled data.

pub mod cache;
pub mod channels;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod rest;

// Re-export main types for easy access
pub use cache::{
    AccessorOptions, AccessorState, CacheAccessor, CacheEntry, CacheStore, Fetcher, FocusSignal,
};
pub use channels::{
    ChannelFeed, FeedEvent, Invalidation, MarketEvent, MarketFeed, NotificationEvent,
    NotificationFeed, OrderEvent, OrderFeed,
};
pub use clock::{Clock, ManualClock, TokioClock, MAX_DELAY};
pub use config::{ConfigError, SyncConfig};
pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionMetrics, ConnectionState,
    CredentialSource, Envelope, SharedCredential, StaticCredential, WsConnector,
};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use rest::RestClient;
