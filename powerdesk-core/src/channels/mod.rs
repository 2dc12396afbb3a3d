//! Typed feeds on top of a shared connection
//!
//! A feed owns a retained channel list, re-subscribes every time the
//! connection opens, decodes matching envelopes into its event type and
//! marks the cache entries those events make obsolete.

pub mod market;
pub mod notifications;
pub mod orders;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState, Envelope};
use crate::error::SyncResult;

pub use market::{MarketEvent, MarketFeed, PriceTick};
pub use notifications::{Notification, NotificationEvent, NotificationFeed};
pub use orders::{OrderEvent, OrderFeed, OrderUpdate};

/// Cache entries an event makes obsolete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Exactly this key
    Key(String),
    /// Every key starting with this prefix
    Prefix(String),
}

/// Event decoded from a channel envelope
pub trait FeedEvent: Sized + Clone + Send + Sync + 'static {
    /// Envelope types this feed claims when they arrive without a channel
    const KINDS: &'static [&'static str];

    fn decode(envelope: Envelope) -> SyncResult<Self>;

    fn invalidates(&self) -> Vec<Invalidation> {
        Vec::new()
    }
}

/// Feed of `E` events over a (possibly shared) connection
pub struct ChannelFeed<E: FeedEvent> {
    name: &'static str,
    connection: ConnectionManager,
    channels: Vec<String>,
    store: Option<CacheStore>,
    sender: broadcast::Sender<E>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<E: FeedEvent> ChannelFeed<E> {
    pub fn new(name: &'static str, connection: ConnectionManager, channels: Vec<String>) -> Self {
        let (sender, _) = broadcast::channel(connection.config().event_buffer.max(1));
        Self {
            name,
            connection,
            channels,
            store: None,
            sender,
            task: Mutex::new(None),
        }
    }

    /// Invalidate cache entries as events arrive
    pub fn with_store(mut self, store: CacheStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn events(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Start forwarding and make sure the connection is up
    pub fn start(&self) -> SyncResult<()> {
        {
            let mut task = self.task.lock();
            if task.is_some() {
                return Ok(());
            }
            // Listen before connecting so the first Opened is not missed
            let events = self.connection.events();
            if self.connection.state() == ConnectionState::Connected {
                self.connection.subscribe(&self.channels);
            }
            *task = Some(tokio::spawn(forward(
                self.name,
                events,
                self.connection.clone(),
                self.channels.clone(),
                self.store.clone(),
                self.sender.clone(),
            )));
        }
        info!("{} feed started on {:?}", self.name, self.channels);
        self.connection.connect()
    }

    /// Stop forwarding and leave the channels. The connection stays open for
    /// other feeds sharing it.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            self.connection.unsubscribe(&self.channels);
            info!("{} feed stopped", self.name);
        }
    }
}

impl<E: FeedEvent> Drop for ChannelFeed<E> {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

fn accepts<E: FeedEvent>(channels: &[String], envelope: &Envelope) -> bool {
    match &envelope.channel {
        Some(channel) => channels.iter().any(|own| {
            channel == own
                || channel
                    .strip_prefix(own.as_str())
                    .is_some_and(|rest| rest.starts_with(':'))
        }),
        None => E::KINDS.contains(&envelope.kind.as_str()),
    }
}

async fn forward<E: FeedEvent>(
    name: &'static str,
    mut events: broadcast::Receiver<ConnectionEvent>,
    connection: ConnectionManager,
    channels: Vec<String>,
    store: Option<CacheStore>,
    sender: broadcast::Sender<E>,
) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Opened) => {
                debug!("{} feed subscribing to {:?}", name, channels);
                connection.subscribe(&channels);
            }
            Ok(ConnectionEvent::Message(envelope)) => {
                if !accepts::<E>(&channels, &envelope) {
                    continue;
                }
                let kind = envelope.kind.clone();
                let event = match E::decode(envelope) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("{} feed dropping malformed {} message: {}", name, kind, e);
                        continue;
                    }
                };
                if let Some(store) = &store {
                    for invalidation in event.invalidates() {
                        match invalidation {
                            Invalidation::Key(key) => {
                                store.remove(&key);
                                debug!("{} feed invalidated {}", name, key);
                            }
                            Invalidation::Prefix(prefix) => {
                                let removed = store.clear(Some(&prefix));
                                debug!("{} feed invalidated {} entries under {}", name, removed, prefix);
                            }
                        }
                    }
                }
                // No listeners is fine
                let _ = sender.send(event);
            }
            Ok(ConnectionEvent::Error(e)) if e.is_terminal() => {
                warn!("{} feed connection failed: {}", name, e);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("{} feed lagged, skipped {} connection events", name, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::connection::envelope::CLOSE_ABNORMAL;
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::assert_ok;

    #[derive(Debug, Clone, PartialEq)]
    struct Alert(String);

    impl FeedEvent for Alert {
        const KINDS: &'static [&'static str] = &["alert"];

        fn decode(envelope: Envelope) -> SyncResult<Self> {
            Ok(Alert(envelope.data_as::<String>()?))
        }

        fn invalidates(&self) -> Vec<Invalidation> {
            vec![Invalidation::Key(format!("alert:{}", self.0))]
        }
    }

    fn subscribe_frame(channels: &[&str]) -> String {
        assert_ok!(Envelope::subscribe(channels).encode())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_connects_and_subscribes_on_open() {
        let (connection, _connector, mut links) = mock_connection();
        let feed: ChannelFeed<Alert> =
            ChannelFeed::new("alert", connection.clone(), vec!["alerts".to_string()]);

        assert_ok!(feed.start());
        assert!(feed.is_running());
        let mut link = next_link(&mut links).await;
        assert!(link.sent_texts().is_empty());

        link.open();
        settle().await;
        assert_eq!(link.sent_texts(), vec![subscribe_frame(&["alerts"])]);
        assert_eq!(connection.subscriptions(), vec!["alerts"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters_and_invalidates() {
        let (connection, _connector, mut links) = mock_connection();
        let store = CacheStore::new();
        store.set("alert:a", 1u32, Duration::from_secs(60));
        store.set("alert:b", 2u32, Duration::from_secs(60));
        store.set("alert:ab", 3u32, Duration::from_secs(60));

        let feed: ChannelFeed<Alert> =
            ChannelFeed::new("alert", connection, vec!["alerts".to_string()]).with_store(store.clone());
        let mut events = feed.events();
        assert_ok!(feed.start());
        let link = next_link(&mut links).await;
        link.open();

        let foreign = Envelope::new("alert").with_channel("others").with_data(json!("x"));
        let sub_channel = Envelope::new("alert").with_channel("alerts:eu").with_data(json!("a"));
        let unclaimed = Envelope::new("chatter").with_data(json!("y"));
        let bare = Envelope::new("alert").with_data(json!("z"));
        for envelope in [foreign, sub_channel, unclaimed, bare] {
            link.message(&assert_ok!(envelope.encode()));
        }

        assert_eq!(next_event(&mut events).await, Alert("a".to_string()));
        assert_eq!(next_event(&mut events).await, Alert("z".to_string()));
        assert!(!store.has("alert:a"));
        assert!(store.has("alert:b"));
        assert!(store.has("alert:ab"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_skipped() {
        let (connection, _connector, mut links) = mock_connection();
        let feed: ChannelFeed<Alert> =
            ChannelFeed::new("alert", connection, vec!["alerts".to_string()]);
        let mut events = feed.events();
        assert_ok!(feed.start());
        let link = next_link(&mut links).await;
        link.open();

        link.message(r#"{"type":"alert","channel":"alerts","data":42}"#);
        link.message(r#"{"type":"alert","channel":"alerts","data":"ok"}"#);
        assert_eq!(next_event(&mut events).await, Alert("ok".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_reconnect() {
        let (connection, _connector, mut links) = mock_connection();
        let feed: ChannelFeed<Alert> =
            ChannelFeed::new("alert", connection, vec!["alerts".to_string()]);
        assert_ok!(feed.start());

        let first = next_link(&mut links).await;
        first.open();
        settle().await;
        first.close(CLOSE_ABNORMAL);

        let mut second = next_link(&mut links).await;
        second.open();
        settle().await;
        assert_eq!(second.sent_texts(), vec![subscribe_frame(&["alerts"])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feeds_share_one_transport() {
        let (connection, connector, mut links) = mock_connection();
        let a: ChannelFeed<Alert> = ChannelFeed::new("a", connection.clone(), vec!["a".to_string()]);
        let b: ChannelFeed<Alert> = ChannelFeed::new("b", connection.clone(), vec!["b".to_string()]);

        assert_ok!(a.start());
        assert_ok!(b.start());
        let mut link = next_link(&mut links).await;
        link.open();
        settle().await;

        assert_eq!(connector.open_count(), 1);
        let mut sent = link.sent_texts();
        sent.sort();
        assert_eq!(sent, vec![subscribe_frame(&["a"]), subscribe_frame(&["b"])]);
        assert_eq!(connection.subscriptions(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_unsubscribes_and_keeps_connection() {
        let (connection, _connector, mut links) = mock_connection();
        let feed: ChannelFeed<Alert> =
            ChannelFeed::new("alert", connection.clone(), vec!["alerts".to_string()]);
        let mut events = feed.events();
        assert_ok!(feed.start());
        let mut link = next_link(&mut links).await;
        link.open();
        settle().await;
        link.sent_texts();

        feed.stop();
        assert!(!feed.is_running());
        assert_eq!(
            link.sent_texts(),
            vec![assert_ok!(Envelope::unsubscribe(&["alerts"]).encode())]
        );
        assert_eq!(connection.state(), ConnectionState::Connected);

        link.message(r#"{"type":"alert","channel":"alerts","data":"late"}"#);
        settle().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_when_already_connected_subscribes_immediately() {
        let (connection, _connector, mut links) = mock_connection();
        let mut connection_events = connection.events();
        assert_ok!(connection.connect());
        let mut link = next_link(&mut links).await;
        link.open();
        loop {
            if next_event(&mut connection_events).await == ConnectionEvent::Opened {
                break;
            }
        }

        let feed: ChannelFeed<Alert> =
            ChannelFeed::new("alert", connection, vec!["alerts".to_string()]);
        assert_ok!(feed.start());
        assert_eq!(link.sent_texts(), vec![subscribe_frame(&["alerts"])]);
    }
}
