//! Connection manager: one logical duplex channel per endpoint
//!
//! Keeps a channel alive across drops: linear-capped reconnection backoff,
//! application-level heartbeat, FIFO queueing of messages sent while the
//! channel is down, and subscription bookkeeping. Everything that happens is
//! published as [`ConnectionEvent`]s on a broadcast channel.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use super::credentials::{resolve_url, CredentialSource};
use super::envelope::{
    Envelope, CLOSE_ABNORMAL, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL, CLOSE_UNAUTHORIZED,
};
use super::transport::{Connector, Outbound, TransportEvent};
use super::websocket::WsConnector;
use crate::clock::{bounded, deadline_after};
use crate::error::{SyncError, SyncResult};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    /// Close the transport when a ping goes unanswered this long
    pub pong_timeout: Option<Duration>,
    pub event_buffer: usize,
    /// Query parameter carrying the credential
    pub token_param: String,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based): linear, capped at 3x
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        bounded(self.reconnect_interval.saturating_mul(attempt.clamp(1, 3)))
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(3),
            max_reconnect_attempts: 5,
            pong_timeout: None,
            event_buffer: 1024,
            token_param: "token".to_string(),
        }
    }
}

/// Everything a consumer can observe on a connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// Transport open and outbound queue flushed; re-subscribe here
    Opened,
    Message(Envelope),
    Error(SyncError),
    Closed { code: u16, reason: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
}

/// Channel health counters
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    pub messages_received: u64,
    pub messages_delivered: u64,
    pub parse_errors: u64,
    pub transport_errors: u64,
    pub reconnections: u64,
    pub heartbeats_sent: u64,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inbound {
    Delivered,
    Pong,
    Ignored,
}

struct Shared {
    state: ConnectionState,
    url: Option<Url>,
    queue: VecDeque<Envelope>,
    subscriptions: BTreeSet<String>,
    attempt: u32,
    /// Bumped for every transport; events from older transports are ignored
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    driver: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    metrics: ConnectionMetrics,
}

struct Inner {
    id: Uuid,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSource>,
    shared: Mutex<Shared>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Cloneable handle to one endpoint's channel.
///
/// Feeds talking to the same endpoint should share one manager. Dropping the
/// last handle closes the channel.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        Self::with_connector(config, credentials, Arc::new(WsConnector))
    }

    pub fn with_connector(
        config: ConnectionConfig,
        credentials: Arc<dyn CredentialSource>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                config,
                connector,
                credentials,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    url: None,
                    queue: VecDeque::new(),
                    subscriptions: BTreeSet::new(),
                    attempt: 0,
                    generation: 0,
                    outbound: None,
                    driver: None,
                    reconnect_timer: None,
                    metrics: ConnectionMetrics::default(),
                }),
                events,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// URL used by the latest connection attempt
    pub fn url(&self) -> Option<Url> {
        self.inner.shared.lock().url.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.shared.lock().subscriptions.iter().cloned().collect()
    }

    /// Messages waiting for the next successful open
    pub fn queued(&self) -> usize {
        self.inner.shared.lock().queue.len()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.shared.lock().attempt
    }

    pub fn metrics(&self) -> ConnectionMetrics {
        self.inner.shared.lock().metrics.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Open the channel. No-op while connected or connecting.
    pub fn connect(&self) -> SyncResult<()> {
        let mut shared = self.inner.shared.lock();
        if let Some(timer) = shared.reconnect_timer.take() {
            timer.abort();
        }
        self.inner.open_transport(&mut shared)
    }

    /// Transmit now when connected (`true`), otherwise queue for the next open (`false`)
    pub fn send(&self, envelope: Envelope) -> bool {
        let mut shared = self.inner.shared.lock();
        self.inner.send_locked(&mut shared, envelope)
    }

    pub fn subscribe<S: AsRef<str>>(&self, channels: &[S]) -> bool {
        let mut shared = self.inner.shared.lock();
        for channel in channels {
            shared.subscriptions.insert(channel.as_ref().to_string());
        }
        self.inner
            .send_locked(&mut shared, Envelope::subscribe(channels))
    }

    pub fn unsubscribe<S: AsRef<str>>(&self, channels: &[S]) -> bool {
        let mut shared = self.inner.shared.lock();
        for channel in channels {
            shared.subscriptions.remove(channel.as_ref());
        }
        self.inner
            .send_locked(&mut shared, Envelope::unsubscribe(channels))
    }

    /// Tear down the current transport and connect afresh with a reset attempt counter
    pub fn reconnect(&self) -> SyncResult<()> {
        let mut shared = self.inner.shared.lock();
        info!("Connection {} reconnect requested", self.inner.id);
        self.inner.teardown(&mut shared, "reconnect requested");
        shared.attempt = 0;
        self.inner
            .set_state(&mut shared, ConnectionState::Disconnected);
        self.inner.open_transport(&mut shared)
    }

    /// Close with code 1000 and suppress any further automatic reconnection
    pub fn disconnect(&self) {
        let mut shared = self.inner.shared.lock();
        info!("Connection {} disconnecting", self.inner.id);
        self.inner.teardown(&mut shared, "client disconnect");
        shared.attempt = self.inner.config.max_reconnect_attempts;
        self.inner
            .set_state(&mut shared, ConnectionState::Disconnected);
    }
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, shared: &mut Shared, state: ConnectionState) {
        if shared.state != state {
            debug!("Connection {} {:?} -> {:?}", self.id, shared.state, state);
            shared.state = state;
            self.emit(ConnectionEvent::StateChanged(state));
        }
    }

    fn open_transport(self: &Arc<Self>, shared: &mut Shared) -> SyncResult<()> {
        if matches!(
            shared.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            debug!("Connection {} already {:?}", self.id, shared.state);
            return Ok(());
        }

        let url = match resolve_url(
            &self.config.url,
            &self.config.token_param,
            self.credentials.as_ref(),
        ) {
            Ok(url) => url,
            Err(e) => {
                error!("Connection {} cannot resolve endpoint: {}", self.id, e);
                self.set_state(shared, ConnectionState::Disconnected);
                self.emit(ConnectionEvent::Error(e.clone()));
                return Err(e);
            }
        };

        shared.generation += 1;
        let generation = shared.generation;
        info!(
            "Connection {} connecting to {}{} (attempt {})",
            self.id,
            url.host_str().unwrap_or_default(),
            url.path(),
            shared.attempt
        );
        shared.url = Some(url.clone());
        self.set_state(shared, ConnectionState::Connecting);

        let handle = self.connector.open(url);
        shared.outbound = Some(handle.outbound);
        shared.driver = Some(tokio::spawn(drive(
            Arc::downgrade(self),
            generation,
            handle.events,
            self.config.heartbeat_interval,
            self.config.pong_timeout,
        )));
        Ok(())
    }

    fn send_locked(&self, shared: &mut Shared, envelope: Envelope) -> bool {
        if shared.state == ConnectionState::Connected {
            if let Some(outbound) = &shared.outbound {
                match envelope.encode() {
                    Ok(text) => {
                        if outbound.send(Outbound::Text(text)).is_ok() {
                            return true;
                        }
                    }
                    Err(e) => {
                        warn!("Dropping unencodable {} message: {}", envelope.kind, e);
                        return false;
                    }
                }
            }
        }
        debug!("Queueing {} message while {:?}", envelope.kind, shared.state);
        shared.queue.push_back(envelope);
        false
    }

    /// Drop the current transport without running the close policy
    fn teardown(&self, shared: &mut Shared, reason: &str) {
        if let Some(timer) = shared.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(driver) = shared.driver.take() {
            driver.abort();
        }
        shared.generation += 1;
        if let Some(outbound) = shared.outbound.take() {
            let _ = outbound.send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: reason.to_string(),
            });
            self.emit(ConnectionEvent::Closed {
                code: CLOSE_NORMAL,
                reason: reason.to_string(),
            });
        }
    }

    fn handle_open(&self, generation: u64) -> bool {
        let mut shared = self.shared.lock();
        if shared.generation != generation {
            return false;
        }
        let Some(outbound) = shared.outbound.clone() else {
            return false;
        };

        shared.attempt = 0;
        self.set_state(&mut shared, ConnectionState::Connected);

        let mut flushed = 0;
        while let Some(envelope) = shared.queue.pop_front() {
            match envelope.encode() {
                Ok(text) => {
                    if outbound.send(Outbound::Text(text)).is_err() {
                        shared.queue.push_front(envelope);
                        break;
                    }
                    flushed += 1;
                }
                Err(e) => warn!("Dropping unencodable queued {} message: {}", envelope.kind, e),
            }
        }
        if flushed > 0 {
            info!("Connection {} flushed {} queued messages", self.id, flushed);
        }

        info!("Connection {} open", self.id);
        self.emit(ConnectionEvent::Opened);
        true
    }

    fn handle_message(&self, generation: u64, text: &str) -> Inbound {
        let mut shared = self.shared.lock();
        if shared.generation != generation {
            return Inbound::Ignored;
        }
        shared.metrics.messages_received += 1;
        shared.metrics.last_message_at = Some(Utc::now());

        match Envelope::decode(text) {
            Ok(envelope) if envelope.is_pong() => Inbound::Pong,
            Ok(envelope) if envelope.is_heartbeat() => Inbound::Ignored,
            Ok(envelope) => {
                shared.metrics.messages_delivered += 1;
                self.emit(ConnectionEvent::Message(envelope));
                Inbound::Delivered
            }
            Err(e) => {
                shared.metrics.parse_errors += 1;
                warn!("Connection {} dropping undecodable message: {}", self.id, e);
                Inbound::Ignored
            }
        }
    }

    fn handle_error(&self, generation: u64, message: String) {
        let mut shared = self.shared.lock();
        if shared.generation != generation {
            return;
        }
        shared.metrics.transport_errors += 1;
        warn!("Connection {} transport error: {}", self.id, message);
        self.emit(ConnectionEvent::Error(SyncError::Transport { message }));
    }

    fn send_heartbeat(&self, generation: u64) -> bool {
        let mut shared = self.shared.lock();
        if shared.generation != generation || shared.state != ConnectionState::Connected {
            return false;
        }
        let Some(outbound) = &shared.outbound else {
            return false;
        };
        let sent = match Envelope::ping().encode() {
            Ok(text) => outbound.send(Outbound::Text(text)).is_ok(),
            Err(_) => false,
        };
        if sent {
            shared.metrics.heartbeats_sent += 1;
            debug!("Connection {} ping", self.id);
        }
        sent
    }

    /// Apply the close policy. `local` closes originate here and still need
    /// a close frame written to the transport.
    fn handle_close(self: &Arc<Self>, generation: u64, code: u16, reason: String, local: bool) {
        let mut shared = self.shared.lock();
        if shared.generation != generation {
            debug!("Connection {} ignoring close from superseded transport", self.id);
            return;
        }
        if let Some(outbound) = shared.outbound.take() {
            if local {
                let _ = outbound.send(Outbound::Close {
                    code,
                    reason: reason.clone(),
                });
            }
        }
        // The driver is the caller and exits right after
        shared.driver = None;
        self.emit(ConnectionEvent::Closed {
            code,
            reason: reason.clone(),
        });

        match code {
            CLOSE_NORMAL => {
                info!("Connection {} closed normally", self.id);
                self.set_state(&mut shared, ConnectionState::Disconnected);
            }
            CLOSE_UNAUTHORIZED => {
                error!("Connection {} rejected credential, not reconnecting", self.id);
                self.set_state(&mut shared, ConnectionState::Disconnected);
                self.emit(ConnectionEvent::Error(SyncError::Auth { code }));
            }
            _ if shared.attempt < self.config.max_reconnect_attempts => {
                shared.attempt += 1;
                let attempt = shared.attempt;
                let delay = self.config.backoff_delay(attempt);
                shared.metrics.reconnections += 1;
                warn!(
                    "Connection {} lost (code {}, {}), reconnect attempt {} in {:?}",
                    self.id, code, reason, attempt, delay
                );
                self.set_state(&mut shared, ConnectionState::Reconnecting);
                self.emit(ConnectionEvent::ReconnectScheduled { attempt, delay });
                shared.reconnect_timer = Some(self.schedule_reconnect(delay));
            }
            _ => {
                error!(
                    "Connection {} lost (code {}), giving up after {} attempts",
                    self.id, code, shared.attempt
                );
                self.set_state(&mut shared, ConnectionState::Disconnected);
                self.emit(ConnectionEvent::Error(SyncError::ReconnectExhausted {
                    attempts: shared.attempt,
                }));
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, delay: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            let mut shared = inner.shared.lock();
            if shared.state != ConnectionState::Reconnecting {
                return;
            }
            shared.reconnect_timer = None;
            if let Err(e) = inner.open_transport(&mut shared) {
                error!("Connection {} reconnect failed: {}", inner.id, e);
            }
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut();
        if let Some(timer) = shared.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(driver) = shared.driver.take() {
            driver.abort();
        }
        if let Some(outbound) = shared.outbound.take() {
            let _ = outbound.send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "connection manager dropped".to_string(),
            });
        }
    }
}

/// Per-transport task: feeds transport events into the state machine and
/// runs the heartbeat while connected
async fn drive(
    weak: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    heartbeat_every: Duration,
    pong_timeout: Option<Duration>,
) {
    let mut heartbeat: Option<Interval> = None;
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    Some(TransportEvent::Open) => {
                        if !inner.handle_open(generation) {
                            break;
                        }
                        let every = bounded(heartbeat_every.max(Duration::from_millis(1)));
                        let mut ticker = interval_at(deadline_after(Instant::now(), every), every);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        heartbeat = Some(ticker);
                    }
                    Some(TransportEvent::Message(text)) => {
                        if inner.handle_message(generation, &text) == Inbound::Pong {
                            pong_deadline = None;
                        }
                    }
                    Some(TransportEvent::Error(message)) => inner.handle_error(generation, message),
                    Some(TransportEvent::Closed { code, reason }) => {
                        inner.handle_close(generation, code, reason, false);
                        break;
                    }
                    None => {
                        inner.handle_close(generation, CLOSE_ABNORMAL, "transport dropped".to_string(), false);
                        break;
                    }
                }
            }

            _ = next_tick(&mut heartbeat) => {
                let Some(inner) = weak.upgrade() else { break };
                if inner.send_heartbeat(generation) && pong_deadline.is_none() {
                    pong_deadline = pong_timeout.map(|timeout| deadline_after(Instant::now(), timeout));
                }
            }

            _ = wait_until(pong_deadline) => {
                let Some(inner) = weak.upgrade() else { break };
                warn!("Connection {} missed pong, closing transport", inner.id);
                inner.handle_close(generation, CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout".to_string(), true);
                break;
            }
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MAX_DELAY;
    use crate::connection::credentials::StaticCredential;
    use crate::connection::transport::mock::{MockConnector, MockLink};
    use tokio_test::assert_ok;

    const INTERVAL: Duration = Duration::from_secs(1);

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            url: "ws://desk.test/ws/market".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            reconnect_interval: INTERVAL,
            max_reconnect_attempts: 5,
            ..ConnectionConfig::default()
        }
    }

    fn manager_with(
        config: ConnectionConfig,
    ) -> (
        ConnectionManager,
        MockConnector,
        mpsc::UnboundedReceiver<MockLink>,
    ) {
        let (connector, links) = MockConnector::new();
        let manager = ConnectionManager::with_connector(
            config,
            Arc::new(StaticCredential::new("s3cret")),
            Arc::new(connector.clone()),
        );
        (manager, connector, links)
    }

    async fn next_link(links: &mut mpsc::UnboundedReceiver<MockLink>) -> MockLink {
        tokio::time::timeout(Duration::from_secs(60), links.recv())
            .await
            .expect("no transport opened")
            .expect("connector dropped")
    }

    async fn wait_event(
        events: &mut broadcast::Receiver<ConnectionEvent>,
        mut matches: impl FnMut(&ConnectionEvent) -> bool,
    ) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not observed")
    }

    async fn open_connected(
        manager: &ConnectionManager,
        links: &mut mpsc::UnboundedReceiver<MockLink>,
    ) -> MockLink {
        let mut events = manager.events();
        assert_ok!(manager.connect());
        let link = next_link(links).await;
        link.open();
        wait_event(&mut events, |e| *e == ConnectionEvent::Opened).await;
        link
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_embeds_credential_and_is_idempotent() {
        let (manager, connector, mut links) = manager_with(test_config());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        assert_ok!(manager.connect());
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_ok!(manager.connect());

        let link = next_link(&mut links).await;
        assert_eq!(link.url.as_str(), "ws://desk.test/ws/market?token=s3cret");
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_messages_flush_in_order_before_new_sends() {
        let (manager, _connector, mut links) = manager_with(test_config());

        assert!(!manager.send(Envelope::new("A")));
        assert!(!manager.send(Envelope::new("B")));
        assert_eq!(manager.queued(), 2);

        let mut link = open_connected(&manager, &mut links).await;
        assert!(manager.send(Envelope::new("C")));

        assert_eq!(
            link.sent_texts(),
            vec![
                r#"{"type":"A"}"#.to_string(),
                r#"{"type":"B"}"#.to_string(),
                r#"{"type":"C"}"#.to_string(),
            ]
        );
        assert_eq!(manager.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_close_is_terminal() {
        let (manager, connector, mut links) = manager_with(test_config());
        let mut events = manager.events();
        let link = open_connected(&manager, &mut links).await;

        link.close(CLOSE_UNAUTHORIZED);
        let event = wait_event(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await;
        assert_eq!(event, ConnectionEvent::Error(SyncError::Auth { code: 4001 }));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        tokio::time::sleep(INTERVAL * 5).await;
        assert_eq!(connector.open_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_linear_and_capped() {
        let (manager, _connector, mut links) = manager_with(test_config());
        let mut events = manager.events();
        assert_ok!(manager.connect());

        let mut link = next_link(&mut links).await;
        let mut delays = Vec::new();
        let mut gaps = Vec::new();
        for _ in 0..4 {
            link.close(CLOSE_ABNORMAL);
            if let ConnectionEvent::ReconnectScheduled { delay, .. } = wait_event(&mut events, |e| {
                matches!(e, ConnectionEvent::ReconnectScheduled { .. })
            })
            .await
            {
                delays.push(delay);
            }
            let next = next_link(&mut links).await;
            gaps.push(next.opened_at - link.opened_at);
            link = next;
        }

        let expected = vec![INTERVAL, INTERVAL * 2, INTERVAL * 3, INTERVAL * 3];
        assert_eq!(delays, expected);
        assert_eq!(gaps, expected);
        assert_eq!(manager.reconnect_attempt(), 4);
        assert_eq!(manager.metrics().reconnections, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_when_attempts_exhausted() {
        let (manager, connector, mut links) = manager_with(ConnectionConfig {
            max_reconnect_attempts: 2,
            ..test_config()
        });
        let mut events = manager.events();
        assert_ok!(manager.connect());

        for _ in 0..3 {
            next_link(&mut links).await.close(CLOSE_ABNORMAL);
        }

        let event = wait_event(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await;
        assert_eq!(
            event,
            ConnectionEvent::Error(SyncError::ReconnectExhausted { attempts: 2 })
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        tokio::time::sleep(INTERVAL * 10).await;
        assert_eq!(connector.open_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_open_resets_attempts() {
        let (manager, _connector, mut links) = manager_with(test_config());
        let link = open_connected(&manager, &mut links).await;
        // Subscribed after the first open so only the reconnect's Opened counts
        let mut events = manager.events();

        link.close(CLOSE_ABNORMAL);
        let link = next_link(&mut links).await;
        assert_eq!(manager.reconnect_attempt(), 1);
        assert_eq!(manager.state(), ConnectionState::Connecting);

        link.open();
        wait_event(&mut events, |e| *e == ConnectionEvent::Opened).await;
        assert_eq!(manager.reconnect_attempt(), 0);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_messages_never_reach_consumers() {
        let (manager, _connector, mut links) = manager_with(test_config());
        let mut events = manager.events();
        let link = open_connected(&manager, &mut links).await;

        link.message(r#"{"type":"pong"}"#);
        link.message(r#"{"type":"ping"}"#);
        link.message("{garbage");
        link.message(r#"{"type":"price_update","channel":"prices:de","data":{"price":80.1}}"#);
        link.message(r#"{"type":"notification","channel":"alerts"}"#);

        let mut delivered = Vec::new();
        while delivered.len() < 2 {
            if let ConnectionEvent::Message(envelope) =
                wait_event(&mut events, |e| matches!(e, ConnectionEvent::Message(_))).await
            {
                delivered.push(envelope.kind);
            }
        }
        assert_eq!(delivered, vec!["price_update", "notification"]);

        let metrics = manager.metrics();
        assert_eq!(metrics.messages_received, 5);
        assert_eq!(metrics.messages_delivered, 2);
        assert_eq!(metrics.parse_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_runs_only_while_connected() {
        let (manager, _connector, mut links) = manager_with(test_config());
        let mut link = open_connected(&manager, &mut links).await;

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(
            link.sent_texts(),
            vec![r#"{"type":"ping"}"#.to_string(), r#"{"type":"ping"}"#.to_string()]
        );

        manager.disconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            link.sent_frames(),
            vec![Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "client disconnect".to_string()
            }]
        );
        assert_eq!(manager.metrics().heartbeats_sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timers_do_not_overflow() {
        let (manager, connector, mut links) = manager_with(ConnectionConfig {
            heartbeat_interval: Duration::MAX,
            pong_timeout: Some(Duration::MAX),
            ..test_config()
        });
        let mut link = open_connected(&manager, &mut links).await;

        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert!(link.sent_texts().is_empty());
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let (manager, connector, mut links) = manager_with(test_config());
        let link = open_connected(&manager, &mut links).await;
        let mut events = manager.events();

        link.close(CLOSE_ABNORMAL);
        wait_event(&mut events, |e| matches!(e, ConnectionEvent::ReconnectScheduled { .. })).await;
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.reconnect_attempt(), 5);

        tokio::time::sleep(INTERVAL * 10).await;
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replaces_transport() {
        let (manager, connector, mut links) = manager_with(test_config());
        let mut old = open_connected(&manager, &mut links).await;
        let mut events = manager.events();

        assert_ok!(manager.reconnect());
        let fresh = next_link(&mut links).await;
        assert_eq!(connector.open_count(), 2);
        assert_eq!(
            old.sent_frames(),
            vec![Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "reconnect requested".to_string()
            }]
        );

        // Late events from the replaced transport are ignored
        old.close(CLOSE_ABNORMAL);
        fresh.open();
        wait_event(&mut events, |e| *e == ConnectionEvent::Opened).await;
        tokio::time::sleep(INTERVAL * 5).await;
        assert_eq!(connector.open_count(), 2);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_pong_closes_and_reconnects() {
        let (manager, _connector, mut links) = manager_with(ConnectionConfig {
            pong_timeout: Some(Duration::from_secs(2)),
            ..test_config()
        });
        let mut events = manager.events();
        let mut link = open_connected(&manager, &mut links).await;

        let event = wait_event(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
        assert_eq!(
            event,
            ConnectionEvent::Closed {
                code: CLOSE_HEARTBEAT_TIMEOUT,
                reason: "heartbeat timeout".to_string()
            }
        );
        assert_eq!(
            link.sent_frames(),
            vec![
                Outbound::Text(r#"{"type":"ping"}"#.to_string()),
                Outbound::Close {
                    code: CLOSE_HEARTBEAT_TIMEOUT,
                    reason: "heartbeat timeout".to_string()
                },
            ]
        );
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_connection_alive() {
        let (manager, connector, mut links) = manager_with(ConnectionConfig {
            pong_timeout: Some(Duration::from_secs(2)),
            ..test_config()
        });
        let link = open_connected(&manager, &mut links).await;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(10_500)).await;
            link.message(r#"{"type":"pong"}"#);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_bookkeeping() {
        let (manager, _connector, mut links) = manager_with(test_config());
        assert!(!manager.subscribe(&["prices:de", "prices:fr"]));
        assert_eq!(manager.subscriptions(), vec!["prices:de", "prices:fr"]);

        let mut link = open_connected(&manager, &mut links).await;
        assert!(manager.unsubscribe(&["prices:fr"]));
        assert_eq!(manager.subscriptions(), vec!["prices:de"]);

        let sent = link.sent_texts();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains(r#""type":"subscribe""#));
        assert!(sent[1].contains(r#""type":"unsubscribe""#));
        assert!(sent[1].contains("prices:fr"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_does_not_change_state() {
        let (manager, _connector, mut links) = manager_with(test_config());
        let mut events = manager.events();
        let link = open_connected(&manager, &mut links).await;

        link.events
            .send(TransportEvent::Error("tls hiccup".to_string()))
            .unwrap();
        let event = wait_event(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await;
        assert_eq!(
            event,
            ConnectionEvent::Error(SyncError::Transport {
                message: "tls hiccup".to_string()
            })
        );
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.metrics().transport_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_closes_transport() {
        let (manager, _connector, mut links) = manager_with(test_config());
        let mut link = open_connected(&manager, &mut links).await;

        drop(manager);
        assert_eq!(
            link.sent_frames(),
            vec![Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "connection manager dropped".to_string()
            }]
        );
    }

    #[test]
    fn test_backoff_delay_table() {
        let config = ConnectionConfig {
            reconnect_interval: Duration::from_millis(500),
            ..ConnectionConfig::default()
        };
        let delays: Vec<_> = (1..=5).map(|attempt| config.backoff_delay(attempt)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(1500),
                Duration::from_millis(1500),
                Duration::from_millis(1500),
            ]
        );
    }

    #[test]
    fn test_backoff_delay_saturates() {
        let config = ConnectionConfig {
            reconnect_interval: Duration::MAX,
            ..ConnectionConfig::default()
        };
        assert_eq!(config.backoff_delay(3), MAX_DELAY);
        assert_eq!(config.backoff_delay(u32::MAX), MAX_DELAY);
    }
}
