//! Powerdesk sync console
//!
//! Headless client that keeps the live feeds and the market summary cache
//! warm and logs what it sees. Handy for soak-testing a trading endpoint.

use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use powerdesk_core::channels::market::summary_key;
use powerdesk_core::{
    AccessorOptions, CacheAccessor, CacheStore, ConnectionEvent, ConnectionManager,
    CredentialSource, MarketEvent, MarketFeed, NotificationEvent, NotificationFeed, OrderEvent,
    OrderFeed, RestClient, SharedCredential, SyncConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SyncConfig::load()?;
    info!(
        "🚀 Starting powerdesk sync console for regions {:?}",
        config.endpoints.regions
    );
    if config.credential.token.is_none() {
        warn!("No credential configured, connecting anonymously");
    }

    let credentials: Arc<dyn CredentialSource> =
        Arc::new(SharedCredential::new(config.credential.token.clone()));

    let store = CacheStore::new();
    let sweeper = config.sweep_interval().map(|every| store.spawn_sweeper(every));

    // Feeds on the same endpoint share one connection
    let mut connections: HashMap<String, ConnectionManager> = HashMap::new();
    let market = MarketFeed::new(
        shared_connection(&mut connections, &config, &credentials, &config.endpoints.market_ws_url),
        &config.endpoints.regions,
    )
    .with_store(store.clone());
    let orders = OrderFeed::new(shared_connection(
        &mut connections,
        &config,
        &credentials,
        &config.endpoints.orders_ws_url,
    ))
    .with_store(store.clone());
    let notifications = NotificationFeed::new(shared_connection(
        &mut connections,
        &config,
        &credentials,
        &config.endpoints.notifications_ws_url,
    ))
    .with_store(store.clone());
    info!("✅ {} connection(s) for 3 feeds", connections.len());

    for (url, connection) in &connections {
        tokio::spawn(log_connection(url.clone(), connection.clone()));
    }

    // Pull side: one summary accessor per region
    let rest = RestClient::new(&config.endpoints.api_base_url, credentials.clone())?;
    let mut summaries: HashMap<String, CacheAccessor<Value>> = HashMap::new();
    for region in &config.endpoints.regions {
        let accessor = CacheAccessor::new(
            summary_key(region),
            store.clone(),
            rest.fetcher::<Value>(format!("market/summary/{}", region)),
            summary_options(&config, region),
        );
        accessor.activate().await;
        summaries.insert(region.clone(), accessor);
    }

    let mut market_events = market.events();
    let mut order_events = orders.events();
    let mut notification_events = notifications.events();
    market.start()?;
    orders.start()?;
    notifications.start()?;
    info!("📈 Feeds started, press Ctrl+C to stop");

    loop {
        tokio::select! {
            event = market_events.recv() => match event {
                Ok(MarketEvent::Price(tick)) => {
                    debug!("{} price {:.2}", tick.region, tick.price);
                    // The feed already dropped the cached summary
                    if let Some(accessor) = summaries.get(&tick.region) {
                        let accessor = accessor.clone();
                        tokio::spawn(async move {
                            accessor.refetch().await;
                        });
                    }
                }
                Ok(MarketEvent::Other(envelope)) => debug!("market {}", envelope.kind),
                Err(RecvError::Lagged(skipped)) => warn!("Market log lagged by {} events", skipped),
                Err(RecvError::Closed) => break,
            },

            event = order_events.recv() => match event {
                Ok(OrderEvent::Update(update)) => info!("📋 Order {} is {}", update.order_id, update.status),
                Ok(OrderEvent::Other(envelope)) => debug!("orders {}", envelope.kind),
                Err(RecvError::Lagged(skipped)) => warn!("Order log lagged by {} events", skipped),
                Err(RecvError::Closed) => break,
            },

            event = notification_events.recv() => match event {
                Ok(NotificationEvent::Notice(notice)) => info!(
                    "🔔 [{}] {}",
                    notice.level.as_deref().unwrap_or("info"),
                    notice.title.as_deref().unwrap_or(&notice.id)
                ),
                Ok(NotificationEvent::Other(envelope)) => debug!("notifications {}", envelope.kind),
                Err(RecvError::Lagged(skipped)) => warn!("Notification log lagged by {} events", skipped),
                Err(RecvError::Closed) => break,
            },

            _ = signal::ctrl_c() => {
                info!("🛑 Shutdown signal received");
                break;
            }
        }
    }

    market.stop();
    orders.stop();
    notifications.stop();
    for accessor in summaries.values() {
        accessor.deactivate();
    }
    for (url, connection) in &connections {
        let metrics = connection.metrics();
        info!(
            "📊 {}: {} received, {} delivered, {} reconnections, {} parse errors",
            url,
            metrics.messages_received,
            metrics.messages_delivered,
            metrics.reconnections,
            metrics.parse_errors
        );
        connection.disconnect();
    }
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("✅ Powerdesk sync console stopped ({} cached entries)", store.len());
    Ok(())
}

fn shared_connection(
    connections: &mut HashMap<String, ConnectionManager>,
    config: &SyncConfig,
    credentials: &Arc<dyn CredentialSource>,
    url: &str,
) -> ConnectionManager {
    connections
        .entry(url.to_string())
        .or_insert_with(|| ConnectionManager::new(config.connection_config(url), credentials.clone()))
        .clone()
}

fn summary_options(config: &SyncConfig, region: &str) -> AccessorOptions<Value> {
    let mut options = AccessorOptions::default().ttl(config.ttl());
    if let Some(stale_time) = config.stale_time() {
        options = options.stale_time(stale_time);
    }
    if let Some(every) = config.refetch_interval() {
        options = options.refetch_interval(every);
    }
    let region = region.to_string();
    let failed_region = region.clone();
    options
        .on_success(move |_| debug!("Summary for {} refreshed", region))
        .on_error(move |e| warn!("Summary for {} unavailable: {}", failed_region, e))
}

async fn log_connection(url: String, connection: ConnectionManager) {
    let mut events = connection.events();
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::StateChanged(state)) => info!("{} is {:?}", url, state),
            Ok(ConnectionEvent::ReconnectScheduled { attempt, delay }) => {
                warn!("{} reconnect attempt {} in {:?}", url, attempt, delay)
            }
            Ok(ConnectionEvent::Error(e)) if e.is_terminal() => {
                error!("❌ {} needs attention: {}", url, e)
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}
