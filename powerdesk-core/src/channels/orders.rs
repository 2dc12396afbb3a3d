//! Order status feed

use serde::Deserialize;
use serde_json::{Map, Value};
use std::ops::Deref;

use super::{ChannelFeed, FeedEvent, Invalidation};
use crate::cache::CacheStore;
use crate::connection::{ConnectionManager, Envelope};
use crate::error::SyncResult;

pub const ORDER_UPDATE: &str = "order_update";
pub const ORDERS_CHANNEL: &str = "orders";
/// Every cached order listing lives under this prefix
pub const ORDERS_PREFIX: &str = "orders:";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrderUpdate {
    #[serde(alias = "orderId")]
    pub order_id: String,
    pub status: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    Update(OrderUpdate),
    Other(Envelope),
}

impl FeedEvent for OrderEvent {
    const KINDS: &'static [&'static str] = &[ORDER_UPDATE];

    fn decode(envelope: Envelope) -> SyncResult<Self> {
        if envelope.kind == ORDER_UPDATE {
            Ok(Self::Update(envelope.data_as()?))
        } else {
            Ok(Self::Other(envelope))
        }
    }

    fn invalidates(&self) -> Vec<Invalidation> {
        match self {
            Self::Update(_) => vec![Invalidation::Prefix(ORDERS_PREFIX.to_string())],
            Self::Other(_) => Vec::new(),
        }
    }
}

/// The signed-in user's order updates
pub struct OrderFeed {
    feed: ChannelFeed<OrderEvent>,
}

impl OrderFeed {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            feed: ChannelFeed::new("orders", connection, vec![ORDERS_CHANNEL.to_string()]),
        }
    }

    pub fn with_store(self, store: CacheStore) -> Self {
        Self {
            feed: self.feed.with_store(store),
        }
    }
}

impl Deref for OrderFeed {
    type Target = ChannelFeed<OrderEvent>;

    fn deref(&self) -> &Self::Target {
        &self.feed
    }
}
