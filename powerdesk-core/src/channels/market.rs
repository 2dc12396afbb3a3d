//! Market price feed

use serde::Deserialize;
use serde_json::{Map, Value};
use std::ops::Deref;

use super::{ChannelFeed, FeedEvent, Invalidation};
use crate::cache::CacheStore;
use crate::connection::{ConnectionManager, Envelope};
use crate::error::SyncResult;

pub const PRICE_UPDATE: &str = "price_update";

/// Cache key of the summary a price tick for `region` makes obsolete
pub fn summary_key(region: &str) -> String {
    format!("market:summary:{}", region)
}

/// Channel carrying price ticks for `region`
pub fn price_channel(region: &str) -> String {
    format!("prices:{}", region)
}

/// Price tick; fields beyond the identifying ones stay untyped
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceTick {
    #[serde(alias = "area")]
    pub region: String,
    pub price: f64,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Price(PriceTick),
    Other(Envelope),
}

impl FeedEvent for MarketEvent {
    const KINDS: &'static [&'static str] = &[PRICE_UPDATE];

    fn decode(envelope: Envelope) -> SyncResult<Self> {
        if envelope.kind == PRICE_UPDATE {
            Ok(Self::Price(envelope.data_as()?))
        } else {
            Ok(Self::Other(envelope))
        }
    }

    fn invalidates(&self) -> Vec<Invalidation> {
        match self {
            Self::Price(tick) => vec![Invalidation::Key(summary_key(&tick.region))],
            Self::Other(_) => Vec::new(),
        }
    }
}

/// Price ticks for a set of regions
pub struct MarketFeed {
    feed: ChannelFeed<MarketEvent>,
}

impl MarketFeed {
    pub fn new<S: AsRef<str>>(connection: ConnectionManager, regions: &[S]) -> Self {
        let channels = regions.iter().map(|r| price_channel(r.as_ref())).collect();
        Self {
            feed: ChannelFeed::new("market", connection, channels),
        }
    }

    pub fn with_store(self, store: CacheStore) -> Self {
        Self {
            feed: self.feed.with_store(store),
        }
    }
}

impl Deref for MarketFeed {
    type Target = ChannelFeed<MarketEvent>;

    fn deref(&self) -> &Self::Target {
        &self.feed
    }
}
