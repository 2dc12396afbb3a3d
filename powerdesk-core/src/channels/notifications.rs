//! User notification feed

use serde::Deserialize;
use serde_json::{Map, Value};
use std::ops::Deref;

use super::{ChannelFeed, FeedEvent, Invalidation};
use crate::cache::CacheStore;
use crate::connection::{ConnectionManager, Envelope};
use crate::error::SyncResult;

pub const NOTIFICATION: &str = "notification";
pub const NOTIFICATIONS_CHANNEL: &str = "notifications";
pub const NOTIFICATIONS_PREFIX: &str = "notifications:";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    Notice(Notification),
    Other(Envelope),
}

impl FeedEvent for NotificationEvent {
    const KINDS: &'static [&'static str] = &[NOTIFICATION];

    fn decode(envelope: Envelope) -> SyncResult<Self> {
        if envelope.kind == NOTIFICATION {
            Ok(Self::Notice(envelope.data_as()?))
        } else {
            Ok(Self::Other(envelope))
        }
    }

    fn invalidates(&self) -> Vec<Invalidation> {
        match self {
            Self::Notice(_) => vec![Invalidation::Prefix(NOTIFICATIONS_PREFIX.to_string())],
            Self::Other(_) => Vec::new(),
        }
    }
}

pub struct NotificationFeed {
    feed: ChannelFeed<NotificationEvent>,
}

impl NotificationFeed {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            feed: ChannelFeed::new(
                "notifications",
                connection,
                vec![NOTIFICATIONS_CHANNEL.to_string()],
            ),
        }
    }

    pub fn with_store(self, store: CacheStore) -> Self {
        Self {
            feed: self.feed.with_store(store),
        }
    }
}

impl Deref for NotificationFeed {
    type Target = ChannelFeed<NotificationEvent>;

    fn deref(&self) -> &Self::Target {
        &self.feed
    }
}
