//! Transport seam between the connection state machine and the network
//!
//! A [`Connector`] opens one transport per connection attempt and reports
//! everything that happens on it as [`TransportEvent`]s, in arrival order.

use tokio::sync::mpsc;
use url::Url;

/// Something that happened on an open (or opening) transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(String),
    /// Reported for visibility only; the close that follows drives state
    Error(String),
    Closed { code: u16, reason: String },
}

/// Frame written to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Both halves of one transport
#[derive(Debug)]
pub struct TransportHandle {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportHandle {
    /// Build a handle plus the far ends a transport implementation drives
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<Outbound>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: outbound_tx,
                events: events_rx,
            },
            outbound_rx,
            events_tx,
        )
    }
}

/// Opens transports. Must be called from within a tokio runtime.
pub trait Connector: Send + Sync + 'static {
    /// Start opening `url`. Success is reported as `Open`, failure as
    /// `Error` followed by `Closed`.
    fn open(&self, url: Url) -> TransportHandle;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::time::Instant;

    /// Far side of one mocked transport
    pub(crate) struct MockLink {
        pub url: Url,
        pub opened_at: Instant,
        pub frames: mpsc::UnboundedReceiver<Outbound>,
        pub events: mpsc::UnboundedSender<TransportEvent>,
    }

    impl MockLink {
        pub fn open(&self) {
            let _ = self.events.send(TransportEvent::Open);
        }

        pub fn message(&self, text: &str) {
            let _ = self.events.send(TransportEvent::Message(text.to_string()));
        }

        pub fn close(&self, code: u16) {
            let _ = self.events.send(TransportEvent::Closed {
                code,
                reason: String::new(),
            });
        }

        /// Text frames written so far
        pub fn sent_texts(&mut self) -> Vec<String> {
            let mut texts = Vec::new();
            while let Ok(frame) = self.frames.try_recv() {
                if let Outbound::Text(text) = frame {
                    texts.push(text);
                }
            }
            texts
        }

        pub fn sent_frames(&mut self) -> Vec<Outbound> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.frames.try_recv() {
                frames.push(frame);
            }
            frames
        }
    }

    /// Hands every opened transport to the test through `links`
    #[derive(Clone)]
    pub(crate) struct MockConnector {
        opened: Arc<Mutex<Vec<Url>>>,
        links: mpsc::UnboundedSender<MockLink>,
    }

    impl MockConnector {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<MockLink>) {
            let (links, rx) = mpsc::unbounded_channel();
            (
                Self {
                    opened: Arc::new(Mutex::new(Vec::new())),
                    links,
                },
                rx,
            )
        }

        pub fn open_count(&self) -> usize {
            self.opened.lock().len()
        }
    }

    impl Connector for MockConnector {
        fn open(&self, url: Url) -> TransportHandle {
            let (handle, frames, events) = TransportHandle::pair();
            self.opened.lock().push(url.clone());
            let _ = self.links.send(MockLink {
                url,
                opened_at: Instant::now(),
                frames,
                events,
            });
            handle
        }
    }
}
