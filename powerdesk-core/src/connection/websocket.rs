//! tokio-tungstenite transport

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::envelope::{CLOSE_ABNORMAL, CLOSE_NORMAL};
use super::transport::{Connector, Outbound, TransportEvent, TransportHandle};

/// Close code reported when the peer sent a close frame without a code
const CLOSE_NO_STATUS: u16 = 1005;

/// Opens real WebSocket transports
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, url: Url) -> TransportHandle {
        let (handle, outbound, events) = TransportHandle::pair();
        tokio::spawn(run_transport(url, outbound, events));
        handle
    }
}

async fn run_transport(
    url: Url,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            let _ = events.send(TransportEvent::Error(format!("WebSocket connection failed: {}", e)));
            let _ = events.send(TransportEvent::Closed {
                code: CLOSE_ABNORMAL,
                reason: "connect failed".to_string(),
            });
            return;
        }
    };
    info!("WebSocket connected to {}", url.host_str().unwrap_or_default());
    let _ = events.send(TransportEvent::Open);

    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let (message, closing) = match frame {
                    Some(Outbound::Text(text)) => (Message::Text(text), false),
                    Some(Outbound::Close { code, reason }) => (close_message(code, reason), true),
                    // Connection manager is gone
                    None => (close_message(CLOSE_NORMAL, String::new()), true),
                };
                if let Err(e) = sink.send(message).await {
                    let _ = events.send(TransportEvent::Error(format!("Failed to send frame: {}", e)));
                    let _ = events.send(TransportEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: e.to_string(),
                    });
                    break;
                }
                if closing {
                    debug!("WebSocket close frame sent");
                    break;
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(TransportEvent::Message(text));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            let _ = events.send(TransportEvent::Message(text));
                        }
                        Err(_) => warn!("Dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((CLOSE_NO_STATUS, String::new()));
                        let _ = events.send(TransportEvent::Closed { code, reason });
                        break;
                    }
                    // Protocol-level ping/pong is answered by tungstenite itself
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(TransportEvent::Error(format!("WebSocket error: {}", e)));
                        let _ = events.send(TransportEvent::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: e.to_string(),
                        });
                        break;
                    }
                    None => {
                        let _ = events.send(TransportEvent::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: "stream ended".to_string(),
                        });
                        break;
                    }
                }
            }
        }
    }
}

fn close_message(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}
