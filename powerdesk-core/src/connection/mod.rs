pub mod credentials;
pub mod envelope;
pub mod manager;
pub mod transport;
pub mod websocket;

pub use credentials::{resolve_url, CredentialSource, SharedCredential, StaticCredential};
pub use envelope::Envelope;
pub use manager::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionMetrics, ConnectionState,
};
pub use transport::{Connector, Outbound, TransportEvent, TransportHandle};
pub use websocket::WsConnector;
