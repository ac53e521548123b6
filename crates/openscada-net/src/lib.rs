// openscada-net: GMPP wire protocol for the openSCADA subscription fabric

pub mod codec;
pub mod connection;
pub mod error;
pub mod message;
pub mod protocol;
pub mod reconnect;
pub mod transport;
pub mod value;

pub use codec::GmppCodec;
pub use connection::{Connection, ConnectionState};
pub use error::Error;
pub use message::{HEADER_SIZE, Message, command};
pub use reconnect::{ReconnectConfig, calculate_backoff};
pub use transport::TransportConfig;
pub use value::{Value, ValueMap};
