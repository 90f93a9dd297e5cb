//! Minimal RESP2 client for the session store.

mod connection;
mod error;
mod protocol;

pub use connection::{BoxStream, Connector, StoreClient, StoreStream, TcpConnector};
pub use error::{StoreError, StoreResult};
pub use protocol::{read_exact_bytes, read_reply, Command, IntoArg, Reply};
