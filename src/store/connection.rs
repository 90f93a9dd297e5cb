//! Managed connection to the session store.
//!
//! The client holds at most one connection. It dials lazily on first use and
//! again on the first call after a failure, selects the configured namespace
//! before any other traffic, and drops the connection on any I/O or framing
//! error. There is no retry loop: a call that cannot connect fails once and
//! the next call tries again.

use crate::config::StoreConfig;
use crate::store::error::{StoreError, StoreResult};
use crate::store::protocol::{read_reply, Command, Reply};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Byte stream the client can speak RESP over.
pub trait StoreStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StoreStream for T {}

pub type BoxStream = Box<dyn StoreStream>;

/// Opens raw streams to the store.
///
/// Production dials TCP; tests substitute an in-memory transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> std::io::Result<BoxStream>;

    /// Human-readable target for log lines.
    fn describe(&self) -> String;
}

/// Dials the store over TCP.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> std::io::Result<BoxStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}

struct Connection {
    reader: BufReader<ReadHalf<BoxStream>>,
    writer: WriteHalf<BoxStream>,
}

/// Client for the session store.
///
/// Callers share one instance (`Arc<StoreClient>`); the connection mutex keeps
/// each batch's write and reads together. Batches from different callers are
/// not ordered relative to each other.
pub struct StoreClient {
    connector: Arc<dyn Connector>,
    db: u32,
    connect_timeout: Duration,
    io_timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

impl StoreClient {
    pub fn new(connector: Arc<dyn Connector>, config: &StoreConfig) -> Self {
        Self {
            connector,
            db: config.db,
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
            connection: Mutex::new(None),
        }
    }

    /// Client dialing `config.host:config.port` over TCP.
    pub fn tcp(config: &StoreConfig) -> Self {
        Self::new(Arc::new(TcpConnector::new(config.addr())), config)
    }

    /// Returns true if a live connection is currently held.
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Sends one command and returns its reply.
    pub async fn command(&self, command: Command) -> StoreResult<Reply> {
        let name = command.name();
        self.pipeline(&[command])
            .await?
            .pop()
            .ok_or_else(|| StoreError::protocol(format!("no reply for {}", name)))
    }

    /// Sends `commands` in a single write and reads one reply per command, in
    /// submission order.
    ///
    /// Any transport or framing failure fails the whole batch and drops the
    /// connection. Error replies from the store are returned as
    /// [`Reply::Error`] in their slot.
    pub async fn pipeline(&self, commands: &[Command]) -> StoreResult<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let mut slot = self.connection.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.dial().await?,
        };

        match self.exchange(&mut conn, commands).await {
            Ok(replies) => {
                *slot = Some(conn);
                Ok(replies)
            }
            Err(e) => {
                tracing::warn!(
                    store = %self.connector.describe(),
                    error = %e,
                    commands = commands.len(),
                    "session store batch failed, dropping connection"
                );
                Err(e)
            }
        }
    }

    /// Runs a pipeline with error replies logged and collapsed to `None`.
    pub async fn pipeline_values(&self, commands: &[Command]) -> StoreResult<Vec<Option<Reply>>> {
        let replies = self.pipeline(commands).await?;
        Ok(commands
            .iter()
            .zip(replies)
            .map(|(command, reply)| reply.ok_or_log(&command.name()))
            .collect())
    }

    /// Single command with an error reply logged and collapsed to `None`.
    pub async fn value(&self, command: Command) -> StoreResult<Option<Reply>> {
        let name = command.name();
        Ok(self.command(command).await?.ok_or_log(&name))
    }

    /// Dials the store and selects the namespace.
    async fn dial(&self) -> StoreResult<Connection> {
        let addr = self.connector.describe();
        let stream = match tokio::time::timeout(self.connect_timeout, self.connector.connect()).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(store = %addr, error = %e, "session store connect failed");
                return Err(StoreError::Unavailable {
                    addr,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                tracing::warn!(store = %addr, timeout = ?self.connect_timeout, "session store connect timed out");
                return Err(StoreError::Unavailable {
                    addr,
                    reason: format!("connect timed out after {:?}", self.connect_timeout),
                });
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        let mut conn = Connection {
            reader: BufReader::new(reader),
            writer,
        };

        let select = Command::new("SELECT").arg(self.db);
        let reply = self
            .exchange(&mut conn, std::slice::from_ref(&select))
            .await?
            .pop();
        match reply {
            Some(Reply::Status(_)) => {
                tracing::info!(store = %addr, db = self.db, "connected to session store");
                Ok(conn)
            }
            Some(Reply::Error(message)) => Err(StoreError::Unavailable {
                addr,
                reason: format!("SELECT {} rejected: {}", self.db, message),
            }),
            other => Err(StoreError::protocol(format!(
                "unexpected SELECT reply: {:?}",
                other
            ))),
        }
    }

    async fn exchange(&self, conn: &mut Connection, commands: &[Command]) -> StoreResult<Vec<Reply>> {
        let mut frame = Vec::new();
        for command in commands {
            command.encode_into(&mut frame);
        }

        let writer = &mut conn.writer;
        self.bounded(async {
            writer.write_all(&frame).await?;
            writer.flush().await
        })
        .await?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(self.bounded(read_reply(&mut conn.reader)).await?);
        }
        Ok(replies)
    }

    async fn bounded<T, E>(&self, fut: impl Future<Output = Result<T, E>>) -> StoreResult<T>
    where
        E: Into<StoreError>,
    {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(StoreError::Timeout(self.io_timeout)),
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
