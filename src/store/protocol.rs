//! RESP2 wire format for the session store.
//!
//! Requests are arrays of length-prefixed (bulk) strings. Replies start with a
//! one-byte type marker:
//!
//! - `+` status line
//! - `-` error line
//! - `:` signed integer
//! - `$` bulk string, `$-1` meaning absent
//! - `*` array of nested replies, `*-1` meaning absent
//!
//! Header lines are CRLF terminated. Bulk payloads are read by exact length,
//! never by scanning for a terminator, so values may contain any bytes.

use crate::store::error::{StoreError, StoreResult};
use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound on a declared bulk length (matches the server's own limit).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound on a reply header line, CRLF included.
const MAX_HEADER_LEN: u64 = 64 * 1024;

/// Upper bound on preallocated array capacity for a declared element count.
const MAX_ARRAY_PREALLOC: usize = 1024;

/// Converts a value into a single binary-safe command argument.
pub trait IntoArg {
    fn into_arg(self) -> Vec<u8>;
}

impl IntoArg for Vec<u8> {
    fn into_arg(self) -> Vec<u8> {
        self
    }
}

impl IntoArg for &[u8] {
    fn into_arg(self) -> Vec<u8> {
        self.to_vec()
    }
}

impl IntoArg for String {
    fn into_arg(self) -> Vec<u8> {
        self.into_bytes()
    }
}

impl IntoArg for &String {
    fn into_arg(self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl IntoArg for &str {
    fn into_arg(self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

macro_rules! int_arg {
    ($($t:ty),*) => {
        $(impl IntoArg for $t {
            fn into_arg(self) -> Vec<u8> {
                self.to_string().into_bytes()
            }
        })*
    };
}

int_arg!(u32, u64, i64, usize);

/// A single store command: name followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    parts: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Self {
            parts: vec![name.as_bytes().to_vec()],
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl IntoArg) -> Self {
        self.parts.push(arg.into_arg());
        self
    }

    /// Appends every item of `args` as a separate argument.
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: IntoArg,
    {
        self.parts.extend(args.into_iter().map(IntoArg::into_arg));
        self
    }

    /// Command name, uppercased, for logging.
    pub fn name(&self) -> String {
        self.parts
            .first()
            .map(|n| String::from_utf8_lossy(n).to_ascii_uppercase())
            .unwrap_or_default()
    }

    /// Appends the request frame for this command to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(format!("*{}\r\n", self.parts.len()).as_bytes());
        for part in &self.parts {
            write_bulk(buf, part);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }
}

fn write_bulk(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(format!("${}\r\n", payload.len()).as_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(b"\r\n");
}

/// A decoded store reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Appends the wire encoding of this reply to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Status(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Error(s) => {
                buf.push(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Integer(n) => buf.extend_from_slice(format!(":{}\r\n", n).as_bytes()),
            Reply::Bulk(None) => buf.extend_from_slice(b"$-1\r\n"),
            Reply::Bulk(Some(payload)) => write_bulk(buf, payload),
            Reply::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
            Reply::Array(Some(items)) => {
                buf.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode_into(buf);
                }
            }
        }
    }

    /// Collapses an error reply into "no value", logging it.
    pub fn ok_or_log(self, command: &str) -> Option<Reply> {
        match self {
            Reply::Error(message) => {
                tracing::warn!(command, error = %message, "session store returned an error reply");
                None
            }
            other => Some(other),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn into_integer(self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(n),
            _ => None,
        }
    }

    pub fn into_bulk(self) -> Option<Vec<u8>> {
        match self {
            Reply::Bulk(payload) => payload,
            _ => None,
        }
    }

    /// Bulk or status payload as text.
    pub fn into_string(self) -> Option<String> {
        match self {
            Reply::Bulk(Some(payload)) => Some(String::from_utf8_lossy(&payload).into_owned()),
            Reply::Status(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::Array(items) => items,
            _ => None,
        }
    }

    /// Array of bulk strings as text; non-bulk elements are skipped.
    pub fn into_strings(self) -> Vec<String> {
        self.into_array()
            .unwrap_or_default()
            .into_iter()
            .filter_map(Reply::into_string)
            .collect()
    }
}

/// Reads exactly `len` bytes.
pub async fn read_exact_bytes<R>(reader: &mut R, len: usize) -> StoreResult<Vec<u8>>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Reads one CRLF-terminated header line, without the terminator.
async fn read_header<R>(reader: &mut R) -> StoreResult<Vec<u8>>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_HEADER_LEN)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed by session store",
        )));
    }
    if !line.ends_with(b"\n") && n as u64 >= MAX_HEADER_LEN {
        return Err(StoreError::protocol(format!(
            "reply header exceeds {} bytes",
            MAX_HEADER_LEN
        )));
    }
    if !line.ends_with(b"\r\n") {
        return Err(StoreError::protocol("reply line not terminated by CRLF"));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_length(raw: &[u8]) -> StoreResult<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            StoreError::protocol(format!(
                "invalid numeric field {:?}",
                String::from_utf8_lossy(raw)
            ))
        })
}

/// Decodes one reply, recursing into arrays.
pub fn read_reply<'a, R>(reader: &'a mut R) -> BoxFuture<'a, StoreResult<Reply>>
where
    R: AsyncBufRead + Unpin + Send + 'a,
{
    async move {
        let line = read_header(reader).await?;
        let Some((&marker, rest)) = line.split_first() else {
            return Err(StoreError::protocol("empty reply line"));
        };

        match marker {
            b'+' => Ok(Reply::Status(String::from_utf8_lossy(rest).into_owned())),
            b'-' => Ok(Reply::Error(String::from_utf8_lossy(rest).into_owned())),
            b':' => Ok(Reply::Integer(parse_length(rest)?)),
            b'$' => {
                let declared = parse_length(rest)?;
                if declared < 0 {
                    return Ok(Reply::Bulk(None));
                }
                if declared > MAX_BULK_LEN {
                    return Err(StoreError::protocol(format!(
                        "bulk length {} exceeds limit",
                        declared
                    )));
                }
                let len = declared as usize;
                let mut payload = read_exact_bytes(reader, len + 2).await?;
                if !payload.ends_with(b"\r\n") {
                    return Err(StoreError::protocol("bulk payload not terminated by CRLF"));
                }
                payload.truncate(len);
                Ok(Reply::Bulk(Some(payload)))
            }
            b'*' => {
                let declared = parse_length(rest)?;
                if declared < 0 {
                    return Ok(Reply::Array(None));
                }
                let count = declared as usize;
                let mut items = Vec::with_capacity(count.min(MAX_ARRAY_PREALLOC));
                for _ in 0..count {
                    items.push(read_reply(&mut *reader).await?);
                }
                Ok(Reply::Array(Some(items)))
            }
            other => Err(StoreError::protocol(format!(
                "unknown reply marker 0x{:02x}",
                other
            ))),
        }
    }
    .boxed()
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
