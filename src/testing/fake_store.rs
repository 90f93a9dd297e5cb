//! In-memory RESP server standing in for the session store.
//!
//! Each connection gets its own duplex pipe served by a task that decodes
//! requests with the real reply decoder and answers with the real reply
//! encoder, so tests exercise the client's wire path end to end. Only the
//! commands the tracker uses are implemented, with the server's semantics for
//! them (including removal of sets that become empty).

use crate::config::StoreConfig;
use crate::store::{read_reply, BoxStream, Connector, Reply, StoreClient};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};

const DATABASES: u32 = 16;

#[derive(Debug, Clone)]
enum Value {
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
    Set(BTreeSet<Vec<u8>>),
}

#[derive(Default)]
struct Keyspace {
    values: HashMap<Vec<u8>, Value>,
    ttls: HashMap<Vec<u8>, i64>,
}

#[derive(Default)]
struct State {
    keyspaces: HashMap<u32, Keyspace>,
    log: Vec<Vec<String>>,
    connects: usize,
    down: bool,
    sever_next: bool,
    stalled: bool,
}

#[derive(Clone, Default)]
pub(crate) struct FakeStore {
    state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl FakeStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            state: self.state.clone(),
        })
    }

    /// Client with short timeouts talking to this store on database 0.
    pub(crate) fn client(&self) -> Arc<StoreClient> {
        self.client_with(StoreConfig {
            connect_timeout: Duration::from_millis(200),
            io_timeout: Duration::from_millis(200),
            ..StoreConfig::default()
        })
    }

    pub(crate) fn client_with(&self, config: StoreConfig) -> Arc<StoreClient> {
        Arc::new(StoreClient::new(self.connector(), &config))
    }

    /// Refuses new connections while set.
    pub(crate) fn set_down(&self, down: bool) {
        lock(&self.state).down = down;
    }

    /// Closes the connection instead of answering the next request.
    pub(crate) fn sever_next_request(&self) {
        lock(&self.state).sever_next = true;
    }

    /// Stops answering requests while set.
    pub(crate) fn set_stalled(&self, stalled: bool) {
        lock(&self.state).stalled = stalled;
    }

    pub(crate) fn connects(&self) -> usize {
        lock(&self.state).connects
    }

    /// Every executed command as `[NAME, args...]`, oldest first.
    pub(crate) fn commands(&self) -> Vec<Vec<String>> {
        lock(&self.state).log.clone()
    }

    pub(crate) fn command_names(&self) -> Vec<String> {
        lock(&self.state)
            .log
            .iter()
            .filter_map(|c| c.first().cloned())
            .collect()
    }

    pub(crate) fn clear_log(&self) {
        lock(&self.state).log.clear();
    }

    pub(crate) fn hash(&self, key: &str) -> Option<BTreeMap<String, String>> {
        self.hash_in(0, key)
    }

    pub(crate) fn hash_in(&self, db: u32, key: &str) -> Option<BTreeMap<String, String>> {
        let state = lock(&self.state);
        match state.keyspaces.get(&db)?.values.get(key.as_bytes())? {
            Value::Hash(fields) => Some(
                fields
                    .iter()
                    .map(|(k, v)| (text(k), text(v)))
                    .collect(),
            ),
            Value::Set(_) => None,
        }
    }

    /// Set members, empty when the key does not exist.
    pub(crate) fn members(&self, key: &str) -> BTreeSet<String> {
        let state = lock(&self.state);
        match state
            .keyspaces
            .get(&0)
            .and_then(|ks| ks.values.get(key.as_bytes()))
        {
            Some(Value::Set(members)) => members.iter().map(|m| text(m)).collect(),
            _ => BTreeSet::new(),
        }
    }

    pub(crate) fn exists(&self, key: &str) -> bool {
        let state = lock(&self.state);
        state
            .keyspaces
            .get(&0)
            .is_some_and(|ks| ks.values.contains_key(key.as_bytes()))
    }

    pub(crate) fn ttl(&self, key: &str) -> Option<i64> {
        let state = lock(&self.state);
        state.keyspaces.get(&0)?.ttls.get(key.as_bytes()).copied()
    }

    /// Simulates store-driven expiry of `key`.
    pub(crate) fn expire_now(&self, key: &str) {
        let mut state = lock(&self.state);
        if let Some(ks) = state.keyspaces.get_mut(&0) {
            ks.values.remove(key.as_bytes());
            ks.ttls.remove(key.as_bytes());
        }
    }

    pub(crate) fn seed_hash(&self, key: &str, fields: &[(&str, &str)]) {
        let mut state = lock(&self.state);
        let ks = state.keyspaces.entry(0).or_default();
        ks.values.insert(
            key.as_bytes().to_vec(),
            Value::Hash(
                fields
                    .iter()
                    .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
                    .collect(),
            ),
        );
    }

    pub(crate) fn seed_set(&self, key: &str, members: &[&str]) {
        let mut state = lock(&self.state);
        let ks = state.keyspaces.entry(0).or_default();
        ks.values.insert(
            key.as_bytes().to_vec(),
            Value::Set(members.iter().map(|m| m.as_bytes().to_vec()).collect()),
        );
    }
}

struct FakeConnector {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> std::io::Result<BoxStream> {
        {
            let mut state = lock(&self.state);
            if state.down {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "fake store is down",
                ));
            }
            state.connects += 1;
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(self.state.clone(), server));
        Ok(Box::new(client))
    }

    fn describe(&self) -> String {
        "fake-store".to_string()
    }
}

async fn serve(state: Arc<Mutex<State>>, stream: DuplexStream) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut db = 0u32;

    loop {
        let Ok(request) = read_reply(&mut reader).await else {
            return;
        };
        let args: Vec<Vec<u8>> = request
            .into_array()
            .unwrap_or_default()
            .into_iter()
            .filter_map(Reply::into_bulk)
            .collect();

        let reply = {
            let mut state = lock(&state);
            if state.sever_next {
                state.sever_next = false;
                return;
            }
            if state.stalled {
                None
            } else {
                Some(state.execute(&mut db, &args))
            }
        };

        let Some(reply) = reply else {
            std::future::pending::<()>().await;
            return;
        };

        let mut buf = Vec::new();
        reply.encode_into(&mut buf);
        if writer.write_all(&buf).await.is_err() {
            return;
        }
    }
}

fn wrong_args(name: &str) -> Reply {
    Reply::Error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    ))
}

fn wrong_type() -> Reply {
    Reply::Error("WRONGTYPE Operation against a key holding the wrong kind of value".into())
}

impl State {
    fn execute(&mut self, db: &mut u32, args: &[Vec<u8>]) -> Reply {
        let Some((name, rest)) = args.split_first() else {
            return Reply::Error("ERR empty command".into());
        };
        let name = text(name).to_ascii_uppercase();
        self.log.push(
            std::iter::once(name.clone())
                .chain(rest.iter().map(|a| text(a)))
                .collect(),
        );

        match name.as_str() {
            "PING" => Reply::Status("PONG".into()),
            "SELECT" => match rest {
                [index] => match text(index).parse::<u32>() {
                    Ok(n) if n < DATABASES => {
                        *db = n;
                        Reply::Status("OK".into())
                    }
                    _ => Reply::Error("ERR DB index is out of range".into()),
                },
                _ => wrong_args(&name),
            },
            _ => self.keyspaces.entry(*db).or_default().execute(&name, rest),
        }
    }
}

impl Keyspace {
    fn remove(&mut self, key: &[u8]) -> bool {
        self.ttls.remove(key);
        self.values.remove(key).is_some()
    }

    fn hash_mut(&mut self, key: &[u8]) -> Result<&mut BTreeMap<Vec<u8>, Vec<u8>>, Reply> {
        match self
            .values
            .entry(key.to_vec())
            .or_insert_with(|| Value::Hash(BTreeMap::new()))
        {
            Value::Hash(fields) => Ok(fields),
            Value::Set(_) => Err(wrong_type()),
        }
    }

    fn set_mut(&mut self, key: &[u8]) -> Result<&mut BTreeSet<Vec<u8>>, Reply> {
        match self
            .values
            .entry(key.to_vec())
            .or_insert_with(|| Value::Set(BTreeSet::new()))
        {
            Value::Set(members) => Ok(members),
            Value::Hash(_) => Err(wrong_type()),
        }
    }

    fn hash(&self, key: &[u8]) -> Result<Option<&BTreeMap<Vec<u8>, Vec<u8>>>, Reply> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Hash(fields)) => Ok(Some(fields)),
            Some(Value::Set(_)) => Err(wrong_type()),
        }
    }

    fn set(&self, key: &[u8]) -> Result<Option<&BTreeSet<Vec<u8>>>, Reply> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Set(members)) => Ok(Some(members)),
            Some(Value::Hash(_)) => Err(wrong_type()),
        }
    }

    fn execute(&mut self, name: &str, args: &[Vec<u8>]) -> Reply {
        match self.dispatch(name, args) {
            Ok(reply) | Err(reply) => reply,
        }
    }

    fn dispatch(&mut self, name: &str, args: &[Vec<u8>]) -> Result<Reply, Reply> {
        match (name, args) {
            ("HSET", [key, pairs @ ..]) if !pairs.is_empty() && pairs.len() % 2 == 0 => {
                let fields = self.hash_mut(key)?;
                let added = pairs
                    .chunks(2)
                    .filter(|pair| fields.insert(pair[0].clone(), pair[1].clone()).is_none())
                    .count();
                Ok(Reply::Integer(added as i64))
            }
            ("HSETNX", [key, field, value]) => {
                let fields = self.hash_mut(key)?;
                if fields.contains_key(field) {
                    Ok(Reply::Integer(0))
                } else {
                    fields.insert(field.clone(), value.clone());
                    Ok(Reply::Integer(1))
                }
            }
            ("HGET", [key, field]) => Ok(Reply::Bulk(
                self.hash(key)?.and_then(|fields| fields.get(field).cloned()),
            )),
            ("HGETALL", [key]) => {
                let items = self
                    .hash(key)?
                    .map(|fields| {
                        fields
                            .iter()
                            .flat_map(|(k, v)| {
                                [Reply::Bulk(Some(k.clone())), Reply::Bulk(Some(v.clone()))]
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Reply::Array(Some(items)))
            }
            ("DEL", keys) if !keys.is_empty() => {
                let removed = keys.iter().filter(|key| self.remove(key)).count();
                Ok(Reply::Integer(removed as i64))
            }
            ("EXISTS", keys) if !keys.is_empty() => {
                let found = keys
                    .iter()
                    .filter(|key| self.values.contains_key(key.as_slice()))
                    .count();
                Ok(Reply::Integer(found as i64))
            }
            ("EXPIRE", [key, seconds]) => {
                let Ok(seconds) = text(seconds).parse::<i64>() else {
                    return Err(Reply::Error(
                        "ERR value is not an integer or out of range".into(),
                    ));
                };
                if !self.values.contains_key(key.as_slice()) {
                    return Ok(Reply::Integer(0));
                }
                if seconds <= 0 {
                    self.remove(key);
                } else {
                    self.ttls.insert(key.clone(), seconds);
                }
                Ok(Reply::Integer(1))
            }
            ("TTL", [key]) => Ok(Reply::Integer(if !self.values.contains_key(key.as_slice()) {
                -2
            } else {
                self.ttls.get(key.as_slice()).copied().unwrap_or(-1)
            })),
            ("SADD", [key, members @ ..]) if !members.is_empty() => {
                let set = self.set_mut(key)?;
                let added = members
                    .iter()
                    .filter(|member| set.insert((*member).clone()))
                    .count();
                Ok(Reply::Integer(added as i64))
            }
            ("SREM", [key, members @ ..]) if !members.is_empty() => {
                let Some(existing) = self.set(key)? else {
                    return Ok(Reply::Integer(0));
                };
                let removed = members.iter().filter(|m| existing.contains(*m)).count();
                let set = self.set_mut(key)?;
                for member in members {
                    set.remove(member);
                }
                if set.is_empty() {
                    self.remove(key);
                }
                Ok(Reply::Integer(removed as i64))
            }
            ("SCARD", [key]) => Ok(Reply::Integer(
                self.set(key)?.map_or(0, |members| members.len() as i64),
            )),
            ("SISMEMBER", [key, member]) => Ok(Reply::Integer(i64::from(
                self.set(key)?.is_some_and(|members| members.contains(member)),
            ))),
            ("SMEMBERS", [key]) => Ok(Reply::Array(Some(
                self.set(key)?
                    .map(|members| {
                        members
                            .iter()
                            .map(|m| Reply::Bulk(Some(m.clone())))
                            .collect()
                    })
                    .unwrap_or_default(),
            ))),
            (
                "HSET" | "HSETNX" | "HGET" | "HGETALL" | "DEL" | "EXISTS" | "EXPIRE" | "TTL"
                | "SADD" | "SREM" | "SCARD" | "SISMEMBER" | "SMEMBERS",
                _,
            ) => Err(wrong_args(name)),
            _ => Err(Reply::Error(format!(
                "ERR unknown command '{}'",
                name.to_ascii_lowercase()
            ))),
        }
    }
}
