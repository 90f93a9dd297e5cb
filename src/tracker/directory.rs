//! Read side of the session directory, plus the subject retirement step
//! shared by STOP, bulk-clear and reconciliation.

use crate::store::{Command, Reply, StoreClient, StoreResult};
use crate::tracker::keys::{nas_sessions_key, session_key, user_sessions_key, ONLINE_USERS};
use crate::tracker::record::{session_id_from_key, SessionRecord, FIELD_NAS_IP};
use std::collections::HashMap;
use std::sync::Arc;

/// Prunes expired members from `username`'s index, then removes the subject
/// from the online directory and deletes the index once nothing live is left.
///
/// Returns true if the subject was retired. An unreadable index, or an error
/// reply to any existence check, leaves the subject online.
pub(crate) async fn retire_if_idle(store: &StoreClient, username: &str) -> StoreResult<bool> {
    let index = user_sessions_key(username);
    let Some(keys) = store
        .value(Command::new("SMEMBERS").arg(&index))
        .await?
        .map(Reply::into_strings)
    else {
        return Ok(false);
    };

    let checks: Vec<Command> = keys
        .iter()
        .map(|key| Command::new("EXISTS").arg(key))
        .collect();
    let found = store.pipeline_values(&checks).await?;
    let stale: Vec<&String> = keys
        .iter()
        .zip(&found)
        .filter(|(_, reply)| matches!(reply, Some(Reply::Integer(0))))
        .map(|(key, _)| key)
        .collect();
    let live = keys.len() - stale.len();

    if !stale.is_empty() {
        tracing::info!(
            username,
            stale = stale.len(),
            "pruning expired sessions from subject index"
        );
        store
            .value(Command::new("SREM").arg(&index).args(stale))
            .await?;
    }

    if live > 0 {
        return Ok(false);
    }

    store
        .pipeline_values(&[
            Command::new("SREM").arg(ONLINE_USERS).arg(username),
            Command::new("DEL").arg(&index),
        ])
        .await?;
    tracing::info!(username, "subject has no live sessions, marked offline");
    Ok(true)
}

async fn members(store: &StoreClient, key: &str) -> StoreResult<Vec<String>> {
    let mut members = store
        .value(Command::new("SMEMBERS").arg(key))
        .await?
        .map(Reply::into_strings)
        .unwrap_or_default();
    members.sort();
    Ok(members)
}

fn field_map(reply: Option<Reply>) -> HashMap<String, String> {
    reply
        .map(Reply::into_strings)
        .unwrap_or_default()
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

fn decode(key: &str, reply: Option<Reply>) -> Option<SessionRecord> {
    let fields = field_map(reply);
    let nas_ip = fields.get(FIELD_NAS_IP).map(String::as_str).unwrap_or_default();
    let session_id = session_id_from_key(key, nas_ip).unwrap_or_else(|| key.to_string());
    SessionRecord::from_hash(&session_id, &fields)
}

/// Queries over the store-resident session state.
#[derive(Clone)]
pub struct SessionDirectory {
    store: Arc<StoreClient>,
}

impl SessionDirectory {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    /// Subjects with at least one live session, sorted.
    pub async fn online_subjects(&self) -> StoreResult<Vec<String>> {
        members(&self.store, ONLINE_USERS).await
    }

    pub async fn session(&self, nas_ip: &str, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        let reply = self
            .store
            .value(Command::new("HGETALL").arg(session_key(nas_ip, session_id)))
            .await?;
        Ok(SessionRecord::from_hash(session_id, &field_map(reply)))
    }

    /// Live sessions of `username`. Index members whose record has expired
    /// are skipped.
    pub async fn sessions_for_subject(&self, username: &str) -> StoreResult<Vec<SessionRecord>> {
        self.sessions_in(&user_sessions_key(username)).await
    }

    /// Live sessions terminating on `nas_ip`.
    pub async fn sessions_for_nas(&self, nas_ip: &str) -> StoreResult<Vec<SessionRecord>> {
        self.sessions_in(&nas_sessions_key(nas_ip)).await
    }

    async fn sessions_in(&self, index: &str) -> StoreResult<Vec<SessionRecord>> {
        let keys = members(&self.store, index).await?;
        let reads: Vec<Command> = keys
            .iter()
            .map(|key| Command::new("HGETALL").arg(key))
            .collect();
        let replies = self.store.pipeline_values(&reads).await?;

        Ok(keys
            .iter()
            .zip(replies)
            .filter_map(|(key, reply)| decode(key, reply))
            .collect())
    }

    /// Prunes expired members from every online subject's index and retires
    /// subjects left with nothing live.
    ///
    /// Returns the retired subjects. Intended for operators after a store
    /// outage; nothing schedules it.
    pub async fn reconcile_online_directory(&self) -> StoreResult<Vec<String>> {
        let mut retired = Vec::new();
        for subject in self.online_subjects().await? {
            if retire_if_idle(&self.store, &subject).await? {
                retired.push(subject);
            }
        }
        Ok(retired)
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
