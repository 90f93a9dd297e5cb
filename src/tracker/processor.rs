//! Accounting event processor.
//!
//! Each event maps to a fixed sequence of store batches. Nothing here returns
//! an error to the caller: a store failure is logged and reported as
//! [`Outcome::Unavailable`], and the state heals on the next START or
//! INTERIM-UPDATE for the session.

use crate::config::TtlPolicy;
use crate::store::{Command, Reply, StoreClient, StoreResult};
use crate::tracker::directory::retire_if_idle;
use crate::tracker::event::{AccountingEvent, EventKind, SessionTarget};
use crate::tracker::keys::{nas_sessions_key, session_key, user_sessions_key, ONLINE_USERS};
use crate::tracker::record::{SessionRecord, FIELD_START_TIME, FIELD_USERNAME};
use std::sync::Arc;

/// What handling an event did to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every batch for the event was sent and answered.
    Applied,
    /// The event was malformed or of a kind the tracker does not act on.
    Ignored,
    /// The store could not be reached or failed mid-event.
    Unavailable,
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Applies accounting events to the session directory.
pub struct SessionTracker {
    store: Arc<StoreClient>,
    ttl: TtlPolicy,
    clock: fn() -> i64,
}

impl SessionTracker {
    pub fn new(store: Arc<StoreClient>, ttl: TtlPolicy) -> Self {
        Self {
            store,
            ttl,
            clock: unix_now,
        }
    }

    /// Replaces the wall clock (unix seconds) used for record timestamps.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub async fn handle(&self, event: &AccountingEvent) -> Outcome {
        let result = match event.kind {
            EventKind::Start | EventKind::InterimUpdate | EventKind::Stop => {
                let Some(target) = event.target() else {
                    tracing::debug!(
                        kind = %event.kind,
                        session_id = ?event.session_id,
                        username = ?event.username,
                        nas_ip = ?event.nas_ip,
                        "ignoring accounting event without session id, username or NAS address"
                    );
                    return Outcome::Ignored;
                };
                if event.kind == EventKind::Stop {
                    self.stop(target, event).await
                } else {
                    self.upsert(target, event).await
                }
            }
            EventKind::AccountingOn | EventKind::AccountingOff => {
                let Some(nas_ip) = event.nas() else {
                    tracing::debug!(kind = %event.kind, "ignoring NAS reset without NAS address");
                    return Outcome::Ignored;
                };
                self.clear_nas(nas_ip, event.kind).await
            }
            EventKind::Unknown => {
                tracing::debug!(session_id = ?event.session_id, "ignoring accounting event of unknown type");
                return Outcome::Ignored;
            }
        };

        match result {
            Ok(()) => Outcome::Applied,
            Err(e) => {
                tracing::warn!(
                    kind = %event.kind,
                    session_id = ?event.session_id,
                    error = %e,
                    "session tracking not updated"
                );
                Outcome::Unavailable
            }
        }
    }

    /// START and INTERIM-UPDATE: write the record, refresh its TTL and add it
    /// to every index, in one batch.
    async fn upsert(&self, target: SessionTarget<'_>, event: &AccountingEvent) -> StoreResult<()> {
        let record = SessionRecord::from_event(target, event, (self.clock)());
        let key = session_key(target.nas_ip, target.session_id);
        let ttl = self.ttl.session_ttl(event.interim_interval.unwrap_or(0));
        let user_index = user_sessions_key(target.username);
        let nas_index = nas_sessions_key(target.nas_ip);
        // An index must outlive every record it lists.
        let index_ttl = ttl.max(self.ttl.max_ttl);

        let mut write = Command::new("HSET").arg(&key);
        for (field, value) in record.mutable_fields() {
            write = write.arg(field).arg(value);
        }
        // Updates keep the start time of a record they did not create.
        let start_time = if event.kind == EventKind::Start {
            "HSET"
        } else {
            "HSETNX"
        };

        self.store
            .pipeline_values(&[
                write,
                Command::new(start_time)
                    .arg(&key)
                    .arg(FIELD_START_TIME)
                    .arg(record.start_time),
                Command::new("EXPIRE").arg(&key).arg(ttl),
                Command::new("SADD").arg(&user_index).arg(&key),
                Command::new("SADD").arg(&nas_index).arg(&key),
                Command::new("SADD").arg(ONLINE_USERS).arg(target.username),
                Command::new("EXPIRE").arg(&user_index).arg(index_ttl),
                Command::new("EXPIRE").arg(&nas_index).arg(index_ttl),
            ])
            .await?;

        if event.kind == EventKind::Start {
            tracing::info!(
                session_id = target.session_id,
                username = target.username,
                nas_ip = target.nas_ip,
                ttl,
                "session started"
            );
        } else {
            tracing::debug!(
                session_id = target.session_id,
                username = target.username,
                input_octets = record.input_octets,
                output_octets = record.output_octets,
                ttl,
                "session updated"
            );
        }
        Ok(())
    }

    /// STOP: remove the record from the store and both indices, then retire
    /// the subject if that was its last session.
    async fn stop(&self, target: SessionTarget<'_>, event: &AccountingEvent) -> StoreResult<()> {
        let key = session_key(target.nas_ip, target.session_id);

        self.store
            .pipeline_values(&[
                Command::new("DEL").arg(&key),
                Command::new("SREM")
                    .arg(user_sessions_key(target.username))
                    .arg(&key),
                Command::new("SREM")
                    .arg(nas_sessions_key(target.nas_ip))
                    .arg(&key),
            ])
            .await?;

        tracing::info!(
            session_id = target.session_id,
            username = target.username,
            nas_ip = target.nas_ip,
            session_time = ?event.session_time,
            terminate_cause = event.terminate_cause.as_deref().unwrap_or("unspecified"),
            "session stopped"
        );

        retire_if_idle(&self.store, target.username).await?;
        Ok(())
    }

    /// Accounting-On/Off: the NAS lost every session it had.
    ///
    /// Each record's owner has to be read before its index can be updated,
    /// so this walks the NAS index one session at a time. Records that have
    /// already expired no longer name their owner; they are pulled from
    /// whichever online subject still lists them.
    async fn clear_nas(&self, nas_ip: &str, kind: EventKind) -> StoreResult<()> {
        let nas_index = nas_sessions_key(nas_ip);
        let keys = self
            .store
            .value(Command::new("SMEMBERS").arg(&nas_index))
            .await?
            .map(Reply::into_strings)
            .unwrap_or_default();

        let mut cleared = 0usize;
        let mut orphans = Vec::new();
        for key in &keys {
            let owner = self
                .store
                .value(Command::new("HGET").arg(key).arg(FIELD_USERNAME))
                .await?
                .and_then(Reply::into_string);
            let Some(username) = owner else {
                tracing::debug!(key = %key, "session already expired, owner unknown");
                orphans.push(key);
                continue;
            };

            self.store
                .pipeline_values(&[
                    Command::new("DEL").arg(key),
                    Command::new("SREM")
                        .arg(user_sessions_key(&username))
                        .arg(key),
                ])
                .await?;
            retire_if_idle(&self.store, &username).await?;
            cleared += 1;
        }

        let orphaned = orphans.len();
        if !orphans.is_empty() {
            self.release_orphans(&orphans).await?;
        }

        self.store.value(Command::new("DEL").arg(&nas_index)).await?;
        tracing::info!(nas_ip, %kind, cleared, orphaned, indexed = keys.len(), "cleared sessions for NAS");
        Ok(())
    }

    /// Removes expired session keys from every online subject's index and
    /// retires the subjects that listed them.
    async fn release_orphans(&self, orphans: &[&String]) -> StoreResult<()> {
        let subjects = self
            .store
            .value(Command::new("SMEMBERS").arg(ONLINE_USERS))
            .await?
            .map(Reply::into_strings)
            .unwrap_or_default();

        let removals: Vec<Command> = subjects
            .iter()
            .map(|subject| {
                Command::new("SREM")
                    .arg(user_sessions_key(subject))
                    .args(orphans.iter().copied())
            })
            .collect();
        let removed = self.store.pipeline_values(&removals).await?;

        for (subject, reply) in subjects.iter().zip(removed) {
            if matches!(reply, Some(Reply::Integer(n)) if n > 0) {
                retire_if_idle(&self.store, subject).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/processor_tests.rs"]
mod tests;
