//! Session record stored as a hash under `session:{nas}:{session_id}`.

use crate::tracker::event::{AccountingEvent, EventKind, SessionTarget};
use serde::Serialize;
use std::collections::HashMap;

pub const FIELD_USERNAME: &str = "username";
pub const FIELD_NAS_IP: &str = "nas_ip";
pub const FIELD_FRAMED_IP: &str = "framed_ip";
pub const FIELD_CALLED_STATION_ID: &str = "called_station_id";
pub const FIELD_CALLING_STATION_ID: &str = "calling_station_id";
pub const FIELD_NAS_PORT: &str = "nas_port";
pub const FIELD_SESSION_TIME: &str = "session_time";
pub const FIELD_INPUT_OCTETS: &str = "input_octets";
pub const FIELD_OUTPUT_OCTETS: &str = "output_octets";
pub const FIELD_START_TIME: &str = "start_time";
pub const FIELD_UPDATE_TIME: &str = "update_time";
pub const FIELD_LAST_EVENT: &str = "last_event";

/// A live session as held in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    /// `Acct-Session-Id`, unique per NAS.
    pub session_id: String,
    /// Owning subject (`User-Name`).
    pub username: String,
    /// Address of the NAS terminating the session.
    pub nas_ip: String,
    /// Address assigned to the subject; empty when not reported.
    pub framed_ip: String,
    /// Usually the NAS port or access point identifier.
    pub called_station_id: String,
    /// Usually the subscriber's MAC address or phone number.
    pub calling_station_id: String,
    /// Physical or virtual port on the NAS.
    pub nas_port: u32,
    /// Seconds online as last reported by the NAS.
    pub session_time: u32,
    /// Octets received from the subject, gigaword rollovers included.
    pub input_octets: u64,
    /// Octets sent to the subject, gigaword rollovers included.
    pub output_octets: u64,
    /// Unix seconds.
    pub start_time: i64,
    /// Unix seconds.
    pub update_time: i64,
    /// Status type of the last event applied (`start` or `interim-update`).
    pub last_event: String,
}

impl SessionRecord {
    /// Record for `event` observed at `now`.
    ///
    /// A START always carries zeroed counters. Other kinds take the event's
    /// counters, with the start time back-dated by the reported session time.
    pub fn from_event(target: SessionTarget<'_>, event: &AccountingEvent, now: i64) -> Self {
        let started = event.kind == EventKind::Start;
        let session_time = if started {
            0
        } else {
            event.session_time.unwrap_or(0)
        };

        Self {
            session_id: target.session_id.to_string(),
            username: target.username.to_string(),
            nas_ip: target.nas_ip.to_string(),
            framed_ip: event.framed_ip.clone().unwrap_or_default(),
            called_station_id: event.called_station_id.clone().unwrap_or_default(),
            calling_station_id: event.calling_station_id.clone().unwrap_or_default(),
            nas_port: event.nas_port.unwrap_or(0),
            session_time,
            input_octets: if started { 0 } else { event.input_total() },
            output_octets: if started { 0 } else { event.output_total() },
            start_time: now - i64::from(session_time),
            update_time: now,
            last_event: event.kind.as_str().to_string(),
        }
    }

    /// Hash fields, excluding `start_time`.
    ///
    /// The start time is written separately so that updates can leave an
    /// existing value alone.
    pub fn mutable_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (FIELD_USERNAME, self.username.clone()),
            (FIELD_NAS_IP, self.nas_ip.clone()),
            (FIELD_FRAMED_IP, self.framed_ip.clone()),
            (FIELD_CALLED_STATION_ID, self.called_station_id.clone()),
            (FIELD_CALLING_STATION_ID, self.calling_station_id.clone()),
            (FIELD_NAS_PORT, self.nas_port.to_string()),
            (FIELD_SESSION_TIME, self.session_time.to_string()),
            (FIELD_INPUT_OCTETS, self.input_octets.to_string()),
            (FIELD_OUTPUT_OCTETS, self.output_octets.to_string()),
            (FIELD_UPDATE_TIME, self.update_time.to_string()),
            (FIELD_LAST_EVENT, self.last_event.clone()),
        ]
    }

    /// Rebuilds a record from a hash read back from the store.
    ///
    /// Returns `None` for an empty hash (the key does not exist). Missing or
    /// malformed numeric fields read as zero.
    pub fn from_hash(session_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }

        let text = |name: &str| fields.get(name).cloned().unwrap_or_default();
        fn number<T: std::str::FromStr + Default>(fields: &HashMap<String, String>, name: &str) -> T {
            fields
                .get(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default()
        }

        Some(Self {
            session_id: session_id.to_string(),
            username: text(FIELD_USERNAME),
            nas_ip: text(FIELD_NAS_IP),
            framed_ip: text(FIELD_FRAMED_IP),
            called_station_id: text(FIELD_CALLED_STATION_ID),
            calling_station_id: text(FIELD_CALLING_STATION_ID),
            nas_port: number(fields, FIELD_NAS_PORT),
            session_time: number(fields, FIELD_SESSION_TIME),
            input_octets: number(fields, FIELD_INPUT_OCTETS),
            output_octets: number(fields, FIELD_OUTPUT_OCTETS),
            start_time: number(fields, FIELD_START_TIME),
            update_time: number(fields, FIELD_UPDATE_TIME),
            last_event: text(FIELD_LAST_EVENT),
        })
    }
}

/// Session id portion of a `session:{nas}:{session_id}` key.
///
/// NAS addresses may be IPv6 and contain colons, so the NAS prefix is taken
/// from the record's own field when available.
pub fn session_id_from_key(key: &str, nas_ip: &str) -> Option<String> {
    let prefix = format!("session:{}:", nas_ip);
    key.strip_prefix(prefix.as_str()).map(str::to_string)
}
