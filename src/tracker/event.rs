//! Normalized accounting events as emitted by the host pipeline.

use serde::{Deserialize, Deserializer, Serialize};

/// Accounting status type (RADIUS `Acct-Status-Type`).
///
/// Deserializes from the attribute name (case-insensitive) or its numeric
/// code. Anything unrecognized becomes [`EventKind::Unknown`] and is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "RawEventKind")]
pub enum EventKind {
    #[serde(rename = "Start")]
    Start,
    #[serde(rename = "Interim-Update")]
    InterimUpdate,
    #[serde(rename = "Stop")]
    Stop,
    #[serde(rename = "Accounting-On")]
    AccountingOn,
    #[serde(rename = "Accounting-Off")]
    AccountingOff,
    #[default]
    Unknown,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEventKind {
    Code(u32),
    Name(String),
}

impl From<RawEventKind> for EventKind {
    fn from(raw: RawEventKind) -> Self {
        match raw {
            RawEventKind::Code(1) => EventKind::Start,
            RawEventKind::Code(2) => EventKind::Stop,
            RawEventKind::Code(3) => EventKind::InterimUpdate,
            RawEventKind::Code(7) => EventKind::AccountingOn,
            RawEventKind::Code(8) => EventKind::AccountingOff,
            RawEventKind::Code(_) => EventKind::Unknown,
            RawEventKind::Name(name) => match name.trim().parse::<u32>() {
                Ok(code) => EventKind::from(RawEventKind::Code(code)),
                Err(_) => match name.trim().to_ascii_lowercase().as_str() {
                    "start" => EventKind::Start,
                    "stop" => EventKind::Stop,
                    "interim-update" | "interim" | "alive" => EventKind::InterimUpdate,
                    "accounting-on" => EventKind::AccountingOn,
                    "accounting-off" => EventKind::AccountingOff,
                    _ => EventKind::Unknown,
                },
            },
        }
    }
}

impl EventKind {
    /// Value stored in a record's `last_event` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::InterimUpdate => "interim-update",
            EventKind::Stop => "stop",
            EventKind::AccountingOn => "accounting-on",
            EventKind::AccountingOff => "accounting-off",
            EventKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accounting event, keyed by RADIUS attribute names.
///
/// ```
/// use session_tracker::tracker::{AccountingEvent, EventKind};
///
/// let event: AccountingEvent = serde_json::from_str(
///     r#"{"Acct-Status-Type": "Interim-Update", "Acct-Session-Id": "s1",
///         "User-Name": "alice", "NAS-IP-Address": "10.0.0.1",
///         "Acct-Input-Octets": "10", "Acct-Input-Gigawords": 1}"#,
/// )
/// .unwrap();
///
/// assert_eq!(event.kind, EventKind::InterimUpdate);
/// assert_eq!(event.nas_ip.as_deref(), Some("10.0.0.1"));
/// assert_eq!(event.input_total(), (1 << 32) + 10);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingEvent {
    /// What happened: session start, update, stop, or a NAS reset.
    #[serde(rename = "Acct-Status-Type", default)]
    pub kind: EventKind,
    /// Session identifier assigned by the NAS.
    #[serde(rename = "Acct-Session-Id", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The authenticated subject.
    #[serde(rename = "User-Name", default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Address of the reporting NAS, IPv4 or IPv6.
    #[serde(rename = "NAS-IP-Address", default, skip_serializing_if = "Option::is_none")]
    pub nas_ip: Option<String>,
    /// Address assigned to the subject.
    #[serde(rename = "Framed-IP-Address", default, skip_serializing_if = "Option::is_none")]
    pub framed_ip: Option<String>,
    /// Identifier of the port or access point called.
    #[serde(rename = "Called-Station-Id", default, skip_serializing_if = "Option::is_none")]
    pub called_station_id: Option<String>,
    /// Identifier of the calling subscriber device.
    #[serde(rename = "Calling-Station-Id", default, skip_serializing_if = "Option::is_none")]
    pub calling_station_id: Option<String>,
    /// Port on the NAS.
    #[serde(
        rename = "NAS-Port",
        default,
        deserialize_with = "lenient_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub nas_port: Option<u32>,
    /// Seconds the session has been up.
    #[serde(
        rename = "Acct-Session-Time",
        default,
        deserialize_with = "lenient_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub session_time: Option<u32>,
    /// Low 32 bits of the octets received from the subject.
    #[serde(
        rename = "Acct-Input-Octets",
        default,
        deserialize_with = "lenient_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_octets: Option<u32>,
    /// Low 32 bits of the octets sent to the subject.
    #[serde(
        rename = "Acct-Output-Octets",
        default,
        deserialize_with = "lenient_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub output_octets: Option<u32>,
    /// Times `input_octets` has wrapped past 2^32.
    #[serde(
        rename = "Acct-Input-Gigawords",
        default,
        deserialize_with = "lenient_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_gigawords: Option<u32>,
    /// Times `output_octets` has wrapped past 2^32.
    #[serde(
        rename = "Acct-Output-Gigawords",
        default,
        deserialize_with = "lenient_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub output_gigawords: Option<u32>,
    /// Seconds between INTERIM-UPDATEs promised by the NAS.
    #[serde(
        rename = "Acct-Interim-Interval",
        default,
        deserialize_with = "lenient_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub interim_interval: Option<u32>,
    /// Why a STOP ended the session.
    #[serde(rename = "Acct-Terminate-Cause", default, skip_serializing_if = "Option::is_none")]
    pub terminate_cause: Option<String>,
}

/// Identity of one session: where it terminates, its id, and its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTarget<'a> {
    pub nas_ip: &'a str,
    pub session_id: &'a str,
    pub username: &'a str,
}

/// Accepts a number or a numeric string; blank strings read as absent.
fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Raw::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Rebuilds a 64-bit counter from its low word and rollover count.
pub fn counter64(low: u32, rollovers: u32) -> u64 {
    (u64::from(rollovers) << 32) + u64::from(low)
}

impl AccountingEvent {
    /// Event for one session, all counters absent.
    pub fn session(kind: EventKind, session_id: &str, username: &str, nas_ip: &str) -> Self {
        Self {
            kind,
            session_id: Some(session_id.to_string()),
            username: Some(username.to_string()),
            nas_ip: Some(nas_ip.to_string()),
            ..Self::default()
        }
    }

    /// NAS address, if present and non-blank.
    pub fn nas(&self) -> Option<&str> {
        present(&self.nas_ip)
    }

    /// Session identity, or `None` when any of NAS address, session id or
    /// username is missing or blank.
    pub fn target(&self) -> Option<SessionTarget<'_>> {
        Some(SessionTarget {
            nas_ip: self.nas()?,
            session_id: present(&self.session_id)?,
            username: present(&self.username)?,
        })
    }

    pub fn input_total(&self) -> u64 {
        counter64(
            self.input_octets.unwrap_or(0),
            self.input_gigawords.unwrap_or(0),
        )
    }

    pub fn output_total(&self) -> u64 {
        counter64(
            self.output_octets.unwrap_or(0),
            self.output_gigawords.unwrap_or(0),
        )
    }
}

#[cfg(test)]
#[path = "tests/event_tests.rs"]
mod tests;
