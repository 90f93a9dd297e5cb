//! Key layout of the session directory.
//!
//! Admin tooling reads these keys directly, so the layout is part of the
//! external interface:
//!
//! - `session:{nas}:{session_id}` hash, one per live session
//! - `user:sessions:{username}` set of session keys
//! - `nas:sessions:{nas}` set of session keys
//! - `online:users` set of usernames with at least one live session

pub const ONLINE_USERS: &str = "online:users";

pub fn session_key(nas_ip: &str, session_id: &str) -> String {
    format!("session:{}:{}", nas_ip, session_id)
}

pub fn user_sessions_key(username: &str) -> String {
    format!("user:sessions:{}", username)
}

pub fn nas_sessions_key(nas_ip: &str) -> String {
    format!("nas:sessions:{}", nas_ip)
}
