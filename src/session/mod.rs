//! # Session Store
//!
//! Cookie-backed sessions composed from the shared cache and the map
//! batcher. A session is an opaque 20-byte ID plus a typed key/value map;
//! every mutation pushes the session ID onto a persistence channel, and the
//! batcher later writes sessions carrying the persistent flag to the store's
//! generic cache table. Sessions without the flag never touch the database;
//! they live only in the in-process cache, so across nodes sessions are
//! eventually consistent via the shared DB row.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::StoreError;

pub mod cookie;
pub mod store;

pub use cookie::CookieConfig;
pub use store::{SessionStore, SessionStoreConfig};

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// No such session in cache or store.
    #[error("session not found")]
    NotFound,

    /// The persisted session blob could not be decoded.
    #[error("session codec error: {0}")]
    Codec(String),

    /// The persistence queue is shut down.
    #[error("session persistence queue is closed")]
    QueueClosed,

    /// An underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Closed set of session map keys.
///
/// The explicit discriminants are the wire form of the binary codec; add new
/// keys at the end and never renumber existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum SessionKey {
    UserId = 1,
    Email = 2,
    OrgId = 3,
    CsrfToken = 4,
    Flash = 5,
    LoginAt = 6,
    Impersonator = 7,
}

impl SessionKey {
    fn from_wire(value: u16) -> Option<Self> {
        match value {
            1 => Some(SessionKey::UserId),
            2 => Some(SessionKey::Email),
            3 => Some(SessionKey::OrgId),
            4 => Some(SessionKey::CsrfToken),
            5 => Some(SessionKey::Flash),
            6 => Some(SessionKey::LoginAt),
            7 => Some(SessionKey::Impersonator),
            _ => None,
        }
    }
}

/// Values a session map can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum SessionValue {
    Text(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    Time(DateTime<Utc>),
}

/// Serialized shape of a session; keys travel as their discriminants.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    values: Vec<(u16, SessionValue)>,
    last_access: DateTime<Utc>,
    persistent: bool,
}

/// One live session.
///
/// The key map is guarded by a per-session mutex, so concurrent requests on
/// the same session serialise their accesses.
pub struct Session {
    id: String,
    values: Mutex<HashMap<SessionKey, SessionValue>>,
    last_access: Mutex<DateTime<Utc>>,
    persistent: std::sync::atomic::AtomicBool,
}

impl Session {
    /// A fresh, empty, non-persistent session.
    pub fn new(id: String) -> Self {
        Self {
            id,
            values: Mutex::new(HashMap::new()),
            last_access: Mutex::new(Utc::now()),
            persistent: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// The opaque session ID in its text form.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Read a value.
    pub fn value(&self, key: SessionKey) -> Option<SessionValue> {
        self.values.lock().get(&key).cloned()
    }

    /// Write a value.
    pub fn put(&self, key: SessionKey, value: SessionValue) {
        self.values.lock().insert(key, value);
    }

    /// Remove a value.
    pub fn remove(&self, key: SessionKey) {
        self.values.lock().remove(&key);
    }

    /// Update the last-access timestamp.
    pub fn touch(&self) {
        *self.last_access.lock() = Utc::now();
    }

    /// The last-access timestamp.
    pub fn last_access(&self) -> DateTime<Utc> {
        *self.last_access.lock()
    }

    /// Mark the session for database persistence.
    pub fn set_persistent(&self, persistent: bool) {
        self.persistent
            .store(persistent, std::sync::atomic::Ordering::SeqCst);
    }

    /// Whether the session is persisted to the database.
    pub fn persistent(&self) -> bool {
        self.persistent.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Encode for the store's cache table.
    pub fn encode(&self) -> SessionResult<Vec<u8>> {
        let mut values: Vec<(u16, SessionValue)> = self
            .values
            .lock()
            .iter()
            .map(|(k, v)| (*k as u16, v.clone()))
            .collect();
        values.sort_by_key(|(k, _)| *k);
        let snapshot = Snapshot {
            values,
            last_access: self.last_access(),
            persistent: self.persistent(),
        };
        bincode::serialize(&snapshot).map_err(|e| SessionError::Codec(e.to_string()))
    }

    /// Decode a session persisted under `id`. Keys from a newer schema are
    /// skipped rather than failing the whole session.
    pub fn decode(id: String, bytes: &[u8]) -> SessionResult<Self> {
        let snapshot: Snapshot =
            bincode::deserialize(bytes).map_err(|e| SessionError::Codec(e.to_string()))?;
        let mut values = HashMap::new();
        for (wire, value) in snapshot.values {
            match SessionKey::from_wire(wire) {
                Some(key) => {
                    values.insert(key, value);
                }
                None => log::debug!("session {}: skipping unknown key {}", id, wire),
            }
        }
        Ok(Self {
            id,
            values: Mutex::new(values),
            last_access: Mutex::new(snapshot.last_access),
            persistent: std::sync::atomic::AtomicBool::new(snapshot.persistent),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_round_trip() {
        let session = Session::new("sid-1".to_string());
        session.put(SessionKey::UserId, SessionValue::Int(7));
        session.put(SessionKey::Email, SessionValue::Text("a@b.c".into()));
        session.put(SessionKey::LoginAt, SessionValue::Time(Utc::now()));
        session.set_persistent(true);

        let bytes = session.encode().unwrap();
        let decoded = Session::decode("sid-1".to_string(), &bytes).unwrap();

        assert_eq!(decoded.value(SessionKey::UserId), Some(SessionValue::Int(7)));
        assert_eq!(
            decoded.value(SessionKey::Email),
            Some(SessionValue::Text("a@b.c".into()))
        );
        assert!(decoded.persistent());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a = Session::new("s".to_string());
        let b = Session::new("s".to_string());
        for s in [&a, &b] {
            s.put(SessionKey::UserId, SessionValue::Int(1));
            s.put(SessionKey::OrgId, SessionValue::Int(2));
            s.put(SessionKey::CsrfToken, SessionValue::Text("t".into()));
        }
        let ts = Utc::now();
        *a.last_access.lock() = ts;
        *b.last_access.lock() = ts;

        // Key order in the map must not leak into the wire form.
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            Session::decode("s".to_string(), b"not-bincode"),
            Err(SessionError::Codec(_))
        ));
    }
}
