//! Object store seam.
//!
//! The orchestrator treats the information model as a key/value store keyed by
//! distinguished name plus attribute name. Entities read their attribute set
//! on recovery and write back one attribute per state-affecting mutation.
//!
//! Executors may also attach a session to an object: runtime-attribute
//! refresh requests for that DN are then delivered to the session's sink,
//! which forwards them into the executor mailbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, SmfError};

// ---------------------------------------------------------------------------
// AttrValue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    Str(String),
    Uint(u64),
    Time(DateTime<Utc>),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttrValue::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            AttrValue::Time(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::Uint(v)
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::Uint(v as u64)
    }
}

impl From<DateTime<Utc>> for AttrValue {
    fn from(t: DateTime<Utc>) -> Self {
        AttrValue::Time(t)
    }
}

pub type Attributes = BTreeMap<String, AttrValue>;

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StoreCallback {
    /// A reader wants a fresh value of a runtime attribute owned by the session.
    RuntimeUpdate { dn: String, attribute: String },
}

pub type CallbackSink = Box<dyn Fn(StoreCallback) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

/// Attached sessions, shared by every store implementation.
#[derive(Default)]
pub struct SessionRegistry {
    next: AtomicU64,
    sessions: Mutex<HashMap<SessionId, (String, Arc<CallbackSink>)>>,
}

impl SessionRegistry {
    pub fn attach(&self, dn: &str, sink: CallbackSink) -> SessionId {
        let id = SessionId(self.next.fetch_add(1, Ordering::Relaxed));
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(id, (dn.to_string(), Arc::new(sink)));
        id
    }

    pub fn detach(&self, id: SessionId) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(&id);
    }

    /// Deliver a callback to every session attached to `dn`.
    /// Returns true if at least one session received it.
    pub fn dispatch(&self, dn: &str, callback: StoreCallback) -> bool {
        // Sinks are called outside the lock so a sink may attach or detach.
        let sinks: Vec<Arc<CallbackSink>> = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions
                .values()
                .filter(|(owner, _)| owner == dn)
                .map(|(_, sink)| sink.clone())
                .collect()
        };
        for sink in &sinks {
            (**sink)(callback.clone());
        }
        !sinks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

pub trait ObjectStore: Send + Sync {
    fn exists(&self, dn: &str) -> Result<bool>;

    /// Create an object. Fails if the DN is already present.
    fn create(&self, dn: &str, attrs: Attributes) -> Result<()>;

    fn read(&self, dn: &str) -> Result<Option<Attributes>>;

    /// Write a single attribute of an existing object.
    fn write_attr(&self, dn: &str, name: &str, value: AttrValue) -> Result<()>;

    /// Remove an object. Removing a missing object is not an error.
    fn delete(&self, dn: &str) -> Result<()>;

    /// All object DNs, in lexical order.
    fn list(&self) -> Result<Vec<String>>;

    fn sessions(&self) -> &SessionRegistry;

    fn attach(&self, dn: &str, sink: CallbackSink) -> Result<SessionId> {
        Ok(self.sessions().attach(dn, sink))
    }

    fn detach(&self, id: SessionId) {
        self.sessions().detach(id);
    }

    /// Ask the owner of `dn` to refresh `attribute`. Returns false when no
    /// session is attached to the object.
    fn request_runtime_update(&self, dn: &str, attribute: &str) -> Result<bool> {
        Ok(self.sessions().dispatch(
            dn,
            StoreCallback::RuntimeUpdate {
                dn: dn.to_string(),
                attribute: attribute.to_string(),
            },
        ))
    }

    fn read_attr(&self, dn: &str, name: &str) -> Result<Option<AttrValue>> {
        Ok(self.read(dn)?.and_then(|mut attrs| attrs.remove(name)))
    }

    /// Objects whose DN ends with `,parent`, i.e. descendants of `parent`.
    fn descendants(&self, parent: &str) -> Result<Vec<String>> {
        let suffix = format!(",{parent}");
        Ok(self
            .list()?
            .into_iter()
            .filter(|dn| dn.ends_with(&suffix))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process store, used by tests and by embedders that persist elsewhere.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Attributes>>,
    sessions: SessionRegistry,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Attributes>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ObjectStore for MemoryStore {
    fn exists(&self, dn: &str) -> Result<bool> {
        Ok(self.objects().contains_key(dn))
    }

    fn create(&self, dn: &str, attrs: Attributes) -> Result<()> {
        let mut objects = self.objects();
        if objects.contains_key(dn) {
            return Err(SmfError::Store(format!("object already exists: {dn}")));
        }
        objects.insert(dn.to_string(), attrs);
        Ok(())
    }

    fn read(&self, dn: &str) -> Result<Option<Attributes>> {
        Ok(self.objects().get(dn).cloned())
    }

    fn write_attr(&self, dn: &str, name: &str, value: AttrValue) -> Result<()> {
        let mut objects = self.objects();
        let attrs = objects
            .get_mut(dn)
            .ok_or_else(|| SmfError::Store(format!("object not found: {dn}")))?;
        attrs.insert(name.to_string(), value);
        Ok(())
    }

    fn delete(&self, dn: &str) -> Result<()> {
        self.objects().remove(dn);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.objects().keys().cloned().collect())
    }

    fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
