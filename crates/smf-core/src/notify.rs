//! State-change notifications.
//!
//! Every campaign (and procedure) state transition produces exactly one
//! `StateChangeNotification`. The wire protocol of the notification service
//! lives behind `Notifier`; executors open a session on startup and close it
//! when their loop exits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationClassId {
    pub vendor: u32,
    pub major: u16,
    pub minor: u16,
}

/// Vendor id used for all upgrade-orchestrator notifications.
pub const SMF_VENDOR_ID: u32 = 18568;
/// Major id of the software-management service.
pub const SMF_MAJOR_ID: u16 = 9;

pub const CAMPAIGN_STATE_CLASS: NotificationClassId = NotificationClassId {
    vendor: SMF_VENDOR_ID,
    major: SMF_MAJOR_ID,
    minor: 1,
};

pub const PROCEDURE_STATE_CLASS: NotificationClassId = NotificationClassId {
    vendor: SMF_VENDOR_ID,
    major: SMF_MAJOR_ID,
    minor: 2,
};

pub const CAMPAIGN_STATE_ATTR_ID: u32 = 1;
pub const PROCEDURE_STATE_ATTR_ID: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceIndicator {
    /// Transition caused directly by an administrative operation.
    ManagementOperation,
    /// Transition caused by the orchestrator's own progress.
    ObjectOperation,
    Unknown,
}

// ---------------------------------------------------------------------------
// StateChangeNotification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeNotification {
    pub id: Uuid,
    pub dn: String,
    pub class_id: NotificationClassId,
    pub source: SourceIndicator,
    pub state_attr_id: u32,
    pub new_state: u32,
    pub event_time: DateTime<Utc>,
}

impl StateChangeNotification {
    pub fn new(
        dn: impl Into<String>,
        class_id: NotificationClassId,
        source: SourceIndicator,
        state_attr_id: u32,
        new_state: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            dn: dn.into(),
            class_id,
            source,
            state_attr_id,
            new_state,
            event_time: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

pub trait Notifier: Send + Sync {
    fn open_session(&self) -> Result<()> {
        Ok(())
    }

    fn close_session(&self) {}

    fn send(&self, notification: &StateChangeNotification) -> Result<()>;
}

/// Emits notifications as structured log events.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, n: &StateChangeNotification) -> Result<()> {
        info!(
            dn = %n.dn,
            class_minor = n.class_id.minor,
            source = ?n.source,
            attr = n.state_attr_id,
            state = n.new_state,
            "state change"
        );
        Ok(())
    }
}

/// Keeps every notification in memory; used by tests and status tooling.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<StateChangeNotification>>,
    sessions: Mutex<(u32, u32)>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<StateChangeNotification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Notifications about `dn`, in emission order.
    pub fn for_dn(&self, dn: &str) -> Vec<StateChangeNotification> {
        self.sent()
            .into_iter()
            .filter(|n| n.dn == dn)
            .collect()
    }

    /// `(opened, closed)` session counts.
    pub fn session_counts(&self) -> (u32, u32) {
        *self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Notifier for MemoryNotifier {
    fn open_session(&self) -> Result<()> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).0 += 1;
        Ok(())
    }

    fn close_session(&self) {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).1 += 1;
    }

    fn send(&self, n: &StateChangeNotification) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(n.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
