//! Lifecycle events and the in-memory event log.
//!
//! Every phase transition, failure and discovery milestone is recorded as a
//! [`LifecycleEvent`]. The [`EventLog`] keeps the most recent entries in a
//! bounded ring buffer and broadcasts each new entry to live subscribers
//! (the display surface). Events are never persisted.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use {
    serde::{Deserialize, Serialize},
    tokio::sync::broadcast,
    tracing::{error, info, warn},
};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── LifecycleEvent ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Success => write!(f, "success"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Which component produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Lifecycle,
    Reconciler,
    Discovery,
    Settings,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Reconciler => write!(f, "reconciler"),
            Self::Discovery => write!(f, "discovery"),
            Self::Settings => write!(f, "settings"),
        }
    }
}

/// A single user-visible event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub message: String,
    pub severity: Severity,
    pub source: EventSource,
    pub timestamp_ms: u64,
}

impl LifecycleEvent {
    pub fn new(source: EventSource, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity,
            source,
            timestamp_ms: now_ms(),
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.source, self.message)
    }
}

// ── EventLog ────────────────────────────────────────────────────────────────

const DEFAULT_CAPACITY: usize = 1_000;
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Bounded, append-only log of recent events with live fan-out.
///
/// Cloning is cheap; clones share the same buffer and channel.
#[derive(Clone)]
pub struct EventLog {
    buf: Arc<RwLock<VecDeque<LifecycleEvent>>>,
    capacity: usize,
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            buf: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
            tx,
        }
    }

    /// Append an event, mirror it to tracing and notify subscribers.
    pub fn push(&self, event: LifecycleEvent) {
        match event.severity {
            Severity::Info | Severity::Success => {
                info!(source = %event.source, severity = %event.severity, "{}", event.message);
            },
            Severity::Warning => warn!(source = %event.source, "{}", event.message),
            Severity::Error => error!(source = %event.source, "{}", event.message),
        }

        // Best-effort broadcast; nobody may be listening.
        let _ = self.tx.send(event.clone());

        if let Ok(mut buf) = self.buf.write() {
            if buf.len() >= self.capacity {
                buf.pop_front();
            }
            buf.push_back(event);
        }
    }

    pub fn info(&self, source: EventSource, message: impl Into<String>) {
        self.push(LifecycleEvent::new(source, Severity::Info, message));
    }

    pub fn success(&self, source: EventSource, message: impl Into<String>) {
        self.push(LifecycleEvent::new(source, Severity::Success, message));
    }

    pub fn warning(&self, source: EventSource, message: impl Into<String>) {
        self.push(LifecycleEvent::new(source, Severity::Warning, message));
    }

    pub fn error(&self, source: EventSource, message: impl Into<String>) {
        self.push(LifecycleEvent::new(source, Severity::Error, message));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// The last `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<LifecycleEvent> {
        let Ok(buf) = self.buf.read() else {
            return Vec::new();
        };
        let skip = buf.len().saturating_sub(limit);
        buf.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut buf) = self.buf.write() {
            buf.clear();
        }
    }
}
