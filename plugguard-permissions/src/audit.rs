//! Audit trail for permission decisions and plugin lifecycle events.
//!
//! Entries are kept in a bounded in-memory ring buffer (oldest evicted first)
//! and may additionally be forwarded to an [`AuditExporter`]. Recording an
//! entry never fails from the caller's point of view: exporter problems are
//! logged, counted, and otherwise ignored.

use chrono::{DateTime, Utc};
use plugguard_types::EntityType;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of entries retained in memory.
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// Entries buffered between the caller and the export thread.
const EXPORT_QUEUE_DEPTH: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    Grant,
    Revoke,
    CheckDeniedRevoked,
    CheckDeniedNotGranted,
    CheckDeniedNoGrants,
    CheckDeniedInvalid,
    PermissionRequest,
    RequestApproved,
    RequestDenied,
    PluginLoad,
    PluginLoadFailed,
    PluginExecute,
    PluginUnload,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Revoke => "revoke",
            Self::CheckDeniedRevoked => "check:denied:revoked",
            Self::CheckDeniedNotGranted => "check:denied:not_granted",
            Self::CheckDeniedNoGrants => "check:denied:no_grants",
            Self::CheckDeniedInvalid => "check:denied:invalid",
            Self::PermissionRequest => "permission_request",
            Self::RequestApproved => "request:approved",
            Self::RequestDenied => "request:denied",
            Self::PluginLoad => "plugin:load",
            Self::PluginLoadFailed => "plugin:load_failed",
            Self::PluginExecute => "plugin:execute",
            Self::PluginUnload => "plugin:unload",
        }
    }

    /// Matches an action filter: exact, or a prefix when the filter ends in `*`.
    pub fn matches(&self, filter: &str) -> bool {
        match filter.strip_suffix('*') {
            Some(prefix) => self.as_str().starts_with(prefix),
            None => self.as_str() == filter,
        }
    }
}

impl Serialize for AuditAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event waiting to be sequenced into the trail.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    action: AuditAction,
    entity_id: String,
    entity_type: Option<EntityType>,
    permission: Option<String>,
    actor: Option<String>,
    metadata: Value,
}

impl AuditEvent {
    pub fn new(action: AuditAction, entity_id: impl Into<String>) -> Self {
        Self {
            action,
            entity_id: entity_id.into(),
            entity_type: None,
            permission: None,
            actor: None,
            metadata: Value::Null,
        }
    }

    pub fn entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An immutable, sequenced audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Process-wide monotonic sequence number; replay order.
    pub seq: u64,
    pub action: AuditAction,
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Query over the in-memory trail. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub entity_id: Option<String>,
    /// Exact action name, or a prefix ending in `*` (e.g. `check:denied:*`).
    pub action: Option<String>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the most recent N matches.
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.entity_id.as_deref().is_none_or(|id| entry.entity_id == id)
            && self.action.as_deref().is_none_or(|a| entry.action.matches(a))
            && self.since.is_none_or(|since| entry.timestamp >= since)
    }
}

#[derive(Debug, Error)]
pub enum AuditExportError {
    #[error("audit export queue is full")]
    QueueFull,

    #[error("audit exporter is closed")]
    Closed,
}

/// Destination for audit entries beyond the in-memory ring.
///
/// Implementations must return promptly; anything slow belongs on a
/// background thread.
pub trait AuditExporter: Send + Sync {
    fn export(&self, entry: &AuditEntry) -> Result<(), AuditExportError>;

    /// Failures that happened after `export` returned (e.g. I/O on a
    /// background writer).
    fn deferred_failures(&self) -> u64 {
        0
    }
}

/// Appends entries as JSON lines to a file from a dedicated writer thread.
pub struct JsonLinesExporter {
    path: PathBuf,
    sender: Option<SyncSender<AuditEntry>>,
    writer: Option<JoinHandle<()>>,
    write_failures: Arc<AtomicU64>,
}

impl JsonLinesExporter {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let (sender, receiver) = mpsc::sync_channel::<AuditEntry>(EXPORT_QUEUE_DEPTH);
        let write_failures = Arc::new(AtomicU64::new(0));
        let failures = Arc::clone(&write_failures);
        let log_path = path.clone();

        let writer = std::thread::Builder::new()
            .name("plugguard-audit-export".into())
            .spawn(move || {
                let mut out = BufWriter::new(file);
                for entry in receiver {
                    let written = serde_json::to_writer(&mut out, &entry)
                        .map_err(std::io::Error::from)
                        .and_then(|_| out.write_all(b"\n"))
                        .and_then(|_| out.flush());
                    if let Err(e) = written {
                        failures.fetch_add(1, Ordering::Relaxed);
                        warn!(path = %log_path.display(), seq = entry.seq, "audit export write failed: {e}");
                    }
                }
            })?;

        debug!(path = %path.display(), "audit export enabled");
        Ok(Self {
            path,
            sender: Some(sender),
            writer: Some(writer),
            write_failures,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditExporter for JsonLinesExporter {
    fn export(&self, entry: &AuditEntry) -> Result<(), AuditExportError> {
        let sender = self.sender.as_ref().ok_or(AuditExportError::Closed)?;
        sender.try_send(entry.clone()).map_err(|e| match e {
            TrySendError::Full(_) => AuditExportError::QueueFull,
            TrySendError::Disconnected(_) => AuditExportError::Closed,
        })
    }

    fn deferred_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }
}

impl Drop for JsonLinesExporter {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain and exit.
        self.sender.take();
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

/// Bounded, sequenced audit log.
pub struct AuditTrail {
    entries: RwLock<VecDeque<AuditEntry>>,
    capacity: usize,
    next_seq: AtomicU64,
    failures: AtomicU64,
    exporter: Option<Box<dyn AuditExporter>>,
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl AuditTrail {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_AUDIT_CAPACITY))),
            capacity,
            next_seq: AtomicU64::new(1),
            failures: AtomicU64::new(0),
            exporter: None,
        }
    }

    pub fn with_exporter(mut self, exporter: Box<dyn AuditExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Sequences and stores an event. Returns the assigned sequence number.
    ///
    /// The sequence number is taken under the ring lock, so ring order is
    /// sequence order.
    pub fn record(&self, event: AuditEvent) -> u64 {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = AuditEntry {
            seq,
            action: event.action,
            entity_id: event.entity_id,
            entity_type: event.entity_type,
            permission: event.permission,
            actor: event.actor,
            timestamp: Utc::now(),
            metadata: event.metadata,
        };

        if let Some(exporter) = &self.exporter {
            if let Err(e) = exporter.export(&entry) {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(seq, action = %entry.action, "audit export dropped entry: {e}");
            }
        }

        if self.capacity > 0 {
            while entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
        seq
    }

    /// Matching entries in chronological order.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut matched: Vec<AuditEntry> = entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries that could not be exported, including deferred write errors.
    pub fn failures(&self) -> u64 {
        let deferred = self
            .exporter
            .as_ref()
            .map_or(0, |e| e.deferred_failures());
        self.failures.load(Ordering::Relaxed) + deferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn grant(entity: &str) -> AuditEvent {
        AuditEvent::new(AuditAction::Grant, entity).permission("ai:chat")
    }

    // ================================================================
    // Ring buffer
    // ================================================================

    #[test]
    fn sequence_numbers_increase() {
        let trail = AuditTrail::new(8);
        let a = trail.record(grant("p1"));
        let b = trail.record(grant("p1"));
        assert!(b > a);
    }

    #[test]
    fn evicts_oldest_first() {
        let trail = AuditTrail::new(3);
        for i in 0..5 {
            trail.record(grant(&format!("p{i}")));
        }
        let ids: Vec<String> = trail
            .query(&AuditFilter::new())
            .into_iter()
            .map(|e| e.entity_id)
            .collect();
        assert_eq!(ids, vec!["p2", "p3", "p4"]);
        assert_eq!(trail.len(), 3);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let trail = AuditTrail::new(0);
        trail.record(grant("p1"));
        assert!(trail.is_empty());
    }

    // ================================================================
    // Filters
    // ================================================================

    #[test]
    fn limit_keeps_most_recent_in_order() {
        let trail = AuditTrail::new(16);
        for i in 0..6 {
            trail.record(grant(&format!("p{i}")));
        }
        let ids: Vec<String> = trail
            .query(&AuditFilter::new().limit(2))
            .into_iter()
            .map(|e| e.entity_id)
            .collect();
        assert_eq!(ids, vec!["p4", "p5"]);
    }

    #[test]
    fn action_prefix_filter() {
        let trail = AuditTrail::new(16);
        trail.record(AuditEvent::new(AuditAction::CheckDeniedRevoked, "p1"));
        trail.record(AuditEvent::new(AuditAction::CheckDeniedNoGrants, "p2"));
        trail.record(grant("p3"));

        assert_eq!(trail.query(&AuditFilter::new().action("check:denied:*")).len(), 2);
        assert_eq!(trail.query(&AuditFilter::new().action("check:denied:revoked")).len(), 1);
        assert_eq!(trail.query(&AuditFilter::new().action("check:denied")).len(), 0);
    }

    #[test]
    fn entity_and_since_filters() {
        let trail = AuditTrail::new(16);
        trail.record(grant("a"));
        let cutoff = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        trail.record(grant("a"));
        trail.record(grant("b"));

        assert_eq!(trail.query(&AuditFilter::new().entity("a")).len(), 2);
        assert_eq!(trail.query(&AuditFilter::new().entity("a").since(cutoff)).len(), 1);
    }

    #[test]
    fn entry_serializes_with_action_string() {
        let trail = AuditTrail::new(4);
        trail.record(
            AuditEvent::new(AuditAction::CheckDeniedNotGranted, "p1")
                .entity_type(EntityType::Plugin)
                .permission("network:fetch")
                .metadata(json!({"reason": "not_granted"})),
        );
        let entry = trail.query(&AuditFilter::new()).remove(0);
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["action"], "check:denied:not_granted");
        assert_eq!(value["entityId"], "p1");
        assert_eq!(value["entityType"], "plugin");
        assert_eq!(value["metadata"]["reason"], "not_granted");
        assert!(value.get("actor").is_none());
    }

    // ================================================================
    // Exporters
    // ================================================================

    struct RejectingExporter;

    impl AuditExporter for RejectingExporter {
        fn export(&self, _entry: &AuditEntry) -> Result<(), AuditExportError> {
            Err(AuditExportError::QueueFull)
        }
    }

    #[test]
    fn export_failures_are_counted_not_raised() {
        let trail = AuditTrail::new(4).with_exporter(Box::new(RejectingExporter));
        trail.record(grant("p1"));
        trail.record(grant("p2"));
        assert_eq!(trail.failures(), 2);
        assert_eq!(trail.len(), 2);
    }

    #[test]
    fn json_lines_exporter_writes_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("trail.jsonl");
        {
            let exporter = JsonLinesExporter::open(&path).unwrap();
            let trail = AuditTrail::new(4).with_exporter(Box::new(exporter));
            for i in 0..10 {
                trail.record(grant(&format!("p{i}")));
            }
            assert_eq!(trail.failures(), 0);
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0]["entityId"], "p0");
        assert_eq!(lines[9]["action"], "grant");
    }
}
