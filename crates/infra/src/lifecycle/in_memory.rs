use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use uploadflow_events::contracts::{REPROCESS_FILE_REQUESTED_V1, UPLOAD_REQUESTED_V1};

use super::store::{
    IssuedCommand, ReprocessRequested, StoreError, TimelineItem, UploadLifecycleStore, UploadRecord,
    UploadRequested, UploadStatus,
};

pub const UNKNOWN_FILE_NAME: &str = "(unknown)";
pub const UNKNOWN_OWNER: &str = "(unknown)";
pub const GENERIC_CONTENT_TYPE: &str = "application/octet-stream";

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// In-memory lifecycle store.
///
/// A single write lock serializes every mutation, which also serializes
/// writes per `file_id`. Intended for a single gateway process; state is lost
/// on restart.
pub struct InMemoryLifecycleStore {
    records: RwLock<HashMap<String, UploadRecord>>,
    clock: Clock,
}

impl core::fmt::Debug for InMemoryLifecycleStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let len = self.records.read().map(|r| r.len()).unwrap_or_default();
        f.debug_struct("InMemoryLifecycleStore").field("records", &len).finish()
    }
}

impl Default for InMemoryLifecycleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLifecycleStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn timeline_item(event_type: &str, command: IssuedCommand) -> TimelineItem {
    TimelineItem {
        event_id: command.message_id,
        event_type: event_type.to_string(),
        occurred_at: command.occurred_at,
        correlation_id: command.correlation_id,
        payload: command.payload,
    }
}

impl UploadLifecycleStore for InMemoryLifecycleStore {
    fn upsert_requested(&self, input: UploadRequested) -> Result<UploadRecord, StoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let now = (self.clock)();

        let UploadRequested {
            file_id,
            user_id,
            user_name,
            requester_is_admin,
            file_name,
            content_type,
            size_bytes,
            command,
        } = input;

        if let Some(existing) = records.get(&file_id) {
            if !requester_is_admin && existing.user_id != user_id {
                return Err(StoreError::NotOwner { file_id });
            }
        }

        let correlation_id = command.correlation_id.clone();
        let entry = timeline_item(UPLOAD_REQUESTED_V1, command);

        let record = records
            .entry(file_id.clone())
            .and_modify(|r| {
                r.file_name = file_name.clone();
                r.content_type = content_type.clone();
                r.size_bytes = size_bytes;
                r.correlation_id = correlation_id.clone();
                r.status = UploadStatus::UploadRequested;
                r.updated_at = now;
            })
            .or_insert_with(|| UploadRecord {
                file_id: file_id.clone(),
                correlation_id: correlation_id.clone(),
                user_id,
                user_name,
                file_name: file_name.clone(),
                content_type: content_type.clone(),
                size_bytes,
                status: UploadStatus::UploadRequested,
                created_at: now,
                updated_at: now,
                reprocess_count: 0,
                last_command: String::new(),
                timeline: Vec::new(),
            });

        record.last_command = UPLOAD_REQUESTED_V1.to_string();
        record.timeline.push(entry);

        tracing::debug!(file_id = %record.file_id, entries = record.timeline.len(), "upload requested recorded");
        Ok(record.clone())
    }

    fn mark_reprocess_requested(&self, input: ReprocessRequested) -> Result<UploadRecord, StoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let now = (self.clock)();

        let ReprocessRequested { file_id, command } = input;
        let correlation_id = command.correlation_id.clone();
        let entry = timeline_item(REPROCESS_FILE_REQUESTED_V1, command);

        let record = records.entry(file_id.clone()).or_insert_with(|| {
            tracing::warn!(file_id = %file_id, "reprocess requested for unknown upload; using placeholder metadata");
            UploadRecord {
                file_id: file_id.clone(),
                correlation_id: correlation_id.clone(),
                user_id: UNKNOWN_OWNER.to_string(),
                user_name: UNKNOWN_OWNER.to_string(),
                file_name: UNKNOWN_FILE_NAME.to_string(),
                content_type: GENERIC_CONTENT_TYPE.to_string(),
                size_bytes: 0,
                status: UploadStatus::ReprocessRequested,
                created_at: now,
                updated_at: now,
                reprocess_count: 0,
                last_command: String::new(),
                timeline: Vec::new(),
            }
        });

        record.status = UploadStatus::ReprocessRequested;
        record.correlation_id = correlation_id;
        record.reprocess_count += 1;
        record.updated_at = now;
        record.last_command = REPROCESS_FILE_REQUESTED_V1.to_string();
        record.timeline.push(entry);

        tracing::debug!(file_id = %record.file_id, reprocess_count = record.reprocess_count, "reprocess recorded");
        Ok(record.clone())
    }

    fn get_by_id(&self, file_id: &str) -> Result<Option<UploadRecord>, StoreError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(file_id).cloned())
    }

    fn list(
        &self,
        requester_user_id: &str,
        is_admin: bool,
        user_id_filter: Option<&str>,
    ) -> Result<Vec<UploadRecord>, StoreError> {
        let owner = if is_admin { user_id_filter } else { Some(requester_user_id) };

        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut items: Vec<UploadRecord> = records
            .values()
            .filter(|r| owner.is_none_or(|o| r.user_id == o))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;

    /// Each call advances one second from a fixed origin.
    fn ticking_clock() -> Clock {
        let origin = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let ticks = Arc::new(AtomicI64::new(0));
        Arc::new(move || origin + Duration::seconds(ticks.fetch_add(1, Ordering::SeqCst)))
    }

    fn command(id: &str, correlation: &str) -> IssuedCommand {
        IssuedCommand {
            message_id: id.to_string(),
            correlation_id: correlation.to_string(),
            occurred_at: Utc::now(),
            payload: json!({ "messageId": id }),
        }
    }

    fn requested(file_id: &str, user_id: &str, message_id: &str) -> UploadRequested {
        UploadRequested {
            file_id: file_id.to_string(),
            user_id: user_id.to_string(),
            user_name: format!("{user_id}-name"),
            requester_is_admin: false,
            file_name: "report.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size_bytes: 2048,
            command: command(message_id, "c-upload"),
        }
    }

    fn reprocess(file_id: &str, message_id: &str) -> ReprocessRequested {
        ReprocessRequested {
            file_id: file_id.to_string(),
            command: command(message_id, "c-reprocess"),
        }
    }

    #[test]
    fn first_upload_request_creates_the_record() {
        let store = InMemoryLifecycleStore::with_clock(ticking_clock());
        let record = store.upsert_requested(requested("f1", "u1", "m1")).unwrap();

        assert_eq!(record.status, UploadStatus::UploadRequested);
        assert_eq!(record.reprocess_count, 0);
        assert_eq!(record.timeline.len(), 1);
        assert_eq!(record.timeline[0].event_type, UPLOAD_REQUESTED_V1);
        assert_eq!(record.timeline[0].event_id, "m1");
        assert_eq!(record.last_command, UPLOAD_REQUESTED_V1);
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn reprocessing_accumulates_without_touching_created_at() {
        let store = InMemoryLifecycleStore::with_clock(ticking_clock());
        let created = store.upsert_requested(requested("f1", "u1", "m1")).unwrap();
        store.mark_reprocess_requested(reprocess("f1", "m2")).unwrap();
        let record = store.mark_reprocess_requested(reprocess("f1", "m3")).unwrap();

        assert_eq!(record.reprocess_count, 2);
        assert_eq!(record.status, UploadStatus::ReprocessRequested);
        assert_eq!(record.timeline.len(), 3);
        assert_eq!(record.created_at, created.created_at);
        assert!(record.updated_at > created.updated_at);
        assert_eq!(record.correlation_id, "c-reprocess");
        assert_eq!(record.last_command, REPROCESS_FILE_REQUESTED_V1);
        assert_eq!(record.user_id, "u1");
        assert_eq!(record.file_name, "report.pdf");
    }

    #[test]
    fn timeline_is_append_only_across_updates() {
        let store = InMemoryLifecycleStore::with_clock(ticking_clock());
        let first = store.upsert_requested(requested("f1", "u1", "m1")).unwrap();
        store.mark_reprocess_requested(reprocess("f1", "m2")).unwrap();
        let again = store.upsert_requested(requested("f1", "u1", "m3")).unwrap();

        assert_eq!(again.timeline[0], first.timeline[0]);
        let ids: Vec<_> = again.timeline.iter().map(|t| t.event_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(again.status, UploadStatus::UploadRequested);
        assert_eq!(again.reprocess_count, 1);
        assert_eq!(again.created_at, first.created_at);
    }

    #[test]
    fn owner_is_fixed_at_creation() {
        let store = InMemoryLifecycleStore::with_clock(ticking_clock());
        store.upsert_requested(requested("f1", "alice", "m1")).unwrap();

        let err = store.upsert_requested(requested("f1", "bob", "m2")).unwrap_err();
        assert_eq!(err, StoreError::NotOwner { file_id: "f1".to_string() });

        let record = store.get_by_id("f1").unwrap().unwrap();
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.timeline.len(), 1);
    }

    #[test]
    fn admin_reannounce_keeps_the_owner() {
        let store = InMemoryLifecycleStore::with_clock(ticking_clock());
        store.upsert_requested(requested("f1", "alice", "m1")).unwrap();

        let mut by_admin = requested("f1", "root", "m2");
        by_admin.requester_is_admin = true;
        by_admin.file_name = "renamed.pdf".to_string();
        let record = store.upsert_requested(by_admin).unwrap();

        assert_eq!(record.user_id, "alice");
        assert_eq!(record.user_name, "alice-name");
        assert_eq!(record.file_name, "renamed.pdf");
        assert_eq!(record.timeline.len(), 2);
        assert_eq!(store.list("alice", false, None).unwrap().len(), 1);
    }

    #[test]
    fn concurrent_first_requests_leave_a_single_owner() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let handles: Vec<_> = ["alice", "bob", "carol", "dave"]
            .into_iter()
            .map(|user| {
                let store = store.clone();
                std::thread::spawn(move || store.upsert_requested(requested("shared", user, user)).is_ok())
            })
            .collect();
        let accepted = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();

        assert_eq!(accepted, 1);
        let record = store.get_by_id("shared").unwrap().unwrap();
        assert_eq!(record.timeline.len(), 1);
        assert_eq!(record.timeline[0].event_id, record.user_id);
    }

    #[test]
    fn updated_at_follows_write_order_under_contention() {
        let store = Arc::new(InMemoryLifecycleStore::with_clock(ticking_clock()));
        store.upsert_requested(requested("f1", "u1", "m0")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|i| {
                            let record = store
                                .mark_reprocess_requested(reprocess("f1", &format!("m-{t}-{i}")))
                                .unwrap();
                            (record.reprocess_count, record.updated_at)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut writes: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        writes.sort_by_key(|(count, _)| *count);

        assert_eq!(writes.len(), 200);
        assert!(writes.windows(2).all(|w| w[0].1 < w[1].1));
    }

    #[test]
    fn reprocessing_an_unknown_upload_uses_placeholders() {
        let store = InMemoryLifecycleStore::with_clock(ticking_clock());
        let record = store.mark_reprocess_requested(reprocess("ghost", "m1")).unwrap();

        assert_eq!(record.file_name, UNKNOWN_FILE_NAME);
        assert_eq!(record.content_type, GENERIC_CONTENT_TYPE);
        assert_eq!(record.size_bytes, 0);
        assert_eq!(record.user_id, UNKNOWN_OWNER);
        assert_eq!(record.reprocess_count, 1);
        assert_eq!(record.timeline.len(), 1);
        assert_eq!(record.timeline[0].event_type, REPROCESS_FILE_REQUESTED_V1);
    }

    #[test]
    fn get_by_id_signals_missing_records() {
        let store = InMemoryLifecycleStore::new();
        assert_eq!(store.get_by_id("nope").unwrap(), None);
        store.upsert_requested(requested("f1", "u1", "m1")).unwrap();
        assert!(store.get_by_id("f1").unwrap().is_some());
    }

    #[test]
    fn list_is_scoped_and_most_recent_first() {
        let store = InMemoryLifecycleStore::with_clock(ticking_clock());
        store.upsert_requested(requested("a", "alice", "m1")).unwrap();
        store.upsert_requested(requested("b", "bob", "m2")).unwrap();
        store.upsert_requested(requested("c", "alice", "m3")).unwrap();
        store.mark_reprocess_requested(reprocess("a", "m4")).unwrap();

        let alice = store.list("alice", false, Some("bob")).unwrap();
        assert!(alice.iter().all(|r| r.user_id == "alice"));
        let ids: Vec<_> = alice.iter().map(|r| r.file_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let everyone = store.list("root", true, None).unwrap();
        assert_eq!(everyone.len(), 3);
        assert!(everyone.windows(2).all(|w| w[0].updated_at >= w[1].updated_at));

        let only_bob = store.list("root", true, Some("bob")).unwrap();
        assert_eq!(only_bob.len(), 1);
        assert_eq!(only_bob[0].file_id, "b");
    }

    #[test]
    fn concurrent_reprocess_requests_are_all_counted() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        store.upsert_requested(requested("f1", "u1", "m0")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        store
                            .mark_reprocess_requested(reprocess("f1", &format!("m-{t}-{i}")))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let record = store.get_by_id("f1").unwrap().unwrap();
        assert_eq!(record.reprocess_count, 200);
        assert_eq!(record.timeline.len(), 201);
    }
}
