//! Upload orchestration: request → command → confirmed publish → lifecycle.
//!
//! The store is only touched after the broker confirmed the command, so a
//! record never advances ahead of what the broker accepted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use uploadflow_core::{DomainError, IdGenerator};
use uploadflow_events::contracts::{
    REPROCESS_FILE_REQUESTED_V1, ReprocessFileRequestedV1, UPLOAD_REQUESTED_V1, UploadRequestedV1,
};
use uploadflow_events::routing::command_routing_key;
use uploadflow_events::trace::create_trace_ids;
use uploadflow_events::{Envelope, EnvelopeError, EnvelopeInput, NamingError, TraceIds, TraceSource};
use uploadflow_infra::lifecycle::{IssuedCommand, ReprocessRequested, StoreError, UploadRequested};
use uploadflow_infra::{CommandPublisher, PublishError, UploadLifecycleStore, UploadRecord, UploadStatus};

use crate::context::{PrincipalContext, RequestCorrelation};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("routing key: {0}")]
    Naming(#[from] NamingError),

    #[error("envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A validated upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUpload {
    /// Re-announce an existing upload instead of minting a new id.
    pub file_id: Option<String>,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

impl NewUpload {
    pub fn validate(
        file_id: Option<String>,
        file_name: &str,
        content_type: &str,
        size_bytes: i64,
    ) -> Result<Self, DomainError> {
        let file_name = file_name.trim();
        if file_name.is_empty() {
            return Err(DomainError::validation("fileName must be a non-empty string"));
        }
        let content_type = content_type.trim();
        if content_type.is_empty() {
            return Err(DomainError::validation("contentType must be a non-empty string"));
        }
        let size_bytes = u64::try_from(size_bytes)
            .map_err(|_| DomainError::validation("sizeBytes must be zero or positive"))?;
        let file_id = match file_id.as_deref().map(str::trim) {
            Some("") => return Err(DomainError::validation("fileId must not be blank")),
            Some(id) => Some(id.to_string()),
            None => None,
        };

        Ok(Self {
            file_id,
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            size_bytes,
        })
    }
}

/// A command the broker confirmed and the store recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub file_id: String,
    pub correlation_id: String,
    pub message_id: String,
    pub status: UploadStatus,
    pub reprocess_count: u32,
}

impl Accepted {
    fn from_record(record: &UploadRecord, message_id: &str) -> Self {
        Self {
            file_id: record.file_id.clone(),
            correlation_id: record.correlation_id.clone(),
            message_id: message_id.to_string(),
            status: record.status,
            reprocess_count: record.reprocess_count,
        }
    }
}

/// Client-supplied file ids with an upload request in flight: holder and
/// number of its pending requests.
type FileIdClaims = Mutex<HashMap<String, (String, usize)>>;

/// Released when the request that took it finishes, however it finishes.
struct FileIdClaim<'a> {
    claims: &'a FileIdClaims,
    file_id: String,
}

impl Drop for FileIdClaim<'_> {
    fn drop(&mut self) {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, pending)) = claims.get_mut(&self.file_id) {
            *pending -= 1;
            if *pending == 0 {
                claims.remove(&self.file_id);
            }
        }
    }
}

pub struct UploadOrchestrator {
    publisher: Arc<CommandPublisher>,
    store: Arc<dyn UploadLifecycleStore>,
    ids: Arc<dyn IdGenerator>,
    producer: String,
    claims: FileIdClaims,
}

impl UploadOrchestrator {
    pub fn new(
        publisher: Arc<CommandPublisher>,
        store: Arc<dyn UploadLifecycleStore>,
        ids: Arc<dyn IdGenerator>,
        producer: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            store,
            ids,
            producer: producer.into(),
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a client-supplied file id for `principal` until the returned
    /// claim is dropped.
    ///
    /// Fails if the upload belongs to another user (as not-found, unless the
    /// caller is an admin) or if another user's request for the same id is
    /// still in flight.
    fn claim_file_id(&self, principal: &PrincipalContext, file_id: &str) -> Result<FileIdClaim<'_>, UploadError> {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((holder, _)) = claims.get(file_id) {
            if holder != principal.user_id() {
                if principal.is_admin() {
                    let msg = format!("upload {file_id} is being requested by another user");
                    return Err(DomainError::conflict(msg).into());
                }
                return Err(DomainError::not_found().into());
            }
        }
        if let Some(existing) = self.store.get_by_id(file_id)? {
            if !principal.is_admin() && existing.user_id != principal.user_id() {
                return Err(DomainError::not_found().into());
            }
        }

        claims
            .entry(file_id.to_string())
            .or_insert_with(|| (principal.user_id().to_string(), 0))
            .1 += 1;
        Ok(FileIdClaim {
            claims: &self.claims,
            file_id: file_id.to_string(),
        })
    }

    /// Issue `UploadRequested.v1` and record the upload.
    #[instrument(skip_all, fields(user_id = %principal.user_id()), err)]
    pub async fn request_upload(
        &self,
        principal: &PrincipalContext,
        upload: NewUpload,
        correlation: &RequestCorrelation,
    ) -> Result<Accepted, UploadError> {
        let _claim = match upload.file_id.as_deref() {
            Some(file_id) => Some(self.claim_file_id(principal, file_id)?),
            None => None,
        };

        let file_id = upload.file_id.unwrap_or_else(|| self.ids.generate());
        let payload = UploadRequestedV1 {
            file_id: file_id.clone(),
            file_name: upload.file_name.clone(),
            content_type: upload.content_type.clone(),
            size_bytes: upload.size_bytes,
            user_id: principal.user_id().to_string(),
            user_name: principal.user_name().to_string(),
            requested_at: Utc::now(),
        };

        let envelope = Envelope::build(
            EnvelopeInput::command(UPLOAD_REQUESTED_V1, self.producer.as_str(), payload)
                .with_correlation_id(correlation.effective()),
            &*self.ids,
        )?;
        let routing_key = command_routing_key("upload", "requested", 1)?;

        self.publisher.publish_command(&envelope, &routing_key).await?;

        let record = self.store.upsert_requested(UploadRequested {
            file_id,
            user_id: principal.user_id().to_string(),
            user_name: principal.user_name().to_string(),
            requester_is_admin: principal.is_admin(),
            file_name: upload.file_name,
            content_type: upload.content_type,
            size_bytes: upload.size_bytes,
            command: IssuedCommand::from_envelope(&envelope)?,
        })?;

        info!(
            file_id = %record.file_id,
            message_id = %envelope.message_id(),
            correlation_id = %envelope.correlation_id(),
            "upload requested"
        );
        Ok(Accepted::from_record(&record, envelope.message_id()))
    }

    /// Issue `ReprocessFileRequested.v1` (admins only).
    ///
    /// The command is caused by the upload's most recent timeline entry and
    /// stays in its correlation chain unless the caller supplied one.
    #[instrument(skip_all, fields(file_id = %file_id, user_id = %principal.user_id()), err)]
    pub async fn request_reprocess(
        &self,
        principal: &PrincipalContext,
        file_id: &str,
        reason: Option<String>,
        correlation: &RequestCorrelation,
    ) -> Result<Accepted, UploadError> {
        if !principal.is_admin() {
            return Err(DomainError::forbidden("reprocessing requires the admin role").into());
        }
        let file_id = file_id.trim();
        if file_id.is_empty() {
            return Err(DomainError::validation("fileId must not be blank").into());
        }

        let existing = self.store.get_by_id(file_id)?;
        let trace = self.reprocess_trace(existing.as_ref(), correlation);

        let payload = ReprocessFileRequestedV1 {
            file_id: file_id.to_string(),
            requested_by: principal.user_id().to_string(),
            reason: reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
            requested_at: Utc::now(),
        };
        let envelope = Envelope::build(
            EnvelopeInput::command(REPROCESS_FILE_REQUESTED_V1, self.producer.as_str(), payload)
                .with_correlation_id(trace.correlation_id)
                .with_causation_id(trace.causation_id),
            &*self.ids,
        )?;
        let routing_key = command_routing_key("file", "reprocess", 1)?;

        self.publisher.publish_command(&envelope, &routing_key).await?;

        let record = self.store.mark_reprocess_requested(ReprocessRequested {
            file_id: file_id.to_string(),
            command: IssuedCommand::from_envelope(&envelope)?,
        })?;

        info!(
            message_id = %envelope.message_id(),
            reprocess_count = record.reprocess_count,
            known = existing.is_some(),
            "reprocess requested"
        );
        Ok(Accepted::from_record(&record, envelope.message_id()))
    }

    fn reprocess_trace(&self, existing: Option<&UploadRecord>, correlation: &RequestCorrelation) -> TraceIds {
        let last = existing.and_then(|r| r.timeline.last());
        match (existing, last) {
            (Some(record), Some(last)) => create_trace_ids(
                Some(TraceSource::Message {
                    message_id: &last.event_id,
                    correlation_id: Some(correlation.supplied().unwrap_or(record.correlation_id.as_str())),
                }),
                &*self.ids,
            ),
            _ => TraceIds {
                correlation_id: correlation.effective().to_string(),
                causation_id: None,
            },
        }
    }

    /// A single upload, visible to its owner and to admins.
    pub fn upload_status(&self, principal: &PrincipalContext, file_id: &str) -> Result<UploadRecord, UploadError> {
        let record = self
            .store
            .get_by_id(file_id)?
            .filter(|r| principal.is_admin() || r.user_id == principal.user_id())
            .ok_or(DomainError::NotFound)?;
        Ok(record)
    }

    /// Uploads visible to `principal`, most recently updated first.
    pub fn list_uploads(
        &self,
        principal: &PrincipalContext,
        user_id_filter: Option<&str>,
    ) -> Result<Vec<UploadRecord>, UploadError> {
        let filter = user_id_filter.map(str::trim).filter(|f| !f.is_empty());
        Ok(self.store.list(principal.user_id(), principal.is_admin(), filter)?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uploadflow_auth::Role;
    use uploadflow_core::SequentialIdGenerator;
    use uploadflow_events::{InMemoryBroker, Topology};
    use uploadflow_infra::{InMemoryLifecycleStore, PublisherConfig};

    use super::*;

    struct Fixture {
        broker: InMemoryBroker,
        store: Arc<InMemoryLifecycleStore>,
        ids: Arc<SequentialIdGenerator>,
        orchestrator: UploadOrchestrator,
    }

    async fn fixture() -> Fixture {
        let broker = InMemoryBroker::new();
        let publisher = Arc::new(CommandPublisher::new(
            Arc::new(broker.clone()),
            PublisherConfig {
                confirm_timeout: Some(Duration::from_millis(100)),
                ..PublisherConfig::default()
            },
        ));
        publisher.declare_topology(&Topology::standard()).await.unwrap();

        let store = Arc::new(InMemoryLifecycleStore::new());
        let ids = Arc::new(SequentialIdGenerator::new());
        let orchestrator = UploadOrchestrator::new(publisher, store.clone(), ids.clone(), "upload-gateway");
        Fixture {
            broker,
            store,
            ids,
            orchestrator,
        }
    }

    fn alice() -> PrincipalContext {
        PrincipalContext::new("alice", "Alice", vec![])
    }

    fn admin() -> PrincipalContext {
        PrincipalContext::new("root", "Root", vec![Role::admin()])
    }

    fn upload(name: &str) -> NewUpload {
        NewUpload::validate(None, name, "image/png", 2048).unwrap()
    }

    fn correlation(ids: &SequentialIdGenerator, header: Option<&str>) -> RequestCorrelation {
        RequestCorrelation::resolve(header, ids)
    }

    #[test]
    fn validation_rejects_blank_fields_and_negative_sizes() {
        assert!(NewUpload::validate(None, "  ", "image/png", 1).is_err());
        assert!(NewUpload::validate(None, "a.png", "", 1).is_err());
        assert!(NewUpload::validate(None, "a.png", "image/png", -1).is_err());
        assert!(NewUpload::validate(Some(" ".into()), "a.png", "image/png", 1).is_err());

        let ok = NewUpload::validate(Some(" f-1 ".into()), " a.png ", "image/png", 0).unwrap();
        assert_eq!(ok.file_id.as_deref(), Some("f-1"));
        assert_eq!(ok.file_name, "a.png");
        assert_eq!(ok.size_bytes, 0);
    }

    #[tokio::test]
    async fn upload_publishes_then_records() {
        let f = fixture().await;
        let corr = correlation(&f.ids, Some("corr-1"));

        let accepted = f.orchestrator.request_upload(&alice(), upload("cat.png"), &corr).await.unwrap();
        assert_eq!(accepted.correlation_id, "corr-1");
        assert_eq!(accepted.status, UploadStatus::UploadRequested);

        let messages = f.broker.queue_messages("q.upload.commands");
        assert_eq!(messages.len(), 1);
        let envelope: Envelope<UploadRequestedV1> = Envelope::from_json_slice(&messages[0].body).unwrap();
        assert_eq!(envelope.message_id(), accepted.message_id);
        assert_eq!(envelope.payload().file_id, accepted.file_id);
        assert_eq!(envelope.payload().user_name, "Alice");
        assert_eq!(envelope.producer(), "upload-gateway");

        let record = f.store.get_by_id(&accepted.file_id).unwrap().unwrap();
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.timeline.len(), 1);
        assert_eq!(record.timeline[0].event_id, accepted.message_id);
    }

    #[tokio::test]
    async fn unconfirmed_publish_never_reaches_the_store() {
        let f = fixture().await;
        f.broker.hold_confirms(true);
        let corr = correlation(&f.ids, None);

        let upload = NewUpload::validate(Some("f-held".into()), "a.png", "image/png", 1).unwrap();
        let err = f.orchestrator.request_upload(&alice(), upload, &corr).await.unwrap_err();

        assert!(matches!(err, UploadError::Publish(PublishError::Delivery(_))));
        assert_eq!(f.store.get_by_id("f-held").unwrap(), None);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn reprocess_requires_admin() {
        let f = fixture().await;
        let corr = correlation(&f.ids, None);
        let err = f
            .orchestrator
            .request_reprocess(&alice(), "f-1", None, &corr)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Domain(DomainError::Forbidden(_))));
        assert_eq!(f.broker.confirmed_count(), 0);
    }

    #[tokio::test]
    async fn reprocess_chains_to_the_last_command() {
        let f = fixture().await;
        let accepted = f
            .orchestrator
            .request_upload(&alice(), upload("cat.png"), &correlation(&f.ids, Some("corr-up")))
            .await
            .unwrap();

        let reprocessed = f
            .orchestrator
            .request_reprocess(&admin(), &accepted.file_id, Some(" blurry ".into()), &correlation(&f.ids, None))
            .await
            .unwrap();
        assert_eq!(reprocessed.status, UploadStatus::ReprocessRequested);
        assert_eq!(reprocessed.reprocess_count, 1);
        assert_eq!(reprocessed.correlation_id, "corr-up");

        let messages = f.broker.queue_messages("q.upload.commands");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].routing_key, "commands.file.reprocess.v1");
        let envelope: Envelope<ReprocessFileRequestedV1> = Envelope::from_json_slice(&messages[1].body).unwrap();
        assert_eq!(envelope.causation_id(), Some(accepted.message_id.as_str()));
        assert_eq!(envelope.payload().reason.as_deref(), Some("blurry"));
        assert_eq!(envelope.payload().requested_by, "root");

        let record = f.store.get_by_id(&accepted.file_id).unwrap().unwrap();
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.timeline.len(), 2);
    }

    #[tokio::test]
    async fn supplied_correlation_overrides_the_record_chain() {
        let f = fixture().await;
        let accepted = f
            .orchestrator
            .request_upload(&alice(), upload("cat.png"), &correlation(&f.ids, Some("corr-up")))
            .await
            .unwrap();

        let reprocessed = f
            .orchestrator
            .request_reprocess(&admin(), &accepted.file_id, None, &correlation(&f.ids, Some("corr-ops")))
            .await
            .unwrap();
        assert_eq!(reprocessed.correlation_id, "corr-ops");
    }

    #[tokio::test]
    async fn reprocessing_an_unknown_file_uses_placeholders() {
        let f = fixture().await;
        let corr = correlation(&f.ids, Some("corr-x"));

        let accepted = f
            .orchestrator
            .request_reprocess(&admin(), "ghost", None, &corr)
            .await
            .unwrap();
        assert_eq!(accepted.correlation_id, "corr-x");
        assert_eq!(accepted.reprocess_count, 1);

        let record = f.store.get_by_id("ghost").unwrap().unwrap();
        assert_eq!(record.file_name, "(unknown)");
        assert_eq!(record.content_type, "application/octet-stream");
        assert_eq!(record.size_bytes, 0);

        let messages = f.broker.queue_messages("q.upload.commands");
        let envelope: Envelope = Envelope::from_json_slice(&messages[0].body).unwrap();
        assert_eq!(envelope.causation_id(), None);
    }

    #[tokio::test]
    async fn status_and_listing_are_scoped_to_the_owner() {
        let f = fixture().await;
        let bob = PrincipalContext::new("bob", "Bob", vec![]);
        let mine = f
            .orchestrator
            .request_upload(&alice(), upload("a.png"), &correlation(&f.ids, None))
            .await
            .unwrap();
        f.orchestrator
            .request_upload(&bob, upload("b.png"), &correlation(&f.ids, None))
            .await
            .unwrap();

        assert!(f.orchestrator.upload_status(&alice(), &mine.file_id).is_ok());
        assert!(f.orchestrator.upload_status(&admin(), &mine.file_id).is_ok());
        assert!(matches!(
            f.orchestrator.upload_status(&bob, &mine.file_id),
            Err(UploadError::Domain(DomainError::NotFound))
        ));

        let listed = f.orchestrator.list_uploads(&alice(), Some("bob")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].user_id, "alice");

        assert_eq!(f.orchestrator.list_uploads(&admin(), None).unwrap().len(), 2);
        let filtered = f.orchestrator.list_uploads(&admin(), Some("bob")).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].user_id, "bob");
    }

    #[tokio::test]
    async fn reannouncing_a_foreign_upload_is_not_found() {
        let f = fixture().await;
        let mine = f
            .orchestrator
            .request_upload(&alice(), upload("a.png"), &correlation(&f.ids, None))
            .await
            .unwrap();

        let bob = PrincipalContext::new("bob", "Bob", vec![]);
        let again = NewUpload::validate(Some(mine.file_id.clone()), "a.png", "image/png", 1).unwrap();
        let err = f
            .orchestrator
            .request_upload(&bob, again, &correlation(&f.ids, None))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Domain(DomainError::NotFound)));
        assert_eq!(f.broker.queue_depth("q.upload.commands"), 1);
    }

    fn shared_upload(file_id: &str) -> NewUpload {
        NewUpload::validate(Some(file_id.into()), "a.png", "image/png", 1).unwrap()
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_file_id_have_a_single_winner() {
        let f = fixture().await;
        let alice = alice();
        let bob = PrincipalContext::new("bob", "Bob", vec![]);
        let (alice_corr, bob_corr) = (correlation(&f.ids, None), correlation(&f.ids, None));
        f.broker.set_backpressure(true);

        let release = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            f.broker.set_backpressure(false);
        };
        let (from_alice, from_bob, ()) = tokio::join!(
            f.orchestrator.request_upload(&alice, shared_upload("shared"), &alice_corr),
            f.orchestrator.request_upload(&bob, shared_upload("shared"), &bob_corr),
            release,
        );

        let winner = match (&from_alice, &from_bob) {
            (Ok(_), Err(UploadError::Domain(DomainError::NotFound))) => "alice",
            (Err(UploadError::Domain(DomainError::NotFound)), Ok(_)) => "bob",
            other => panic!("expected exactly one accepted request, got {other:?}"),
        };
        let record = f.store.get_by_id("shared").unwrap().unwrap();
        assert_eq!(record.user_id, winner);
        assert_eq!(record.timeline.len(), 1);
        assert_eq!(f.broker.queue_depth("q.upload.commands"), 1);
    }

    #[tokio::test]
    async fn admin_is_told_about_a_request_in_flight() {
        let f = fixture().await;
        let (alice, root) = (alice(), admin());
        let (alice_corr, root_corr) = (correlation(&f.ids, None), correlation(&f.ids, None));
        f.broker.set_backpressure(true);

        let from_admin = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let result = f.orchestrator.request_upload(&root, shared_upload("f-new"), &root_corr).await;
            f.broker.set_backpressure(false);
            result
        };
        let (from_alice, from_admin) = tokio::join!(
            f.orchestrator.request_upload(&alice, shared_upload("f-new"), &alice_corr),
            from_admin,
        );

        assert!(from_alice.is_ok());
        assert!(matches!(from_admin, Err(UploadError::Domain(DomainError::Conflict(_)))));
        assert_eq!(f.store.get_by_id("f-new").unwrap().unwrap().user_id, "alice");
    }

    #[tokio::test]
    async fn failed_request_releases_its_file_id() {
        let f = fixture().await;
        let bob = PrincipalContext::new("bob", "Bob", vec![]);
        f.broker.hold_confirms(true);
        let err = f
            .orchestrator
            .request_upload(&alice(), shared_upload("f-retry"), &correlation(&f.ids, None))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Publish(PublishError::Delivery(_))));

        f.broker.hold_confirms(false);
        let accepted = f
            .orchestrator
            .request_upload(&bob, shared_upload("f-retry"), &correlation(&f.ids, None))
            .await
            .unwrap();
        assert_eq!(accepted.file_id, "f-retry");
        assert_eq!(f.store.get_by_id("f-retry").unwrap().unwrap().user_id, "bob");
    }

    #[tokio::test]
    async fn admin_reannounce_keeps_the_original_owner() {
        let f = fixture().await;
        let mine = f
            .orchestrator
            .request_upload(&alice(), upload("a.png"), &correlation(&f.ids, None))
            .await
            .unwrap();

        let again = NewUpload::validate(Some(mine.file_id.clone()), "b.png", "image/png", 7).unwrap();
        f.orchestrator
            .request_upload(&admin(), again, &correlation(&f.ids, None))
            .await
            .unwrap();

        let record = f.orchestrator.upload_status(&alice(), &mine.file_id).unwrap();
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.user_name, "Alice");
        assert_eq!(record.file_name, "b.png");
        assert_eq!(record.timeline.len(), 2);
        assert_eq!(f.orchestrator.list_uploads(&alice(), None).unwrap().len(), 1);
    }
}
