//! Queue Dispatch Consumer: drains scan requests from the repo queue and
//! its dead-letter queue, submits them to the admission API one batch per
//! service, and settles every message as admitted, requeued or dropped.
//!
//! A message is acknowledged only once its outcome is durable. Requeues
//! that fail, and admissions whose tracking records could not be written,
//! leave their source messages in flight so the transport redelivers them
//! after the visibility timeout.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scanfleet_common::ScanRequest;
use tracing::Instrument;

use crate::config::{DispatchSection, QueuesSection};
use crate::errors::DispatchError;
use crate::queue::{MAX_BATCH, QueueTransport, delete_all, send_json_batches};
use crate::store::{DbHandle, ScanRecord};

pub mod admission;

pub use admission::{
    AdmissionApi, AdmissionItem, AdmissionOutcome, AdmissionResponse, FailedItem, HttpAdmissionApi,
};

/// Error text meaning the ref no longer exists upstream. Matched
/// case-insensitively; such requests can never succeed.
const DELETED_REF_PHRASES: [&str; 2] = ["could not resolve to a repository", "branch not found"];

const HEAD: &str = "HEAD";

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub source_queue: String,
    /// Dead-letter queue. Retryable failures go here and are drained after
    /// the source queue on later passes.
    pub requeue_queue: String,
    pub default_plugins: Vec<String>,
    pub scan_record_ttl: chrono::Duration,
    pub receive_wait: Duration,
}

impl DispatchConfig {
    pub fn from_sections(dispatch: &DispatchSection, queues: &QueuesSection) -> Self {
        Self {
            source_queue: queues.repo_queue.clone(),
            requeue_queue: queues.repo_dead_letter_queue.clone(),
            default_plugins: dispatch.default_plugins.clone(),
            scan_record_ttl: chrono::Duration::days(dispatch.scan_record_ttl_days),
            receive_wait: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionClass {
    Full,
    Partial,
    Timeout,
    Rejected,
}

/// What happened to one service's batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceOutcome {
    pub service: String,
    pub class: AdmissionClass,
    pub submitted: usize,
    pub accepted: Vec<ScanRecord>,
    pub requeued: usize,
    pub dropped: usize,
    /// Messages left unacknowledged because their outcome is not durable.
    pub unsettled: usize,
}

impl ServiceOutcome {
    fn new(service: &str, class: AdmissionClass, submitted: usize) -> Self {
        Self {
            service: service.to_string(),
            class,
            submitted,
            accepted: Vec::new(),
            requeued: 0,
            dropped: 0,
            unsettled: 0,
        }
    }
}

/// A parsed message still waiting for its outcome.
struct Pending {
    request: ScanRequest,
    queue: String,
    receipt: String,
}

/// How the admission response sorted a service batch.
#[derive(Default)]
struct Split {
    admitted: Vec<Pending>,
    dropped: Vec<Pending>,
    retry: Vec<Pending>,
}

pub struct DispatchConsumer {
    config: DispatchConfig,
    transport: Arc<dyn QueueTransport>,
    api: Arc<dyn AdmissionApi>,
    db: DbHandle,
}

impl DispatchConsumer {
    pub fn new(
        config: DispatchConfig,
        transport: Arc<dyn QueueTransport>,
        api: Arc<dyn AdmissionApi>,
        db: DbHandle,
    ) -> Self {
        Self {
            config,
            transport,
            api,
            db,
        }
    }

    /// Pull up to roughly `target` requests and settle them. The source
    /// queue is read first and the dead-letter queue fills what is left.
    pub async fn drain(&self, target: usize) -> Result<Vec<ServiceOutcome>, DispatchError> {
        let mut pending: Vec<Pending> = Vec::new();
        for queue in [&self.config.source_queue, &self.config.requeue_queue] {
            if pending.len() >= target {
                break;
            }
            if self.transport.depth(queue).await? == 0 {
                tracing::debug!(queue = %queue, "queue empty, nothing to dispatch");
                continue;
            }
            self.receive_from(queue, target, &mut pending).await?;
        }
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_service: BTreeMap<String, Vec<Pending>> = BTreeMap::new();
        for p in pending {
            by_service
                .entry(p.request.service.clone())
                .or_default()
                .push(p);
        }

        let mut outcomes = Vec::with_capacity(by_service.len());
        for (service, batch) in by_service {
            let span = tracing::info_span!("dispatch", service = %service);
            outcomes.push(
                self.dispatch_service(&service, batch)
                    .instrument(span)
                    .await?,
            );
        }
        Ok(outcomes)
    }

    async fn receive_from(
        &self,
        queue: &str,
        target: usize,
        pending: &mut Vec<Pending>,
    ) -> Result<(), DispatchError> {
        let mut malformed = Vec::new();
        while pending.len() < target {
            let messages = self
                .transport
                .receive(queue, MAX_BATCH, self.config.receive_wait)
                .await?;
            if messages.is_empty() {
                break;
            }
            tracing::info!(queue, count = messages.len(), "received scan requests");
            for message in messages {
                match parse_request(&message.body) {
                    Some(request) => pending.push(Pending {
                        request,
                        queue: queue.to_string(),
                        receipt: message.receipt,
                    }),
                    None => {
                        tracing::error!(body = %message.body, "malformed scan request, dropping");
                        malformed.push(message.receipt);
                    }
                }
            }
        }
        if !malformed.is_empty() {
            delete_all(self.transport.as_ref(), queue, malformed).await?;
        }
        Ok(())
    }

    async fn dispatch_service(
        &self,
        service: &str,
        batch: Vec<Pending>,
    ) -> Result<ServiceOutcome, DispatchError> {
        let items: Vec<AdmissionItem> = batch.iter().map(|p| self.admission_item(&p.request)).collect();
        tracing::info!(service, count = items.len(), "submitting repos");

        let outcome = self.api.submit(service, &items).await;
        let (class, response) = match outcome {
            AdmissionOutcome::Full(resp) => (AdmissionClass::Full, Some(resp)),
            AdmissionOutcome::Partial(resp) => (AdmissionClass::Partial, Some(resp)),
            AdmissionOutcome::Timeout => (AdmissionClass::Timeout, None),
            AdmissionOutcome::Rejected(e) => {
                tracing::error!(service, error = %e, "admission rejected batch, dropping");
                (AdmissionClass::Rejected, None)
            }
        };
        let mut result = ServiceOutcome::new(service, class, batch.len());

        let mut ack: Vec<Pending> = Vec::new();
        let mut requeue = Vec::new();
        match (class, response) {
            (AdmissionClass::Timeout, _) => {
                tracing::warn!(service, count = batch.len(), "admission timed out, requeuing batch");
                requeue = batch;
            }
            (_, Some(resp)) => {
                if !resp.unauthorized.is_empty() {
                    tracing::warn!(service, unauthorized = ?resp.unauthorized, "unauthorized repos dropped");
                }
                let split = split_failed(batch, &resp.failed);
                result.dropped = split.dropped.len();
                ack.extend(split.dropped);
                requeue = split.retry;
                match self.record_accepted(service, &resp.queued).await {
                    Ok(records) => {
                        result.accepted = records;
                        ack.extend(split.admitted);
                    }
                    Err(e) => {
                        tracing::error!(
                            service,
                            count = split.admitted.len(),
                            error = %format!("{:#}", e),
                            "unable to record accepted scans, leaving messages for redelivery"
                        );
                        result.unsettled += split.admitted.len();
                    }
                }
            }
            (_, None) => {
                result.dropped = batch.len();
                ack.extend(batch);
            }
        }

        if !requeue.is_empty() {
            let requests: Vec<&ScanRequest> = requeue.iter().map(|p| &p.request).collect();
            let delivered = match send_json_batches(
                self.transport.as_ref(),
                &self.config.requeue_queue,
                &requests,
            )
            .await
            {
                Ok(delivered) => delivered,
                Err((delivered, e)) => {
                    tracing::error!(
                        service,
                        sent = delivered.len(),
                        remaining = requests.len() - delivered.len(),
                        error = %e,
                        "error re-queueing repos, aborting"
                    );
                    delivered
                }
            };
            tracing::info!(service, count = delivered.len(), "re-queued repos");
            result.requeued = delivered.len();
            result.unsettled += requeue.len() - delivered.len();
            ack.extend(
                requeue
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| delivered.contains(i))
                    .map(|(_, p)| p),
            );
        }

        self.acknowledge(ack).await?;
        Ok(result)
    }

    /// Delete settled messages from whichever queue delivered them.
    async fn acknowledge(&self, settled: Vec<Pending>) -> Result<(), DispatchError> {
        let mut by_queue: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for p in settled {
            by_queue.entry(p.queue).or_default().push(p.receipt);
        }
        for (queue, receipts) in by_queue {
            delete_all(self.transport.as_ref(), &queue, receipts).await?;
        }
        Ok(())
    }

    fn admission_item(&self, request: &ScanRequest) -> AdmissionItem {
        AdmissionItem {
            repo: request.repo.clone(),
            org: request.org.clone(),
            plugins: request
                .plugins
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| self.config.default_plugins.clone()),
            batch_priority: true,
            batch_id: request.batch_id.clone(),
            branch: request.branch.clone().filter(|b| b != HEAD),
        }
    }

    /// Persist tracking records for accepted `org/repo/scan-id` entries.
    async fn record_accepted(
        &self,
        service: &str,
        queued: &[String],
    ) -> anyhow::Result<Vec<ScanRecord>> {
        let now = Utc::now();
        let records: Vec<ScanRecord> = queued
            .iter()
            .filter_map(|id| {
                let (repo, scan_id) = id.rsplit_once('/')?;
                Some(ScanRecord {
                    scan_id: scan_id.to_string(),
                    service: service.to_string(),
                    repo: repo.to_string(),
                    create_date: now,
                    expires: now + self.config.scan_record_ttl,
                })
            })
            .collect();
        if records.is_empty() {
            return Ok(records);
        }
        let rows = records.clone();
        self.db
            .call(move |db| {
                for record in &rows {
                    db.record_scan(record)?;
                }
                Ok(())
            })
            .await?;
        Ok(records)
    }
}

fn parse_request(body: &str) -> Option<ScanRequest> {
    serde_json::from_str::<ScanRequest>(body)
        .ok()
        .filter(ScanRequest::is_valid)
}

fn is_deleted_ref(error: &str) -> bool {
    let error = error.to_lowercase();
    DELETED_REF_PHRASES.iter().any(|p| error.contains(p))
}

/// Match failed entries to their requests. Each failed entry claims the
/// first unclaimed request with the same `org/repo`. Requests no failed
/// entry claims count as admitted.
fn split_failed(batch: Vec<Pending>, failed: &[FailedItem]) -> Split {
    let mut slots: Vec<Option<Pending>> = batch.into_iter().map(Some).collect();
    let mut split = Split::default();

    for item in failed {
        let key = item.repo.to_lowercase();
        let Some(slot) = slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|p| p.request.key() == key))
        else {
            tracing::warn!(repo = %item.repo, error = %item.error, "failed entry matches no submitted request");
            continue;
        };
        let Some(p) = slot.take() else {
            continue;
        };
        if is_deleted_ref(&item.error) {
            tracing::info!(repo = %item.repo, error = %item.error, "ref deleted upstream, dropping");
            split.dropped.push(p);
        } else {
            if item.error.starts_with("Rate limit") {
                tracing::info!(repo = %item.repo, "rate limited, re-queueing");
            } else {
                tracing::warn!(repo = %item.repo, error = %item.error, "admission failed, re-queueing");
            }
            split.retry.push(p);
        }
    }

    split.admitted = slots.into_iter().flatten().collect();
    split
}
