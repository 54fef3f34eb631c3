//! Outbound event stream.
//!
//! Events go to a restricted queue, never the primary datastore. Publishing
//! is best effort: a failed send is logged and the scan carries on.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use scanfleet_common::{AllowListItem, PluginDetails, PluginKind, PluginResult, Scan};
use serde_json::{Map, Value, json};

use crate::config::EventsSection;
use crate::errors::QueueError;
use crate::plugin::secrets;
use crate::queue::QueueTransport;

const SECRETS_TAB_INDEX: u32 = 3;

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, payload: Value) -> Result<(), QueueError>;
}

/// Sink that writes each event as one message on a queue.
pub struct QueueEventSink {
    transport: Arc<dyn QueueTransport>,
    queue: String,
}

impl QueueEventSink {
    pub fn new(transport: Arc<dyn QueueTransport>, queue: &str) -> Self {
        Self {
            transport,
            queue: queue.to_string(),
        }
    }
}

#[async_trait]
impl EventSink for QueueEventSink {
    async fn publish(&self, payload: Value) -> Result<(), QueueError> {
        let body = serde_json::to_string(&payload)?;
        self.transport.send(&self.queue, body).await
    }
}

/// ISO-8601 UTC timestamp with microseconds.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Builds event payloads and sends those whose kind is enabled.
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
    flags: EventsSection,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>, flags: EventsSection) -> Self {
        Self { sink, flags }
    }

    pub fn flags(&self) -> &EventsSection {
        &self.flags
    }

    pub fn report_url(&self, scan: &Scan) -> Option<String> {
        self.flags.report_base_url.as_ref().map(|base| {
            format!(
                "{}/results?service={}&repo={}&id={}",
                base.trim_end_matches('/'),
                scan.service,
                scan.repo,
                scan.id
            )
        })
    }

    async fn send(&self, scan: &Scan, kind: &str, payload: Value) -> usize {
        tracing::info!(repo = %scan.repo, kind, "queuing event");
        match self.sink.publish(payload).await {
            Ok(()) => 1,
            Err(e) => {
                tracing::error!(repo = %scan.repo, kind, error = %e, "unable to queue event");
                0
            }
        }
    }

    /// Events derived from a plugin's `event_info`. Returns how many were sent.
    pub async fn plugin_result(
        &self,
        scan: &Scan,
        result: &PluginResult,
        secret_allowlist: &[AllowListItem],
    ) -> usize {
        let Some(event_info) = &result.event_info else {
            return 0;
        };
        let payloads = match result.kind {
            PluginKind::Secrets if self.flags.secrets => {
                if !self.flags.secrets_with_path_exclusions
                    && (!scan.include_paths.is_empty() || !scan.exclude_paths.is_empty())
                {
                    tracing::info!("skipping secrets events for scan with path rules");
                    return 0;
                }
                self.secret_payloads(scan, result, event_info, secret_allowlist)
            }
            PluginKind::Inventory if self.flags.inventory => vec![json!({
                "timestamp": timestamp(),
                "type": result.kind.as_str(),
                "service": scan.service,
                "repo": scan.repo,
                "branch": scan.branch,
                "details": event_info,
            })],
            PluginKind::Configuration if self.flags.configuration => {
                self.configuration_payloads(scan, result, event_info)
            }
            PluginKind::Vulnerability if self.flags.vulnerability => {
                self.vulnerability_payloads(scan, result, event_info)
            }
            _ => return 0,
        };

        let mut sent = 0;
        for payload in payloads {
            sent += self.send(scan, result.kind.as_str(), payload).await;
        }
        sent
    }

    fn secret_payloads(
        &self,
        scan: &Scan,
        result: &PluginResult,
        event_info: &Map<String, Value>,
        allowlist: &[AllowListItem],
    ) -> Vec<Value> {
        let PluginDetails::Secrets(details) = &result.details else {
            return Vec::new();
        };
        let (org, repository) = scan
            .repo
            .split_once('/')
            .unwrap_or((scan.repo.as_str(), scan.repo.as_str()));
        let ts = timestamp();
        secrets::publishable(details, allowlist)
            .into_iter()
            .map(|item| {
                let info = event_info.get(&item.id).cloned().unwrap_or(Value::Null);
                let secret_type = info
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or(item.secret_type.as_str())
                    .to_string();
                json!({
                    "timestamp": ts,
                    "type": "secrets",
                    "service": scan.service,
                    "repo": scan.repo,
                    "org": org,
                    "repository": repository,
                    "plugin": result.name,
                    "branch": scan.branch,
                    "filename": item.filename,
                    "line": item.line,
                    "commit": item.commit,
                    "author": item.author,
                    "author-timestamp": item.author_timestamp,
                    "created_at": item.created_at.clone().unwrap_or_else(|| item.author_timestamp.clone()),
                    "details": info,
                    "state": item.state.as_deref().unwrap_or("open"),
                    "validity": item.validity.as_deref().unwrap_or("unknown"),
                    "secret_type": secret_type,
                    "report_url": self.report_url(scan).map(|u| format!("{}&tab={}", u, SECRETS_TAB_INDEX)),
                })
            })
            .collect()
    }

    fn configuration_payloads(
        &self,
        scan: &Scan,
        result: &PluginResult,
        event_info: &Map<String, Value>,
    ) -> Vec<Value> {
        let PluginDetails::Configuration(checks) = &result.details else {
            return Vec::new();
        };
        let ts = timestamp();
        checks
            .iter()
            .filter(|c| !c.pass)
            .map(|c| {
                json!({
                    "timestamp": ts,
                    "type": "configuration",
                    "service": scan.service,
                    "repo": scan.repo,
                    "branch": scan.branch,
                    "details": event_info.get(&c.id).cloned().unwrap_or(Value::Null),
                    "report_url": self.report_url(scan),
                    "plugin_name": result.name,
                })
            })
            .collect()
    }

    fn vulnerability_payloads(
        &self,
        scan: &Scan,
        result: &PluginResult,
        event_info: &Map<String, Value>,
    ) -> Vec<Value> {
        let PluginDetails::Vulnerability(findings) = &result.details else {
            return Vec::new();
        };
        let ts = timestamp();
        findings
            .iter()
            .map(|f| {
                json!({
                    "timestamp": ts,
                    "type": "vulnerability",
                    "service": scan.service,
                    "repo": scan.repo,
                    "branch": scan.branch,
                    "details": event_info.get(&f.id).cloned().unwrap_or(Value::Null),
                    "report_url": self.report_url(scan),
                })
            })
            .collect()
    }

    /// Reconciled per-instance vulnerability events.
    pub async fn vulnerabilities(&self, scan: &Scan, details: Vec<Value>) -> usize {
        if !self.flags.vulnerability {
            return 0;
        }
        let ts = timestamp();
        let mut sent = 0;
        for item in details {
            let payload = json!({
                "timestamp": ts,
                "type": "vulnerability",
                "service": scan.service,
                "repo": scan.repo,
                "branch": scan.branch,
                "details": item,
                "report_url": self.report_url(scan),
            });
            sent += self.send(scan, "vulnerability", payload).await;
        }
        sent
    }

    pub async fn metadata(&self, scan: &Scan, application_metadata: Value) -> usize {
        if !self.flags.metadata {
            return 0;
        }
        let payload = json!({
            "repo": scan.repo,
            "type": "metadata",
            "timestamp": timestamp(),
            "application_metadata": application_metadata,
        });
        self.send(scan, "metadata", payload).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use scanfleet_common::{AllowListKind, PluginEnvelope, ScanTask};

    fn scan() -> Scan {
        let task: ScanTask = serde_json::from_value(json!({
            "scan_id": "s1", "repo": "acme/widgets", "branch": "main"
        }))
        .unwrap();
        task.to_scan()
    }

    fn result(kind: PluginKind, raw: Value) -> PluginResult {
        let env: PluginEnvelope = serde_json::from_value(raw).unwrap();
        PluginResult::from_envelope("p", kind, env).unwrap()
    }

    fn secrets() -> PluginResult {
        result(
            PluginKind::Secrets,
            json!({
                "success": true,
                "details": [
                    {"id": "a", "filename": "x", "line": 1, "commit": "c", "type": "aws", "author": "dev", "author-timestamp": "t"},
                    {"id": "b", "filename": "y", "line": 2, "commit": "c", "type": "aws", "author": "dev", "author-timestamp": "t"}
                ],
                "event_info": {"a": {"type": "aws", "match": "k1"}, "b": {"type": "aws", "match": "k2"}}
            }),
        )
    }

    #[tokio::test]
    async fn test_secret_events_respect_structured_allowlist() {
        let sink = Arc::new(RecordingSink::default());
        let publisher = EventPublisher::new(sink.clone(), all_enabled());
        let al = AllowListItem {
            kind: AllowListKind::Secret,
            value: json!({"filename": "x", "line": 1, "commit": "c"}),
            expires: None,
            reason: String::new(),
        };
        assert_eq!(publisher.plugin_result(&scan(), &secrets(), &[al]).await, 1);

        let events = sink.events.lock().unwrap();
        assert_eq!(events[0]["filename"], "y");
        assert_eq!(events[0]["org"], "acme");
        assert_eq!(events[0]["repository"], "widgets");
        assert_eq!(events[0]["state"], "open");
        assert_eq!(events[0]["created_at"], "t");
    }

    #[tokio::test]
    async fn test_secret_events_skipped_for_path_rules() {
        let sink = Arc::new(RecordingSink::default());
        let publisher = EventPublisher::new(sink.clone(), all_enabled());
        let mut scan = scan();
        scan.exclude_paths.push("vendor/".into());
        assert_eq!(publisher.plugin_result(&scan, &secrets(), &[]).await, 0);

        let mut flags = all_enabled();
        flags.secrets_with_path_exclusions = true;
        let publisher = EventPublisher::new(sink.clone(), flags);
        assert_eq!(publisher.plugin_result(&scan, &secrets(), &[]).await, 2);
    }

    #[tokio::test]
    async fn test_configuration_events_only_for_failures() {
        let sink = Arc::new(RecordingSink::default());
        let publisher = EventPublisher::new(sink.clone(), all_enabled());
        let res = result(
            PluginKind::Configuration,
            json!({
                "success": true,
                "details": [{"id": "r1", "pass": true}, {"id": "r2", "pass": false}],
                "event_info": {"r1": {}, "r2": {"rule": "r2"}}
            }),
        );
        assert_eq!(publisher.plugin_result(&scan(), &res, &[]).await, 1);
        assert_eq!(sink.events.lock().unwrap()[0]["details"]["rule"], "r2");
    }

    #[tokio::test]
    async fn test_disabled_kind_and_missing_event_info_emit_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let publisher = EventPublisher::new(sink.clone(), EventsSection::default());
        assert_eq!(publisher.plugin_result(&scan(), &secrets(), &[]).await, 0);

        let publisher = EventPublisher::new(sink.clone(), all_enabled());
        let plain = result(PluginKind::Inventory, json!({"success": true, "details": {}}));
        assert_eq!(publisher.plugin_result(&scan(), &plain, &[]).await, 0);
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_event_shape() {
        let sink = Arc::new(RecordingSink::default());
        let publisher = EventPublisher::new(sink.clone(), all_enabled());
        publisher.metadata(&scan(), json!({"owner": "team-a"})).await;
        let events = sink.events.lock().unwrap();
        assert_eq!(events[0]["type"], "metadata");
        assert_eq!(events[0]["application_metadata"]["owner"], "team-a");
    }
}
