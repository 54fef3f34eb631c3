//! Discovery Producers: page through a provider's repositories and
//! branches and turn them into scan requests on the repo queue.
//!
//! Every invocation handles one page. Continuations (next repo page, next
//! branch page, per-repo branch listing) go back onto the discovery queue
//! so no invocation waits on a provider for more than one call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scanfleet_common::ScanRequest;
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::{DiscoverySection, QueuesSection, ServiceConfig, ServiceType};
use crate::errors::{ProviderError, QueueError};
use crate::queue::{MAX_BATCH, QueueTransport, delete_all, send_json_batches};

pub mod bitbucket;
pub mod github;
pub mod gitlab;

pub use bitbucket::BitbucketProvider;
pub use github::GithubProvider;
pub use gitlab::GitlabProvider;

const RATE_LIMIT_PHRASES: [&str; 3] = [
    "abuse detection",
    "rate limit",
    "please wait a few minutes before you try again.",
];

/// Whether a provider error message signals throttling.
pub fn is_rate_limit_message(message: &str) -> bool {
    let message = message.to_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|p| message.contains(p))
}

/// Some producers wrote the literal strings "null"/"None" for an absent cursor.
fn cursor<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    let raw = Option::<String>::deserialize(de)?;
    Ok(raw.filter(|c| !matches!(c.as_str(), "" | "null" | "None")))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PageCursor {
    #[serde(default, deserialize_with = "cursor")]
    pub cursor: Option<String>,
    #[serde(default, deserialize_with = "cursor")]
    pub branch_cursor: Option<String>,
}

/// One unit of discovery work, as carried on the discovery queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryRequest {
    pub service: String,
    pub org: String,
    /// Set for per-repo branch listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default)]
    pub page: PageCursor,
    #[serde(default)]
    pub default_branch_only: bool,
    #[serde(default)]
    pub plugins: Option<Vec<String>>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

impl DiscoveryRequest {
    pub fn org(service: &str, org: &str) -> Self {
        Self {
            service: service.to_string(),
            org: org.to_string(),
            repo: None,
            page: PageCursor::default(),
            default_branch_only: false,
            plugins: None,
            batch_id: None,
        }
    }

    pub fn next_page(&self, cursor: &str) -> Self {
        Self {
            page: PageCursor {
                cursor: Some(cursor.to_string()),
                branch_cursor: None,
            },
            ..self.clone()
        }
    }

    pub fn for_repo(&self, repo: &str) -> Self {
        Self {
            repo: Some(repo.to_string()),
            page: PageCursor::default(),
            ..self.clone()
        }
    }

    pub fn next_branch_page(&self, cursor: &str) -> Self {
        Self {
            page: PageCursor {
                cursor: None,
                branch_cursor: Some(cursor.to_string()),
            },
            ..self.clone()
        }
    }
}

/// A repository as listed by a provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoListing {
    pub name: String,
    pub default_branch: Option<String>,
    pub is_private: bool,
    pub is_empty: bool,
    /// Branches on this page; only filled for per-repo requests.
    pub branches: Vec<String>,
    pub branch_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderPage {
    pub repos: Vec<RepoListing>,
    pub next_cursor: Option<String>,
}

/// Abstraction over a version-control provider for testability.
/// Real implementations: `GithubProvider`, `GitlabProvider`, `BitbucketProvider`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// One page of repos, or for a per-repo request one page of its branches.
    async fn list_page(&self, request: &DiscoveryRequest) -> Result<ProviderPage, ProviderError>;
}

/// Branch pages by URL, shared across the requests a provider serves.
#[derive(Default)]
pub struct BranchCache {
    entries: Mutex<HashMap<String, (Vec<String>, Option<String>)>>,
}

impl BranchCache {
    pub fn get(&self, url: &str) -> Option<(Vec<String>, Option<String>)> {
        self.entries.lock().ok()?.get(url).cloned()
    }

    pub fn insert(&self, url: &str, branches: Vec<String>, next: Option<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(url.to_string(), (branches, next));
        }
    }

    pub fn invalidate(&self, url: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(url);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the provider for a configured service.
pub fn provider_for(
    service: &ServiceConfig,
    timeout: Duration,
    page_size: u32,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent("scanfleet")
        .build()
        .map_err(ProviderError::Transport)?;
    Ok(match service.kind {
        ServiceType::Github => Arc::new(GithubProvider::new(
            client,
            &service.url,
            service.token(),
            page_size,
        )),
        ServiceType::Gitlab => Arc::new(GitlabProvider::new(
            client,
            &service.url,
            service.branch_url.as_deref(),
            service.token(),
            page_size,
        )),
        ServiceType::Bitbucket => {
            Arc::new(BitbucketProvider::new(client, &service.url, service.token()))
        }
    })
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub discovery_queue: String,
    pub repo_queue: String,
    pub external_orgs: Vec<String>,
    pub default_plugins: Vec<String>,
    pub receive_wait: Duration,
    /// Visibility delay on a request requeued after throttling.
    pub throttle_delay: Duration,
}

impl DiscoveryConfig {
    pub fn from_sections(discovery: &DiscoverySection, queues: &QueuesSection) -> Self {
        Self {
            discovery_queue: queues.org_queue.clone(),
            repo_queue: queues.repo_queue.clone(),
            external_orgs: discovery.external_orgs.clone(),
            default_plugins: discovery.default_plugins.clone(),
            receive_wait: Duration::from_secs(1),
            throttle_delay: Duration::from_secs(discovery.throttle_delay_secs),
        }
    }

    fn is_external(&self, service: &str, org: &str) -> bool {
        let key = format!("{}/{}", service, org);
        self.external_orgs.iter().any(|o| o == &key)
    }
}

/// What one discovery request produced.
#[derive(Debug)]
pub enum PageResult {
    Emitted {
        requests: usize,
        continuations: usize,
    },
    /// The provider throttled us; the request went back on the queue as-is.
    Throttled,
    /// Non-retryable provider failure. Nothing was emitted.
    Failed(ProviderError),
}

pub struct Discoverer {
    config: DiscoveryConfig,
    transport: Arc<dyn QueueTransport>,
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl Discoverer {
    pub fn new(
        config: DiscoveryConfig,
        transport: Arc<dyn QueueTransport>,
        providers: HashMap<String, Arc<dyn Provider>>,
    ) -> Self {
        Self {
            config,
            transport,
            providers,
        }
    }

    /// Put a fresh org-level request on the discovery queue.
    pub async fn enqueue(&self, request: &DiscoveryRequest) -> Result<(), QueueError> {
        let body = serde_json::to_string(request)?;
        self.transport
            .send(&self.config.discovery_queue, body)
            .await?;
        tracing::info!(service = %request.service, org = %request.org, "queued org for discovery");
        Ok(())
    }

    /// Handle up to `max` discovery messages. Returns how many were settled.
    ///
    /// Once a service throttles, its remaining requests in this pass are
    /// deferred without calling the provider again.
    pub async fn process_queue(&self, max: usize) -> Result<usize, QueueError> {
        let queue = &self.config.discovery_queue;
        let mut settled = 0;
        let mut throttled: HashSet<String> = HashSet::new();
        while settled < max {
            let messages = self
                .transport
                .receive(queue, (max - settled).min(MAX_BATCH), self.config.receive_wait)
                .await?;
            if messages.is_empty() {
                break;
            }
            let mut ack = Vec::new();
            for message in messages {
                let request: DiscoveryRequest = match serde_json::from_str(&message.body) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::error!(body = %message.body, error = %e, "malformed discovery request, dropping");
                        ack.push(message.receipt);
                        continue;
                    }
                };
                if throttled.contains(&request.service) {
                    match self.defer(&request).await {
                        Ok(()) => ack.push(message.receipt),
                        Err(e) => {
                            tracing::error!(service = %request.service, error = %e, "unable to defer discovery request");
                        }
                    }
                    continue;
                }
                match self.discover(&request).await {
                    Ok(PageResult::Throttled) => {
                        throttled.insert(request.service.clone());
                        ack.push(message.receipt);
                    }
                    Ok(PageResult::Failed(e)) => {
                        tracing::error!(service = %request.service, org = %request.org, error = %e, "discovery failed");
                        ack.push(message.receipt);
                    }
                    Ok(_) => ack.push(message.receipt),
                    // Left in flight; redelivery retries the page.
                    Err(e) => {
                        tracing::error!(service = %request.service, org = %request.org, error = %e, "unable to queue discovery output");
                    }
                }
            }
            settled += ack.len();
            delete_all(self.transport.as_ref(), queue, ack).await?;
        }
        Ok(settled)
    }

    pub async fn discover(&self, request: &DiscoveryRequest) -> Result<PageResult, QueueError> {
        let Some(provider) = self.providers.get(&request.service) else {
            return Ok(PageResult::Failed(ProviderError::UnknownService(
                request.service.clone(),
            )));
        };
        match &request.repo {
            Some(repo) => tracing::info!(service = %request.service, org = %request.org, repo = %repo, cursor = ?request.page.branch_cursor, "listing branches"),
            None => tracing::info!(service = %request.service, org = %request.org, cursor = ?request.page.cursor, "listing repos"),
        }

        let page = match provider.list_page(request).await {
            Ok(page) => page,
            Err(e @ (ProviderError::RateLimited(_) | ProviderError::Timeout(_))) => {
                tracing::warn!(
                    error = %e,
                    delay_secs = self.config.throttle_delay.as_secs(),
                    "provider throttled, re-queueing request unchanged"
                );
                self.defer(request).await?;
                return Ok(PageResult::Throttled);
            }
            Err(e) => return Ok(PageResult::Failed(e)),
        };

        let (requests, follow_ups) = self.expand(request, page);
        send_json_batches(self.transport.as_ref(), &self.config.repo_queue, &requests)
            .await
            .map_err(|(_, e)| e)?;
        send_json_batches(
            self.transport.as_ref(),
            &self.config.discovery_queue,
            &follow_ups,
        )
        .await
        .map_err(|(_, e)| e)?;
        tracing::info!(
            requests = requests.len(),
            continuations = follow_ups.len(),
            "queued repos and branches"
        );
        Ok(PageResult::Emitted {
            requests: requests.len(),
            continuations: follow_ups.len(),
        })
    }

    /// Put a request back on the discovery queue, hidden for the throttle delay.
    async fn defer(&self, request: &DiscoveryRequest) -> Result<(), QueueError> {
        let body = serde_json::to_string(request)?;
        self.transport
            .send_delayed(&self.config.discovery_queue, body, self.config.throttle_delay)
            .await
    }

    /// Turn a provider page into scan requests and follow-up discovery work.
    fn expand(
        &self,
        request: &DiscoveryRequest,
        page: ProviderPage,
    ) -> (Vec<ScanRequest>, Vec<DiscoveryRequest>) {
        let external = self.config.is_external(&request.service, &request.org);
        let plugins = request
            .plugins
            .clone()
            .unwrap_or_else(|| self.config.default_plugins.clone());
        let scan_request = |repo: &str| {
            ScanRequest::new(&request.service, &request.org, repo)
                .with_plugins(plugins.clone())
                .with_batch_id(request.batch_id.clone())
        };

        let mut requests = Vec::new();
        let mut follow_ups = Vec::new();
        for repo in page.repos {
            if external && !repo.is_private {
                tracing::info!(repo = %repo.name, "skipping public repo in external org");
                continue;
            }
            if repo.is_empty {
                tracing::warn!(repo = %repo.name, "repo has no branches, skipping");
                continue;
            }
            if request.default_branch_only {
                requests.push(scan_request(&repo.name));
                continue;
            }
            if request.repo.is_none() {
                follow_ups.push(request.for_repo(&repo.name));
                continue;
            }
            if repo.branches.is_empty() && repo.branch_cursor.is_none() {
                tracing::warn!(repo = %repo.name, "no resolvable branches, skipping");
                continue;
            }
            for branch in &repo.branches {
                if repo.default_branch.as_deref() == Some(branch.as_str()) {
                    requests.push(scan_request(&repo.name));
                } else {
                    requests.push(scan_request(&repo.name).with_branch(branch));
                }
            }
            if let Some(cursor) = &repo.branch_cursor {
                tracing::info!(repo = %repo.name, cursor = %cursor, "queueing next page of branches");
                follow_ups.push(request.next_branch_page(cursor));
            }
        }

        if request.repo.is_none()
            && let Some(cursor) = &page.next_cursor
        {
            tracing::info!(org = %request.org, cursor = %cursor, "queueing next page of repos");
            follow_ups.push(request.next_page(cursor));
        }
        (requests, follow_ups)
    }
}
