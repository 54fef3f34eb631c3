//! Bitbucket Cloud discovery over the 2.0 REST API.
//!
//! Org pages come from `/repositories/{org}`; branch listings come from
//! `/repositories/{org}/{repo}/refs/branches`. Both paginate with a `page`
//! query parameter, which is what the cursors carry.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{BranchCache, DiscoveryRequest, Provider, ProviderPage, RepoListing, is_rate_limit_message};
use crate::errors::ProviderError;

const BRANCH_PATH: &str = "/refs/branches/";

#[derive(Debug, Deserialize)]
struct Paged<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BbRepo {
    slug: String,
    #[serde(default)]
    is_private: bool,
    mainbranch: Option<BbBranch>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BbBranch {
    #[serde(default)]
    name: String,
    #[serde(default)]
    links: Option<Value>,
}

impl BbBranch {
    /// Names may be truncated in listings; the self link carries the full ref.
    fn full_name(&self) -> String {
        self.links
            .as_ref()
            .and_then(|l| l.pointer("/self/href"))
            .and_then(Value::as_str)
            .and_then(|href| href.split_once(BRANCH_PATH))
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| self.name.clone())
    }
}

impl BbRepo {
    fn listing(self) -> RepoListing {
        RepoListing {
            name: self.slug,
            default_branch: self.mainbranch.map(|b| b.name),
            is_private: self.is_private,
            // Bitbucket reports no mainbranch for repositories without commits.
            is_empty: self.size == Some(0),
            branches: Vec::new(),
            branch_cursor: None,
        }
    }
}

/// The `page` parameter of a pagination link.
fn page_param(next: &str) -> Option<String> {
    let url = reqwest::Url::parse(next).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "page")
        .map(|(_, v)| v.into_owned())
}

pub struct BitbucketProvider {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    cache: Arc<BranchCache>,
}

impl BitbucketProvider {
    pub fn new(client: reqwest::Client, url: &str, token: Option<String>) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            token,
            cache: Arc::new(BranchCache::default()),
        }
    }

    pub fn cache(&self) -> Arc<BranchCache> {
        self.cache.clone()
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, ProviderError> {
        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Basic {}", token));
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Transport(e)
            }
        })?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(ProviderError::Transport)?;

        match status {
            200 => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| ProviderError::Decode(e.to_string())),
            404 => Ok(None),
            429 => Err(ProviderError::RateLimited(text)),
            _ => {
                let message = serde_json::from_str::<Value>(&text)
                    .ok()
                    .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or(text);
                if is_rate_limit_message(&message) {
                    Err(ProviderError::RateLimited(message))
                } else {
                    Err(ProviderError::Http { status, body: message })
                }
            }
        }
    }

    async fn org_page(&self, request: &DiscoveryRequest) -> Result<ProviderPage, ProviderError> {
        let page = request.page.cursor.as_deref().unwrap_or("1");
        let url = format!("{}/repositories/{}?page={}", self.url, request.org, page);
        let listing: Paged<BbRepo> = self
            .get(&url)
            .await?
            .ok_or_else(|| ProviderError::Decode(format!("workspace {} not found", request.org)))?;
        Ok(ProviderPage {
            next_cursor: listing.next.as_deref().and_then(page_param),
            repos: listing.values.into_iter().map(BbRepo::listing).collect(),
        })
    }

    async fn repo_page(
        &self,
        request: &DiscoveryRequest,
        repo: &str,
    ) -> Result<ProviderPage, ProviderError> {
        let repo_url = format!("{}/repositories/{}/{}", self.url, request.org, repo);
        let page = request.page.branch_cursor.as_deref().unwrap_or("1");
        let branches_url = format!("{}/refs/branches?page={}", repo_url, page);

        let Some(meta) = self.get::<BbRepo>(&repo_url).await? else {
            self.cache.invalidate(&branches_url);
            return Ok(ProviderPage::default());
        };
        let mut listing = meta.listing();

        let (branches, next) = match self.cache.get(&branches_url) {
            Some(hit) => hit,
            None => {
                let paged: Paged<BbBranch> = self.get(&branches_url).await?.unwrap_or(Paged {
                    values: Vec::new(),
                    next: None,
                });
                let branches: Vec<String> = paged.values.iter().map(BbBranch::full_name).collect();
                let next = paged.next.as_deref().and_then(page_param);
                self.cache.insert(&branches_url, branches.clone(), next.clone());
                (branches, next)
            }
        };
        listing.branches = branches;
        listing.branch_cursor = next;
        Ok(ProviderPage {
            repos: vec![listing],
            next_cursor: None,
        })
    }
}

#[async_trait]
impl Provider for BitbucketProvider {
    async fn list_page(&self, request: &DiscoveryRequest) -> Result<ProviderPage, ProviderError> {
        match &request.repo {
            Some(repo) => self.repo_page(request, repo).await,
            None => self.org_page(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Json;
    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use serde_json::json;

    use super::*;

    async fn serve(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_page_param_from_next_link() {
        assert_eq!(
            page_param("https://api.bitbucket.org/2.0/repositories/acme?page=3&pagelen=10"),
            Some("3".to_string())
        );
        assert_eq!(page_param("not a url"), None);
    }

    #[test]
    fn test_branch_name_from_self_link() {
        let branch: BbBranch = serde_json::from_value(json!({
            "name": "feature/lo",
            "links": {"self": {"href": "https://x/2.0/repositories/acme/api/refs/branches/feature/long-name"}}
        }))
        .unwrap();
        assert_eq!(branch.full_name(), "feature/long-name");

        let bare: BbBranch = serde_json::from_value(json!({"name": "dev"})).unwrap();
        assert_eq!(bare.full_name(), "dev");
    }

    #[tokio::test]
    async fn test_org_page_uses_page_cursor() {
        let app = axum::Router::new().route(
            "/repositories/{org}",
            get(
                |Path(org): Path<String>,
                 Query(q): Query<std::collections::HashMap<String, String>>,
                 headers: HeaderMap| async move {
                    assert_eq!(org, "acme");
                    assert_eq!(headers.get("authorization").unwrap(), "Basic dXNlcjpwdw==");
                    assert_eq!(q.get("page").map(String::as_str), Some("2"));
                    Json(json!({
                        "values": [
                            {"slug": "api", "is_private": true, "mainbranch": {"name": "master"}},
                            {"slug": "blank", "is_private": true, "mainbranch": null, "size": 0}
                        ],
                        "next": "https://api.bitbucket.org/2.0/repositories/acme?page=3"
                    }))
                },
            ),
        );
        let url = serve(app).await;
        let provider = BitbucketProvider::new(reqwest::Client::new(), &url, Some("dXNlcjpwdw==".into()));

        let page = provider
            .list_page(&DiscoveryRequest::org("bitbucket", "acme").next_page("2"))
            .await
            .unwrap();

        assert_eq!(page.next_cursor.as_deref(), Some("3"));
        assert_eq!(page.repos[0].default_branch.as_deref(), Some("master"));
        assert!(page.repos[1].is_empty);
    }

    #[tokio::test]
    async fn test_branch_pages_are_cached() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = axum::Router::new()
            .route(
                "/repositories/{org}/{repo}",
                get(|| async { Json(json!({"slug": "api", "is_private": true, "mainbranch": {"name": "master"}})) }),
            )
            .route(
                "/repositories/{org}/{repo}/refs/branches",
                get(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Json(json!({
                            "values": [{"name": "master"}, {"name": "dev"}],
                            "next": "https://api.bitbucket.org/2.0/x/refs/branches?page=2"
                        }))
                    }
                }),
            );
        let url = serve(app).await;
        let provider = BitbucketProvider::new(reqwest::Client::new(), &url, None);
        let request = DiscoveryRequest::org("bitbucket", "acme").for_repo("api");

        let first = provider.list_page(&request).await.unwrap();
        let second = provider.list_page(&request).await.unwrap();

        assert_eq!(first.repos[0].branches, vec!["master", "dev"]);
        assert_eq!(first.repos[0].branch_cursor.as_deref(), Some("2"));
        assert_eq!(second.repos[0].branches, first.repos[0].branches);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(provider.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_repo_yields_empty_page() {
        let app = axum::Router::new().route(
            "/repositories/{org}/{repo}",
            get(|| async { (StatusCode::NOT_FOUND, Json(json!({"error": {"message": "gone"}}))) }),
        );
        let url = serve(app).await;
        let provider = BitbucketProvider::new(reqwest::Client::new(), &url, None);

        let page = provider
            .list_page(&DiscoveryRequest::org("bitbucket", "acme").for_repo("old"))
            .await
            .unwrap();
        assert!(page.repos.is_empty());
    }

    #[tokio::test]
    async fn test_throttling_is_rate_limited() {
        let app = axum::Router::new()
            .route(
                "/repositories/{org}",
                get(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
            )
            .route(
                "/repositories/{org}/{repo}",
                get(|| async {
                    (
                        StatusCode::FORBIDDEN,
                        Json(json!({"error": {"message": "Rate limit for this resource has been exceeded"}})),
                    )
                }),
            );
        let url = serve(app).await;
        let provider = BitbucketProvider::new(reqwest::Client::new(), &url, None);

        let org = provider
            .list_page(&DiscoveryRequest::org("bitbucket", "acme"))
            .await
            .unwrap_err();
        assert!(org.is_rate_limited());

        let repo = provider
            .list_page(&DiscoveryRequest::org("bitbucket", "acme").for_repo("api"))
            .await
            .unwrap_err();
        assert!(repo.is_rate_limited());
    }

    #[tokio::test]
    async fn test_server_error_is_http() {
        let app = axum::Router::new().route(
            "/repositories/{org}",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": {"message": "boom"}}))) }),
        );
        let url = serve(app).await;
        let provider = BitbucketProvider::new(reqwest::Client::new(), &url, None);

        let err = provider
            .list_page(&DiscoveryRequest::org("bitbucket", "acme"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Http { status: 500, ref body } if body == "boom"));
    }
}
