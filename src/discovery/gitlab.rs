//! GitLab discovery.
//!
//! Group pages come from the GraphQL API and include subgroup projects, so a
//! repo name may carry a subgroup path (`team/api`). Branch listings use the
//! REST API, addressing the project by its URL-encoded full path and paging
//! with the `X-Next-Page` header.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{DiscoveryRequest, Provider, ProviderPage, RepoListing, is_rate_limit_message};
use crate::errors::ProviderError;

const PROJECT_QUERY: &str = r#"
query getProjects($org: ID!, $cursor: String, $first: Int!) {
    group(fullPath: $org) {
        projects(first: $first, after: $cursor, includeSubgroups: true) {
            nodes {
                fullPath
                visibility
                repository { rootRef empty }
            }
            pageInfo { endCursor hasNextPage }
        }
    }
}
"#;

#[derive(Debug, Deserialize)]
struct GqlResponse {
    data: Option<GqlData>,
}

#[derive(Debug, Deserialize)]
struct GqlData {
    group: Option<GqlGroup>,
}

#[derive(Debug, Deserialize)]
struct GqlGroup {
    projects: Connection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection {
    #[serde(default)]
    nodes: Vec<GqlProject>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlProject {
    full_path: String,
    #[serde(default)]
    visibility: String,
    repository: Option<GqlRepository>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlRepository {
    root_ref: Option<String>,
    #[serde(default)]
    empty: bool,
}

#[derive(Debug, Deserialize)]
struct RestBranch {
    name: String,
    #[serde(default)]
    default: bool,
}

impl GqlProject {
    /// `None` when the project sits outside the requested group.
    fn listing(self, group: &str) -> Option<RepoListing> {
        let name = self
            .full_path
            .strip_prefix(group)
            .and_then(|rest| rest.strip_prefix('/'))?
            .to_string();
        let (default_branch, is_empty) = match self.repository {
            Some(repo) => (repo.root_ref, repo.empty),
            None => (None, false),
        };
        Some(RepoListing {
            name,
            default_branch,
            is_private: self.visibility == "private",
            is_empty,
            branches: Vec::new(),
            branch_cursor: None,
        })
    }
}

fn send_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Transport(e)
    }
}

fn status_error(status: u16, text: String) -> ProviderError {
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(text);
    if status == 429 || is_rate_limit_message(&message) {
        ProviderError::RateLimited(message)
    } else {
        ProviderError::Http {
            status,
            body: message,
        }
    }
}

pub struct GitlabProvider {
    client: reqwest::Client,
    url: String,
    branch_url: Option<String>,
    token: Option<String>,
    page_size: u32,
}

impl GitlabProvider {
    pub fn new(
        client: reqwest::Client,
        url: &str,
        branch_url: Option<&str>,
        token: Option<String>,
        page_size: u32,
    ) -> Self {
        Self {
            client,
            url: url.to_string(),
            branch_url: branch_url.map(|u| u.trim_end_matches('/').to_string()),
            token,
            page_size,
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("bearer {}", token)),
            None => req,
        }
    }

    async fn json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ProviderError> {
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(ProviderError::Transport)?;
        if status != 200 {
            return Err(status_error(status, text));
        }
        serde_json::from_str(&text).map_err(|e| ProviderError::Decode(e.to_string()))
    }

    async fn group_page(&self, request: &DiscoveryRequest) -> Result<ProviderPage, ProviderError> {
        let req = self.client.post(&self.url).json(&json!({
            "query": PROJECT_QUERY,
            "variables": {
                "org": request.org,
                "cursor": request.page.cursor,
                "first": self.page_size,
            },
        }));
        let resp = self.authorize(req).send().await.map_err(send_error)?;
        let body: Value = Self::json(resp).await?;
        if let Some(message) = body.pointer("/errors/0/message").and_then(Value::as_str) {
            return Err(status_error(200, message.to_string()));
        }
        let response: GqlResponse =
            serde_json::from_value(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let projects = response
            .data
            .and_then(|d| d.group)
            .ok_or_else(|| ProviderError::Decode(format!("group {} not found", request.org)))?
            .projects;

        let next_cursor = projects
            .page_info
            .has_next_page
            .then_some(projects.page_info.end_cursor)
            .flatten();
        Ok(ProviderPage {
            repos: projects
                .nodes
                .into_iter()
                .filter_map(|p| p.listing(&request.org))
                .collect(),
            next_cursor,
        })
    }

    async fn branch_page(
        &self,
        request: &DiscoveryRequest,
        repo: &str,
    ) -> Result<ProviderPage, ProviderError> {
        let base = self.branch_url.as_deref().ok_or_else(|| {
            ProviderError::Unsupported(format!(
                "{}: branch listing needs branch_url",
                request.service
            ))
        })?;
        let mut url = reqwest::Url::parse(base).map_err(|e| ProviderError::Decode(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Decode(format!("{} cannot be a base URL", base)))?
            .pop_if_empty()
            .push("projects")
            .push(&format!("{}/{}", request.org, repo))
            .push("repository")
            .push("branches");
        url.query_pairs_mut()
            .append_pair("per_page", &self.page_size.to_string())
            .append_pair("page", request.page.branch_cursor.as_deref().unwrap_or("1"));

        let resp = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(send_error)?;
        if resp.status().as_u16() == 404 {
            // Deleted since the group page was listed.
            return Ok(ProviderPage::default());
        }
        let next = resp
            .headers()
            .get("X-Next-Page")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let branches: Vec<RestBranch> = Self::json(resp).await?;

        Ok(ProviderPage {
            repos: vec![RepoListing {
                name: repo.to_string(),
                default_branch: branches.iter().find(|b| b.default).map(|b| b.name.clone()),
                // Visibility was already applied when the group page was expanded.
                is_private: true,
                is_empty: false,
                branches: branches.into_iter().map(|b| b.name).collect(),
                branch_cursor: next,
            }],
            next_cursor: None,
        })
    }
}

#[async_trait]
impl Provider for GitlabProvider {
    async fn list_page(&self, request: &DiscoveryRequest) -> Result<ProviderPage, ProviderError> {
        match &request.repo {
            Some(repo) => self.branch_page(request, repo).await,
            None => self.group_page(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::Json;
    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, HeaderValue, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};

    use super::*;

    async fn serve(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn provider(base: &str) -> GitlabProvider {
        GitlabProvider::new(
            reqwest::Client::new(),
            &format!("{}/api/graphql", base),
            Some(&format!("{}/api/v4/", base)),
            Some("glpat-test".into()),
            50,
        )
    }

    #[test]
    fn test_subgroup_path_kept_in_repo_name() {
        let project: GqlProject = serde_json::from_value(json!({
            "fullPath": "acme/platform/api",
            "visibility": "internal",
            "repository": {"rootRef": "main", "empty": false}
        }))
        .unwrap();
        let listing = project.listing("acme").unwrap();
        assert_eq!(listing.name, "platform/api");
        assert_eq!(listing.default_branch.as_deref(), Some("main"));
        assert!(!listing.is_private);

        let other: GqlProject =
            serde_json::from_value(json!({"fullPath": "acmesoft/api", "repository": null})).unwrap();
        assert!(other.listing("acme").is_none());
    }

    #[tokio::test]
    async fn test_group_page_parses_projects_and_cursor() {
        let app = axum::Router::new().route(
            "/api/graphql",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers.get("authorization").unwrap(), "bearer glpat-test");
                assert_eq!(body["variables"]["org"], "acme");
                assert_eq!(body["variables"]["first"], 50);
                Json(json!({"data": {"group": {"projects": {
                    "nodes": [
                        {"fullPath": "acme/api", "visibility": "private",
                         "repository": {"rootRef": "main", "empty": false}},
                        {"fullPath": "acme/blank", "visibility": "private",
                         "repository": {"rootRef": null, "empty": true}}
                    ],
                    "pageInfo": {"endCursor": "eyJpZCI6IjEyIn0", "hasNextPage": true}
                }}}}))
            }),
        );
        let base = serve(app).await;

        let page = provider(&base)
            .list_page(&DiscoveryRequest::org("gitlab", "acme"))
            .await
            .unwrap();

        assert_eq!(page.next_cursor.as_deref(), Some("eyJpZCI6IjEyIn0"));
        assert_eq!(page.repos.len(), 2);
        assert!(page.repos[0].is_private);
        assert!(page.repos[1].is_empty);
    }

    #[tokio::test]
    async fn test_branch_page_encodes_project_path_and_follows_next_page() {
        let app = axum::Router::new().route(
            "/api/v4/projects/{id}/repository/branches",
            get(
                |Path(id): Path<String>, Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(id, "acme/platform/api");
                    assert_eq!(q.get("page").map(String::as_str), Some("2"));
                    let mut headers = HeaderMap::new();
                    headers.insert("X-Next-Page", HeaderValue::from_static("3"));
                    (
                        headers,
                        Json(json!([
                            {"name": "main", "default": true},
                            {"name": "release/1.2", "default": false}
                        ])),
                    )
                        .into_response()
                },
            ),
        );
        let base = serve(app).await;
        let request = DiscoveryRequest::org("gitlab", "acme")
            .for_repo("platform/api")
            .next_branch_page("2");

        let page = provider(&base).list_page(&request).await.unwrap();

        let repo = &page.repos[0];
        assert_eq!(repo.branches, vec!["main", "release/1.2"]);
        assert_eq!(repo.default_branch.as_deref(), Some("main"));
        assert_eq!(repo.branch_cursor.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_last_branch_page_has_no_cursor() {
        let app = axum::Router::new().route(
            "/api/v4/projects/{id}/repository/branches",
            get(|| async {
                let mut headers = HeaderMap::new();
                headers.insert("X-Next-Page", HeaderValue::from_static(""));
                (headers, Json(json!([{"name": "main", "default": true}]))).into_response()
            }),
        );
        let base = serve(app).await;
        let request = DiscoveryRequest::org("gitlab", "acme").for_repo("api");

        let page = provider(&base).list_page(&request).await.unwrap();
        assert_eq!(page.repos[0].branch_cursor, None);
    }

    #[tokio::test]
    async fn test_too_many_requests_is_rate_limited() {
        let app = axum::Router::new().route(
            "/api/graphql",
            post(|| async {
                (StatusCode::TOO_MANY_REQUESTS, Json(json!({"message": "Retry later"})))
            }),
        );
        let base = serve(app).await;

        let err = provider(&base)
            .list_page(&DiscoveryRequest::org("gitlab", "acme"))
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn test_branch_listing_without_branch_url_is_unsupported() {
        let provider = GitlabProvider::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/api/graphql",
            None,
            None,
            50,
        );
        let request = DiscoveryRequest::org("gitlab", "acme").for_repo("api");

        let err = provider.list_page(&request).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
    }
}
