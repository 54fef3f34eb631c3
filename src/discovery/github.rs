//! GitHub discovery over the GraphQL API.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{DiscoveryRequest, Provider, ProviderPage, RepoListing, is_rate_limit_message};
use crate::errors::ProviderError;

const REPO_QUERY: &str = r#"
query getRepos($org: String!, $cursor: String, $first: Int!) {
    organization(login: $org) {
        repositories(first: $first, after: $cursor, orderBy: {field: NAME, direction: ASC}) {
            nodes {
                name
                isPrivate
                isEmpty
                defaultBranchRef { name }
            }
            pageInfo { endCursor hasNextPage }
        }
    }
}
"#;

const REF_QUERY: &str = r#"
query getRefs($org: String!, $repo: String!, $cursor: String, $first: Int!) {
    organization(login: $org) {
        repository(name: $repo) {
            name
            isPrivate
            isEmpty
            defaultBranchRef { name }
            refs(first: $first, refPrefix: "refs/heads/", direction: ASC, after: $cursor) {
                nodes { name }
                pageInfo { endCursor hasNextPage }
            }
        }
    }
}
"#;

/// Phrases GitHub uses when a query ran out of time on its side.
const TIMEOUT_PHRASES: [&str; 2] = ["timeout", "Something went wrong while executing your query."];

#[derive(Debug, Deserialize)]
struct GqlResponse {
    data: Option<GqlData>,
}

#[derive(Debug, Deserialize)]
struct GqlData {
    organization: Option<GqlOrg>,
}

#[derive(Debug, Deserialize)]
struct GqlOrg {
    repositories: Option<Connection<GqlRepo>>,
    repository: Option<GqlRepo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlRepo {
    #[serde(default)]
    name: String,
    #[serde(default)]
    is_private: bool,
    #[serde(default)]
    is_empty: bool,
    default_branch_ref: Option<GqlRef>,
    refs: Option<Connection<GqlRef>>,
}

#[derive(Debug, Deserialize)]
struct GqlRef {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<T>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

impl PageInfo {
    fn next(&self) -> Option<String> {
        self.has_next_page.then(|| self.end_cursor.clone()).flatten()
    }
}

impl GqlRepo {
    fn into_listing(self) -> RepoListing {
        let (branches, branch_cursor) = match self.refs {
            Some(refs) => (
                refs.nodes.into_iter().map(|r| r.name).collect(),
                refs.page_info.next(),
            ),
            None => (Vec::new(), None),
        };
        RepoListing {
            name: self.name,
            default_branch: self.default_branch_ref.map(|r| r.name),
            is_private: self.is_private,
            is_empty: self.is_empty,
            branches,
            branch_cursor,
        }
    }
}

pub struct GithubProvider {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    page_size: u32,
}

impl GithubProvider {
    pub fn new(client: reqwest::Client, url: &str, token: Option<String>, page_size: u32) -> Self {
        Self {
            client,
            url: url.to_string(),
            token,
            page_size,
        }
    }

    async fn query(&self, query: &str, variables: Value) -> Result<GqlResponse, ProviderError> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&json!({"query": query, "variables": variables}));
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("bearer {}", token));
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Transport(e)
            }
        })?;

        let status = resp.status().as_u16();
        let exhausted = resp
            .headers()
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok())
            == Some("0");
        let text = resp.text().await.map_err(ProviderError::Transport)?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        // Throttling can come back as a 200 with an `errors` array.
        let has_errors = body
            .get("errors")
            .and_then(Value::as_array)
            .is_some_and(|e| !e.is_empty());
        if status != 200 || has_errors {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| body.pointer("/errors/0/message").and_then(Value::as_str))
                .unwrap_or(&text)
                .to_string();
            if exhausted || is_rate_limit_message(&message) {
                return Err(ProviderError::RateLimited(message));
            }
            if status == 502 && TIMEOUT_PHRASES.iter().any(|p| message.contains(p)) {
                return Err(ProviderError::Timeout(message));
            }
            return Err(ProviderError::Http {
                status,
                body: message,
            });
        }
        serde_json::from_value(body).map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Provider for GithubProvider {
    async fn list_page(&self, request: &DiscoveryRequest) -> Result<ProviderPage, ProviderError> {
        let response = match &request.repo {
            Some(repo) => {
                self.query(
                    REF_QUERY,
                    json!({
                        "org": request.org,
                        "repo": repo,
                        "cursor": request.page.branch_cursor,
                        "first": self.page_size,
                    }),
                )
                .await?
            }
            None => {
                self.query(
                    REPO_QUERY,
                    json!({
                        "org": request.org,
                        "cursor": request.page.cursor,
                        "first": self.page_size,
                    }),
                )
                .await?
            }
        };

        let org = response
            .data
            .and_then(|d| d.organization)
            .ok_or_else(|| ProviderError::Decode(format!("organization {} not found", request.org)))?;

        if request.repo.is_some() {
            // A repo deleted since the org page was listed yields no branches.
            return Ok(ProviderPage {
                repos: org.repository.map(GqlRepo::into_listing).into_iter().collect(),
                next_cursor: None,
            });
        }
        let repos = org
            .repositories
            .ok_or_else(|| ProviderError::Decode("missing repositories".into()))?;
        Ok(ProviderPage {
            next_cursor: repos.page_info.next(),
            repos: repos.nodes.into_iter().map(GqlRepo::into_listing).collect(),
        })
    }
}
