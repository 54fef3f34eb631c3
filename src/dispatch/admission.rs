//! Scan admission API client.
//!
//! One POST per service to `<admission_url>/<service>` with the batch as a
//! JSON array. The response status decides how the batch is handled:
//! 200 is full success, 207 (or any `failed` entries) is partial, 504 or a
//! transport timeout means the whole batch should be retried.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DispatchError;

/// One entry of an admission batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionItem {
    pub repo: String,
    pub org: String,
    pub plugins: Vec<String>,
    pub batch_priority: bool,
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FailedItem {
    /// `org/repo` as submitted.
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AdmissionResponse {
    /// Accepted scans as `org/repo/scan-id`.
    #[serde(default)]
    pub queued: Vec<String>,
    #[serde(default)]
    pub failed: Vec<FailedItem>,
    #[serde(default)]
    pub unauthorized: Vec<Value>,
}

#[derive(Debug)]
pub enum AdmissionOutcome {
    Full(AdmissionResponse),
    Partial(AdmissionResponse),
    Timeout,
    Rejected(DispatchError),
}

/// Abstraction over the admission endpoint for testability.
/// Real implementation: `HttpAdmissionApi`.
#[async_trait]
pub trait AdmissionApi: Send + Sync {
    async fn submit(&self, service: &str, items: &[AdmissionItem]) -> AdmissionOutcome;
}

pub struct HttpAdmissionApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpAdmissionApi {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DispatchError::Transport)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl AdmissionApi for HttpAdmissionApi {
    async fn submit(&self, service: &str, items: &[AdmissionItem]) -> AdmissionOutcome {
        let url = format!("{}/{}", self.base_url, service);
        let resp = match self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(items)
            .send()
            .await
        {
            Ok(resp) => resp,
            // An unreachable endpoint is as retryable as a slow one.
            Err(e) if e.is_timeout() || e.is_connect() => return AdmissionOutcome::Timeout,
            Err(e) => return AdmissionOutcome::Rejected(DispatchError::Transport(e)),
        };
        let status = resp.status().as_u16();
        match resp.text().await {
            Ok(body) => classify(status, &body),
            Err(e) if e.is_timeout() => AdmissionOutcome::Timeout,
            Err(e) => AdmissionOutcome::Rejected(DispatchError::Transport(e)),
        }
    }
}

pub fn classify(status: u16, body: &str) -> AdmissionOutcome {
    match status {
        504 => AdmissionOutcome::Timeout,
        200 | 207 => match serde_json::from_str::<AdmissionResponse>(body) {
            Ok(resp) if status == 207 || !resp.failed.is_empty() => AdmissionOutcome::Partial(resp),
            Ok(resp) => AdmissionOutcome::Full(resp),
            Err(e) => AdmissionOutcome::Rejected(DispatchError::Decode(e.to_string())),
        },
        _ => AdmissionOutcome::Rejected(DispatchError::Http {
            status,
            message: error_message(body),
        }),
    }
}

/// Best readable message from an error body.
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    match (value.get("message"), value.get("failed")) {
        (Some(Value::String(m)), _) => m.clone(),
        (Some(m), _) => m.to_string(),
        (None, Some(failed)) => failed.to_string(),
        (None, None) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use serde_json::json;

    #[test]
    fn test_classify_statuses() {
        let body = r#"{"queued": ["acme/api/s1"], "failed": []}"#;
        assert!(matches!(classify(200, body), AdmissionOutcome::Full(r) if r.queued.len() == 1));
        assert!(matches!(classify(207, body), AdmissionOutcome::Partial(_)));
        assert!(matches!(classify(504, ""), AdmissionOutcome::Timeout));
        assert!(matches!(
            classify(400, r#"{"message": "bad plugin"}"#),
            AdmissionOutcome::Rejected(DispatchError::Http { status: 400, ref message }) if message == "bad plugin"
        ));
    }

    #[test]
    fn test_failed_list_on_200_is_partial() {
        let body = r#"{"queued": [], "failed": [{"repo": "acme/api", "error": "Rate limit exceeded"}]}"#;
        let AdmissionOutcome::Partial(resp) = classify(200, body) else {
            panic!("expected partial outcome");
        };
        assert_eq!(resp.failed[0].repo, "acme/api");
    }

    #[test]
    fn test_unreadable_success_body_is_rejected() {
        assert!(matches!(
            classify(200, "<html>"),
            AdmissionOutcome::Rejected(DispatchError::Decode(_))
        ));
    }

    #[test]
    fn test_error_message_fallbacks() {
        assert_eq!(error_message("gateway"), "gateway");
        assert_eq!(error_message(r#"{"failed": ["x"]}"#), r#"["x"]"#);
        assert_eq!(error_message(r#"{"other": 1}"#), r#"{"other":1}"#);
    }

    async fn serve(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn item(repo: &str) -> AdmissionItem {
        AdmissionItem {
            repo: repo.into(),
            org: "acme".into(),
            plugins: vec!["gitsecrets".into()],
            batch_priority: true,
            batch_id: None,
            branch: None,
        }
    }

    #[tokio::test]
    async fn test_http_submit_posts_batch_with_api_key() {
        let app = axum::Router::new().route(
            "/github",
            post(|headers: HeaderMap, Json(body): Json<Vec<AdmissionItem>>| async move {
                if headers.get("x-api-key").and_then(|v| v.to_str().ok()) != Some("k-123") {
                    return (StatusCode::UNAUTHORIZED, Json(json!({"message": "no key"})));
                }
                let queued: Vec<String> = body
                    .iter()
                    .map(|i| format!("{}/{}/scan-{}", i.org, i.repo, i.repo))
                    .collect();
                (StatusCode::MULTI_STATUS, Json(json!({"queued": queued, "failed": []})))
            }),
        );
        let base = serve(app).await;
        let api = HttpAdmissionApi::new(&base, "k-123", Duration::from_secs(5)).unwrap();

        let outcome = api.submit("github", &[item("api"), item("web")]).await;

        let AdmissionOutcome::Partial(resp) = outcome else {
            panic!("expected partial outcome, got {:?}", outcome);
        };
        assert_eq!(resp.queued, vec!["acme/api/scan-api", "acme/web/scan-web"]);
    }

    #[tokio::test]
    async fn test_http_submit_times_out() {
        let app = axum::Router::new().route(
            "/github",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StatusCode::OK
            }),
        );
        let base = serve(app).await;
        let api = HttpAdmissionApi::new(&base, "k", Duration::from_millis(100)).unwrap();

        assert!(matches!(
            api.submit("github", &[item("api")]).await,
            AdmissionOutcome::Timeout
        ));
    }

    #[tokio::test]
    async fn test_http_submit_unreachable_is_timeout() {
        let api =
            HttpAdmissionApi::new("http://127.0.0.1:9", "k", Duration::from_millis(500)).unwrap();
        assert!(matches!(
            api.submit("github", &[item("api")]).await,
            AdmissionOutcome::Timeout
        ));
    }
}
