//! Live adapter for the GitHub issues REST API.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::GitHubConfig;
use crate::error::{Error, Result};
use crate::provider::IssueProvider;
use crate::types::{CreateIssue, Issue, IssueState, Repo, Token, UpdateIssue};

const GITHUB_MEDIA_TYPE: &str = "application/vnd.github+json";
const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";

/// Client for the GitHub issues API.
///
/// Holds no per-call state; the token is supplied with every operation.
#[derive(Debug, Clone)]
pub struct GitHubProvider {
    config: Arc<GitHubConfig>,
    /// API root, always ending in `/` so relative joins keep its path.
    base: Url,
    http_client: reqwest::Client,
}

impl GitHubProvider {
    /// Create a provider for api.github.com.
    pub fn new() -> Result<Self> {
        Self::with_config(GitHubConfig::default())
    }

    /// Create a provider with custom configuration.
    pub fn with_config(config: GitHubConfig) -> Result<Self> {
        let mut base = Url::parse(&config.api_url)?;
        if base.cannot_be_a_base() {
            return Err(Error::config(format!(
                "api url '{}' cannot be a base",
                config.api_url
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            config: Arc::new(config),
            base,
            http_client,
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &GitHubConfig {
        &self.config
    }

    fn issues_url(&self, repo: &Repo, number: Option<u64>) -> Result<Url> {
        let path = match number {
            Some(number) => format!("repos/{}/{}/issues/{number}", repo.owner, repo.name),
            None => format!("repos/{}/{}/issues", repo.owner, repo.name),
        };
        Ok(self.base.join(&path)?)
    }

    /// Send one request and return the decoded issue.
    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        url: Url,
        token: &Token,
        body: Option<&B>,
    ) -> Result<WireIssue> {
        debug!(%method, %url, "github request");

        let mut request = self
            .http_client
            .request(method, url)
            .bearer_auth(token.expose())
            .header(ACCEPT, GITHUB_MEDIA_TYPE)
            .header(API_VERSION_HEADER, API_VERSION);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::api(status.as_u16(), body));
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice::<WireIssue>(&body)?)
    }

    async fn set_state(
        &self,
        token: &Token,
        repo: &str,
        number: u64,
        state: IssueState,
    ) -> Result<()> {
        let parsed = Repo::parse(repo)?;
        let url = self.issues_url(&parsed, Some(number))?;
        let edit = EditRequest {
            state: Some(state),
            ..EditRequest::default()
        };

        self.send(Method::PATCH, url, token, Some(&edit))
            .await
            .map_err(|err| not_found_as_issue(err, repo, number))?;
        Ok(())
    }
}

/// Map a 404 onto [`Error::IssueNotFound`].
fn not_found_as_issue(err: Error, repo: &str, number: u64) -> Error {
    match err {
        Error::Api { status, .. } if status == StatusCode::NOT_FOUND.as_u16() => {
            Error::issue_not_found(repo, number)
        }
        other => other,
    }
}

#[async_trait]
impl IssueProvider for GitHubProvider {
    async fn create(&self, token: &Token, input: &CreateIssue) -> Result<Issue> {
        let repo = Repo::parse(&input.repo)?;
        let url = self.issues_url(&repo, None)?;
        let request = CreateRequest {
            title: &input.title,
            body: &input.body,
            labels: &input.labels,
        };

        let created = self.send(Method::POST, url, token, Some(&request)).await?;
        Ok(created.into())
    }

    async fn get(&self, token: &Token, repo: &str, number: u64) -> Result<Issue> {
        let parsed = Repo::parse(repo)?;
        let url = self.issues_url(&parsed, Some(number))?;

        let issue = self
            .send::<()>(Method::GET, url, token, None)
            .await
            .map_err(|err| not_found_as_issue(err, repo, number))?;
        Ok(issue.into())
    }

    async fn update(
        &self,
        token: &Token,
        repo: &str,
        number: u64,
        input: &UpdateIssue,
    ) -> Result<Issue> {
        let parsed = Repo::parse(repo)?;
        let url = self.issues_url(&parsed, Some(number))?;
        let edit = EditRequest {
            title: input.title.as_deref(),
            body: input.body.as_deref(),
            labels: input.labels.as_deref(),
            state: None,
        };

        let issue = self
            .send(Method::PATCH, url, token, Some(&edit))
            .await
            .map_err(|err| not_found_as_issue(err, repo, number))?;
        Ok(issue.into())
    }

    async fn close(&self, token: &Token, repo: &str, number: u64) -> Result<()> {
        self.set_state(token, repo, number, IssueState::Closed).await
    }

    async fn reopen(&self, token: &Token, repo: &str, number: u64) -> Result<()> {
        self.set_state(token, repo, number, IssueState::Open).await
    }
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    title: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    labels: &'a [String],
}

#[derive(Debug, Default, Serialize)]
struct EditRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<IssueState>,
}

#[derive(Debug, Deserialize)]
struct WireIssue {
    number: u64,
    html_url: String,
    state: IssueState,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<WireLabel>,
}

#[derive(Debug, Deserialize)]
struct WireLabel {
    name: String,
}

impl From<WireIssue> for Issue {
    fn from(wire: WireIssue) -> Self {
        Self {
            number: wire.number,
            url: wire.html_url,
            state: wire.state,
            title: wire.title,
            body: wire.body.unwrap_or_default(),
            labels: wire.labels.into_iter().map(|label| label.name).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn issue_json(number: u64, state: &str) -> serde_json::Value {
        json!({
            "number": number,
            "html_url": format!("https://github.com/octo/hello/issues/{number}"),
            "state": state,
            "title": "Flaky test",
            "body": null,
            "labels": [{ "id": 1, "name": "bug", "color": "d73a4a" }],
            "user": { "login": "octocat" }
        })
    }

    async fn provider(server: &MockServer) -> Result<GitHubProvider> {
        GitHubProvider::with_config(GitHubConfig::with_api_url(server.uri()))
    }

    #[tokio::test]
    async fn test_create_sends_auth_and_maps_response() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/octo/hello/issues"))
            .and(header("authorization", "Bearer ghp_test"))
            .and(header("accept", GITHUB_MEDIA_TYPE))
            .and(body_json(json!({
                "title": "Flaky test",
                "body": "",
                "labels": ["bug"]
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(issue_json(7, "open")))
            .expect(1)
            .mount(&server)
            .await;

        let issue = provider(&server)
            .await?
            .create(
                &Token::new("ghp_test"),
                &CreateIssue {
                    repo: "octo/hello".to_string(),
                    title: "Flaky test".to_string(),
                    body: String::new(),
                    labels: vec!["bug".to_string()],
                },
            )
            .await?;

        assert_eq!(issue.number, 7);
        assert_eq!(issue.url, "https://github.com/octo/hello/issues/7");
        assert_eq!(issue.state, IssueState::Open);
        assert_eq!(issue.body, "");
        assert_eq!(issue.labels, vec!["bug".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_omits_empty_labels() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/octo/hello/issues"))
            .and(body_json(json!({ "title": "No labels", "body": "text" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(issue_json(1, "open")))
            .expect(1)
            .mount(&server)
            .await;

        provider(&server)
            .await?
            .create(
                &Token::new("t"),
                &CreateIssue {
                    repo: "octo/hello".to_string(),
                    title: "No labels".to_string(),
                    body: "text".to_string(),
                    labels: Vec::new(),
                },
            )
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_body_is_a_json_error() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/hello/issues/3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "number": 3 })))
            .mount(&server)
            .await;

        let result = provider(&server)
            .await?
            .get(&Token::new("t"), "octo/hello", 3)
            .await;

        assert!(matches!(result, Err(Error::Json(_))), "got {result:?}");
        assert!(result.is_err_and(|err| !err.is_retryable()));
        Ok(())
    }

    #[tokio::test]
    async fn test_get_missing_issue_maps_to_not_found() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/hello/issues/99"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "Not Found" })))
            .mount(&server)
            .await;

        let result = provider(&server)
            .await?
            .get(&Token::new("t"), "octo/hello", 99)
            .await;

        assert!(matches!(result, Err(Error::IssueNotFound { number: 99, .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_update_sends_only_present_fields() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/repos/octo/hello/issues/7"))
            .and(body_json(json!({ "title": "Renamed" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(issue_json(7, "open")))
            .expect(1)
            .mount(&server)
            .await;

        provider(&server)
            .await?
            .update(
                &Token::new("t"),
                "octo/hello",
                7,
                &UpdateIssue::default().title("Renamed"),
            )
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_update_with_empty_labels_clears_them() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/repos/octo/hello/issues/7"))
            .and(body_json(json!({ "labels": [] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(issue_json(7, "open")))
            .expect(1)
            .mount(&server)
            .await;

        provider(&server)
            .await?
            .update(
                &Token::new("t"),
                "octo/hello",
                7,
                &UpdateIssue::default().labels(Vec::new()),
            )
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_close_and_reopen_patch_state() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/repos/octo/hello/issues/7"))
            .and(body_json(json!({ "state": "closed" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(issue_json(7, "closed")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/repos/octo/hello/issues/7"))
            .and(body_json(json!({ "state": "open" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(issue_json(7, "open")))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server).await?;
        provider.close(&Token::new("t"), "octo/hello", 7).await?;
        provider.reopen(&Token::new("t"), "octo/hello", 7).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let result = provider(&server)
            .await?
            .get(&Token::new("t"), "octo/hello", 1)
            .await;

        let err = result.err().ok_or("expected an error")?;
        assert!(matches!(err, Error::Api { status: 502, .. }));
        assert!(err.is_retryable());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_repo_fails_without_request() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(issue_json(1, "open")))
            .expect(0)
            .mount(&server)
            .await;

        let result = provider(&server)
            .await?
            .get(&Token::new("t"), "not-a-repo", 1)
            .await;

        assert!(matches!(result, Err(Error::InvalidRepo { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_api_url_path_prefix_is_kept() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/repos/octo/hello/issues/3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(issue_json(3, "closed")))
            .expect(1)
            .mount(&server)
            .await;

        let provider = GitHubProvider::with_config(GitHubConfig::with_api_url(format!(
            "{}/api/v3",
            server.uri()
        )))?;
        let issue = provider.get(&Token::new("t"), "octo/hello", 3).await?;

        assert_eq!(issue.state, IssueState::Closed);
        Ok(())
    }
}
