//! Read-only HTTP view of a [`MockProvider`]: GET /issues, GET /stats

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::mock::{CallStats, MockProvider};
use crate::types::{Issue, IssueState};

/// Query parameters for GET /issues
#[derive(Debug, Default, Deserialize)]
pub struct IssueQuery {
    /// Only list issues of this `owner/repo`.
    pub repo: Option<String>,
}

/// One issue in the listing
#[derive(Debug, Serialize)]
pub struct IssueView {
    repo: String,
    number: u64,
    url: String,
    state: IssueState,
    title: String,
    body: String,
    labels: Vec<String>,
}

impl IssueView {
    fn new(repo: String, issue: Issue) -> Self {
        Self {
            repo,
            number: issue.number,
            url: issue.url,
            state: issue.state,
            title: issue.title,
            body: issue.body,
            labels: issue.labels,
        }
    }
}

/// Counters snapshot
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsView {
    #[serde(flatten)]
    calls: CallStats,
    total_issues: usize,
}

/// Build the inspection router for `provider`.
pub fn router(provider: Arc<MockProvider>) -> Router {
    Router::new()
        .route("/issues", get(list_issues))
        .route("/stats", get(stats))
        .with_state(provider)
        .layer(TraceLayer::new_for_http())
}

/// GET /issues[?repo=owner/repo]
async fn list_issues(
    State(provider): State<Arc<MockProvider>>,
    Query(query): Query<IssueQuery>,
) -> Json<Vec<IssueView>> {
    let repo = query.repo.as_deref().filter(|repo| !repo.is_empty());
    Json(
        provider
            .list_issues(repo)
            .into_iter()
            .map(|(repo, issue)| IssueView::new(repo, issue))
            .collect(),
    )
}

/// GET /stats
async fn stats(State(provider): State<Arc<MockProvider>>) -> Json<StatsView> {
    Json(StatsView {
        calls: provider.stats(),
        total_issues: provider.total_issues(),
    })
}
