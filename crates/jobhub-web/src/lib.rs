//! Read-only JSON API over the master table for dashboard consumers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use jobhub_core::{NormalizedRecord, Table};
use jobhub_storage::TableStore;
use jobhub_sync::PipelineConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "jobhub-web";

/// Display label for a missing facet value.
pub const UNKNOWN_LABEL: &str = "Unknown";

const MAX_PER_PAGE: usize = 200;

pub struct AppState {
    pub store: TableStore,
    pub master_path: PathBuf,
}

impl AppState {
    pub fn new(store: TableStore, master_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            master_path: master_path.into(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.table_store(), config.master_path())
    }
}

#[derive(Debug, Deserialize, Default)]
struct JobsQuery {
    source: Option<String>,
    category: Option<String>,
    domain_l1: Option<String>,
    q: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
struct JobsPage {
    total: usize,
    page: usize,
    per_page: usize,
    total_pages: usize,
    jobs: Vec<Map<String, Value>>,
}

#[derive(Debug, Serialize, Default)]
struct Facets {
    total: usize,
    source: BTreeMap<String, usize>,
    category_primary: BTreeMap<String, usize>,
    domain_l1: BTreeMap<String, usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/facets", get(facets_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, master = %state.master_path.display(), "serving jobs api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Response {
    match load_master(&state).await {
        Ok(table) => Json(filtered_page(&table, &query)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn facets_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_master(&state).await {
        Ok(table) => Json(facets(&table)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn load_master(state: &AppState) -> anyhow::Result<Table> {
    Ok(state.store.load_with_fallback(&state.master_path).await?)
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "master table unavailable");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn label(value: Option<&str>) -> &str {
    value.unwrap_or(UNKNOWN_LABEL)
}

/// Filter values compare case-insensitively; `Unknown` selects missing cells.
fn matches_filter(value: Option<&str>, wanted: Option<&str>) -> bool {
    match wanted.map(str::trim).filter(|w| !w.is_empty()) {
        None => true,
        Some(wanted) => label(value).eq_ignore_ascii_case(wanted),
    }
}

fn matches_text(row: &NormalizedRecord, q: Option<&str>) -> bool {
    let Some(q) = q.map(str::trim).filter(|q| !q.is_empty()) else {
        return true;
    };
    let needle = q.to_lowercase();
    [&row.title, &row.company, &row.location, &row.skills]
        .into_iter()
        .flatten()
        .any(|v| v.to_lowercase().contains(&needle))
}

fn row_json(columns: &[String], row: &NormalizedRecord) -> Map<String, Value> {
    columns
        .iter()
        .map(|c| {
            let value = row
                .get(c)
                .map_or(Value::Null, |v| Value::String(v.to_string()));
            (c.clone(), value)
        })
        .collect()
}

fn filtered_page(table: &Table, query: &JobsQuery) -> JobsPage {
    let filtered = table
        .rows()
        .iter()
        .filter(|r| matches_filter(r.source.as_deref(), query.source.as_deref()))
        .filter(|r| matches_filter(r.category_primary.as_deref(), query.category.as_deref()))
        .filter(|r| matches_filter(r.domain_l1.as_deref(), query.domain_l1.as_deref()))
        .filter(|r| matches_text(r, query.q.as_deref()))
        .collect::<Vec<_>>();

    let per_page = query.per_page.unwrap_or(20).clamp(1, MAX_PER_PAGE);
    let total_pages = filtered.len().max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let jobs = filtered
        .iter()
        .skip(start)
        .take(per_page)
        .map(|r| row_json(table.columns(), r))
        .collect();

    JobsPage {
        total: filtered.len(),
        page,
        per_page,
        total_pages,
        jobs,
    }
}

fn facets(table: &Table) -> Facets {
    let mut facets = Facets {
        total: table.len(),
        ..Default::default()
    };
    for row in table.rows() {
        *facets
            .source
            .entry(label(row.source.as_deref()).to_string())
            .or_default() += 1;
        *facets
            .category_primary
            .entry(label(row.category_primary.as_deref()).to_string())
            .or_default() += 1;
        *facets
            .domain_l1
            .entry(label(row.domain_l1.as_deref()).to_string())
            .or_default() += 1;
    }
    facets
}
