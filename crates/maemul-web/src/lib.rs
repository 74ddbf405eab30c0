//! Axum matcher service: profile matching over the inventory store.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::QueryRejection, Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use maemul_core::SourceTag;
use maemul_storage::{
    Envelope, InventoryStore, MatchQuery, MatchRequest, MemoryInventory, PgInventory, ProfileScope,
};
use maemul_sync::{CustomerPropertyMatcher, EngineConfig, StartDateWindow};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "maemul-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn InventoryStore>,
    pub matcher: CustomerPropertyMatcher,
}

impl AppState {
    pub fn new(store: Arc<dyn InventoryStore>, matcher: CustomerPropertyMatcher) -> Self {
        Self { store, matcher }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ProfilesQuery {
    manager: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/match", post(match_handler))
        .route("/match/manager/{manager}", post(match_manager_handler))
        .route("/profiles", get(profiles_handler))
        .route("/feeds/{source}", get(feed_handler))
        .with_state(Arc::new(state))
}

/// Postgres when `DATABASE_URL` is set and reachable, otherwise the JSON inventory file.
pub async fn store_from_config(config: &EngineConfig) -> anyhow::Result<Arc<dyn InventoryStore>> {
    if let Some(database_url) = &config.database_url {
        match PgInventory::connect(database_url).await {
            Ok(store) => {
                info!("using postgres inventory");
                return Ok(Arc::new(store));
            }
            Err(err) => warn!(error = %err, "postgres unavailable, falling back to inventory file"),
        }
    }
    let store = MemoryInventory::from_path(&config.inventory_path)
        .await
        .with_context(|| format!("loading inventory {}", config.inventory_path.display()))?;
    info!(path = %config.inventory_path.display(), "using file inventory");
    Ok(Arc::new(store))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    let store = store_from_config(&config).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    serve(listener, AppState::new(store, config.matcher())).await
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "matcher service listening");
    }
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn match_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<MatchQuery>, QueryRejection>,
) -> Response {
    run_match(&state, query, None).await
}

async fn match_manager_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(manager): AxumPath<String>,
    query: Result<Query<MatchQuery>, QueryRejection>,
) -> Response {
    run_match(&state, query, Some(manager)).await
}

async fn run_match(
    state: &AppState,
    query: Result<Query<MatchQuery>, QueryRejection>,
    manager: Option<String>,
) -> Response {
    let query = match query {
        Ok(Query(query)) => query,
        Err(err) => return bad_request(err.body_text()),
    };
    let request = match MatchRequest::from_query(query, manager) {
        Ok(request) => request,
        Err(err) => return bad_request(format!("addresses must be a JSON array of strings: {err}")),
    };
    let Some(scope) = scope_for(&request) else {
        return bad_request("either addresses or full_scope is required");
    };

    let profiles = match state.store.load_profiles(&scope).await {
        Ok(profiles) => profiles,
        Err(err) => return server_error(err),
    };
    let window = StartDateWindow::new(request.start_from, request.start_to);
    let rows = state
        .matcher
        .match_from_store(state.store.as_ref(), &profiles, &window)
        .await;
    Json(Envelope::ok(rows)).into_response()
}

fn scope_for(request: &MatchRequest) -> Option<ProfileScope> {
    if let Some(manager) = &request.manager {
        return Some(ProfileScope::Manager(manager.clone()));
    }
    if request.full_scope {
        return Some(ProfileScope::All);
    }
    if request.addresses.is_empty() {
        return None;
    }
    Some(ProfileScope::Addresses(request.addresses.clone()))
}

async fn profiles_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProfilesQuery>,
) -> Response {
    let scope = match query.manager {
        Some(manager) => ProfileScope::Manager(manager),
        None => ProfileScope::All,
    };
    match state.store.load_profiles(&scope).await {
        Ok(rows) => Json(Envelope::ok(rows)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn feed_handler(State(state): State<Arc<AppState>>, AxumPath(source): AxumPath<String>) -> Response {
    let tag = SourceTag::parse(&source);
    if tag == SourceTag::Other {
        return envelope_response(
            StatusCode::NOT_FOUND,
            Envelope::<()>::error(format!("unknown feed {source}")),
        );
    }
    match state.store.feed_batch(tag).await {
        Ok(rows) => Json(Envelope::ok(rows)).into_response(),
        Err(err) => server_error(err),
    }
}

fn envelope_response<T: Serialize>(status: StatusCode, envelope: Envelope<T>) -> Response {
    (status, Json(envelope)).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    envelope_response(StatusCode::BAD_REQUEST, Envelope::<()>::error(message))
}

fn server_error(err: impl std::fmt::Display) -> Response {
    warn!(error = %err, "request failed");
    envelope_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        Envelope::<()>::exception(err.to_string()),
    )
}
