use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use clap::Parser;
use linkvote_api::{
    ledger_error, AddCommentRequest, CommentDeleted, CreateUserRequest, LinkDeleted, LinkDetail,
    LinkVoteApi, UpdateCommentRequest, VoteReceipt, VoteRequest, API_CONTRACT_VERSION,
};
use linkvote_core::{
    Comment, CommentId, LedgerError, LinkDraft, LinkId, LinkPage, LinkSummary, User, UserId,
    VoteTally,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const USER_HEADER: &str = "x-user-id";
const DEFAULT_LOG_FILTER: &str = "linkvote_service=info,linkvote_store_sqlite=info";

#[derive(Debug, Clone)]
struct ServiceState {
    api: LinkVoteApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    service_contract_version: &'static str,
    error: String,
    code: &'static str,
}

#[derive(Debug, Clone)]
struct ServiceError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PageQuery {
    page: Option<u32>,
}

#[derive(Debug, Parser)]
#[command(name = "linkvote-service")]
#[command(about = "Local HTTP service for the link vote ledger")]
struct Args {
    #[arg(long, env = "LINKVOTE_DB", default_value = "./linkvote.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "LINKVOTE_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl ServiceError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }

    fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthenticated", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl From<LedgerError> for ServiceError {
    fn from(err: LedgerError) -> Self {
        let status = match err {
            LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
            LedgerError::Forbidden(_) => StatusCode::FORBIDDEN,
            LedgerError::Conflict(_) => StatusCode::CONFLICT,
            LedgerError::ConstraintViolation(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        match ledger_error(&err) {
            Some(ledger) => {
                if matches!(ledger, LedgerError::ConstraintViolation(_)) {
                    tracing::warn!("vote write lost a race twice: {}", ledger);
                }
                Self::from(ledger.clone())
            }
            None => {
                tracing::error!("request failed: {:#}", err);
                Self::internal(format!("{err:#}"))
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        tracing::info!(
            "request rejected ({} {}): {}",
            self.status.as_u16(),
            self.code,
            self.message
        );
        let body = ErrorBody {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// The acting user, required for mutating routes.
fn actor(headers: &HeaderMap) -> Result<UserId, ServiceError> {
    viewer(headers)?
        .ok_or_else(|| ServiceError::unauthenticated(format!("missing {USER_HEADER} header")))
}

/// The acting user when the header is present; a malformed header is still rejected.
fn viewer(headers: &HeaderMap) -> Result<Option<UserId>, ServiceError> {
    let Some(value) = headers.get(USER_HEADER) else {
        return Ok(None);
    };
    let raw = value
        .to_str()
        .map_err(|_| ServiceError::unauthenticated(format!("{USER_HEADER} must be ASCII")))?;
    UserId::parse(raw)
        .map(Some)
        .map_err(|err| ServiceError::unauthenticated(err.to_string()))
}

fn parse_link_id(raw: &str) -> Result<LinkId, ServiceError> {
    LinkId::parse(raw).map_err(ServiceError::from)
}

fn parse_comment_id(raw: &str) -> Result<CommentId, ServiceError> {
    CommentId::parse(raw).map_err(ServiceError::from)
}

/// Run a store-backed call off the async workers; `SQLite` calls block.
async fn blocking<T, F>(
    state: &ServiceState,
    operation: &'static str,
    call: F,
) -> Result<Json<ServiceEnvelope<T>>, ServiceError>
where
    T: Serialize + Send + 'static,
    F: FnOnce(&LinkVoteApi) -> anyhow::Result<T> + Send + 'static,
{
    let api = state.api.clone();
    let started = Instant::now();
    let data = tokio::task::spawn_blocking(move || call(&api))
        .await
        .map_err(|err| ServiceError::internal(format!("store task failed: {err}")))??;
    tracing::info!("{} ok in {} ms", operation, started.elapsed().as_millis());
    Ok(Json(envelope(data)))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/openapi", get(openapi))
        .route("/v1/users", post(create_user))
        .route("/v1/links", get(list_links).post(create_link))
        .route("/v1/links/:link_id", get(link_detail).put(update_link).delete(delete_link))
        .route("/v1/links/:link_id/vote", post(cast_vote))
        .route("/v1/links/:link_id/score", get(link_score))
        .route("/v1/links/:link_id/comments", post(add_comment))
        .route("/v1/comments/:comment_id", put(update_comment).delete(delete_comment))
        .with_state(state)
}

fn init_tracing(json: bool) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json)?;

    let state = ServiceState { api: LinkVoteApi::new(args.db.clone()) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("linkvote service listening on {} (db: {})", args.bind, args.db.display());
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn create_user(
    State(state): State<ServiceState>,
    Json(request): Json<CreateUserRequest>,
) -> Result<Json<ServiceEnvelope<User>>, ServiceError> {
    blocking(&state, "create_user", move |api| api.create_user(&request)).await
}

async fn list_links(
    State(state): State<ServiceState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ServiceEnvelope<LinkPage>>, ServiceError> {
    let page = query.page.unwrap_or(1);
    blocking(&state, "list_links", move |api| api.list_links(page)).await
}

async fn create_link(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<LinkDraft>,
) -> Result<Json<ServiceEnvelope<LinkSummary>>, ServiceError> {
    let actor = actor(&headers)?;
    blocking(&state, "create_link", move |api| api.create_link(actor, &request)).await
}

async fn link_detail(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(link_id): Path<String>,
) -> Result<Json<ServiceEnvelope<LinkDetail>>, ServiceError> {
    let viewer = viewer(&headers)?;
    let link_id = parse_link_id(&link_id)?;
    blocking(&state, "link_detail", move |api| api.link_detail(link_id, viewer)).await
}

async fn update_link(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(link_id): Path<String>,
    Json(request): Json<LinkDraft>,
) -> Result<Json<ServiceEnvelope<LinkSummary>>, ServiceError> {
    let actor = actor(&headers)?;
    let link_id = parse_link_id(&link_id)?;
    blocking(&state, "update_link", move |api| api.update_link(actor, link_id, &request)).await
}

async fn delete_link(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(link_id): Path<String>,
) -> Result<Json<ServiceEnvelope<LinkDeleted>>, ServiceError> {
    let actor = actor(&headers)?;
    let link_id = parse_link_id(&link_id)?;
    blocking(&state, "delete_link", move |api| api.delete_link(actor, link_id)).await
}

async fn cast_vote(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(link_id): Path<String>,
    Json(request): Json<VoteRequest>,
) -> Result<Json<ServiceEnvelope<VoteReceipt>>, ServiceError> {
    let actor = actor(&headers)?;
    let link_id = parse_link_id(&link_id)?;
    blocking(&state, "cast_vote", move |api| api.vote(actor, link_id, &request)).await
}

async fn link_score(
    State(state): State<ServiceState>,
    Path(link_id): Path<String>,
) -> Result<Json<ServiceEnvelope<VoteTally>>, ServiceError> {
    let link_id = parse_link_id(&link_id)?;
    blocking(&state, "link_score", move |api| api.score(link_id)).await
}

async fn add_comment(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(link_id): Path<String>,
    Json(request): Json<AddCommentRequest>,
) -> Result<Json<ServiceEnvelope<Comment>>, ServiceError> {
    let actor = actor(&headers)?;
    let link_id = parse_link_id(&link_id)?;
    blocking(&state, "add_comment", move |api| api.add_comment(actor, link_id, &request)).await
}

async fn update_comment(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(comment_id): Path<String>,
    Json(request): Json<UpdateCommentRequest>,
) -> Result<Json<ServiceEnvelope<Comment>>, ServiceError> {
    let actor = actor(&headers)?;
    let comment_id = parse_comment_id(&comment_id)?;
    blocking(&state, "update_comment", move |api| {
        api.update_comment(actor, comment_id, &request)
    })
    .await
}

async fn delete_comment(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(comment_id): Path<String>,
) -> Result<Json<ServiceEnvelope<CommentDeleted>>, ServiceError> {
    let actor = actor(&headers)?;
    let comment_id = parse_comment_id(&comment_id)?;
    blocking(&state, "delete_comment", move |api| api.delete_comment(actor, comment_id)).await
}
