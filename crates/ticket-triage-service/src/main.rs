use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use ticket_triage_api::{
    AnnotationRequest, ClassifySelection, IngestRequest, IngestResult, MigrateResult, PageState,
    ResetClassificationResult, SelectionRequest, SelectionState, SummaryTarget, TicketTextRequest,
    ToggleRequest, TriageApi, TriageConfig, API_CONTRACT_VERSION,
};
use ticket_triage_core::{
    ClassificationOutcome, PageScope, ResetTarget, TicketId, TicketPage, TicketRecord,
    TriageError, UrgencySummary, ViewQuery,
};
use ticket_triage_store_sqlite::{IntegrityReport, PageEntry, SchemaStatus};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: Arc<TriageApi>,
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
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    failed_writes: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct BackupRequest {
    out: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
struct BackupResponse {
    backup_written: bool,
    out: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ClassifyRequest {
    #[serde(default)]
    selection: Option<ClassifySelection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SummaryQuery {
    #[serde(default)]
    scope: SummaryTarget,
}

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

#[derive(Debug, Parser)]
#[command(name = "ticket-triage-service")]
#[command(about = "Local HTTP service for ticket triage")]
struct Args {
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long)]
    classifier_url: Option<String>,
    #[arg(long)]
    feed_url: Option<String>,
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into(), status }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<TriageError>() {
            Some(TriageError::Busy | TriageError::StaleBatch(_)) => StatusCode::CONFLICT,
            Some(TriageError::UnknownTicket(_)) => StatusCode::NOT_FOUND,
            Some(TriageError::Classification(_)) => StatusCode::BAD_GATEWAY,
            Some(TriageError::Validation(_) | TriageError::EmptySelection) | None => {
                StatusCode::BAD_REQUEST
            }
        };
        Self::new(status, format!("{err:#}"))
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

fn page_scope(raw: &str) -> Result<PageScope, ServiceError> {
    PageScope::parse(raw)
        .ok_or_else(|| ServiceError::new(StatusCode::NOT_FOUND, format!("unknown page: {raw}")))
}

fn ticket_id(raw: &str) -> Result<TicketId, ServiceError> {
    TicketId::parse(raw).map_err(|err| ServiceError::bad_request(err.to_string()))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity-check", post(db_integrity_check))
        .route("/v1/db/backup", post(db_backup))
        .route("/v1/db/pages", get(db_pages))
        .route("/v1/pages/:page/tickets", get(tickets_list).post(tickets_add))
        .route("/v1/pages/:page/ranked", get(tickets_ranked))
        .route("/v1/pages/:page/tickets/:id", put(tickets_edit).delete(tickets_remove))
        .route("/v1/pages/:page/tickets/:id/annotation", post(tickets_annotate))
        .route("/v1/pages/:page/ingest", post(pages_ingest))
        .route("/v1/pages/:page/selection", get(selection_show))
        .route("/v1/pages/:page/selection/toggle", post(selection_toggle))
        .route("/v1/pages/:page/selection/set", post(selection_set))
        .route("/v1/pages/:page/selection/all", post(selection_all))
        .route("/v1/pages/:page/selection/clear", post(selection_clear))
        .route("/v1/pages/:page/classify", post(pages_classify))
        .route("/v1/pages/:page/summary", get(pages_summary))
        .route("/v1/pages/:page/reset-classification", post(pages_reset_classification))
        .route("/v1/pages/:page/reset", post(pages_reset))
        .route("/v1/pages/:page/state", get(pages_state))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = TriageConfig::from_env()
        .with_db_path(args.db)
        .with_classifier_url(args.classifier_url)
        .with_feed_url(args.feed_url)
        .with_timeout_ms(args.timeout_ms);

    let api = Arc::new(TriageApi::open(config)?);
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "ticket triage service listening");
    axum::serve(listener, app(ServiceState { api: Arc::clone(&api) }))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    match Arc::try_unwrap(api) {
        Ok(api) => api.shutdown()?,
        Err(_) => error!("service state still shared at shutdown, queued writes may be lost"),
    }
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok", failed_writes: state.api.failed_writes() }))
}

async fn db_schema_version(State(state): State<ServiceState>) -> ServiceResult<SchemaStatus> {
    Ok(Json(envelope(state.api.schema_status()?)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> ServiceResult<MigrateResult> {
    Ok(Json(envelope(state.api.migrate(request.dry_run)?)))
}

async fn db_integrity_check(State(state): State<ServiceState>) -> ServiceResult<IntegrityReport> {
    Ok(Json(envelope(state.api.integrity_check()?)))
}

async fn db_backup(
    State(state): State<ServiceState>,
    Json(request): Json<BackupRequest>,
) -> ServiceResult<BackupResponse> {
    state.api.backup(&request.out)?;
    Ok(Json(envelope(BackupResponse {
        backup_written: true,
        out: request.out.display().to_string(),
    })))
}

async fn db_pages(State(state): State<ServiceState>) -> ServiceResult<Vec<PageEntry>> {
    Ok(Json(envelope(state.api.list_pages()?)))
}

/// Page operations can block on the page lock, on a first-use feed fetch or on
/// the classifier, so they run off the async workers.
async fn on_page<T, F>(state: &ServiceState, operation: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&TriageApi) -> Result<T> + Send + 'static,
{
    let api = Arc::clone(&state.api);
    let result = tokio::task::spawn_blocking(move || operation(&api)).await.map_err(|err| {
        ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("page task: {err}"))
    })?;
    result.map_err(ServiceError::from)
}

async fn tickets_list(
    State(state): State<ServiceState>,
    Path(page): Path<String>,
    Query(query): Query<ViewQuery>,
) -> ServiceResult<TicketPage> {
    let scope = page_scope(&page)?;
    let data = on_page(&state, move |api| api.list_tickets(scope, &query)).await?;
    Ok(Json(envelope(data)))
}

async fn tickets_ranked(
    State(state): State<ServiceState>,
    Path(page): Path<String>,
) -> ServiceResult<Vec<TicketRecord>> {
    let scope = page_scope(&page)?;
    let data = on_page(&state, move |api| api.tickets_by_urgency(scope)).await?;
    Ok(Json(envelope(data)))
}

async fn tickets_add(
    State(state): State<ServiceState>,
    Path(page): Path<String>,
    Json(request): Json<TicketTextRequest>,
) -> ServiceResult<TicketRecord> {
    let scope = page_scope(&page)?;
    let data = on_page(&state, move |api| api.add_ticket(scope, &request)).await?;
    Ok(Json(envelope(data)))
}

async fn tickets_edit(
    State(state): State<ServiceState>,
    Path((page, id)): Path<(String, String)>,
    Json(request): Json<TicketTextRequest>,
) -> ServiceResult<TicketRecord> {
    let scope = page_scope(&page)?;
    let id = ticket_id(&id)?;
    let data = on_page(&state, move |api| api.edit_ticket(scope, &id, &request)).await?;
    Ok(Json(envelope(data)))
}

async fn tickets_remove(
    State(state): State<ServiceState>,
    Path((page, id)): Path<(String, String)>,
) -> ServiceResult<TicketRecord> {
    let scope = page_scope(&page)?;
    let id = ticket_id(&id)?;
    let data = on_page(&state, move |api| api.remove_ticket(scope, &id)).await?;
    Ok(Json(envelope(data)))
}

async fn tickets_annotate(
    State(state): State<ServiceState>,
    Path((page, id)): Path<(String, String)>,
    Json(request): Json<AnnotationRequest>,
) -> ServiceResult<TicketRecord> {
    let scope = page_scope(&page)?;
    let id = ticket_id(&id)?;
    let data = on_page(&state, move |api| api.set_annotation(scope, &id, &request)).await?;
    Ok(Json(envelope(data)))
}

async fn pages_ingest(
    State(state): State<ServiceState>,
    Path(page): Path<String>,
    Json(request): Json<IngestRequest>,
) -> ServiceResult<IngestResult> {
    let scope = page_scope(&page)?;
    let data = on_page(&state, move |api| api.ingest(scope, &request)).await?;
    Ok(Json(envelope(data)))
}

async fn selection_show(
    State(state): State<ServiceState>,
    Path(page): Path<String>,
) -> ServiceResult<SelectionState> {
    let scope = page_scope(&page)?;
    let data = on_page(&state, move |api| api.selection(scope)).await?;
    Ok(Json(envelope(data)))
}

async fn selection_toggle(
    State(state): State<ServiceState>,
    Path(page): Path<String>,
    Json(request): Json<ToggleRequest>,
) -> ServiceResult<SelectionState> {
    let scope = page_scope(&page)?;
    let data = on_page(&state, move |api| api.toggle_selection(scope, &request.id)).await?;
    Ok(Json(envelope(data)))
}

async fn selection_set(
    State(state): State<ServiceState>,
    Path(page): Path<String>,
    Json(request): Json<SelectionRequest>,
) -> ServiceResult<SelectionState> {
    let scope = page_scope(&page)?;
    let data = on_page(&state, move |api| api.set_selection(scope, &request.ids)).await?;
    Ok(Json(envelope(data)))
}

async fn selection_all(
    State(state): State<ServiceState>,
    Path(page): Path<String>,
) -> ServiceResult<SelectionState> {
    let scope = page_scope(&page)?;
    let data = on_page(&state, move |api| api.select_all(scope)).await?;
    Ok(Json(envelope(data)))
}

async fn selection_clear(
    State(state): State<ServiceState>,
    Path(page): Path<String>,
) -> ServiceResult<SelectionState> {
    let scope = page_scope(&page)?;
    let data = on_page(&state, move |api| api.clear_selection(scope)).await?;
    Ok(Json(envelope(data)))
}

/// The page stays busy while the classifier is called.
async fn pages_classify(
    State(state): State<ServiceState>,
    Path(page): Path<String>,
    request: Option<Json<ClassifyRequest>>,
) -> ServiceResult<ClassificationOutcome> {
    let scope = page_scope(&page)?;
    let selection = request.and_then(|Json(request)| request.selection);
    let outcome = on_page(&state, move |api| api.classify(scope, selection.as_ref())).await?;
    Ok(Json(envelope(outcome)))
}

async fn pages_summary(
    State(state): State<ServiceState>,
    Path(page): Path<String>,
    Query(query): Query<SummaryQuery>,
) -> ServiceResult<UrgencySummary> {
    let scope = page_scope(&page)?;
    let data = on_page(&state, move |api| api.summary(scope, query.scope)).await?;
    Ok(Json(envelope(data)))
}

async fn pages_reset_classification(
    State(state): State<ServiceState>,
    Path(page): Path<String>,
    Json(target): Json<ResetTarget>,
) -> ServiceResult<ResetClassificationResult> {
    let scope = page_scope(&page)?;
    let data = on_page(&state, move |api| api.reset_classification(scope, &target)).await?;
    Ok(Json(envelope(data)))
}

async fn pages_reset(
    State(state): State<ServiceState>,
    Path(page): Path<String>,
) -> ServiceResult<PageState> {
    let scope = page_scope(&page)?;
    let data = on_page(&state, move |api| api.reset_page(scope)).await?;
    Ok(Json(envelope(data)))
}

async fn pages_state(
    State(state): State<ServiceState>,
    Path(page): Path<String>,
) -> ServiceResult<PageState> {
    let scope = page_scope(&page)?;
    let data = on_page(&state, move |api| api.page_state(scope)).await?;
    Ok(Json(envelope(data)))
}
