//! HTTP + WebSocket API: job submission, status, completion callback, roster
//! listing and the push channel.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use encerra_core::{JobRequest, JobStatus, LedgerKind, TaxId, ValidationError, YesNo};
use encerra_storage::ClientFilter;
use encerra_sync::{CoordinatorError, JobCoordinator, StatusEvent};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: JobCoordinator,
}

impl AppState {
    pub fn new(coordinator: JobCoordinator) -> Self {
        Self { coordinator }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    #[serde(default, alias = "cnpj")]
    tax_id: Option<String>,
    #[serde(default, alias = "periodo_inicial")]
    period_start: Option<String>,
    #[serde(default, alias = "periodo_final")]
    period_end: Option<String>,
    #[serde(default)]
    ledger: Option<String>,
}

#[derive(Debug, Serialize)]
struct Accepted {
    message: &'static str,
    tax_id: TaxId,
    period_start: String,
    period_end: String,
    status: JobStatus,
    job_id: String,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    tax_id: TaxId,
    status: JobStatus,
    progress: u8,
    last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default, alias = "cnpj")]
    tax_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    progress: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct ClientsQuery {
    #[serde(default)]
    empresa: Option<String>,
    #[serde(default)]
    omisso: Option<String>,
    #[serde(default)]
    debito: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/encerrar", post(submit_handler))
        .route("/status/{tax_id}", get(status_handler))
        .route("/encerramento_concluido", post(completion_handler))
        .route("/clients", get(clients_handler))
        .route("/ws", get(ws_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    state: AppState,
    listen_addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn bad_request(err: impl std::fmt::Display) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
        .into_response()
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, Response> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| bad_request(format!("missing field {field}")))
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitBody>,
) -> Response {
    let fields = required(&body.tax_id, "tax_id").and_then(|tax_id| {
        Ok((
            tax_id,
            required(&body.period_start, "period_start")?,
            required(&body.period_end, "period_end")?,
        ))
    });
    let (tax_id, start, end) = match fields {
        Ok(fields) => fields,
        Err(resp) => return resp,
    };
    let ledger = match body.ledger.as_deref().map(str::parse::<LedgerKind>).transpose() {
        Ok(ledger) => ledger.unwrap_or_default(),
        Err(err) => return bad_request(err),
    };
    let request = match JobRequest::from_submission(tax_id, start, end, ledger) {
        Ok(request) => request,
        Err(err) => return bad_request(err),
    };

    let period_start = request.range.start.to_string();
    let period_end = request.range.end.to_string();
    match state.coordinator.submit(request).await {
        Ok(handle) => (
            StatusCode::ACCEPTED,
            Json(Accepted {
                message: "closing job accepted",
                tax_id: handle.tax_id.clone(),
                period_start,
                period_end,
                status: JobStatus::Pending,
                job_id: handle.job_id.to_string(),
            }),
        )
            .into_response(),
        Err(CoordinatorError::AlreadyRunning(tax_id)) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": format!("a closing job for {tax_id} is already running"),
                "tax_id": tax_id,
            })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Response {
    let tax_id = match TaxId::parse(&raw) {
        Ok(tax_id) => tax_id,
        Err(err) => return bad_request(err),
    };
    match state.coordinator.store().job_status(&tax_id).await {
        Ok(Some(record)) => Json(StatusBody {
            tax_id: record.tax_id,
            status: record.status,
            progress: record.progress,
            last_update: record.last_update,
        })
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no client or job for {tax_id}") })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn completion_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CompletionBody>,
) -> Response {
    let tax_id = match required(&body.tax_id, "tax_id").map(TaxId::parse) {
        Ok(Ok(tax_id)) => tax_id,
        Ok(Err(err)) => return bad_request(err),
        Err(resp) => return resp,
    };
    let status = match body.status.as_deref().map(str::parse::<JobStatus>).transpose() {
        Ok(status) => status.unwrap_or(JobStatus::Completed),
        Err(err) => return bad_request(err),
    };
    let progress = body
        .progress
        .unwrap_or(if status == JobStatus::Completed { 100 } else { 0 });

    let record = match state
        .coordinator
        .store()
        .update_job(&tax_id, status, progress)
        .await
    {
        Ok(record) => record,
        Err(err) => return server_error(err),
    };
    info!(tax_id = %tax_id, status = %record.status, progress = record.progress, "completion reported");

    let notifier = state.coordinator.notifier();
    notifier.publish(StatusEvent::StatusUpdate {
        tax_id: tax_id.clone(),
        status: record.status,
        progress: record.progress,
        period: None,
    });
    if record.status == JobStatus::Completed {
        notifier.publish(StatusEvent::JobCompleted {
            tax_id: tax_id.clone(),
            job_id: record.job_id.clone(),
            summary: None,
        });
    }

    Json(json!({
        "message": "status updated",
        "tax_id": tax_id,
        "status": record.status,
        "progress": record.progress,
    }))
    .into_response()
}

fn flag_filter(value: Option<&str>) -> Result<Option<YesNo>, ValidationError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(YesNo::parse_portal)
        .transpose()
}

async fn clients_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClientsQuery>,
) -> Response {
    let filter = match (
        flag_filter(query.omisso.as_deref()),
        flag_filter(query.debito.as_deref()),
    ) {
        (Ok(omission), Ok(debt)) => ClientFilter {
            name: query.empresa.filter(|v| !v.trim().is_empty()),
            omission,
            debt,
        },
        (Err(err), _) | (_, Err(err)) => return bad_request(err),
    };
    match state.coordinator.store().list_clients(&filter).await {
        Ok(clients) => Json(clients).into_response(),
        Err(err) => server_error(err),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Debug, Deserialize)]
struct IncomingStatus {
    #[serde(alias = "cnpj")]
    tax_id: String,
    status: String,
    #[serde(default)]
    progress: u8,
}

impl IncomingStatus {
    fn into_event(self) -> Result<StatusEvent, ValidationError> {
        Ok(StatusEvent::StatusUpdate {
            tax_id: TaxId::parse(&self.tax_id)?,
            status: self.status.parse()?,
            progress: self.progress.min(100),
            period: None,
        })
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let notifier = state.coordinator.notifier().clone();
    let mut events = notifier.subscribe();
    let (mut sender, mut receiver) = socket.split();
    debug!("websocket connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "failed to serialize event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "websocket listener lagged"),
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<IncomingStatus>(text.as_str())
                        .map_err(|err| err.to_string())
                        .and_then(|msg| msg.into_event().map_err(|err| err.to_string()))
                    {
                        Ok(event) => notifier.publish(event),
                        Err(err) => warn!(error = %err, "ignoring websocket message"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "websocket receive failed");
                    break;
                }
            },
        }
    }
    debug!("websocket disconnected");
}
