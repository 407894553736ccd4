use crate::config::{CredentialConfig, Listener as ListenerConfig};
use crate::service::{SonarError, SonarService};
use crate::statistics::StatisticsError;
use crate::types::{IssueQueryType, ScanPayload};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Clone)]
struct AppState {
    service: Arc<SonarService>,
    credential: Arc<CredentialConfig>,
}

pub fn router(service: Arc<SonarService>, credential: CredentialConfig) -> Router {
    let state = AppState {
        service,
        credential: Arc::new(credential),
    };

    Router::new()
        .route("/sonar-results-store", post(store_handler))
        .route("/sonar-issues", get(issues_handler))
        .route("/sonar-credential", get(credential_handler))
        .with_state(state)
}

pub async fn serve<F>(listener: ListenerConfig, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", listener.host, listener.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "sonar API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Every response body is wrapped as `{"success", "data", "err"}`.
#[derive(Serialize)]
struct Envelope<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    err: Option<ErrorBody>,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    msg: String,
    ctx: &'static str,
}

struct ApiOk<T>(T);

impl<T: Serialize> IntoResponse for ApiOk<T> {
    fn into_response(self) -> Response {
        let body = Envelope {
            success: true,
            data: Some(self.0),
            err: None,
        };
        (StatusCode::OK, Json(body)).into_response()
    }
}

/// The operation an error belongs to.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Scope {
    Store,
    Query,
}

impl Scope {
    const fn as_str(&self) -> &'static str {
        match self {
            Scope::Store => "SONAR_ISSUE_STORE",
            Scope::Query => "SONAR_ISSUE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ErrorKind {
    MissingParameter,
    InvalidParameter,
    NotFound,
    Internal,
}

#[derive(Debug)]
struct ApiError {
    scope: Scope,
    kind: ErrorKind,
    msg: String,
}

impl ApiError {
    fn new(scope: Scope, kind: ErrorKind, msg: impl Into<String>) -> Self {
        ApiError {
            scope,
            kind,
            msg: msg.into(),
        }
    }

    fn from_sonar(scope: Scope, error: SonarError) -> Self {
        let kind = match &error {
            SonarError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            SonarError::Statistics(StatisticsError::TestRecordMissing(_)) => ErrorKind::NotFound,
            SonarError::Store(_) | SonarError::Statistics(_) => ErrorKind::Internal,
        };
        ApiError::new(scope, kind, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match self.kind {
            ErrorKind::MissingParameter => (StatusCode::BAD_REQUEST, "MissingParameter"),
            ErrorKind::InvalidParameter => (StatusCode::BAD_REQUEST, "InvalidParameter"),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "NotFound"),
            ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };

        if status.is_server_error() {
            tracing::error!(ctx = self.scope.as_str(), msg = %self.msg, "request failed");
        } else {
            tracing::debug!(ctx = self.scope.as_str(), msg = %self.msg, "request rejected");
        }

        let body = Envelope::<()> {
            success: false,
            data: None,
            err: Some(ErrorBody {
                code,
                msg: self.msg,
                ctx: self.scope.as_str(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

async fn store_handler(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    if body.is_empty() {
        return Err(ApiError::new(
            Scope::Store,
            ErrorKind::MissingParameter,
            "missing request body",
        ));
    }

    let payload: ScanPayload = serde_json::from_slice(&body).map_err(|e| {
        ApiError::new(Scope::Store, ErrorKind::InvalidParameter, format!("invalid body: {e}"))
    })?;

    // The upsert may write the whole table through to disk.
    let service = state.service.clone();
    let stored = tokio::task::spawn_blocking(move || service.store_scan(payload))
        .await
        .map_err(|e| ApiError::new(Scope::Store, ErrorKind::Internal, format!("ingest task failed: {e}")))?
        .map_err(|e| ApiError::from_sonar(Scope::Store, e))?;

    Ok(ApiOk(stored).into_response())
}

#[derive(Deserialize, Debug)]
struct IssuesParams {
    #[serde(rename = "appID")]
    app_id: Option<i64>,
    key: Option<String>,
    #[serde(rename = "type")]
    query_type: Option<String>,
}

async fn issues_handler(
    State(state): State<AppState>,
    params: Result<Query<IssuesParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params
        .map_err(|e| ApiError::new(Scope::Query, ErrorKind::InvalidParameter, e.body_text()))?;

    if let Some(app_id) = params.app_id.filter(|id| *id > 0) {
        let summary = state
            .service
            .latest_summary(app_id)
            .await
            .map_err(|e| ApiError::from_sonar(Scope::Query, e))?;
        return Ok(ApiOk(summary).into_response());
    }

    let query: IssueQueryType = params
        .query_type
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(|_| ApiError::new(Scope::Query, ErrorKind::InvalidParameter, "invalid parameter: type"))?;
    let commit_id = params.key.unwrap_or_default();

    let view = state
        .service
        .issues_by_commit(&commit_id, query)
        .await
        .map_err(|e| ApiError::from_sonar(Scope::Query, e))?;
    Ok(ApiOk(view).into_response())
}

#[derive(Deserialize, Debug)]
struct CredentialParams {
    #[serde(rename = "clusterName", default)]
    cluster_name: String,
}

#[derive(Serialize, Debug, PartialEq)]
struct SonarCredential {
    server: String,
    token: String,
}

// The scanner needs an explicit protocol.
fn with_scheme(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

async fn credential_handler(
    State(state): State<AppState>,
    Query(params): Query<CredentialParams>,
) -> ApiOk<SonarCredential> {
    let credential = &state.credential;
    let server = if params.cluster_name == credential.cluster_name {
        with_scheme(&credential.addr)
    } else {
        credential.public_url.clone()
    };

    ApiOk(SonarCredential {
        server,
        token: credential.admin_token.clone(),
    })
}
