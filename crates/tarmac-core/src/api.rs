// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent-facing and admin HTTP API.
//!
//! A thin layer mapping HTTP onto the [`Service`] contract. Agents
//! authenticate with agent tokens (plus an `x-agent-id` header once
//! registered) or job tokens; admin routes expect a user subject, which
//! deployments without the external token layer obtain from the
//! configured site token. Watch streams are exposed as server-sent
//! events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::agent::{AgentId, AgentStatus, RegisterAgentOptions};
use crate::error::CoreError;
use crate::job::JobSpec;
use crate::logs::{Chunk, GetChunkOptions, LogsProxy};
use crate::pool::{CreatePoolOptions, PoolId, UpdatePoolOptions};
use crate::pubsub::Subscription;
use crate::run::Phase;
use crate::service::{FinishJobOptions, Service};
use crate::subject::Subject;
use crate::token::{self, CreateAgentTokenOptions, TokenId};

/// Header registered agents send to upgrade their token subject.
pub const AGENT_ID_HEADER: &str = "x-agent-id";

/// Shared state for every API handler.
#[derive(Clone)]
pub struct ApiState {
    /// The orchestrator service.
    pub service: Arc<Service>,
    /// The log-chunk caching proxy.
    pub logs: Arc<LogsProxy>,
    /// Site-admin bearer token accepted on admin routes.
    pub site_token: Option<String>,
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    let routes = Router::new()
        // agent-facing
        .route("/agents", post(register_agent))
        .route("/agents/{agent_id}/status", post(update_agent_status))
        .route("/agents/{agent_id}/jobs", get(get_agent_jobs))
        .route("/jobs/{run_id}/{phase}/start", post(start_job))
        .route("/jobs/{run_id}/{phase}/finish", post(finish_job))
        .route("/runs/{run_id}/{phase}/logs", get(get_logs).put(put_logs))
        // admin
        .route(
            "/organizations/{organization}/pools",
            post(create_pool).get(list_pools),
        )
        .route(
            "/pools/{pool_id}",
            get(get_pool).patch(update_pool).delete(delete_pool),
        )
        .route(
            "/pools/{pool_id}/tokens",
            post(create_token).get(list_tokens),
        )
        .route("/tokens/{token_id}", axum::routing::delete(delete_token))
        .route("/watch/pools", get(watch_pools))
        .route("/watch/agents", get(watch_agents))
        .route("/watch/jobs", get(watch_jobs))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .with_state(state);
    Router::new().nest("/api/v1", routes)
}

// ============================================================================
// Errors
// ============================================================================

/// A [`CoreError`] carried through an axum handler.
#[derive(Debug)]
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::ResourceNotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::InvalidToken => StatusCode::UNAUTHORIZED,
            CoreError::AccessNotPermitted | CoreError::UnauthorizedAgentRegistration => {
                StatusCode::FORBIDDEN
            }
            CoreError::InvalidJobStateTransition { .. }
            | CoreError::InvalidAgentStateTransition { .. }
            | CoreError::PoolReferencedByWorkspaces
            | CoreError::WorkspaceNotAllowedToUsePool => StatusCode::CONFLICT,
            CoreError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            CoreError::Database { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": {
                "code": self.0.error_code(),
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

// ============================================================================
// Authentication
// ============================================================================

async fn authenticate(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(CoreError::InvalidToken)?;

    let subject = if bearer.starts_with(token::AGENT_TOKEN_PREFIX) {
        let agent_id: Option<AgentId> = request
            .headers()
            .get(AGENT_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());
        state
            .service
            .authenticate_agent_token(bearer, agent_id)
            .await?
    } else if bearer.starts_with(token::JOB_TOKEN_PREFIX) {
        state.service.authenticate_job_token(bearer).await?
    } else if state.site_token.as_deref() == Some(bearer) {
        Subject::User {
            username: "site-admin".to_string(),
        }
    } else {
        return Err(CoreError::InvalidToken.into());
    };

    request.extensions_mut().insert(subject);
    Ok(next.run(request).await)
}

// ============================================================================
// Agent-facing handlers
// ============================================================================

async fn register_agent(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
    Json(opts): Json<RegisterAgentOptions>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = state.service.register_agent(&subject, opts).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

#[derive(Debug, Deserialize)]
struct UpdateStatusBody {
    status: AgentStatus,
}

async fn update_agent_status(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
    Path(agent_id): Path<AgentId>,
    Json(body): Json<UpdateStatusBody>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .update_agent_status(&subject, agent_id, body.status)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_agent_jobs(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
    Path(agent_id): Path<AgentId>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state.service.get_agent_jobs(&subject, agent_id).await?;
    Ok(Json(jobs))
}

#[derive(Debug, Serialize)]
struct StartJobResponse {
    token: String,
}

async fn start_job(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
    Path((run_id, phase)): Path<(Uuid, Phase)>,
) -> Result<impl IntoResponse, ApiError> {
    let spec = JobSpec { run_id, phase };
    let job_token = state.service.start_job(&subject, &spec).await?;
    Ok(Json(StartJobResponse { token: job_token }))
}

async fn finish_job(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
    Path((run_id, phase)): Path<(Uuid, Phase)>,
    Json(opts): Json<FinishJobOptions>,
) -> Result<impl IntoResponse, ApiError> {
    let spec = JobSpec { run_id, phase };
    let job = state.service.finish_job(&subject, &spec, opts).await?;
    Ok(Json(job))
}

// ============================================================================
// Log handlers
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct GetLogsQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: usize,
}

async fn get_logs(
    State(state): State<ApiState>,
    Path((run_id, phase)): Path<(Uuid, Phase)>,
    Query(query): Query<GetLogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let chunk = state
        .logs
        .get(GetChunkOptions {
            run_id,
            phase,
            offset: query.offset,
            limit: query.limit,
        })
        .await?;
    Ok(chunk.data)
}

#[derive(Debug, Deserialize)]
struct PutLogsBody {
    /// Base64-encoded chunk bytes.
    data: String,
    #[serde(default)]
    offset: usize,
}

async fn put_logs(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
    Path((run_id, phase)): Path<(Uuid, Phase)>,
    Json(body): Json<PutLogsBody>,
) -> Result<StatusCode, ApiError> {
    let spec = JobSpec { run_id, phase };
    match subject {
        Subject::Job(own) if own == spec => {}
        _ => return Err(CoreError::AccessNotPermitted.into()),
    }
    let data = BASE64.decode(&body.data).map_err(|_| CoreError::InvalidArgument {
        field: "data",
        message: "chunk data must be base64-encoded".to_string(),
    })?;
    state
        .logs
        .put(Chunk {
            run_id,
            phase,
            data,
            offset: body.offset,
        })
        .await?;
    Ok(StatusCode::ACCEPTED)
}

// ============================================================================
// Admin handlers
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreatePoolBody {
    name: String,
    #[serde(default)]
    organization_scoped: bool,
    #[serde(default)]
    allowed_workspaces: Vec<Uuid>,
}

async fn create_pool(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
    Path(organization): Path<String>,
    Json(body): Json<CreatePoolBody>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state
        .service
        .create_agent_pool(
            &subject,
            CreatePoolOptions {
                name: body.name,
                organization,
                organization_scoped: body.organization_scoped,
                allowed_workspaces: body.allowed_workspaces,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(pool)))
}

async fn list_pools(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
    Path(organization): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pools = state.service.list_agent_pools(&subject, &organization).await?;
    Ok(Json(pools))
}

async fn get_pool(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
    Path(pool_id): Path<PoolId>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.service.get_agent_pool(&subject, pool_id).await?;
    Ok(Json(pool))
}

async fn update_pool(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
    Path(pool_id): Path<PoolId>,
    Json(opts): Json<UpdatePoolOptions>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state
        .service
        .update_agent_pool(&subject, pool_id, opts)
        .await?;
    Ok(Json(pool))
}

async fn delete_pool(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
    Path(pool_id): Path<PoolId>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.service.delete_agent_pool(&subject, pool_id).await?;
    Ok(Json(pool))
}

#[derive(Debug, Serialize)]
struct CreatedTokenResponse {
    token: crate::token::AgentToken,
    secret: String,
}

async fn create_token(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
    Path(pool_id): Path<PoolId>,
    Json(opts): Json<CreateAgentTokenOptions>,
) -> Result<impl IntoResponse, ApiError> {
    let (agent_token, secret) = state
        .service
        .create_agent_token(&subject, pool_id, opts)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedTokenResponse {
            token: agent_token,
            secret,
        }),
    ))
}

async fn list_tokens(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
    Path(pool_id): Path<PoolId>,
) -> Result<impl IntoResponse, ApiError> {
    let tokens = state.service.list_agent_tokens(&subject, pool_id).await?;
    Ok(Json(tokens))
}

async fn delete_token(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
    Path(token_id): Path<TokenId>,
) -> Result<impl IntoResponse, ApiError> {
    let agent_token = state.service.delete_agent_token(&subject, token_id).await?;
    Ok(Json(agent_token))
}

// ============================================================================
// Watch streams
// ============================================================================

fn require_user(subject: &Subject) -> Result<(), ApiError> {
    match subject {
        Subject::User { .. } => Ok(()),
        _ => Err(CoreError::AccessNotPermitted.into()),
    }
}

fn sse_stream<T>(mut sub: Subscription<T>) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>>
where
    T: Serialize + Send + 'static,
{
    let stream = async_stream::stream! {
        while let Some(event) = sub.recv().await {
            if let Ok(data) = serde_json::to_string(&event) {
                yield Ok(SseEvent::default().data(data));
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn watch_pools(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
) -> Result<impl IntoResponse, ApiError> {
    require_user(&subject)?;
    Ok(sse_stream(state.service.watch_agent_pools()))
}

async fn watch_agents(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
) -> Result<impl IntoResponse, ApiError> {
    require_user(&subject)?;
    Ok(sse_stream(state.service.watch_agents()))
}

async fn watch_jobs(
    State(state): State<ApiState>,
    Extension(subject): Extension<Subject>,
) -> Result<impl IntoResponse, ApiError> {
    require_user(&subject)?;
    Ok(sse_stream(state.service.watch_jobs()))
}
