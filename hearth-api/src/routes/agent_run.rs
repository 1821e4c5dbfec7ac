//! Agent Run REST API Routes
//!
//! Runs are handed to the worker service and metered locally: starting a run
//! consumes one `executions` unit, the worker's result reports the tokens it
//! used. The caller's webhook receives the result.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use dashmap::DashMap;
use hearth_core::{AgentInstanceId, AgentRunId, EntityIdType, Timestamp, UsageMetric, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::billing::UsageRecorder;
use crate::error::{ApiError, ApiResult};
use crate::middleware::UserContext;
use crate::state::AppState;
use crate::webhooks::{WebhookDelivery, WebhookPayload};
use crate::worker::{JobSubmission, WorkerClient};

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentRunRequest {
    pub agent_instance_id: AgentInstanceId,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default = "default_mode")]
    pub mode: String,
    pub webhook_url: Option<String>,
}

fn default_mode() -> String {
    "async".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunAccepted {
    pub agent_run_id: AgentRunId,
    pub job_id: String,
}

/// Worker callback body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunResult {
    pub output: serde_json::Value,
    #[serde(default)]
    pub tokens_used: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunCompleted {
    pub agent_run_id: AgentRunId,
    pub tokens_recorded: u64,
    pub webhook_scheduled: bool,
}

/// A run waiting for its worker result.
#[derive(Debug, Clone)]
pub struct PendingAgentRun {
    pub user_id: UserId,
    pub job_id: String,
    pub webhook_url: Option<String>,
    pub created_at: Timestamp,
}

/// In-flight runs keyed by id.
#[derive(Debug, Default)]
pub struct AgentRunRegistry {
    runs: DashMap<AgentRunId, PendingAgentRun>,
}

impl AgentRunRegistry {
    pub fn insert(&self, id: AgentRunId, run: PendingAgentRun) {
        self.runs.insert(id, run);
    }

    /// Remove and return the run; a result is accepted once.
    pub fn take(&self, id: AgentRunId) -> Option<PendingAgentRun> {
        self.runs.remove(&id).map(|(_, run)| run)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

fn validate_webhook_url(url: &str) -> ApiResult<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|_| ApiError::invalid_format("webhookUrl", "absolute http(s) URL"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        _ => Err(ApiError::invalid_format("webhookUrl", "absolute http(s) URL")),
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

/// POST /api/v1/agent-runs
pub async fn create_agent_run(
    State(recorder): State<UsageRecorder>,
    State(worker): State<WorkerClient>,
    State(registry): State<Arc<AgentRunRegistry>>,
    user: UserContext,
    Json(req): Json<CreateAgentRunRequest>,
) -> ApiResult<impl IntoResponse> {
    if let Some(url) = &req.webhook_url {
        validate_webhook_url(url)?;
    }

    let quota = recorder.check_quota(user.user_id).await?;
    if quota.exceeded {
        tracing::info!(
            user_id = %user.user_id,
            limit = quota.limit,
            used = quota.used,
            "Agent run rejected: quota exhausted"
        );
        return Err(ApiError::quota_exceeded(quota.limit, quota.used));
    }

    let accepted = worker
        .submit_job(&JobSubmission {
            agent_instance_id: req.agent_instance_id,
            input: req.input,
            mode: req.mode,
            user_id: user.user_id,
        })
        .await?;

    recorder
        .record_usage(user.user_id, UsageMetric::Executions, 1)
        .await?;

    let agent_run_id = AgentRunId::now_v7();
    registry.insert(
        agent_run_id,
        PendingAgentRun {
            user_id: user.user_id,
            job_id: accepted.job_id.clone(),
            webhook_url: req.webhook_url,
            created_at: Utc::now(),
        },
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(AgentRunAccepted {
            agent_run_id,
            job_id: accepted.job_id,
        }),
    ))
}

/// POST /api/v1/agent-runs/{id}/result
pub async fn complete_agent_run(
    State(recorder): State<UsageRecorder>,
    State(webhooks): State<WebhookDelivery>,
    State(registry): State<Arc<AgentRunRegistry>>,
    Path(agent_run_id): Path<AgentRunId>,
    Json(result): Json<AgentRunResult>,
) -> ApiResult<Json<AgentRunCompleted>> {
    let run = registry
        .take(agent_run_id)
        .ok_or_else(|| ApiError::entity_not_found("AgentRun", agent_run_id))?;

    if result.tokens_used > 0 {
        recorder
            .record_usage(run.user_id, UsageMetric::Tokens, result.tokens_used)
            .await?;
    }

    let webhook_scheduled = match run.webhook_url {
        Some(url) => {
            webhooks.spawn_delivery(
                url,
                WebhookPayload {
                    agent_run_id,
                    output: result.output,
                },
            );
            true
        }
        None => false,
    };

    tracing::info!(
        agent_run_id = %agent_run_id,
        job_id = %run.job_id,
        tokens_used = result.tokens_used,
        elapsed_ms = (Utc::now() - run.created_at).num_milliseconds(),
        "Agent run completed"
    );

    Ok(Json(AgentRunCompleted {
        agent_run_id,
        tokens_recorded: result.tokens_used,
        webhook_scheduled,
    }))
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_agent_run))
        .route("/:id/result", post(complete_agent_run))
}
