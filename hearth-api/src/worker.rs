//! Client for the agent worker service.

use hearth_core::{AgentInstanceId, UserId};
use serde::{Deserialize, Serialize};

use crate::http_client::{HttpClientError, RequestConfig, RetryingHttpClient};

/// Body of `POST <worker>/jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    pub agent_instance_id: AgentInstanceId,
    pub input: serde_json::Value,
    pub mode: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: String,
}

#[derive(Debug, Clone)]
pub struct WorkerClient {
    http: RetryingHttpClient,
    base_url: String,
}

impl WorkerClient {
    pub fn new(http: RetryingHttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn jobs_url(&self) -> String {
        format!("{}/jobs", self.base_url.trim_end_matches('/'))
    }

    /// Hand a job to the worker; retried per the client's defaults.
    pub async fn submit_job(&self, job: &JobSubmission) -> Result<JobAccepted, HttpClientError> {
        let request = RequestConfig::post(self.jobs_url())
            .with_defaults(self.http.defaults())
            .target("worker")
            .json(job)?;

        let accepted: JobAccepted = self.http.request_json(&request).await?;
        tracing::info!(
            job_id = %accepted.job_id,
            user_id = %job.user_id,
            agent_instance_id = %job.agent_instance_id,
            "Worker accepted job"
        );
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpClientConfig;
    use hearth_core::EntityIdType;

    #[test]
    fn test_submission_wire_format() {
        let job = JobSubmission {
            agent_instance_id: AgentInstanceId::now_v7(),
            input: serde_json::json!({ "prompt": "hi" }),
            mode: "async".to_string(),
            user_id: UserId::now_v7(),
        };
        let json = serde_json::to_value(&job).unwrap();
        assert!(json.get("agentInstanceId").is_some());
        assert!(json.get("userId").is_some());
        assert_eq!(json["mode"], "async");

        let accepted: JobAccepted = serde_json::from_str(r#"{"jobId":"job_1"}"#).unwrap();
        assert_eq!(accepted.job_id, "job_1");
    }

    #[test]
    fn test_jobs_url_trims_slash() {
        let http = RetryingHttpClient::new(HttpClientConfig::default()).unwrap();
        let client = WorkerClient::new(http, "http://worker:8080/");
        assert_eq!(client.jobs_url(), "http://worker:8080/jobs");
    }
}
