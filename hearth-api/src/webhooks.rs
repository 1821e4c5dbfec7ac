//! Agent-run result webhooks.
//!
//! Results are POSTed to the URL the caller supplied when the run was
//! created. When a signing secret is configured the body carries an
//! HMAC-SHA256 signature in `X-Hearth-Signature: sha256=<hex>`.

use hearth_core::AgentRunId;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::constants::WEBHOOK_SIGNATURE_HEADER;
use crate::http_client::{HttpClientError, RequestConfig, RetryingHttpClient};
use crate::telemetry::metrics::with_metrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub agent_run_id: AgentRunId,
    pub output: serde_json::Value,
}

/// Generate the hex HMAC-SHA256 of `payload`.
pub fn sign_payload(payload: &[u8], secret: &str) -> Result<String, String> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| format!("Failed to initialize HMAC: {}", e))?;
    mac.update(payload);
    let result = mac.finalize();

    Ok(hex::encode(result.into_bytes()))
}

#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    http: RetryingHttpClient,
    signing_secret: Option<String>,
}

impl WebhookDelivery {
    pub fn new(http: RetryingHttpClient, signing_secret: Option<String>) -> Self {
        Self {
            http,
            signing_secret,
        }
    }

    /// Deliver `payload` to `url`, retrying per the client's defaults.
    pub async fn deliver(&self, url: &str, payload: &WebhookPayload) -> Result<(), HttpClientError> {
        let body = serde_json::to_value(payload).map_err(|e| HttpClientError::InvalidRequest {
            reason: format!("webhook payload is not serializable: {}", e),
        })?;

        let mut request = RequestConfig::post(url)
            .with_defaults(self.http.defaults())
            .target("webhook")
            .header("X-Hearth-Delivery-Id", Uuid::now_v7().to_string());

        if let Some(secret) = &self.signing_secret {
            let bytes = serde_json::to_vec(&body).map_err(|e| HttpClientError::InvalidRequest {
                reason: e.to_string(),
            })?;
            let signature =
                sign_payload(&bytes, secret).map_err(|reason| HttpClientError::InvalidRequest { reason })?;
            request = request.header(WEBHOOK_SIGNATURE_HEADER, format!("sha256={}", signature));
        }
        let request = request.json(&body)?;

        let result = self.http.request(&request).await.map(|_| ());
        with_metrics(|m| m.record_webhook_delivery(result.is_ok()));
        match &result {
            Ok(()) => tracing::debug!(
                agent_run_id = %payload.agent_run_id,
                "Webhook delivered successfully"
            ),
            Err(e) => tracing::error!(
                agent_run_id = %payload.agent_run_id,
                error = %e,
                "Webhook delivery failed"
            ),
        }
        result
    }

    /// Deliver on a background task; failures are only logged.
    pub fn spawn_delivery(&self, url: String, payload: WebhookPayload) -> tokio::task::JoinHandle<()> {
        let delivery = self.clone();
        tokio::spawn(async move {
            let _ = delivery.deliver(&url, &payload).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_payload() {
        let payload = b"test payload";
        let secret = "supersecretkey123";

        let signature = sign_payload(payload, secret).unwrap();

        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(signature, sign_payload(payload, secret).unwrap());
        assert_ne!(signature, sign_payload(payload, "other").unwrap());
    }

    #[test]
    fn test_payload_wire_format() {
        let run = AgentRunId::from(Uuid::nil());
        let payload = WebhookPayload {
            agent_run_id: run,
            output: serde_json::json!("done"),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(
            json,
            r#"{"agentRunId":"00000000-0000-0000-0000-000000000000","output":"done"}"#
        );
    }
}
