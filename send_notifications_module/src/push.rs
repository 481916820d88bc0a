use serde_json::json;
use tracing::info;

use crate::env::{non_empty, optional, required};
use crate::{SendError, SendReceipt};

/// Push notification relayed through the JSON webhook at `PUSH_WEBHOOK_URL`.
#[derive(Debug, Clone)]
pub struct SendPushParams {
    pub recipient_id: String,
    pub device_token: Option<String>,
    pub title: String,
    pub body: String,
    pub priority: String,
}

pub fn send_push(params: &SendPushParams) -> Result<SendReceipt, SendError> {
    dotenvy::dotenv().ok();

    let url = required("PUSH_WEBHOOK_URL")?;
    let recipient_id = non_empty(&params.recipient_id, "push recipient")?;
    let payload = json!({
        "recipient_id": recipient_id,
        "device_token": params.device_token,
        "title": params.title,
        "body": params.body,
        "priority": params.priority,
    });

    let client = reqwest::blocking::Client::new();
    let mut request = client.post(&url).json(&payload);
    if let Some(secret) = optional("PUSH_WEBHOOK_SECRET") {
        request = request.bearer_auth(secret);
    }
    let response = request.send()?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(SendError::Provider {
            provider: "push",
            status: status.as_u16(),
            body,
        });
    }

    let provider_id = response
        .json::<serde_json::Value>()
        .ok()
        .and_then(|value| value.get("id").and_then(|id| id.as_str()).map(str::to_string));
    info!("sent push notification to {}", recipient_id);
    Ok(SendReceipt { provider_id })
}
