use serde::Deserialize;
use tracing::info;

use crate::env::{api_base, non_empty, optional, required};
use crate::{SendError, SendReceipt};

#[derive(Debug, Clone)]
pub struct SendSmsParams {
    /// Overrides `TWILIO_FROM_NUMBER` when set.
    pub from: Option<String>,
    pub to: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
struct TwilioResource {
    sid: Option<String>,
}

pub fn send_sms(params: &SendSmsParams) -> Result<SendReceipt, SendError> {
    dotenvy::dotenv().ok();

    let account_sid = required("TWILIO_ACCOUNT_SID")?;
    let auth_token = required("TWILIO_AUTH_TOKEN")?;
    let from = match params.from.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => optional("TWILIO_FROM_NUMBER").ok_or(SendError::MissingConfig("TWILIO_FROM_NUMBER"))?,
    };
    let to = non_empty(&params.to, "SMS to number")?;

    let url = format!(
        "{}/2010-04-01/Accounts/{}/Messages.json",
        api_base("TWILIO_API_BASE_URL", "https://api.twilio.com"),
        account_sid
    );

    let client = reqwest::blocking::Client::new();
    let response = client
        .post(&url)
        .basic_auth(&account_sid, Some(&auth_token))
        .form(&[
            ("To", to.as_str()),
            ("From", from.as_str()),
            ("Body", params.body.trim()),
        ])
        .send()?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(SendError::Provider {
            provider: "twilio",
            status: status.as_u16(),
            body,
        });
    }

    let resource: TwilioResource = response.json().unwrap_or(TwilioResource { sid: None });
    info!("sent SMS message to {}", to);
    Ok(SendReceipt {
        provider_id: resource.sid,
    })
}
