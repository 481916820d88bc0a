use serde::Deserialize;
use tracing::info;

use crate::env::{api_base, non_empty, optional, required};
use crate::{SendError, SendReceipt};

/// Voice call that reads `message` aloud once answered.
#[derive(Debug, Clone)]
pub struct PlaceCallParams {
    pub from: Option<String>,
    pub to: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct TwilioCall {
    sid: Option<String>,
}

pub fn place_call(params: &PlaceCallParams) -> Result<SendReceipt, SendError> {
    dotenvy::dotenv().ok();

    let account_sid = required("TWILIO_ACCOUNT_SID")?;
    let auth_token = required("TWILIO_AUTH_TOKEN")?;
    let from = match params.from.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => optional("TWILIO_FROM_NUMBER").ok_or(SendError::MissingConfig("TWILIO_FROM_NUMBER"))?,
    };
    let to = non_empty(&params.to, "call to number")?;
    let twiml = format!(
        "<Response><Say>{}</Say></Response>",
        escape_xml(params.message.trim())
    );

    let url = format!(
        "{}/2010-04-01/Accounts/{}/Calls.json",
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
            ("Twiml", twiml.as_str()),
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

    let call: TwilioCall = response.json().unwrap_or(TwilioCall { sid: None });
    info!("placed voice call to {}", to);
    Ok(SendReceipt {
        provider_id: call.sid,
    })
}

fn escape_xml(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}
