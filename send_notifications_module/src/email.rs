use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::env::{api_base, non_empty, optional, required};
use crate::{SendError, SendReceipt};

#[derive(Debug, Clone)]
pub struct SendEmailParams {
    /// Overrides `POSTMARK_FROM_ADDRESS` when set.
    pub from: Option<String>,
    pub to: String,
    pub subject: String,
    pub text_body: String,
}

#[derive(Debug, Deserialize)]
struct PostmarkResponse {
    #[serde(rename = "MessageID")]
    message_id: Option<String>,
}

pub fn send_email(params: &SendEmailParams) -> Result<SendReceipt, SendError> {
    dotenvy::dotenv().ok();

    let token = required("POSTMARK_SERVER_TOKEN")?;
    let from = match params.from.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => optional("POSTMARK_FROM_ADDRESS")
            .ok_or(SendError::MissingConfig("POSTMARK_FROM_ADDRESS"))?,
    };
    let to = non_empty(&params.to, "email to address")?;

    let url = format!(
        "{}/email",
        api_base("POSTMARK_API_BASE_URL", "https://api.postmarkapp.com")
    );
    let payload = json!({
        "From": from,
        "To": to,
        "Subject": params.subject,
        "TextBody": params.text_body,
        "MessageStream": "outbound",
    });

    let client = reqwest::blocking::Client::new();
    let response = client
        .post(&url)
        .header("Accept", "application/json")
        .header("X-Postmark-Server-Token", token)
        .json(&payload)
        .send()?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(SendError::Provider {
            provider: "postmark",
            status: status.as_u16(),
            body,
        });
    }

    let parsed: PostmarkResponse = response
        .json()
        .unwrap_or(PostmarkResponse { message_id: None });
    info!("sent email to {}", to);
    Ok(SendReceipt {
        provider_id: parsed.message_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;
    use mockito::{Matcher, Server};
    use serial_test::serial;

    #[test]
    #[serial]
    fn send_email_posts_to_postmark() {
        let mut server = Server::new();
        let mock = server
            .mock("POST", "/email")
            .match_header("x-postmark-server-token", "test-token")
            .match_body(Matcher::PartialJsonString(
                r#"{"To":"carer@example.com","Subject":"Missed dose"}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"MessageID":"msg-123","ErrorCode":0,"Message":"OK"}"#)
            .expect(1)
            .create();

        let _token = EnvGuard::set("POSTMARK_SERVER_TOKEN", "test-token");
        let _base = EnvGuard::set("POSTMARK_API_BASE_URL", server.url());

        let receipt = send_email(&SendEmailParams {
            from: Some("reminders@example.com".to_string()),
            to: "carer@example.com".to_string(),
            subject: "Missed dose".to_string(),
            text_body: "Metformin 08:00 was not acknowledged".to_string(),
        })
        .expect("send email");
        mock.assert();
        assert_eq!(receipt.provider_id.as_deref(), Some("msg-123"));
    }

    #[test]
    #[serial]
    fn send_email_rejects_blank_recipient() {
        let _token = EnvGuard::set("POSTMARK_SERVER_TOKEN", "test-token");
        let err = send_email(&SendEmailParams {
            from: Some("reminders@example.com".to_string()),
            to: "   ".to_string(),
            subject: "s".to_string(),
            text_body: "b".to_string(),
        })
        .expect_err("blank recipient");
        assert!(matches!(err, SendError::InvalidRecipient(_)));
    }
}
