use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

use send_notifications_module::{
    place_call, send_email, send_push, send_sms, PlaceCallParams, SendEmailParams, SendError,
    SendPushParams, SendReceipt, SendSmsParams,
};

use crate::channel::Channel;
use crate::escalation::EscalationLevel;
use crate::schedule::{Recipient, Schedule};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("recipient {recipient} has no address for {channel}")]
    MissingAddress { recipient: String, channel: Channel },
    #[error("send failed: {0}")]
    Send(#[from] SendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn for_level(level: EscalationLevel) -> Self {
        match level {
            EscalationLevel::Gentle | EscalationLevel::Repeat => Priority::Normal,
            EscalationLevel::Sms | EscalationLevel::Call => Priority::High,
            EscalationLevel::Emergency => Priority::Urgent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    Patient,
    Caregiver,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    pub schedule_id: Uuid,
    pub dose_at: DateTime<Utc>,
    pub level: EscalationLevel,
    pub audience: Audience,
    pub title: String,
    pub body: String,
}

impl NotificationPayload {
    pub fn for_patient(schedule: &Schedule, dose_at: DateTime<Utc>, level: EscalationLevel) -> Self {
        let local = dose_at.with_timezone(&schedule.timezone).format("%H:%M");
        let dose = match schedule.dosage.as_deref() {
            Some(dosage) => format!("{} ({})", schedule.medication, dosage),
            None => schedule.medication.clone(),
        };
        let title = match level {
            EscalationLevel::Gentle => "Medication reminder".to_string(),
            _ => "Medication reminder (not yet confirmed)".to_string(),
        };
        Self {
            schedule_id: schedule.id,
            dose_at,
            level,
            audience: Audience::Patient,
            title,
            body: format!("Time to take {} scheduled for {}.", dose, local),
        }
    }

    pub fn for_caregiver(
        schedule: &Schedule,
        dose_at: DateTime<Utc>,
        level: EscalationLevel,
    ) -> Self {
        let local = dose_at.with_timezone(&schedule.timezone).format("%H:%M");
        Self {
            schedule_id: schedule.id,
            dose_at,
            level,
            audience: Audience::Caregiver,
            title: "Missed medication".to_string(),
            body: format!(
                "{} has not confirmed {} scheduled for {}.",
                schedule.patient.display_name(),
                schedule.medication,
                local
            ),
        }
    }
}

#[derive(Debug)]
pub struct ChannelOutcome {
    pub channel: Channel,
    pub result: Result<SendReceipt, DispatchError>,
}

impl ChannelOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// True when something was attempted and nothing got through.
pub fn all_failed(outcomes: &[ChannelOutcome]) -> bool {
    !outcomes.is_empty() && outcomes.iter().all(|outcome| !outcome.is_ok())
}

pub trait NotificationDispatcher: Send + Sync {
    fn send(
        &self,
        recipient: &Recipient,
        channels: &[Channel],
        priority: Priority,
        payload: &NotificationPayload,
    ) -> Vec<ChannelOutcome>;
}

/// Delivers through `send_notifications_module`, one blocking call per channel.
#[derive(Debug, Default, Clone)]
pub struct ModuleDispatcher;

impl NotificationDispatcher for ModuleDispatcher {
    fn send(
        &self,
        recipient: &Recipient,
        channels: &[Channel],
        priority: Priority,
        payload: &NotificationPayload,
    ) -> Vec<ChannelOutcome> {
        channels
            .iter()
            .map(|channel| {
                let result = send_one(recipient, *channel, priority, payload);
                match &result {
                    Ok(receipt) => info!(
                        "sent {} reminder for {} to {} via {} (provider id {:?})",
                        payload.level,
                        payload.schedule_id,
                        recipient.id,
                        channel,
                        receipt.provider_id
                    ),
                    Err(err) => warn!(
                        "failed {} reminder for {} to {} via {}: {}",
                        payload.level, payload.schedule_id, recipient.id, channel, err
                    ),
                }
                ChannelOutcome {
                    channel: *channel,
                    result,
                }
            })
            .collect()
    }
}

fn send_one(
    recipient: &Recipient,
    channel: Channel,
    priority: Priority,
    payload: &NotificationPayload,
) -> Result<SendReceipt, DispatchError> {
    let missing = || DispatchError::MissingAddress {
        recipient: recipient.id.clone(),
        channel,
    };
    let receipt = match channel {
        Channel::Push => send_push(&SendPushParams {
            recipient_id: recipient.id.clone(),
            device_token: recipient.push_token.clone(),
            title: payload.title.clone(),
            body: payload.body.clone(),
            priority: priority.as_str().to_string(),
        })?,
        Channel::Sms => {
            let to = recipient.phone.clone().ok_or_else(missing)?;
            send_sms(&SendSmsParams {
                from: None,
                to,
                body: payload.body.clone(),
            })?
        }
        Channel::Call => {
            let to = recipient.phone.clone().ok_or_else(missing)?;
            place_call(&PlaceCallParams {
                from: None,
                to,
                message: payload.body.clone(),
            })?
        }
        Channel::Email => {
            let to = recipient.email.clone().ok_or_else(missing)?;
            send_email(&SendEmailParams {
                from: None,
                to,
                subject: payload.title.clone(),
                text_body: payload.body.clone(),
            })?
        }
    };
    Ok(receipt)
}
