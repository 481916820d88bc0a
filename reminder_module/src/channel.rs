use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delivery channel used by an escalation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Push,
    Sms,
    Call,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::Sms => "sms",
            Channel::Call => "call",
            Channel::Email => "email",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(Channel::Push),
            "sms" | "text" => Ok(Channel::Sms),
            "call" | "voice" => Ok(Channel::Call),
            "email" => Ok(Channel::Email),
            other => Err(format!("unknown channel: {}", other)),
        }
    }
}
