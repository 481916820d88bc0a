use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::channel::Channel;

/// Escalation levels, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationLevel {
    Gentle,
    Repeat,
    Sms,
    Call,
    Emergency,
}

impl EscalationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationLevel::Gentle => "GENTLE",
            EscalationLevel::Repeat => "REPEAT",
            EscalationLevel::Sms => "SMS",
            EscalationLevel::Call => "CALL",
            EscalationLevel::Emergency => "EMERGENCY",
        }
    }
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscalationLevel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "GENTLE" => Ok(EscalationLevel::Gentle),
            "REPEAT" => Ok(EscalationLevel::Repeat),
            "SMS" => Ok(EscalationLevel::Sms),
            "CALL" => Ok(EscalationLevel::Call),
            "EMERGENCY" => Ok(EscalationLevel::Emergency),
            other => Err(format!("unknown escalation level: {}", other)),
        }
    }
}

/// Longest wait a ladder level may ask for.
pub const MAX_ESCALATION_DELAY_SECS: u64 = 7 * 24 * 60 * 60;

/// One rung of the ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRule {
    pub level: EscalationLevel,
    /// Wait before the next escalation check once this level is current.
    pub delay_secs: u64,
    pub max_attempts: u32,
    #[serde(default)]
    pub notify_caregiver: bool,
    pub channels: Vec<Channel>,
}

impl EscalationRule {
    pub fn new(
        level: EscalationLevel,
        delay: std::time::Duration,
        max_attempts: u32,
        notify_caregiver: bool,
        channels: Vec<Channel>,
    ) -> Self {
        Self {
            level,
            delay_secs: delay.as_secs(),
            max_attempts,
            notify_caregiver,
            channels,
        }
    }

    pub fn delay(&self) -> Duration {
        let secs = i64::try_from(self.delay_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs.min(i64::MAX / 1000))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LadderError {
    #[error("escalation ladder has no levels")]
    Empty,
    #[error("level {0} has no channels")]
    NoChannels(EscalationLevel),
    #[error("level {0} must allow at least one attempt")]
    ZeroAttempts(EscalationLevel),
    #[error("level {0} has a shorter delay than the level before it")]
    DecreasingDelay(EscalationLevel),
    #[error("level {0} waits longer than the longest allowed escalation delay")]
    DelayTooLong(EscalationLevel),
    #[error("level {0} is out of ladder order")]
    OutOfOrder(EscalationLevel),
}

/// A validated, non-empty escalation ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<EscalationRule>", into = "Vec<EscalationRule>")]
pub struct EscalationLadder {
    rules: Vec<EscalationRule>,
}

impl EscalationLadder {
    pub fn new(rules: Vec<EscalationRule>) -> Result<Self, LadderError> {
        if rules.is_empty() {
            return Err(LadderError::Empty);
        }
        let mut previous: Option<&EscalationRule> = None;
        for rule in &rules {
            if rule.channels.is_empty() {
                return Err(LadderError::NoChannels(rule.level));
            }
            if rule.max_attempts == 0 {
                return Err(LadderError::ZeroAttempts(rule.level));
            }
            if rule.delay_secs > MAX_ESCALATION_DELAY_SECS {
                return Err(LadderError::DelayTooLong(rule.level));
            }
            if let Some(previous) = previous {
                if rule.level <= previous.level {
                    return Err(LadderError::OutOfOrder(rule.level));
                }
                if rule.delay_secs < previous.delay_secs {
                    return Err(LadderError::DecreasingDelay(rule.level));
                }
            }
            previous = Some(rule);
        }
        Ok(Self { rules })
    }

    /// Ladder used by schedules that do not define their own.
    pub fn system_default() -> Self {
        use std::time::Duration as StdDuration;
        Self {
            rules: vec![
                EscalationRule::new(
                    EscalationLevel::Gentle,
                    StdDuration::ZERO,
                    1,
                    false,
                    vec![Channel::Push],
                ),
                EscalationRule::new(
                    EscalationLevel::Repeat,
                    StdDuration::from_secs(15 * 60),
                    2,
                    false,
                    vec![Channel::Push],
                ),
                EscalationRule::new(
                    EscalationLevel::Sms,
                    StdDuration::from_secs(30 * 60),
                    1,
                    true,
                    vec![Channel::Sms],
                ),
                EscalationRule::new(
                    EscalationLevel::Call,
                    StdDuration::from_secs(60 * 60),
                    1,
                    true,
                    vec![Channel::Call],
                ),
                EscalationRule::new(
                    EscalationLevel::Emergency,
                    StdDuration::from_secs(120 * 60),
                    1,
                    true,
                    vec![Channel::Sms, Channel::Call],
                ),
            ],
        }
    }

    pub fn rules(&self) -> &[EscalationRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn first(&self) -> &EscalationRule {
        &self.rules[0]
    }

    pub fn rule_for(&self, level: EscalationLevel) -> Option<&EscalationRule> {
        self.rules.iter().find(|rule| rule.level == level)
    }

    /// The rung after `level`, or `None` at the top of the ladder.
    pub fn next_after(&self, level: EscalationLevel) -> Option<&EscalationRule> {
        let index = self.rules.iter().position(|rule| rule.level == level)?;
        self.rules.get(index + 1)
    }
}

impl TryFrom<Vec<EscalationRule>> for EscalationLadder {
    type Error = LadderError;

    fn try_from(rules: Vec<EscalationRule>) -> Result<Self, Self::Error> {
        Self::new(rules)
    }
}

impl From<EscalationLadder> for Vec<EscalationRule> {
    fn from(ladder: EscalationLadder) -> Self {
        ladder.rules
    }
}
