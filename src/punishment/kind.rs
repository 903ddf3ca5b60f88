//! Punishment kinds and durations
//!
//! Durations arrive either relative ("1d6h"), absolute, or permanent and are
//! resolved into an [`Expiry`] once, at the moment a punishment is imposed.

use crate::punishment::{PunishmentError, PunishmentResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of punishment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PunishmentKind {
    /// Player may not connect
    Ban,
    /// Player may not chat
    Mute,
    /// Player is disconnected once
    Kick,
}

impl PunishmentKind {
    /// Storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ban => "BAN",
            Self::Mute => "MUTE",
            Self::Kick => "KICK",
        }
    }

    /// Whether this kind has a persisted ACTIVE lifecycle
    #[must_use]
    pub const fn is_standing(self) -> bool {
        matches!(self, Self::Ban | Self::Mute)
    }
}

impl fmt::Display for PunishmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PunishmentKind {
    type Err = PunishmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BAN" => Ok(Self::Ban),
            "MUTE" => Ok(Self::Mute),
            "KICK" => Ok(Self::Kick),
            other => Err(PunishmentError::validation(format!(
                "Unknown punishment kind: {other}"
            ))),
        }
    }
}

/// When a standing punishment ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "at", rename_all = "snake_case")]
pub enum Expiry {
    /// Never ends on its own
    Permanent,
    /// Ends at this instant
    At(DateTime<Utc>),
}

impl Expiry {
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent)
    }

    /// The expiry instant, if any
    #[must_use]
    pub const fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Permanent => None,
            Self::At(at) => Some(*at),
        }
    }

    /// Whether the expiry instant has been reached at `now`
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.instant().is_some_and(|at| at <= now)
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permanent => write!(f, "permanent"),
            Self::At(at) => write!(f, "{}", at.to_rfc3339()),
        }
    }
}

/// Requested length of a punishment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunishmentDuration {
    Permanent,
    /// Length counted from the moment of imposition
    Relative(Duration),
    /// Fixed end instant
    Until(DateTime<Utc>),
}

impl PunishmentDuration {
    /// Parse a duration such as `30m`, `1d6h` or `permanent`.
    ///
    /// Units are `s`, `m`, `h` and `d`, case-insensitive, each preceded by a
    /// non-negative integer.
    ///
    /// # Errors
    /// Returns a validation error for empty input, a number without a unit, a
    /// unit without a number, an unknown unit, or an overflowing total
    pub fn parse(source: &str) -> PunishmentResult<Self> {
        let source = source.trim();
        if source.is_empty() {
            return Err(PunishmentError::validation("Duration is empty"));
        }
        if matches!(source.to_ascii_lowercase().as_str(), "permanent" | "perm") {
            return Ok(Self::Permanent);
        }

        let mut total_seconds: i64 = 0;
        let mut digits = String::new();

        for c in source.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }

            let unit_seconds: i64 = match c.to_ascii_lowercase() {
                's' => 1,
                'm' => 60,
                'h' => 3_600,
                'd' => 86_400,
                other => {
                    return Err(PunishmentError::validation(format!(
                        "Unknown time unit '{other}'"
                    )));
                }
            };
            if digits.is_empty() {
                return Err(PunishmentError::validation(format!(
                    "Time unit '{c}' is not preceded by a number"
                )));
            }

            let value: i64 = digits
                .parse()
                .map_err(|_| PunishmentError::validation(format!("Number too large: {digits}")))?;
            total_seconds = value
                .checked_mul(unit_seconds)
                .and_then(|seconds| total_seconds.checked_add(seconds))
                .ok_or_else(|| PunishmentError::validation("Duration is too long"))?;
            digits.clear();
        }

        if !digits.is_empty() {
            return Err(PunishmentError::validation(format!(
                "Number {digits} is not followed by a time unit"
            )));
        }

        Duration::try_seconds(total_seconds)
            .map(Self::Relative)
            .ok_or_else(|| PunishmentError::validation("Duration is too long"))
    }

    /// Resolve into an absolute expiry for a punishment issued at `issued_at`
    ///
    /// # Errors
    /// Returns a validation error if the punishment would not end after it began
    pub fn resolve(&self, issued_at: DateTime<Utc>) -> PunishmentResult<Expiry> {
        let at = match self {
            Self::Permanent => return Ok(Expiry::Permanent),
            Self::Relative(length) => {
                if *length <= Duration::zero() {
                    return Err(PunishmentError::validation(format!(
                        "Duration must be positive, got {}s",
                        length.num_seconds()
                    )));
                }
                issued_at
                    .checked_add_signed(*length)
                    .ok_or_else(|| PunishmentError::validation("Duration is too long"))?
            }
            Self::Until(at) => *at,
        };

        // Compared after truncation: the stores only keep milliseconds
        let at = crate::clock::truncate_millis(at);
        if at <= crate::clock::truncate_millis(issued_at) {
            return Err(PunishmentError::validation(format!(
                "Expiry {} is not in the future",
                at.to_rfc3339()
            )));
        }
        Ok(Expiry::At(at))
    }
}

impl From<Duration> for PunishmentDuration {
    fn from(length: Duration) -> Self {
        Self::Relative(length)
    }
}
