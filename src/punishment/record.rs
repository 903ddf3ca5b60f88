//! Punishment record and state management
//!
//! This module defines the punishment record structure and the state machine
//! governing its lifecycle.

use crate::punishment::{Expiry, PunishmentError, PunishmentKind, PunishmentResult};
use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable player identity
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    From,
    derive_more::FromStr,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Who performed an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// The warden itself (expiry, automated actions)
    System,
    /// The server console
    Console,
    /// A staff member with a player identity
    Player(PlayerId),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Console => write!(f, "console"),
            Self::Player(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for Actor {
    type Err = PunishmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "console" => Ok(Self::Console),
            other => Uuid::parse_str(other)
                .map(|id| Self::Player(PlayerId(id)))
                .map_err(|_| PunishmentError::validation(format!("Unknown actor: {other}"))),
        }
    }
}

/// Punishment lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PunishmentState {
    /// In effect and enforceable
    Active,
    /// Ran out on its own
    Expired,
    /// Lifted by an operator
    Revoked,
}

impl PunishmentState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
            Self::Revoked => "REVOKED",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for PunishmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PunishmentState {
    type Err = PunishmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "EXPIRED" => Ok(Self::Expired),
            "REVOKED" => Ok(Self::Revoked),
            other => Err(PunishmentError::validation(format!(
                "Unknown punishment state: {other}"
            ))),
        }
    }
}

/// Record of a standing punishment (ban or mute)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Punishment {
    /// Unique ID of this punishment
    pub id: Uuid,
    /// Player being punished
    pub target: PlayerId,
    pub kind: PunishmentKind,
    pub reason: String,
    /// Who imposed it
    pub issuer: Actor,
    pub issued_at: DateTime<Utc>,
    pub expiry: Expiry,
    pub state: PunishmentState,
    /// When the punishment left ACTIVE
    pub ended_at: Option<DateTime<Utc>>,
    /// Who ended it; the system actor for expiry
    pub ended_by: Option<Actor>,
}

impl Punishment {
    /// Create a new ACTIVE punishment
    pub fn new(
        target: PlayerId,
        kind: PunishmentKind,
        expiry: Expiry,
        reason: impl Into<String>,
        issuer: Actor,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            kind,
            reason: reason.into(),
            issuer,
            issued_at,
            expiry,
            state: PunishmentState::Active,
            ended_at: None,
            ended_by: None,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == PunishmentState::Active
    }

    /// Whether the punishment should be enforced at `now`
    #[must_use]
    pub fn is_in_effect(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && !self.expiry.is_due(now)
    }

    /// Whether the punishment is ACTIVE but past its expiry
    #[must_use]
    pub fn is_due_for_expiry(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.expiry.is_due(now)
    }

    fn ensure_active(&self) -> PunishmentResult<()> {
        if self.state.is_terminal() {
            return Err(PunishmentError::AlreadyTerminal {
                id: self.id,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Expire this punishment, transitioning to Expired
    ///
    /// # Errors
    /// Returns an error if the record is terminal, permanent, or not yet due
    pub fn expire(&mut self, at: DateTime<Utc>) -> PunishmentResult<()> {
        self.ensure_active()?;

        match self.expiry {
            Expiry::Permanent => {
                return Err(PunishmentError::validation(format!(
                    "Punishment {} is permanent and cannot expire",
                    self.id
                )));
            }
            Expiry::At(expires_at) if expires_at > at => {
                return Err(PunishmentError::validation(format!(
                    "Punishment {} is not due until {}",
                    self.id,
                    expires_at.to_rfc3339()
                )));
            }
            Expiry::At(_) => {}
        }

        self.state = PunishmentState::Expired;
        self.ended_at = Some(at);
        self.ended_by = Some(Actor::System);
        Ok(())
    }

    /// Revoke this punishment, transitioning to Revoked
    ///
    /// # Errors
    /// Returns an error if the record is not in the Active state
    pub fn revoke(&mut self, at: DateTime<Utc>, by: Actor) -> PunishmentResult<()> {
        self.ensure_active()?;

        self.state = PunishmentState::Revoked;
        self.ended_at = Some(at);
        self.ended_by = Some(by);
        Ok(())
    }

    /// Apply a validated state change
    ///
    /// # Errors
    /// Returns an error if the transition is not permitted
    pub fn transition(
        &mut self,
        to: PunishmentState,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> PunishmentResult<()> {
        match to {
            PunishmentState::Expired => self.expire(at),
            PunishmentState::Revoked => self.revoke(at, actor.clone()),
            PunishmentState::Active => Err(PunishmentError::validation(
                "A punishment cannot transition into ACTIVE",
            )),
        }
    }

    /// Replace the reason of an active punishment
    ///
    /// # Errors
    /// Returns an error if the record is terminal
    pub fn change_reason(&mut self, reason: impl Into<String>) -> PunishmentResult<()> {
        self.ensure_active()?;
        self.reason = reason.into();
        Ok(())
    }

    /// Replace the expiry of an active punishment
    ///
    /// # Errors
    /// Returns an error if the record is terminal
    pub fn change_expiry(&mut self, expiry: Expiry) -> PunishmentResult<()> {
        self.ensure_active()?;
        self.expiry = expiry;
        Ok(())
    }
}

/// One-shot disconnect notice; never persisted as a standing punishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kick {
    pub id: Uuid,
    pub target: PlayerId,
    pub reason: String,
    pub issuer: Actor,
    pub issued_at: DateTime<Utc>,
}

/// Kinds of punishment log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    #[display("created")]
    Created,
    #[display("reason_changed")]
    ReasonChanged,
    #[display("duration_changed")]
    DurationChanged,
    #[display("revoked")]
    Revoked,
    #[display("expired")]
    Expired,
    /// Revoked because a newer punishment replaced it
    #[display("superseded")]
    Superseded,
}

impl FromStr for LogAction {
    type Err = PunishmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "reason_changed" => Ok(Self::ReasonChanged),
            "duration_changed" => Ok(Self::DurationChanged),
            "revoked" => Ok(Self::Revoked),
            "expired" => Ok(Self::Expired),
            "superseded" => Ok(Self::Superseded),
            other => Err(PunishmentError::validation(format!(
                "Unknown log action: {other}"
            ))),
        }
    }
}

impl LogAction {
    /// Log action recorded for a state transition
    #[must_use]
    pub const fn for_state(state: PunishmentState) -> Self {
        match state {
            PunishmentState::Active => Self::Created,
            PunishmentState::Expired => Self::Expired,
            PunishmentState::Revoked => Self::Revoked,
        }
    }
}

/// Audit trail entry for a punishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub punishment_id: Uuid,
    pub action: LogAction,
    pub actor: Actor,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        punishment_id: Uuid,
        action: LogAction,
        actor: Actor,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            punishment_id,
            action,
            actor,
            message: message.into(),
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn mute_for(minutes: i64, issued_at: DateTime<Utc>) -> Punishment {
        Punishment::new(
            PlayerId::new(),
            PunishmentKind::Mute,
            Expiry::At(issued_at + Duration::minutes(minutes)),
            "spam",
            Actor::Console,
            issued_at,
        )
    }

    #[test]
    fn test_punishment_state_transitions() {
        let now = Utc::now();
        let mut record = mute_for(10, now);
        assert_eq!(record.state, PunishmentState::Active);
        assert!(record.is_in_effect(now));

        // Not due yet
        assert!(matches!(
            record.expire(now + Duration::minutes(5)),
            Err(PunishmentError::Validation(_))
        ));
        assert_eq!(record.state, PunishmentState::Active);

        record.expire(now + Duration::minutes(10)).unwrap();
        assert_eq!(record.state, PunishmentState::Expired);
        assert_eq!(record.ended_by, Some(Actor::System));
        assert!(!record.is_in_effect(now));

        // Cannot leave a terminal state
        let err = record.revoke(now, Actor::Console).unwrap_err();
        assert!(err.is_already_terminal());
        assert_eq!(record.state, PunishmentState::Expired);
    }

    #[test]
    fn test_revoke() {
        let now = Utc::now();
        let mut record = mute_for(10, now);
        let moderator = Actor::Player(PlayerId::new());

        record.revoke(now, moderator.clone()).unwrap();
        assert_eq!(record.state, PunishmentState::Revoked);
        assert_eq!(record.ended_by, Some(moderator));
        assert_eq!(record.ended_at, Some(now));

        // A late expiry must not overwrite the revocation
        let err = record.expire(now + Duration::hours(1)).unwrap_err();
        assert!(err.is_already_terminal());
        assert_eq!(record.state, PunishmentState::Revoked);
    }

    #[test]
    fn test_permanent_never_expires() {
        let now = Utc::now();
        let mut record = Punishment::new(
            PlayerId::new(),
            PunishmentKind::Ban,
            Expiry::Permanent,
            "cheating",
            Actor::System,
            now,
        );
        assert!(record.expire(now + Duration::days(10_000)).is_err());
        assert!(!record.is_due_for_expiry(now + Duration::days(10_000)));
        assert!(record.transition(PunishmentState::Active, now, &Actor::System).is_err());
        record
            .transition(PunishmentState::Revoked, now, &Actor::Console)
            .unwrap();
        assert_eq!(record.state, PunishmentState::Revoked);
    }

    #[test]
    fn test_change_reason_keeps_identity() {
        let now = Utc::now();
        let mut record = mute_for(10, now);
        let before = record.clone();

        record.change_reason("appeal accepted, reduced wording").unwrap();
        assert_eq!(record.id, before.id);
        assert_eq!(record.expiry, before.expiry);
        assert_eq!(record.issued_at, before.issued_at);
        assert_eq!(record.reason, "appeal accepted, reduced wording");

        record.revoke(now, Actor::Console).unwrap();
        assert!(record.change_reason("too late").is_err());
    }

    #[test]
    fn test_change_expiry() {
        let now = Utc::now();
        let mut record = mute_for(10, now);

        record.change_expiry(Expiry::Permanent).unwrap();
        assert!(!record.is_due_for_expiry(now + Duration::days(365)));
        record
            .change_expiry(Expiry::At(now + Duration::minutes(1)))
            .unwrap();
        assert!(record.is_due_for_expiry(now + Duration::minutes(1)));

        record.revoke(now, Actor::Console).unwrap();
        assert!(record
            .change_expiry(Expiry::Permanent)
            .unwrap_err()
            .is_already_terminal());
    }

    #[test]
    fn test_actor_parsing() {
        let player = PlayerId::new();
        assert_eq!("system".parse::<Actor>().unwrap(), Actor::System);
        assert_eq!("console".parse::<Actor>().unwrap(), Actor::Console);
        assert_eq!(
            player.to_string().parse::<Actor>().unwrap(),
            Actor::Player(player)
        );
        assert!("moderator-bob".parse::<Actor>().is_err());
    }

    #[test]
    fn test_state_parsing() {
        for state in [
            PunishmentState::Active,
            PunishmentState::Expired,
            PunishmentState::Revoked,
        ] {
            assert_eq!(state.as_str().parse::<PunishmentState>().unwrap(), state);
        }
        assert!(!PunishmentState::Active.is_terminal());
        assert!(PunishmentState::Revoked.is_terminal());
    }

    #[test]
    fn test_log_action_display() {
        assert_eq!(LogAction::ReasonChanged.to_string(), "reason_changed");
        assert_eq!(
            "duration_changed".parse::<LogAction>().unwrap(),
            LogAction::DurationChanged
        );
        assert_eq!(
            "superseded".parse::<LogAction>().unwrap(),
            LogAction::Superseded
        );
        assert_eq!(
            LogAction::for_state(PunishmentState::Expired),
            LogAction::Expired
        );
    }
}
