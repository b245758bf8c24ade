use bollard::models::{ContainerStateStatusEnum, HealthStatusEnum};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engine-reported container state, stored as its lowercase token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerState {
    Empty,
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    NotFound,
    #[default]
    Unknown,
}

impl AsRef<str> for ContainerState {
    fn as_ref(&self) -> &str {
        match self {
            Self::Empty => "empty",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::NotFound => "not_found",
            Self::Unknown => "unknown",
        }
    }
}

impl ContainerState {
    pub fn parse(val: &str) -> Self {
        match val {
            "empty" => Self::Empty,
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            "not_found" => Self::NotFound,
            _ => Self::Unknown,
        }
    }
}

impl From<ContainerStateStatusEnum> for ContainerState {
    fn from(status: ContainerStateStatusEnum) -> Self {
        match status {
            ContainerStateStatusEnum::EMPTY => Self::Empty,
            ContainerStateStatusEnum::CREATED => Self::Created,
            ContainerStateStatusEnum::RUNNING => Self::Running,
            ContainerStateStatusEnum::PAUSED => Self::Paused,
            ContainerStateStatusEnum::RESTARTING => Self::Restarting,
            ContainerStateStatusEnum::REMOVING => Self::Removing,
            ContainerStateStatusEnum::EXITED => Self::Exited,
            ContainerStateStatusEnum::DEAD => Self::Dead,
        }
    }
}

impl Serialize for ContainerState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_ref())
    }
}

/// Healthcheck verdict. `Empty` means the container has no healthcheck at
/// all and is distinct from the engine's explicit `none`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    #[default]
    Empty,
    None,
    Starting,
    Healthy,
    Unhealthy,
}

impl AsRef<str> for HealthStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Empty => "",
            Self::None => "none",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl HealthStatus {
    pub fn parse(val: &str) -> Self {
        match val.trim().to_lowercase().as_str() {
            "none" => Self::None,
            "starting" => Self::Starting,
            "healthy" => Self::Healthy,
            "unhealthy" => Self::Unhealthy,
            _ => Self::Empty,
        }
    }
}

impl From<HealthStatusEnum> for HealthStatus {
    fn from(status: HealthStatusEnum) -> Self {
        match status {
            HealthStatusEnum::EMPTY => Self::Empty,
            HealthStatusEnum::NONE => Self::None,
            HealthStatusEnum::STARTING => Self::Starting,
            HealthStatusEnum::HEALTHY => Self::Healthy,
            HealthStatusEnum::UNHEALTHY => Self::Unhealthy,
        }
    }
}

impl Serialize for HealthStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_ref())
    }
}

/// Operational role, resolved from the `healthmon.role` container label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Service,
    Task,
}

impl AsRef<str> for Role {
    fn as_ref(&self) -> &str {
        match self {
            Self::Service => "service",
            Self::Task => "task",
        }
    }
}

impl Role {
    pub fn parse(val: &str) -> Self {
        match val.trim().to_lowercase().as_str() {
            "task" => Self::Task,
            _ => Self::Service,
        }
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_ref())
    }
}

/// Alert severity. Events in the raw log are always blue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    Red,
    Green,
    #[default]
    Blue,
}

impl AsRef<str> for Severity {
    fn as_ref(&self) -> &str {
        match self {
            Self::Red => "red",
            Self::Green => "green",
            Self::Blue => "blue",
        }
    }
}

impl Severity {
    pub fn parse(val: &str) -> Self {
        match val.trim().to_lowercase().as_str() {
            "red" => Self::Red,
            "green" => Self::Green,
            _ => Self::Blue,
        }
    }
}

impl Serialize for Severity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_ref())
    }
}

/// Healthcheck descriptor as configured on the container, persisted as a
/// JSON column and echoed through API payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Healthcheck {
    pub test: Vec<String>,
    pub interval: String,
    pub timeout: String,
    pub start_period: String,
    pub start_interval: String,
    pub retries: i64,
}

/// One monitored container. Unique by `name`; `id` is the store-assigned
/// surrogate that stays stable across engine container-id rotations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Container {
    pub id: i64,
    pub name: String,
    pub container_id: String,
    pub image: String,
    pub image_tag: String,
    pub image_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub registered_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub status: ContainerState,
    pub role: Role,
    pub caps: Vec<String>,
    pub read_only: bool,
    pub no_new_privileges: bool,
    pub user: String,
    pub last_event_id: i64,
    pub updated_at: Option<DateTime<Utc>>,
    pub present: bool,
    pub health_status: HealthStatus,
    pub health_failing_streak: i64,
    pub unhealthy_since: Option<DateTime<Utc>>,
    pub restart_loop: bool,
    pub restart_streak: i64,
    pub restart_loop_since: Option<DateTime<Utc>>,
    pub healthcheck: Option<Healthcheck>,
}

/// Append-only log row; never mutated after insert apart from the repair
/// and rename re-pointing of `container_pk`.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: i64,
    pub container_pk: i64,
    pub container: String,
    pub container_id: String,
    pub event_type: String,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub old_image: Option<String>,
    pub new_image: Option<String>,
    pub old_image_id: Option<String>,
    pub new_image_id: Option<String>,
    pub reason: String,
    pub details: Option<String>,
    pub exit_code: Option<i64>,
}

impl Event {
    pub fn new(
        container: &str,
        container_id: &str,
        event_type: &str,
        message: impl Into<String>,
        reason: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            container_pk: 0,
            container: container.to_string(),
            container_id: container_id.to_string(),
            event_type: event_type.to_string(),
            severity: Severity::Blue,
            message: message.into(),
            timestamp,
            old_image: None,
            new_image: None,
            old_image_id: None,
            new_image_id: None,
            reason: reason.to_string(),
            details: None,
            exit_code: None,
        }
    }
}

/// Derived operator-facing notification; a proper subset of conditions,
/// not a copy of the event log.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub id: i64,
    pub container_pk: i64,
    pub container: String,
    pub container_id: String,
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub old_image: Option<String>,
    pub new_image: Option<String>,
    pub old_image_id: Option<String>,
    pub new_image_id: Option<String>,
    pub reason: String,
    pub details: Option<String>,
    pub exit_code: Option<i64>,
}

impl Alert {
    pub fn new(
        container: &str,
        container_id: &str,
        alert_type: &str,
        severity: Severity,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            container_pk: 0,
            container: container.to_string(),
            container_id: container_id.to_string(),
            alert_type: alert_type.to_string(),
            severity,
            message: message.into(),
            timestamp,
            old_image: None,
            new_image: None,
            old_image_id: None,
            new_image_id: None,
            reason: String::new(),
            details: None,
            exit_code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_state_token_round_trip() {
        for state in [
            ContainerState::Empty,
            ContainerState::Created,
            ContainerState::Running,
            ContainerState::Paused,
            ContainerState::Restarting,
            ContainerState::Removing,
            ContainerState::Exited,
            ContainerState::Dead,
            ContainerState::NotFound,
            ContainerState::Unknown,
        ] {
            assert_eq!(ContainerState::parse(state.as_ref()), state);
        }
        assert_eq!(ContainerState::parse("levitating"), ContainerState::Unknown);
    }

    #[test]
    fn test_health_status_distinguishes_empty_from_none() {
        assert_eq!(HealthStatus::parse(""), HealthStatus::Empty);
        assert_eq!(HealthStatus::parse("none"), HealthStatus::None);
        assert_eq!(HealthStatus::parse(" UNHEALTHY "), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_severity_defaults_to_blue() {
        assert_eq!(Severity::parse("red"), Severity::Red);
        assert_eq!(Severity::parse("green"), Severity::Green);
        assert_eq!(Severity::parse("purple"), Severity::Blue);
    }
}
