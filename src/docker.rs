//! Docker engine access behind the [`Engine`] trait.
//!
//! The monitor only ever sees the neutral [`EngineEvent`] and [`Inspection`]
//! shapes, so tests can script an engine without a daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{
    ContainerInspectResponse, EventMessage, EventMessageTypeEnum, HealthConfig,
    RestartPolicyNameEnum,
};
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Datelike, Utc};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::{ContainerState, HealthStatus, Healthcheck};

const CONNECT_TIMEOUT_SECS: u64 = 120;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// One message from the engine's event feed.
#[derive(Debug, Clone, Default)]
pub struct EngineEvent {
    pub kind: String,
    pub action: String,
    pub actor_id: String,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct EngineContainerSummary {
    pub id: String,
    pub names: Vec<String>,
}

/// Snapshot derived from a container inspect call.
#[derive(Debug, Clone, Default)]
pub struct Inspection {
    pub id: String,
    pub created: Option<DateTime<Utc>>,
    pub status: ContainerState,
    pub started_at: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
    pub health_failing_streak: i64,
    pub image: String,
    pub image_id: String,
    pub user: String,
    pub labels: HashMap<String, String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub read_only_rootfs: bool,
    pub no_new_privileges: bool,
    pub restart_policy: String,
    pub healthcheck: Option<Healthcheck>,
}

impl Inspection {
    /// An auto-restart policy is any non-empty policy name other than `no`.
    pub fn has_auto_restart(&self) -> bool {
        !self.restart_policy.is_empty() && self.restart_policy != "no"
    }
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Subscribe to the engine's event feed. The channel yields one `Err`
    /// item and closes on transport failure; it closes silently on
    /// cancellation or when the engine ends the stream.
    fn events(&self, token: CancellationToken) -> mpsc::Receiver<Result<EngineEvent, EngineError>>;

    /// All containers, including stopped ones.
    async fn list_containers(&self) -> Result<Vec<EngineContainerSummary>, EngineError>;

    async fn inspect(&self, id: &str) -> Result<Inspection, EngineError>;
}

/// Bollard-backed engine client.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect(host: &str) -> Result<Self, EngineError> {
        let docker = if host.starts_with("unix://") {
            Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_local_defaults()?
        };
        Ok(Self { docker })
    }
}

#[async_trait]
impl Engine for DockerEngine {
    fn events(&self, token: CancellationToken) -> mpsc::Receiver<Result<EngineEvent, EngineError>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let docker = self.docker.clone();
        tokio::spawn(async move {
            let mut stream = Box::pin(docker.events(Some(EventsOptions::<String>::default())));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(msg)) => {
                            if tx.send(Ok(map_event(msg))).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            let _ = tx.send(Err(err.into())).await;
                            break;
                        }
                        None => break,
                    },
                }
            }
        });
        rx
    }

    async fn list_containers(&self) -> Result<Vec<EngineContainerSummary>, EngineError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let items = self.docker.list_containers(Some(options)).await?;
        Ok(items
            .into_iter()
            .map(|c| EngineContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<Inspection, EngineError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(inspection_from_response(response))
    }
}

fn map_event(msg: EventMessage) -> EngineEvent {
    let kind = match msg.typ {
        Some(EventMessageTypeEnum::CONTAINER) => "container".to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let (actor_id, attributes) = match msg.actor {
        Some(actor) => (
            actor.id.unwrap_or_default(),
            actor.attributes.unwrap_or_default(),
        ),
        None => (String::new(), HashMap::new()),
    };
    EngineEvent {
        kind,
        action: msg.action.unwrap_or_default(),
        actor_id,
        attributes,
    }
}

fn inspection_from_response(response: ContainerInspectResponse) -> Inspection {
    let state = response.state.as_ref();
    let health = state.and_then(|s| s.health.as_ref());
    let config = response.config.as_ref();
    let host = response.host_config.as_ref();

    let restart_policy = host
        .and_then(|h| h.restart_policy.as_ref())
        .and_then(|p| p.name)
        .map(restart_policy_token)
        .unwrap_or_default();
    let no_new_privileges = host
        .and_then(|h| h.security_opt.as_ref())
        .map(|opts| {
            opts.iter()
                .any(|o| o == "no-new-privileges" || o == "no-new-privileges:true")
        })
        .unwrap_or(false);

    Inspection {
        id: response.id.clone().unwrap_or_default(),
        created: parse_engine_time(response.created.as_deref()),
        status: state
            .and_then(|s| s.status)
            .map(ContainerState::from)
            .unwrap_or(ContainerState::Unknown),
        started_at: parse_engine_time(state.and_then(|s| s.started_at.as_deref())),
        health_status: health
            .and_then(|h| h.status)
            .map(HealthStatus::from)
            .unwrap_or(HealthStatus::Empty),
        health_failing_streak: health.and_then(|h| h.failing_streak).unwrap_or(0),
        image: config.and_then(|c| c.image.clone()).unwrap_or_default(),
        image_id: response.image.clone().unwrap_or_default(),
        user: config.and_then(|c| c.user.clone()).unwrap_or_default(),
        labels: config.and_then(|c| c.labels.clone()).unwrap_or_default(),
        cap_add: host.and_then(|h| h.cap_add.clone()).unwrap_or_default(),
        cap_drop: host.and_then(|h| h.cap_drop.clone()).unwrap_or_default(),
        read_only_rootfs: host.and_then(|h| h.readonly_rootfs).unwrap_or(false),
        no_new_privileges,
        restart_policy,
        healthcheck: config
            .and_then(|c| c.healthcheck.as_ref())
            .map(healthcheck_from_config),
    }
}

fn restart_policy_token(name: RestartPolicyNameEnum) -> String {
    match name {
        RestartPolicyNameEnum::EMPTY => String::new(),
        RestartPolicyNameEnum::NO => "no".to_string(),
        RestartPolicyNameEnum::ALWAYS => "always".to_string(),
        RestartPolicyNameEnum::UNLESS_STOPPED => "unless-stopped".to_string(),
        RestartPolicyNameEnum::ON_FAILURE => "on-failure".to_string(),
    }
}

fn healthcheck_from_config(hc: &HealthConfig) -> Healthcheck {
    Healthcheck {
        test: hc.test.clone().unwrap_or_default(),
        interval: duration_token(hc.interval),
        timeout: duration_token(hc.timeout),
        start_period: duration_token(hc.start_period),
        start_interval: duration_token(hc.start_interval),
        retries: hc.retries.unwrap_or(0),
    }
}

fn duration_token(nanos: Option<i64>) -> String {
    match nanos {
        Some(val) if val > 0 => format!("{:?}", std::time::Duration::from_nanos(val as u64)),
        _ => String::new(),
    }
}

/// The engine reports unset timestamps as the year-one sentinel; both that
/// and unparsable values become `None`.
fn parse_engine_time(val: Option<&str>) -> Option<DateTime<Utc>> {
    let val = val?.trim();
    if val.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(val)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .filter(|dt| dt.year() > 1)
}
