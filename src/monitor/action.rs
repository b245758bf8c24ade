use crate::docker::EngineEvent;
use crate::store::{HealthStatus, Store};

/// Why a restart-like event fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    Die,
    Restart,
    Oom,
}

impl AsRef<str> for RestartReason {
    fn as_ref(&self) -> &str {
        match self {
            Self::Die => "die",
            Self::Restart => "restart",
            Self::Oom => "oom",
        }
    }
}

/// Classified engine message. The reducer is a total function over this
/// enum; everything stringly-typed stops at the classifier.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerAction {
    Created {
        name: String,
        id: String,
    },
    Started {
        name: String,
        id: String,
    },
    Stopped {
        name: String,
        id: String,
        exit_code: Option<i64>,
    },
    RestartLike {
        name: String,
        id: String,
        reason: RestartReason,
        exit_code: Option<i64>,
    },
    Signal {
        name: String,
        id: String,
        signal: String,
    },
    Health {
        name: String,
        id: String,
        status: HealthStatus,
    },
    Rename {
        old_name: String,
        new_name: String,
        id: String,
    },
    Absent {
        name: String,
    },
}

impl ContainerAction {
    pub fn container_name(&self) -> &str {
        match self {
            Self::Created { name, .. }
            | Self::Started { name, .. }
            | Self::Stopped { name, .. }
            | Self::RestartLike { name, .. }
            | Self::Signal { name, .. }
            | Self::Health { name, .. }
            | Self::Absent { name } => name,
            Self::Rename { new_name, .. } => new_name,
        }
    }
}

/// Map an engine message to an internal action. Returns `None` for
/// non-container messages, healthcheck-exec noise, unknown actions, and
/// messages whose container name cannot be resolved.
pub fn classify(msg: &EngineEvent, store: &Store) -> Option<ContainerAction> {
    if msg.kind != "container" {
        return None;
    }
    if is_healthcheck_exec(msg) {
        return None;
    }

    let mut name = msg
        .attributes
        .get("name")
        .map(String::as_str)
        .unwrap_or_default()
        .to_string();
    if name.is_empty() && !msg.actor_id.is_empty() {
        if let Some(known) = store.find_container_by_id(&msg.actor_id) {
            name = known.name;
        }
    }
    let name = name.trim_start_matches('/').to_string();
    if name.is_empty() {
        return None;
    }
    let id = msg.actor_id.clone();

    match msg.action.as_str() {
        "create" => Some(ContainerAction::Created { name, id }),
        "start" => Some(ContainerAction::Started { name, id }),
        "stop" => Some(ContainerAction::Stopped {
            name,
            id,
            exit_code: parse_exit_code(msg.attributes.get("exitCode")),
        }),
        "die" => {
            let exit_code = parse_exit_code(msg.attributes.get("exitCode"));
            match exit_code {
                None | Some(0) => Some(ContainerAction::Stopped {
                    name,
                    id,
                    exit_code,
                }),
                Some(_) => Some(ContainerAction::RestartLike {
                    name,
                    id,
                    reason: RestartReason::Die,
                    exit_code,
                }),
            }
        }
        "restart" => Some(ContainerAction::RestartLike {
            name,
            id,
            reason: RestartReason::Restart,
            exit_code: None,
        }),
        "oom" => Some(ContainerAction::RestartLike {
            name,
            id,
            reason: RestartReason::Oom,
            exit_code: None,
        }),
        "kill" => Some(ContainerAction::Signal {
            name,
            id,
            signal: msg
                .attributes
                .get("signal")
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
        }),
        "rename" => {
            let old_name = msg
                .attributes
                .get("oldName")
                .or_else(|| msg.attributes.get("old_name"))
                .map(|s| s.trim_start_matches('/').to_string())
                .unwrap_or_default();
            if old_name.is_empty() {
                return None;
            }
            Some(ContainerAction::Rename {
                old_name,
                new_name: name,
                id,
            })
        }
        "destroy" | "remove" | "rm" => Some(ContainerAction::Absent { name }),
        action => {
            if let Some(status) = action.strip_prefix("health_status:") {
                Some(ContainerAction::Health {
                    name,
                    id,
                    status: HealthStatus::parse(status),
                })
            } else {
                None
            }
        }
    }
}

fn is_healthcheck_exec(msg: &EngineEvent) -> bool {
    if !msg.action.starts_with("exec_") {
        return false;
    }
    msg.attributes
        .get("execCommand")
        .map(|cmd| cmd.to_lowercase().contains("healthcheck"))
        .unwrap_or(false)
}

fn parse_exit_code(val: Option<&String>) -> Option<i64> {
    val?.trim().parse().ok()
}
