//! The event interpreter and state engine.
//!
//! One reducer task consumes classified engine events serially, reconciles
//! each with an inspect snapshot, runs restart-loop detection, writes the
//! store, and emits broadcast records and derived alerts. A companion tick
//! task heals restart loops once the window lapses.

mod action;
mod tracker;

#[cfg(test)]
mod tests;

pub use action::{classify, ContainerAction, RestartReason};
pub use tracker::RestartTracker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::api::{AlertResponse, ContainerResponse, EventResponse, EventUpdate, Server};
use crate::config::Config;
use crate::docker::{Engine, EngineError, Inspection};
use crate::notify::Telegram;
use crate::store::{
    Alert, Container, ContainerState, Event, HealthStatus, Role, Severity, Store, StoreError,
};

const HEAL_TICK: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("engine event stream ended")]
    StreamClosed,
}

pub struct Monitor {
    store: Arc<Store>,
    server: Arc<Server>,
    engine: Arc<dyn Engine>,
    notifier: Option<Arc<Telegram>>,
    restarts: RestartTracker,
    cap_default: Vec<String>,
}

impl Monitor {
    pub fn new(
        cfg: &Config,
        store: Arc<Store>,
        server: Arc<Server>,
        engine: Arc<dyn Engine>,
    ) -> Self {
        Self {
            store,
            server,
            engine,
            notifier: Telegram::new(
                cfg.telegram_enabled,
                &cfg.telegram_token,
                &cfg.telegram_chat_id,
            )
            .map(Arc::new),
            restarts: RestartTracker::new(cfg.restart_window_seconds, cfg.restart_threshold),
            cap_default: default_caps(),
        }
    }

    /// Reconcile existing containers, then consume the engine event stream
    /// until cancellation or a transport failure.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), MonitorError> {
        self.sync_existing().await?;

        let heal = {
            let monitor = Arc::clone(&self);
            let token = token.clone();
            tokio::spawn(async move { monitor.run_heal_loop(token).await })
        };

        let mut events = self.engine.events(token.clone());
        let result = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                item = events.recv() => match item {
                    Some(Ok(msg)) => self.handle_event(msg).await,
                    Some(Err(err)) => break Err(err.into()),
                    None => break Err(MonitorError::StreamClosed),
                },
            }
        };
        heal.abort();
        result
    }

    async fn run_heal_loop(&self, token: CancellationToken) {
        let mut tick = tokio::time::interval(HEAL_TICK);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tick.tick() => self.check_heals().await,
            }
        }
    }

    async fn handle_event(&self, msg: crate::docker::EngineEvent) {
        let Some(action) = classify(&msg, &self.store) else {
            return;
        };
        if !matches!(action, ContainerAction::Health { .. }) {
            log::info!(
                "event: container={} action={} id={}",
                action.container_name(),
                msg.action,
                msg.actor_id
            );
        }

        match action {
            ContainerAction::Created { name, id } => self.handle_create(&name, &id).await,
            ContainerAction::Started { name, id } => self.handle_start(&name, &id).await,
            ContainerAction::Stopped {
                name,
                id,
                exit_code,
            } => self.handle_stop(&name, &id, exit_code).await,
            ContainerAction::RestartLike {
                name,
                id,
                reason,
                exit_code,
            } => {
                self.handle_restart_like(&name, &id, reason, exit_code, "")
                    .await
            }
            ContainerAction::Signal { name, id, signal } => {
                self.handle_signal(&name, &id, &signal).await
            }
            ContainerAction::Health { name, id, status } => {
                self.handle_health(&name, &id, status).await
            }
            ContainerAction::Rename {
                old_name,
                new_name,
                id,
            } => self.handle_rename(&old_name, &new_name, &id).await,
            ContainerAction::Absent { name } => self.handle_absent(&name).await,
        }
    }

    /// Startup reconciliation: seed the store from a full engine listing,
    /// restore restart-loop flags from the latest persisted loop alert, and
    /// mark tracked-but-missing containers absent.
    async fn sync_existing(&self) -> Result<(), MonitorError> {
        let listed = self.engine.list_containers().await?;
        let mut present_names = HashSet::new();

        for item in listed {
            let Some(raw_name) = item.names.first() else {
                continue;
            };
            let name = raw_name.trim_start_matches('/').to_string();
            present_names.insert(name.clone());

            let ins = match self.engine.inspect(&item.id).await {
                Ok(ins) => ins,
                Err(err) => {
                    log::warn!("inspect {} failed during sync: {}", item.id, err);
                    continue;
                }
            };
            let auto_restart = ins.has_auto_restart();
            let mut info = self.inspect_to_container(&ins);
            info.name = name.clone();
            let now = Utc::now();

            if let Some(existing) = self.store.get_container(&name) {
                info.registered_at = existing.registered_at;
                if info.started_at.is_none() {
                    info.started_at = existing.started_at;
                }
                info.unhealthy_since = existing.unhealthy_since;
                normalize_unhealthy_since(&mut info, now);
                if auto_restart {
                    info.restart_loop = existing.restart_loop;
                    info.restart_streak = existing.restart_streak;
                    info.restart_loop_since = existing.restart_loop_since;
                    match self.store.latest_restart_loop_alert(existing.id) {
                        Ok(Some(alert)) if alert.alert_type == "restart_loop" => {
                            info.restart_loop = true;
                            let count = parse_restart_count(alert.details.as_deref());
                            if count > 0 {
                                info.restart_streak = count;
                            }
                            info.restart_loop_since = Some(alert.timestamp);
                        }
                        Ok(Some(alert)) if alert.alert_type == "restart_healed" => {
                            info.restart_loop = false;
                            info.restart_streak = 0;
                            info.restart_loop_since = None;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            log::warn!("restart loop alert lookup failed for {}: {}", name, err)
                        }
                    }
                    // If the monitor was down and the container has been
                    // running longer than the window, the loop is over.
                    if info.restart_loop && info.status == ContainerState::Running {
                        if let Some(started) = info.started_at {
                            if now - started > self.restarts.window() {
                                info.restart_loop = false;
                                info.restart_streak = 0;
                                info.restart_loop_since = None;
                                self.restarts.mark_healed(&name);
                            }
                        }
                    }
                } else {
                    info.restart_loop = false;
                    info.restart_streak = 0;
                    info.restart_loop_since = None;
                    self.restarts.reset(&name);
                }
            }
            normalize_unhealthy_since(&mut info, now);
            if info.registered_at.is_none() {
                info.registered_at = registered_fallback(info.created_at, now);
            }
            self.store.upsert_container(info)?;
        }

        self.store.mark_absent_except(&present_names)?;
        Ok(())
    }

    async fn handle_create(&self, name: &str, id: &str) {
        let now = Utc::now();
        let inspection = self.try_inspect(id).await;
        let mut new_info = match &inspection {
            Some(ins) => self.inspect_to_container(ins),
            None => self.cached_fallback(name, id, now),
        };
        new_info.name = name.to_string();

        let existing = self.store.get_container(name);
        if let Some(existing) = &existing {
            new_info.registered_at = existing.registered_at;
            if new_info.started_at.is_none() {
                new_info.started_at = existing.started_at;
            }
            new_info.unhealthy_since = existing.unhealthy_since;
            if new_info.health_status != HealthStatus::Unhealthy {
                new_info.unhealthy_since = None;
            }
            new_info.restart_loop_since = existing.restart_loop_since;
        } else {
            new_info.registered_at = registered_fallback(new_info.created_at, now);
        }
        if new_info.health_status == HealthStatus::Unhealthy && new_info.unhealthy_since.is_none() {
            new_info.unhealthy_since = Some(now);
        }

        if let Some(existing) = existing.filter(|e| e.container_id != id) {
            // Same name, new engine id: a recreate. The loop verdict
            // survives it.
            self.restarts.reset(name);
            if existing.restart_loop {
                new_info.restart_loop = true;
                new_info.restart_streak = existing.restart_streak;
                new_info.restart_loop_since = existing.restart_loop_since;
            } else {
                new_info.restart_loop = false;
                new_info.restart_streak = 0;
                new_info.restart_loop_since = None;
            }

            let image_changed = existing.image_id != new_info.image_id
                || existing.image_tag != new_info.image_tag;
            if image_changed {
                let mut e = Event::new(
                    name,
                    id,
                    "image_changed",
                    format!("Image changed {} -> {}", existing.image, new_info.image),
                    "recreate",
                    now,
                );
                e.old_image = Some(existing.image.clone());
                e.new_image = Some(new_info.image.clone());
                e.old_image_id = Some(existing.image_id.clone());
                e.new_image_id = Some(new_info.image_id.clone());
                self.emit_event(e).await;
                self.emit_alert(name, id, "image_changed", "Container image updated", Severity::Blue, None)
                    .await;
            } else {
                let mut e = Event::new(name, id, "recreated", "Container recreated", "recreate", now);
                e.old_image = Some(existing.image.clone());
                e.new_image = Some(new_info.image.clone());
                e.old_image_id = Some(existing.image_id.clone());
                e.new_image_id = Some(new_info.image_id.clone());
                self.emit_event(e).await;
                self.emit_alert(name, id, "recreated", "Container recreated", Severity::Blue, None)
                    .await;
            }
        }

        if let Err(err) = self.store.upsert_container(new_info) {
            log::error!("container upsert failed for {}: {}", name, err);
        }
        self.emit_info(name, id, "created", "Container created", "create", None)
            .await;
    }

    async fn handle_start(&self, name: &str, id: &str) {
        let now = Utc::now();
        let inspection = self.try_inspect(id).await;
        let mut info = match &inspection {
            Some(ins) => self.inspect_to_container(ins),
            None => self.cached_fallback(name, id, now),
        };
        info.name = name.to_string();

        // Inspect failure keeps the persisted loop verdict untouched.
        let auto_restart = inspection
            .as_ref()
            .map(Inspection::has_auto_restart)
            .unwrap_or(true);
        if !auto_restart {
            info.restart_loop = false;
            info.restart_streak = 0;
            info.restart_loop_since = None;
            self.restarts.reset(name);
        }
        if let Some(existing) = self.store.get_container(name) {
            info.registered_at = existing.registered_at;
            if info.started_at.is_none() {
                info.started_at = existing.started_at;
            }
            info.unhealthy_since = existing.unhealthy_since;
            if info.health_status != HealthStatus::Unhealthy {
                info.unhealthy_since = None;
            }
            if auto_restart {
                info.restart_loop = existing.restart_loop;
                info.restart_streak = existing.restart_streak;
                info.restart_loop_since = existing.restart_loop_since;
            }
        }
        if info.health_status == HealthStatus::Unhealthy && info.unhealthy_since.is_none() {
            info.unhealthy_since = Some(now);
        }
        if info.registered_at.is_none() {
            info.registered_at = registered_fallback(info.created_at, now);
        }
        if info.started_at.is_none() {
            info.started_at = Some(now);
        }

        if let Err(err) = self.store.upsert_container(info) {
            log::error!("container upsert failed for {}: {}", name, err);
        }
        self.emit_info(name, id, "started", "Container started", "start", None)
            .await;
    }

    async fn handle_stop(&self, name: &str, id: &str, exit_code: Option<i64>) {
        let now = Utc::now();
        let mut stopped = Event::new(name, id, "stopped", "Container stopped", "stop", now);
        stopped.exit_code = exit_code;
        self.emit_event(stopped).await;

        match self.try_inspect(id).await {
            Some(ins) => {
                let mut info = self.inspect_to_container(&ins);
                info.name = name.to_string();
                if let Some(existing) = self.store.get_container(name) {
                    info.registered_at = existing.registered_at;
                    info.started_at = existing.started_at;
                    info.unhealthy_since = existing.unhealthy_since;
                    info.restart_loop = existing.restart_loop;
                    info.restart_streak = existing.restart_streak;
                    info.restart_loop_since = existing.restart_loop_since;
                }
                if info.health_status != HealthStatus::Unhealthy {
                    info.unhealthy_since = None;
                }
                if info.registered_at.is_none() {
                    info.registered_at = registered_fallback(info.created_at, now);
                }
                if info.started_at.is_none() {
                    info.started_at = Some(now);
                }
                if let Err(err) = self.store.upsert_container(info) {
                    log::error!("container upsert failed for {}: {}", name, err);
                }
                if should_alert_failure_no_restart(&ins, exit_code, false) {
                    self.emit_alert(
                        name,
                        id,
                        "failure_no_restart",
                        "Container failed without restart policy",
                        Severity::Red,
                        exit_code,
                    )
                    .await;
                }
            }
            None => self.mark_exited(name, now),
        }
    }

    async fn handle_restart_like(
        &self,
        name: &str,
        id: &str,
        reason: RestartReason,
        exit_code: Option<i64>,
        signal: &str,
    ) {
        let now = Utc::now();
        let inspection = self.try_inspect(id).await;
        let has_auto_restart = inspection
            .as_ref()
            .map(Inspection::has_auto_restart)
            .unwrap_or(false);
        let was_in_loop = self
            .store
            .get_container(name)
            .map(|c| c.restart_loop)
            .unwrap_or(false);
        if !has_auto_restart {
            self.restarts.reset(name);
        }

        let (streak, entered_loop) = if has_auto_restart {
            self.restarts.record(name, now)
        } else {
            (0, false)
        };
        let in_loop = has_auto_restart && (self.restarts.in_loop(name) || was_in_loop);

        let message = if signal.is_empty() {
            format!("Restart event: {}", reason.as_ref())
        } else {
            format!("Restart event: {} (signal {})", reason.as_ref(), signal)
        };
        self.emit_info(name, id, "restart", message, reason.as_ref(), exit_code)
            .await;

        if let Some(mut c) = self.store.get_container(name) {
            c.restart_loop = in_loop;
            if c.restart_loop {
                if c.restart_streak <= 0 || entered_loop {
                    c.restart_streak = streak as i64;
                } else {
                    c.restart_streak += 1;
                }
            } else {
                c.restart_streak = streak as i64;
            }
            if c.restart_loop {
                if c.restart_loop_since.is_none() {
                    c.restart_loop_since = Some(now);
                }
            } else {
                c.restart_loop_since = None;
            }
            c.updated_at = Some(now);
            if let Err(err) = self.store.upsert_container(c) {
                log::error!("container upsert failed for {}: {}", name, err);
            }
        }

        if reason == RestartReason::Oom {
            self.emit_alert(
                name,
                id,
                "oom_killed",
                "Container killed by OOM",
                Severity::Red,
                exit_code,
            )
            .await;
        }
        if entered_loop && !was_in_loop {
            let mut alert = Alert::new(
                name,
                id,
                "restart_loop",
                Severity::Red,
                "Restart loop detected",
                now,
            );
            alert.details = Some(restart_count_details(streak as i64));
            self.emit_alert_record(alert).await;
        }

        match inspection {
            Some(ins) => {
                let mut info = self.inspect_to_container(&ins);
                info.name = name.to_string();
                let mut loop_streak = streak as i64;
                if let Some(existing) = self.store.get_container(name) {
                    info.registered_at = existing.registered_at;
                    info.started_at = existing.started_at;
                    info.unhealthy_since = existing.unhealthy_since;
                    normalize_unhealthy_since(&mut info, now);
                    info.restart_loop_since = existing.restart_loop_since;
                    loop_streak = existing.restart_streak;
                }
                info.restart_loop = in_loop;
                info.restart_streak = loop_streak;
                if info.restart_loop {
                    if info.restart_loop_since.is_none() {
                        info.restart_loop_since = Some(now);
                    }
                } else {
                    info.restart_loop_since = None;
                }
                if info.registered_at.is_none() {
                    info.registered_at = registered_fallback(info.created_at, now);
                }
                if info.started_at.is_none() {
                    info.started_at = Some(now);
                }
                if let Err(err) = self.store.upsert_container(info) {
                    log::error!("container upsert failed for {}: {}", name, err);
                }
                if should_alert_failure_no_restart(&ins, exit_code, reason == RestartReason::Oom) {
                    self.emit_alert(
                        name,
                        id,
                        "failure_no_restart",
                        "Container failed without restart policy",
                        Severity::Red,
                        exit_code,
                    )
                    .await;
                }
            }
            None => self.mark_exited(name, now),
        }
    }

    async fn handle_signal(&self, name: &str, id: &str, signal: &str) {
        let (message, reason) = if signal.is_empty() {
            ("Signal sent".to_string(), "signal".to_string())
        } else {
            (
                format!("Signal sent: {}", signal),
                format!("signal_{}", signal.to_lowercase()),
            )
        };
        self.emit_info(name, id, "signal", message, &reason, None)
            .await;
    }

    async fn handle_health(&self, name: &str, id: &str, status_token: HealthStatus) {
        let mut status = status_token;
        let existing = self.store.get_container(name);
        let prev_status = existing
            .as_ref()
            .map(|c| c.health_status)
            .unwrap_or_default();
        let mut prev_streak = existing
            .as_ref()
            .map(|c| c.health_failing_streak)
            .unwrap_or(0);

        match self.try_inspect(id).await {
            Some(ins) => {
                let now = Utc::now();
                let mut info = self.inspect_to_container(&ins);
                info.name = name.to_string();
                if let Some(existing) = &existing {
                    info.registered_at = existing.registered_at;
                    info.started_at = existing.started_at;
                    info.unhealthy_since = existing.unhealthy_since;
                    info.restart_loop = existing.restart_loop;
                    info.restart_streak = existing.restart_streak;
                    info.restart_loop_since = existing.restart_loop_since;
                }
                normalize_unhealthy_since(&mut info, now);
                if info.registered_at.is_none() {
                    info.registered_at = registered_fallback(info.created_at, now);
                }
                status = info.health_status;
                prev_streak = prev_streak.max(info.health_failing_streak);
                if let Err(err) = self.store.upsert_container(info) {
                    log::error!("container upsert failed for {}: {}", name, err);
                }
            }
            None => {
                if let Some(mut existing) = existing.clone() {
                    let now = Utc::now();
                    existing.health_status = status;
                    if status == HealthStatus::Unhealthy {
                        existing.health_failing_streak = prev_streak + 1;
                        if existing.unhealthy_since.is_none() {
                            existing.unhealthy_since = Some(now);
                        }
                    } else if status == HealthStatus::Healthy {
                        existing.health_failing_streak = 0;
                        existing.unhealthy_since = None;
                    }
                    existing.updated_at = Some(now);
                    if let Err(err) = self.store.upsert_container(existing) {
                        log::error!("container upsert failed for {}: {}", name, err);
                    }
                }
            }
        }

        match status {
            HealthStatus::Unhealthy => {
                if prev_status != HealthStatus::Unhealthy {
                    self.emit_alert(
                        name,
                        id,
                        "unhealthy",
                        "Container became unhealthy",
                        Severity::Red,
                        None,
                    )
                    .await;
                }
            }
            HealthStatus::Healthy => {
                if prev_status == HealthStatus::Unhealthy || prev_streak > 0 {
                    let message = if prev_streak > 0 {
                        format!("Container became healthy after {} failed checks", prev_streak)
                    } else {
                        "Container became healthy".to_string()
                    };
                    self.emit_alert(name, id, "healthy", message, Severity::Green, None)
                        .await;
                }
            }
            _ => {}
        }
    }

    async fn handle_rename(&self, old_name: &str, new_name: &str, id: &str) {
        let target = self.store.get_container(new_name);
        let Some(ins) = self.try_inspect(id).await else {
            return;
        };
        let mut info = self.inspect_to_container(&ins);
        info.name = new_name.to_string();
        if let Some(existing) = self.store.get_container(old_name) {
            info.registered_at = existing.registered_at;
            info.started_at = existing.started_at;
            info.last_event_id = existing.last_event_id;
        }
        // A rename onto a tracked name replaces that logical container; the
        // surviving surrogate keeps its registration, and its bad state
        // holds until the healing rules clear it.
        if let Some(target) = &target {
            if target.registered_at.is_some() {
                info.registered_at = target.registered_at;
            }
            if target.restart_loop {
                info.restart_loop = true;
                info.restart_loop_since = target.restart_loop_since;
                if info.restart_streak < target.restart_streak {
                    info.restart_streak = target.restart_streak;
                }
            }
            if target.health_status == HealthStatus::Unhealthy {
                info.health_status = target.health_status;
                info.health_failing_streak =
                    info.health_failing_streak.max(target.health_failing_streak);
                info.unhealthy_since = target.unhealthy_since;
            }
        }
        if info.registered_at.is_none() {
            info.registered_at = registered_fallback(info.created_at, Utc::now());
        }
        self.restarts.reset(old_name);
        self.restarts.reset(new_name);
        if let Err(err) = self.store.rename_container(old_name, new_name, info) {
            log::error!("rename persist failed for {}: {}", new_name, err);
        }
        self.emit_info(
            new_name,
            id,
            "renamed",
            format!("Container renamed {} -> {}", old_name, new_name),
            "rename",
            None,
        )
        .await;
    }

    async fn handle_absent(&self, name: &str) {
        if let Err(err) = self.store.set_container_present(name, false) {
            log::error!("presence update failed for {}: {}", name, err);
        }
        let update = EventUpdate {
            container: ContainerResponse {
                name: name.to_string(),
                present: false,
                ..Default::default()
            },
            event: None,
            alert: None,
            container_event_total: None,
            event_total: None,
            alert_total: None,
        };
        self.server.broadcast(update).await;
    }

    /// Downgrade running containers whose restart loop has gone quiet for a
    /// full window. This is the only exit from loop to healed.
    pub(crate) async fn check_heals(&self) {
        let now = Utc::now();
        for c in self.store.list_containers() {
            if !c.restart_loop || c.status != ContainerState::Running {
                continue;
            }

            let last_restart = match self.store.latest_restart_timestamp(c.id) {
                Ok(ts) => ts,
                Err(err) => {
                    log::warn!("restart heal check failed for {}: {}", c.name, err);
                    continue;
                }
            };
            if let Some(ts) = last_restart {
                if now - ts <= self.restarts.window() {
                    continue;
                }
            }

            let name = c.name.clone();
            let container_id = c.container_id.clone();
            let streak = c.restart_streak;
            let mut healed = c;
            healed.restart_loop = false;
            healed.restart_streak = 0;
            healed.restart_loop_since = None;
            healed.updated_at = Some(now);
            if let Err(err) = self.store.upsert_container(healed) {
                log::error!("container upsert failed for {}: {}", name, err);
                continue;
            }
            self.restarts.mark_healed(&name);

            let message = if streak > 0 {
                format!("Restart loop healed after {} restarts", streak)
            } else {
                "Restart loop healed".to_string()
            };
            let mut alert = Alert::new(
                &name,
                &container_id,
                "restart_healed",
                Severity::Green,
                message,
                now,
            );
            alert.details = Some(restart_count_details(streak));
            self.emit_alert_record(alert).await;
        }
    }

    async fn try_inspect(&self, id: &str) -> Option<Inspection> {
        match self.engine.inspect(id).await {
            Ok(ins) => Some(ins),
            Err(err) => {
                log::warn!("inspect {} failed: {}", id, err);
                None
            }
        }
    }

    /// Snapshot to fall back on when inspect is unavailable: the cached row
    /// under the incoming engine id, or a bare shell for a new name.
    fn cached_fallback(&self, name: &str, id: &str, now: DateTime<Utc>) -> Container {
        let mut c = self.store.get_container(name).unwrap_or_else(|| Container {
            name: name.to_string(),
            ..Default::default()
        });
        c.container_id = id.to_string();
        c.present = true;
        c.updated_at = Some(now);
        c
    }

    fn mark_exited(&self, name: &str, now: DateTime<Utc>) {
        if let Some(mut existing) = self.store.get_container(name) {
            existing.status = ContainerState::Exited;
            existing.updated_at = Some(now);
            if existing.registered_at.is_none() {
                existing.registered_at = registered_fallback(existing.created_at, now);
            }
            if let Err(err) = self.store.upsert_container(existing) {
                log::error!("container upsert failed for {}: {}", name, err);
            }
        }
    }

    async fn emit_info(
        &self,
        name: &str,
        id: &str,
        event_type: &str,
        message: impl Into<String>,
        reason: &str,
        exit_code: Option<i64>,
    ) {
        let mut e = Event::new(name, id, event_type, message, reason, Utc::now());
        e.exit_code = exit_code;
        self.emit_event(e).await;
    }

    async fn emit_alert(
        &self,
        name: &str,
        id: &str,
        alert_type: &str,
        message: impl Into<String>,
        severity: Severity,
        exit_code: Option<i64>,
    ) {
        let mut a = Alert::new(name, id, alert_type, severity, message, Utc::now());
        a.exit_code = exit_code;
        self.emit_alert_record(a).await;
    }

    async fn emit_event(&self, mut e: Event) {
        let Some(container) = self.resolve_container(&e.container_id, &e.container) else {
            return;
        };
        e.container = container.name.clone();
        e.container_pk = container.id;
        log::info!(
            "event: type={} severity={} container={}",
            e.event_type,
            e.severity.as_ref(),
            e.container
        );
        let id = match self.store.add_event(&e) {
            Ok(id) => id,
            Err(err) => {
                log::error!("event persist failed: {}", err);
                return;
            }
        };
        e.id = id;
        let container = self.store.get_container(&container.name).unwrap_or(container);

        let event_total = match self.store.count_all_events() {
            Ok(total) => Some(total),
            Err(err) => {
                log::warn!("event total count failed: {}", err);
                None
            }
        };
        let container_event_total = match self.store.count_events_by_container(&container.name) {
            Ok(total) => Some(total),
            Err(err) => {
                log::warn!("container event total count failed: {}", err);
                None
            }
        };

        let update = EventUpdate {
            container: ContainerResponse::from(&container),
            event: Some(EventResponse::from(&e)),
            alert: None,
            container_event_total,
            event_total,
            alert_total: None,
        };
        self.server.broadcast(update).await;
    }

    async fn emit_alert_record(&self, mut a: Alert) {
        let Some(container) = self.resolve_container(&a.container_id, &a.container) else {
            return;
        };
        a.container = container.name.clone();
        a.container_pk = container.id;
        log::info!(
            "alert: type={} severity={} container={}",
            a.alert_type,
            a.severity.as_ref(),
            a.container
        );
        let id = match self.store.add_alert(&a) {
            Ok(id) => id,
            Err(err) => {
                log::error!("alert persist failed: {}", err);
                return;
            }
        };
        a.id = id;
        let container = self.store.get_container(&container.name).unwrap_or(container);

        let alert_total = match self.store.count_all_alerts() {
            Ok(total) => Some(total),
            Err(err) => {
                log::warn!("alert total count failed: {}", err);
                None
            }
        };

        let update = EventUpdate {
            container: ContainerResponse::from(&container),
            event: None,
            alert: Some(AlertResponse::from(&a)),
            container_event_total: None,
            event_total: None,
            alert_total,
        };
        self.server.broadcast(update).await;

        if let Some(notifier) = &self.notifier {
            let notifier = Arc::clone(notifier);
            let text = format!(
                "[{}] {}: {}",
                a.severity.as_ref().to_uppercase(),
                a.container,
                a.message
            );
            tokio::spawn(async move {
                if let Err(err) = notifier.send(&text).await {
                    log::warn!("telegram send failed: {}", err);
                }
            });
        }
    }

    fn resolve_container(&self, container_id: &str, name: &str) -> Option<Container> {
        if !container_id.is_empty() {
            match self.store.get_container_by_container_id(container_id) {
                Ok(Some(c)) => return Some(c),
                Ok(None) => {}
                Err(err) => log::warn!("container lookup by id failed: {}", err),
            }
        }
        self.store.get_container(name)
    }

    fn inspect_to_container(&self, ins: &Inspection) -> Container {
        let (image, image_tag) = parse_image(&ins.image);
        let user = if ins.user.is_empty() {
            "0:0".to_string()
        } else {
            ins.user.clone()
        };
        Container {
            container_id: ins.id.clone(),
            image,
            image_tag,
            image_id: ins.image_id.clone(),
            created_at: ins.created,
            started_at: ins.started_at,
            status: ins.status,
            role: resolve_role(&ins.labels),
            caps: resolve_caps(&self.cap_default, &ins.cap_add, &ins.cap_drop),
            read_only: ins.read_only_rootfs,
            no_new_privileges: ins.no_new_privileges,
            user,
            health_status: ins.health_status,
            health_failing_streak: ins.health_failing_streak,
            healthcheck: ins.healthcheck.clone(),
            updated_at: Some(Utc::now()),
            present: true,
            ..Default::default()
        }
    }
}

fn normalize_unhealthy_since(info: &mut Container, now: DateTime<Utc>) {
    if info.health_status == HealthStatus::Unhealthy {
        if info.unhealthy_since.is_none() {
            info.unhealthy_since = Some(now);
        }
    } else {
        info.unhealthy_since = None;
    }
}

fn registered_fallback(created_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(match created_at {
        Some(created) if created < now => created,
        _ => now,
    })
}

fn should_alert_failure_no_restart(ins: &Inspection, exit_code: Option<i64>, oom: bool) -> bool {
    if ins.has_auto_restart() || oom {
        return false;
    }
    matches!(exit_code, Some(code) if code != 0)
}

fn restart_count_details(count: i64) -> String {
    serde_json::json!({ "restart_count": count }).to_string()
}

fn parse_restart_count(details: Option<&str>) -> i64 {
    let raw = details.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return 0;
    }
    #[derive(serde::Deserialize)]
    struct Details {
        #[serde(default)]
        restart_count: i64,
    }
    serde_json::from_str::<Details>(raw)
        .map(|d| d.restart_count)
        .unwrap_or(0)
}

fn resolve_role(labels: &HashMap<String, String>) -> Role {
    labels
        .get("healthmon.role")
        .map(|role| Role::parse(role))
        .unwrap_or_default()
}

fn parse_image(image: &str) -> (String, String) {
    if image.is_empty() {
        return (String::new(), String::new());
    }
    if let Some((name, _digest)) = image.split_once('@') {
        return (name.to_string(), String::new());
    }
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name.to_string(), tag.to_string()),
        _ => (image.to_string(), "latest".to_string()),
    }
}

fn resolve_caps(defaults: &[String], add: &[String], drop: &[String]) -> Vec<String> {
    let mut caps: HashSet<String> = defaults.iter().cloned().collect();
    if drop.iter().any(|cap| cap.eq_ignore_ascii_case("ALL")) {
        caps.clear();
    }
    for cap in drop {
        caps.remove(&cap.to_uppercase());
    }
    for cap in add {
        caps.insert(cap.to_uppercase());
    }
    let mut out: Vec<String> = caps.into_iter().collect();
    out.sort();
    out
}

/// The engine's default capability set for unprivileged containers.
fn default_caps() -> Vec<String> {
    [
        "CAP_AUDIT_WRITE",
        "CAP_CHOWN",
        "CAP_DAC_OVERRIDE",
        "CAP_FOWNER",
        "CAP_FSETID",
        "CAP_KILL",
        "CAP_MKNOD",
        "CAP_NET_BIND_SERVICE",
        "CAP_NET_RAW",
        "CAP_SETFCAP",
        "CAP_SETGID",
        "CAP_SETPCAP",
        "CAP_SETUID",
        "CAP_SYS_CHROOT",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}
