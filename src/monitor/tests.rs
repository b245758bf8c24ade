use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::mpsc;

use super::*;
use crate::api::Broadcaster;
use crate::db::Db;
use crate::docker::{EngineContainerSummary, EngineEvent};

/// Scripted engine: inspections replay per container id, repeating the last
/// snapshot once the queue drains.
#[derive(Default)]
struct MockEngine {
    listed: Mutex<Vec<EngineContainerSummary>>,
    inspects: Mutex<HashMap<String, VecDeque<Inspection>>>,
}

impl MockEngine {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push_inspection(&self, ins: Inspection) {
        let mut inspects = self.inspects.lock().expect("mock inspect lock");
        inspects.entry(ins.id.clone()).or_default().push_back(ins);
    }

    fn list(&self, id: &str, name: &str) {
        let mut listed = self.listed.lock().expect("mock list lock");
        listed.push(EngineContainerSummary {
            id: id.to_string(),
            names: vec![format!("/{name}")],
        });
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn events(
        &self,
        _token: CancellationToken,
    ) -> mpsc::Receiver<Result<EngineEvent, EngineError>> {
        // Handler-level tests drive the reducer directly.
        let (_tx, rx) = mpsc::channel(1);
        rx
    }

    async fn list_containers(&self) -> Result<Vec<EngineContainerSummary>, EngineError> {
        Ok(self.listed.lock().expect("mock list lock").clone())
    }

    async fn inspect(&self, id: &str) -> Result<Inspection, EngineError> {
        let mut inspects = self.inspects.lock().expect("mock inspect lock");
        let queue = inspects.get_mut(id).filter(|q| !q.is_empty()).ok_or_else(|| {
            EngineError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message: format!("no such container {id}"),
            })
        })?;
        if queue.len() > 1 {
            Ok(queue.pop_front().expect("drained mock queue"))
        } else {
            Ok(queue.front().expect("drained mock queue").clone())
        }
    }
}

struct Harness {
    monitor: Arc<Monitor>,
    store: Arc<Store>,
}

fn harness(engine: Arc<MockEngine>, window_seconds: u64, threshold: usize) -> Harness {
    let mut db = Db::open_in_memory().expect("open in-memory db");
    db.migrate().expect("migrate");
    let store = Arc::new(Store::new(db.into_connection()));
    store.load().expect("load store");

    let token = CancellationToken::new();
    let server = Arc::new(crate::api::Server::new(
        Arc::clone(&store),
        Arc::new(Broadcaster::new()),
        Vec::new(),
        token,
    ));
    let cfg = Config {
        restart_window_seconds: window_seconds,
        restart_threshold: threshold,
        ..Default::default()
    };
    let monitor = Arc::new(Monitor::new(&cfg, Arc::clone(&store), server, engine));
    Harness { monitor, store }
}

fn inspection(id: &str, policy: &str) -> Inspection {
    let now = Utc::now();
    Inspection {
        id: id.to_string(),
        created: Some(now - Duration::hours(3)),
        status: ContainerState::Running,
        started_at: Some(now - Duration::minutes(2)),
        image: "ghcr.io/example/imapsync:latest".to_string(),
        image_id: "sha256:image-prev".to_string(),
        user: "0:0".to_string(),
        restart_policy: policy.to_string(),
        ..Default::default()
    }
}

fn seed(store: &Store, name: &str, container_id: &str) -> Container {
    let now = Utc::now();
    store
        .upsert_container(Container {
            name: name.to_string(),
            container_id: container_id.to_string(),
            image: "ghcr.io/example/imapsync".to_string(),
            image_tag: "latest".to_string(),
            image_id: "sha256:image-prev".to_string(),
            created_at: Some(now - Duration::hours(3)),
            registered_at: Some(now - Duration::hours(3)),
            started_at: Some(now - Duration::hours(1)),
            status: ContainerState::Running,
            user: "0:0".to_string(),
            present: true,
            ..Default::default()
        })
        .expect("seed container");
    store.get_container(name).expect("seeded container")
}

#[tokio::test]
async fn test_restart_loop_detection_emits_single_loop_alert() {
    let engine = MockEngine::new();
    engine.push_inspection(inspection("cid-1", "always"));
    let h = harness(engine, 30, 3);
    seed(&h.store, "web", "cid-1");

    for _ in 0..3 {
        h.monitor
            .handle_restart_like("web", "cid-1", RestartReason::Die, Some(1), "")
            .await;
    }

    let c = h.store.get_container("web").expect("container");
    assert!(c.restart_loop);
    assert_eq!(c.restart_streak, 3);
    assert!(c.restart_loop_since.is_some());

    let alerts = h.store.list_all_alerts(0, 20).expect("list alerts");
    let loops: Vec<_> = alerts
        .iter()
        .filter(|a| a.alert_type == "restart_loop")
        .collect();
    assert_eq!(loops.len(), 1, "loop entry alerts exactly once");
    assert_eq!(loops[0].severity, Severity::Red);
    assert_eq!(loops[0].details.as_deref(), Some(r#"{"restart_count":3}"#));

    let events = h.store.list_all_events(0, 20).expect("list events");
    assert_eq!(
        events.iter().filter(|e| e.event_type == "restart").count(),
        3
    );
    assert!(events
        .iter()
        .filter(|e| e.event_type == "restart")
        .all(|e| e.reason == "die" && e.exit_code == Some(1)));
}

#[tokio::test]
async fn test_restart_loop_heals_after_quiet_window() {
    let engine = MockEngine::new();
    let h = harness(engine, 30, 3);
    let mut c = seed(&h.store, "imapsync", "cid-1");
    c.restart_loop = true;
    c.restart_streak = 6;
    c.restart_loop_since = Some(Utc::now() - Duration::minutes(20));
    h.store.upsert_container(c).expect("mark in loop");

    let c = h.store.get_container("imapsync").expect("container");
    let mut e = Event::new(
        "imapsync",
        "cid-1",
        "restart",
        "Restart event: die",
        "die",
        Utc::now() - Duration::minutes(2),
    );
    e.container_pk = c.id;
    h.store.add_event(&e).expect("seed restart event");

    h.monitor.check_heals().await;

    let healed = h.store.get_container("imapsync").expect("container");
    assert!(!healed.restart_loop);
    assert_eq!(healed.restart_streak, 0);
    assert!(healed.restart_loop_since.is_none());

    let alerts = h.store.list_all_alerts(0, 20).expect("list alerts");
    let alert = alerts
        .iter()
        .find(|a| a.alert_type == "restart_healed")
        .expect("restart_healed alert");
    assert_eq!(alert.severity, Severity::Green);
    assert_eq!(alert.message, "Restart loop healed after 6 restarts");
    assert_eq!(alert.details.as_deref(), Some(r#"{"restart_count":6}"#));
}

#[tokio::test]
async fn test_heal_waits_for_the_window_to_lapse() {
    let engine = MockEngine::new();
    let h = harness(engine, 30, 3);
    let mut c = seed(&h.store, "imapsync", "cid-1");
    c.restart_loop = true;
    c.restart_streak = 4;
    c.restart_loop_since = Some(Utc::now() - Duration::seconds(20));
    h.store.upsert_container(c).expect("mark in loop");

    let c = h.store.get_container("imapsync").expect("container");
    let mut e = Event::new(
        "imapsync",
        "cid-1",
        "restart",
        "Restart event: die",
        "die",
        Utc::now() - Duration::seconds(10),
    );
    e.container_pk = c.id;
    h.store.add_event(&e).expect("seed restart event");

    h.monitor.check_heals().await;

    let still = h.store.get_container("imapsync").expect("container");
    assert!(still.restart_loop, "recent restart keeps the loop");
    let alerts = h.store.list_all_alerts(0, 20).expect("list alerts");
    assert!(alerts.iter().all(|a| a.alert_type != "restart_healed"));
}

#[tokio::test]
async fn test_image_change_on_recreate() {
    let engine = MockEngine::new();
    let mut ins = inspection("cid-new", "no");
    ins.image = "ghcr.io/example/web:v2".to_string();
    ins.image_id = "sha256:B".to_string();
    engine.push_inspection(ins);
    let h = harness(engine, 300, 3);

    let now = Utc::now();
    h.store
        .upsert_container(Container {
            name: "web".to_string(),
            container_id: "cid-old".to_string(),
            image: "ghcr.io/example/web".to_string(),
            image_tag: "v1".to_string(),
            image_id: "sha256:A".to_string(),
            created_at: Some(now - Duration::hours(3)),
            registered_at: Some(now - Duration::hours(3)),
            status: ContainerState::Running,
            present: true,
            ..Default::default()
        })
        .expect("seed container");
    let before = h.store.get_container("web").expect("container");

    h.monitor.handle_create("web", "cid-new").await;

    let events = h.store.list_all_events(0, 20).expect("list events");
    let changed = events
        .iter()
        .find(|e| e.event_type == "image_changed")
        .expect("image_changed event");
    assert_eq!(changed.old_image_id.as_deref(), Some("sha256:A"));
    assert_eq!(changed.new_image_id.as_deref(), Some("sha256:B"));
    assert!(events.iter().any(|e| e.event_type == "created"));

    let alerts = h.store.list_all_alerts(0, 20).expect("list alerts");
    assert_eq!(alerts.len(), 1, "one alert per recreate transition");
    assert_eq!(alerts[0].alert_type, "image_changed");
    assert_eq!(alerts[0].severity, Severity::Blue);

    let after = h.store.get_container("web").expect("container");
    assert_eq!(after.container_id, "cid-new");
    assert_eq!(after.image_id, "sha256:B");
    assert_eq!(after.image_tag, "v2");
    assert_eq!(after.registered_at, before.registered_at);
}

#[tokio::test]
async fn test_recreate_without_image_change_emits_recreated() {
    let engine = MockEngine::new();
    engine.push_inspection(inspection("cid-new", "no"));
    let h = harness(engine, 300, 3);
    seed(&h.store, "imapsync", "cid-old");

    h.monitor.handle_create("imapsync", "cid-new").await;

    let events = h.store.list_all_events(0, 20).expect("list events");
    assert!(events.iter().any(|e| e.event_type == "recreated"));
    assert!(events.iter().all(|e| e.event_type != "image_changed"));

    let alerts = h.store.list_all_alerts(0, 20).expect("list alerts");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, "recreated");
    assert_eq!(alerts[0].severity, Severity::Blue);
}

#[tokio::test]
async fn test_recreate_carries_persisted_loop_state() {
    let engine = MockEngine::new();
    engine.push_inspection(inspection("cid-new", "always"));
    let h = harness(engine, 300, 3);
    let mut c = seed(&h.store, "imapsync", "cid-old");
    c.restart_loop = true;
    c.restart_streak = 5;
    c.restart_loop_since = Some(Utc::now() - Duration::minutes(3));
    h.store.upsert_container(c).expect("mark in loop");

    h.monitor.handle_create("imapsync", "cid-new").await;

    let after = h.store.get_container("imapsync").expect("container");
    assert!(after.restart_loop, "recreate does not forget the loop");
    assert_eq!(after.restart_streak, 5);
    assert!(after.restart_loop_since.is_some());
}

#[tokio::test]
async fn test_health_transitions_emit_edge_alerts_only() {
    let engine = MockEngine::new();
    let unhealthy = |streak: i64| {
        let mut ins = inspection("cid-1", "no");
        ins.health_status = HealthStatus::Unhealthy;
        ins.health_failing_streak = streak;
        ins
    };
    engine.push_inspection(unhealthy(1));
    engine.push_inspection(unhealthy(2));
    let mut recovered = inspection("cid-1", "no");
    recovered.health_status = HealthStatus::Healthy;
    engine.push_inspection(recovered);

    let h = harness(engine, 300, 3);
    seed(&h.store, "web", "cid-1");

    h.monitor
        .handle_health("web", "cid-1", HealthStatus::Unhealthy)
        .await;
    let mid = h.store.get_container("web").expect("container");
    assert_eq!(mid.health_status, HealthStatus::Unhealthy);
    assert!(mid.unhealthy_since.is_some());

    h.monitor
        .handle_health("web", "cid-1", HealthStatus::Unhealthy)
        .await;
    h.monitor
        .handle_health("web", "cid-1", HealthStatus::Healthy)
        .await;

    let after = h.store.get_container("web").expect("container");
    assert_eq!(after.health_status, HealthStatus::Healthy);
    assert!(after.unhealthy_since.is_none());

    let alerts = h.store.list_all_alerts(0, 20).expect("list alerts");
    let unhealthy_alerts: Vec<_> = alerts.iter().filter(|a| a.alert_type == "unhealthy").collect();
    let healthy_alerts: Vec<_> = alerts.iter().filter(|a| a.alert_type == "healthy").collect();
    assert_eq!(unhealthy_alerts.len(), 1);
    assert_eq!(unhealthy_alerts[0].severity, Severity::Red);
    assert_eq!(healthy_alerts.len(), 1);
    assert_eq!(healthy_alerts[0].severity, Severity::Green);
    assert_eq!(
        healthy_alerts[0].message,
        "Container became healthy after 2 failed checks"
    );
}

#[tokio::test]
async fn test_failure_without_restart_policy_alerts() {
    let engine = MockEngine::new();
    let mut ins = inspection("cid-1", "no");
    ins.status = ContainerState::Exited;
    engine.push_inspection(ins);
    let h = harness(engine, 30, 3);
    seed(&h.store, "web", "cid-1");

    h.monitor
        .handle_restart_like("web", "cid-1", RestartReason::Die, Some(137), "")
        .await;

    let events = h.store.list_all_events(0, 20).expect("list events");
    let restart = events
        .iter()
        .find(|e| e.event_type == "restart")
        .expect("restart event");
    assert_eq!(restart.reason, "die");
    assert_eq!(restart.exit_code, Some(137));

    let alerts = h.store.list_all_alerts(0, 20).expect("list alerts");
    let failure = alerts
        .iter()
        .find(|a| a.alert_type == "failure_no_restart")
        .expect("failure_no_restart alert");
    assert_eq!(failure.severity, Severity::Red);
    assert_eq!(failure.exit_code, Some(137));

    let c = h.store.get_container("web").expect("container");
    assert!(!c.restart_loop);
    assert_eq!(c.restart_streak, 0);
    assert!(!h.monitor.restarts.in_loop("web"));
}

#[tokio::test]
async fn test_oom_emits_red_alert_and_counts_toward_loop() {
    let engine = MockEngine::new();
    engine.push_inspection(inspection("cid-1", "always"));
    let h = harness(engine, 300, 3);
    seed(&h.store, "web", "cid-1");

    h.monitor
        .handle_restart_like("web", "cid-1", RestartReason::Oom, None, "")
        .await;

    let alerts = h.store.list_all_alerts(0, 20).expect("list alerts");
    let oom = alerts
        .iter()
        .find(|a| a.alert_type == "oom_killed")
        .expect("oom_killed alert");
    assert_eq!(oom.severity, Severity::Red);

    let c = h.store.get_container("web").expect("container");
    assert_eq!(c.restart_streak, 1);
}

#[tokio::test]
async fn test_started_preserves_loop_for_auto_restart_containers() {
    let engine = MockEngine::new();
    engine.push_inspection(inspection("cid-auto", "always"));
    let h = harness(engine, 300, 3);
    let mut c = seed(&h.store, "imapsync", "cid-auto");
    c.restart_loop = true;
    c.restart_streak = 7;
    c.restart_loop_since = Some(Utc::now() - Duration::minutes(2));
    h.store.upsert_container(c).expect("mark in loop");

    h.monitor.handle_start("imapsync", "cid-auto").await;
    h.monitor.handle_start("imapsync", "cid-auto").await;

    let got = h.store.get_container("imapsync").expect("container");
    assert!(got.restart_loop, "STARTED alone does not clear the loop");
    assert_eq!(got.restart_streak, 7);
    assert!(got.restart_loop_since.is_some());
}

#[tokio::test]
async fn test_started_without_policy_clears_loop_state() {
    let engine = MockEngine::new();
    engine.push_inspection(inspection("cid-1", "no"));
    let h = harness(engine, 300, 3);
    let mut c = seed(&h.store, "web", "cid-1");
    c.restart_loop = true;
    c.restart_streak = 4;
    c.restart_loop_since = Some(Utc::now() - Duration::minutes(2));
    h.store.upsert_container(c).expect("mark in loop");
    h.monitor.restarts.record("web", Utc::now());

    h.monitor.handle_start("web", "cid-1").await;

    let got = h.store.get_container("web").expect("container");
    assert!(!got.restart_loop);
    assert_eq!(got.restart_streak, 0);
    assert!(got.restart_loop_since.is_none());
    assert!(!h.monitor.restarts.in_loop("web"));
}

#[tokio::test]
async fn test_rename_collision_preserves_target_bad_state() {
    let engine = MockEngine::new();
    engine.push_inspection(inspection("cid-a", "no"));
    let h = harness(engine, 300, 3);

    let a = seed(&h.store, "a", "cid-a");
    let mut b = seed(&h.store, "b", "cid-b");
    let b_registered = b.registered_at;
    b.restart_loop = true;
    b.restart_streak = 4;
    b.restart_loop_since = Some(Utc::now() - Duration::minutes(5));
    b.health_status = HealthStatus::Unhealthy;
    b.health_failing_streak = 2;
    b.unhealthy_since = Some(Utc::now() - Duration::minutes(4));
    let b_id = h.store.upsert_container(b).expect("mark b broken");

    let mut e = Event::new("a", "cid-a", "started", "Container started", "start", Utc::now());
    e.container_pk = a.id;
    h.store.add_event(&e).expect("event under a");

    h.monitor.handle_rename("a", "b", "cid-a").await;

    let events = h.store.list_all_events(0, 20).expect("list events");
    assert!(events.iter().all(|e| e.container_pk == b_id));
    assert!(events
        .iter()
        .any(|e| e.event_type == "renamed" && e.container == "b"));

    let old = h.store.get_container("a").expect("old row kept");
    assert!(!old.present);

    let merged = h.store.get_container("b").expect("target row");
    assert_eq!(merged.id, b_id);
    assert_eq!(merged.container_id, "cid-a");
    assert_eq!(merged.registered_at, b_registered);
    assert!(merged.restart_loop, "bad state survives the rename");
    assert_eq!(merged.restart_streak, 4);
    assert_eq!(merged.health_status, HealthStatus::Unhealthy);
    assert!(merged.unhealthy_since.is_some());
}

#[tokio::test]
async fn test_absent_keeps_row_but_hides_it() {
    let engine = MockEngine::new();
    let h = harness(engine, 300, 3);
    seed(&h.store, "web", "cid-1");

    h.monitor.handle_absent("web").await;

    let c = h.store.get_container("web").expect("row kept");
    assert!(!c.present);
    assert!(h.store.list_containers().is_empty());
}

#[tokio::test]
async fn test_stop_with_clean_exit_emits_no_alert() {
    let engine = MockEngine::new();
    let mut ins = inspection("cid-1", "no");
    ins.status = ContainerState::Exited;
    engine.push_inspection(ins);
    let h = harness(engine, 300, 3);
    seed(&h.store, "web", "cid-1");

    h.monitor.handle_stop("web", "cid-1", Some(0)).await;

    let events = h.store.list_all_events(0, 20).expect("list events");
    assert!(events.iter().any(|e| e.event_type == "stopped"));
    let alerts = h.store.list_all_alerts(0, 20).expect("list alerts");
    assert!(alerts.is_empty());
}

#[tokio::test]
async fn test_reconciliation_restores_loop_from_persisted_alert() {
    let engine = MockEngine::new();
    engine.list("cid-1", "web");
    engine.push_inspection(inspection("cid-1", "always"));
    let h = harness(engine, 300, 3);
    let c = seed(&h.store, "web", "cid-1");

    let mut alert = Alert::new(
        "web",
        "cid-1",
        "restart_loop",
        Severity::Red,
        "Restart loop detected",
        Utc::now() - Duration::minutes(1),
    );
    alert.container_pk = c.id;
    alert.details = Some(r#"{"restart_count":5}"#.to_string());
    h.store.add_alert(&alert).expect("seed loop alert");

    h.monitor.sync_existing().await.expect("sync");

    let restored = h.store.get_container("web").expect("container");
    assert!(restored.restart_loop);
    assert_eq!(restored.restart_streak, 5);
    assert!(restored.restart_loop_since.is_some());
}

#[tokio::test]
async fn test_reconciliation_heals_long_running_container() {
    let engine = MockEngine::new();
    engine.list("cid-1", "web");
    // Started two minutes ago against a 30 s window: the loop is over.
    engine.push_inspection(inspection("cid-1", "always"));
    let h = harness(engine, 30, 3);
    let mut c = seed(&h.store, "web", "cid-1");
    c.restart_loop = true;
    c.restart_streak = 5;
    c.restart_loop_since = Some(Utc::now() - Duration::minutes(20));
    h.store.upsert_container(c).expect("mark in loop");

    let c = h.store.get_container("web").expect("container");
    let mut alert = Alert::new(
        "web",
        "cid-1",
        "restart_loop",
        Severity::Red,
        "Restart loop detected",
        Utc::now() - Duration::minutes(20),
    );
    alert.container_pk = c.id;
    alert.details = Some(r#"{"restart_count":5}"#.to_string());
    h.store.add_alert(&alert).expect("seed loop alert");

    h.monitor.sync_existing().await.expect("sync");

    let healed = h.store.get_container("web").expect("container");
    assert!(!healed.restart_loop);
    assert_eq!(healed.restart_streak, 0);
    assert!(healed.restart_loop_since.is_none());
}

#[tokio::test]
async fn test_reconciliation_marks_missing_containers_absent() {
    let engine = MockEngine::new();
    engine.list("cid-1", "web");
    engine.push_inspection(inspection("cid-1", "no"));
    let h = harness(engine, 300, 3);
    seed(&h.store, "web", "cid-1");
    seed(&h.store, "gone", "cid-gone");

    h.monitor.sync_existing().await.expect("sync");

    assert!(h.store.get_container("web").expect("web").present);
    assert!(!h.store.get_container("gone").expect("gone").present);
}

#[tokio::test]
async fn test_inspect_failure_still_logs_the_event() {
    // No inspection scripted for the id: every inspect fails.
    let engine = MockEngine::new();
    let h = harness(engine, 300, 3);
    seed(&h.store, "web", "cid-1");

    h.monitor
        .handle_restart_like("web", "cid-1", RestartReason::Die, Some(1), "")
        .await;

    let events = h.store.list_all_events(0, 20).expect("list events");
    assert!(events.iter().any(|e| e.event_type == "restart"));
    let c = h.store.get_container("web").expect("container");
    assert_eq!(c.status, ContainerState::Exited, "falls back to exited");
}

#[tokio::test]
async fn test_dispatch_routes_destroy_to_absent() {
    let engine = MockEngine::new();
    let h = harness(engine, 300, 3);
    seed(&h.store, "web", "cid-1");

    let msg = EngineEvent {
        kind: "container".to_string(),
        action: "destroy".to_string(),
        actor_id: "cid-1".to_string(),
        attributes: [("name".to_string(), "web".to_string())].into_iter().collect(),
    };
    h.monitor.handle_event(msg).await;

    assert!(!h.store.get_container("web").expect("container").present);
}
