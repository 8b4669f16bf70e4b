//! End-to-end scenarios against a context wired with `InMemoryLocation`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use steward_core::app::{BoxError, Effector, EffectorContext, ManagementContext};
use steward_core::config::RuntimeConfig;
use steward_core::domain::effector::{CHECK_HEALTH, DESTROY, START, STOP};
use steward_core::domain::sensor::web;
use steward_core::domain::{
    AttributeValue, EffectorSpec, EffectorStatus, EntityConfig, EntityId, InvokeOptions,
    Lifecycle, LocationAction, Parameters, PolicySpec, SERVICE_STATE, SERVICE_UP, SensorEvent, StewardError,
    SubscriptionFilter,
};
use steward_core::impls::{InMemoryLocation, InMemoryMementoStore};
use steward_core::policies::RESTARTS_EXHAUSTED;
use steward_core::ports::{Location, MementoStore};
use steward_core::testing::{AppTracker, Repeater, succeeds_eventually};
use steward_core::{BuildError, ContextBuilder, TypeDescriptor};

struct ScaleUp(Arc<AtomicUsize>);

#[async_trait]
impl Effector for ScaleUp {
    fn spec(&self) -> EffectorSpec {
        EffectorSpec::new("scaleUp", "Add capacity")
    }

    async fn invoke(&self, _ctx: &EffectorContext, _params: Parameters) -> steward_core::Result<serde_json::Value> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({ "scaled": n }))
    }
}

fn builder(location: Arc<InMemoryLocation>) -> ContextBuilder {
    ContextBuilder::new()
        .register_type(TypeDescriptor::group("app"))
        .register_type(
            TypeDescriptor::new("webserver")
                .sensor(web::REQUEST_COUNT)
                .sensor(web::REQUESTS_PER_SECOND),
        )
        .with_location(location)
}

fn setup() -> (Arc<InMemoryLocation>, ManagementContext) {
    let localhost = Arc::new(InMemoryLocation::new("localhost"));
    let ctx = builder(localhost.clone()).build().unwrap();
    (localhost, ctx)
}

fn named(name: &str) -> EntityConfig {
    EntityConfig::new().with("name", name)
}

/// app with web-1 and web-2.
fn app_tree(ctx: &ManagementContext) -> (EntityId, EntityId, EntityId) {
    let app = ctx.create_entity("app", named("app"), None).unwrap();
    let web1 = ctx.create_entity("webserver", named("web-1"), Some(app)).unwrap();
    let web2 = ctx.create_entity("webserver", named("web-2"), Some(app)).unwrap();
    (app, web1, web2)
}

fn recorder(ctx: &ManagementContext, filter: SubscriptionFilter) -> Arc<Mutex<Vec<SensorEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    ctx.subscribe(
        filter,
        Arc::new(move |ev: &SensorEvent| -> Result<(), BoxError> {
            sink.lock().unwrap().push(ev.clone());
            Ok(())
        }),
    )
    .unwrap();
    seen
}

async fn run(ctx: &ManagementContext, id: EntityId, effector: &str) -> steward_core::Result<serde_json::Value> {
    ctx.invoke(id, effector, Parameters::new())?.wait().await
}

#[tokio::test]
async fn start_and_stop_drive_is_up() {
    let (localhost, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    assert_eq!(ctx.attribute(web, SERVICE_UP.name()).unwrap(), Some(AttributeValue::Bool(false)));

    run(&ctx, web, START).await.unwrap();
    assert_eq!(ctx.lifecycle(web).unwrap(), Lifecycle::Running);
    assert_eq!(ctx.attribute(web, SERVICE_UP.name()).unwrap(), Some(AttributeValue::Bool(true)));
    let handle = ctx.entity(web).unwrap().location().unwrap();
    assert!(localhost.is_running(handle.id));

    run(&ctx, web, STOP).await.unwrap();
    assert_eq!(ctx.lifecycle(web).unwrap(), Lifecycle::Stopped);
    assert_eq!(ctx.attribute(web, SERVICE_UP.name()).unwrap(), Some(AttributeValue::Bool(false)));
    assert_eq!(localhost.machine_count(), 0);
}

#[tokio::test]
async fn sequence_numbers_strictly_increase() {
    let (_, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    let seen = recorder(&ctx, SubscriptionFilter::entity(web).sensor(web::REQUEST_COUNT.name()));

    for n in 1..=20 {
        ctx.set_sensor(web, &web::REQUEST_COUNT, AttributeValue::Integer(n)).unwrap();
    }

    succeeds_eventually("twenty events", || {
        if seen.lock().unwrap().len() == 20 { Ok(()) } else { Err("pending") }
    })
    .await
    .unwrap();
    let seen = seen.lock().unwrap();
    assert!(seen.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert_eq!(seen.last().unwrap().value, AttributeValue::Integer(20));
}

#[tokio::test]
async fn stop_when_stopped_is_silent() {
    let (_, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    run(&ctx, web, START).await.unwrap();
    run(&ctx, web, STOP).await.unwrap();

    let seen = recorder(&ctx, SubscriptionFilter::entity(web));
    run(&ctx, web, STOP).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(ctx.lifecycle(web).unwrap(), Lifecycle::Stopped);
}

#[tokio::test]
async fn concurrent_starts_take_one_lifecycle_path() {
    let (localhost, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    let seen = recorder(&ctx, SubscriptionFilter::entity(web).sensor(SERVICE_STATE.name()));

    let first = ctx.invoke(web, START, Parameters::new()).unwrap();
    let second = ctx.invoke(web, START, Parameters::new()).unwrap();
    first.wait().await.unwrap();
    second.wait().await.unwrap();

    Repeater::new("running observed")
        .until(|| {
            let seen = seen.lock().unwrap();
            if seen.iter().any(|e| e.value.as_str() == Some("RUNNING")) { Ok(()) } else { Err("pending") }
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let states: Vec<String> = seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| e.value.as_str().map(str::to_string))
        .collect();
    assert_eq!(states, ["STARTING", "RUNNING"]);
    assert_eq!(localhost.machine_count(), 1);
}

#[tokio::test]
async fn invalid_invocations_fail_synchronously() {
    let (_, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();

    let err = ctx.invoke(web, "deploy", Parameters::new()).unwrap_err();
    assert!(matches!(err, StewardError::EffectorNotFound { .. }));

    let mut params = Parameters::new();
    params.insert("location".into(), AttributeValue::Integer(1));
    let err = ctx.invoke(web, START, params).unwrap_err();
    assert!(matches!(err, StewardError::InvalidParameter(_) | StewardError::TypeMismatch { .. }));

    let err = ctx.invoke(EntityId::generate(), START, Parameters::new()).unwrap_err();
    assert!(matches!(err, StewardError::EntityNotFound(_)));

    assert_eq!(ctx.lifecycle(web).unwrap(), Lifecycle::Created);
}

#[tokio::test]
async fn start_failure_leaves_entity_on_fire() {
    let (localhost, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    localhost.fail_action("launch", "port in use");

    let err = run(&ctx, web, START).await.unwrap_err();
    assert!(matches!(err, StewardError::EffectorFailed { .. }));
    assert_eq!(ctx.lifecycle(web).unwrap(), Lifecycle::OnFire);

    localhost.clear_failures();
    run(&ctx, web, "restart").await.unwrap();
    assert_eq!(ctx.lifecycle(web).unwrap(), Lifecycle::Running);
}

#[tokio::test]
async fn lifecycle_sensors_are_not_externally_writable() {
    let (_, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    let err = ctx
        .set_sensor(web, &SERVICE_UP, AttributeValue::Bool(true))
        .unwrap_err();
    assert!(matches!(err, StewardError::InvalidParameter(_)));

    let err = ctx
        .set_sensor(web, &web::REQUEST_COUNT, AttributeValue::Text("ten".into()))
        .unwrap_err();
    assert!(matches!(err, StewardError::TypeMismatch { .. }));
}

#[tokio::test]
async fn rebind_reproduces_the_tree() {
    let localhost = Arc::new(InMemoryLocation::new("localhost"));
    let builder = builder(localhost.clone());
    let ctx = builder.clone().build().unwrap();
    let (app, web1, web2) = app_tree(&ctx);
    run(&ctx, app, START).await.unwrap();
    ctx.set_sensor(web1, &web::REQUEST_COUNT, AttributeValue::Integer(7)).unwrap();
    ctx.add_policy_spec(web1, PolicySpec::new("health-check", json!({ "interval_ms": 60_000 })))
        .unwrap();

    let store = InMemoryMementoStore::new();
    ctx.persist(&store).await.unwrap();
    let before = ctx.snapshot().unwrap();
    ctx.terminate().await;

    let set = store.load().await.unwrap().unwrap();
    let rebound = builder.clone().rebind(&set).await.unwrap();

    assert_eq!(rebound.roots(), vec![app]);
    assert_eq!(rebound.children(app).unwrap(), vec![web1, web2]);
    for memento in &before.entities {
        let entity = rebound.entity(memento.id).unwrap();
        assert_eq!(entity.type_name(), memento.type_name);
        assert_eq!(entity.lifecycle(), memento.lifecycle);
        assert_eq!(entity.attributes().snapshot(), memento.attributes);
    }
    assert_eq!(rebound.attribute(web1, web::REQUEST_COUNT.name()).unwrap(), Some(AttributeValue::Integer(7)));
    assert_eq!(rebound.policies(web1).unwrap().len(), 1);
    assert_eq!(rebound.location_usage()["localhost"], 2);

    // a second rebind is independent of the first
    let other = builder.rebind(&set).await.unwrap();
    rebound.destroy_entity(app).await.unwrap();
    assert!(matches!(rebound.entity(web1), Err(StewardError::EntityNotFound(_))));
    assert_eq!(other.lifecycle(web1).unwrap(), Lifecycle::Running);
    other.terminate().await;
}

#[tokio::test]
async fn rebind_restores_sequences_without_events() {
    let localhost = Arc::new(InMemoryLocation::new("localhost"));
    let ctx = builder(localhost.clone()).build().unwrap();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    for n in 1..=3 {
        ctx.set_sensor(web, &web::REQUEST_COUNT, AttributeValue::Integer(n)).unwrap();
    }
    let set = ctx.snapshot().unwrap();

    let rebound = builder(localhost).rebind(&set).await.unwrap();
    let seen = recorder(&rebound, SubscriptionFilter::entity(web).sensor(web::REQUEST_COUNT.name()));
    rebound.set_sensor(web, &web::REQUEST_COUNT, AttributeValue::Integer(4)).unwrap();

    succeeds_eventually("one event", || {
        if seen.lock().unwrap().len() == 1 { Ok(()) } else { Err("pending") }
    })
    .await
    .unwrap();
    assert_eq!(seen.lock().unwrap()[0].sequence, 4);
}

#[tokio::test]
async fn rebind_rejects_unknown_types_and_dangling_ids() {
    let (_, ctx) = setup();
    let (app, web1, _) = app_tree(&ctx);
    let set = ctx.snapshot().unwrap();

    let mut unknown = set.clone();
    unknown.entities.iter_mut().find(|m| m.id == web1).unwrap().type_name = "database".into();
    let err = builder(Arc::new(InMemoryLocation::new("localhost")))
        .rebind(&unknown)
        .await
        .unwrap_err();
    assert_eq!(err, BuildError::Rebind(StewardError::UnknownType("database".into())));

    let mut dangling = set.clone();
    dangling.entities.retain(|m| m.id != web1);
    let err = builder(Arc::new(InMemoryLocation::new("localhost")))
        .rebind(&dangling)
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::Rebind(StewardError::DanglingReference(_))));

    let mut duplicated = set;
    let copy = duplicated.get(app).unwrap().clone();
    duplicated.entities.push(copy);
    let err = builder(Arc::new(InMemoryLocation::new("localhost")))
        .rebind(&duplicated)
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::Rebind(StewardError::MalformedMemento(_))));
}

#[tokio::test]
async fn rebind_failure_releases_reattached_handles() {
    let localhost = Arc::new(InMemoryLocation::new("localhost"));
    let remote = Arc::new(InMemoryLocation::new("remote"));
    let ctx = builder(localhost.clone())
        .with_location(remote.clone())
        .build()
        .unwrap();
    let app = ctx.create_entity("app", named("app"), None).unwrap();
    ctx.create_entity("webserver", named("web-1").with("location", "localhost"), Some(app))
        .unwrap();
    ctx.create_entity("webserver", named("web-2").with("location", "remote"), Some(app))
        .unwrap();
    run(&ctx, app, START).await.unwrap();
    let set = ctx.snapshot().unwrap();

    // fresh back-ends: localhost adopts web-1, remote refuses web-2
    let localhost2 = Arc::new(InMemoryLocation::new("localhost"));
    let remote2 = Arc::new(InMemoryLocation::new("remote"));
    remote2.fail_reattach(true);
    let err = builder(localhost2.clone())
        .with_location(remote2.clone())
        .rebind(&set)
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Rebind(StewardError::LocationUnavailable(_))));
    assert_eq!(localhost2.actions(), ["reattach", "release"]);
    assert_eq!(localhost2.machine_count(), 0);
    // the original context still owns its machines
    assert_eq!(localhost.machine_count(), 1);
    assert_eq!(remote.machine_count(), 1);
}

#[tokio::test]
async fn windowed_rate_rises_then_returns_to_zero() {
    let localhost = Arc::new(InMemoryLocation::new("localhost"));
    let mut config = RuntimeConfig::default();
    config.policies.rate_window_ms = 1_000;
    config.policies.rate_period_ms = 50;
    let ctx = builder(localhost).with_config(config).build().unwrap();
    let (_, web1, _) = app_tree(&ctx);

    ctx.add_policy_spec(
        web1,
        PolicySpec::new("windowed-rate", json!({ "source": web::REQUEST_COUNT.name() })),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    for n in 1..=10 {
        ctx.set_sensor(web1, &web::REQUEST_COUNT, AttributeValue::Integer(n)).unwrap();
    }

    let rate = || -> Result<f64, String> {
        let value = ctx
            .attribute(web1, web::REQUESTS_PER_SECOND.name())
            .map_err(|e| e.to_string())?
            .and_then(|v| v.as_f64())
            .ok_or("no rate yet")?;
        Ok(value)
    };

    Repeater::new("rate close to 10/s")
        .limit_time(Duration::from_secs(2))
        .until(|| match rate() {
            Ok(r) if (r - 10.0).abs() < 0.5 => Ok(r),
            Ok(r) => Err(format!("rate {r}")),
            Err(e) => Err(e),
        })
        .await
        .unwrap();

    Repeater::new("rate back to zero")
        .limit_time(Duration::from_secs(3))
        .until(|| match rate() {
            Ok(r) if r == 0.0 => Ok(()),
            Ok(r) => Err(format!("rate {r}")),
            Err(e) => Err(e),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn destroying_parent_destroys_the_subtree() {
    let (localhost, ctx) = setup();
    let (app, web1, web2) = app_tree(&ctx);
    run(&ctx, app, START).await.unwrap();
    assert_eq!(localhost.machine_count(), 2);
    // the filter covers the app itself as well
    let seen = recorder(&ctx, SubscriptionFilter::descendants_of(app).sensor(SERVICE_STATE.name()));

    ctx.destroy_entity(app).await.unwrap();

    for id in [app, web1, web2] {
        assert!(matches!(ctx.entity(id), Err(StewardError::EntityNotFound(_))));
    }
    assert!(ctx.roots().is_empty());
    assert_eq!(localhost.machine_count(), 0);
    assert!(matches!(
        ctx.destroy_entity(app).await,
        Err(StewardError::EntityNotFound(_))
    ));

    let expected = BTreeSet::from([app, web1, web2]);
    succeeds_eventually("all three DESTROYED", || {
        let destroyed: BTreeSet<EntityId> = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.value.as_str() == Some("DESTROYED"))
            .map(|e| e.source)
            .collect();
        if destroyed == expected { Ok(()) } else { Err(format!("{destroyed:?}")) }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn child_created_during_destroy_is_rejected() {
    let (localhost, ctx) = setup();
    let app = ctx.create_entity("app", named("app"), None).unwrap();
    ctx.create_entity("webserver", named("web-1"), Some(app)).unwrap();
    run(&ctx, app, START).await.unwrap();
    localhost.delay_action("stop", Duration::from_millis(200));

    let destroying = ctx.invoke(app, DESTROY, Parameters::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let late = ctx.create_entity("webserver", named("web-late"), Some(app));
    assert_eq!(late, Err(StewardError::EntityDestroyed(app)));

    destroying.wait().await.unwrap();
    assert!(matches!(ctx.entity(app), Err(StewardError::EntityNotFound(_))));
    assert!(ctx.roots().is_empty());
    assert!(ctx.snapshot().unwrap().entities.is_empty());
    assert_eq!(localhost.machine_count(), 0);
}

#[tokio::test]
async fn start_queued_behind_destroy_fails_with_entity_destroyed() {
    let (localhost, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    run(&ctx, web, START).await.unwrap();
    localhost.delay_action("stop", Duration::from_millis(100));

    let destroying = ctx.invoke(web, DESTROY, Parameters::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let queued = ctx.invoke(web, START, Parameters::new()).unwrap();

    destroying.wait().await.unwrap();
    assert_eq!(queued.wait().await, Err(StewardError::EntityDestroyed(web)));
    assert_eq!(queued.status(), EffectorStatus::Failed);
    assert!(matches!(
        ctx.invoke(web, START, Parameters::new()),
        Err(StewardError::EntityNotFound(_))
    ));
}

#[tokio::test]
async fn timed_out_invocation_keeps_running() {
    let (localhost, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    localhost.delay_action("launch", Duration::from_millis(300));

    let handle = ctx
        .invoke_with(web, START, Parameters::new(), InvokeOptions::with_timeout(Duration::from_millis(30)))
        .unwrap();

    Repeater::new("timed out")
        .until(|| if handle.status() == EffectorStatus::TimedOut { Ok(()) } else { Err(handle.status()) })
        .await
        .unwrap();
    assert_eq!(ctx.lifecycle(web).unwrap(), Lifecycle::Starting);
    assert!(handle.outcome().is_none());

    handle.wait().await.unwrap();
    assert_eq!(handle.status(), EffectorStatus::Succeeded);
    assert_eq!(ctx.lifecycle(web).unwrap(), Lifecycle::Running);
}

#[tokio::test]
async fn cancel_before_commit_restores_state() {
    let (localhost, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    localhost.delay_action("provision", Duration::from_millis(300));

    let handle = ctx.invoke(web, START, Parameters::new()).unwrap();
    Repeater::new("starting")
        .until(|| match ctx.lifecycle(web) {
            Ok(Lifecycle::Starting) => Ok(()),
            other => Err(format!("{other:?}")),
        })
        .await
        .unwrap();

    assert!(handle.cancel());
    assert_eq!(handle.wait().await, Err(StewardError::Cancelled));
    assert_eq!(handle.status(), EffectorStatus::Cancelled);
    assert_eq!(ctx.lifecycle(web).unwrap(), Lifecycle::Created);
    assert_eq!(localhost.machine_count(), 0);
    assert!(ctx.entity(web).unwrap().location().is_none());
}

#[tokio::test]
async fn cancel_after_commit_sets_on_fire() {
    let (localhost, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    localhost.delay_action("launch", Duration::from_millis(300));

    let handle = ctx.invoke(web, START, Parameters::new()).unwrap();
    Repeater::new("machine provisioned")
        .until(|| if localhost.machine_count() == 1 { Ok(()) } else { Err("pending") })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(handle.cancel());
    assert_eq!(handle.wait().await, Err(StewardError::Cancelled));
    assert_eq!(ctx.lifecycle(web).unwrap(), Lifecycle::OnFire);
    assert!(!handle.cancel());
}

#[tokio::test]
async fn health_check_policy_detects_a_dead_machine() {
    let (localhost, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    run(&ctx, web, START).await.unwrap();
    ctx.add_policy_spec(web, PolicySpec::new("health-check", json!({ "interval_ms": 20 })))
        .unwrap();

    let handle = ctx.entity(web).unwrap().location().unwrap();
    assert!(localhost.kill(handle.id));

    succeeds_eventually("on fire", || match ctx.lifecycle(web) {
        Ok(Lifecycle::OnFire) => Ok(()),
        other => Err(format!("{other:?}")),
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn check_health_recovers_when_healthy_again() {
    let (localhost, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    run(&ctx, web, START).await.unwrap();
    let handle = ctx.entity(web).unwrap().location().unwrap();

    localhost.kill(handle.id);
    let report = run(&ctx, web, CHECK_HEALTH).await.unwrap();
    assert_eq!(report["healthy"], false);
    assert_eq!(ctx.lifecycle(web).unwrap(), Lifecycle::OnFire);

    localhost
        .execute(&handle, &LocationAction::new("launch"))
        .await
        .unwrap();
    run(&ctx, web, CHECK_HEALTH).await.unwrap();
    assert_eq!(ctx.lifecycle(web).unwrap(), Lifecycle::Running);
}

#[tokio::test]
async fn restarter_brings_a_failed_service_back() {
    let (localhost, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    run(&ctx, web, START).await.unwrap();
    ctx.add_policy_spec(web, PolicySpec::new("service-restarter", json!({ "base_delay_ms": 10 })))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let old = ctx.entity(web).unwrap().location().unwrap();
    localhost.kill(old.id);
    run(&ctx, web, CHECK_HEALTH).await.unwrap();

    succeeds_eventually("restarted", || {
        let entity = ctx.entity(web).map_err(|e| e.to_string())?;
        match (entity.lifecycle(), entity.location()) {
            (Lifecycle::Running, Some(handle)) if handle.id != old.id => Ok(()),
            (state, _) => Err(state.to_string()),
        }
    })
    .await
    .unwrap();
    assert_eq!(localhost.machine_count(), 1);
}

#[tokio::test]
async fn restarter_gives_up_after_its_budget() {
    let (localhost, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    run(&ctx, web, START).await.unwrap();
    ctx.add_policy_spec(
        web,
        PolicySpec::new("service-restarter", json!({ "base_delay_ms": 5, "max_attempts": 2 })),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    localhost.fail_action("launch", "broken image");
    let handle = ctx.entity(web).unwrap().location().unwrap();
    localhost.kill(handle.id);
    run(&ctx, web, CHECK_HEALTH).await.unwrap();

    succeeds_eventually("gave up", || {
        match ctx.attribute(web, RESTARTS_EXHAUSTED.name()) {
            Ok(Some(AttributeValue::Bool(true))) => Ok(()),
            other => Err(format!("{other:?}")),
        }
    })
    .await
    .unwrap();
    assert_eq!(ctx.lifecycle(web).unwrap(), Lifecycle::OnFire);
    let launches = localhost.actions().iter().filter(|a| *a == "launch").count();
    assert_eq!(launches, 3);
}

#[tokio::test]
async fn threshold_policy_fires_with_hysteresis() {
    let calls = Arc::new(AtomicUsize::new(0));
    let ctx = ContextBuilder::new()
        .register_type(
            TypeDescriptor::new("webserver")
                .sensor(web::REQUESTS_PER_SECOND)
                .effector(ScaleUp(calls.clone())),
        )
        .with_location(Arc::new(InMemoryLocation::new("localhost")))
        .build()
        .unwrap();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    ctx.add_policy_spec(
        web,
        PolicySpec::new(
            "threshold",
            json!({
                "sensor": web::REQUESTS_PER_SECOND.name(),
                "upper": 5.0,
                "lower": 2.0,
                "effector": "scaleUp"
            }),
        ),
    )
    .unwrap();

    for rate in [1.0, 6.0, 7.0, 4.0, 6.0, 1.0, 8.0] {
        ctx.set_sensor(web, &web::REQUESTS_PER_SECOND, AttributeValue::Double(rate)).unwrap();
    }

    succeeds_eventually("two scale-ups", || {
        match calls.load(Ordering::SeqCst) {
            2 => Ok(()),
            n => Err(n),
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn removed_policy_stops_reacting() {
    let localhost = Arc::new(InMemoryLocation::new("localhost"));
    let mut config = RuntimeConfig::default();
    config.policies.rate_period_ms = 20;
    let ctx = builder(localhost).with_config(config).build().unwrap();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();

    let id = ctx
        .add_policy_spec(web, PolicySpec::new("windowed-rate", json!({ "source": web::REQUEST_COUNT.name() })))
        .unwrap();
    succeeds_eventually("rate published", || {
        ctx.attribute(web, web::REQUESTS_PER_SECOND.name())
            .ok()
            .flatten()
            .ok_or("pending")
    })
    .await
    .unwrap();

    ctx.remove_policy(id).unwrap();
    assert!(ctx.policies(web).unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(30)).await;
    let seen = recorder(&ctx, SubscriptionFilter::entity(web).sensor(web::REQUESTS_PER_SECOND.name()));
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(seen.lock().unwrap().is_empty());

    assert!(matches!(ctx.remove_policy(id), Err(StewardError::PolicyNotFound(_))));
}

#[tokio::test]
async fn unknown_policy_type_is_rejected() {
    let (_, ctx) = setup();
    let web = ctx.create_entity("webserver", named("web-1"), None).unwrap();
    let err = ctx
        .add_policy_spec(web, PolicySpec::new("autoscaler", json!({})))
        .unwrap_err();
    assert_eq!(err, StewardError::PolicyNotFound("autoscaler".into()));
}

#[tokio::test]
async fn terminate_refuses_work_and_releases_locations() {
    let (localhost, ctx) = setup();
    let (app, web1, _) = app_tree(&ctx);
    run(&ctx, app, START).await.unwrap();

    ctx.terminate().await;

    assert_eq!(localhost.machine_count(), 0);
    assert_eq!(ctx.lifecycle(web1).unwrap(), Lifecycle::Running);
    assert_eq!(
        ctx.create_entity("webserver", EntityConfig::new(), None),
        Err(StewardError::ContextTerminated)
    );
    assert!(matches!(
        ctx.invoke(web1, STOP, Parameters::new()),
        Err(StewardError::ContextTerminated)
    ));
    assert!(matches!(
        ctx.subscribe(SubscriptionFilter::any(), Arc::new(|_: &SensorEvent| -> Result<(), BoxError> { Ok(()) })),
        Err(StewardError::ContextTerminated)
    ));
    assert_eq!(ctx.snapshot(), Err(StewardError::ContextTerminated));
}

#[tokio::test]
async fn tracker_destroys_every_application() {
    let (localhost, ctx) = setup();
    let tracker = AppTracker::new();
    for name in ["shop", "blog"] {
        let app = tracker.track(ctx.create_entity("app", named(name), None).unwrap());
        ctx.create_entity("webserver", named(&format!("{name}-web")), Some(app)).unwrap();
        run(&ctx, app, START).await.unwrap();
    }
    assert_eq!(localhost.machine_count(), 2);

    let first = tracker.tracked()[0];
    ctx.destroy_entity(first).await.unwrap();
    tracker.destroy_all(&ctx).await.unwrap();

    assert!(ctx.roots().is_empty());
    assert!(tracker.tracked().is_empty());
    assert_eq!(localhost.machine_count(), 0);
}

#[tokio::test]
async fn descendant_subscription_sees_children_only_under_the_root() {
    let (_, ctx) = setup();
    let (app, web1, web2) = app_tree(&ctx);
    let other = ctx.create_entity("webserver", named("other"), None).unwrap();
    let seen = recorder(&ctx, SubscriptionFilter::descendants_of(app).sensor(web::REQUEST_COUNT.name()));

    for id in [web1, web2, other] {
        ctx.set_sensor(id, &web::REQUEST_COUNT, AttributeValue::Integer(1)).unwrap();
    }

    succeeds_eventually("two events", || {
        if seen.lock().unwrap().len() == 2 { Ok(()) } else { Err("pending") }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let sources: BTreeSet<EntityId> = seen.lock().unwrap().iter().map(|e| e.source).collect();
    assert_eq!(sources, BTreeSet::from([web1, web2]));
}
