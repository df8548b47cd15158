//! End-to-end behaviour of a mounted kernel.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use grimoire_kernel::{
    CapabilityState, Driver, ErrorKind, EventLog, Kernel, KernelConfig, KernelError, KernelEvent,
    MemoryDriver, OpenMode, Payload, Record, ResourceFacade, ResourceKind, RetryPolicy,
    SqliteDriver, Tier, VirtualPath,
};

fn p(s: &str) -> VirtualPath {
    VirtualPath::parse(s).unwrap()
}

fn config() -> KernelConfig {
    KernelConfig::default().with_retry(
        &RetryPolicy::default()
            .with_max_attempts(2)
            .with_initial_delay(Duration::from_millis(1)),
    )
}

fn valeros(level: u64) -> Record {
    Record::from_json(
        ResourceKind::Character,
        json!({"id": 42, "name": "Valeros", "level": level, "entity_id": 1}),
    )
    .unwrap()
}

async fn mounted(config: KernelConfig, driver: Arc<MemoryDriver>) -> Arc<Kernel> {
    let kernel = Kernel::new(config);
    let cap = kernel.register_capability(driver);
    kernel.mount(&p("/dev/db"), cap).await.unwrap();
    Arc::new(kernel)
}

#[tokio::test]
async fn open_materializes_missing_character() {
    let driver = Arc::new(MemoryDriver::with_records([valeros(5)]));
    let kernel = mounted(config(), Arc::clone(&driver)).await;
    assert!(!kernel.exists(&p("/proc/character/42")));

    let fd = kernel.open(&p("/proc/character/42"), OpenMode::Read).await.unwrap();
    let payload = kernel.read(fd).unwrap();
    assert!(kernel.close(fd));

    assert_eq!(payload, Payload::Record(valeros(5)));
    assert_eq!(driver.calls().get_by_id, 1);
    assert!(kernel.stat(&p("/proc/character/42")).unwrap().has_content);
    assert!(!kernel.exists(&p("/proc/character/42.lock")));
    assert!(kernel.fds().is_empty());

    // Second open is served from the node without touching the driver.
    let guard = kernel.open_guarded(&p("/proc/character/42"), OpenMode::Read).await.unwrap();
    assert_eq!(guard.read().unwrap(), payload);
    drop(guard);
    assert_eq!(driver.calls().reads(), 1);
}

#[tokio::test]
async fn open_unknown_character_is_not_found() {
    let kernel = mounted(config(), Arc::new(MemoryDriver::new())).await;
    let err = kernel.open(&p("/proc/character/404"), OpenMode::Read).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathNotFound);
    assert_eq!(err.code(), -1);
    assert!(kernel.fds().is_empty());
}

#[tokio::test]
async fn cache_warming_limits_driver_calls() {
    let driver = Arc::new(MemoryDriver::with_records([valeros(5)]));
    let facade = ResourceFacade::new(mounted(config(), Arc::clone(&driver)).await);

    let tiers = [
        facade.get_complete_resource(ResourceKind::Character, &"42".into()).await.unwrap().tier,
        facade.get_complete_resource(ResourceKind::Character, &"42".into()).await.unwrap().tier,
        facade.get_complete_resource(ResourceKind::Character, &"42".into()).await.unwrap().tier,
    ];
    assert_eq!(tiers, [Tier::Native, Tier::Cache, Tier::Cache]);
    assert_eq!(driver.calls().reads(), 1);
}

#[tokio::test]
async fn concurrent_fetches_both_proceed_last_write_wins() {
    let driver = Arc::new(MemoryDriver::with_records([valeros(5)]));
    let kernel = mounted(config(), Arc::clone(&driver)).await;
    let facade = ResourceFacade::new(Arc::clone(&kernel));
    let log = EventLog::attach(kernel.bus(), "lock.*");

    // First caller is slow; the record changes while it waits.
    driver.push_delays([Duration::from_millis(80), Duration::ZERO]);
    let id = "42".into();
    let (slow, fast, ()) = tokio::join!(
        facade.get_complete_resource(ResourceKind::Character, &id),
        facade.get_complete_resource(ResourceKind::Character, &id),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            driver.put(&valeros(6)).await.unwrap();
        }
    );

    let slow = slow.unwrap();
    let fast = fast.unwrap();
    assert_eq!(fast.value.get("level"), Some(&json!(5)));
    assert_eq!(slow.value.get("level"), Some(&json!(6)));

    // The slow writer finished last, so its result is what stays cached.
    assert_eq!(
        kernel.tree().read(&p("/proc/character/42")).unwrap(),
        Payload::Record(valeros(6))
    );
    assert_eq!(log.count("lock.acquired"), 1);
    assert_eq!(log.count("lock.contended"), 1);
    assert_eq!(log.count("lock.released"), 1);
    assert!(!kernel.exists(&p("/proc/character/42.lock")));
}

#[tokio::test]
async fn degraded_reads_are_flagged() {
    let driver = Arc::new(MemoryDriver::with_records([valeros(5)]));
    driver.set_available(false);

    // Off by default: exhaustion is an error.
    let strict = Kernel::new(config());
    let cap = strict.register_capability(driver.clone());
    assert!(strict.mount(&p("/dev/db"), cap).await.is_err());
    let strict = ResourceFacade::new(Arc::new(strict));
    let err = strict
        .get_complete_resource(ResourceKind::Character, &"42".into())
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Exhausted(_)));
    assert_eq!(err.kind(), ErrorKind::BackendUnavailable);

    let lenient = Kernel::new(config().with_degraded_reads(true));
    let cap = lenient.register_capability(driver.clone());
    let _ = lenient.mount(&p("/dev/db"), cap).await;
    let lenient = ResourceFacade::new(Arc::new(lenient));
    let log = EventLog::attach(lenient.kernel().bus(), "recovery.degraded");

    let res = lenient
        .get_complete_resource(ResourceKind::Character, &"42".into())
        .await
        .unwrap();
    assert!(res.is_degraded());
    assert!(res.value.synthetic);
    assert_eq!(log.count("recovery.degraded"), 1);

    // The cached placeholder is not mistaken for real data once the
    // backend returns.
    driver.set_available(true);
    let res = lenient
        .get_complete_resource(ResourceKind::Character, &"42".into())
        .await
        .unwrap();
    assert_eq!(res.tier, Tier::Native);
    assert!(!res.value.synthetic);
    assert_eq!(res.value, valeros(5));
}

#[tokio::test]
async fn degraded_placeholder_is_never_stored() {
    let driver = Arc::new(MemoryDriver::with_records([valeros(5)]));
    let kernel = mounted(config().with_degraded_reads(true), Arc::clone(&driver)).await;
    let facade = ResourceFacade::new(kernel);
    driver.set_available(false);

    let patch = json!({"level": 9});
    let err = facade
        .update_resource(ResourceKind::Character, &"77".into(), patch.as_object().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Exhausted(_)));
    assert_eq!(driver.calls().put, 0);
}

#[tokio::test]
async fn errored_capability_heals_and_returns_to_ready() {
    let driver = Arc::new(MemoryDriver::with_records([valeros(5)]));
    let kernel = mounted(config(), Arc::clone(&driver)).await;
    let facade = ResourceFacade::new(Arc::clone(&kernel));
    let log = EventLog::attach(kernel.bus(), "capability.*");

    driver.set_available(false);
    assert!(facade.get_complete_resource(ResourceKind::Character, &"42".into()).await.is_err());
    assert_eq!(kernel.capability_state(&p("/dev/db")), Some(CapabilityState::Error));

    // Critical directories vanish while the backend is down.
    kernel.rmdir(&p("/proc/feat")).unwrap();

    driver.set_available(true);
    let res = facade
        .get_complete_resource(ResourceKind::Character, &"42".into())
        .await
        .unwrap();
    assert_eq!(res.tier, Tier::Native);
    assert!(kernel.exists(&p("/proc/feat")));
    assert_eq!(kernel.capability_state(&p("/dev/db")), Some(CapabilityState::Ready));
    assert_eq!(
        log.subjects(),
        vec!["capability.error", "capability.recovered", "capability.ready"]
    );
}

#[tokio::test]
async fn locks_cleaned_up_on_failure() {
    let driver = Arc::new(MemoryDriver::new());
    driver.set_available(false);
    let kernel = Kernel::new(config());
    let cap = kernel.register_capability(driver);
    let _ = kernel.mount(&p("/dev/db"), cap).await;
    let kernel = Arc::new(kernel);
    let facade = ResourceFacade::new(Arc::clone(&kernel));

    assert!(facade.get_complete_resource(ResourceKind::Feat, &"3".into()).await.is_err());
    assert!(facade.update_resource(ResourceKind::Feat, &"3".into(), &Default::default()).await.is_err());
    assert!(!kernel.exists(&p("/proc/feat/3.lock")));
    assert!(kernel.fds().is_empty());
}

#[tokio::test]
async fn second_mount_keeps_first_capability() {
    let first = Arc::new(MemoryDriver::with_records([valeros(5)]));
    let kernel = mounted(config(), Arc::clone(&first)).await;

    let second = Arc::new(MemoryDriver::new());
    let cap = kernel.register_capability(second.clone());
    let err = kernel.mount(&p("/dev/db"), cap).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyMounted);

    let facade = ResourceFacade::new(Arc::clone(&kernel));
    facade.get_complete_resource(ResourceKind::Character, &"42".into()).await.unwrap();
    assert_eq!(first.calls().get_by_id, 1);
    assert_eq!(second.calls().reads(), 0);
}

#[tokio::test]
async fn every_resolution_reports_timing() {
    let driver = Arc::new(MemoryDriver::with_records([valeros(5)]));
    let kernel = mounted(config(), driver).await;
    let facade = ResourceFacade::new(Arc::clone(&kernel));
    let mut timings = kernel.bus().subscribe("load.timing");

    facade.get_complete_resource(ResourceKind::Character, &"42".into()).await.unwrap();
    facade.list_resources(ResourceKind::Character).await.unwrap();

    let mut paths = Vec::new();
    while let Some(event) = timings.try_recv() {
        if let KernelEvent::LoadTiming { path, .. } = event.payload {
            paths.push(path);
        }
    }
    assert_eq!(paths, vec!["/proc/character/42", "/proc/character/list"]);
}

#[tokio::test]
async fn sqlite_backed_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("grimoire.db");
    let config = config().with_store_path(&store);

    let kernel = Kernel::new(config.clone());
    let cap = kernel.register_capability(Arc::new(SqliteDriver::open(&store).unwrap()));
    kernel.mount(&p("/dev/db"), cap).await.unwrap();
    let facade = ResourceFacade::new(Arc::new(kernel));

    let seed = grimoire_kernel::SeedDocument::from_yaml_str(
        "rpg_entities:\n  - {id: 1, name: Valeros}\ncharacters:\n  - {id: 42, name: Valeros, level: 5, entity_id: 1}\nreference_tables:\n  effect:\n    - {id: 9, name: Bless, entity_id: 1}\n",
    )
    .unwrap();
    facade.import_seed(&seed, false).await.unwrap();

    let patch = json!({"level": 6});
    facade
        .update_resource(ResourceKind::Character, &"42".into(), patch.as_object().unwrap())
        .await
        .unwrap();

    // A fresh kernel over the same file sees the update.
    let kernel = Kernel::new(config);
    let cap = kernel.register_capability(Arc::new(SqliteDriver::open(&store).unwrap()));
    kernel.mount(&p("/dev/db"), cap).await.unwrap();
    let facade = ResourceFacade::new(Arc::new(kernel));

    let res = facade.get_complete_resource(ResourceKind::Character, &"42".into()).await.unwrap();
    assert_eq!(res.value.get("level"), Some(&json!(6)));

    let effects = facade
        .get_entity_sub_resource(&"1".into(), ResourceKind::Effect)
        .await
        .unwrap();
    assert_eq!(effects.value.records.len(), 1);

    let schema = facade.describe(ResourceKind::Character).await.unwrap();
    assert_eq!(schema.value.fields, vec!["entity_id", "id", "level", "name"]);
}
