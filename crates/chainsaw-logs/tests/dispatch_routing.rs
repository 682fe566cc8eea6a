//! Dispatch queue routing and delivery, end to end

use std::sync::Arc;
use std::time::Duration;

use chainsaw_logs::{
    ArcRecord, DispatchConfig, DispatchQueue, FnConsumer, LevelCounts, Router, StoreConfig,
    StoreRegistry, UNKNOWN_DESTINATION,
};
use chainsaw_rules::{EqualsRule, LevelRule, LikeRule};
use chainsaw_types::{ID_PROPERTY, LogLevel, Record};
use parking_lot::Mutex;

type Deliveries = Arc<Mutex<Vec<(String, Vec<u64>)>>>;

fn fast_config(expression: &str) -> DispatchConfig {
    DispatchConfig {
        interval: Duration::from_millis(10),
        min_interval: Duration::from_millis(10),
        routing_expression: Some(expression.to_string()),
        ..DispatchConfig::default()
    }
}

fn record(id: u64, service: &str, level: LogLevel) -> ArcRecord {
    Arc::new(
        Record::new("svc", level, format!("event {}", id))
            .with_property(ID_PROPERTY, id.to_string())
            .with_property("service", service),
    )
}

fn ids(records: &[ArcRecord]) -> Vec<u64> {
    records.iter().filter_map(|r| r.seeded_identity()).collect()
}

fn collector(queue: &DispatchQueue, interest: Option<&str>) -> Deliveries {
    let deliveries: Deliveries = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deliveries);
    queue.add_consumer(Arc::new(FnConsumer::new(
        interest.map(str::to_string),
        move |destination: &str, records: &[ArcRecord]| {
            sink.lock().push((destination.to_string(), ids(records)))
        },
    )));
    deliveries
}

async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[test]
fn record_matching_two_routes_lands_in_three_groups() {
    let mut router = Router::new(Some("PROP.service".to_string()));
    router.register_route("errors", Arc::new(LevelRule::at_least(LogLevel::Error)));
    router.register_route(
        "payments",
        Arc::new(LikeRule::new("MSG", "event").expect("valid pattern")),
    );

    let batch = router.route(&[record(1, "api", LogLevel::Error)]);
    assert_eq!(batch.keys().collect::<Vec<_>>(), vec!["api", "errors", "payments"]);
    assert_eq!(batch.record_count(), 3);
}

#[test]
fn routing_preserves_enqueue_order() {
    let router = Router::new(Some("PROP.service".to_string()));
    let records: Vec<_> = (0..20)
        .map(|id| record(id, if id % 2 == 0 { "a" } else { "b" }, LogLevel::Info))
        .collect();
    let batch = router.route(&records);

    assert_eq!(batch.get("a").map(ids), Some((0..20).step_by(2).collect::<Vec<u64>>()));
    assert_eq!(batch.get("b").map(ids), Some((1..20).step_by(2).collect::<Vec<u64>>()));
}

#[test]
fn unresolvable_key_routes_to_unknown() {
    let router = Router::new(Some("PROP.missing".to_string()));
    let batch = router.route(&[record(1, "a", LogLevel::Info)]);
    assert_eq!(batch.keys().collect::<Vec<_>>(), vec![UNKNOWN_DESTINATION]);
}

#[tokio::test]
async fn scenario_custom_route_delivery() {
    let queue = DispatchQueue::new(fast_config("PROP.service"));
    queue.register_route(
        "fatal",
        Arc::new(EqualsRule::new("LEVEL", "FATAL").expect("valid field")),
    );

    let service_a = collector(&queue, Some("ServiceA"));
    let fatal = collector(&queue, Some("fatal"));
    let service_b = collector(&queue, Some("ServiceB"));

    queue.enqueue(record(42, "ServiceA", LogLevel::Fatal));
    wait_for(|| !service_a.lock().is_empty() && !fatal.lock().is_empty()).await;
    queue.join().await;

    assert_eq!(*service_a.lock(), vec![("ServiceA".to_string(), vec![42])]);
    assert_eq!(*fatal.lock(), vec![("fatal".to_string(), vec![42])]);
    assert!(service_b.lock().is_empty());
}

#[tokio::test]
async fn order_preserved_through_queue() {
    let queue = DispatchQueue::new(fast_config("PROP.service"));
    let all = collector(&queue, None);

    for id in 0..100 {
        queue.enqueue(record(id, "a", LogLevel::Info));
    }
    wait_for(|| all.lock().iter().map(|(_, ids)| ids.len()).sum::<usize>() == 100).await;
    queue.join().await;

    let delivered: Vec<u64> = all.lock().iter().flat_map(|(_, ids)| ids.clone()).collect();
    assert_eq!(delivered, (0..100).collect::<Vec<_>>());
}

#[tokio::test]
async fn registry_builds_stores_from_dispatch() {
    let queue = DispatchQueue::new(fast_config("PROP.service"));
    let registry = Arc::new(StoreRegistry::new(StoreConfig::default()));
    queue.add_consumer(registry.clone());

    queue.enqueue_all([
        record(1, "api", LogLevel::Info),
        record(2, "db", LogLevel::Error),
        record(3, "api", LogLevel::Warn),
        // Redelivered record is dropped by the store
        record(1, "api", LogLevel::Info),
    ]);
    wait_for(|| {
        registry.get("api").is_some_and(|s| s.len() == 2)
            && registry.get("db").is_some_and(|s| s.len() == 1)
    })
    .await;
    queue.join().await;

    assert_eq!(registry.destinations(), vec!["api", "db"]);
    let api: LevelCounts = registry.get("api").map(|s| s.level_counts()).unwrap_or_default();
    assert_eq!(api.get(LogLevel::Info), 1);
    assert_eq!(api.get(LogLevel::Warn), 1);
}

#[tokio::test]
async fn unnumbered_records_survive_fan_out_across_cycles() {
    let queue = DispatchQueue::new(fast_config("PROP.service"));
    queue.register_route("errors", Arc::new(LevelRule::at_least(LogLevel::Error)));
    let registry = Arc::new(StoreRegistry::new(StoreConfig::default()));
    queue.add_consumer(registry.clone());

    let unnumbered = |service: &str| -> ArcRecord {
        Arc::new(Record::new("svc", LogLevel::Error, "failure").with_property("service", service))
    };

    // Separate cycles, so "api" and "db" each number their own record
    queue.enqueue(unnumbered("api"));
    wait_for(|| registry.get("errors").is_some_and(|s| s.len() == 1)).await;
    queue.enqueue(unnumbered("db"));
    wait_for(|| registry.get("errors").is_some_and(|s| s.len() == 2)).await;
    queue.join().await;

    let errors = registry.get("errors").map(|s| s.all_records()).unwrap_or_default();
    let identities: Vec<_> = errors.iter().filter_map(|r| r.identity()).collect();
    assert_eq!(identities.len(), 2);
    assert_ne!(identities[0], identities[1]);
    assert_eq!(registry.get("db").map(|s| s.len()), Some(1));
}
