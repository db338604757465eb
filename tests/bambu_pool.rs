//! Integration tests for the Bambu MQTT pool, its listeners and the report normalizer.

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, printer, FakeConnector};
use printfleet_rs::bambu::status_cache::{STATUS_CONNECTING, STATUS_ONLINE, STATUS_UNREACHABLE};
use printfleet_rs::bambu::{
    apply_report, BambuMetricsStore, BambuMqttPool, BambuSnapshot, BambuStatusCache, ConnectionState, DeviceEvent,
};
use printfleet_shared::memory::InMemoryRoster;
use printfleet_shared::PrinterType;

const SERIAL: &str = "01P00A000000001";

fn setup(roster: Arc<InMemoryRoster>) -> (Arc<BambuMqttPool>, Arc<FakeConnector>) {
    let connector = Arc::new(FakeConnector::default());
    let pool = Arc::new(BambuMqttPool::new(roster, connector.clone(), 8883, Duration::from_secs(60)));
    (pool, connector)
}

fn bambu(id: i64, ip: &str, code: &str, serial: &str) -> printfleet_shared::Printer {
    printer(id, PrinterType::Bambu, ip, code, Some(serial))
}

#[tokio::test]
async fn concurrent_syncs_open_one_connection_per_serial() {
    let roster = Arc::new(InMemoryRoster::new(vec![
        bambu(1, "10.0.0.11", "12345678", SERIAL),
        bambu(2, "10.0.0.12", "12345678", "01P00A000000002"),
        printer(3, PrinterType::Prusa, "10.0.0.13", "key", None),
    ]));
    let (pool, connector) = setup(roster);

    let (a, b, c) = tokio::join!(pool.sync(), pool.sync(), pool.sync());
    assert_eq!(a.unwrap().connected + b.unwrap().connected + c.unwrap().connected, 2);
    assert_eq!(connector.connect_count(SERIAL), 1);
    assert_eq!(connector.connect_count("01P00A000000002"), 1);
    assert_eq!(pool.pooled_serials().len(), 2);
}

#[tokio::test]
async fn roster_changes_reconnect_or_drop_entries() {
    let roster = Arc::new(InMemoryRoster::new(vec![bambu(1, "10.0.0.11", "12345678", SERIAL)]));
    let (pool, connector) = setup(roster.clone());
    pool.sync().await.unwrap();
    let first_link = connector.link_log(SERIAL);

    // Unchanged roster leaves the entry alone.
    pool.sync().await.unwrap();
    assert_eq!(connector.connect_count(SERIAL), 1);

    roster.replace(vec![bambu(1, "10.0.0.99", "12345678", SERIAL)]).await;
    let report = pool.sync().await.unwrap();
    assert_eq!((report.disconnected, report.connected), (1, 1));
    assert_eq!(connector.connect_count(SERIAL), 2);
    assert_eq!(first_link.lock().unwrap().disconnects, 1);

    roster.replace(vec![]).await;
    let report = pool.sync().await.unwrap();
    assert_eq!(report.pooled, 0);
    assert_eq!(pool.connection_state(SERIAL), ConnectionState::Absent);
}

#[tokio::test]
async fn invalid_roster_rows_are_skipped() {
    let roster = Arc::new(InMemoryRoster::new(vec![
        bambu(1, "10.0.0.11", "12345678", "bad/serial#"),
        bambu(2, "not-an-ip", "12345678", SERIAL),
    ]));
    let (pool, connector) = setup(roster);
    let report = pool.sync().await.unwrap();
    assert_eq!(report.pooled, 0);
    assert!(connector.connects.lock().unwrap().is_empty());
}

#[tokio::test]
async fn handshake_subscribes_and_requests_full_status() {
    let roster = Arc::new(InMemoryRoster::new(vec![bambu(1, "10.0.0.11", "12345678", SERIAL)]));
    let (pool, connector) = setup(roster);
    pool.sync().await.unwrap();

    assert_eq!(pool.connection_state(SERIAL), ConnectionState::Connecting);
    assert!(pool.client(SERIAL).is_none());

    connector.send(SERIAL, DeviceEvent::Connected).await;
    assert!(eventually(|| pool.client(SERIAL).is_some()).await);

    let log = connector.link_log(SERIAL);
    let log = log.lock().unwrap();
    assert_eq!(log.subscribed, vec![format!("device/{}/report", SERIAL)]);
    assert_eq!(log.published[0].0, format!("device/{}/request", SERIAL));
    assert!(log.published[0].1.contains("\"pushall\""));
}

#[tokio::test]
async fn reports_reach_status_cache_and_metrics_store() {
    let roster = Arc::new(InMemoryRoster::new(vec![bambu(1, "10.0.0.11", "12345678", SERIAL)]));
    let (pool, connector) = setup(roster);
    let cache = Arc::new(BambuStatusCache::new(Duration::from_secs(300)));
    let metrics = Arc::new(BambuMetricsStore::new());
    pool.add_listener(cache.clone());
    pool.add_listener(metrics.clone());

    assert_eq!(cache.query(SERIAL, &pool).await.status, STATUS_UNREACHABLE);
    pool.sync().await.unwrap();
    connector.send(SERIAL, DeviceEvent::Connected).await;
    assert!(eventually(|| pool.client(SERIAL).is_some()).await);
    assert_eq!(cache.query(SERIAL, &pool).await.status, STATUS_CONNECTING);

    let report = json!({"print": {"gcode_state": "RUNNING", "bed_temper": 60.0}});
    connector
        .send(SERIAL, DeviceEvent::Message(report.to_string().into_bytes()))
        .await;
    connector.send(SERIAL, DeviceEvent::Message(b"not json".to_vec())).await;

    assert!(eventually(|| cache.peek(SERIAL).is_some()).await);
    let view = cache.query(SERIAL, &pool).await;
    assert_eq!(view.status, STATUS_ONLINE);
    assert_eq!(view.gcode_state.as_deref(), Some("RUNNING"));
    assert!(view.last_updated > 0);

    let text = metrics.render();
    assert!(text.contains(&format!(r#"bambu_bed_temperature{{serial="{}",printer="printer-1"}} 60"#, SERIAL)));
}

#[tokio::test]
async fn shutdown_disconnects_and_clears_listeners() {
    let roster = Arc::new(InMemoryRoster::new(vec![bambu(1, "10.0.0.11", "12345678", SERIAL)]));
    let (pool, connector) = setup(roster);
    let metrics = Arc::new(BambuMetricsStore::new());
    pool.add_listener(metrics.clone());
    pool.init().await;
    let log = connector.link_log(SERIAL);

    pool.shutdown().await;
    assert_eq!(log.lock().unwrap().disconnects, 1);
    assert!(pool.pooled_serials().is_empty());
}

#[test]
fn normalizer_scenario_active_filament_from_ams_tray() {
    let mut snap = BambuSnapshot::default();
    let report = json!({
        "print": {
            "nozzle_temper": 210,
            "ams": {
                "tray_now": "1",
                "ams": [{"id": "0", "tray": [{"id": "0"}, {"id": "1", "tray_type": "PLA"}]}]
            }
        }
    });
    assert!(apply_report(&mut snap, &report));
    assert_eq!(snap.gauge("nozzle_temperature"), Some(210.0));
    assert_eq!(snap.active_filament.as_deref(), Some("PLA"));
    assert_eq!(snap.active_tray, Some(1));
    assert!(!snap.trays[&1].empty);
    assert!(snap.trays[&0].empty);
}

#[test]
fn partial_reports_keep_known_fields() {
    let mut snap = BambuSnapshot::default();
    apply_report(&mut snap, &json!({"print": {"nozzle_temper": 210, "bed_temper": 60}}));
    apply_report(&mut snap, &json!({"print": {"bed_temper": 65, "nozzle_temper": "n/a"}}));
    assert_eq!(snap.gauge("nozzle_temperature"), Some(210.0));
    assert_eq!(snap.gauge("bed_temperature"), Some(65.0));
}
