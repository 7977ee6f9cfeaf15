//! Scénarios de bout en bout rejoués sur le harness, trace vérifiée par les contrats

use tinybridge_devkit::contract_helpers::{
    check_client_sets, check_counters_monotonic, check_functional_matrix, check_keepalive_intervals,
    check_stage_first_appearance, check_status_document, check_timeout_scenario, check_topic_snapshot,
    check_trace, load_trace,
};
use tinybridge_devkit::TestHarness;
use tinybridge_kernel::alarms::AlarmCode;
use tinybridge_kernel::can::PGN_ALARMS;
use tinybridge_kernel::topics::CatalogSnapshot;

const JITTERED_PERIODS: [u64; 7] = [998, 1003, 995, 1001, 993, 1004, 997];

#[test]
fn end_to_end_trace_is_conform() {
    let mut harness = TestHarness::new();
    harness.cycle(1000).unwrap();
    harness.connect("alpha");
    harness.connect("beta");

    for period in JITTERED_PERIODS.iter().cycle().take(14) {
        harness.heartbeat("alpha");
        harness.heartbeat("beta");
        harness.cycle(*period).unwrap();
    }
    harness.subscribe("alpha", &["current", "voltage"], 1000);
    harness.run_cycles(3, 1000, &["alpha", "beta"]).unwrap();

    let file = tempfile::NamedTempFile::new().unwrap();
    let written = harness.write_trace(file.path()).unwrap();
    let trace = load_trace(file.path()).unwrap();
    assert_eq!(trace.len(), written);

    check_trace(&trace).into_result().unwrap();
    check_stage_first_appearance(&trace).into_result().unwrap();
    check_keepalive_intervals(&trace, 100, 998.0, 100.0).into_result().unwrap();

    let pushes = harness.events("status_push");
    assert_eq!(pushes.len(), 18);
    assert_eq!(pushes.last().unwrap().status_seq, Some(18));
    assert_eq!(harness.core.stats.event_bus.order_violations.get(), 0);
}

#[test]
fn alpha_times_out_beta_stays() {
    let mut harness = TestHarness::new();
    harness.cycle(1000).unwrap();
    harness.connect("alpha");
    harness.connect("beta");

    harness.run_cycles(7, 1000, &["beta"]).unwrap();

    let trace = harness.trace();
    check_timeout_scenario(&trace, "alpha").into_result().unwrap();
    check_client_sets(&trace).into_result().unwrap();

    let err = &harness.events("error")[0];
    assert_eq!(err.client_id.as_deref(), Some("alpha"));
    assert!(err.details.as_ref().unwrap()["since_last_heartbeat_ms"].as_u64().unwrap() > 5000);
    assert_eq!(harness.ws.connected_ids(), vec!["beta".to_string()]);

    let last_push = harness.events("status_push").pop().unwrap();
    assert_eq!(last_push.clients.unwrap(), vec!["beta".to_string()]);
}

#[test]
fn reconnect_storm_keeps_exact_client_set() {
    let mut harness = TestHarness::new();
    harness.cycle(1000).unwrap();
    harness.connect("alpha");
    harness.connect("beta");

    for _ in 0..5 {
        harness.connect("alpha");
        harness.heartbeat("alpha");
        harness.heartbeat("beta");
        harness.cycle(1000).unwrap();
    }

    assert_eq!(harness.ws.connected_ids(), vec!["alpha".to_string(), "beta".to_string()]);
    let pushes = harness.events("status_push");
    assert_eq!(pushes.len(), 6);
    // le premier push précède les connexions
    assert!(pushes[1..]
        .iter()
        .all(|p| p.clients.as_ref().unwrap() == &vec!["alpha".to_string(), "beta".to_string()]));
    assert_eq!(harness.events("client_disconnected").len(), 5);

    let msgs = harness.drain_messages("alpha");
    assert_eq!(msgs.last().unwrap()["status_seq"], 6);

    let trace = harness.trace();
    check_client_sets(&trace).into_result().unwrap();
    check_trace(&trace).into_result().unwrap();
}

#[test]
fn config_broadcast_lists_alpha_and_beta() {
    let mut harness = TestHarness::new();
    harness.cycle(1000).unwrap();
    harness.connect("alpha");
    harness.connect("beta");
    harness.drain_messages("alpha");
    harness.drain_messages("beta");

    harness.subscribe("alpha", &["current", "voltage"], 1000);

    let broadcast = &harness.events("config_broadcast")[0];
    assert_eq!(broadcast.clients.as_ref().unwrap(), &vec!["alpha".to_string(), "beta".to_string()]);
    let config = broadcast.config.as_ref().unwrap();
    assert_eq!(config.metrics, vec!["current".to_string(), "voltage".to_string()]);
    assert_eq!(config.update_interval_ms, 1000);

    for id in ["alpha", "beta"] {
        let msgs = harness.drain_messages(id);
        assert_eq!(msgs[0]["type"], "config");
        assert_eq!(msgs[0]["config"]["metrics"][1], "voltage");
    }

    harness.run_cycles(1, 1000, &["alpha", "beta"]).unwrap();
    let push = harness.drain_messages("beta").pop().unwrap();
    let live = push["live_data"].as_object().unwrap();
    assert_eq!(live.len(), 2);
    assert!(live.contains_key("current") && live.contains_key("voltage"));
}

#[test]
fn keepalive_loss_raises_then_clears_communication_alarm() {
    let harness = TestHarness::new();
    harness.run_cycles(3, 1000, &[]).unwrap();

    // le GX se tait : ingest et CAN continuent sans keepalive entrant
    for _ in 0..11 {
        harness.advance(1000);
        harness.ingest().unwrap();
        harness.tick_can();
        harness.core.poll_links();
        harness.tick_mqtt();
        harness.tick_ws();
    }
    assert!(!harness.core.can_state().ok);
    assert!(harness.core.alarms.lock().is_active(AlarmCode::CanKeepaliveLost));
    assert!(harness.core.status().alarms_active);
    assert_eq!(harness.mqtt_client.values("tinybms/alarm_communication").last(), Some(&1.0));

    let bitmap = harness
        .can_bus
        .sent()
        .into_iter()
        .filter(|f| f.id == PGN_ALARMS)
        .last()
        .unwrap();
    assert_eq!((bitmap.data[1] >> 2) & 0b11, 1);

    harness.cycle(1000).unwrap();
    assert!(harness.core.can_state().ok);
    assert!(!harness.core.alarms.lock().is_active(AlarmCode::CanKeepaliveLost));
    assert!(!harness.core.status().alarms_active);
    assert_eq!(harness.events("alarm_raised").len(), 1);
    assert_eq!(harness.events("alarm_cleared").len(), 1);
    check_trace(&harness.trace()).into_result().unwrap();
}

#[test]
fn counters_never_regress_across_faults() {
    let harness = TestHarness::new();
    harness.run_cycles(2, 1000, &[]).unwrap();
    let before = harness.status_json().unwrap();
    check_status_document(&before).into_result().unwrap();

    harness.can_bus.set_tx_failure(true);
    harness.mqtt_client.set_failing(true);
    harness.run_cycles(2, 1000, &[]).unwrap();
    let during = harness.status_json().unwrap();
    assert!(harness.core.alarms.lock().is_active(AlarmCode::CanTxError));

    harness.can_bus.set_tx_failure(false);
    harness.mqtt_client.set_failing(false);
    harness.run_cycles(2, 1000, &[]).unwrap();
    let after = harness.status_json().unwrap();

    check_counters_monotonic(&before, &during).into_result().unwrap();
    check_counters_monotonic(&during, &after).into_result().unwrap();
    check_status_document(&after).into_result().unwrap();
    assert!(during["stats"]["can"]["tx_errors"].as_u64().unwrap() > 0);
    assert_eq!(during["stats"]["mqtt"]["failed_count"], 40);
    assert_eq!(
        before["stats"]["can"]["tx_success"],
        during["stats"]["can"]["tx_success"]
    );
}

#[test]
fn functional_matrix_and_topic_catalog_pass() {
    let harness = TestHarness::new();
    harness.run_cycles(2, 1000, &[]).unwrap();

    let report = harness.mqtt.report();
    check_functional_matrix(&report, &["pack_power_w", "system_state"]).into_result().unwrap();
    assert_eq!(report.result, "pass");
    assert_eq!(report.root_topic, "tinybms");

    let snapshot = CatalogSnapshot::between("tinybms", "1.0", "2.0");
    check_topic_snapshot(&snapshot).into_result().unwrap();
    let published = harness.mqtt_client.topics();
    assert!(snapshot.after.topics.iter().all(|t| published.contains(t)));
}
