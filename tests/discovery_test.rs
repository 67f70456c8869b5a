//! End-to-end tests through the public facade, driving a scripted lookup
//! backend instead of real sockets.

mod common;

use common::{
    inject_answers, wait_for_query, wait_until, RecordingLookup, RecordingState, ScriptedLink,
    ScriptedLinkState,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use svc_discovery::{
    AnswerRecord, DiscoveryEvent, EngineStatus, Filter, LinkEvent, LookupMode, NameServer,
    RecordType, ServiceDiscovery, ServiceQuery,
};
use test_log::test;

const TY: &str = "_http._tcp.local";
const RECV_TIMEOUT: Duration = Duration::from_secs(3);

fn engine_up() -> (
    ServiceDiscovery,
    Arc<Mutex<RecordingState>>,
    Arc<Mutex<ScriptedLinkState>>,
) {
    let (backend, lookup) = RecordingLookup::new();
    let (watcher, link) = ScriptedLink::ethernet();
    let sd = ServiceDiscovery::with_link(Box::new(backend), Box::new(watcher))
        .expect("failed to create engine");

    let ready = wait_until(Duration::from_secs(3), || {
        sd.state()
            .ok()
            .and_then(|rx| rx.recv_timeout(RECV_TIMEOUT).ok())
            .map(|state| state.lookup_ready)
            .unwrap_or(false)
    });
    assert!(ready, "lookup backend did not come up");
    assert_eq!(link.lock().unwrap().opened_on, vec!["eth0"]);

    (sd, lookup, link)
}

#[test]
fn single_instance_discovery_and_goodbye() {
    let (sd, lookup, _link) = engine_up();

    let (_token, receiver) = sd.add_query(ServiceQuery::new(TY)).unwrap();
    sd.set_running(true).unwrap();
    sd.update_services().unwrap();

    let scan = wait_for_query(&lookup, TY, RecordType::Ptr);
    inject_answers(
        &lookup,
        scan,
        vec![AnswerRecord::ptr(TY, "myprinter._http._tcp.local", 120)],
    );

    let txt = wait_for_query(&lookup, "myprinter._http._tcp.local", RecordType::Txt);
    inject_answers(
        &lookup,
        txt,
        vec![AnswerRecord::txt(
            "myprinter._http._tcp.local",
            120,
            &["path=/cgi"],
        )],
    );

    let srv = wait_for_query(&lookup, "myprinter._http._tcp.local", RecordType::Srv);
    inject_answers(
        &lookup,
        srv,
        vec![AnswerRecord::srv(
            "myprinter._http._tcp.local",
            120,
            "printer.local",
            631,
        )],
    );

    let a = wait_for_query(&lookup, "printer.local", RecordType::A);
    inject_answers(
        &lookup,
        a,
        vec![AnswerRecord::addr(
            "printer.local",
            120,
            "192.0.2.5".parse().unwrap(),
        )],
    );

    let items = receiver.recv_timeout(RECV_TIMEOUT).expect("resolved snapshot");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name(), "myprinter");
    assert_eq!(items[0].host_name(), "printer.local");
    assert_eq!(items[0].port(), 631);
    assert_eq!(items[0].host_address(), "192.0.2.5");
    assert_eq!(items[0].txt_records(), ["path=/cgi".to_string()]);

    // the instance says goodbye
    inject_answers(
        &lookup,
        scan,
        vec![AnswerRecord::ptr(TY, "myprinter._http._tcp.local", 0)],
    );

    let items = receiver.recv_timeout(RECV_TIMEOUT).expect("removal snapshot");
    assert!(items.is_empty());

    sd.shutdown().unwrap();
}

#[test]
fn primary_filter_narrows_and_reopens() {
    let (sd, lookup, _link) = engine_up();

    sd.set_filter(Filter::by_name("prod-*").unwrap()).unwrap();

    let (_token, receiver) = sd.add_query(ServiceQuery::new(TY)).unwrap();
    sd.set_running(true).unwrap();
    sd.update_services().unwrap();

    let scan = wait_for_query(&lookup, TY, RecordType::Ptr);
    for name in ["prod-1", "dev-1"] {
        let fullname = format!("{}.{}", name, TY);
        inject_answers(&lookup, scan, vec![AnswerRecord::ptr(TY, &fullname, 120)]);

        let txt = wait_for_query(&lookup, &fullname, RecordType::Txt);
        inject_answers(&lookup, txt, vec![AnswerRecord::txt(&fullname, 120, &[])]);

        let srv = wait_for_query(&lookup, &fullname, RecordType::Srv);
        let host = format!("{}.local", name);
        inject_answers(
            &lookup,
            srv,
            vec![AnswerRecord::srv(&fullname, 120, &host, 80)],
        );

        let a = wait_for_query(&lookup, &host, RecordType::A);
        inject_answers(
            &lookup,
            a,
            vec![AnswerRecord::addr(&host, 120, "192.0.2.9".parse().unwrap())],
        );
    }

    let items = receiver.recv_timeout(RECV_TIMEOUT).expect("filtered snapshot");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name(), "prod-1");

    // dropping the primary filter surfaces both instances
    sd.set_filter(Filter::default()).unwrap();
    let items = receiver.recv_timeout(RECV_TIMEOUT).expect("unfiltered snapshot");
    assert_eq!(items.len(), 2);

    sd.shutdown().unwrap();
}

#[test]
fn mode_flip_rebuilds_backend_and_pushes_name_servers() {
    let (sd, lookup, _link) = engine_up();

    let name_server = NameServer::parse("192.0.2.53", None).unwrap();
    sd.add_name_server(name_server.clone()).unwrap();

    let (_token, receiver) = sd.add_query(ServiceQuery::new(TY)).unwrap();
    sd.set_running(true).unwrap();
    sd.update_services().unwrap();
    wait_for_query(&lookup, TY, RecordType::Ptr);

    let monitor = sd.monitor().unwrap();
    sd.set_lookup_mode(LookupMode::Unicast).unwrap();

    let flipped = wait_until(Duration::from_secs(3), || {
        let state = lookup.lock().unwrap();
        state.shutdown_count == 1 && state.init_count == 2 && state.mode == Some(LookupMode::Unicast)
    });
    assert!(flipped, "backend was not rebuilt in unicast mode");

    // name servers were pushed to the new backend and the scan is re-armed
    assert_eq!(
        lookup.lock().unwrap().pushed_name_servers,
        vec![name_server]
    );
    wait_for_query(&lookup, TY, RecordType::Ptr);

    let saw_mode_change = wait_until(Duration::from_secs(3), || {
        monitor
            .try_iter()
            .any(|event| matches!(event, DiscoveryEvent::LookupModeChanged(LookupMode::Unicast)))
    });
    assert!(saw_mode_change);

    // running state resumed
    let state = sd.state().unwrap().recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(state.running);
    assert!(state.lookup_ready);
    assert_eq!(state.lookup_mode, LookupMode::Unicast);

    // whatever was discovered before the flip is gone
    let last = receiver.try_iter().last();
    if let Some(items) = last {
        assert!(items.is_empty());
    }

    sd.shutdown().unwrap();
}

#[test]
fn late_result_after_stop_is_ignored() {
    let (sd, lookup, _link) = engine_up();

    let (token, receiver) = sd.add_query(ServiceQuery::new(TY)).unwrap();
    sd.set_running(true).unwrap();
    sd.update_services().unwrap();

    let scan = wait_for_query(&lookup, TY, RecordType::Ptr);
    inject_answers(
        &lookup,
        scan,
        vec![AnswerRecord::ptr(TY, "web._http._tcp.local", 120)],
    );
    let txt = wait_for_query(&lookup, "web._http._tcp.local", RecordType::Txt);

    // revoking the query cancels the scan and the instance sub-queries
    sd.remove_query(token).unwrap();
    sd.update_services().unwrap();

    let stopped = wait_until(Duration::from_secs(3), || {
        lookup.lock().unwrap().started.is_empty()
    });
    assert!(stopped, "queries were not cancelled");
    assert!(lookup.lock().unwrap().cancelled.contains(&scan));
    assert!(lookup.lock().unwrap().cancelled.contains(&txt));

    // a result for the cancelled sub-query arrives late
    inject_answers(
        &lookup,
        txt,
        vec![AnswerRecord::txt("web._http._tcp.local", 120, &["a=b"])],
    );

    // the engine keeps working and nothing surfaces
    let state = sd.state().unwrap().recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(state.lookup_ready);
    assert!(receiver.try_recv().is_err());

    sd.shutdown().unwrap();
}

#[test]
fn link_loss_tears_down_and_watchdog_rebuilds() {
    let (sd, lookup, link) = engine_up();

    let (_token, receiver) = sd.add_query(ServiceQuery::new(TY)).unwrap();
    sd.set_running(true).unwrap();
    sd.update_services().unwrap();
    wait_for_query(&lookup, TY, RecordType::Ptr);

    // the session signals link loss
    let session = link.lock().unwrap().session.clone().expect("session open");
    session.send(LinkEvent::Closed).unwrap();

    let down = wait_until(Duration::from_secs(3), || {
        sd.state()
            .ok()
            .and_then(|rx| rx.recv_timeout(RECV_TIMEOUT).ok())
            .map(|state| !state.network_ready && !state.lookup_ready)
            .unwrap_or(false)
    });
    assert!(down, "engine did not notice link loss");
    assert_eq!(lookup.lock().unwrap().shutdown_count, 1);

    // the watchdog reopens the link within its 3 s interval and the scan
    // comes back because the engine is still running
    let rebuilt = wait_until(Duration::from_secs(8), || {
        lookup.lock().unwrap().init_count == 2
    });
    assert!(rebuilt, "watchdog did not rebuild the backend");
    wait_for_query(&lookup, TY, RecordType::Ptr);

    // discovered instances did not survive the teardown
    if let Some(items) = receiver.try_iter().last() {
        assert!(items.is_empty());
    }

    sd.shutdown().unwrap();
}

#[test]
fn shutdown_reports_status() {
    let (sd, _lookup, _link) = engine_up();

    let status = sd
        .shutdown()
        .unwrap()
        .recv_timeout(RECV_TIMEOUT)
        .expect("shutdown status");
    assert!(matches!(status, EngineStatus::Shutdown));

    // the handle notices the engine is gone
    let gone = wait_until(Duration::from_secs(3), || {
        match sd.status() {
            Ok(rx) => matches!(
                rx.recv_timeout(Duration::from_millis(100)),
                Ok(EngineStatus::Shutdown)
            ),
            Err(_) => true,
        }
    });
    assert!(gone);
}

#[test]
fn metrics_count_queries() {
    let (sd, lookup, _link) = engine_up();

    let (_token, _receiver) = sd.add_query(ServiceQuery::new(TY)).unwrap();
    sd.set_running(true).unwrap();
    sd.update_services().unwrap();
    wait_for_query(&lookup, TY, RecordType::Ptr);

    let counted = wait_until(Duration::from_secs(3), || {
        sd.get_metrics()
            .ok()
            .and_then(|rx| rx.recv_timeout(RECV_TIMEOUT).ok())
            .map(|metrics| metrics.get("scan-start") == Some(&1))
            .unwrap_or(false)
    });
    assert!(counted, "scan-start counter missing");

    sd.shutdown().unwrap();
}
